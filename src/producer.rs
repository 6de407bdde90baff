//! Publishing side of the topic, used by the scraper
use std::time::Duration;

use rdkafka::{
    config::ClientConfig,
    error::KafkaError,
    producer::{FutureProducer, FutureRecord},
    util::Timeout,
};
use thiserror::Error;
use tracing::{debug, Span};

use crate::{
    codec::{EncodeError, SharedCodec},
    envelope::Envelope,
    settings::KafkaSettings,
};

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("envelope has an empty city")]
    EmptyCity,
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error("delivering to kafka: {0}")]
    Kafka(#[from] KafkaError),
}

/// Publishes envelopes keyed by city. Retrying a failed publish is up to the caller.
pub struct EnvelopeProducer {
    producer: FutureProducer,
    topic: String,
    codec: SharedCodec,
    timeout: Duration,
    span: Span,
}

impl EnvelopeProducer {
    pub fn new(settings: &KafkaSettings, codec: SharedCodec, span: Span) -> Result<Self, KafkaError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &settings.brokers)
            .set("message.timeout.ms", settings.publish_timeout_ms.to_string())
            .create()?;
        Ok(EnvelopeProducer {
            producer,
            topic: settings.topic.clone(),
            codec,
            timeout: Duration::from_millis(settings.publish_timeout_ms),
            span,
        })
    }

    pub async fn publish(&self, envelope: &Envelope) -> Result<(), PublishError> {
        if !envelope.has_city() {
            return Err(PublishError::EmptyCity);
        }
        let payload = self.codec.encode(envelope)?;
        let record = FutureRecord::to(&self.topic)
            .key(envelope.partition_key())
            .payload(&payload);
        let (partition, offset) = self
            .producer
            .send(record, Timeout::After(self.timeout))
            .await
            .map_err(|(e, _)| e)?;
        debug!(parent: &self.span, city = %envelope.city, partition, offset, "envelope published");
        Ok(())
    }
}
