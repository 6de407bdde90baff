//! Manages envelope codecs
pub mod avro;
pub mod json;

use std::sync::Arc;

use thiserror::Error;

use crate::envelope::Envelope;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("message has no payload")]
    MissingPayload,
    #[error("envelope has an empty city")]
    EmptyCity,
    #[error("malformed json envelope: {0}")]
    Json(#[from] serde_json::Error),
    #[error("malformed avro envelope: {0}")]
    Avro(#[from] apache_avro::Error),
    #[error("avro container holds no records")]
    EmptyContainer,
}

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("encoding json envelope: {0}")]
    Json(#[from] serde_json::Error),
    #[error("encoding avro envelope: {0}")]
    Avro(#[from] apache_avro::Error),
}

/// Codec converts envelopes to and from Kafka message values
pub trait Codec {
    fn get_name(&self) -> String;
    fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>, EncodeError>;
    fn decode(&self, message: &[u8]) -> Result<Envelope, DecodeError>;
}

pub type SharedCodec = Arc<dyn Codec + Send + Sync>;

/// Creates codec of specified name.
/// Producer and consumers of one topic must agree on it.
pub fn get_codec(name: &str) -> Result<SharedCodec, anyhow::Error> {
    match name {
        "json" => Ok(Arc::new(json::Codec)),
        "avro" => Ok(Arc::new(avro::new()?)),
        _ => Err(anyhow::anyhow!("unknown codec {}", name)),
    }
}

pub(crate) fn validated(envelope: Envelope) -> Result<Envelope, DecodeError> {
    if envelope.has_city() {
        Ok(envelope)
    } else {
        Err(DecodeError::EmptyCity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_knows_builtin_codecs() {
        assert_eq!(get_codec("json").unwrap().get_name(), "json");
        assert_eq!(get_codec("avro").unwrap().get_name(), "avro");
        assert!(get_codec("protobuf").is_err());
    }
}
