//! Consumer group backed by librdkafka.
//!
//! One `StreamConsumer` subscribes to the topic; every message it yields is routed
//! through a [ClaimTable] to the claim task of its partition, so partitions progress
//! independently while each one is processed in offset order. A partition whose
//! claim falls behind is paused at the client until its backlog is queued again.
//! Rebalance callbacks are forwarded from the client thread as [RebalanceEvent]s and
//! start or end claims.
//!
//! Acknowledging stores the next offset of the partition; stored offsets are
//! committed by the client's auto-commit and once more when the group is closed.
use std::sync::Arc;

use async_trait::async_trait;
use rdkafka::{
    config::ClientConfig,
    consumer::{BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer},
    error::KafkaError,
    message::{BorrowedMessage, Message},
    types::RDKafkaErrorCode,
    ClientContext, TopicPartitionList,
};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Span};

use crate::{ingester::Ingester, settings::KafkaSettings};

use super::{
    claims::{ClaimTable, PartitionKey, RebalanceEvent, Routed},
    Acknowledger, BrokerError, ConsumerGroup, Delivery,
};

pub struct GroupContext {
    events: mpsc::UnboundedSender<RebalanceEvent>,
}

impl GroupContext {
    fn forward(&self, event: RebalanceEvent) {
        // receiver only goes away together with the group
        let _ = self.events.send(event);
    }

    fn before_rebalance(&self, rebalance: &Rebalance<'_>) {
        if let Rebalance::Revoke(tpl) = rebalance {
            self.forward(RebalanceEvent::Revoked(partitions(tpl)));
        }
    }

    fn after_rebalance(&self, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Assign(tpl) => self.forward(RebalanceEvent::Assigned(partitions(tpl))),
            Rebalance::Error(e) => self.forward(RebalanceEvent::Failed(e.to_string())),
            Rebalance::Revoke(_) => {}
        }
    }
}

fn partitions(tpl: &TopicPartitionList) -> Vec<PartitionKey> {
    tpl.elements()
        .iter()
        .map(|elem| (elem.topic().to_string(), elem.partition()))
        .collect()
}

fn partition_list(keys: &[PartitionKey]) -> TopicPartitionList {
    let mut tpl = TopicPartitionList::new();
    for (topic, partition) in keys {
        tpl.add_partition(topic, *partition);
    }
    tpl
}

impl ClientContext for GroupContext {}

impl ConsumerContext for GroupContext {
    fn pre_rebalance(&self, _: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        self.before_rebalance(rebalance);
    }

    fn post_rebalance(&self, _: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        self.after_rebalance(rebalance);
    }
}

type GroupConsumer = StreamConsumer<GroupContext>;

struct OffsetStore {
    consumer: Arc<GroupConsumer>,
}

impl Acknowledger for OffsetStore {
    fn acknowledge(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        // the committed offset is the _next_ message to read
        self.consumer
            .store_offset(&delivery.topic, delivery.partition, delivery.offset + 1)?;
        Ok(())
    }
}

pub struct KafkaGroup {
    consumer: Arc<GroupConsumer>,
    events: Mutex<mpsc::UnboundedReceiver<RebalanceEvent>>,
    claim_buffer: usize,
    span: Span,
}

impl KafkaGroup {
    pub fn new(settings: &KafkaSettings, span: Span) -> Result<Self, BrokerError> {
        let (events, rx) = mpsc::unbounded_channel();
        let consumer: GroupConsumer = ClientConfig::new()
            .set("bootstrap.servers", &settings.brokers)
            .set("group.id", &settings.consumer_group)
            .set("auto.offset.reset", &settings.offset_reset)
            .set("session.timeout.ms", settings.session_timeout_ms.to_string())
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false")
            .create_with_context(GroupContext { events })?;

        Ok(KafkaGroup {
            consumer: Arc::new(consumer),
            events: Mutex::new(rx),
            claim_buffer: settings.claim_buffer.max(1),
            span,
        })
    }

    /// Stops or restarts fetching `keys` at the client.
    fn set_paused(&self, keys: &[PartitionKey], paused: bool) {
        if keys.is_empty() {
            return;
        }
        let tpl = partition_list(keys);
        let result = if paused {
            self.consumer.pause(&tpl)
        } else {
            self.consumer.resume(&tpl)
        };
        if let Err(e) = result {
            warn!(parent: &self.span, error = %e, paused, "cannot change partition fetch state");
        }
    }
}

fn to_delivery(message: &BorrowedMessage<'_>) -> Delivery {
    Delivery {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        key: message.key().map(<[u8]>::to_vec),
        payload: message.payload().map(<[u8]>::to_vec),
    }
}

#[async_trait]
impl ConsumerGroup for KafkaGroup {
    async fn join(&self, topics: &[String]) -> Result<(), BrokerError> {
        let topics: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer.subscribe(&topics)?;
        info!(parent: &self.span, ?topics, "subscribed");
        Ok(())
    }

    async fn consume(
        &self,
        ingester: Arc<Ingester>,
        cancel: CancellationToken,
    ) -> Result<(), BrokerError> {
        let mut events = self.events.lock().await;
        let acker = Arc::new(OffsetStore {
            consumer: self.consumer.clone(),
        });
        let mut claims = ClaimTable::new(self.claim_buffer, ingester, acker, self.span.clone());

        let result = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Ok(()),
                Some(event) = events.recv() => match claims.apply(event, &cancel).await {
                    // a partition paused in an earlier session must not stay paused
                    Ok(assigned) => self.set_paused(&assigned, false),
                    Err(e) => break Err(e),
                },
                Some(key) = claims.writable() => {
                    if claims.refill(&key) {
                        debug!(parent: &self.span, topic = %key.0, partition = key.1, "claim caught up, resuming partition");
                        self.set_paused(&[key], false);
                    }
                }
                // the borrowed message must not outlive this future
                received = async { self.consumer.recv().await.map(|m| to_delivery(&m)) } => match received {
                    Ok(delivery) => {
                        let key = (delivery.topic.clone(), delivery.partition);
                        if claims.route(delivery, &cancel) == Routed::Full {
                            debug!(parent: &self.span, topic = %key.0, partition = key.1, "claim queue full, pausing partition");
                            self.set_paused(&[key], true);
                        }
                    }
                    Err(e) => break Err(BrokerError::from(e)),
                },
            }
        };

        debug!(parent: &self.span, claims = claims.claimed(), "ending group session");
        claims.release_all().await;
        result
    }

    async fn close(&self) {
        match self.consumer.commit_consumer_state(CommitMode::Sync) {
            Ok(()) => debug!(parent: &self.span, "stored offsets committed"),
            Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => {}
            Err(e) => warn!(parent: &self.span, error = %e, "final offset commit failed"),
        }
        self.consumer.unsubscribe();
        info!(parent: &self.span, "left consumer group");
    }
}
