//! Consumer group membership as seen by the supervisor and the ingester.
//!
//! The broker's group coordinator decides which partitions this process owns; the
//! types here only describe what the application observes of that: a [Claim] per
//! owned partition, the [Delivery] values flowing through it and the
//! [Acknowledger] that marks them done.
pub mod claims;
pub mod kafka;

use std::sync::Arc;

use async_trait::async_trait;
use rdkafka::error::KafkaError;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::ingester::Ingester;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("kafka: {0}")]
    Kafka(#[from] KafkaError),
    #[error("rebalance failed: {0}")]
    Rebalance(String),
}

/// One message of a claimed partition, detached from the client's buffers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    /// `None` for tombstones.
    pub payload: Option<Vec<u8>>,
}

/// Marks deliveries as processed so the group resumes after them.
pub trait Acknowledger: Send + Sync {
    fn acknowledge(&self, delivery: &Delivery) -> Result<(), BrokerError>;
}

/// Exclusive ownership of one partition for the duration of an assignment.
///
/// Deliveries arrive in partition order. The claim ends when the sender side is
/// dropped or `cancel` fires; queued deliveries are not carried past its end.
pub struct Claim {
    pub topic: String,
    pub partition: i32,
    deliveries: mpsc::Receiver<Delivery>,
    cancel: CancellationToken,
}

impl Claim {
    pub fn new(
        topic: impl Into<String>,
        partition: i32,
        deliveries: mpsc::Receiver<Delivery>,
        cancel: CancellationToken,
    ) -> Self {
        Claim {
            topic: topic.into(),
            partition,
            deliveries,
            cancel,
        }
    }

    /// Next delivery, or `None` once the claim has ended.
    pub async fn next(&mut self) -> Option<Delivery> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            delivery = self.deliveries.recv() => delivery,
        }
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// Membership of one logical consumer in a consumer group.
#[async_trait]
pub trait ConsumerGroup: Send + Sync {
    /// Requests membership for `topics`.
    async fn join(&self, topics: &[String]) -> Result<(), BrokerError>;

    /// Runs one group session, handing every claimed partition to `ingester`.
    ///
    /// Returns `Ok` when `cancel` fires or the member has to rejoin, and an error when
    /// the session failed. All claims of the session have ended when this returns.
    async fn consume(
        &self,
        ingester: Arc<Ingester>,
        cancel: CancellationToken,
    ) -> Result<(), BrokerError>;

    /// Leaves the group. No broker interaction follows.
    async fn close(&self);
}
