use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Span};

use crate::{
    backoff::StoragePolicy,
    codec::{DecodeError, SharedCodec},
    envelope::Envelope,
    group::{Acknowledger, Claim, Delivery},
    mirror::MirrorStore,
    readiness::ReadinessGate,
    store::{NewSample, SampleGateway},
};

/// Outcome of processing one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Stored,
    /// Payload could not be decoded; dropped for good.
    Malformed,
    /// Store refused the sample and the storage policy gave up on it.
    StorageSkipped,
    /// Claim ended while the write was still being retried.
    Abandoned,
}

impl Disposition {
    /// Everything but an abandoned write is acknowledged, so neither poison messages
    /// nor a store outage can stall the partition.
    pub fn acknowledges(&self) -> bool {
        !matches!(self, Disposition::Abandoned)
    }
}

/// Consumer group member: decodes, persists and acknowledges the deliveries of
/// every partition it is handed, one [Claim] per partition.
pub struct Ingester {
    codec: SharedCodec,
    gateway: Arc<dyn SampleGateway>,
    mirror: MirrorStore,
    policy: StoragePolicy,
    ready: ReadinessGate,
    assigned: AtomicBool,
    span: Span,
}

impl Ingester {
    pub fn new(
        codec: SharedCodec,
        gateway: Arc<dyn SampleGateway>,
        mirror: MirrorStore,
        policy: StoragePolicy,
        span: Span,
    ) -> Ingester {
        Ingester {
            codec,
            gateway,
            mirror,
            policy,
            ready: ReadinessGate::new(),
            assigned: AtomicBool::new(false),
            span,
        }
    }

    /// Opens once the first partitions have been assigned to this member.
    pub fn ready(&self) -> &ReadinessGate {
        &self.ready
    }

    pub fn mirror(&self) -> &MirrorStore {
        &self.mirror
    }

    /// Called by the group whenever the coordinator assigns partitions. The first
    /// call opens the readiness gate even with zero partitions: the member has joined,
    /// it just has nothing to do until a later rebalance.
    pub fn on_assignment(&self, partitions: usize) {
        info!(parent: &self.span, partitions, "partitions assigned");
        if !self.assigned.swap(true, Ordering::AcqRel) {
            self.ready.open();
        }
    }

    /// Processes a claim until it ends. Deliveries are handled strictly one after
    /// another and each is acknowledged only after its write attempt finished.
    pub async fn run_claim(&self, mut claim: Claim, acker: &dyn Acknowledger) {
        info!(parent: &self.span, topic = %claim.topic, partition = claim.partition, "claim started");
        let mut processed: u64 = 0;
        while let Some(delivery) = claim.next().await {
            let disposition = self.handle(&delivery, claim.cancellation()).await;
            if disposition.acknowledges() {
                if let Err(e) = acker.acknowledge(&delivery) {
                    error!(
                        parent: &self.span,
                        partition = delivery.partition,
                        offset = delivery.offset,
                        error = %e,
                        "failed to acknowledge message"
                    );
                }
            }
            processed += 1;
        }
        info!(parent: &self.span, topic = %claim.topic, partition = claim.partition, processed, "claim released");
    }

    /// Decodes and persists one delivery. `cancel` only cuts storage retries short;
    /// a write already in flight always completes.
    pub async fn handle(&self, delivery: &Delivery, cancel: &CancellationToken) -> Disposition {
        let envelope = match self.decode(delivery) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(
                    parent: &self.span,
                    partition = delivery.partition,
                    offset = delivery.offset,
                    key = ?delivery.key.as_deref().map(String::from_utf8_lossy),
                    error = %e,
                    "dropping undecodable message"
                );
                return Disposition::Malformed;
            }
        };
        let sample = NewSample::from(&envelope);
        self.mirror.append(envelope);
        self.persist(&sample, delivery, cancel).await
    }

    fn decode(&self, delivery: &Delivery) -> Result<Envelope, DecodeError> {
        let payload = delivery
            .payload
            .as_deref()
            .ok_or(DecodeError::MissingPayload)?;
        self.codec.decode(payload)
    }

    async fn persist(
        &self,
        sample: &NewSample,
        delivery: &Delivery,
        cancel: &CancellationToken,
    ) -> Disposition {
        let mut failed_attempts = 0;
        loop {
            let err = match self.gateway.write(sample).await {
                Ok(()) => {
                    debug!(
                        parent: &self.span,
                        city = %sample.city,
                        partition = delivery.partition,
                        offset = delivery.offset,
                        "sample stored"
                    );
                    return Disposition::Stored;
                }
                Err(e) => e,
            };
            failed_attempts += 1;

            let Some(delay) = self.policy.retry_delay(failed_attempts) else {
                error!(
                    parent: &self.span,
                    city = %sample.city,
                    partition = delivery.partition,
                    offset = delivery.offset,
                    attempts = failed_attempts,
                    error = %err,
                    "skipping sample the store refused"
                );
                return Disposition::StorageSkipped;
            };

            warn!(
                parent: &self.span,
                city = %sample.city,
                attempt = failed_attempts,
                retry_in_ms = delay.as_millis() as u64,
                error = %err,
                "storage write failed"
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    warn!(
                        parent: &self.span,
                        partition = delivery.partition,
                        offset = delivery.offset,
                        "claim ended during storage retry, leaving message for redelivery"
                    );
                    return Disposition::Abandoned;
                }
                _ = sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use mockall::Sequence;
    use tokio::sync::mpsc;

    use super::*;
    use crate::{
        backoff::BackoffPolicy,
        codec::get_codec,
        group::BrokerError,
        store::{MockSampleGateway, StorageError},
    };

    const ZURICH: &str = r#"{"city":"Zurich","temperature":"19°C","time":"2024-05-01T10:00:00Z"}"#;

    #[derive(Default)]
    struct RecordingAcker {
        offsets: Mutex<Vec<i64>>,
    }

    impl Acknowledger for RecordingAcker {
        fn acknowledge(&self, delivery: &Delivery) -> Result<(), BrokerError> {
            self.offsets.lock().unwrap().push(delivery.offset);
            Ok(())
        }
    }

    impl RecordingAcker {
        fn offsets(&self) -> Vec<i64> {
            self.offsets.lock().unwrap().clone()
        }
    }

    fn delivery(offset: i64, payload: Option<&str>) -> Delivery {
        Delivery {
            topic: "notifications".to_string(),
            partition: 0,
            offset,
            key: Some(b"Zurich".to_vec()),
            payload: payload.map(|p| p.as_bytes().to_vec()),
        }
    }

    fn ingester(gateway: MockSampleGateway, policy: StoragePolicy) -> Ingester {
        Ingester::new(
            get_codec("json").unwrap(),
            Arc::new(gateway),
            MirrorStore::new(),
            policy,
            Span::none(),
        )
    }

    async fn run_to_end(ingester: &Ingester, deliveries: Vec<Delivery>) -> RecordingAcker {
        let (tx, rx) = mpsc::channel(deliveries.len().max(1));
        for d in deliveries {
            tx.send(d).await.unwrap();
        }
        drop(tx);
        let acker = RecordingAcker::default();
        let claim = Claim::new("notifications", 0, rx, CancellationToken::new());
        ingester.run_claim(claim, &acker).await;
        acker
    }

    fn failing() -> Result<(), StorageError> {
        Err(StorageError::Unavailable("connection refused".to_string()))
    }

    #[tokio::test]
    async fn stores_and_acknowledges_valid_message() {
        let mut gateway = MockSampleGateway::new();
        gateway
            .expect_write()
            .withf(|s: &NewSample| s.city == "Zurich" && s.temperature == "19°C")
            .times(1)
            .returning(|_| Ok(()));
        let ingester = ingester(gateway, StoragePolicy::SkipImmediately);

        let acker = run_to_end(&ingester, vec![delivery(0, Some(ZURICH))]).await;

        assert_eq!(acker.offsets(), vec![0]);
        assert_eq!(ingester.mirror().snapshot()[0].city, "Zurich");
    }

    #[tokio::test]
    async fn poison_messages_are_acknowledged_without_blocking() {
        let mut gateway = MockSampleGateway::new();
        gateway.expect_write().times(1).returning(|_| Ok(()));
        let ingester = ingester(gateway, StoragePolicy::SkipImmediately);

        let acker = run_to_end(
            &ingester,
            vec![
                delivery(0, Some("{not json")),
                delivery(1, None),
                delivery(2, Some(ZURICH)),
            ],
        )
        .await;

        assert_eq!(acker.offsets(), vec![0, 1, 2]);
        assert_eq!(ingester.mirror().len(), 1);
    }

    #[tokio::test]
    async fn storage_failure_is_skipped_and_acknowledged_by_default() {
        let mut gateway = MockSampleGateway::new();
        gateway.expect_write().times(1).returning(|_| failing());
        let ingester = ingester(gateway, StoragePolicy::SkipImmediately);

        let acker = run_to_end(&ingester, vec![delivery(5, Some(ZURICH))]).await;

        assert_eq!(acker.offsets(), vec![5]);
        // mirror is best effort and not tied to the write
        assert_eq!(ingester.mirror().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_policy_recovers_from_transient_failure() {
        let mut gateway = MockSampleGateway::new();
        let mut seq = Sequence::new();
        gateway
            .expect_write()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| failing());
        gateway
            .expect_write()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        let ingester = ingester(
            gateway,
            StoragePolicy::RetryThenSkip {
                attempts: 3,
                backoff: BackoffPolicy::fixed(Duration::from_secs(1)),
            },
        );

        let disposition = ingester
            .handle(&delivery(0, Some(ZURICH)), &CancellationToken::new())
            .await;

        assert_eq!(disposition, Disposition::Stored);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_policy_skips_after_last_attempt() {
        let mut gateway = MockSampleGateway::new();
        gateway.expect_write().times(3).returning(|_| failing());
        let ingester = ingester(
            gateway,
            StoragePolicy::RetryThenSkip {
                attempts: 3,
                backoff: BackoffPolicy::fixed(Duration::from_secs(1)),
            },
        );

        let started = tokio::time::Instant::now();
        let acker = run_to_end(&ingester, vec![delivery(0, Some(ZURICH))]).await;

        assert_eq!(acker.offsets(), vec![0]);
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(2) && waited < Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_retry_is_not_acknowledged() {
        let mut gateway = MockSampleGateway::new();
        gateway.expect_write().times(1).returning(|_| failing());
        let ingester = ingester(
            gateway,
            StoragePolicy::RetryThenSkip {
                attempts: 3,
                backoff: BackoffPolicy::fixed(Duration::from_secs(60)),
            },
        );
        let cancel = CancellationToken::new();
        cancel.cancel();

        let disposition = ingester.handle(&delivery(0, Some(ZURICH)), &cancel).await;

        assert_eq!(disposition, Disposition::Abandoned);
        assert!(!disposition.acknowledges());
    }

    #[tokio::test]
    async fn readiness_opens_on_first_assignment_only() {
        let ingester = ingester(MockSampleGateway::new(), StoragePolicy::SkipImmediately);
        assert!(!ingester.ready().is_open());

        ingester.on_assignment(3);
        ingester.on_assignment(2);

        assert!(ingester.ready().is_open());
        ingester.ready().wait().await;
    }

    #[tokio::test]
    async fn empty_first_assignment_still_opens_readiness() {
        let ingester = ingester(MockSampleGateway::new(), StoragePolicy::SkipImmediately);

        ingester.on_assignment(0);

        assert!(ingester.ready().is_open());
        // a later real assignment must not open it a second time
        ingester.on_assignment(4);
    }
}
