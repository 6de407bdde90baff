//! Claims of one group session, keyed by partition.
//!
//! Every claim owns a bounded delivery queue drained by its own task. Routing never
//! waits on a queue: a full one parks further deliveries of that partition in an
//! overflow list and reports [Routed::Full] so the caller can stop fetching the
//! partition until [ClaimTable::refill] reports the backlog gone. Other partitions
//! keep flowing meanwhile.
use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Span};

use crate::ingester::Ingester;

use super::{Acknowledger, BrokerError, Claim, Delivery};

pub type PartitionKey = (String, i32);

/// Group coordinator decisions as observed by the member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebalanceEvent {
    Assigned(Vec<PartitionKey>),
    Revoked(Vec<PartitionKey>),
    Failed(String),
}

/// Where a routed delivery ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routed {
    Queued,
    /// The claim queue just filled up; the partition should stop fetching.
    Full,
    /// Parked behind earlier overflow of the same partition.
    Held,
    /// The claim task is gone; the delivery is left for redelivery.
    Dropped,
}

struct ActiveClaim {
    deliveries: mpsc::Sender<Delivery>,
    overflow: VecDeque<Delivery>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ActiveClaim {
    /// Moves overflow into the queue. Returns `true` if the queue filled up again.
    fn flush(&mut self) -> bool {
        while let Some(delivery) = self.overflow.pop_front() {
            match self.deliveries.try_send(delivery) {
                Ok(()) => {}
                Err(TrySendError::Full(delivery)) => {
                    self.overflow.push_front(delivery);
                    return true;
                }
                Err(TrySendError::Closed(_)) => {
                    self.overflow.clear();
                    return false;
                }
            }
        }
        false
    }

    /// Lets the in-flight delivery finish and drops whatever is still queued.
    async fn release(self, span: &Span) {
        self.cancel.cancel();
        drop(self.deliveries);
        if let Err(e) = self.task.await {
            error!(parent: span, error = %e, "claim task failed");
        }
    }
}

pub struct ClaimTable {
    claims: HashMap<PartitionKey, ActiveClaim>,
    buffer: usize,
    ingester: Arc<Ingester>,
    acker: Arc<dyn Acknowledger>,
    writable_tx: mpsc::UnboundedSender<PartitionKey>,
    writable_rx: mpsc::UnboundedReceiver<PartitionKey>,
    span: Span,
}

impl ClaimTable {
    pub fn new(
        buffer: usize,
        ingester: Arc<Ingester>,
        acker: Arc<dyn Acknowledger>,
        span: Span,
    ) -> Self {
        let (writable_tx, writable_rx) = mpsc::unbounded_channel();
        ClaimTable {
            claims: HashMap::new(),
            buffer: buffer.max(1),
            ingester,
            acker,
            writable_tx,
            writable_rx,
            span,
        }
    }

    pub fn claimed(&self) -> usize {
        self.claims.len()
    }

    /// Starts the claim task of `key` unless it already runs.
    pub fn start(&mut self, key: &PartitionKey, session: &CancellationToken) {
        if self.claims.contains_key(key) {
            return;
        }
        let (deliveries, rx) = mpsc::channel(self.buffer);
        let cancel = session.child_token();
        let claim = Claim::new(key.0.clone(), key.1, rx, cancel.clone());
        let task = tokio::spawn({
            let ingester = self.ingester.clone();
            let acker = self.acker.clone();
            async move { ingester.run_claim(claim, acker.as_ref()).await }
        });
        self.claims.insert(
            key.clone(),
            ActiveClaim {
                deliveries,
                overflow: VecDeque::new(),
                cancel,
                task,
            },
        );
    }

    /// Hands `delivery` to the claim of its partition, starting one if the message
    /// arrived ahead of its assignment event.
    pub fn route(&mut self, delivery: Delivery, session: &CancellationToken) -> Routed {
        let key = (delivery.topic.clone(), delivery.partition);
        if !self.claims.contains_key(&key) {
            debug!(parent: &self.span, topic = %key.0, partition = key.1, "message ahead of assignment event");
            self.start(&key, session);
        }
        let Some(claim) = self.claims.get_mut(&key) else {
            return Routed::Dropped;
        };
        if !claim.overflow.is_empty() {
            claim.overflow.push_back(delivery);
            return Routed::Held;
        }
        match claim.deliveries.try_send(delivery) {
            Ok(()) => Routed::Queued,
            Err(TrySendError::Full(delivery)) => {
                claim.overflow.push_back(delivery);
                watch_capacity(key, &claim.deliveries, &self.writable_tx);
                Routed::Full
            }
            Err(TrySendError::Closed(_)) => {
                warn!(parent: &self.span, topic = %key.0, partition = key.1, "claim already ended, message left for redelivery");
                Routed::Dropped
            }
        }
    }

    /// Next partition whose full queue has room again.
    pub async fn writable(&mut self) -> Option<PartitionKey> {
        self.writable_rx.recv().await
    }

    /// Moves parked deliveries of `key` into its queue. Returns `true` once the
    /// backlog is gone and the partition may fetch again.
    pub fn refill(&mut self, key: &PartitionKey) -> bool {
        let Some(claim) = self.claims.get_mut(key) else {
            return false;
        };
        if claim.overflow.is_empty() {
            return false;
        }
        if claim.flush() {
            watch_capacity(key.clone(), &claim.deliveries, &self.writable_tx);
            return false;
        }
        true
    }

    /// Applies a rebalance decision. Returns the partitions that were assigned.
    pub async fn apply(
        &mut self,
        event: RebalanceEvent,
        session: &CancellationToken,
    ) -> Result<Vec<PartitionKey>, BrokerError> {
        match event {
            RebalanceEvent::Assigned(assigned) => {
                // an empty assignment still completes the join
                self.ingester.on_assignment(assigned.len());
                for key in &assigned {
                    self.start(key, session);
                }
                Ok(assigned)
            }
            RebalanceEvent::Revoked(revoked) => {
                info!(parent: &self.span, partitions = revoked.len(), "partitions revoked");
                self.revoke(&revoked).await;
                Ok(Vec::new())
            }
            RebalanceEvent::Failed(reason) => Err(BrokerError::Rebalance(reason)),
        }
    }

    /// Ends the claims of `keys`; parked deliveries go with them.
    pub async fn revoke(&mut self, keys: &[PartitionKey]) {
        for key in keys {
            if let Some(claim) = self.claims.remove(key) {
                claim.release(&self.span).await;
            }
        }
    }

    pub async fn release_all(&mut self) {
        for (_, claim) in self.claims.drain() {
            claim.release(&self.span).await;
        }
    }
}

fn watch_capacity(
    key: PartitionKey,
    deliveries: &mpsc::Sender<Delivery>,
    writable: &mpsc::UnboundedSender<PartitionKey>,
) {
    let deliveries = deliveries.clone();
    let writable = writable.clone();
    tokio::spawn(async move {
        // the permit is dropped right away, only the dispatcher sends
        if deliveries.reserve().await.is_ok() {
            let _ = writable.send(key);
        }
    });
}

#[cfg(test)]
mod tests {
    use std::{sync::Mutex, time::Duration};

    use async_trait::async_trait;
    use chrono::Utc;
    use tokio::sync::watch;

    use super::*;
    use crate::{
        backoff::StoragePolicy,
        codec::get_codec,
        envelope::Envelope,
        mirror::MirrorStore,
        store::{MockSampleGateway, NewSample, SampleGateway, StorageError, StoredSample},
    };

    const TOPIC: &str = "notifications";

    #[derive(Default)]
    struct RecordingAcker {
        acks: Mutex<Vec<(i32, i64)>>,
    }

    impl Acknowledger for RecordingAcker {
        fn acknowledge(&self, delivery: &Delivery) -> Result<(), BrokerError> {
            self.acks
                .lock()
                .unwrap()
                .push((delivery.partition, delivery.offset));
            Ok(())
        }
    }

    impl RecordingAcker {
        fn offsets(&self, partition: i32) -> Vec<i64> {
            self.acks
                .lock()
                .unwrap()
                .iter()
                .filter(|(p, _)| *p == partition)
                .map(|(_, offset)| *offset)
                .collect()
        }
    }

    /// Holds writes of `Basel` until opened; everything else goes through.
    struct GatedGateway {
        open: watch::Sender<bool>,
        started: Mutex<Vec<String>>,
    }

    impl GatedGateway {
        fn closed() -> Self {
            GatedGateway {
                open: watch::Sender::new(false),
                started: Mutex::new(Vec::new()),
            }
        }

        fn started(&self) -> usize {
            self.started.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl SampleGateway for GatedGateway {
        async fn ensure_schema(&self) -> Result<(), StorageError> {
            Ok(())
        }

        async fn write(&self, sample: &NewSample) -> Result<(), StorageError> {
            self.started.lock().unwrap().push(sample.city.clone());
            if sample.city == "Basel" {
                let mut open = self.open.subscribe();
                let _ = open.wait_for(|open| *open).await;
            }
            Ok(())
        }

        async fn query(&self, _city: &str) -> Result<Vec<StoredSample>, StorageError> {
            Ok(Vec::new())
        }
    }

    impl ClaimTable {
        fn is_empty(&self) -> bool {
            self.claims.is_empty()
        }

        fn is_claimed(&self, key: &PartitionKey) -> bool {
            self.claims.contains_key(key)
        }
    }

    fn delivery(partition: i32, offset: i64, city: &str) -> Delivery {
        let envelope = Envelope::new(city, "19°C", Utc::now());
        Delivery {
            topic: TOPIC.to_string(),
            partition,
            offset,
            key: Some(city.as_bytes().to_vec()),
            payload: Some(serde_json::to_vec(&envelope).unwrap()),
        }
    }

    fn key(partition: i32) -> PartitionKey {
        (TOPIC.to_string(), partition)
    }

    fn table(
        buffer: usize,
        gateway: Arc<dyn SampleGateway>,
    ) -> (ClaimTable, Arc<Ingester>, Arc<RecordingAcker>) {
        let ingester = Arc::new(Ingester::new(
            get_codec("json").unwrap(),
            gateway,
            MirrorStore::new(),
            StoragePolicy::SkipImmediately,
            Span::none(),
        ));
        let acker = Arc::new(RecordingAcker::default());
        let table = ClaimTable::new(buffer, ingester.clone(), acker.clone(), Span::none());
        (table, ingester, acker)
    }

    fn accepting() -> Arc<dyn SampleGateway> {
        let mut gateway = MockSampleGateway::new();
        gateway.expect_write().returning(|_| Ok(()));
        Arc::new(gateway)
    }

    async fn wait_until(mut done: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !done() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    #[tokio::test]
    async fn assignment_starts_claims_and_opens_readiness() {
        let (mut table, ingester, acker) = table(8, accepting());
        let session = CancellationToken::new();

        let assigned = table
            .apply(RebalanceEvent::Assigned(vec![key(0), key(1)]), &session)
            .await
            .unwrap();

        assert_eq!(assigned, vec![key(0), key(1)]);
        assert_eq!(table.claimed(), 2);
        assert!(ingester.ready().is_open());

        for offset in 0..3 {
            assert_eq!(table.route(delivery(0, offset, "Zurich"), &session), Routed::Queued);
        }
        wait_until(|| acker.offsets(0).len() == 3).await;
        assert_eq!(acker.offsets(0), vec![0, 1, 2]);

        table.release_all().await;
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn message_ahead_of_assignment_starts_its_claim() {
        let (mut table, _, acker) = table(8, accepting());
        let session = CancellationToken::new();

        assert_eq!(table.route(delivery(3, 10, "Lagos"), &session), Routed::Queued);

        assert!(table.is_claimed(&key(3)));
        wait_until(|| acker.offsets(3) == vec![10]).await;
        table.release_all().await;
    }

    #[tokio::test]
    async fn revoke_finishes_in_flight_and_drops_queued() {
        let gateway = Arc::new(GatedGateway::closed());
        let (mut table, _, acker) = table(8, gateway.clone());
        let session = CancellationToken::new();
        table.start(&key(0), &session);

        for offset in 0..3 {
            table.route(delivery(0, offset, "Basel"), &session);
        }
        wait_until(|| gateway.started() == 1).await;

        tokio::spawn({
            let gateway = gateway.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                gateway.open.send_replace(true);
            }
        });
        table
            .apply(RebalanceEvent::Revoked(vec![key(0)]), &session)
            .await
            .unwrap();

        assert!(!table.is_claimed(&key(0)));
        assert_eq!(acker.offsets(0), vec![0]);
        assert_eq!(gateway.started(), 1);
    }

    #[tokio::test]
    async fn rebalance_failure_ends_the_session() {
        let (mut table, ingester, _) = table(8, accepting());

        let result = table
            .apply(
                RebalanceEvent::Failed("coordinator gone".to_string()),
                &CancellationToken::new(),
            )
            .await;

        assert!(matches!(result, Err(BrokerError::Rebalance(_))));
        assert!(!ingester.ready().is_open());
    }

    #[tokio::test]
    async fn full_queue_holds_one_partition_without_blocking_others() {
        let gateway = Arc::new(GatedGateway::closed());
        let (mut table, _, acker) = table(1, gateway.clone());
        let session = CancellationToken::new();
        table.start(&key(0), &session);
        table.start(&key(1), &session);

        assert_eq!(table.route(delivery(0, 0, "Basel"), &session), Routed::Queued);
        wait_until(|| gateway.started() == 1).await;
        assert_eq!(table.route(delivery(0, 1, "Basel"), &session), Routed::Queued);
        assert_eq!(table.route(delivery(0, 2, "Basel"), &session), Routed::Full);
        assert_eq!(table.route(delivery(0, 3, "Basel"), &session), Routed::Held);

        // partition 0 is stuck in a write, partition 1 keeps going
        assert_eq!(table.route(delivery(1, 0, "Zurich"), &session), Routed::Queued);
        wait_until(|| acker.offsets(1) == vec![0]).await;
        assert!(acker.offsets(0).is_empty());

        gateway.open.send_replace(true);
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let writable = table.writable().await.unwrap();
                if table.refill(&writable) {
                    break;
                }
            }
        })
        .await
        .expect("backlog never drained");

        wait_until(|| acker.offsets(0).len() == 4).await;
        assert_eq!(acker.offsets(0), vec![0, 1, 2, 3]);
        table.release_all().await;
    }

    #[tokio::test]
    async fn release_all_waits_for_every_in_flight_write() {
        let gateway = Arc::new(GatedGateway::closed());
        let (mut table, _, acker) = table(8, gateway.clone());
        let session = CancellationToken::new();

        table.route(delivery(0, 5, "Basel"), &session);
        table.route(delivery(1, 7, "Basel"), &session);
        wait_until(|| gateway.started() == 2).await;

        tokio::spawn({
            let gateway = gateway.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                gateway.open.send_replace(true);
            }
        });
        table.release_all().await;

        assert!(table.is_empty());
        assert_eq!(acker.offsets(0), vec![5]);
        assert_eq!(acker.offsets(1), vec![7]);
    }
}
