//! Wiring of the ingestion pipeline
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{anyhow, Context};
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::info_span;

use crate::{
    codec::{get_codec, SharedCodec},
    envelope::Envelope,
    group::{kafka::KafkaGroup, ConsumerGroup},
    ingester::Ingester,
    mirror::MirrorStore,
    settings::Settings,
    store::{postgres::PostgresGateway, SampleGateway, StorageError, StoredSample},
    supervisor::{Supervisor, SupervisorState},
};

/// A consumer instance together with its read side.
///
/// Started once with a cancellation token and stopped by cancelling it; a stopped
/// pipeline cannot be restarted, build a new one instead.
pub struct Pipeline<G> {
    supervisor: Mutex<Option<Supervisor<G>>>,
    state: watch::Receiver<SupervisorState>,
    ingester: Arc<Ingester>,
    gateway: Arc<dyn SampleGateway>,
}

impl Pipeline<KafkaGroup> {
    /// Connects to PostgreSQL and Kafka. Any failure here is fatal: a pipeline that
    /// cannot reach its store or create its broker client is never started.
    pub async fn connect(settings: &Settings) -> anyhow::Result<Self> {
        let codec = get_codec(&settings.codec)?;

        let gateway = PostgresGateway::new(&settings.postgres, info_span!("store"))
            .context("configuring postgres pool")?;
        gateway.ping().await.context("connecting to postgres")?;
        gateway
            .ensure_schema()
            .await
            .context("creating city_temperatures schema")?;

        let group = KafkaGroup::new(
            &settings.kafka,
            info_span!("group", group = %settings.kafka.consumer_group),
        )
        .context("creating kafka consumer")?;

        Ok(Pipeline::new(group, Arc::new(gateway), codec, settings))
    }
}

impl<G: ConsumerGroup + 'static> Pipeline<G> {
    pub fn new(
        group: G,
        gateway: Arc<dyn SampleGateway>,
        codec: SharedCodec,
        settings: &Settings,
    ) -> Self {
        let ingester = Arc::new(Ingester::new(
            codec,
            gateway.clone(),
            MirrorStore::new(),
            settings.storage_policy.policy(),
            info_span!("ingester"),
        ));
        let supervisor = Supervisor::new(
            group,
            vec![settings.kafka.topic.clone()],
            ingester.clone(),
            settings.backoff.policy(),
            info_span!("supervisor"),
        );
        Pipeline {
            state: supervisor.state(),
            supervisor: Mutex::new(Some(supervisor)),
            ingester,
            gateway,
        }
    }

    /// Spawns the supervisor. Fails if the pipeline was started before.
    pub fn start(&self, cancel: CancellationToken) -> anyhow::Result<JoinHandle<()>> {
        let supervisor = self
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| anyhow!("pipeline already started"))?;
        Ok(tokio::spawn(supervisor.run(cancel)))
    }

    /// Resolves once the group has assigned the first partitions.
    pub async fn ready(&self) {
        self.ingester.ready().wait().await
    }

    pub fn state(&self) -> watch::Receiver<SupervisorState> {
        self.state.clone()
    }

    /// Stored samples of `city` in arrival order.
    pub async fn samples_for_city(&self, city: &str) -> Result<Vec<StoredSample>, StorageError> {
        self.gateway.query(city).await
    }

    /// Envelopes consumed so far, whether or not they were stored.
    pub fn mirror_snapshot(&self) -> Vec<Envelope> {
        self.ingester.mirror().snapshot()
    }
}
