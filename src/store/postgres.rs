use std::{future::Future, time::Duration};

use async_trait::async_trait;
use deadpool_postgres::{
    Config, ManagerConfig, Pool, PoolConfig, RecyclingMethod, Runtime, Timeouts,
};
use tokio_postgres::NoTls;
use tracing::{debug, Span};

use crate::settings::PostgresSettings;

use super::{NewSample, SampleGateway, StorageError, StoredSample};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS city_temperatures (
        id SERIAL PRIMARY KEY,
        city VARCHAR(255) NOT NULL,
        temperature VARCHAR(50) NOT NULL,
        time TIMESTAMPTZ NOT NULL
    );
    CREATE INDEX IF NOT EXISTS city_temperatures_city_idx ON city_temperatures (city);
";

/// PostgreSQL gateway over a deadpool connection pool.
/// Cheap to clone, every clone shares the pool.
#[derive(Clone)]
pub struct PostgresGateway {
    pool: Pool,
    query_timeout: Duration,
    span: Span,
}

impl PostgresGateway {
    pub fn new(settings: &PostgresSettings, span: Span) -> Result<Self, StorageError> {
        let mut cfg = Config::new();
        cfg.host = Some(settings.host.clone());
        cfg.port = Some(settings.port);
        cfg.dbname = Some(settings.dbname.clone());
        cfg.user = Some(settings.user.clone());
        cfg.password = Some(settings.password.clone());
        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        let connect_timeout = Duration::from_millis(settings.connect_timeout_ms);
        cfg.connect_timeout = Some(connect_timeout);
        let mut pool = PoolConfig::new(settings.max_pool_size);
        pool.timeouts = Timeouts {
            wait: Some(connect_timeout),
            create: Some(connect_timeout),
            recycle: Some(connect_timeout),
        };
        cfg.pool = Some(pool);

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;

        Ok(Self {
            pool,
            query_timeout: Duration::from_millis(settings.query_timeout_ms),
            span,
        })
    }

    /// Bounds `op` so a store that stopped answering fails the call instead of
    /// hanging the claim.
    async fn bounded<T>(
        &self,
        op: impl Future<Output = Result<T, StorageError>>,
    ) -> Result<T, StorageError> {
        tokio::time::timeout(self.query_timeout, op)
            .await
            .map_err(|_| StorageError::Timeout(self.query_timeout))?
    }

    /// Round trip to the database, used to fail fast at startup.
    pub async fn ping(&self) -> Result<(), StorageError> {
        let conn = self.pool.get().await?;
        conn.execute("SELECT 1", &[]).await?;
        debug!(parent: &self.span, "postgres connection successful");
        Ok(())
    }
}

#[async_trait]
impl SampleGateway for PostgresGateway {
    async fn ensure_schema(&self) -> Result<(), StorageError> {
        let conn = self.pool.get().await?;
        conn.batch_execute(SCHEMA).await?;
        debug!(parent: &self.span, "schema ensured");
        Ok(())
    }

    async fn write(&self, sample: &NewSample) -> Result<(), StorageError> {
        self.bounded(async {
            let conn = self.pool.get().await?;
            conn.execute(
                "INSERT INTO city_temperatures (city, temperature, time) VALUES ($1, $2, $3)",
                &[&sample.city, &sample.temperature, &sample.observed_at],
            )
            .await?;
            Ok(())
        })
        .await
    }

    async fn query(&self, city: &str) -> Result<Vec<StoredSample>, StorageError> {
        let rows = self
            .bounded(async {
                let conn = self.pool.get().await?;
                let rows = conn
                    .query(
                        "SELECT id, city, temperature, time
                         FROM city_temperatures
                         WHERE city = $1
                         ORDER BY id",
                        &[&city],
                    )
                    .await?;
                Ok(rows)
            })
            .await?;

        Ok(rows
            .iter()
            .map(|row| StoredSample {
                id: row.get(0),
                city: row.get(1),
                temperature: row.get(2),
                observed_at: row.get(3),
            })
            .collect())
    }
}
