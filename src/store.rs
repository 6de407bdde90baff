//! Durable storage of consumed samples
pub mod postgres;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::envelope::Envelope;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("acquiring connection: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),
    #[error("database: {0}")]
    Database(#[from] tokio_postgres::Error),
    #[error("no answer from the store within {0:?}")]
    Timeout(Duration),
}

/// Sample about to be written; the store assigns its id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSample {
    pub city: String,
    pub temperature: String,
    pub observed_at: DateTime<Utc>,
}

impl From<&Envelope> for NewSample {
    fn from(envelope: &Envelope) -> Self {
        NewSample {
            city: envelope.city.clone(),
            temperature: envelope.temperature.clone(),
            observed_at: envelope.observed_at,
        }
    }
}

/// Sample as read back from the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredSample {
    pub id: i32,
    pub city: String,
    pub temperature: String,
    #[serde(rename = "time")]
    pub observed_at: DateTime<Utc>,
}

/// Write and read path of the relational store.
///
/// Writes are append-only: a redelivered message produces a second row rather than
/// an error, so callers may retry freely.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SampleGateway: Send + Sync {
    /// Creates the storage structure if it does not exist yet.
    async fn ensure_schema(&self) -> Result<(), StorageError>;
    async fn write(&self, sample: &NewSample) -> Result<(), StorageError>;
    /// All samples of `city` in arrival order; no rows is an empty vector.
    async fn query(&self, city: &str) -> Result<Vec<StoredSample>, StorageError>;
}
