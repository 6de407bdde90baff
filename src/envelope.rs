//! Wire-level measurement record
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Single published measurement.
///
/// The temperature is kept exactly as the producer scraped it (`"19°C"`, `"+3°F"`, ...);
/// parsing it into a number is left to whoever aggregates the stored samples.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Partition key, never empty.
    pub city: String,
    pub temperature: String,
    /// Producer clock at the time of the scrape.
    #[serde(rename = "time")]
    pub observed_at: DateTime<Utc>,
}

impl Envelope {
    pub fn new(
        city: impl Into<String>,
        temperature: impl Into<String>,
        observed_at: DateTime<Utc>,
    ) -> Self {
        Envelope {
            city: city.into(),
            temperature: temperature.into(),
            observed_at,
        }
    }

    /// Key used when publishing, so all samples of a city land on one partition.
    pub fn partition_key(&self) -> &str {
        &self.city
    }

    pub(crate) fn has_city(&self) -> bool {
        !self.city.trim().is_empty()
    }
}
