//! ## tempsink
//! Streaming ingestion of city temperature samples from Kafka into PostgreSQL.
//!
//! A scraper publishes [Envelope]s keyed by city; every instance of this service
//! joins the same consumer group, claims a share of the topic's partitions and
//! writes each sample as one row of `city_temperatures`.
//!
//! ## Configuration
//! Every setting has a default pointing at local infrastructure. Values come from
//! `config/default.*`, the file passed with `--config`, then `TEMPSINK_*`
//! environment variables:
//! ```toml
//! codec = "json"                   # or "avro"
//! [kafka]
//! brokers = "localhost:9092"
//! topic = "notifications"
//! consumer_group = "notifications-group"
//! [postgres]
//! host = "localhost"
//! [backoff]                        # supervisor rejoin delay
//! initial_delay_ms = 5000
//! max_delay_ms = 5000
//! growth_factor = 1.0
//! [storage_policy]
//! mode = "skip"                    # or "retry" with `attempts`
//! ```
//!
//! ## Delivery guarantees
//! Each message is acknowledged after its write was attempted, never before, so a
//! crash between write and acknowledgement redelivers it and the store ends up
//! with a duplicate row; rows are an append log and tolerate that.
//! Malformed messages are dropped and acknowledged. A sample the store refuses is
//! skipped as well (optionally after retries), which makes a store outage lose
//! data rather than stall the partition; see [StoragePolicy].
//!
//! ## Recovery
//! The [Supervisor] keeps the group membership alive for the life of the process,
//! rejoining after every broker error with a configurable [BackoffPolicy]. It stops
//! only when its cancellation token fires.
//!
//! [Envelope]: envelope::Envelope
//! [StoragePolicy]: backoff::StoragePolicy
//! [BackoffPolicy]: backoff::BackoffPolicy
//! [Supervisor]: supervisor::Supervisor

pub mod backoff;
pub mod codec;
pub mod envelope;
pub mod group;
pub mod ingester;
pub mod mirror;
pub mod pipeline;
pub mod producer;
pub mod readiness;
pub mod settings;
pub mod store;
pub mod supervisor;
pub mod telemetry;
