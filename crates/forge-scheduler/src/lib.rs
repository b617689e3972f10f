//! Cluster-aware training-run scheduling core.
//!
//! [`Cluster`] owns the node registry, allocator, run queue and model registry;
//! the service binary wraps it in a single async mutex and drives it from HTTP
//! handlers and the sweep/admission loops.

pub mod allocator;
pub mod cluster;
pub mod config;
pub mod cost;
pub mod datasets;
pub mod error;
pub mod feed;
pub mod heartbeat;
pub mod models;
pub mod queue;
pub mod registry;
pub mod run_metrics;
pub mod scheduler;

pub use cluster::{AdmissionReport, Admitted, Cluster, SweepReport};
pub use config::SchedulerConfig;
pub use datasets::DatasetFilter;
pub use error::SchedulerError;
pub use feed::{EventStream, Feed};
pub use run_metrics::RunMetricsStore;
