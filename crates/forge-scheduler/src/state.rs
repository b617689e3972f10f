use std::sync::Arc;

use tokio::sync::{Mutex, Notify};

use forge_common::auth::AuthConfig;
use forge_scheduler::{Cluster, Feed, RunMetricsStore};

use crate::metrics::SharedMetrics;

#[derive(Clone)]
pub struct AppState {
    pub cluster: Arc<Mutex<Cluster>>,
    pub feed: Feed,
    pub run_metrics: Arc<RunMetricsStore>,
    /// Wakes the admission loop after any mutation.
    pub admission: Arc<Notify>,
    pub metrics: Arc<SharedMetrics>,
    pub auth: AuthConfig,
}

impl AppState {
    pub fn new(cluster: Cluster, auth: AuthConfig) -> Self {
        Self {
            feed: cluster.feed(),
            run_metrics: cluster.run_metrics(),
            cluster: Arc::new(Mutex::new(cluster)),
            admission: Arc::new(Notify::new()),
            metrics: Arc::new(SharedMetrics::default()),
            auth,
        }
    }

    pub fn request_admission(&self) {
        self.admission.notify_one();
    }
}

impl AsRef<AuthConfig> for AppState {
    fn as_ref(&self) -> &AuthConfig {
        &self.auth
    }
}
