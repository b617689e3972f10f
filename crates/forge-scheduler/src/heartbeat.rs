//! Three-strike node liveness.
//!
//! One missed or failed heartbeat degrades a node, `offline_threshold` consecutive
//! ones take it offline, and a single good heartbeat restores it to healthy.
//! Silence is measured on the monotonic clock only.

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use forge_common::{Heartbeat, NodeHealth};

use crate::error::{Result, SchedulerError};
use crate::registry::{Node, NodeRegistry};

/// A health change produced by a heartbeat or a sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthTransition {
    pub node_id: String,
    pub from: NodeHealth,
    pub to: NodeHealth,
    pub consecutive_failures: u32,
}

impl HealthTransition {
    pub fn went_offline(&self) -> bool {
        self.to == NodeHealth::Offline
    }

    pub fn recovered(&self) -> bool {
        self.to == NodeHealth::Healthy
    }
}

#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    miss_timeout: Duration,
    offline_threshold: u32,
}

impl HeartbeatMonitor {
    pub fn new(miss_timeout: Duration, offline_threshold: u32) -> Self {
        Self {
            miss_timeout,
            offline_threshold: offline_threshold.max(1),
        }
    }

    /// Ingest a heartbeat received at `now`.
    pub fn record(
        &self,
        registry: &mut NodeRegistry,
        node_id: &str,
        hb: &Heartbeat,
        now: Instant,
    ) -> Result<Option<HealthTransition>> {
        let node = registry
            .node_mut(node_id)
            .ok_or_else(|| SchedulerError::NodeNotFound(node_id.to_string()))?;

        node.last_heartbeat = now;
        node.last_heartbeat_at = chrono::Utc::now();
        node.gpu_utilization = hb.gpu_utilization;
        node.memory_utilization = hb.memory_utilization;

        let from = node.health;
        if hb.healthy {
            node.consecutive_failures = 0;
            node.health = NodeHealth::Healthy;
        } else {
            debug!(node_id, "node reported a failed health check");
            self.count_failures(node, 1);
        }

        Ok(transition(node, from))
    }

    /// Count one miss for every full `miss_timeout` a node has been silent.
    ///
    /// The silence clock advances by the windows counted, so a sweep that runs
    /// late still sees every missed window exactly once.
    pub fn sweep(&self, registry: &mut NodeRegistry, now: Instant) -> Vec<HealthTransition> {
        if self.miss_timeout.is_zero() {
            return Vec::new();
        }

        let mut transitions = Vec::new();
        for node in registry.nodes_mut() {
            if node.health == NodeHealth::Offline {
                continue;
            }

            let silent = now.saturating_duration_since(node.last_heartbeat);
            let windows = silent.as_nanos() / self.miss_timeout.as_nanos();
            if windows == 0 {
                continue;
            }
            let misses = u32::try_from(windows).unwrap_or(u32::MAX);

            let from = node.health;
            self.count_failures(node, misses);
            node.last_heartbeat += self.miss_timeout.saturating_mul(misses);

            debug!(
                node_id = node.id(),
                misses,
                consecutive_failures = node.consecutive_failures,
                "heartbeat missed"
            );
            if let Some(t) = transition(node, from) {
                transitions.push(t);
            }
        }
        transitions
    }

    fn count_failures(&self, node: &mut Node, failures: u32) {
        for _ in 0..failures {
            if node.health == NodeHealth::Offline {
                break;
            }
            node.consecutive_failures += 1;
            node.health = if node.consecutive_failures >= self.offline_threshold {
                NodeHealth::Offline
            } else {
                NodeHealth::Degraded
            };
        }
    }
}

fn transition(node: &Node, from: NodeHealth) -> Option<HealthTransition> {
    if node.health == from {
        return None;
    }

    match node.health {
        NodeHealth::Offline => warn!(
            node_id = node.id(),
            failures = node.consecutive_failures,
            "node marked offline"
        ),
        NodeHealth::Degraded => warn!(node_id = node.id(), "node degraded"),
        NodeHealth::Healthy => info!(node_id = node.id(), from = %from, "node recovered"),
    }

    Some(HealthTransition {
        node_id: node.id().to_string(),
        from,
        to: node.health,
        consecutive_failures: node.consecutive_failures,
    })
}
