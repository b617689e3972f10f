use std::collections::BTreeMap;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::info;

use forge_common::{NodeAssignment, NodeHealth, NodeSpec, NodeStatus};

use crate::error::{Result, SchedulerError};

/// Registry-owned state of one compute node.
///
/// `health` and `consecutive_failures` are written by the heartbeat monitor only,
/// `assigned` by the allocator only.
#[derive(Debug, Clone)]
pub struct Node {
    pub spec: NodeSpec,
    pub health: NodeHealth,
    pub consecutive_failures: u32,
    pub(crate) assigned: BTreeMap<String, u32>,
    pub last_heartbeat: Instant,
    pub last_heartbeat_at: DateTime<Utc>,
    pub gpu_utilization: f64,
    pub memory_utilization: f64,
}

impl Node {
    fn new(spec: NodeSpec, now: Instant) -> Self {
        Self {
            spec,
            health: NodeHealth::Healthy,
            consecutive_failures: 0,
            assigned: BTreeMap::new(),
            last_heartbeat: now,
            last_heartbeat_at: Utc::now(),
            gpu_utilization: 0.0,
            memory_utilization: 0.0,
        }
    }

    pub fn id(&self) -> &str {
        &self.spec.node_id
    }

    pub fn claimed_gpus(&self) -> u32 {
        self.assigned.values().sum()
    }

    pub fn free_gpus(&self) -> u32 {
        self.spec.gpu_count.saturating_sub(self.claimed_gpus())
    }

    pub fn snapshot(&self) -> NodeStatus {
        NodeStatus {
            node_id: self.spec.node_id.clone(),
            gpu_count: self.spec.gpu_count,
            gpu_type: self.spec.gpu_type.clone(),
            spot: self.spec.spot,
            health: self.health,
            consecutive_failures: self.consecutive_failures,
            free_gpus: self.free_gpus(),
            assigned_runs: self
                .assigned
                .iter()
                .map(|(run_id, gpus)| NodeAssignment {
                    run_id: run_id.clone(),
                    gpus: *gpus,
                })
                .collect(),
            last_heartbeat_ms: self.last_heartbeat_at.timestamp_millis().max(0) as u64,
            gpu_utilization: self.gpu_utilization,
            memory_utilization: self.memory_utilization,
        }
    }
}

/// Source of truth for which nodes exist and how healthy they are.
#[derive(Debug, Default)]
pub struct NodeRegistry {
    nodes: BTreeMap<String, Node>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// New nodes start healthy with their silence clock started at `now`.
    pub fn register(&mut self, spec: NodeSpec, now: Instant) -> Result<String> {
        if spec.node_id.trim().is_empty() {
            return Err(SchedulerError::InvalidRequest(
                "node_id must not be empty".into(),
            ));
        }
        if spec.gpu_count == 0 {
            return Err(SchedulerError::InvalidRequest(format!(
                "node '{}' must have at least one GPU",
                spec.node_id
            )));
        }
        if self.nodes.contains_key(&spec.node_id) {
            return Err(SchedulerError::DuplicateNode(spec.node_id));
        }

        let id = spec.node_id.clone();
        info!(node_id=%id, gpus=spec.gpu_count, gpu_type=%spec.gpu_type, spot=spec.spot, "node registered");
        self.nodes.insert(id.clone(), Node::new(spec, now));
        Ok(id)
    }

    pub fn get(&self, node_id: &str) -> Result<NodeStatus> {
        self.node(node_id)
            .map(Node::snapshot)
            .ok_or_else(|| SchedulerError::NodeNotFound(node_id.to_string()))
    }

    /// Snapshots ordered by node id. Calling again restarts from the first node.
    pub fn list(&self) -> impl Iterator<Item = NodeStatus> + '_ {
        self.nodes.values().map(Node::snapshot)
    }

    pub fn decommission(&mut self, node_id: &str) -> Result<Node> {
        let node = self
            .nodes
            .get(node_id)
            .ok_or_else(|| SchedulerError::NodeNotFound(node_id.to_string()))?;
        if !node.assigned.is_empty() {
            return Err(SchedulerError::NodeBusy {
                node_id: node_id.to_string(),
                runs: node.assigned.len(),
            });
        }

        info!(node_id, "node decommissioned");
        self.nodes
            .remove(node_id)
            .ok_or_else(|| SchedulerError::NodeNotFound(node_id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, node_id: &str) -> Option<&Node> {
        self.nodes.get(node_id)
    }

    pub(crate) fn node_mut(&mut self, node_id: &str) -> Option<&mut Node> {
        self.nodes.get_mut(node_id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> + '_ {
        self.nodes.values()
    }

    pub(crate) fn nodes_mut(&mut self) -> impl Iterator<Item = &mut Node> + '_ {
        self.nodes.values_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(id: &str, gpus: u32) -> NodeSpec {
        NodeSpec {
            node_id: id.to_string(),
            gpu_count: gpus,
            gpu_type: "A100-80GB".to_string(),
            spot: false,
        }
    }

    #[test]
    fn register_and_get() {
        let mut reg = NodeRegistry::new();
        let id = reg.register(spec("node-01", 8), Instant::now()).unwrap();
        assert_eq!(id, "node-01");

        let status = reg.get("node-01").unwrap();
        assert_eq!(status.health, NodeHealth::Healthy);
        assert_eq!(status.free_gpus, 8);
        assert_eq!(status.consecutive_failures, 0);
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut reg = NodeRegistry::new();
        reg.register(spec("node-01", 8), Instant::now()).unwrap();
        let err = reg.register(spec("node-01", 4), Instant::now()).unwrap_err();
        assert_eq!(err, SchedulerError::DuplicateNode("node-01".into()));
    }

    #[test]
    fn rejects_empty_id_and_zero_gpus() {
        let mut reg = NodeRegistry::new();
        assert!(matches!(
            reg.register(spec("", 8), Instant::now()),
            Err(SchedulerError::InvalidRequest(_))
        ));
        assert!(matches!(
            reg.register(spec("node-01", 0), Instant::now()),
            Err(SchedulerError::InvalidRequest(_))
        ));
    }

    #[test]
    fn list_is_ordered_and_restartable() {
        let mut reg = NodeRegistry::new();
        for id in ["node-03", "node-01", "node-02"] {
            reg.register(spec(id, 4), Instant::now()).unwrap();
        }
        let first: Vec<_> = reg.list().map(|n| n.node_id).collect();
        assert_eq!(first, vec!["node-01", "node-02", "node-03"]);

        let mut it = reg.list();
        assert_eq!(it.next().unwrap().node_id, "node-01");
        drop(it);
        assert_eq!(reg.list().count(), 3);
    }

    #[test]
    fn decommission_requires_no_assignments() {
        let mut reg = NodeRegistry::new();
        reg.register(spec("node-01", 8), Instant::now()).unwrap();
        reg.node_mut("node-01")
            .unwrap()
            .assigned
            .insert("run-a".into(), 2);

        let err = reg.decommission("node-01").unwrap_err();
        assert!(matches!(err, SchedulerError::NodeBusy { runs: 1, .. }));

        reg.node_mut("node-01").unwrap().assigned.clear();
        reg.decommission("node-01").unwrap();
        assert!(matches!(
            reg.get("node-01"),
            Err(SchedulerError::NodeNotFound(_))
        ));
    }
}
