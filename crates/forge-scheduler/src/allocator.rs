use std::collections::HashMap;

use tracing::{debug, info};

use forge_common::NodeHealth;

use crate::error::{Result, SchedulerError};
use crate::registry::NodeRegistry;

/// A healthy node with enough free GPUs, presented to the placement strategy.
pub struct Candidate<'a> {
    pub node_id: &'a str,
    pub free_gpus: u32,
    pub spot: bool,
}

/// Trait for pluggable placement strategies.
/// The allocator filters candidates (healthy, enough free GPUs) and delegates the pick.
pub trait PlacementStrategy: Send + Sync {
    /// Returns the index into `candidates`.
    fn select(&self, candidates: &[Candidate], requested: u32) -> Option<usize>;

    fn name(&self) -> &'static str;
}

// ---------------------------------------------------------------------------
// BestFit: smallest sufficient free capacity, spot before on-demand, then node id
// ---------------------------------------------------------------------------

pub struct BestFit;

impl PlacementStrategy for BestFit {
    fn select(&self, candidates: &[Candidate], requested: u32) -> Option<usize> {
        candidates
            .iter()
            .enumerate()
            .filter(|(_, c)| c.free_gpus >= requested)
            .min_by(|(_, a), (_, b)| {
                a.free_gpus
                    .cmp(&b.free_gpus)
                    .then(b.spot.cmp(&a.spot))
                    .then(a.node_id.cmp(b.node_id))
            })
            .map(|(i, _)| i)
    }

    fn name(&self) -> &'static str {
        "best_fit"
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub node_id: String,
    pub gpus: u32,
}

/// A run whose node went away underneath it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunInterrupted {
    pub run_id: String,
    pub node_id: String,
    pub gpus: u32,
}

/// Owns run → node placements and mirrors them into `Node::assigned`.
pub struct Allocator {
    strategy: Box<dyn PlacementStrategy>,
    placements: HashMap<String, Placement>,
}

impl Default for Allocator {
    fn default() -> Self {
        Self::new(Box::new(BestFit))
    }
}

impl std::fmt::Debug for Allocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Allocator")
            .field("strategy", &self.strategy.name())
            .field("placements", &self.placements)
            .finish()
    }
}

impl Allocator {
    pub fn new(strategy: Box<dyn PlacementStrategy>) -> Self {
        Self {
            strategy,
            placements: HashMap::new(),
        }
    }

    /// Place `run_id` on a healthy node. A run that is already placed keeps its node.
    pub fn allocate(
        &mut self,
        registry: &mut NodeRegistry,
        run_id: &str,
        gpus: u32,
    ) -> Result<String> {
        if let Some(existing) = self.placements.get(run_id) {
            return Ok(existing.node_id.clone());
        }

        let candidates: Vec<Candidate> = registry
            .nodes()
            .filter(|n| n.health == NodeHealth::Healthy && n.free_gpus() >= gpus)
            .map(|n| Candidate {
                node_id: n.id(),
                free_gpus: n.free_gpus(),
                spot: n.spec.spot,
            })
            .collect();

        let Some(idx) = self.strategy.select(&candidates, gpus) else {
            debug!(run_id, gpus, "no node can take run yet");
            return Err(SchedulerError::InsufficientCapacity { requested: gpus });
        };
        let node_id = candidates[idx].node_id.to_string();
        drop(candidates);

        let node = registry
            .node_mut(&node_id)
            .ok_or_else(|| SchedulerError::NodeNotFound(node_id.clone()))?;
        node.assigned.insert(run_id.to_string(), gpus);

        info!(run_id, node_id=%node_id, gpus, strategy = self.strategy.name(), "gpus allocated");
        self.placements.insert(
            run_id.to_string(),
            Placement {
                node_id: node_id.clone(),
                gpus,
            },
        );
        Ok(node_id)
    }

    /// Idempotent: releasing an unplaced run returns `None`.
    pub fn release(&mut self, registry: &mut NodeRegistry, run_id: &str) -> Option<Placement> {
        let placement = self.placements.remove(run_id)?;
        if let Some(node) = registry.node_mut(&placement.node_id) {
            node.assigned.remove(run_id);
        }
        debug!(run_id, node_id=%placement.node_id, gpus=placement.gpus, "gpus released");
        Some(placement)
    }

    /// Drop every placement on `node_id` in one step and report each affected run.
    pub fn reclaim_node(
        &mut self,
        registry: &mut NodeRegistry,
        node_id: &str,
    ) -> Vec<RunInterrupted> {
        let Some(node) = registry.node_mut(node_id) else {
            return Vec::new();
        };

        let interrupted: Vec<RunInterrupted> = std::mem::take(&mut node.assigned)
            .into_iter()
            .map(|(run_id, gpus)| RunInterrupted {
                run_id,
                node_id: node_id.to_string(),
                gpus,
            })
            .collect();

        for run in &interrupted {
            self.placements.remove(&run.run_id);
        }
        if !interrupted.is_empty() {
            info!(node_id, runs = interrupted.len(), "reclaimed gpus from failed node");
        }
        interrupted
    }

    pub fn placement(&self, run_id: &str) -> Option<&Placement> {
        self.placements.get(run_id)
    }

    pub fn free_on(&self, registry: &NodeRegistry, node_id: &str) -> Result<u32> {
        registry
            .node(node_id)
            .map(|n| n.free_gpus())
            .ok_or_else(|| SchedulerError::NodeNotFound(node_id.to_string()))
    }

    /// Free GPUs on healthy nodes only.
    pub fn total_free(&self, registry: &NodeRegistry) -> u32 {
        registry
            .nodes()
            .filter(|n| n.health == NodeHealth::Healthy)
            .map(|n| n.free_gpus())
            .sum()
    }

    /// Largest single-node GPU count among registered nodes, whatever their health.
    pub fn largest_node(&self, registry: &NodeRegistry) -> u32 {
        registry
            .nodes()
            .map(|n| n.spec.gpu_count)
            .max()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use forge_common::NodeSpec;

    fn cluster(nodes: &[(&str, u32, bool)]) -> NodeRegistry {
        let mut reg = NodeRegistry::new();
        for (id, gpus, spot) in nodes {
            reg.register(
                NodeSpec {
                    node_id: id.to_string(),
                    gpu_count: *gpus,
                    gpu_type: "A100".into(),
                    spot: *spot,
                },
                Instant::now(),
            )
            .unwrap();
        }
        reg
    }

    fn candidate(node_id: &str, free_gpus: u32, spot: bool) -> Candidate<'_> {
        Candidate {
            node_id,
            free_gpus,
            spot,
        }
    }

    #[test]
    fn best_fit_prefers_smallest_sufficient() {
        let c = vec![
            candidate("a", 8, false),
            candidate("b", 4, false),
            candidate("c", 2, false),
        ];
        assert_eq!(BestFit.select(&c, 3), Some(1));
        assert_eq!(BestFit.select(&c, 2), Some(2));
        assert_eq!(BestFit.select(&c, 9), None);
    }

    #[test]
    fn best_fit_breaks_ties_spot_then_id() {
        let c = vec![
            candidate("b", 4, false),
            candidate("c", 4, true),
            candidate("a", 4, false),
        ];
        assert_eq!(BestFit.select(&c, 4), Some(1));

        let c = vec![candidate("b", 4, false), candidate("a", 4, false)];
        assert_eq!(BestFit.select(&c, 4), Some(1));
    }

    #[test]
    fn allocate_avoids_fragmenting_large_nodes() {
        let mut reg = cluster(&[("node-01", 8, false), ("node-03", 4, false)]);
        let mut alloc = Allocator::default();

        assert_eq!(alloc.allocate(&mut reg, "small", 4).unwrap(), "node-03");
        assert_eq!(alloc.allocate(&mut reg, "big", 8).unwrap(), "node-01");
        assert_eq!(alloc.total_free(&reg), 0);
    }

    #[test]
    fn allocate_is_idempotent_per_run() {
        let mut reg = cluster(&[("node-01", 8, false)]);
        let mut alloc = Allocator::default();
        alloc.allocate(&mut reg, "r1", 2).unwrap();
        alloc.allocate(&mut reg, "r1", 2).unwrap();
        assert_eq!(alloc.free_on(&reg, "node-01").unwrap(), 6);
    }

    #[test]
    fn skips_unhealthy_nodes() {
        let mut reg = cluster(&[("node-01", 8, false), ("node-02", 8, false)]);
        reg.node_mut("node-01").unwrap().health = NodeHealth::Degraded;
        reg.node_mut("node-02").unwrap().health = NodeHealth::Offline;
        let mut alloc = Allocator::default();

        let err = alloc.allocate(&mut reg, "r1", 1).unwrap_err();
        assert_eq!(err, SchedulerError::InsufficientCapacity { requested: 1 });
        assert_eq!(alloc.total_free(&reg), 0);
        assert_eq!(alloc.largest_node(&reg), 8);
    }

    #[test]
    fn release_is_idempotent() {
        let mut reg = cluster(&[("node-01", 8, false)]);
        let mut alloc = Allocator::default();
        alloc.allocate(&mut reg, "r1", 3).unwrap();

        assert!(alloc.release(&mut reg, "r1").is_some());
        assert!(alloc.release(&mut reg, "r1").is_none());
        assert_eq!(alloc.free_on(&reg, "node-01").unwrap(), 8);
    }

    #[test]
    fn reclaim_reports_every_run() {
        let mut reg = cluster(&[("node-01", 8, false), ("node-02", 8, false)]);
        let mut alloc = Allocator::default();
        alloc.allocate(&mut reg, "r1", 4).unwrap();
        alloc.allocate(&mut reg, "r2", 4).unwrap();
        alloc.allocate(&mut reg, "r3", 8).unwrap();

        let victim = alloc.placement("r1").unwrap().node_id.clone();
        let mut interrupted = alloc.reclaim_node(&mut reg, &victim);
        interrupted.sort_by(|a, b| a.run_id.cmp(&b.run_id));

        assert_eq!(interrupted.len(), 2);
        assert_eq!(interrupted[0].run_id, "r1");
        assert_eq!(interrupted[1].run_id, "r2");
        assert_eq!(alloc.free_on(&reg, &victim).unwrap(), 8);
        assert!(alloc.placement("r1").is_none());
        assert!(alloc.placement("r3").is_some());
    }

    #[test]
    fn claimed_never_exceeds_total() {
        let mut reg = cluster(&[("node-01", 8, false), ("node-02", 4, true)]);
        let mut alloc = Allocator::default();
        for i in 0..20 {
            let _ = alloc.allocate(&mut reg, &format!("r{i}"), (i % 3) + 1);
            for node in reg.nodes() {
                assert!(node.claimed_gpus() <= node.spec.gpu_count);
            }
        }
    }
}
