use std::collections::{BTreeSet, HashMap};

/// Ordering key: lower priority value first, then submission order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct QueueKey {
    priority: i32,
    seq: u64,
    run_id: String,
}

/// Pending runs in admission order.
#[derive(Debug, Default)]
pub struct RunQueue {
    ordered: BTreeSet<QueueKey>,
    index: HashMap<String, QueueKey>,
}

impl RunQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-pushing a queued run keeps a single entry with the new key.
    pub fn push(&mut self, run_id: &str, priority: i32, seq: u64) {
        self.remove(run_id);
        let key = QueueKey {
            priority,
            seq,
            run_id: run_id.to_string(),
        };
        self.ordered.insert(key.clone());
        self.index.insert(run_id.to_string(), key);
    }

    pub fn remove(&mut self, run_id: &str) -> bool {
        match self.index.remove(run_id) {
            Some(key) => self.ordered.remove(&key),
            None => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> + '_ {
        self.ordered.iter().map(|k| k.run_id.as_str())
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orders_by_priority_then_fifo() {
        let mut q = RunQueue::new();
        q.push("low", 5, 1);
        q.push("urgent", 0, 4);
        q.push("first", 1, 2);
        q.push("second", 1, 3);

        let order: Vec<_> = q.iter().collect();
        assert_eq!(order, vec!["urgent", "first", "second", "low"]);
    }

    #[test]
    fn remove_and_repush() {
        let mut q = RunQueue::new();
        q.push("a", 1, 1);
        q.push("b", 1, 2);
        assert!(q.remove("a"));
        assert!(!q.remove("a"));
        assert_eq!(q.len(), 1);

        q.push("b", 0, 2);
        q.push("b", 0, 2);
        assert_eq!(q.len(), 1);
        assert_eq!(q.iter().collect::<Vec<_>>(), vec!["b"]);
    }
}
