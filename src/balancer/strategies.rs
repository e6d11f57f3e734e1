use super::worker::WorkerNode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Selection algorithm name, as configured
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    #[default]
    RoundRobin,
    LeastConnections,
    WeightedRoundRobin,
    Hash,
}

impl Algorithm {
    pub const fn as_str(self) -> &'static str {
        match self {
            Algorithm::RoundRobin => "round_robin",
            Algorithm::LeastConnections => "least_connections",
            Algorithm::WeightedRoundRobin => "weighted_round_robin",
            Algorithm::Hash => "hash",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Node selection strategy
///
/// Strategies only choose among the candidates they are given; the pool
/// filters out inactive, saturated and incapable nodes beforehand.
#[derive(Debug, Clone)]
pub enum SelectionStrategy {
    /// Round-robin: cyclic index over the candidates
    RoundRobin(RoundRobinStrategy),
    /// Least connections: fewest active jobs, first in registry order on ties
    LeastConnections,
    /// Weighted round-robin: running position over the total weight
    Weighted(WeightedStrategy),
    /// Hash: sticky mapping of a routing key to a candidate
    Hash(HashStrategy),
}

impl SelectionStrategy {
    pub fn new(algorithm: Algorithm) -> Self {
        match algorithm {
            Algorithm::RoundRobin => SelectionStrategy::RoundRobin(RoundRobinStrategy::new()),
            Algorithm::LeastConnections => SelectionStrategy::LeastConnections,
            Algorithm::WeightedRoundRobin => SelectionStrategy::Weighted(WeightedStrategy::new()),
            Algorithm::Hash => SelectionStrategy::Hash(HashStrategy::new()),
        }
    }

    pub fn algorithm(&self) -> Algorithm {
        match self {
            SelectionStrategy::RoundRobin(_) => Algorithm::RoundRobin,
            SelectionStrategy::LeastConnections => Algorithm::LeastConnections,
            SelectionStrategy::Weighted(_) => Algorithm::WeightedRoundRobin,
            SelectionStrategy::Hash(_) => Algorithm::Hash,
        }
    }

    /// Select a node from the candidates
    pub fn select<'a>(
        &self,
        candidates: &[&'a Arc<WorkerNode>],
        routing_key: Option<&str>,
    ) -> Option<&'a Arc<WorkerNode>> {
        if candidates.is_empty() {
            return None;
        }

        match self {
            SelectionStrategy::RoundRobin(strategy) => strategy.select(candidates),
            SelectionStrategy::LeastConnections => Self::select_least_connections(candidates),
            SelectionStrategy::Weighted(strategy) => strategy.select(candidates),
            SelectionStrategy::Hash(strategy) => strategy.select(candidates, routing_key),
        }
    }

    /// Select node with least active jobs
    fn select_least_connections<'a>(candidates: &[&'a Arc<WorkerNode>]) -> Option<&'a Arc<WorkerNode>> {
        // min_by_key keeps the first minimum, so ties follow registry order
        candidates.iter().min_by_key(|n| n.active_jobs()).copied()
    }
}

/// Round-robin strategy state
#[derive(Debug, Clone)]
pub struct RoundRobinStrategy {
    counter: Arc<AtomicUsize>,
}

impl RoundRobinStrategy {
    pub fn new() -> Self {
        Self {
            counter: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn select<'a>(&self, candidates: &[&'a Arc<WorkerNode>]) -> Option<&'a Arc<WorkerNode>> {
        if candidates.is_empty() {
            return None;
        }

        let index = self.counter.fetch_add(1, Ordering::Relaxed) % candidates.len();
        candidates.get(index).copied()
    }
}

impl Default for RoundRobinStrategy {
    fn default() -> Self {
        Self::new()
    }
}

/// Weighted round-robin strategy state
#[derive(Debug, Clone)]
pub struct WeightedStrategy {
    counter: Arc<AtomicUsize>,
}

impl WeightedStrategy {
    pub fn new() -> Self {
        Self {
            counter: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn select<'a>(&self, candidates: &[&'a Arc<WorkerNode>]) -> Option<&'a Arc<WorkerNode>> {
        if candidates.is_empty() {
            return None;
        }

        let total_weight: u64 = candidates.iter().map(|n| u64::from(n.weight())).sum();
        let counter = self.counter.fetch_add(1, Ordering::Relaxed) as u64;

        if total_weight == 0 {
            // All weights zero: plain round-robin
            let index = (counter % candidates.len() as u64) as usize;
            return candidates.get(index).copied();
        }

        let position = counter % total_weight;
        let mut cumulative = 0u64;
        for node in candidates {
            cumulative += u64::from(node.weight());
            if position < cumulative {
                return Some(node);
            }
        }

        candidates.first().copied()
    }
}

impl Default for WeightedStrategy {
    fn default() -> Self {
        Self::new()
    }
}

/// Hash strategy state
///
/// Without a routing key there is nothing to stick to, so selection falls
/// back to round-robin.
#[derive(Debug, Clone, Default)]
pub struct HashStrategy {
    fallback: RoundRobinStrategy,
}

impl HashStrategy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stable 64-bit digest of a routing key
    pub fn hash_key(key: &str) -> u64 {
        let digest = Sha256::digest(key.as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        u64::from_be_bytes(prefix)
    }

    fn select<'a>(
        &self,
        candidates: &[&'a Arc<WorkerNode>],
        routing_key: Option<&str>,
    ) -> Option<&'a Arc<WorkerNode>> {
        match routing_key {
            Some(key) => {
                let index = (Self::hash_key(key) % candidates.len() as u64) as usize;
                candidates.get(index).copied()
            }
            None => self.fallback.select(candidates),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balancer::worker::WorkerSpec;
    use std::collections::HashMap;

    fn create_nodes(weights: &[u32]) -> Vec<Arc<WorkerNode>> {
        weights
            .iter()
            .enumerate()
            .map(|(i, weight)| {
                Arc::new(WorkerNode::new(WorkerSpec {
                    id: format!("worker-{}", i),
                    host: "127.0.0.1".to_string(),
                    port: 9000 + i as u16,
                    max_jobs: 10,
                    capabilities: vec![],
                    weight: *weight,
                    managed: false,
                }))
            })
            .collect()
    }

    fn refs(nodes: &[Arc<WorkerNode>]) -> Vec<&Arc<WorkerNode>> {
        nodes.iter().collect()
    }

    #[test]
    fn test_round_robin() {
        let nodes = create_nodes(&[1, 1, 1]);
        let candidates = refs(&nodes);
        let strategy = SelectionStrategy::new(Algorithm::RoundRobin);

        let picks: Vec<&str> = (0..4)
            .map(|_| strategy.select(&candidates, None).unwrap().id())
            .collect();
        assert_eq!(picks, vec!["worker-0", "worker-1", "worker-2", "worker-0"]);
    }

    #[test]
    fn test_least_connections() {
        let nodes = create_nodes(&[1, 1, 1]);
        let candidates = refs(&nodes);
        let strategy = SelectionStrategy::new(Algorithm::LeastConnections);

        // All idle: first in registry order
        assert_eq!(strategy.select(&candidates, None).unwrap().id(), "worker-0");

        let _a = nodes[0].try_begin_job().unwrap();
        let _b = nodes[0].try_begin_job().unwrap();
        let _c = nodes[1].try_begin_job().unwrap();
        assert_eq!(strategy.select(&candidates, None).unwrap().id(), "worker-2");

        let _d = nodes[2].try_begin_job().unwrap();
        assert_eq!(strategy.select(&candidates, None).unwrap().id(), "worker-1");
    }

    #[test]
    fn test_weighted_strategy() {
        let nodes = create_nodes(&[1, 2, 3]);
        let candidates = refs(&nodes);
        let strategy = SelectionStrategy::new(Algorithm::WeightedRoundRobin);

        let mut selections = HashMap::new();
        for _ in 0..60 {
            let selected = strategy.select(&candidates, None).unwrap();
            *selections.entry(selected.id().to_string()).or_insert(0) += 1;
        }

        assert_eq!(selections.get("worker-0"), Some(&10));
        assert_eq!(selections.get("worker-1"), Some(&20));
        assert_eq!(selections.get("worker-2"), Some(&30));
    }

    #[test]
    fn test_weighted_all_zero_falls_back() {
        let nodes = create_nodes(&[0, 0]);
        let candidates = refs(&nodes);
        let strategy = SelectionStrategy::new(Algorithm::WeightedRoundRobin);

        assert_eq!(strategy.select(&candidates, None).unwrap().id(), "worker-0");
        assert_eq!(strategy.select(&candidates, None).unwrap().id(), "worker-1");
    }

    #[test]
    fn test_hash_is_sticky() {
        let nodes = create_nodes(&[1, 1, 1, 1]);
        let candidates = refs(&nodes);
        let strategy = SelectionStrategy::new(Algorithm::Hash);

        let first = strategy.select(&candidates, Some("203.0.113.7")).unwrap().id().to_string();
        for _ in 0..20 {
            let again = strategy.select(&candidates, Some("203.0.113.7")).unwrap();
            assert_eq!(again.id(), first);
        }
    }

    #[test]
    fn test_hash_key_is_stable() {
        assert_eq!(HashStrategy::hash_key("client-a"), HashStrategy::hash_key("client-a"));
        assert_ne!(HashStrategy::hash_key("client-a"), HashStrategy::hash_key("client-b"));
    }

    #[test]
    fn test_hash_without_key_rotates() {
        let nodes = create_nodes(&[1, 1]);
        let candidates = refs(&nodes);
        let strategy = SelectionStrategy::new(Algorithm::Hash);

        assert_eq!(strategy.select(&candidates, None).unwrap().id(), "worker-0");
        assert_eq!(strategy.select(&candidates, None).unwrap().id(), "worker-1");
    }

    #[test]
    fn test_empty_candidates() {
        let strategy = SelectionStrategy::new(Algorithm::LeastConnections);
        assert!(strategy.select(&[], None).is_none());
    }

    #[test]
    fn test_algorithm_round_trips_name() {
        for algorithm in [
            Algorithm::RoundRobin,
            Algorithm::LeastConnections,
            Algorithm::WeightedRoundRobin,
            Algorithm::Hash,
        ] {
            assert_eq!(SelectionStrategy::new(algorithm).algorithm(), algorithm);
        }
    }
}
