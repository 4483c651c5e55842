//! Read Balancer Module
//!
//! Picks the backend that serves a read from the active set.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::state::Backend;

/// Read routing policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BalancerKind {
    /// Cycle through the active backends
    #[default]
    RoundRobin,
    /// Cycle through the active backends in proportion to their weight
    Weighted,
    /// Pick uniformly at random
    Random,
}

/// Read balancer for distributing queries across active backends
pub struct ReadBalancer {
    kind: BalancerKind,
    /// Round-robin counter for read distribution
    read_counter: AtomicUsize,
}

impl ReadBalancer {
    pub fn new(kind: BalancerKind) -> Self {
        Self {
            kind,
            read_counter: AtomicUsize::new(0),
        }
    }

    pub fn kind(&self) -> BalancerKind {
        self.kind
    }

    /// Choose one of `backends`, or `None` when the slice is empty
    pub fn choose(&self, backends: &[Arc<Backend>]) -> Option<Arc<Backend>> {
        if backends.is_empty() {
            return None;
        }
        let index = match self.kind {
            BalancerKind::RoundRobin => {
                self.read_counter.fetch_add(1, Ordering::Relaxed) % backends.len()
            }
            BalancerKind::Weighted => {
                // Zero weights still get a slot so no active backend starves
                let total: usize = backends.iter().map(|b| b.weight.max(1) as usize).sum();
                let mut slot = self.read_counter.fetch_add(1, Ordering::Relaxed) % total;
                let mut chosen = 0;
                for (i, backend) in backends.iter().enumerate() {
                    let weight = backend.weight.max(1) as usize;
                    if slot < weight {
                        chosen = i;
                        break;
                    }
                    slot -= weight;
                }
                chosen
            }
            BalancerKind::Random => {
                self.read_counter.fetch_add(1, Ordering::Relaxed);
                rand::thread_rng().gen_range(0..backends.len())
            }
        };
        backends.get(index).cloned()
    }

    /// Get stats about the balancer state
    pub fn stats(&self) -> BalancerStats {
        BalancerStats {
            kind: self.kind,
            total_reads_routed: self.read_counter.load(Ordering::Relaxed),
        }
    }
}

/// Statistics about balancer state
#[derive(Debug, Clone, Serialize)]
pub struct BalancerStats {
    pub kind: BalancerKind,
    /// Total reads routed
    pub total_reads_routed: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::DialectKind;

    fn backend(name: &str, weight: u32) -> Arc<Backend> {
        Arc::new(Backend {
            name: name.to_string(),
            url: format!("memory://{}", name),
            dialect: DialectKind::Standard,
            weight,
            schema: None,
        })
    }

    #[test]
    fn test_round_robin() {
        let balancer = ReadBalancer::new(BalancerKind::RoundRobin);
        let backends = vec![backend("db1", 1), backend("db2", 1)];

        let picks: Vec<String> = (0..4)
            .map(|_| balancer.choose(&backends).unwrap().name.clone())
            .collect();
        assert_eq!(picks, vec!["db1", "db2", "db1", "db2"]);
        assert_eq!(balancer.stats().total_reads_routed, 4);
    }

    #[test]
    fn test_weighted() {
        let balancer = ReadBalancer::new(BalancerKind::Weighted);
        let backends = vec![backend("db1", 3), backend("db2", 1)];

        let db1 = (0..8)
            .filter(|_| balancer.choose(&backends).unwrap().name == "db1")
            .count();
        assert_eq!(db1, 6);
    }

    #[test]
    fn test_random_and_empty() {
        let balancer = ReadBalancer::new(BalancerKind::Random);
        assert!(balancer.choose(&[]).is_none());

        let backends = vec![backend("db1", 1), backend("db2", 1)];
        for _ in 0..16 {
            let chosen = balancer.choose(&backends).unwrap();
            assert!(chosen.name == "db1" || chosen.name == "db2");
        }
    }
}
