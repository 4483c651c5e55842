//! Synchronization Module
//!
//! Brings an inactive backend back in line with an active reference backend
//! and returns it to the active set. The structural part (constraints and
//! sequences present on one side only) is computed up front as a
//! [`SynchronizationPlan`]; row data is reconciled per [`SyncStrategy`].

mod engine;
mod plan;
mod reconcile;

use serde::{Deserialize, Serialize};

pub use engine::SyncEngine;
pub use plan::{PlanStep, SynchronizationPlan};
pub use reconcile::TableReport;

/// How row data is reconciled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncStrategy {
    /// Truncate every target table and copy all reference rows
    #[default]
    FullCopy,
    /// Compare rows by primary key and hash; write only the differences
    Diff,
    /// Data is replicated externally; only verify it matches
    Passive,
}

impl SyncStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStrategy::FullCopy => "full-copy",
            SyncStrategy::Diff => "diff",
            SyncStrategy::Passive => "passive",
        }
    }
}

impl std::fmt::Display for SyncStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SyncStrategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "full-copy" | "full" => Ok(SyncStrategy::FullCopy),
            "diff" => Ok(SyncStrategy::Diff),
            "passive" => Ok(SyncStrategy::Passive),
            other => Err(format!("unknown sync strategy: {}", other)),
        }
    }
}

/// Step of a synchronization, reported when it fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncStep {
    Lock,
    Transition,
    Snapshot,
    Compare,
    DropConstraints,
    Data,
    RestoreConstraints,
    Sequences,
    Verify,
    Activate,
}

impl SyncStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStep::Lock => "lock",
            SyncStep::Transition => "transition",
            SyncStep::Snapshot => "snapshot",
            SyncStep::Compare => "compare",
            SyncStep::DropConstraints => "drop-constraints",
            SyncStep::Data => "data",
            SyncStep::RestoreConstraints => "restore-constraints",
            SyncStep::Sequences => "sequences",
            SyncStep::Verify => "verify",
            SyncStep::Activate => "activate",
        }
    }
}

impl std::fmt::Display for SyncStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Summary of a successful synchronization
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub backend: String,
    pub reference: String,
    pub strategy: SyncStrategy,
    /// Structural plan steps applied
    pub structural_changes: usize,
    pub tables: Vec<TableReport>,
    pub sequences_reset: usize,
    pub duration_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_names() {
        for strategy in [SyncStrategy::FullCopy, SyncStrategy::Diff, SyncStrategy::Passive] {
            assert_eq!(strategy.as_str().parse::<SyncStrategy>(), Ok(strategy));
        }
        assert!("mirror".parse::<SyncStrategy>().is_err());
        assert_eq!(SyncStrategy::default(), SyncStrategy::FullCopy);
    }

    #[test]
    fn test_step_display() {
        assert_eq!(SyncStep::DropConstraints.to_string(), "drop-constraints");
        assert_eq!(SyncStep::Verify.to_string(), "verify");
    }
}
