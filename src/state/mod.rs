//! State Management Module
//!
//! Backend identity and lifecycle state, plus the persistent store that
//! remembers it across restarts.

mod registry;
mod tracker;

pub use registry::{Backend, BackendRegistry, BackendStatus, StateChange, StateSnapshot};
pub use tracker::{StateTracker, SyncRecord};

use serde::{Deserialize, Serialize};

/// Lifecycle state of a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendState {
    /// Receives every write and is eligible for reads
    Active,
    /// Isolated; receives nothing
    Inactive,
    /// Being brought up to date from an active backend
    Synchronizing,
}

impl BackendState {
    /// Whether `self -> to` is a legal transition
    pub fn can_transition_to(self, to: BackendState) -> bool {
        matches!(
            (self, to),
            (BackendState::Active, BackendState::Inactive)
                | (BackendState::Inactive, BackendState::Synchronizing)
                | (BackendState::Synchronizing, BackendState::Active)
                | (BackendState::Synchronizing, BackendState::Inactive)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendState::Active => "active",
            BackendState::Inactive => "inactive",
            BackendState::Synchronizing => "synchronizing",
        }
    }
}

impl std::fmt::Display for BackendState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for BackendState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "active" => Ok(BackendState::Active),
            "inactive" => Ok(BackendState::Inactive),
            "synchronizing" => Ok(BackendState::Synchronizing),
            other => Err(format!("unknown backend state: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_table() {
        use BackendState::*;
        assert!(Active.can_transition_to(Inactive));
        assert!(Inactive.can_transition_to(Synchronizing));
        assert!(Synchronizing.can_transition_to(Active));
        assert!(Synchronizing.can_transition_to(Inactive));

        assert!(!Inactive.can_transition_to(Active));
        assert!(!Active.can_transition_to(Synchronizing));
        assert!(!Active.can_transition_to(Active));
    }

    #[test]
    fn test_state_names_round_trip() {
        for state in [
            BackendState::Active,
            BackendState::Inactive,
            BackendState::Synchronizing,
        ] {
            assert_eq!(state.as_str().parse::<BackendState>(), Ok(state));
        }
        assert!("paused".parse::<BackendState>().is_err());
    }
}
