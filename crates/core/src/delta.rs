//! Delta calculation: which synchronization action a content type needs.
//!
//! [`DeltaCalculator`] is a pure function of the current hashes and the
//! stored [`SyncState`]; it never touches persistence.

use serde::{Deserialize, Serialize};

use crate::errors::SyncError;
use crate::models::SyncState;

/// Synchronization action decided from hash comparison.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncAction {
    InitialSync,
    Push,
    Pull,
    Conflict,
    NoChange,
}

impl SyncAction {
    /// Display string for the action.
    pub fn recommendation(&self) -> &'static str {
        match self {
            Self::InitialSync => "perform initial synchronization",
            Self::Push => "push local changes to remote system",
            Self::Pull => "pull remote changes to local",
            Self::Conflict => "resolve conflicts before synchronizing",
            Self::NoChange => "no synchronization needed",
        }
    }
}

impl std::fmt::Display for SyncAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InitialSync => write!(f, "INITIAL_SYNC"),
            Self::Push => write!(f, "PUSH"),
            Self::Pull => write!(f, "PULL"),
            Self::Conflict => write!(f, "CONFLICT"),
            Self::NoChange => write!(f, "NO_CHANGE"),
        }
    }
}

/// The decided action and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delta {
    pub action: SyncAction,
    pub rationale: String,
}

/// Stateless delta calculator.
pub struct DeltaCalculator;

impl DeltaCalculator {
    /// Decide the action for the current hashes against the stored state.
    ///
    /// A stored hash that was never recorded differs from any current hash.
    pub fn calculate(
        current_local_hash: &str,
        current_remote_hash: &str,
        stored: Option<&SyncState>,
    ) -> Delta {
        let Some(stored) = stored else {
            return Delta {
                action: SyncAction::InitialSync,
                rationale: "no stored sync state for this content type".into(),
            };
        };

        let local_changed = stored.local_hash.as_deref() != Some(current_local_hash);
        let remote_changed = stored.remote_hash.as_deref() != Some(current_remote_hash);

        let (action, rationale) = match (local_changed, remote_changed) {
            (false, false) => (
                SyncAction::NoChange,
                "local and remote hashes match the stored state",
            ),
            (true, false) => (
                SyncAction::Push,
                "local hash differs from the stored state; remote is unchanged",
            ),
            (false, true) => (
                SyncAction::Pull,
                "remote hash differs from the stored state; local is unchanged",
            ),
            (true, true) => (
                SyncAction::Conflict,
                "both local and remote hashes differ from the stored state",
            ),
        };

        Delta {
            action,
            rationale: rationale.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Delta query contract
// ---------------------------------------------------------------------------

/// Request for the delta of one content type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaRequest {
    pub type_key: String,
    pub current_local_hash: String,
    pub current_remote_hash: String,
}

impl DeltaRequest {
    /// Reject requests with a missing type key or hash.
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.type_key.trim().is_empty() {
            return Err(SyncError::validation("type_key", "must not be empty"));
        }
        if self.current_local_hash.trim().is_empty() {
            return Err(SyncError::validation("current_local_hash", "must not be empty"));
        }
        if self.current_remote_hash.trim().is_empty() {
            return Err(SyncError::validation("current_remote_hash", "must not be empty"));
        }
        Ok(())
    }
}

/// Response to a [`DeltaRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaResponse {
    pub delta: Delta,
    pub current_state: Option<SyncState>,
    pub recommendation: String,
}

impl DeltaResponse {
    pub fn new(delta: Delta, current_state: Option<SyncState>) -> Self {
        let recommendation = delta.action.recommendation().to_string();
        Self {
            delta,
            current_state,
            recommendation,
        }
    }
}
