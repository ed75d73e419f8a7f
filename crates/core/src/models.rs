//! Domain model types used throughout ContentSync.
//!
//! These types bridge the sync engine, the database layer and the CLI.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{DatabaseError, SyncError};

// ---------------------------------------------------------------------------
// Sync status
// ---------------------------------------------------------------------------

/// Lifecycle status of one content type.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    New,
    Pending,
    Syncing,
    Modified,
    InSync,
    Failed,
}

impl SyncStatus {
    pub const ALL: [SyncStatus; 6] = [
        Self::New,
        Self::Pending,
        Self::Syncing,
        Self::Modified,
        Self::InSync,
        Self::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Pending => "pending",
            Self::Syncing => "syncing",
            Self::Modified => "modified",
            Self::InSync => "in_sync",
            Self::Failed => "failed",
        }
    }

    /// Statuses that still need a synchronization pass.
    pub fn is_pending_sync(&self) -> bool {
        matches!(self, Self::Pending | Self::New | Self::Modified)
    }

    /// Whether the state machine allows moving from `self` to `to`.
    ///
    /// `modified -> in_sync` additionally requires a resolved conflict, so
    /// the current conflict status is part of the check.
    pub fn can_transition_to(&self, to: SyncStatus, conflict: ConflictStatus) -> bool {
        use SyncStatus::*;

        if *self == to {
            return true;
        }
        match (self, to) {
            (New, Pending) => true,
            (Pending, Syncing) => true,
            (Syncing, InSync | Failed | Modified) => true,
            (InSync, Modified) => true,
            (Failed | Modified, Syncing) => true,
            (Modified, InSync) => conflict == ConflictStatus::Resolved,
            (Pending | Modified, Failed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = DatabaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| DatabaseError::CorruptValue {
                column: "sync_status".into(),
                value: s.to_string(),
            })
    }
}

// ---------------------------------------------------------------------------
// Conflict status
// ---------------------------------------------------------------------------

/// Whether a content type has an outstanding conflict.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStatus {
    None,
    Detected,
    Resolved,
}

impl ConflictStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Detected => "detected",
            Self::Resolved => "resolved",
        }
    }
}

impl std::fmt::Display for ConflictStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictStatus {
    type Err = DatabaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "detected" => Ok(Self::Detected),
            "resolved" => Ok(Self::Resolved),
            other => Err(DatabaseError::CorruptValue {
                column: "conflict_status".into(),
                value: other.to_string(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Sync state
// ---------------------------------------------------------------------------

/// Persisted bookkeeping for one content type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    pub id: i64,
    pub type_key: String,
    pub local_hash: Option<String>,
    pub remote_hash: Option<String>,
    pub last_synced_hash: Option<String>,
    /// Hash both sides were last confirmed to hold. Only a completed sync
    /// sets it; a resolved conflict moves `last_synced_hash` ahead of it.
    #[serde(default)]
    pub confirmed_hash: Option<String>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub sync_status: SyncStatus,
    pub conflict_status: ConflictStatus,
    /// Orchestrator-owned progress payload, stored verbatim.
    pub sync_progress: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SyncState {
    /// A fresh, never-synced state.
    pub fn new(type_key: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            type_key: type_key.into(),
            local_hash: None,
            remote_hash: None,
            last_synced_hash: None,
            confirmed_hash: None,
            last_sync_at: None,
            sync_status: SyncStatus::New,
            conflict_status: ConflictStatus::None,
            sync_progress: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Check the cross-field invariants of a state about to be written.
    pub fn check_invariants(&self) -> Result<(), SyncError> {
        if self.conflict_status == ConflictStatus::Detected
            && self.sync_status != SyncStatus::Modified
        {
            return Err(SyncError::validation(
                "conflict_status",
                format!(
                    "a detected conflict requires status modified, found {}",
                    self.sync_status
                ),
            ));
        }
        if self.sync_status == SyncStatus::InSync {
            let agreed = self.local_hash.is_some()
                && self.local_hash == self.remote_hash
                && self.local_hash == self.last_synced_hash;
            if !agreed {
                return Err(SyncError::validation(
                    "sync_status",
                    "in_sync requires local, remote and last synced hashes to be equal",
                ));
            }
        }
        Ok(())
    }
}

/// A partial update to a [`SyncState`]. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncStateUpdate {
    pub local_hash: Option<String>,
    pub remote_hash: Option<String>,
    pub last_synced_hash: Option<String>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub sync_status: Option<SyncStatus>,
    pub conflict_status: Option<ConflictStatus>,
    pub sync_progress: Option<Value>,
}

impl SyncStateUpdate {
    /// Apply the set fields onto `state`.
    pub fn apply_to(&self, state: &mut SyncState) {
        if let Some(hash) = &self.local_hash {
            state.local_hash = Some(hash.clone());
        }
        if let Some(hash) = &self.remote_hash {
            state.remote_hash = Some(hash.clone());
        }
        if let Some(hash) = &self.last_synced_hash {
            state.last_synced_hash = Some(hash.clone());
        }
        if let Some(at) = self.last_sync_at {
            state.last_sync_at = Some(at);
        }
        if let Some(status) = self.sync_status {
            state.sync_status = status;
        }
        if let Some(status) = self.conflict_status {
            state.conflict_status = status;
        }
        if let Some(progress) = &self.sync_progress {
            state.sync_progress = Some(progress.clone());
        }
    }
}

// ---------------------------------------------------------------------------
// Conflict log
// ---------------------------------------------------------------------------

/// Conflict type recorded for rollbacks of a partial sync.
pub const PARTIAL_SYNC_ROLLBACK: &str = "partial_sync_rollback";

/// One row of the append-only conflict log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictLogEntry {
    pub id: i64,
    pub type_key: String,
    pub local_hash: Option<String>,
    pub remote_hash: Option<String>,
    pub ancestor_hash: Option<String>,
    pub conflict_type: String,
    pub conflict_details: Value,
    pub resolution: Option<Value>,
    pub resolved_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ConflictLogEntry {
    pub fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }
}

/// Fields supplied when appending a conflict-log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewConflictLogEntry {
    pub type_key: String,
    pub local_hash: Option<String>,
    pub remote_hash: Option<String>,
    pub ancestor_hash: Option<String>,
    pub conflict_type: String,
    pub conflict_details: Value,
}

/// Filter for listing the conflict log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConflictLogFilter {
    pub type_key: Option<String>,
    pub unresolved_only: bool,
    pub limit: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip_through_strings() {
        for status in SyncStatus::ALL {
            assert_eq!(status.as_str().parse::<SyncStatus>().unwrap(), status);
        }
        assert!("stalled".parse::<SyncStatus>().is_err());
        assert_eq!("detected".parse::<ConflictStatus>().unwrap(), ConflictStatus::Detected);
    }

    #[test]
    fn test_transitions() {
        use SyncStatus::*;
        let none = ConflictStatus::None;

        assert!(New.can_transition_to(Pending, none));
        assert!(Pending.can_transition_to(Syncing, none));
        assert!(Syncing.can_transition_to(InSync, none));
        assert!(Syncing.can_transition_to(Modified, none));
        assert!(InSync.can_transition_to(Modified, none));
        assert!(Failed.can_transition_to(Syncing, none));
        assert!(Modified.can_transition_to(Syncing, none));

        assert!(!New.can_transition_to(InSync, none));
        assert!(!New.can_transition_to(Syncing, none));
        assert!(!InSync.can_transition_to(Pending, none));
        assert!(!Failed.can_transition_to(InSync, none));

        assert!(!Modified.can_transition_to(InSync, ConflictStatus::Detected));
        assert!(!Modified.can_transition_to(InSync, none));
        assert!(Modified.can_transition_to(InSync, ConflictStatus::Resolved));
    }

    #[test]
    fn test_invariants() {
        let mut state = SyncState::new("articles");
        state.check_invariants().unwrap();

        state.conflict_status = ConflictStatus::Detected;
        assert!(state.check_invariants().is_err());
        state.sync_status = SyncStatus::Modified;
        state.check_invariants().unwrap();

        state.conflict_status = ConflictStatus::None;
        state.sync_status = SyncStatus::InSync;
        state.local_hash = Some("h".into());
        state.remote_hash = Some("h".into());
        assert!(state.check_invariants().is_err());
        state.last_synced_hash = Some("h".into());
        state.check_invariants().unwrap();
    }

    #[test]
    fn test_update_applies_only_set_fields() {
        let mut state = SyncState::new("pages");
        state.local_hash = Some("a".into());
        let update = SyncStateUpdate {
            remote_hash: Some("b".into()),
            sync_status: Some(SyncStatus::Pending),
            ..Default::default()
        };
        update.apply_to(&mut state);
        assert_eq!(state.local_hash.as_deref(), Some("a"));
        assert_eq!(state.remote_hash.as_deref(), Some("b"));
        assert_eq!(state.sync_status, SyncStatus::Pending);
    }

    #[test]
    fn test_status_serde_names() {
        assert_eq!(serde_json::to_string(&SyncStatus::InSync).unwrap(), "\"in_sync\"");
        assert_eq!(serde_json::to_string(&ConflictStatus::None).unwrap(), "\"none\"");
    }
}
