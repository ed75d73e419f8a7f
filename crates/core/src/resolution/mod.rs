//! Conflict resolution strategies and the manager that selects them.
//!
//! The resolution subsystem is responsible for:
//! 1. **Input** -- [`ContentConflict`], a record-level bundle of a three-way
//!    diff that every strategy consumes without mutating.
//! 2. **Strategies** -- named [`ResolutionStrategy`] implementations that turn
//!    a conflict into a [`Resolution`] or a manual-resolution request.
//! 3. **Selection** -- [`ResolutionStrategyManager`] picks a strategy and
//!    converts every failure into a structured result.

pub mod auto_merge;
pub mod manager;
pub mod manual_merge;
pub mod strategies;

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::diff::{Changes, Conflict, DiffResult, Snapshot};
use crate::errors::ResolutionError;

pub use auto_merge::AutoMerge;
pub use manager::ResolutionStrategyManager;
pub use manual_merge::{apply_manual_choices, ManualChoice, ManualMerge};
pub use strategies::{LocalWins, RemoteWins, BUILTIN_STRATEGY_NAMES};

// ---------------------------------------------------------------------------
// Input
// ---------------------------------------------------------------------------

/// A content record in conflict, as handed to a strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentConflict {
    pub local: Snapshot,
    pub remote: Snapshot,
    pub ancestor: Snapshot,
    pub local_changes: Changes,
    pub remote_changes: Changes,
    /// Field-level conflicts found by the diff engine.
    pub conflicts: Vec<Conflict>,
    /// Set by callers whose record shape changed in a way that makes
    /// whole-side replacement unsafe.
    #[serde(default)]
    pub structural: bool,
}

impl ContentConflict {
    pub fn from_diff(diff: &DiffResult) -> Self {
        Self {
            local: diff.local.clone(),
            remote: diff.remote.clone(),
            ancestor: diff.ancestor.clone(),
            local_changes: diff.local_changes.clone(),
            remote_changes: diff.remote_changes.clone(),
            conflicts: diff.conflicts.clone(),
            structural: false,
        }
    }

    pub fn with_structural(mut self, structural: bool) -> Self {
        self.structural = structural;
        self
    }

    /// True when some field was modified on both sides.
    pub fn has_overlapping_changes(&self) -> bool {
        self.local_changes
            .modified
            .keys()
            .any(|field| self.remote_changes.modified.contains_key(field))
    }

    /// Names of the fields under conflict.
    pub fn contested_fields(&self) -> BTreeSet<String> {
        self.conflicts.iter().map(|c| c.field.clone()).collect()
    }
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

/// Which version a resolution settled on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Winner {
    Local,
    Remote,
    Merged,
}

impl std::fmt::Display for Winner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Remote => write!(f, "remote"),
            Self::Merged => write!(f, "merged"),
        }
    }
}

/// Where an applied value came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MergeSource {
    Local,
    Remote,
    Ancestor,
    Manual,
}

impl From<crate::diff::ChangeSource> for MergeSource {
    fn from(source: crate::diff::ChangeSource) -> Self {
        match source {
            crate::diff::ChangeSource::Local => Self::Local,
            crate::diff::ChangeSource::Remote => Self::Remote,
        }
    }
}

/// What an applied change did to a field.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MergeLogAction {
    Add,
    Modify,
    Delete,
}

/// One applied (or discarded) field change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeLogEntry {
    pub field: String,
    pub source: MergeSource,
    pub action: MergeLogAction,
    /// The value written; `None` for deletions.
    pub value: Option<Value>,
}

impl MergeLogEntry {
    /// Flatten a change set into log entries (added, modified, deleted order).
    pub fn from_changes(changes: &Changes, source: MergeSource) -> Vec<Self> {
        let added = changes.added.iter().map(|(field, value)| Self {
            field: field.clone(),
            source,
            action: MergeLogAction::Add,
            value: Some(value.clone()),
        });
        let modified = changes.modified.iter().map(|(field, m)| Self {
            field: field.clone(),
            source,
            action: MergeLogAction::Modify,
            value: Some(m.new_value.clone()),
        });
        let deleted = changes.deleted.keys().map(|field| Self {
            field: field.clone(),
            source,
            action: MergeLogAction::Delete,
            value: None,
        });
        added.chain(modified).chain(deleted).collect()
    }
}

/// A settled conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub winner: Winner,
    /// The resolved field data.
    pub merged: crate::diff::FieldMap,
    /// Changes that went into `merged`.
    pub changes: Vec<MergeLogEntry>,
    pub strategy: String,
    pub timestamp: DateTime<Utc>,
    pub description: String,
    /// Conflicts left untouched by the strategy.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<Conflict>,
    /// Changes the strategy chose not to apply.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub discarded: Vec<MergeLogEntry>,
}

/// The values a human can pick from for one contested field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManualOptions {
    pub local: Option<Value>,
    pub remote: Option<Value>,
    pub ancestor: Option<Value>,
    /// A mechanically merged proposal, when one exists.
    pub custom: Option<Value>,
}

/// Everything a human needs to decide one contested field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManualFieldOptions {
    pub field: String,
    pub conflict_type: crate::diff::ConflictType,
    pub suggestion: crate::diff::ResolutionSuggestion,
    pub options: ManualOptions,
}

/// A structured request for human resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManualResolutionData {
    pub fields: Vec<ManualFieldOptions>,
    pub description: String,
}

/// What a strategy produced.
#[derive(Debug, Clone, PartialEq)]
pub enum StrategyOutput {
    Resolved(Resolution),
    Manual(ManualResolutionData),
}

/// Outcome of [`ResolutionStrategyManager::resolve_conflict`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ResolutionResult {
    Resolved {
        resolution: Resolution,
        strategy_used: String,
        auto_resolved: bool,
    },
    ManualRequired {
        manual_resolution_data: ManualResolutionData,
        strategy_used: String,
    },
    Failed {
        error: String,
        requires_manual: bool,
    },
}

impl ResolutionResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Resolved { .. })
    }

    pub fn requires_manual(&self) -> bool {
        match self {
            Self::Resolved { .. } => false,
            Self::ManualRequired { .. } => true,
            Self::Failed {
                requires_manual, ..
            } => *requires_manual,
        }
    }

    pub fn resolution(&self) -> Option<&Resolution> {
        match self {
            Self::Resolved { resolution, .. } => Some(resolution),
            _ => None,
        }
    }

    pub fn strategy_used(&self) -> Option<&str> {
        match self {
            Self::Resolved { strategy_used, .. } | Self::ManualRequired { strategy_used, .. } => {
                Some(strategy_used)
            }
            Self::Failed { .. } => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Strategy seam
// ---------------------------------------------------------------------------

/// A named policy for turning a conflict into a resolution.
///
/// Implementations are stateless and must not mutate the conflict.
pub trait ResolutionStrategy: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// Whether the strategy resolves conflicts without a human in general.
    fn auto_resolves(&self) -> bool;

    fn can_auto_resolve(&self, conflict: &ContentConflict) -> bool;

    fn resolve(&self, conflict: &ContentConflict) -> Result<StrategyOutput, ResolutionError>;
}

/// Registry listing entry for a strategy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyInfo {
    pub name: String,
    pub auto_resolves: bool,
    pub description: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::ThreeWayDiffEngine;
    use serde_json::json;

    fn conflict(local: Value, remote: Value, ancestor: Value) -> ContentConflict {
        let diff = ThreeWayDiffEngine::compare_versions(
            Some(&Snapshot::from_json(local).unwrap()),
            Some(&Snapshot::from_json(remote).unwrap()),
            Some(&Snapshot::from_json(ancestor).unwrap()),
        );
        ContentConflict::from_diff(&diff)
    }

    #[test]
    fn test_overlapping_changes() {
        let c = conflict(json!({"a": 1, "b": 1}), json!({"a": 2, "b": 0}), json!({"a": 0, "b": 0}));
        assert!(c.has_overlapping_changes());
        assert_eq!(c.contested_fields().into_iter().collect::<Vec<_>>(), vec!["a"]);

        let c = conflict(json!({"a": 1, "b": 0}), json!({"a": 0, "b": 2}), json!({"a": 0, "b": 0}));
        assert!(!c.has_overlapping_changes());
        assert!(c.contested_fields().is_empty());
    }

    #[test]
    fn test_merge_log_from_changes() {
        let c = conflict(json!({"a": 1, "c": 3}), json!({}), json!({"a": 0, "b": 0}));
        let log = MergeLogEntry::from_changes(&c.local_changes, MergeSource::Local);
        let actions: Vec<(&str, MergeLogAction)> =
            log.iter().map(|e| (e.field.as_str(), e.action)).collect();
        assert_eq!(
            actions,
            vec![
                ("c", MergeLogAction::Add),
                ("a", MergeLogAction::Modify),
                ("b", MergeLogAction::Delete),
            ]
        );
    }

    #[test]
    fn test_result_serializes_with_outcome_tag() {
        let result = ResolutionResult::Failed {
            error: "boom".into(),
            requires_manual: true,
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["outcome"], "failed");
        assert!(result.requires_manual());
        assert!(!result.is_success());
        assert!(result.strategy_used().is_none());
    }
}
