//! Three-way diff engine.
//!
//! Given local, remote and ancestor snapshots of one content record, the
//! engine classifies every field on both sides relative to the ancestor,
//! lists the fields that conflict, lists the changes that can be applied
//! without human input, and scores how far the two sides have diverged.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use super::changes::{calculate_changes, ChangeSummary, ChangeType, Changes, FieldModification};
use super::snapshot::Snapshot;
use super::value::{deep_equal, optional_equal};

/// Weight of true conflicts in the divergence score.
const CONFLICT_WEIGHT: f64 = 0.7;
/// Weight of concurrent (benign) modifications in the divergence score.
const MODIFICATION_WEIGHT: f64 = 0.3;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Categorisation of a field-level conflict.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    /// The field changed differently on both sides.
    BothModified,
    /// Added locally, deleted remotely.
    AddDeleteConflict,
    /// Deleted locally, added remotely.
    DeleteAddConflict,
    /// Added on both sides with different values.
    BothAdded,
}

impl ConflictType {
    /// Add/delete collisions never resolve without a human.
    pub fn is_add_delete(&self) -> bool {
        matches!(self, Self::AddDeleteConflict | Self::DeleteAddConflict)
    }
}

impl std::fmt::Display for ConflictType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BothModified => write!(f, "both_modified"),
            Self::AddDeleteConflict => write!(f, "add_delete_conflict"),
            Self::DeleteAddConflict => write!(f, "delete_add_conflict"),
            Self::BothAdded => write!(f, "both_added"),
        }
    }
}

/// Suggested way to settle a single conflicting field.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionSuggestion {
    /// Both sides arrived at the same value.
    AutoResolveSame,
    /// The local side reverted to the ancestor; take the remote value.
    PreferRemote,
    /// The remote side reverted to the ancestor; take the local value.
    PreferLocal,
    /// Both sides edited disjoint elements of the same array.
    AutoMergeArrays,
    /// A human must decide.
    ManualRequired,
}

impl std::fmt::Display for ResolutionSuggestion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AutoResolveSame => write!(f, "auto_resolve_same"),
            Self::PreferRemote => write!(f, "prefer_remote"),
            Self::PreferLocal => write!(f, "prefer_local"),
            Self::AutoMergeArrays => write!(f, "auto_merge_arrays"),
            Self::ManualRequired => write!(f, "manual_required"),
        }
    }
}

/// One side's change to a single field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldChange {
    Added { value: Value },
    Modified(FieldModification),
    Deleted { old_value: Value },
}

impl FieldChange {
    /// The value the field holds after this change (`None` when deleted).
    pub fn new_value(&self) -> Option<&Value> {
        match self {
            Self::Added { value } => Some(value),
            Self::Modified(m) => Some(&m.new_value),
            Self::Deleted { .. } => None,
        }
    }

    fn modification(&self) -> Option<&FieldModification> {
        match self {
            Self::Modified(m) => Some(m),
            _ => None,
        }
    }
}

/// A field changed on both sides in an incompatible way.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub field: String,
    pub conflict_type: ConflictType,
    pub local_change: Option<FieldChange>,
    pub remote_change: Option<FieldChange>,
    pub ancestor_value: Option<Value>,
    pub suggestion: ResolutionSuggestion,
}

/// Which side a change came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChangeSource {
    Local,
    Remote,
}

impl std::fmt::Display for ChangeSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Remote => write!(f, "remote"),
        }
    }
}

/// Kind of a mergeable change.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MergeAction {
    Add,
    Modify,
}

/// A change that collides with nothing on the other side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeableChange {
    pub field: String,
    pub source: ChangeSource,
    pub action: MergeAction,
    pub value: Value,
}

/// The full three-way comparison of one content record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffResult {
    pub local: Snapshot,
    pub remote: Snapshot,
    pub ancestor: Snapshot,
    pub local_changes: Changes,
    pub remote_changes: Changes,
    pub conflicts: Vec<Conflict>,
    pub mergeable_changes: Vec<MergeableChange>,
    pub divergence: f64,
    pub compared_at: DateTime<Utc>,
}

/// Counts describing a [`DiffResult`], suitable for logs and audit records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub conflict_count: usize,
    pub mergeable_count: usize,
    pub conflicting_fields: Vec<String>,
    pub local: ChangeSummary,
    pub remote: ChangeSummary,
    pub divergence: f64,
}

impl DiffResult {
    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }

    pub fn summary(&self) -> DiffSummary {
        DiffSummary {
            conflict_count: self.conflicts.len(),
            mergeable_count: self.mergeable_changes.len(),
            conflicting_fields: self.conflicts.iter().map(|c| c.field.clone()).collect(),
            local: self.local_changes.summary,
            remote: self.remote_changes.summary,
            divergence: self.divergence,
        }
    }
}

/// Relation of a field whose value changed on both sides.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FieldConflictKind {
    /// Both sides changed to the same value.
    BothSame,
    /// Both sides changed to different values.
    DifferentValues,
}

/// Display row for one field of a three-way comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDiff {
    pub field: String,
    pub ancestor_value: Option<Value>,
    pub local_value: Option<Value>,
    pub remote_value: Option<Value>,
    pub local_changed: bool,
    pub remote_changed: bool,
    /// True only when both sides changed to different values.
    pub conflict: bool,
    pub conflict_type: Option<FieldConflictKind>,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Stateless three-way diff engine.
pub struct ThreeWayDiffEngine;

impl ThreeWayDiffEngine {
    /// Compare local and remote against their common ancestor.
    ///
    /// Absent snapshots are treated as empty records.
    pub fn compare_versions(
        local: Option<&Snapshot>,
        remote: Option<&Snapshot>,
        ancestor: Option<&Snapshot>,
    ) -> DiffResult {
        let local = Snapshot::normalize(local);
        let remote = Snapshot::normalize(remote);
        let ancestor = Snapshot::normalize(ancestor);

        let local_changes = calculate_changes(&ancestor, &local);
        let remote_changes = calculate_changes(&ancestor, &remote);

        let conflicts = Self::analyze_conflicts(&local_changes, &remote_changes, &ancestor);
        let mergeable_changes = Self::identify_mergeable_changes(&local_changes, &remote_changes);
        let divergence = Self::divergence(
            &local,
            &remote,
            &ancestor,
            conflicts.len(),
            local_changes.summary.modified,
            remote_changes.summary.modified,
        );

        info!(
            local_changed = local_changes.summary.changed(),
            remote_changed = remote_changes.summary.changed(),
            conflicts = conflicts.len(),
            mergeable = mergeable_changes.len(),
            divergence,
            "three-way comparison complete"
        );

        DiffResult {
            local,
            remote,
            ancestor,
            local_changes,
            remote_changes,
            conflicts,
            mergeable_changes,
            divergence,
            compared_at: Utc::now(),
        }
    }

    /// List every field whose local and remote changes collide.
    pub fn analyze_conflicts(
        local: &Changes,
        remote: &Changes,
        ancestor: &Snapshot,
    ) -> Vec<Conflict> {
        let mut conflicts = Vec::new();

        for (field, local_mod) in &local.modified {
            if let Some(remote_mod) = remote.modified.get(field) {
                let local_change = FieldChange::Modified(local_mod.clone());
                let remote_change = FieldChange::Modified(remote_mod.clone());
                let ancestor_value = ancestor.data.get(field);
                let suggestion =
                    Self::suggest_resolution(&local_change, &remote_change, ancestor_value);
                conflicts.push(Conflict {
                    field: field.clone(),
                    conflict_type: ConflictType::BothModified,
                    local_change: Some(local_change),
                    remote_change: Some(remote_change),
                    ancestor_value: ancestor_value.cloned(),
                    suggestion,
                });
            }
        }

        for (field, value) in &local.added {
            if let Some(old_value) = remote.deleted.get(field) {
                conflicts.push(Conflict {
                    field: field.clone(),
                    conflict_type: ConflictType::AddDeleteConflict,
                    local_change: Some(FieldChange::Added {
                        value: value.clone(),
                    }),
                    remote_change: Some(FieldChange::Deleted {
                        old_value: old_value.clone(),
                    }),
                    ancestor_value: ancestor.data.get(field).cloned(),
                    suggestion: ResolutionSuggestion::ManualRequired,
                });
            }
        }

        for (field, value) in &remote.added {
            if let Some(old_value) = local.deleted.get(field) {
                conflicts.push(Conflict {
                    field: field.clone(),
                    conflict_type: ConflictType::DeleteAddConflict,
                    local_change: Some(FieldChange::Deleted {
                        old_value: old_value.clone(),
                    }),
                    remote_change: Some(FieldChange::Added {
                        value: value.clone(),
                    }),
                    ancestor_value: ancestor.data.get(field).cloned(),
                    suggestion: ResolutionSuggestion::ManualRequired,
                });
            }
        }

        for (field, local_value) in &local.added {
            match remote.added.get(field) {
                Some(remote_value) if !deep_equal(local_value, remote_value) => {
                    let local_change = FieldChange::Added {
                        value: local_value.clone(),
                    };
                    let remote_change = FieldChange::Added {
                        value: remote_value.clone(),
                    };
                    let suggestion = Self::suggest_resolution(&local_change, &remote_change, None);
                    conflicts.push(Conflict {
                        field: field.clone(),
                        conflict_type: ConflictType::BothAdded,
                        local_change: Some(local_change),
                        remote_change: Some(remote_change),
                        ancestor_value: None,
                        suggestion,
                    });
                }
                _ => {}
            }
        }

        for conflict in &conflicts {
            debug!(
                field = %conflict.field,
                conflict_type = %conflict.conflict_type,
                suggestion = %conflict.suggestion,
                "conflict detected"
            );
        }

        conflicts
    }

    /// Suggest how a field changed on both sides could be settled.
    pub fn suggest_resolution(
        local: &FieldChange,
        remote: &FieldChange,
        ancestor: Option<&Value>,
    ) -> ResolutionSuggestion {
        let local_value = local.new_value();
        let remote_value = remote.new_value();

        if optional_equal(local_value, remote_value) {
            return ResolutionSuggestion::AutoResolveSame;
        }
        if ancestor.is_some() && optional_equal(local_value, ancestor) {
            return ResolutionSuggestion::PreferRemote;
        }
        if ancestor.is_some() && optional_equal(remote_value, ancestor) {
            return ResolutionSuggestion::PreferLocal;
        }

        if let (Some(l), Some(r)) = (local.modification(), remote.modification()) {
            if l.change_type == ChangeType::ArrayContent
                && r.change_type == ChangeType::ArrayContent
            {
                if let (Some(ld), Some(rd)) = (&l.array_diff, &r.array_diff) {
                    if ld.is_disjoint(rd) {
                        return ResolutionSuggestion::AutoMergeArrays;
                    }
                }
            }
        }

        ResolutionSuggestion::ManualRequired
    }

    /// List the changes that collide with nothing on the other side.
    pub fn identify_mergeable_changes(local: &Changes, remote: &Changes) -> Vec<MergeableChange> {
        let mut mergeable = Vec::new();

        for (field, value) in &local.added {
            if !remote.deleted.contains_key(field) && !remote.added.contains_key(field) {
                mergeable.push(MergeableChange {
                    field: field.clone(),
                    source: ChangeSource::Local,
                    action: MergeAction::Add,
                    value: value.clone(),
                });
            }
        }
        for (field, value) in &remote.added {
            if !local.deleted.contains_key(field) && !local.added.contains_key(field) {
                mergeable.push(MergeableChange {
                    field: field.clone(),
                    source: ChangeSource::Remote,
                    action: MergeAction::Add,
                    value: value.clone(),
                });
            }
        }
        for (field, modification) in &local.modified {
            if !remote.modified.contains_key(field) {
                mergeable.push(MergeableChange {
                    field: field.clone(),
                    source: ChangeSource::Local,
                    action: MergeAction::Modify,
                    value: modification.new_value.clone(),
                });
            }
        }
        for (field, modification) in &remote.modified {
            if !local.modified.contains_key(field) {
                mergeable.push(MergeableChange {
                    field: field.clone(),
                    source: ChangeSource::Remote,
                    action: MergeAction::Modify,
                    value: modification.new_value.clone(),
                });
            }
        }

        mergeable
    }

    /// Divergence score in `[0, 1]`, weighted toward true conflicts.
    pub fn divergence(
        local: &Snapshot,
        remote: &Snapshot,
        ancestor: &Snapshot,
        conflict_count: usize,
        modified_local: usize,
        modified_remote: usize,
    ) -> f64 {
        let total_fields: BTreeSet<&String> = local
            .fields()
            .chain(remote.fields())
            .chain(ancestor.fields())
            .collect();
        let total = total_fields.len();
        if total == 0 {
            return 0.0;
        }

        let total = total as f64;
        let score = CONFLICT_WEIGHT * conflict_count as f64 / total
            + MODIFICATION_WEIGHT * (modified_local + modified_remote) as f64 / (2.0 * total);
        score.min(1.0)
    }

    /// Per-field display rows over the union of all three snapshots.
    pub fn generate_field_level_diff(diff: &DiffResult) -> Vec<FieldDiff> {
        let fields: BTreeSet<&String> = diff
            .local
            .fields()
            .chain(diff.remote.fields())
            .chain(diff.ancestor.fields())
            .collect();

        fields
            .into_iter()
            .map(|field| {
                let ancestor_value = diff.ancestor.data.get(field);
                let local_value = diff.local.data.get(field);
                let remote_value = diff.remote.data.get(field);

                let local_changed = !optional_equal(local_value, ancestor_value);
                let remote_changed = !optional_equal(remote_value, ancestor_value);

                let conflict_type = if local_changed && remote_changed {
                    if optional_equal(local_value, remote_value) {
                        Some(FieldConflictKind::BothSame)
                    } else {
                        Some(FieldConflictKind::DifferentValues)
                    }
                } else {
                    None
                };

                FieldDiff {
                    field: field.clone(),
                    ancestor_value: ancestor_value.cloned(),
                    local_value: local_value.cloned(),
                    remote_value: remote_value.cloned(),
                    local_changed,
                    remote_changed,
                    conflict: conflict_type == Some(FieldConflictKind::DifferentValues),
                    conflict_type,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::changes::classify_modification;
    use serde_json::json;

    fn snap(value: Value) -> Snapshot {
        Snapshot::from_json(value).unwrap()
    }

    fn compare(local: Value, remote: Value, ancestor: Value) -> DiffResult {
        ThreeWayDiffEngine::compare_versions(
            Some(&snap(local)),
            Some(&snap(remote)),
            Some(&snap(ancestor)),
        )
    }

    #[test]
    fn test_identity_has_no_changes() {
        let v = json!({"title": "A", "tags": ["x"], "meta": {"k": 1}});
        let diff = compare(v.clone(), v.clone(), v);
        assert!(diff.conflicts.is_empty());
        assert!(diff.mergeable_changes.is_empty());
        assert_eq!(diff.local_changes.summary.unchanged, 3);
        assert_eq!(diff.remote_changes.summary.unchanged, 3);
        assert_eq!(diff.divergence, 0.0);
    }

    #[test]
    fn test_all_snapshots_absent() {
        let diff = ThreeWayDiffEngine::compare_versions(None, None, None);
        assert!(!diff.has_conflicts());
        assert_eq!(diff.divergence, 0.0);
    }

    #[test]
    fn test_both_modified_needs_manual() {
        let diff = compare(json!({"price": 12}), json!({"price": 15}), json!({"price": 10}));
        assert_eq!(diff.conflicts.len(), 1);
        let conflict = &diff.conflicts[0];
        assert_eq!(conflict.field, "price");
        assert_eq!(conflict.conflict_type, ConflictType::BothModified);
        assert_eq!(conflict.suggestion, ResolutionSuggestion::ManualRequired);
        assert_eq!(conflict.ancestor_value, Some(json!(10)));
        assert!(diff.mergeable_changes.is_empty());
        // 0.7 * 1/1 + 0.3 * 2/2 = 1.0
        assert!((diff.divergence - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_same_change_both_sides() {
        let diff = compare(json!({"a": 2}), json!({"a": 2}), json!({"a": 1}));
        assert_eq!(diff.conflicts[0].suggestion, ResolutionSuggestion::AutoResolveSame);
    }

    #[test]
    fn test_disjoint_array_edits_suggest_array_merge() {
        let diff = compare(
            json!({"tags": ["X", "b", "c"]}),
            json!({"tags": ["a", "b", "Z"]}),
            json!({"tags": ["a", "b", "c"]}),
        );
        assert_eq!(diff.conflicts[0].suggestion, ResolutionSuggestion::AutoMergeArrays);

        let overlapping = compare(
            json!({"tags": ["X", "b"]}),
            json!({"tags": ["Y", "b"]}),
            json!({"tags": ["a", "b"]}),
        );
        assert_eq!(
            overlapping.conflicts[0].suggestion,
            ResolutionSuggestion::ManualRequired
        );
    }

    #[test]
    fn test_suggest_prefers_side_that_did_not_revert() {
        let ancestor = json!("red");
        let local = FieldChange::Modified(classify_modification(
            &json!("blue"),
            &json!("red"),
        ));
        let remote = FieldChange::Modified(classify_modification(
            &json!("red"),
            &json!("green"),
        ));
        assert_eq!(
            ThreeWayDiffEngine::suggest_resolution(&local, &remote, Some(&ancestor)),
            ResolutionSuggestion::PreferRemote
        );
        assert_eq!(
            ThreeWayDiffEngine::suggest_resolution(&remote, &local, Some(&ancestor)),
            ResolutionSuggestion::PreferLocal
        );
    }

    #[test]
    fn test_disjoint_edits_are_mergeable() {
        let diff = compare(
            json!({"title": "A2", "tags": ["x"], "extra": 1}),
            json!({"title": "A", "tags": ["x", "y"]}),
            json!({"title": "A", "tags": ["x"]}),
        );
        assert!(diff.conflicts.is_empty());
        let fields: Vec<(&str, ChangeSource, MergeAction)> = diff
            .mergeable_changes
            .iter()
            .map(|m| (m.field.as_str(), m.source, m.action))
            .collect();
        assert_eq!(
            fields,
            vec![
                ("extra", ChangeSource::Local, MergeAction::Add),
                ("title", ChangeSource::Local, MergeAction::Modify),
                ("tags", ChangeSource::Remote, MergeAction::Modify),
            ]
        );
    }

    #[test]
    fn test_both_added_with_different_values() {
        let diff = compare(json!({"a": 1}), json!({"a": 2}), json!({}));
        assert_eq!(diff.conflicts.len(), 1);
        assert_eq!(diff.conflicts[0].conflict_type, ConflictType::BothAdded);
        assert!(diff.mergeable_changes.is_empty());

        let same = compare(json!({"a": 1}), json!({"a": 1}), json!({}));
        assert!(same.conflicts.is_empty());
        assert!(same.mergeable_changes.is_empty());
    }

    #[test]
    fn test_conflict_symmetry() {
        let local = json!({"a": 1, "b": [1, 2], "c": "x", "d": true});
        let remote = json!({"a": 2, "b": [1, 3], "c": "y", "e": 5});
        let ancestor = json!({"a": 0, "b": [0, 2], "c": "x", "d": false});

        let forward = compare(local.clone(), remote.clone(), ancestor.clone());
        let backward = compare(remote, local, ancestor);

        let mut f: Vec<(String, ConflictType)> = forward
            .conflicts
            .iter()
            .map(|c| (c.field.clone(), c.conflict_type))
            .collect();
        let mut b: Vec<(String, ConflictType)> = backward
            .conflicts
            .iter()
            .map(|c| (c.field.clone(), c.conflict_type))
            .collect();
        f.sort();
        b.sort();
        assert_eq!(f, b);
        assert_eq!(forward.divergence, backward.divergence);
    }

    #[test]
    fn test_divergence_is_bounded() {
        let diff = compare(
            json!({"a": 1, "b": 1}),
            json!({"a": 2, "b": 2}),
            json!({"a": 0, "b": 0}),
        );
        assert!(diff.divergence <= 1.0);
        assert!(diff.divergence > 0.0);

        let partial = compare(json!({"a": 1, "b": 0}), json!({"a": 0, "b": 0}), json!({"a": 0, "b": 0}));
        // 0.7 * 0 + 0.3 * 1 / 4
        assert!((partial.divergence - 0.075).abs() < 1e-9);
    }

    #[test]
    fn test_field_level_diff() {
        let diff = compare(
            json!({"a": 2, "b": 5, "c": 1}),
            json!({"a": 2, "b": 6, "c": 1, "d": 0}),
            json!({"a": 1, "b": 4, "c": 1}),
        );
        let rows = ThreeWayDiffEngine::generate_field_level_diff(&diff);
        assert_eq!(rows.len(), 4);

        let a = rows.iter().find(|r| r.field == "a").unwrap();
        assert_eq!(a.conflict_type, Some(FieldConflictKind::BothSame));
        assert!(!a.conflict);

        let b = rows.iter().find(|r| r.field == "b").unwrap();
        assert_eq!(b.conflict_type, Some(FieldConflictKind::DifferentValues));
        assert!(b.conflict);

        let d = rows.iter().find(|r| r.field == "d").unwrap();
        assert!(!d.local_changed);
        assert!(d.remote_changed);
        assert!(d.conflict_type.is_none());
    }

    #[test]
    fn test_summary() {
        let diff = compare(json!({"price": 12}), json!({"price": 15}), json!({"price": 10}));
        let summary = diff.summary();
        assert_eq!(summary.conflict_count, 1);
        assert_eq!(summary.conflicting_fields, vec!["price".to_string()]);
        assert_eq!(summary.local.modified, 1);
    }
}
