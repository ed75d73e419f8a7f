//! Field-wise automatic merge of non-overlapping changes.
//!
//! The merge starts from the ancestor data and applies, in order:
//! local-only additions, remote-only additions, local-only modifications,
//! remote-only modifications, then local and remote deletions. Deletions of
//! a field the other side modified are skipped and recorded as discarded.

use std::collections::BTreeSet;

use chrono::Utc;
use tracing::{debug, info};

use super::{
    ContentConflict, MergeLogAction, MergeLogEntry, MergeSource, Resolution, ResolutionStrategy,
    StrategyOutput, Winner,
};
use crate::diff::{deep_equal, Changes, Conflict, FieldMap};
use crate::errors::ResolutionError;

/// Result of applying every change that does not touch a contested field.
#[derive(Debug, Clone, Default)]
pub(crate) struct IndependentMerge {
    pub merged: FieldMap,
    pub log: Vec<MergeLogEntry>,
    pub discarded: Vec<MergeLogEntry>,
}

/// Apply all non-conflicting changes of both sides onto the ancestor data.
///
/// Fields in `skip` are left at their ancestor value for the caller to
/// decide.
pub(crate) fn merge_independent(conflict: &ContentConflict, skip: &BTreeSet<String>) -> IndependentMerge {
    let local = &conflict.local_changes;
    let remote = &conflict.remote_changes;
    let mut out = IndependentMerge {
        merged: conflict.ancestor.data.clone(),
        ..Default::default()
    };

    // Additions
    for (field, value) in &local.added {
        if skip.contains(field) || remote.deleted.contains_key(field) {
            continue;
        }
        out.merged.insert(field.clone(), value.clone());
        out.log.push(entry(field, MergeSource::Local, MergeLogAction::Add, Some(value)));
    }
    for (field, value) in &remote.added {
        if skip.contains(field) || local.deleted.contains_key(field) {
            continue;
        }
        // Added identically on both sides: already applied from local.
        if local.added.get(field).is_some_and(|l| deep_equal(l, value)) {
            continue;
        }
        out.merged.insert(field.clone(), value.clone());
        out.log.push(entry(field, MergeSource::Remote, MergeLogAction::Add, Some(value)));
    }

    // Modifications
    apply_modifications(&mut out, local, remote, MergeSource::Local, skip);
    apply_modifications(&mut out, remote, local, MergeSource::Remote, skip);

    // Deletions
    apply_deletions(&mut out, local, remote, MergeSource::Local, skip);
    apply_deletions(&mut out, remote, local, MergeSource::Remote, skip);

    out
}

fn apply_modifications(
    out: &mut IndependentMerge,
    side: &Changes,
    other: &Changes,
    source: MergeSource,
    skip: &BTreeSet<String>,
) {
    for (field, modification) in &side.modified {
        if skip.contains(field) || other.modified.contains_key(field) {
            continue;
        }
        out.merged.insert(field.clone(), modification.new_value.clone());
        out.log.push(entry(
            field,
            source,
            MergeLogAction::Modify,
            Some(&modification.new_value),
        ));
    }
}

fn apply_deletions(
    out: &mut IndependentMerge,
    side: &Changes,
    other: &Changes,
    source: MergeSource,
    skip: &BTreeSet<String>,
) {
    for field in side.deleted.keys() {
        if skip.contains(field) {
            continue;
        }
        if other.modified.contains_key(field) {
            debug!(field = %field, "deletion skipped, other side modified the field");
            out.discarded
                .push(entry(field, source, MergeLogAction::Delete, None));
            continue;
        }
        // Deleted on both sides: remove once, log once.
        if out.merged.remove(field).is_some() {
            out.log.push(entry(field, source, MergeLogAction::Delete, None));
        }
    }
}

fn entry(
    field: &str,
    source: MergeSource,
    action: MergeLogAction,
    value: Option<&serde_json::Value>,
) -> MergeLogEntry {
    MergeLogEntry {
        field: field.to_string(),
        source,
        action,
        value: value.cloned(),
    }
}

// ---------------------------------------------------------------------------
// Strategy
// ---------------------------------------------------------------------------

/// Merge both sides field by field when no field was modified on both.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoMerge;

impl ResolutionStrategy for AutoMerge {
    fn name(&self) -> &str {
        "auto_merge"
    }

    fn description(&self) -> &str {
        "merge non-overlapping local and remote changes field by field"
    }

    fn auto_resolves(&self) -> bool {
        true
    }

    fn can_auto_resolve(&self, conflict: &ContentConflict) -> bool {
        !conflict.has_overlapping_changes()
    }

    fn resolve(&self, conflict: &ContentConflict) -> Result<StrategyOutput, ResolutionError> {
        if conflict.has_overlapping_changes() {
            return Err(ResolutionError::MergeFailed(
                "auto_merge: some fields were modified on both sides".into(),
            ));
        }

        let contested = conflict.contested_fields();
        let merge = merge_independent(conflict, &contested);
        let left: Vec<Conflict> = conflict.conflicts.clone();

        info!(
            applied = merge.log.len(),
            discarded = merge.discarded.len(),
            unresolved = left.len(),
            "auto-merge complete"
        );

        let mut description = format!("merged {} non-overlapping change(s)", merge.log.len());
        if !merge.discarded.is_empty() {
            description.push_str(&format!(
                ", kept {} field(s) the other side modified instead of deleting",
                merge.discarded.len()
            ));
        }
        if !left.is_empty() {
            description.push_str(&format!(
                ", left {} divergent addition(s) untouched",
                left.len()
            ));
        }

        Ok(StrategyOutput::Resolved(Resolution {
            winner: Winner::Merged,
            merged: merge.merged,
            changes: merge.log,
            strategy: self.name().to_string(),
            timestamp: Utc::now(),
            description,
            conflicts: left,
            discarded: merge.discarded,
        }))
    }
}
