//! Two-way change calculation between an older and a newer snapshot.
//!
//! Every field in the union of both snapshots lands in exactly one of the
//! four maps of [`Changes`].

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::snapshot::Snapshot;
use super::value::{deep_equal, ValueKind};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// How a modified field changed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    /// The value changed kind (e.g. string to number).
    TypeChange,
    /// An array gained or lost elements.
    ArrayResize,
    /// An array kept its length but some elements changed.
    ArrayContent,
    /// An object gained or lost keys.
    ObjectStructure,
    /// An object kept its keys but some values changed.
    ObjectContent,
    /// A scalar changed.
    ValueChange,
}

impl std::fmt::Display for ChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TypeChange => write!(f, "type_change"),
            Self::ArrayResize => write!(f, "array_resize"),
            Self::ArrayContent => write!(f, "array_content"),
            Self::ObjectStructure => write!(f, "object_structure"),
            Self::ObjectContent => write!(f, "object_content"),
            Self::ValueChange => write!(f, "value_change"),
        }
    }
}

/// Index-wise comparison of two arrays.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArrayDiff {
    /// Indices present only in the new array.
    pub added: Vec<usize>,
    /// Indices present only in the old array.
    pub removed: Vec<usize>,
    /// Indices present in both with different elements.
    pub modified: Vec<usize>,
}

impl ArrayDiff {
    pub fn between(old: &[Value], new: &[Value]) -> Self {
        let mut diff = Self::default();
        for i in 0..old.len().max(new.len()) {
            match (old.get(i), new.get(i)) {
                (Some(o), Some(n)) if !deep_equal(o, n) => diff.modified.push(i),
                (Some(_), None) => diff.removed.push(i),
                (None, Some(_)) => diff.added.push(i),
                _ => {}
            }
        }
        diff
    }

    /// Every index this diff touches.
    pub fn touched(&self) -> BTreeSet<usize> {
        self.added
            .iter()
            .chain(&self.removed)
            .chain(&self.modified)
            .copied()
            .collect()
    }

    /// True when the two diffs share no touched index.
    pub fn is_disjoint(&self, other: &ArrayDiff) -> bool {
        self.touched().is_disjoint(&other.touched())
    }
}

/// A field whose value differs between the two snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldModification {
    pub old_value: Value,
    pub new_value: Value,
    pub change_type: ChangeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub array_diff: Option<ArrayDiff>,
}

/// Per-category field counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSummary {
    pub added: usize,
    pub modified: usize,
    pub deleted: usize,
    pub unchanged: usize,
    pub total: usize,
}

impl ChangeSummary {
    /// Number of fields that changed in any way.
    pub fn changed(&self) -> usize {
        self.added + self.modified + self.deleted
    }
}

/// The classified difference from one snapshot to another.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Changes {
    /// Fields only in the new snapshot, with their new value.
    pub added: BTreeMap<String, Value>,
    /// Fields in both snapshots whose values differ.
    pub modified: BTreeMap<String, FieldModification>,
    /// Fields only in the old snapshot, with their old value.
    pub deleted: BTreeMap<String, Value>,
    /// Fields in both snapshots with structurally equal values.
    pub unchanged: BTreeMap<String, Value>,
    pub summary: ChangeSummary,
}

impl Changes {
    /// True when no field was added, modified or deleted.
    pub fn is_empty(&self) -> bool {
        self.summary.changed() == 0
    }

    /// True when `field` was added, modified or deleted.
    pub fn touches(&self, field: &str) -> bool {
        self.added.contains_key(field)
            || self.modified.contains_key(field)
            || self.deleted.contains_key(field)
    }
}

// ---------------------------------------------------------------------------
// Calculation
// ---------------------------------------------------------------------------

/// Classify every field of `old` and `new` as added, modified, deleted or
/// unchanged.
pub fn calculate_changes(old: &Snapshot, new: &Snapshot) -> Changes {
    let mut changes = Changes::default();

    for (field, new_value) in &new.data {
        match old.data.get(field) {
            None => {
                changes.added.insert(field.clone(), new_value.clone());
            }
            Some(old_value) if deep_equal(old_value, new_value) => {
                changes.unchanged.insert(field.clone(), new_value.clone());
            }
            Some(old_value) => {
                let modification = classify_modification(old_value, new_value);
                debug!(field = %field, change_type = %modification.change_type, "field modified");
                changes.modified.insert(field.clone(), modification);
            }
        }
    }

    for (field, old_value) in &old.data {
        if !new.data.contains_key(field) {
            changes.deleted.insert(field.clone(), old_value.clone());
        }
    }

    changes.summary = ChangeSummary {
        added: changes.added.len(),
        modified: changes.modified.len(),
        deleted: changes.deleted.len(),
        unchanged: changes.unchanged.len(),
        total: changes.added.len()
            + changes.modified.len()
            + changes.deleted.len()
            + changes.unchanged.len(),
    };

    changes
}

/// Describe how `old` became `new`. The two values are assumed unequal.
pub fn classify_modification(old: &Value, new: &Value) -> FieldModification {
    let (change_type, array_diff) = match (old, new) {
        _ if ValueKind::of(old) != ValueKind::of(new) => (ChangeType::TypeChange, None),
        (Value::Array(o), Value::Array(n)) => {
            let diff = ArrayDiff::between(o, n);
            let kind = if o.len() != n.len() {
                ChangeType::ArrayResize
            } else {
                ChangeType::ArrayContent
            };
            (kind, Some(diff))
        }
        (Value::Object(o), Value::Object(n)) => {
            let same_keys = o.len() == n.len() && o.keys().all(|k| n.contains_key(k));
            if same_keys {
                (ChangeType::ObjectContent, None)
            } else {
                (ChangeType::ObjectStructure, None)
            }
        }
        _ => (ChangeType::ValueChange, None),
    };

    FieldModification {
        old_value: old.clone(),
        new_value: new.clone(),
        change_type,
        array_diff,
    }
}
