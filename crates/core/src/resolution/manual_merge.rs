//! Manual resolution: options for a human, and applying their picks.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use super::auto_merge::merge_independent;
use super::{
    ContentConflict, ManualFieldOptions, ManualOptions, ManualResolutionData, MergeLogAction,
    MergeLogEntry, MergeSource, Resolution, ResolutionStrategy, StrategyOutput, Winner,
};
use crate::diff::{deep_equal, Conflict, FieldChange, ResolutionSuggestion};
use crate::errors::ResolutionError;

/// Never resolves on its own; always asks a human.
#[derive(Debug, Clone, Copy, Default)]
pub struct ManualMerge;

impl ResolutionStrategy for ManualMerge {
    fn name(&self) -> &str {
        "manual_merge"
    }

    fn description(&self) -> &str {
        "ask a human to pick a value for every conflicting field"
    }

    fn auto_resolves(&self) -> bool {
        false
    }

    fn can_auto_resolve(&self, _conflict: &ContentConflict) -> bool {
        false
    }

    fn resolve(&self, conflict: &ContentConflict) -> Result<StrategyOutput, ResolutionError> {
        let fields: Vec<ManualFieldOptions> = conflict
            .conflicts
            .iter()
            .map(|c| ManualFieldOptions {
                field: c.field.clone(),
                conflict_type: c.conflict_type,
                suggestion: c.suggestion,
                options: ManualOptions {
                    local: side_value(&c.local_change),
                    remote: side_value(&c.remote_change),
                    ancestor: c.ancestor_value.clone(),
                    custom: propose_custom(c),
                },
            })
            .collect();

        let proposals = fields.iter().filter(|f| f.options.custom.is_some()).count();
        debug!(fields = fields.len(), proposals, "prepared manual resolution options");

        Ok(StrategyOutput::Manual(ManualResolutionData {
            description: format!(
                "{} field(s) need a decision, {} with a merged proposal",
                fields.len(),
                proposals
            ),
            fields,
        }))
    }
}

fn side_value(change: &Option<FieldChange>) -> Option<Value> {
    change.as_ref().and_then(FieldChange::new_value).cloned()
}

/// A mechanically merged value for a contested field, if one exists.
fn propose_custom(conflict: &Conflict) -> Option<Value> {
    let local = side_value(&conflict.local_change);
    let remote = side_value(&conflict.remote_change);

    match conflict.suggestion {
        ResolutionSuggestion::AutoResolveSame | ResolutionSuggestion::PreferLocal => local,
        ResolutionSuggestion::PreferRemote => remote,
        ResolutionSuggestion::AutoMergeArrays => {
            merge_arrays(conflict.ancestor_value.as_ref(), local.as_ref(), remote.as_ref())
        }
        ResolutionSuggestion::ManualRequired => {
            merge_text(conflict.ancestor_value.as_ref(), local.as_ref(), remote.as_ref())
        }
    }
}

/// Element-wise merge of equal-length arrays edited at disjoint indices.
fn merge_arrays(ancestor: Option<&Value>, local: Option<&Value>, remote: Option<&Value>) -> Option<Value> {
    let (Some(Value::Array(base)), Some(Value::Array(ours)), Some(Value::Array(theirs))) =
        (ancestor, local, remote)
    else {
        return None;
    };
    if ours.len() != base.len() || theirs.len() != base.len() {
        return None;
    }

    let merged = base
        .iter()
        .zip(ours.iter().zip(theirs))
        .map(|(b, (o, t))| if deep_equal(o, b) { t.clone() } else { o.clone() })
        .collect();
    Some(Value::Array(merged))
}

/// Line-based three-way merge of string values.
fn merge_text(ancestor: Option<&Value>, local: Option<&Value>, remote: Option<&Value>) -> Option<Value> {
    let base = match ancestor {
        Some(Value::String(s)) => s.as_str(),
        None => "",
        Some(_) => return None,
    };
    let (Some(Value::String(ours)), Some(Value::String(theirs))) = (local, remote) else {
        return None;
    };

    match diffy::merge(base, ours, theirs) {
        Ok(merged) => Some(Value::String(merged)),
        Err(_) => {
            debug!("text merge has overlapping hunks, no proposal");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Applying a human's choices
// ---------------------------------------------------------------------------

/// A human's pick for one contested field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "pick", content = "value", rename_all = "snake_case")]
pub enum ManualChoice {
    Local,
    Remote,
    Ancestor,
    Custom(Value),
}

impl ManualChoice {
    fn source(&self) -> MergeSource {
        match self {
            Self::Local => MergeSource::Local,
            Self::Remote => MergeSource::Remote,
            Self::Ancestor => MergeSource::Ancestor,
            Self::Custom(_) => MergeSource::Manual,
        }
    }
}

/// Build a resolution from per-field picks.
///
/// Every contested field needs a pick and every pick must name a contested
/// field. Changes that were never contested are applied the way
/// [`AutoMerge`](super::AutoMerge) applies them.
pub fn apply_manual_choices(
    conflict: &ContentConflict,
    choices: &BTreeMap<String, ManualChoice>,
) -> Result<Resolution, ResolutionError> {
    let contested = conflict.contested_fields();

    if let Some(field) = choices.keys().find(|f| !contested.contains(*f)) {
        return Err(ResolutionError::InvalidChoice {
            field: field.clone(),
            detail: "field is not under conflict".into(),
        });
    }
    if let Some(field) = contested.iter().find(|f| !choices.contains_key(*f)) {
        return Err(ResolutionError::InvalidChoice {
            field: field.clone(),
            detail: "no choice given for a conflicting field".into(),
        });
    }

    let mut merge = merge_independent(conflict, &contested);
    let independent = merge.log.len();

    for (field, choice) in choices {
        let picked = match choice {
            ManualChoice::Local => conflict.local.data.get(field).cloned(),
            ManualChoice::Remote => conflict.remote.data.get(field).cloned(),
            ManualChoice::Ancestor => conflict.ancestor.data.get(field).cloned(),
            ManualChoice::Custom(value) => Some(value.clone()),
        };
        let in_ancestor = conflict.ancestor.data.contains_key(field);

        match picked {
            Some(value) => {
                let action = if in_ancestor {
                    MergeLogAction::Modify
                } else {
                    MergeLogAction::Add
                };
                merge.merged.insert(field.clone(), value.clone());
                merge.log.push(MergeLogEntry {
                    field: field.clone(),
                    source: choice.source(),
                    action,
                    value: Some(value),
                });
            }
            None => {
                merge.merged.remove(field);
                merge.log.push(MergeLogEntry {
                    field: field.clone(),
                    source: choice.source(),
                    action: MergeLogAction::Delete,
                    value: None,
                });
            }
        }
    }

    info!(
        choices = choices.len(),
        independent,
        "applied manual resolution"
    );

    Ok(Resolution {
        winner: Winner::Merged,
        merged: merge.merged,
        changes: merge.log,
        strategy: "manual_merge".into(),
        timestamp: Utc::now(),
        description: format!(
            "applied {} manual choice(s) and {} independent change(s)",
            choices.len(),
            independent
        ),
        conflicts: Vec::new(),
        discarded: merge.discarded,
    })
}
