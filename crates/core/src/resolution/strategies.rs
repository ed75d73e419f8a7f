//! Whole-side strategies: keep one side's data wholesale.

use chrono::Utc;
use tracing::debug;

use super::{
    ContentConflict, MergeLogEntry, MergeSource, Resolution, ResolutionStrategy, StrategyOutput,
    Winner,
};
use crate::errors::ResolutionError;

/// Names of the strategies every manager starts with, in registration order.
pub const BUILTIN_STRATEGY_NAMES: &[&str] =
    &["local_wins", "remote_wins", "auto_merge", "manual_merge"];

/// Whole-side replacement is unsafe when a field exists on only one side
/// or the caller flagged the record as structurally changed.
fn side_can_win(conflict: &ContentConflict) -> bool {
    !conflict.structural
        && !conflict
            .conflicts
            .iter()
            .any(|c| c.conflict_type.is_add_delete())
}

fn side_wins(conflict: &ContentConflict, winner: Winner, strategy: &str) -> Resolution {
    let (kept, kept_changes, kept_source, other_changes, other_source) = match winner {
        Winner::Remote => (
            &conflict.remote,
            &conflict.remote_changes,
            MergeSource::Remote,
            &conflict.local_changes,
            MergeSource::Local,
        ),
        _ => (
            &conflict.local,
            &conflict.local_changes,
            MergeSource::Local,
            &conflict.remote_changes,
            MergeSource::Remote,
        ),
    };

    let discarded = MergeLogEntry::from_changes(other_changes, other_source);
    debug!(strategy, %winner, discarded = discarded.len(), "keeping one side wholesale");

    Resolution {
        winner,
        merged: kept.data.clone(),
        changes: MergeLogEntry::from_changes(kept_changes, kept_source),
        strategy: strategy.to_string(),
        timestamp: Utc::now(),
        description: format!(
            "kept {winner} version, discarded {} change(s) from the other side",
            discarded.len()
        ),
        conflicts: Vec::new(),
        discarded,
    }
}

fn refuse(conflict: &ContentConflict, strategy: &str) -> ResolutionError {
    let reason = if conflict.structural {
        "conflict is flagged structural".to_string()
    } else {
        "an add/delete conflict cannot be settled by keeping one side".to_string()
    };
    ResolutionError::MergeFailed(format!("{strategy}: {reason}"))
}

// ---------------------------------------------------------------------------
// LocalWins
// ---------------------------------------------------------------------------

/// Keep the local version.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalWins;

impl ResolutionStrategy for LocalWins {
    fn name(&self) -> &str {
        "local_wins"
    }

    fn description(&self) -> &str {
        "keep the local version and discard remote changes"
    }

    fn auto_resolves(&self) -> bool {
        true
    }

    fn can_auto_resolve(&self, conflict: &ContentConflict) -> bool {
        side_can_win(conflict)
    }

    fn resolve(&self, conflict: &ContentConflict) -> Result<StrategyOutput, ResolutionError> {
        if !side_can_win(conflict) {
            return Err(refuse(conflict, self.name()));
        }
        Ok(StrategyOutput::Resolved(side_wins(
            conflict,
            Winner::Local,
            self.name(),
        )))
    }
}

// ---------------------------------------------------------------------------
// RemoteWins
// ---------------------------------------------------------------------------

/// Keep the remote version.
#[derive(Debug, Clone, Copy, Default)]
pub struct RemoteWins;

impl ResolutionStrategy for RemoteWins {
    fn name(&self) -> &str {
        "remote_wins"
    }

    fn description(&self) -> &str {
        "keep the remote version and discard local changes"
    }

    fn auto_resolves(&self) -> bool {
        true
    }

    fn can_auto_resolve(&self, conflict: &ContentConflict) -> bool {
        side_can_win(conflict)
    }

    fn resolve(&self, conflict: &ContentConflict) -> Result<StrategyOutput, ResolutionError> {
        if !side_can_win(conflict) {
            return Err(refuse(conflict, self.name()));
        }
        Ok(StrategyOutput::Resolved(side_wins(
            conflict,
            Winner::Remote,
            self.name(),
        )))
    }
}
