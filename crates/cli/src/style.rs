//! Terminal styling for CLI output.

use console::Style;

use contentsync_core::models::{ConflictStatus, SyncStatus};
use contentsync_core::sync_engine::ReconcileOutcome;

pub fn success(msg: &str) -> String {
    let style = Style::new().green();
    format!("{} {}", style.apply_to("✓"), msg)
}

pub fn error(msg: &str) -> String {
    let style = Style::new().red();
    format!("{} {}", style.apply_to("✗"), msg)
}

pub fn warn(msg: &str) -> String {
    let style = Style::new().yellow();
    format!("{} {}", style.apply_to("⚠"), msg)
}

pub fn header(msg: &str) -> String {
    Style::new().bold().apply_to(msg).to_string()
}

pub fn dim(msg: &str) -> String {
    Style::new().dim().apply_to(msg).to_string()
}

/// Colored sync status: green when in sync, red when failed, yellow while
/// work is outstanding.
pub fn sync_status(status: SyncStatus) -> String {
    let style = match status {
        SyncStatus::InSync => Style::new().green(),
        SyncStatus::Failed => Style::new().red().bold(),
        SyncStatus::Syncing => Style::new().cyan(),
        SyncStatus::New | SyncStatus::Pending | SyncStatus::Modified => Style::new().yellow(),
    };
    style.apply_to(status.as_str()).to_string()
}

pub fn conflict_status(status: ConflictStatus) -> String {
    let style = match status {
        ConflictStatus::Detected => Style::new().red(),
        ConflictStatus::Resolved => Style::new().green(),
        ConflictStatus::None => Style::new().dim(),
    };
    style.apply_to(status.as_str()).to_string()
}

pub fn outcome(outcome: ReconcileOutcome) -> String {
    let label = outcome.to_string();
    match outcome {
        ReconcileOutcome::Unchanged => dim(&label),
        ReconcileOutcome::Synced | ReconcileOutcome::Resolved => success(&label),
        ReconcileOutcome::ManualRequired => warn(&label),
    }
}

/// Abbreviate a content hash for tables.
pub fn short_hash(hash: Option<&str>) -> String {
    match hash {
        Some(h) => h.chars().take(12).collect(),
        None => "—".to_string(),
    }
}
