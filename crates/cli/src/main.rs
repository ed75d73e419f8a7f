//! ContentSync command-line management tool.
//!
//! Provides subcommands for inspecting per-content-type sync state, running
//! delta queries and three-way diffs, reconciling snapshots, working the
//! conflict log, and generating / validating configuration files.

mod style;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL, Cell, ContentArrangement, Table};
use serde_json::{json, Value};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use contentsync_core::config::AppConfig;
use contentsync_core::delta::DeltaRequest;
use contentsync_core::diff::{Snapshot, ThreeWayDiffEngine};
use contentsync_core::models::ConflictLogFilter;
use contentsync_core::resolution::{
    ContentConflict, ManualChoice, ResolutionResult, ResolutionStrategyManager,
};
use contentsync_core::sync_engine::{ReconcileReport, ReconcileRequest, SyncEngine};

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// ContentSync command-line management tool.
#[derive(Parser, Debug)]
#[command(
    name = "contentsync",
    version,
    about = "Inspect and drive three-way content reconciliation"
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(
        short,
        long,
        global = true,
        default_value = "/etc/contentsync/config.toml"
    )]
    config: PathBuf,

    /// Log level filter; defaults to the configured level.
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show sync state for every tracked content type.
    Status,

    /// Decide which sync action the current hashes call for.
    Delta {
        /// Content type key.
        #[arg(long = "type")]
        type_key: String,

        /// Current local content hash.
        #[arg(long)]
        local: String,

        /// Current remote content hash.
        #[arg(long)]
        remote: String,
    },

    /// Three-way diff of snapshot files without touching sync state.
    Diff(SnapshotArgs),

    /// Reconcile snapshot files and record the outcome.
    #[command(alias = "resolve")]
    Reconcile {
        /// Content type key.
        #[arg(long = "type")]
        type_key: String,

        #[command(flatten)]
        input: SnapshotArgs,
    },

    /// Record that both sides now hold the content with this hash.
    Complete {
        #[arg(long = "type")]
        type_key: String,

        #[arg(long)]
        hash: String,
    },

    /// Record that writing a sync to either side failed.
    Fail {
        #[arg(long = "type")]
        type_key: String,

        #[arg(long)]
        reason: String,
    },

    /// Revert a content type to its last known-good state.
    Rollback {
        #[arg(long = "type")]
        type_key: String,
    },

    /// List the registered resolution strategies.
    Strategies,

    /// Work the conflict log.
    Conflicts {
        #[command(subcommand)]
        action: ConflictsAction,
    },

    /// Find syncs that were interrupted and optionally mark them failed.
    Interrupted {
        #[arg(long)]
        recover: bool,
    },

    /// Generate a default configuration file.
    Init {
        /// Output path for the generated config file.
        #[arg(short, long, default_value = "./contentsync.toml")]
        output: PathBuf,
    },

    /// Validate a configuration file.
    Validate,
}

#[derive(Args, Debug)]
struct SnapshotArgs {
    /// JSON file with the local snapshot.
    #[arg(long)]
    local: PathBuf,

    /// JSON file with the remote snapshot.
    #[arg(long)]
    remote: PathBuf,

    /// JSON file with the common ancestor snapshot.
    #[arg(long)]
    ancestor: Option<PathBuf>,

    /// Strategy to use instead of automatic selection.
    #[arg(long)]
    strategy: Option<String>,

    /// The record's shape changed; never let one side win wholesale.
    #[arg(long)]
    structural: bool,

    /// Print machine-readable JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Subcommand, Debug)]
enum ConflictsAction {
    /// List conflict log entries, newest first.
    List {
        /// Only entries for this content type.
        #[arg(long = "type")]
        type_key: Option<String>,

        /// Only entries without a resolution.
        #[arg(long)]
        unresolved: bool,

        #[arg(long, default_value = "20")]
        limit: u32,
    },
    /// Show one entry in full.
    Show { id: i64 },
    /// Resolve an entry with per-field choices.
    Resolve {
        id: i64,

        /// `field=local|remote|ancestor`, repeatable.
        #[arg(long = "choice")]
        choices: Vec<String>,

        /// `field=<json>`, repeatable. Values that are not JSON are taken as
        /// strings.
        #[arg(long = "custom")]
        customs: Vec<String>,

        /// Who is resolving.
        #[arg(long, default_value = "cli")]
        by: String,
    },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", style::error(&format!("{:#}", e)));
            ExitCode::FAILURE
        }
    }
}

fn init_logging(cli: &Cli) {
    let level = cli.log_level.clone().unwrap_or_else(|| {
        AppConfig::load_from_file(&cli.config)
            .map(|c| c.logging.level)
            .unwrap_or_else(|_| "warn".to_string())
    });
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Init { output } => cmd_init(&output),
        Commands::Validate => cmd_validate(&cli.config),
        Commands::Diff(args) => cmd_diff(&cli.config, &args),
        Commands::Strategies => cmd_strategies(&cli.config),
        command => {
            // Everything else needs the configured sync-state database.
            let config = load_config(&cli.config)?;
            let engine = SyncEngine::from_config(&config).context("failed to open sync state")?;

            match command {
                Commands::Status => cmd_status(&engine),
                Commands::Delta {
                    type_key,
                    local,
                    remote,
                } => cmd_delta(&engine, type_key, local, remote),
                Commands::Reconcile { type_key, input } => {
                    cmd_reconcile(&engine, type_key, &input).await
                }
                Commands::Complete { type_key, hash } => {
                    let state = engine.complete_sync(&type_key, &hash, &hash).await?;
                    println!(
                        "{}",
                        style::success(&format!("{} is {}", type_key, state.sync_status))
                    );
                    Ok(())
                }
                Commands::Fail { type_key, reason } => {
                    let state = engine.fail_sync(&type_key, &reason).await?;
                    println!(
                        "{}",
                        style::warn(&format!("{} is {}", type_key, state.sync_status))
                    );
                    Ok(())
                }
                Commands::Rollback { type_key } => {
                    let state = engine.rollback(&type_key).await?;
                    println!(
                        "{}",
                        style::success(&format!(
                            "{} rolled back to {} ({})",
                            type_key,
                            style::short_hash(state.local_hash.as_deref()),
                            state.sync_status
                        ))
                    );
                    Ok(())
                }
                Commands::Conflicts { action } => cmd_conflicts(&engine, action).await,
                Commands::Interrupted { recover } => cmd_interrupted(&engine, recover).await,
                _ => unreachable!(),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Config helpers
// ---------------------------------------------------------------------------

fn load_config(path: &Path) -> Result<AppConfig> {
    let config = AppConfig::load_and_validate(path).context("failed to load configuration file")?;
    debug!(database = %config.store.database_path().display(), "configuration loaded");
    Ok(config)
}

/// Built-in strategies, honoring the configured default when a config file
/// is present.
fn strategy_manager(config_path: &Path) -> Result<ResolutionStrategyManager> {
    if !config_path.exists() {
        return Ok(ResolutionStrategyManager::with_builtin_strategies());
    }
    let config = load_config(config_path)?;
    Ok(ResolutionStrategyManager::from_config(&config.resolution)?)
}

fn read_snapshot(path: &Path) -> Result<Snapshot> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let value: Value = serde_json::from_str(&raw)
        .with_context(|| format!("{} is not valid JSON", path.display()))?;
    Snapshot::from_json(value).with_context(|| format!("{} is not a snapshot", path.display()))
}

fn read_request(type_key: String, input: &SnapshotArgs) -> Result<ReconcileRequest> {
    let mut request = ReconcileRequest::new(
        type_key,
        read_snapshot(&input.local)?,
        read_snapshot(&input.remote)?,
    );
    if let Some(path) = &input.ancestor {
        request = request.with_ancestor(read_snapshot(path)?);
    }
    request.strategy = input.strategy.clone();
    request.structural = input.structural;
    Ok(request)
}

// ---------------------------------------------------------------------------
// Subcommand implementations
// ---------------------------------------------------------------------------

fn cmd_init(output: &Path) -> Result<()> {
    let default_config = r#"# ContentSync Configuration

[store]
data_dir = "/var/lib/contentsync"
database_file = "contentsync.db"

[logging]
level = "info"

[resolution]
# One of: local_wins, remote_wins, auto_merge, manual_merge.
# Used when no other strategy can resolve a conflict on its own.
default_strategy = "manual_merge"

[sync]
# A content type left in `syncing` longer than this counts as interrupted.
stale_after_secs = 900
"#;

    if output.exists() {
        anyhow::bail!(
            "file already exists: {}. Use a different path or remove the existing file.",
            output.display()
        );
    }

    std::fs::write(output, default_config).context("failed to write config file")?;

    println!("{}", style::success(&format!("Configuration written to {}", output.display())));
    println!();
    println!("Next steps:");
    println!("  1. Point store.data_dir at a writable directory");
    println!(
        "  2. Validate with: contentsync validate --config {}",
        output.display()
    );
    Ok(())
}

fn cmd_validate(config_path: &Path) -> Result<()> {
    println!("Validating configuration: {}", config_path.display());
    println!();

    let config = AppConfig::load_from_file(config_path).context("failed to parse configuration")?;
    println!("  [OK] TOML structure is valid");

    match config.validate() {
        Ok(()) => println!("  [OK] All fields are valid"),
        Err(e) => {
            println!("  [FAIL] Validation error: {}", e);
            anyhow::bail!("configuration validation failed");
        }
    }

    println!();
    println!("Configuration summary:");
    println!("  Database         : {}", config.store.database_path().display());
    println!("  Log level        : {}", config.logging.level);
    println!("  Default strategy : {}", config.resolution.default_strategy);
    println!("  Stale after      : {}s", config.sync.stale_after_secs);
    println!();
    println!("Configuration is valid.");
    Ok(())
}

fn cmd_status(engine: &SyncEngine) -> Result<()> {
    let states = engine.store().list_all().context("failed to list sync state")?;
    let unresolved = engine
        .conflict_log()
        .count_unresolved(None)
        .context("failed to count conflicts")?;

    println!();
    println!("{}", style::header("ContentSync Status"));
    println!();

    if states.is_empty() {
        println!("{}", style::dim("No content types tracked yet."));
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        "Type", "Status", "Conflict", "Local", "Remote", "Last synced", "Last sync at",
    ]);

    for s in &states {
        table.add_row(vec![
            Cell::new(&s.type_key),
            Cell::new(style::sync_status(s.sync_status)),
            Cell::new(style::conflict_status(s.conflict_status)),
            Cell::new(style::short_hash(s.local_hash.as_deref())),
            Cell::new(style::short_hash(s.remote_hash.as_deref())),
            Cell::new(style::short_hash(s.last_synced_hash.as_deref())),
            Cell::new(
                s.last_sync_at
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| "never".to_string()),
            ),
        ]);
    }

    println!("{}", table);
    println!();
    println!("  Content types        : {}", states.len());
    println!("  Unresolved conflicts : {}", unresolved);
    println!();
    Ok(())
}

fn cmd_delta(engine: &SyncEngine, type_key: String, local: String, remote: String) -> Result<()> {
    let response = engine.query_delta(&DeltaRequest {
        type_key,
        current_local_hash: local,
        current_remote_hash: remote,
    })?;

    println!("  Action         : {}", response.delta.action);
    println!("  Rationale      : {}", response.delta.rationale);
    println!("  Recommendation : {}", response.recommendation);
    match &response.current_state {
        Some(state) => println!("  Stored status  : {}", style::sync_status(state.sync_status)),
        None => println!("  Stored status  : {}", style::dim("untracked")),
    }
    Ok(())
}

fn cmd_diff(config_path: &Path, args: &SnapshotArgs) -> Result<()> {
    let request = read_request("preview".into(), args)?;
    let manager = strategy_manager(config_path)?;

    let diff = ThreeWayDiffEngine::compare_versions(
        Some(&request.local),
        Some(&request.remote),
        request.ancestor.as_ref(),
    );
    let conflict = ContentConflict::from_diff(&diff).with_structural(request.structural);
    let result = manager.resolve_conflict(&conflict, request.strategy.as_deref());
    let fields = ThreeWayDiffEngine::generate_field_level_diff(&diff);

    if args.json {
        let out = json!({
            "summary": diff.summary(),
            "conflicts": diff.conflicts,
            "mergeable_changes": diff.mergeable_changes,
            "fields": fields,
            "result": result,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Field", "Ancestor", "Local", "Remote", ""]);
    for f in &fields {
        let marker = if f.conflict {
            style::error("conflict")
        } else {
            match (f.local_changed, f.remote_changed) {
                (true, true) => "both (same)".to_string(),
                (true, false) => "local".to_string(),
                (false, true) => "remote".to_string(),
                (false, false) => String::new(),
            }
        };
        table.add_row(vec![
            Cell::new(&f.field),
            Cell::new(render(f.ancestor_value.as_ref())),
            Cell::new(render(f.local_value.as_ref())),
            Cell::new(render(f.remote_value.as_ref())),
            Cell::new(marker),
        ]);
    }

    println!("{}", table);
    println!();
    println!("  Divergence : {:.3}", diff.divergence);
    println!("  Conflicts  : {}", diff.conflicts.len());
    println!("  Mergeable  : {}", diff.mergeable_changes.len());
    println!();
    print_result(&result);
    Ok(())
}

async fn cmd_reconcile(engine: &SyncEngine, type_key: String, input: &SnapshotArgs) -> Result<()> {
    let request = read_request(type_key, input)?;
    let report = engine.reconcile(request).await?;

    if input.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    print_report(&report)
}

fn print_report(report: &ReconcileReport) -> Result<()> {
    println!("  Attempt    : {}", style::dim(&report.attempt_id.to_string()));
    println!("  Action     : {} ({})", report.delta.action, report.delta.rationale);
    println!("  Outcome    : {}", style::outcome(report.outcome));
    if let Some(summary) = &report.diff {
        println!(
            "  Conflicts  : {} ({} mergeable change(s), divergence {:.3})",
            summary.conflict_count, summary.mergeable_count, summary.divergence
        );
    }
    if let Some(id) = report.conflict_log_id {
        println!("  Log entry  : #{}", id);
    }
    if let Some(state) = &report.state {
        println!(
            "  State      : {} / {}",
            style::sync_status(state.sync_status),
            style::conflict_status(state.conflict_status)
        );
    }
    if let Some(result) = &report.result {
        println!();
        print_result(result);
    }

    if let (Some(resolution), Some(hash)) = (report.merged(), &report.resolved_hash) {
        if report.outcome == contentsync_core::ReconcileOutcome::Resolved {
            println!();
            println!("Merged content:");
            println!("{}", serde_json::to_string_pretty(&resolution.merged)?);
            println!();
            println!("Write it to both sides, then run:");
            println!("  contentsync complete --type {} --hash {}", report.type_key, hash);
        }
    }
    Ok(())
}

fn print_result(result: &ResolutionResult) {
    match result {
        ResolutionResult::Resolved {
            resolution,
            strategy_used,
            auto_resolved,
        } => {
            let how = if *auto_resolved { "automatically" } else { "by request" };
            println!(
                "{}",
                style::success(&format!(
                    "resolved {} with {} (winner: {})",
                    how, strategy_used, resolution.winner
                ))
            );
            println!("  {}", resolution.description);
            for c in &resolution.conflicts {
                println!("  {}", style::warn(&format!("{} still needs a decision ({})", c.field, c.conflict_type)));
            }
        }
        ResolutionResult::ManualRequired {
            manual_resolution_data,
            ..
        } => {
            println!("{}", style::warn(&manual_resolution_data.description));
            for f in &manual_resolution_data.fields {
                println!(
                    "  {} [{}]  local={}  remote={}  ancestor={}{}",
                    f.field,
                    f.conflict_type,
                    render(f.options.local.as_ref()),
                    render(f.options.remote.as_ref()),
                    render(f.options.ancestor.as_ref()),
                    f.options
                        .custom
                        .as_ref()
                        .map(|v| format!("  proposed={}", render(Some(v))))
                        .unwrap_or_default(),
                );
            }
        }
        ResolutionResult::Failed { error, .. } => {
            println!("{}", style::error(&format!("resolution failed: {}", error)));
        }
    }
}

fn cmd_strategies(config_path: &Path) -> Result<()> {
    let manager = strategy_manager(config_path)?;

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Name", "Automatic", "Description"]);
    for info in manager.available_strategies() {
        let name = if info.name == manager.default_strategy() {
            format!("{} (default)", info.name)
        } else {
            info.name.clone()
        };
        table.add_row(vec![
            Cell::new(name),
            Cell::new(if info.auto_resolves { "yes" } else { "no" }),
            Cell::new(&info.description),
        ]);
    }
    println!("{}", table);
    Ok(())
}

async fn cmd_conflicts(engine: &SyncEngine, action: ConflictsAction) -> Result<()> {
    match action {
        ConflictsAction::List {
            type_key,
            unresolved,
            limit,
        } => {
            let entries = engine
                .conflict_log()
                .list(&ConflictLogFilter {
                    type_key,
                    unresolved_only: unresolved,
                    limit: Some(limit),
                })
                .context("failed to list conflicts")?;

            if entries.is_empty() {
                println!("{}", style::success("No conflicts found"));
                return Ok(());
            }

            let mut table = Table::new();
            table.load_preset(UTF8_FULL);
            table.set_content_arrangement(ContentArrangement::Dynamic);
            table.set_header(vec!["ID", "Type", "Conflict", "Resolved by", "Created"]);
            for e in &entries {
                table.add_row(vec![
                    Cell::new(e.id),
                    Cell::new(&e.type_key),
                    Cell::new(&e.conflict_type),
                    Cell::new(e.resolved_by.as_deref().unwrap_or("—")),
                    Cell::new(e.created_at.format("%Y-%m-%d %H:%M").to_string()),
                ]);
            }
            println!("{}", table);
            println!();
            println!("{} entr(ies) shown", entries.len());
            Ok(())
        }

        ConflictsAction::Show { id } => {
            let entry = engine.conflict_log().get_entry(id)?;

            println!("{}", style::header(&format!("Conflict #{}", entry.id)));
            println!();
            println!("  Type key      : {}", entry.type_key);
            println!("  Conflict type : {}", entry.conflict_type);
            println!("  Local hash    : {}", entry.local_hash.as_deref().unwrap_or("-"));
            println!("  Remote hash   : {}", entry.remote_hash.as_deref().unwrap_or("-"));
            println!("  Ancestor hash : {}", entry.ancestor_hash.as_deref().unwrap_or("-"));
            println!("  Created at    : {}", entry.created_at.to_rfc3339());
            match (&entry.resolved_at, &entry.resolved_by) {
                (Some(at), by) => {
                    println!("  Resolved at   : {}", at.to_rfc3339());
                    println!("  Resolved by   : {}", by.as_deref().unwrap_or("-"));
                }
                (None, _) => println!("  Resolved      : {}", style::warn("no")),
            }
            println!();
            println!("Details:");
            println!("{}", serde_json::to_string_pretty(&entry.conflict_details["summary"])?);
            if let Some(resolution) = &entry.resolution {
                println!();
                println!("Resolution:");
                println!("{}", serde_json::to_string_pretty(resolution)?);
            }
            Ok(())
        }

        ConflictsAction::Resolve {
            id,
            choices,
            customs,
            by,
        } => {
            let mut picks = BTreeMap::new();
            for raw in &choices {
                let (field, choice) = parse_choice(raw)?;
                picks.insert(field, choice);
            }
            for raw in &customs {
                let (field, choice) = parse_custom(raw)?;
                picks.insert(field, choice);
            }

            let report = engine.apply_manual_resolution(id, &picks, &by).await?;
            println!(
                "{}",
                style::success(&format!("Conflict #{} resolved by {}", id, by))
            );
            println!("{}", serde_json::to_string_pretty(&report.resolution.merged)?);
            if report.state_updated {
                println!();
                println!("Write it to both sides, then run:");
                println!(
                    "  contentsync complete --type {} --hash {}",
                    report.state.type_key, report.resolved_hash
                );
            } else {
                println!(
                    "{}",
                    style::dim("The content type has moved on; its sync state was left as is.")
                );
            }
            Ok(())
        }
    }
}

async fn cmd_interrupted(engine: &SyncEngine, recover: bool) -> Result<()> {
    let stuck = if recover {
        engine.recover_interrupted().await?
    } else {
        engine.detect_interrupted()?
    };

    if stuck.is_empty() {
        println!("{}", style::success("No interrupted syncs"));
        return Ok(());
    }
    for s in &stuck {
        println!(
            "  {}  {}  since {}",
            s.type_key,
            style::sync_status(s.sync_status),
            s.updated_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    if !recover {
        println!();
        println!("Run with --recover to mark them failed.");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Utilities
// ---------------------------------------------------------------------------

fn parse_choice(raw: &str) -> Result<(String, ManualChoice)> {
    let (field, pick) = raw
        .split_once('=')
        .ok_or_else(|| anyhow::anyhow!("invalid choice '{}': expected field=local|remote|ancestor", raw))?;
    let choice = match pick {
        "local" => ManualChoice::Local,
        "remote" => ManualChoice::Remote,
        "ancestor" => ManualChoice::Ancestor,
        other => anyhow::bail!("invalid pick '{}': use local, remote or ancestor", other),
    };
    Ok((field.to_string(), choice))
}

fn parse_custom(raw: &str) -> Result<(String, ManualChoice)> {
    let (field, value) = raw
        .split_once('=')
        .ok_or_else(|| anyhow::anyhow!("invalid custom value '{}': expected field=<json>", raw))?;
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((field.to_string(), ManualChoice::Custom(value)))
}

fn render(value: Option<&Value>) -> String {
    match value {
        None => "—".to_string(),
        Some(v) => truncate(&v.to_string(), 40),
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_choice() {
        assert_eq!(
            parse_choice("price=remote").unwrap(),
            ("price".to_string(), ManualChoice::Remote)
        );
        assert!(parse_choice("price").is_err());
        assert!(parse_choice("price=newest").is_err());
    }

    #[test]
    fn test_parse_custom() {
        assert_eq!(
            parse_custom("tags=[\"a\",\"b\"]").unwrap().1,
            ManualChoice::Custom(json!(["a", "b"]))
        );
        assert_eq!(
            parse_custom("title=Hello world").unwrap().1,
            ManualChoice::Custom(json!("Hello world"))
        );
        assert_eq!(
            parse_custom("body=a=b").unwrap(),
            ("body".to_string(), ManualChoice::Custom(json!("a=b")))
        );
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdefghijkl", 8), "abcde...");
        assert_eq!(render(None), "—");
    }

    #[test]
    fn test_read_snapshot_envelope_and_bare() {
        let dir = tempfile::tempdir().unwrap();
        let bare = dir.path().join("bare.json");
        std::fs::write(&bare, r#"{"title": "A"}"#).unwrap();
        let envelope = dir.path().join("envelope.json");
        std::fs::write(&envelope, r#"{"data": {"title": "A"}, "hash": "abc"}"#).unwrap();

        assert_eq!(read_snapshot(&bare).unwrap().data["title"], json!("A"));
        let snap = read_snapshot(&envelope).unwrap();
        assert_eq!(snap.hash.as_deref(), Some("abc"));

        assert!(read_snapshot(&dir.path().join("missing.json")).is_err());
    }

    #[test]
    fn test_init_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("contentsync.toml");
        cmd_init(&path).unwrap();
        let parsed = AppConfig::load_and_validate(&path).unwrap();
        assert_eq!(parsed.resolution.default_strategy, "manual_merge");
        assert!(cmd_init(&path).is_err());
    }
}
