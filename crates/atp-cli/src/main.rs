use anyhow::{Context, Result};
use atp_core::{AuditConfig, AuditPaths};
use atp_pipeline::{
    EventEmitter, Processor, RecommendationManager, SettleController, SettleDecision,
};
use atp_storage::{FindingsLedger, StatsStore, TrustDecision};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "atp")]
#[command(about = "Agent telemetry pipeline", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Append one audit event and schedule a settle check
    Emit {
        /// Dotted event kind, e.g. review.completed
        kind: String,
        /// JSON payload for the event
        #[arg(long, default_value = "{}")]
        data: String,
        #[arg(long, default_value = "cli")]
        source: String,
        #[arg(long)]
        session: Option<String>,
        #[arg(long)]
        agent: Option<String>,
    },
    /// Sleep out the settle window, then launch a processor if elected
    SettleCheck {
        /// Timestamp observed by the scheduling emitter, epoch seconds
        timestamp: f64,
    },
    /// Run one processing pass over newly appended events
    Process,
    /// Inspect or transition recommendations
    Recommendations {
        #[command(subcommand)]
        action: RecommendationCommands,
    },
    /// Manage externally reported findings
    Findings {
        #[command(subcommand)]
        action: FindingCommands,
    },
    /// Apply retention policy to statistics and recommendations
    Prune,
}

#[derive(Subcommand)]
enum RecommendationCommands {
    List,
    Dismiss { id: String, reason: String },
    Resolve { id: String },
}

#[derive(Subcommand)]
enum FindingCommands {
    Record { id: String, summary: String },
    Dismiss { id: String, reason: String },
    Status { id: String },
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();

    let cli = Cli::parse();
    let root = std::env::current_dir().context("resolving working directory")?;
    let paths = AuditPaths::new(&root);
    let config = AuditConfig::load(&paths);

    match cli.command {
        Commands::Emit {
            kind,
            data,
            source,
            session,
            agent,
        } => {
            // Best-effort end to end: a malformed payload becomes an empty
            // map, and a failed append exits zero regardless.
            let data = serde_json::from_str(&data).unwrap_or_else(|err| {
                warn!(error = %err, "payload is not valid JSON, using empty object");
                serde_json::json!({})
            });
            let session = session.unwrap_or_else(resolve_session_id);
            let agent = agent.unwrap_or_else(resolve_agent);
            let emitter = EventEmitter::new(paths, config);
            if let Some(event) = emitter.emit(&kind, data, &source, &session, &agent) {
                spawn_settle_check(event.timestamp);
            }
        }
        Commands::SettleCheck { timestamp } => {
            // Never signals failure upstream; every defeat in the election
            // is a normal exit.
            let controller = SettleController::new(paths, config);
            let decision = controller.run(timestamp, spawn_processor);
            if !matches!(decision, SettleDecision::Proceed { .. }) {
                warn!(?decision, "settle check stood down");
            }
        }
        Commands::Process => {
            let store = StatsStore::open(&paths.stats_db)?;
            let processor = Processor::new(paths, config, &store, None);
            let report = processor.run_once(Utc::now())?;
            println!(
                "processed {} events, {} anomalies, cursor at {}",
                report.events_processed,
                report.anomalies.len(),
                report.cursor
            );
            for anomaly in &report.anomalies {
                println!("  [{}] {}", anomaly.severity.as_str(), anomaly.description);
            }
        }
        Commands::Recommendations { action } => {
            let now = Utc::now();
            let mut manager = RecommendationManager::load(&paths.recommendations, now);
            match action {
                RecommendationCommands::List => {
                    let active = manager.get_active(now);
                    if active.is_empty() {
                        println!("no active recommendations");
                    }
                    for rec in active {
                        println!(
                            "{}  {}  evidence={}  {}",
                            rec.id, rec.anomaly_type, rec.evidence_count, rec.suggestion
                        );
                    }
                }
                RecommendationCommands::Dismiss { id, reason } => {
                    if manager.dismiss(&id, &reason, now) {
                        println!("dismissed {id}");
                    } else {
                        anyhow::bail!("no active recommendation {id} (or empty reason)");
                    }
                }
                RecommendationCommands::Resolve { id } => {
                    if manager.resolve(&id, now) {
                        println!("resolved {id}");
                    } else {
                        anyhow::bail!("no active recommendation {id}");
                    }
                }
            }
        }
        Commands::Findings { action } => {
            let ledger = FindingsLedger::open(&paths.findings_db)?;
            let now = Utc::now();
            match action {
                FindingCommands::Record { id, summary } => {
                    ledger.record_finding(&id, &summary, now)?;
                    println!("recorded {id}");
                }
                FindingCommands::Dismiss { id, reason } => {
                    ledger.dismiss_finding(&id, &reason, now)?;
                    println!("dismissed {id}");
                }
                FindingCommands::Status { id } => {
                    let decision = match ledger.trust_decision(&id)? {
                        TrustDecision::Enforce => "enforce",
                        TrustDecision::Waive => "waive",
                    };
                    match ledger.finding_status(&id)? {
                        Some(status) => println!("{id}: {} ({decision})", status.as_str()),
                        None => println!("{id}: unknown ({decision})"),
                    }
                }
            }
        }
        Commands::Prune => {
            let now = Utc::now();
            let store = StatsStore::open(&paths.stats_db)?;
            let mut stats_removed = 0;
            if let Some(max_age) = config.retention.statistics_max_age() {
                stats_removed = store.prune_old_data(now - max_age)?;
            }
            let mut events_removed = 0;
            if let Some(max_age) = config.retention.events_max_age() {
                let processor = Processor::new(paths.clone(), config.clone(), &store, None);
                events_removed = processor.prune_events(now - max_age, now)?;
            }
            let mut manager = RecommendationManager::load(&paths.recommendations, now);
            let expired = manager.prune_expired(now);
            let mut terminal_removed = 0;
            if let Some(max_age) = config.retention.recommendations_max_age() {
                terminal_removed = manager.prune_terminal(now - max_age, now);
            }
            println!(
                "pruned {stats_removed} statistics rows, {events_removed} event lines, \
                 {expired} recommendations went stale, {terminal_removed} terminal records dropped"
            );
        }
    }

    Ok(())
}

fn resolve_session_id() -> String {
    std::env::var("ATP_SESSION").unwrap_or_else(|_| "unknown".to_string())
}

fn resolve_agent() -> String {
    std::env::var("ATP_AGENT").unwrap_or_else(|_| "main".to_string())
}

/// Detached settle check carrying the emitting timestamp. Failure to
/// spawn only costs this burst a debounce pass.
fn spawn_settle_check(timestamp: f64) {
    let Ok(exe) = std::env::current_exe() else {
        return;
    };
    let result = std::process::Command::new(exe)
        .arg("settle-check")
        .arg(format!("{timestamp:.6}"))
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn();
    if let Err(err) = result {
        warn!(error = %err, "failed to schedule settle check");
    }
}

/// Fire-and-forget processor launch; the settle check does not wait for
/// it and cannot cancel it.
fn spawn_processor() {
    let Ok(exe) = std::env::current_exe() else {
        return;
    };
    let result = std::process::Command::new(exe)
        .arg("process")
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn();
    if let Err(err) = result {
        warn!(error = %err, "failed to launch processor");
    }
}
