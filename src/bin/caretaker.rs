use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use caretaker_lib::audit::{AuditQuery, RunStatus};
use caretaker_lib::capability::catalog::{CapabilityCatalog, CapabilityFilter};
use caretaker_lib::capability::Capability;
use caretaker_lib::config::{resolve_data_dir, EngineConfig};
use caretaker_lib::helper::{HelperClient, LocalAuthority};
use caretaker_lib::permissions::{JsonPermissionSource, LoggingRemediator};
use caretaker_lib::preflight::HostProbe;
use caretaker_lib::runner::{OutputSink, ProcessRunner};
use caretaker_lib::{Engine, EngineServices};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::de::DeserializeOwned;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "caretaker")]
#[command(about = "Run catalog capabilities and inspect the audit log")]
#[command(version)]
struct Cli {
    /// Data directory (default: platform data dir, or $CARETAKER_DATA_DIR)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a capability
    Run {
        /// Capability id (e.g. diag.mem.pressure)
        id: String,
        /// Template argument as key=value; repeatable
        #[arg(long = "arg", short = 'a')]
        args: Vec<String>,
        /// Print the full result as JSON instead of streaming output
        #[arg(long)]
        json: bool,
    },
    /// List capabilities
    List {
        #[arg(long)]
        group: Option<String>,
        /// user, elevated, automation or fullDiskAccess
        #[arg(long)]
        privilege: Option<String>,
        /// safe, moderate or destructive
        #[arg(long)]
        risk: Option<String>,
    },
    /// Search capabilities by id, title, description or group
    Search { query: String },
    /// Query the audit log, newest first
    Audit {
        #[arg(long)]
        capability: Option<String>,
        /// success, failed, timeout, cancelled, rejected or error
        #[arg(long)]
        status: Option<String>,
        /// RFC 3339 timestamp
        #[arg(long)]
        since: Option<DateTime<Utc>>,
        /// RFC 3339 timestamp
        #[arg(long)]
        until: Option<DateTime<Utc>>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
    /// Export audit records in a date range to a JSON file
    Export {
        #[arg(long)]
        from: DateTime<Utc>,
        #[arg(long)]
        to: DateTime<Utc>,
    },
    /// Verify the audit hash chain
    Verify,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("CARETAKER_LOG").unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let data_dir = resolve_data_dir(cli.data_dir)?;
    let config = EngineConfig::load(&data_dir)
        .with_context(|| format!("Failed to load config from {}", data_dir.display()))?;

    match cli.command {
        Commands::Run { id, args, json } => run(&config, &id, &args, json).await,
        Commands::List {
            group,
            privilege,
            risk,
        } => {
            let catalog = load_catalog(&config)?;
            let filter = CapabilityFilter {
                group,
                privilege: privilege.as_deref().map(parse_tag).transpose()?,
                risk: risk.as_deref().map(parse_tag).transpose()?,
            };
            print_capabilities(&catalog.all(Some(&filter)));
            Ok(())
        }
        Commands::Search { query } => {
            let catalog = load_catalog(&config)?;
            print_capabilities(&catalog.search(&query));
            Ok(())
        }
        Commands::Audit {
            capability,
            status,
            since,
            until,
            limit,
            offset,
        } => {
            let status = match status {
                Some(s) => {
                    Some(RunStatus::parse(&s).ok_or_else(|| anyhow!("Unknown status '{}'", s))?)
                }
                None => None,
            };
            let engine = build_engine(&config)?;
            let records = engine.query_audit_log(&AuditQuery {
                capability_id: capability,
                status,
                since,
                until,
                limit: Some(limit),
                offset: Some(offset),
            })?;
            for r in &records {
                println!(
                    "#{:<5} {}  {:<28} {:<9} exit={:<4} {}",
                    r.sequence,
                    r.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    r.capability_id,
                    r.status.as_str(),
                    r.exit_code.map(|c| c.to_string()).unwrap_or_else(|| "-".into()),
                    r.parsed_summary.as_deref().or(r.error.as_deref()).unwrap_or("")
                );
            }
            Ok(())
        }
        Commands::Export { from, to } => {
            let engine = build_engine(&config)?;
            let path = engine.export_audit_log(from, to)?;
            println!("{}", path.display());
            Ok(())
        }
        Commands::Verify => {
            let engine = build_engine(&config)?;
            let result = engine.verify_audit_log()?;
            match result.first_break {
                None => {
                    println!("Audit chain intact ({} records)", result.records_checked);
                    Ok(())
                }
                Some(brk) => bail!(
                    "Audit chain broken at sequence {} (record {}): {:?}",
                    brk.sequence,
                    brk.record_id,
                    brk.reason
                ),
            }
        }
    }
}

async fn run(config: &EngineConfig, id: &str, raw_args: &[String], json: bool) -> Result<()> {
    let mut arguments = HashMap::new();
    for raw in raw_args {
        let (key, value) = raw
            .split_once('=')
            .ok_or_else(|| anyhow!("Argument '{}' is not key=value", raw))?;
        arguments.insert(key.to_string(), value.to_string());
    }

    let engine = Arc::new(build_engine(config)?);
    let on_interrupt = engine.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Cancelling...");
            on_interrupt.cancel();
        }
    });

    let sink = if json {
        OutputSink::none()
    } else {
        OutputSink {
            on_stdout: Some(Arc::new(|line: &str| println!("{}", line))),
            on_stderr: Some(Arc::new(|line: &str| eprintln!("{}", line))),
        }
    };

    let result = engine
        .execute_with(id, &arguments, sink)
        .await
        .map_err(|e| anyhow!("[{}] {}", e.kind(), e))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        if let Some(ref parsed) = result.parsed_output {
            eprintln!("-- {}", parsed.summary());
        }
        eprintln!(
            "-- {} in {} ms (exit {})",
            result.status.as_str(),
            result.duration_ms,
            result.exit_code.map(|c| c.to_string()).unwrap_or_else(|| "-".into())
        );
    }

    match result.exit_code {
        Some(0) => Ok(()),
        Some(code) => std::process::exit(code),
        None => std::process::exit(1),
    }
}

fn load_catalog(config: &EngineConfig) -> Result<CapabilityCatalog> {
    let path = config.catalog_path();
    CapabilityCatalog::load(&path)
        .with_context(|| format!("Failed to load catalog {}", path.display()))
}

fn build_engine(config: &EngineConfig) -> Result<Engine> {
    let catalog = Arc::new(load_catalog(config)?);
    let (audit, blobs) = Engine::open_audit(config)?;
    let authority = LocalAuthority::load_or_create(config.data_dir(), config.token_ttl())?;

    Ok(Engine::new(EngineServices {
        catalog,
        permissions: Arc::new(JsonPermissionSource::new(config.data_dir())),
        remediator: Arc::new(LoggingRemediator),
        probe: Arc::new(HostProbe),
        runner: Arc::new(ProcessRunner::new(&config.runner)),
        remote: Arc::new(HelperClient::from_config(config)),
        authorizer: Arc::new(authority),
        audit,
        blobs,
    }))
}

/// Parse a camelCase/lowercase tag the way the catalog spells it.
fn parse_tag<T: DeserializeOwned>(tag: &str) -> Result<T> {
    serde_json::from_value(serde_json::Value::String(tag.to_string()))
        .map_err(|_| anyhow!("Unknown value '{}'", tag))
}

fn print_capabilities(capabilities: &[Arc<Capability>]) {
    for cap in capabilities {
        println!(
            "{:<28} {:<14} {:<11} {:<14} {}",
            cap.id,
            cap.group,
            cap.risk_class.as_str(),
            cap.privilege_level.as_str(),
            cap.title
        );
    }
}
