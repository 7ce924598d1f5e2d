//! Privileged helper: serves `helper.execute`, `helper.ping` and
//! `helper.version` on a Unix socket and nothing else.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use caretaker_lib::config::{resolve_data_dir, EngineConfig};
use caretaker_lib::helper::service::RunnerFactory;
use caretaker_lib::helper::{server, HelperService, TokenVerifier};
use caretaker_lib::runner::{CommandRunner, ProcessRunner};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "caretaker-helper")]
#[command(about = "Privileged helper for elevated caretaker capabilities")]
#[command(version)]
struct Cli {
    /// Data directory holding config.json and authority.pub
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Socket to listen on (overrides config)
    #[arg(long)]
    socket: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("CARETAKER_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let cli = Cli::parse();
    let data_dir = resolve_data_dir(cli.data_dir)?;
    let config = EngineConfig::load(&data_dir)?;

    let key_path = config.authority_public_key_path();
    let verifier = TokenVerifier::load(&key_path)
        .with_context(|| format!("Cannot load authority key {}", key_path.display()))?;

    let settings = config.runner.clone();
    let runners: RunnerFactory =
        Arc::new(move || Arc::new(ProcessRunner::new(&settings)) as Arc<dyn CommandRunner>);
    let service = Arc::new(HelperService::new(
        runners,
        verifier,
        config.helper_max_runtime(),
    ));

    let socket = cli.socket.unwrap_or_else(|| config.helper_socket_path());
    let listener = server::bind(&socket)
        .with_context(|| format!("Cannot bind {}", socket.display()))?;
    tracing::info!("caretaker-helper listening on {}", socket.display());

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });

    server::serve(listener, service, shutdown).await?;
    let _ = std::fs::remove_file(&socket);
    Ok(())
}
