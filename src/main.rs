use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use dialtone_offline::agent::{Agent, HostCapabilities};
use dialtone_offline::config::Config;
use dialtone_offline::event::{Event, EventHandler};

#[derive(Parser, Debug)]
#[command(name = "dialtone-offline")]
#[command(about = "Offline resilience agent for the Dialtone voice notes client")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/dialtone/offline.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Drain the mutation queue once and exit
  #[arg(long)]
  flush: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = init_tracing()?;

  let config = Config::load(args.config.as_deref())?;
  let (mut agent, mut status_rx) = Agent::new(config, HostCapabilities::default())?;

  // Surface status updates in the agent log; an embedding host would
  // forward these to its indicator instead
  tokio::spawn(async move {
    while let Some(update) = status_rx.recv().await {
      tracing::info!(?update, "status");
    }
  });

  agent.start().await;

  if args.flush {
    agent.handle_event(Event::FlushRequested).await;
    return Ok(());
  }

  let mut events = EventHandler::new(agent.poll_interval());

  // Translate ctrl-c into a shutdown signal
  let shutdown_tx = events.sender();
  tokio::spawn(async move {
    if tokio::signal::ctrl_c().await.is_ok() {
      let _ = shutdown_tx.send(Event::Shutdown);
    }
  });

  agent.run(&mut events).await
}

/// Log to a daily-rotated file in the data directory. The returned guard
/// must stay alive for the lifetime of the process.
fn init_tracing() -> Result<tracing_appender::non_blocking::WorkerGuard> {
  let log_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?
    .join("dialtone")
    .join("logs");
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create log directory: {}", e))?;

  let appender = tracing_appender::rolling::daily(log_dir, "offline.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .with_writer(writer)
    .with_ansi(false)
    .init();

  Ok(guard)
}
