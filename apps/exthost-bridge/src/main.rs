use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use exthost_bridge::cli::Cli;
use exthost_bridge::config::BridgeConfig;
use exthost_bridge::metrics;
use exthost_bridge::rpc::registry::{
    ConsoleService, PingService, Pong, TracingConsole, MAIN_THREAD_CONSOLE, PING,
};
use exthost_bridge::session::{ExtensionHostSession, SessionEvent};
use exthost_bridge::telemetry::logging;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("exthost-bridge: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let log_config = cli.logging.to_config();
    logging::init(&log_config).context("initializing logging")?;
    debug!(log_level = ?log_config.level, log_file = ?log_config.file, "logging configured");

    let mut config = BridgeConfig::from_env();
    cli.apply(&mut config);

    let mut session = ExtensionHostSession::start(config, |rpc| {
        let ping: Arc<dyn PingService> = Arc::new(Pong);
        let console: Arc<dyn ConsoleService> = Arc::new(TracingConsole);
        rpc.set(&PING, ping);
        rpc.set(&MAIN_THREAD_CONSOLE, console);
    })
    .await
    .context("starting extension host session")?;
    info!(
        target = "exthost::bridge",
        address = ?session.address(),
        "extension host session running"
    );

    let mut events = session.subscribe();
    let outcome = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!(target = "exthost::bridge", "interrupted; shutting down");
                break Ok(());
            }
            event = events.recv() => match event {
                Ok(SessionEvent::Fatal { reason }) => {
                    error!(target = "exthost::bridge", reason = %reason, "session failed");
                    break Err(anyhow::anyhow!(reason));
                }
                Ok(SessionEvent::WorkerExited(exit)) if exit.expected => break Ok(()),
                Ok(SessionEvent::PeerClosed) => break Ok(()),
                Ok(event) => debug!(target = "exthost::bridge", event = ?event, "session event"),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(target = "exthost::bridge", skipped, "session events lagged");
                }
                Err(RecvError::Closed) => break Ok(()),
            },
        }
    };

    session.stop().await;
    debug!(target = "exthost::bridge", metrics = %metrics::render(), "final metrics");
    outcome
}
