//! Minimal extension runtime: connects back to the host, answers
//! `ExtHostPing`, and pings the host once.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use clap::Parser;
use exthost_bridge::cli::LoggingArgs;
use exthost_bridge::rpc::registry::{PingService, Pong, EXT_HOST_PING, MAIN_THREAD_CONSOLE, PING};
use exthost_bridge::rpc::{RpcConfig, RpcProtocol};
use exthost_bridge::telemetry::logging;
use exthost_bridge::transform::IdentityTransformer;
use exthost_bridge::transport::{self, PersistentProtocol, ProtocolConfig, ProtocolEvent, TransportAddress};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(name = "exthost-stub", about = "Reference extension runtime for the bridge")]
struct Cli {
    /// Address handed over by the host: a socket path or a loopback port.
    address: String,

    #[arg(long, default_value = "pong", help = "Result expected from the host's Ping")]
    expect: String,

    #[arg(
        long,
        default_value_t = 10_000,
        help = "Fail when the host's Ping reply takes longer than this many milliseconds"
    )]
    ping_timeout_ms: u64,

    #[arg(long, help = "Keep serving calls until the host disconnects")]
    serve: bool,

    #[command(flatten)]
    logging: LoggingArgs,
}

#[tokio::main]
async fn main() {
    match run().await {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(err) => {
            eprintln!("exthost-stub: {err:#}");
            std::process::exit(1);
        }
    }
}

async fn run() -> anyhow::Result<bool> {
    let cli = Cli::parse();
    logging::init(&cli.logging.to_config()).context("initializing logging")?;

    let address = TransportAddress::parse(&cli.address);
    let stream = transport::connect(&address)
        .await
        .with_context(|| format!("connecting to {address}"))?;
    let (protocol, frames) = PersistentProtocol::new(ProtocolConfig::default());
    let mut events = protocol.subscribe();
    protocol.attach(stream)?;

    let rpc = RpcProtocol::new(
        protocol.clone(),
        frames,
        Arc::new(IdentityTransformer),
        RpcConfig::default(),
    );
    let ping: Arc<dyn PingService> = Arc::new(Pong);
    rpc.set(&EXT_HOST_PING, ping);

    let console = rpc.get_proxy(&MAIN_THREAD_CONSOLE);
    if let Err(err) = console.log(2, format!("exthost-stub connected to {address}")) {
        warn!(target = "exthost::stub", error = %err, "console notification failed");
    }

    let ping_timeout = Duration::from_millis(cli.ping_timeout_ms);
    let result = tokio::time::timeout(ping_timeout, rpc.get_proxy(&PING).ping())
        .await
        .map_err(|_| anyhow!("no Ping reply within {ping_timeout:?}"))?
        .context("calling Ping.ping")?;
    println!("{result}");
    let matched = result == cli.expect;
    if !matched {
        warn!(target = "exthost::stub", expected = %cli.expect, actual = %result, "unexpected ping result");
    }

    if cli.serve {
        info!(target = "exthost::stub", "serving until the host disconnects");
        loop {
            match events.recv().await {
                Ok(ProtocolEvent::PeerClosed) | Ok(ProtocolEvent::Closed) => break,
                Ok(ProtocolEvent::Failed { reason }) => bail!("connection failed: {reason}"),
                Ok(event) => debug!(target = "exthost::stub", event = ?event, "protocol event"),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
        rpc.dispose();
    } else {
        rpc.dispose();
        if tokio::time::timeout(CLOSE_TIMEOUT, protocol.close()).await.is_err() {
            warn!(target = "exthost::stub", "disconnect not flushed before exit");
        }
    }
    Ok(matched)
}
