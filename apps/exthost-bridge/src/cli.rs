use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser};

use crate::config::BridgeConfig;
use crate::telemetry::logging::{LogConfig, LogLevel, ENV_LOG_FILE, ENV_LOG_LEVEL};

#[derive(Parser, Debug)]
#[command(
    name = "exthost-bridge",
    about = "Launch an extension runtime and serve the host side of its RPC bridge",
    author,
    version
)]
pub struct Cli {
    #[arg(
        long,
        value_name = "PATH",
        help = "Extension runtime executable (overrides EXTHOST_BRIDGE_RUNTIME)"
    )]
    pub runtime: Option<PathBuf>,

    #[arg(
        long = "runtime-arg",
        value_name = "ARG",
        allow_hyphen_values = true,
        help = "Extra argument passed to the runtime before the address; repeatable"
    )]
    pub runtime_args: Vec<String>,

    #[arg(
        long,
        value_name = "PATH",
        help = "Workspace the session serves; scopes the socket name"
    )]
    pub workspace: Option<String>,

    #[arg(long, help = "Listen on loopback TCP even where Unix sockets are available")]
    pub force_tcp: bool,

    #[arg(long, value_name = "DIR", help = "Directory for the session socket")]
    pub socket_dir: Option<PathBuf>,

    #[arg(
        long,
        value_name = "HOST:PORT",
        help = "Connect to an already running runtime instead of spawning one"
    )]
    pub debug_connect: Option<SocketAddr>,

    #[arg(long, value_name = "MS", help = "How long a dropped runtime may take to reconnect")]
    pub reconnection_grace_ms: Option<u64>,

    #[arg(long, value_name = "MS", help = "Outbound call timeout; 0 disables it")]
    pub call_timeout_ms: Option<u64>,

    #[command(flatten)]
    pub logging: LoggingArgs,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = ENV_LOG_LEVEL,
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = ENV_LOG_FILE,
        help = "Write structured logs to the specified file"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

impl Cli {
    /// Flags win over environment defaults.
    pub fn apply(&self, config: &mut BridgeConfig) {
        if let Some(runtime) = &self.runtime {
            config.worker.program = runtime.clone();
        }
        if !self.runtime_args.is_empty() {
            config.worker.args = self.runtime_args.clone();
        }
        if let Some(workspace) = &self.workspace {
            config.context_hint = workspace.clone();
            config.worker.current_dir = Some(PathBuf::from(workspace));
        }
        if self.force_tcp {
            config.transport.force_tcp = true;
        }
        if let Some(dir) = &self.socket_dir {
            config.transport.socket_dir = dir.clone();
        }
        if let Some(addr) = self.debug_connect {
            config.debug_connect = Some(addr);
        }
        if let Some(ms) = self.reconnection_grace_ms {
            config.protocol.reconnection_grace = Duration::from_millis(ms);
        }
        if let Some(ms) = self.call_timeout_ms {
            config.rpc.call_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }
    }
}
