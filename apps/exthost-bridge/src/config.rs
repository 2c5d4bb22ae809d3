use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::process::WorkerConfig;
use crate::rpc::RpcConfig;
use crate::transport::{ProtocolConfig, TransportConfig};

pub const ENV_RUNTIME: &str = "EXTHOST_BRIDGE_RUNTIME";
pub const ENV_WORKSPACE: &str = "EXTHOST_BRIDGE_WORKSPACE";
pub const ENV_SOCKET_DIR: &str = "EXTHOST_BRIDGE_SOCKET_DIR";
pub const ENV_FORCE_TCP: &str = "EXTHOST_BRIDGE_FORCE_TCP";
pub const ENV_DEBUG_CONNECT: &str = "EXTHOST_BRIDGE_DEBUG_CONNECT";
pub const ENV_RECONNECTION_GRACE_MS: &str = "EXTHOST_BRIDGE_RECONNECTION_GRACE_MS";
pub const ENV_CALL_TIMEOUT_MS: &str = "EXTHOST_BRIDGE_CALL_TIMEOUT_MS";
pub const ENV_CONNECT_TIMEOUT_MS: &str = "EXTHOST_BRIDGE_CONNECT_TIMEOUT_MS";
pub const ENV_MAX_FRAME_BYTES: &str = "EXTHOST_BRIDGE_MAX_FRAME_BYTES";

/// Everything a session needs, passed down explicitly to each constructor.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub transport: TransportConfig,
    pub worker: WorkerConfig,
    pub protocol: ProtocolConfig,
    pub rpc: RpcConfig,
    /// How long to wait for the worker's first connection.
    pub connect_timeout: Duration,
    /// Connect to an already running runtime instead of spawning one.
    pub debug_connect: Option<SocketAddr>,
    /// Scopes the socket name, usually the workspace path.
    pub context_hint: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            worker: WorkerConfig::default(),
            protocol: ProtocolConfig::default(),
            rpc: RpcConfig::default(),
            connect_timeout: Duration::from_secs(10),
            debug_connect: None,
            context_hint: "default".into(),
        }
    }
}

impl BridgeConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(program) = env_string(ENV_RUNTIME) {
            config.worker.program = PathBuf::from(program);
        }
        if let Some(workspace) = env_string(ENV_WORKSPACE) {
            config.context_hint = workspace;
        }
        if let Some(dir) = env_string(ENV_SOCKET_DIR) {
            config.transport.socket_dir = PathBuf::from(dir);
        }
        config.transport.force_tcp = parse_bool_env(ENV_FORCE_TCP, false);
        config.debug_connect = env_string(ENV_DEBUG_CONNECT).and_then(|value| {
            value
                .parse()
                .map_err(|err| {
                    tracing::warn!(
                        target = "exthost::config",
                        var = ENV_DEBUG_CONNECT,
                        value = %value,
                        error = %err,
                        "invalid socket address; ignoring"
                    );
                })
                .ok()
        });
        config.protocol.reconnection_grace =
            parse_duration_env(ENV_RECONNECTION_GRACE_MS, config.protocol.reconnection_grace);
        config.connect_timeout = parse_duration_env(ENV_CONNECT_TIMEOUT_MS, config.connect_timeout);
        config.protocol.max_frame_len =
            parse_usize_env(ENV_MAX_FRAME_BYTES, config.protocol.max_frame_len, 1024);
        if let Some(default) = config.rpc.call_timeout {
            let timeout = parse_duration_env(ENV_CALL_TIMEOUT_MS, default);
            config.rpc.call_timeout = (!timeout.is_zero()).then_some(timeout);
        }
        config
    }
}

fn env_string(var: &str) -> Option<String> {
    std::env::var(var)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub(crate) fn parse_duration_env(var: &str, default: Duration) -> Duration {
    match std::env::var(var) {
        Ok(value) => match value.trim().parse::<u64>() {
            Ok(ms) => Duration::from_millis(ms),
            Err(err) => {
                tracing::warn!(
                    target = "exthost::config",
                    var,
                    error = %err,
                    default_ms = default.as_millis() as u64,
                    "invalid duration env; using default"
                );
                default
            }
        },
        Err(_) => default,
    }
}

pub(crate) fn parse_usize_env(var: &str, default: usize, min: usize) -> usize {
    match std::env::var(var) {
        Ok(value) => match value.trim().parse::<usize>() {
            Ok(parsed) if parsed >= min => parsed,
            Ok(parsed) => {
                tracing::warn!(
                    target = "exthost::config",
                    var,
                    parsed,
                    min,
                    default,
                    "config value below minimum; using default"
                );
                default
            }
            Err(err) => {
                tracing::warn!(
                    target = "exthost::config",
                    var,
                    error = %err,
                    default,
                    "invalid numeric env; using default"
                );
                default
            }
        },
        Err(_) => default,
    }
}

fn parse_bool_env(var: &str, default: bool) -> bool {
    std::env::var(var)
        .map(|value| matches!(value.trim(), "1" | "true" | "TRUE" | "yes" | "on"))
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = BridgeConfig::default();
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.protocol.reconnection_grace, Duration::from_secs(30));
        assert_eq!(config.rpc.call_timeout, Some(Duration::from_secs(30)));
        assert!(config.debug_connect.is_none());
        assert!(!config.transport.force_tcp);
    }

    #[test]
    fn env_parsers_fall_back_on_garbage() {
        std::env::set_var("EXTHOST_BRIDGE_TEST_DURATION", "not-a-number");
        assert_eq!(
            parse_duration_env("EXTHOST_BRIDGE_TEST_DURATION", Duration::from_millis(7)),
            Duration::from_millis(7)
        );
        std::env::set_var("EXTHOST_BRIDGE_TEST_DURATION", "250");
        assert_eq!(
            parse_duration_env("EXTHOST_BRIDGE_TEST_DURATION", Duration::from_millis(7)),
            Duration::from_millis(250)
        );

        std::env::set_var("EXTHOST_BRIDGE_TEST_SIZE", "12");
        assert_eq!(parse_usize_env("EXTHOST_BRIDGE_TEST_SIZE", 4096, 1024), 4096);
        std::env::set_var("EXTHOST_BRIDGE_TEST_SIZE", "8192");
        assert_eq!(parse_usize_env("EXTHOST_BRIDGE_TEST_SIZE", 4096, 1024), 8192);
    }
}
