pub mod cli;
pub mod config;
pub mod metrics;
pub mod process;
pub mod rpc;
pub mod session;
pub mod telemetry;
pub mod transform;
pub mod transport;

pub use config::BridgeConfig;
pub use rpc::{RpcConfig, RpcError, RpcProtocol, RpcProxy};
pub use session::{ExtensionHostSession, SessionError, SessionEvent};
