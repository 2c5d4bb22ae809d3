//! Construction-time table of the services either side can address.
//!
//! Each [`ProxyIdentifier`] pairs a stable wire name with a [`ServiceShape`]:
//! the trait a local implementation provides and the typed proxy callers use
//! to reach the remote one.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use exthost_protocol::identifiers;
use serde_json::{json, Value};
use tracing::{debug, error, info, trace, warn};

use super::dispatch::{reply, HandlerError, MethodTable};
use super::{RpcError, RpcProxy};
use crate::transform::ParamType;

/// Which process implements an identifier. Naming convention only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    MainThread,
    ExtHost,
}

pub trait ServiceShape: 'static {
    /// Trait object implemented by the local side.
    type Local: ?Sized + Send + Sync + 'static;
    /// Typed stand-in for the remote side.
    type Proxy: From<RpcProxy>;

    fn method_table(local: Arc<Self::Local>) -> MethodTable;
}

pub struct ProxyIdentifier<S> {
    pub name: &'static str,
    pub side: Side,
    shape: PhantomData<fn() -> S>,
}

impl<S> ProxyIdentifier<S> {
    pub const fn new(name: &'static str, side: Side) -> Self {
        Self {
            name,
            side,
            shape: PhantomData,
        }
    }
}

impl<S> Clone for ProxyIdentifier<S> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<S> Copy for ProxyIdentifier<S> {}

impl<S> std::fmt::Debug for ProxyIdentifier<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyIdentifier")
            .field("name", &self.name)
            .field("side", &self.side)
            .finish()
    }
}

#[async_trait]
pub trait PingService: Send + Sync {
    async fn ping(&self) -> Result<String, HandlerError>;
}

pub struct PingShape;

impl ServiceShape for PingShape {
    type Local = dyn PingService;
    type Proxy = PingProxy;

    fn method_table(local: Arc<Self::Local>) -> MethodTable {
        MethodTable::new().method("ping", &[], move |_| {
            let local = Arc::clone(&local);
            async move { reply(local.ping().await?) }
        })
    }
}

#[derive(Clone)]
pub struct PingProxy {
    inner: RpcProxy,
}

impl From<RpcProxy> for PingProxy {
    fn from(inner: RpcProxy) -> Self {
        Self { inner }
    }
}

impl PingProxy {
    pub async fn ping(&self) -> Result<String, RpcError> {
        self.inner.call("ping", Vec::new()).into_typed().await
    }
}

/// Answers every ping with `"pong"`.
#[derive(Debug, Default, Clone, Copy)]
pub struct Pong;

#[async_trait]
impl PingService for Pong {
    async fn ping(&self) -> Result<String, HandlerError> {
        Ok("pong".to_string())
    }
}

#[async_trait]
pub trait ConsoleService: Send + Sync {
    async fn log(&self, level: i32, message: String) -> Result<(), HandlerError>;
}

pub struct ConsoleShape;

impl ServiceShape for ConsoleShape {
    type Local = dyn ConsoleService;
    type Proxy = ConsoleProxy;

    fn method_table(local: Arc<Self::Local>) -> MethodTable {
        MethodTable::new().method("log", &[ParamType::Int, ParamType::String], move |inv| {
            let local = Arc::clone(&local);
            async move {
                let level = inv.args.i32(0)?;
                let message = inv.args.string(1)?.to_string();
                local.log(level, message).await?;
                Ok::<_, HandlerError>(Value::Null)
            }
        })
    }
}

#[derive(Clone)]
pub struct ConsoleProxy {
    inner: RpcProxy,
}

impl From<RpcProxy> for ConsoleProxy {
    fn from(inner: RpcProxy) -> Self {
        Self { inner }
    }
}

impl ConsoleProxy {
    /// Fire-and-forget; console lines never wait for the host.
    pub fn log(&self, level: i32, message: impl Into<String>) -> Result<(), RpcError> {
        self.inner
            .notify("log", vec![json!(level), Value::String(message.into())])
    }
}

/// Forwards the runtime's console output into the host's `tracing` output.
/// Levels follow the runtime's numbering: 0 trace up to 4 error.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingConsole;

#[async_trait]
impl ConsoleService for TracingConsole {
    async fn log(&self, level: i32, message: String) -> Result<(), HandlerError> {
        match level {
            i32::MIN..=0 => trace!(target = "exthost::console", "{message}"),
            1 => debug!(target = "exthost::console", "{message}"),
            2 => info!(target = "exthost::console", "{message}"),
            3 => warn!(target = "exthost::console", "{message}"),
            _ => error!(target = "exthost::console", "{message}"),
        }
        Ok(())
    }
}

pub const PING: ProxyIdentifier<PingShape> = ProxyIdentifier::new(identifiers::PING, Side::MainThread);
pub const EXT_HOST_PING: ProxyIdentifier<PingShape> =
    ProxyIdentifier::new(identifiers::EXT_HOST_PING, Side::ExtHost);
pub const MAIN_THREAD_CONSOLE: ProxyIdentifier<ConsoleShape> =
    ProxyIdentifier::new(identifiers::MAIN_THREAD_CONSOLE, Side::MainThread);

/// Every shipped identifier as `(name, side)`.
pub fn all() -> Vec<(&'static str, Side)> {
    vec![
        (PING.name, PING.side),
        (EXT_HOST_PING.name, EXT_HOST_PING.side),
        (MAIN_THREAD_CONSOLE.name, MAIN_THREAD_CONSOLE.side),
    ]
}
