//! Owns one extension host: transport, worker process, persistent protocol
//! and RPC layer, wired together in that order and torn down in reverse.

use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::BridgeConfig;
use crate::process::{ProcessError, WorkerExit, WorkerOutput, WorkerProcess};
use crate::rpc::RpcProtocol;
use crate::transform::{IdentityTransformer, UriTransformer};
use crate::transport::{
    self, PersistentProtocol, ProtocolError, ProtocolEvent, ReconnectSink, SocketTransport,
    TransportAddress, TransportError,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Connected { resumed: bool },
    Disconnected { reason: String },
    /// The runtime said goodbye with a graceful `Disconnect`.
    PeerClosed,
    WorkerExited(WorkerExit),
    /// The session cannot continue; it has already torn down RPC and transport.
    Fatal { reason: String },
    Stopped,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("extension runtime exited before connecting (code {:?}, signal {:?})", .0.code, .0.signal)]
    WorkerExitedEarly(WorkerExit),
}

type SharedTransport = Arc<Mutex<Option<SocketTransport>>>;

pub struct ExtensionHostSession {
    protocol: PersistentProtocol,
    rpc: RpcProtocol,
    transport: SharedTransport,
    worker: Option<WorkerProcess>,
    worker_exit: Option<watch::Receiver<Option<WorkerExit>>>,
    address: Option<TransportAddress>,
    events: broadcast::Sender<SessionEvent>,
    cancel: CancellationToken,
    supervisor: Option<JoinHandle<()>>,
    stopped: bool,
}

impl ExtensionHostSession {
    /// Starts a session that passes URIs through unchanged.
    pub async fn start<F>(config: BridgeConfig, register: F) -> Result<Self, SessionError>
    where
        F: FnOnce(&RpcProtocol),
    {
        Self::start_with_transformer(config, Arc::new(IdentityTransformer), register).await
    }

    /// `register` runs before any connection exists, so every handler is in
    /// place when the first inbound frame arrives.
    pub async fn start_with_transformer<F>(
        config: BridgeConfig,
        transformer: Arc<dyn UriTransformer>,
        register: F,
    ) -> Result<Self, SessionError>
    where
        F: FnOnce(&RpcProtocol),
    {
        let (protocol, frames) = PersistentProtocol::new(config.protocol.clone());
        let rpc = RpcProtocol::new(protocol.clone(), frames, transformer, config.rpc.clone());
        register(&rpc);
        let protocol_events = protocol.subscribe();

        if let Some(addr) = config.debug_connect {
            let address = TransportAddress::Tcp(addr);
            let stream = match transport::connect(&address).await {
                Ok(stream) => stream,
                Err(err) => {
                    rpc.dispose();
                    return Err(err.into());
                }
            };
            protocol.attach(stream)?;
            info!(target = "exthost::session", address = %address, "attached to external runtime");
            return Ok(Self::assemble(protocol, rpc, None, None, Some(address), protocol_events));
        }

        let mut socket = match SocketTransport::start(&config.transport, &config.context_hint) {
            Ok(socket) => socket,
            Err(err) => {
                rpc.dispose();
                return Err(err.into());
            }
        };
        let address = socket.address().clone();
        let mut worker = match WorkerProcess::start(&config.worker, &address) {
            Ok(worker) => worker,
            Err(err) => {
                rpc.dispose();
                return Err(err.into());
            }
        };

        let mut exit = worker.exit_watch();
        let accepted = tokio::select! {
            accepted = socket.accept(config.connect_timeout) => accepted.map_err(SessionError::from),
            observed = exit.wait_for(Option::is_some) => {
                let observed = observed.ok().and_then(|value| value.clone());
                Err(match observed {
                    Some(exit) => SessionError::WorkerExitedEarly(exit),
                    None => SessionError::Transport(TransportError::Stopped),
                })
            }
        };
        let stream = match accepted {
            Ok(stream) => stream,
            Err(err) => {
                error!(target = "exthost::session", error = %err, "extension runtime did not connect");
                rpc.dispose();
                worker.stop().await;
                return Err(err);
            }
        };

        protocol.attach(stream)?;
        let sink: Arc<dyn ReconnectSink> = Arc::new(protocol.clone());
        socket.serve_reconnects(sink)?;

        Ok(Self::assemble(
            protocol,
            rpc,
            Some(socket),
            Some(worker),
            Some(address),
            protocol_events,
        ))
    }

    fn assemble(
        protocol: PersistentProtocol,
        rpc: RpcProtocol,
        socket: Option<SocketTransport>,
        worker: Option<WorkerProcess>,
        address: Option<TransportAddress>,
        protocol_events: broadcast::Receiver<ProtocolEvent>,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        let cancel = CancellationToken::new();
        let transport: SharedTransport = Arc::new(Mutex::new(socket));
        let worker_exit = worker.as_ref().map(WorkerProcess::exit_watch);
        let supervisor = tokio::spawn(supervise(
            cancel.clone(),
            events.clone(),
            protocol_events,
            worker_exit.clone(),
            rpc.clone(),
            Arc::clone(&transport),
        ));
        Self {
            protocol,
            rpc,
            transport,
            worker,
            worker_exit,
            address,
            events,
            cancel,
            supervisor: Some(supervisor),
            stopped: false,
        }
    }

    pub fn rpc(&self) -> &RpcProtocol {
        &self.rpc
    }

    pub fn address(&self) -> Option<&TransportAddress> {
        self.address.as_ref()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Live runtime output. Lines printed before subscribing are only
    /// available through [`Self::recent_worker_output`].
    pub fn worker_output(&self) -> Option<broadcast::Receiver<WorkerOutput>> {
        self.worker.as_ref().map(WorkerProcess::subscribe_output)
    }

    pub fn recent_worker_output(&self) -> Vec<WorkerOutput> {
        self.worker
            .as_ref()
            .map(WorkerProcess::recent_output)
            .unwrap_or_default()
    }

    pub fn worker_exit(&self) -> Option<watch::Receiver<Option<WorkerExit>>> {
        self.worker_exit.clone()
    }

    /// Orderly shutdown: say goodbye on the wire, fail outstanding calls,
    /// then terminate the runtime and close the listener. Idempotent.
    pub async fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.cancel.cancel();
        if let Some(worker) = self.worker.as_ref() {
            worker.expect_exit();
        }
        self.protocol.disconnect();
        self.rpc.dispose();
        if let Some(worker) = self.worker.as_mut() {
            let exit = worker.stop().await;
            info!(target = "exthost::session", exit = ?exit, "extension runtime stopped");
        }
        if let Some(mut socket) = self.transport.lock().take() {
            socket.stop();
        }
        if let Some(supervisor) = self.supervisor.take() {
            supervisor.abort();
        }
        let _ = self.events.send(SessionEvent::Stopped);
    }
}

impl Drop for ExtensionHostSession {
    fn drop(&mut self) {
        if !self.stopped {
            self.cancel.cancel();
            self.rpc.dispose();
        }
    }
}

fn tear_down(rpc: &RpcProtocol, transport: &SharedTransport) {
    rpc.dispose();
    if let Some(mut socket) = transport.lock().take() {
        socket.stop();
    }
}

async fn next_exit(exit: &mut Option<watch::Receiver<Option<WorkerExit>>>) -> WorkerExit {
    if let Some(receiver) = exit.as_mut() {
        let observed = receiver
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|value| value.clone());
        if let Some(observed) = observed {
            return observed;
        }
    }
    std::future::pending().await
}

async fn supervise(
    cancel: CancellationToken,
    events: broadcast::Sender<SessionEvent>,
    mut protocol_events: broadcast::Receiver<ProtocolEvent>,
    mut worker_exit: Option<watch::Receiver<Option<WorkerExit>>>,
    rpc: RpcProtocol,
    transport: SharedTransport,
) {
    let mut protocol_open = true;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            exit = next_exit(&mut worker_exit) => {
                let _ = events.send(SessionEvent::WorkerExited(exit.clone()));
                if !exit.expected {
                    let reason = format!(
                        "extension runtime exited unexpectedly (code {:?}, signal {:?})",
                        exit.code, exit.signal
                    );
                    error!(target = "exthost::session", reason = %reason, "session failed");
                    tear_down(&rpc, &transport);
                    let _ = events.send(SessionEvent::Fatal { reason });
                }
                return;
            }
            event = protocol_events.recv(), if protocol_open => match event {
                Ok(ProtocolEvent::Connected { resumed, .. }) => {
                    let _ = events.send(SessionEvent::Connected { resumed });
                }
                Ok(ProtocolEvent::Disconnected { reason, .. }) => {
                    let _ = events.send(SessionEvent::Disconnected { reason });
                }
                Ok(ProtocolEvent::PeerClosed) => {
                    info!(target = "exthost::session", "extension runtime closed the connection");
                    let _ = events.send(SessionEvent::PeerClosed);
                }
                Ok(ProtocolEvent::Failed { reason }) => {
                    error!(target = "exthost::session", reason = %reason, "session failed");
                    tear_down(&rpc, &transport);
                    let _ = events.send(SessionEvent::Fatal { reason });
                }
                Ok(ProtocolEvent::Closed) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(target = "exthost::session", skipped, "protocol events lagged");
                }
                Err(broadcast::error::RecvError::Closed) => protocol_open = false,
            },
        }
    }
}
