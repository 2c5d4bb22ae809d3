//! Request/reply layer over the persistent protocol.
//!
//! Outbound: every proxy call gets a fresh id, is written as one `request`
//! envelope right away, and parks a oneshot in the pending table until the
//! matching `reply` arrives. Inbound: the read loop parses frames in arrival
//! order and queues each call on its identifier's dispatch worker, which runs
//! handlers one at a time so calls to one identifier observe send order.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use exthost_protocol::{CallFrame, Envelope, RemoteError, RemoteErrorKind, ReplyFrame};
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::metrics;
use crate::transform::{
    coerce_args, transform_value_incoming, transform_value_outgoing, Args, UriTransformer,
};
use crate::transport::{FrameReceiver, PersistentProtocol};

pub mod dispatch;
pub mod pending;
pub mod registry;

pub use dispatch::{reply, HandlerError, Invocation, MethodSpec, MethodTable};
pub use pending::PendingReply;
pub use registry::{ProxyIdentifier, ServiceShape, Side};

#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// `None` waits for a reply indefinitely.
    pub call_timeout: Option<Duration>,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            call_timeout: Some(Duration::from_secs(30)),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RpcError {
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),
    #[error("connection to the peer is gone")]
    Disconnected,
    #[error("no reply within {0:?}")]
    Timeout(Duration),
    #[error("serialization failed: {0}")]
    Serialization(String),
}

impl RpcError {
    pub fn remote_kind(&self) -> Option<RemoteErrorKind> {
        match self {
            RpcError::Remote(err) => Some(err.kind),
            _ => None,
        }
    }
}

struct PendingCall {
    rpc_id: String,
    method: String,
    started_at: Instant,
    reply: oneshot::Sender<Result<Value, RpcError>>,
}

struct Job {
    call: CallFrame,
    method: MethodSpec,
    cancel: CancellationToken,
}

pub(crate) struct Shared {
    protocol: PersistentProtocol,
    transformer: Arc<dyn UriTransformer>,
    config: RpcConfig,
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, PendingCall>>,
    handlers: Mutex<HashMap<String, Arc<MethodTable>>>,
    workers: Mutex<HashMap<String, mpsc::UnboundedSender<Job>>>,
    inflight: Mutex<HashMap<u64, CancellationToken>>,
    cancel: CancellationToken,
    disposed: AtomicBool,
    read_loop: Mutex<Option<JoinHandle<()>>>,
}

/// One side of the bridge. The same type serves the IDE host and the
/// extension runtime.
#[derive(Clone)]
pub struct RpcProtocol {
    shared: Arc<Shared>,
}

impl RpcProtocol {
    pub fn new(
        protocol: PersistentProtocol,
        frames: FrameReceiver,
        transformer: Arc<dyn UriTransformer>,
        config: RpcConfig,
    ) -> Self {
        let shared = Arc::new(Shared {
            protocol,
            transformer,
            config,
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            handlers: Mutex::new(HashMap::new()),
            workers: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
            disposed: AtomicBool::new(false),
            read_loop: Mutex::new(None),
        });
        let task = tokio::spawn(read_loop(Arc::clone(&shared), frames));
        *shared.read_loop.lock() = Some(task);
        Self { shared }
    }

    /// Parent of every inbound handler's cancellation token.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }

    pub fn call(&self, rpc_id: &str, method: &str, args: Vec<Value>) -> PendingReply {
        let shared = &self.shared;
        let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
        if shared.disposed.load(Ordering::SeqCst) {
            metrics::RPC_CALLS.with_label_values(&["disconnected"]).inc();
            return PendingReply::ready(id, Err(RpcError::Disconnected));
        }
        let payload = match shared.encode_request(id, rpc_id, method, args, true) {
            Ok(payload) => payload,
            Err(err) => return PendingReply::ready(id, Err(err)),
        };

        let (tx, rx) = oneshot::channel();
        shared.pending.lock().insert(
            id,
            PendingCall {
                rpc_id: rpc_id.to_string(),
                method: method.to_string(),
                started_at: Instant::now(),
                reply: tx,
            },
        );
        metrics::PENDING_CALLS.inc();
        trace!(target = "exthost::rpc", id, rpc_id, method, "call");

        if let Err(err) = shared.protocol.write(payload) {
            debug!(target = "exthost::rpc", id, rpc_id, method, error = %err, "call not sent");
            if shared.pending.lock().remove(&id).is_some() {
                metrics::PENDING_CALLS.dec();
            }
            metrics::RPC_CALLS.with_label_values(&["disconnected"]).inc();
            return PendingReply::ready(id, Err(RpcError::Disconnected));
        }
        PendingReply::waiting(id, rx, Arc::downgrade(shared), shared.config.call_timeout)
    }

    /// Fire-and-forget call; the peer sends no reply.
    pub fn notify(&self, rpc_id: &str, method: &str, args: Vec<Value>) -> Result<(), RpcError> {
        let shared = &self.shared;
        if shared.disposed.load(Ordering::SeqCst) {
            return Err(RpcError::Disconnected);
        }
        let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
        let payload = shared.encode_request(id, rpc_id, method, args, false)?;
        shared
            .protocol
            .write(payload)
            .map_err(|_| RpcError::Disconnected)?;
        metrics::RPC_CALLS.with_label_values(&["notify"]).inc();
        Ok(())
    }

    pub fn proxy(&self, rpc_id: &str) -> RpcProxy {
        RpcProxy {
            rpc: self.clone(),
            rpc_id: Arc::from(rpc_id),
        }
    }

    pub fn get_proxy<S: ServiceShape>(&self, identifier: &ProxyIdentifier<S>) -> S::Proxy {
        S::Proxy::from(self.proxy(identifier.name))
    }

    /// Registers the local implementation behind `identifier`.
    pub fn set<S: ServiceShape>(&self, identifier: &ProxyIdentifier<S>, local: Arc<S::Local>) {
        self.register_methods(identifier.name, S::method_table(local));
    }

    pub fn register_methods(&self, rpc_id: &str, table: MethodTable) {
        let methods = table.len();
        let previous = self
            .shared
            .handlers
            .lock()
            .insert(rpc_id.to_string(), Arc::new(table));
        if previous.is_some() {
            warn!(target = "exthost::rpc", rpc_id, "replacing registered handlers");
        } else {
            debug!(target = "exthost::rpc", rpc_id, methods, "handlers registered");
        }
    }

    pub fn is_registered(&self, rpc_id: &str) -> bool {
        self.shared.handlers.lock().contains_key(rpc_id)
    }

    pub fn pending_len(&self) -> usize {
        self.shared.pending.lock().len()
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.disposed.load(Ordering::SeqCst)
    }

    /// Stops dispatch and fails every outstanding call with `Disconnected`.
    pub fn dispose(&self) {
        let shared = &self.shared;
        if shared.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        shared.cancel.cancel();
        if let Some(task) = shared.read_loop.lock().take() {
            task.abort();
        }
        shared.workers.lock().clear();
        shared.inflight.lock().clear();
        shared.fail_pending("disposed");
        debug!(target = "exthost::rpc", "rpc protocol disposed");
    }
}

/// Untyped stand-in for a remote service.
#[derive(Clone)]
pub struct RpcProxy {
    rpc: RpcProtocol,
    rpc_id: Arc<str>,
}

impl RpcProxy {
    pub fn rpc_id(&self) -> &str {
        &self.rpc_id
    }

    pub fn call(&self, method: &str, args: Vec<Value>) -> PendingReply {
        self.rpc.call(&self.rpc_id, method, args)
    }

    pub fn notify(&self, method: &str, args: Vec<Value>) -> Result<(), RpcError> {
        self.rpc.notify(&self.rpc_id, method, args)
    }
}

impl Shared {
    fn encode_request(
        &self,
        id: u64,
        rpc_id: &str,
        method: &str,
        mut args: Vec<Value>,
        expects_reply: bool,
    ) -> Result<Bytes, RpcError> {
        for arg in args.iter_mut() {
            transform_value_outgoing(arg, self.transformer.as_ref());
        }
        let envelope = Envelope::Request(CallFrame {
            id,
            rpc_id: rpc_id.to_string(),
            method: method.to_string(),
            args,
            expects_reply,
        });
        envelope
            .to_vec()
            .map(Bytes::from)
            .map_err(|err| RpcError::Serialization(err.to_string()))
    }

    /// Forgets a pending call whose caller stopped waiting and asks the peer
    /// to cancel it. Returns whether the call was still pending.
    pub(crate) fn abandon_call(&self, id: u64) -> bool {
        let Some(call) = self.pending.lock().remove(&id) else {
            return false;
        };
        metrics::PENDING_CALLS.dec();
        debug!(
            target = "exthost::rpc",
            id,
            rpc_id = %call.rpc_id,
            method = %call.method,
            "call abandoned"
        );
        if !self.disposed.load(Ordering::SeqCst) {
            if let Ok(payload) = (Envelope::Cancel { id }).to_vec() {
                let _ = self.protocol.write(Bytes::from(payload));
            }
        }
        true
    }

    fn fail_pending(&self, reason: &str) {
        let drained: Vec<(u64, PendingCall)> = self.pending.lock().drain().collect();
        if drained.is_empty() {
            return;
        }
        metrics::PENDING_CALLS.sub(drained.len() as i64);
        metrics::RPC_CALLS
            .with_label_values(&["disconnected"])
            .inc_by(drained.len() as u64);
        debug!(target = "exthost::rpc", count = drained.len(), reason, "failing pending calls");
        for (_, call) in drained {
            let _ = call.reply.send(Err(RpcError::Disconnected));
        }
    }

    fn handle_frame(self: &Arc<Self>, payload: Bytes) {
        let envelope = match Envelope::from_slice(&payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                metrics::RPC_DISPATCH
                    .with_label_values(&["", "malformed"])
                    .inc();
                warn!(target = "exthost::rpc", error = %err, bytes = payload.len(), "malformed envelope");
                return;
            }
        };
        match envelope {
            Envelope::Request(call) => self.route_request(call),
            Envelope::Reply(reply) => self.complete(reply),
            Envelope::Cancel { id } => {
                if let Some(token) = self.inflight.lock().get(&id) {
                    trace!(target = "exthost::rpc", id, "peer cancelled call");
                    token.cancel();
                }
            }
        }
    }

    fn route_request(self: &Arc<Self>, call: CallFrame) {
        let table = self.handlers.lock().get(&call.rpc_id).cloned();
        let Some(table) = table else {
            self.reject(&call, RemoteError::unknown_identifier(&call.rpc_id), "unknown_identifier");
            return;
        };
        let Some(method) = table.get(&call.method).cloned() else {
            self.reject(
                &call,
                RemoteError::unknown_method(&call.rpc_id, &call.method),
                "unknown_method",
            );
            return;
        };

        let cancel = self.cancel.child_token();
        if call.expects_reply {
            self.inflight.lock().insert(call.id, cancel.clone());
        }
        let rpc_id = call.rpc_id.clone();
        let job = Job {
            call,
            method,
            cancel,
        };
        let mut workers = self.workers.lock();
        let worker = workers
            .entry(rpc_id.clone())
            .or_insert_with(|| self.spawn_worker(&rpc_id));
        if let Err(mpsc::error::SendError(job)) = worker.send(job) {
            // The previous worker died; later calls must not queue behind it.
            warn!(target = "exthost::rpc", rpc_id = %rpc_id, "dispatch worker gone; respawning");
            let replacement = self.spawn_worker(&rpc_id);
            if let Err(mpsc::error::SendError(job)) = replacement.send(job) {
                drop(workers);
                self.inflight.lock().remove(&job.call.id);
                if job.call.expects_reply {
                    self.send_reply(ReplyFrame::failure(
                        job.call.id,
                        RemoteError::new(RemoteErrorKind::HandlerFailed, "dispatch worker unavailable"),
                    ));
                }
                return;
            }
            workers.insert(rpc_id, replacement);
        }
    }

    fn spawn_worker(self: &Arc<Self>, rpc_id: &str) -> mpsc::UnboundedSender<Job> {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(dispatch_worker(Arc::clone(self), rpc_id.to_string(), rx));
        tx
    }

    fn reject(&self, call: &CallFrame, error: RemoteError, outcome: &str) {
        // Unregistered names come from the peer; keep them out of label values.
        let label = if outcome == "unknown_identifier" {
            "<unknown>"
        } else {
            call.rpc_id.as_str()
        };
        metrics::RPC_DISPATCH
            .with_label_values(&[label, outcome])
            .inc();
        warn!(
            target = "exthost::rpc",
            id = call.id,
            rpc_id = %call.rpc_id,
            method = %call.method,
            error = %error,
            "rejecting call"
        );
        if call.expects_reply {
            self.send_reply(ReplyFrame::failure(call.id, error));
        }
    }

    async fn run_job(&self, job: Job) {
        let Job {
            mut call,
            method,
            cancel,
        } = job;
        let started = Instant::now();
        let outcome = if cancel.is_cancelled() {
            Err(RemoteError::new(RemoteErrorKind::Cancelled, "call cancelled"))
        } else {
            let args = args_incoming(self.transformer.as_ref(), std::mem::take(&mut call.args));
            self.invoke(&call, &method, args, &cancel).await
        };
        self.inflight.lock().remove(&call.id);

        let label = match &outcome {
            Ok(_) => "ok",
            Err(err) => err.kind.as_str(),
        };
        metrics::RPC_DISPATCH
            .with_label_values(&[call.rpc_id.as_str(), label])
            .inc();
        debug!(
            target = "exthost::rpc",
            id = call.id,
            rpc_id = %call.rpc_id,
            method = %call.method,
            outcome = label,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "dispatched"
        );
        if !call.expects_reply {
            return;
        }
        let frame = match outcome {
            Ok(value) => ReplyFrame::success(call.id, value),
            Err(error) => ReplyFrame::failure(call.id, error),
        };
        self.send_reply(frame);
    }

    async fn invoke(
        &self,
        call: &CallFrame,
        method: &MethodSpec,
        args: Vec<Value>,
        cancel: &CancellationToken,
    ) -> Result<Value, RemoteError> {
        let args = coerce_args(args, &method.params)
            .map_err(|err| RemoteError::new(RemoteErrorKind::InvalidArguments, err.to_string()))?;
        let invocation = Invocation {
            args: Args::new(args),
            cancel: cancel.clone(),
        };
        // Building the future runs the handler's synchronous prefix; keep that
        // inside the unwind guard too.
        let handler = AssertUnwindSafe(
            futures::future::lazy(|_| (method.handler)(invocation)).flatten(),
        )
        .catch_unwind();
        tokio::select! {
            _ = cancel.cancelled() => Err(RemoteError::new(RemoteErrorKind::Cancelled, "call cancelled")),
            result = handler => match result {
                Ok(Ok(mut value)) => {
                    transform_value_outgoing(&mut value, self.transformer.as_ref());
                    Ok(value)
                }
                Ok(Err(err)) => Err(err.into_remote()),
                Err(panic) => {
                    let message = dispatch::panic_message(panic.as_ref());
                    warn!(
                        target = "exthost::rpc",
                        id = call.id,
                        rpc_id = %call.rpc_id,
                        method = %call.method,
                        "{message}"
                    );
                    Err(RemoteError::new(RemoteErrorKind::HandlerFailed, message))
                }
            },
        }
    }

    fn send_reply(&self, frame: ReplyFrame) {
        let id = frame.id;
        let payload = match Envelope::Reply(frame).to_vec() {
            Ok(payload) => payload,
            Err(err) => {
                warn!(target = "exthost::rpc", id, error = %err, "failed to encode reply");
                return;
            }
        };
        if let Err(err) = self.protocol.write(Bytes::from(payload)) {
            debug!(target = "exthost::rpc", id, error = %err, "reply dropped; connection gone");
        }
    }

    fn complete(&self, reply: ReplyFrame) {
        let Some(call) = self.pending.lock().remove(&reply.id) else {
            debug!(target = "exthost::rpc", id = reply.id, "reply for unknown call; discarding");
            return;
        };
        metrics::PENDING_CALLS.dec();
        let result = if reply.ok {
            let mut value = reply.result;
            transform_value_incoming(&mut value, self.transformer.as_ref());
            Ok(value)
        } else {
            Err(RpcError::Remote(reply.error.unwrap_or_else(|| {
                RemoteError::new(RemoteErrorKind::HandlerFailed, "error reply without details")
            })))
        };
        metrics::RPC_CALLS
            .with_label_values(&[if result.is_ok() { "ok" } else { "error" }])
            .inc();
        trace!(
            target = "exthost::rpc",
            id = reply.id,
            rpc_id = %call.rpc_id,
            method = %call.method,
            elapsed_ms = call.started_at.elapsed().as_millis() as u64,
            ok = result.is_ok(),
            "reply"
        );
        let _ = call.reply.send(result);
    }
}

fn args_incoming(transformer: &dyn UriTransformer, mut args: Vec<Value>) -> Vec<Value> {
    for arg in args.iter_mut() {
        transform_value_incoming(arg, transformer);
    }
    args
}

async fn read_loop(shared: Arc<Shared>, mut frames: FrameReceiver) {
    loop {
        let payload = tokio::select! {
            _ = shared.cancel.cancelled() => return,
            payload = frames.recv() => payload,
        };
        match payload {
            Some(payload) => shared.handle_frame(payload),
            None => {
                // The protocol closed or failed; nothing can answer now.
                shared.fail_pending("protocol closed");
                return;
            }
        }
    }
}

async fn dispatch_worker(shared: Arc<Shared>, rpc_id: String, mut jobs: mpsc::UnboundedReceiver<Job>) {
    trace!(target = "exthost::rpc", rpc_id = %rpc_id, "dispatch worker started");
    loop {
        let job = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            job = jobs.recv() => job,
        };
        match job {
            Some(job) => shared.run_job(job).await,
            None => break,
        }
    }
    trace!(target = "exthost::rpc", rpc_id = %rpc_id, "dispatch worker stopped");
}
