//! Persistent framed protocol.
//!
//! Every regular frame gets a sequence id and stays in the outgoing buffer until
//! the peer acknowledges it (acks ride in every frame header, plus standalone
//! `Ack` frames when the link is otherwise quiet). When a connection drops, the
//! protocol waits up to `reconnection_grace` for a replacement; on attach it
//! replays the unacknowledged tail in order and the receiver drops ids it has
//! already seen, so a reconnect is invisible to the layer above apart from
//! latency.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::metrics;
use crate::telemetry::logging;
use crate::transport::framed::{Frame, FrameDecoder, FrameKind, DEFAULT_MAX_FRAME_LEN};
use crate::transport::socket::ReconnectSink;
use crate::transport::BoxedStream;

const READ_CHUNK: usize = 16 * 1024;

#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    /// How long unacknowledged frames are retained after a connection drops
    /// before the protocol is declared failed.
    pub reconnection_grace: Duration,
    pub ack_delay: Duration,
    pub keep_alive_interval: Duration,
    pub max_frame_len: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            reconnection_grace: Duration::from_secs(30),
            ack_delay: Duration::from_millis(50),
            keep_alive_interval: Duration::from_secs(5),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolState {
    /// No connection attached yet; writes are buffered.
    Pending,
    Connected,
    AwaitingReconnect,
    Closed,
    Failed,
}

impl ProtocolState {
    fn is_terminal(self) -> bool {
        matches!(self, ProtocolState::Closed | ProtocolState::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolEvent {
    Connected { generation: u64, resumed: bool },
    Disconnected { generation: u64, reason: String },
    /// The peer sent a graceful `Disconnect`.
    PeerClosed,
    /// No replacement connection arrived within the reconnection grace.
    Failed { reason: String },
    /// Closed locally via [`PersistentProtocol::disconnect`].
    Closed,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("protocol closed")]
    Closed,
    #[error("protocol failed: {0}")]
    Failed(String),
}

/// Inbound regular payloads, one per frame, in arrival order.
pub type FrameReceiver = mpsc::UnboundedReceiver<Bytes>;

enum Outbound {
    Frame(Frame),
    /// Shut the write half down; the sender fires once that has happened.
    Shutdown(Option<oneshot::Sender<()>>),
}

struct ConnectionHandle {
    outbound: mpsc::UnboundedSender<Outbound>,
    reader: JoinHandle<()>,
}

struct State {
    status: ProtocolState,
    generation: u64,
    connection: Option<ConnectionHandle>,
    outgoing_id: u32,
    peer_ack: u32,
    unacked: VecDeque<(u32, Bytes)>,
    incoming_id: u32,
    sent_ack: u32,
    inbound: Option<mpsc::UnboundedSender<Bytes>>,
    failure: Option<String>,
}

impl State {
    fn release_acked(&mut self, ack: u32) {
        if ack <= self.peer_ack {
            return;
        }
        self.peer_ack = ack;
        while matches!(self.unacked.front(), Some((id, _)) if *id <= ack) {
            self.unacked.pop_front();
        }
        metrics::UNACKED_FRAMES.set(self.unacked.len() as i64);
    }

    fn closed_error(&self) -> ProtocolError {
        match &self.failure {
            Some(reason) => ProtocolError::Failed(reason.clone()),
            None => ProtocolError::Closed,
        }
    }
}

struct Inner {
    config: ProtocolConfig,
    state: Mutex<State>,
    events: broadcast::Sender<ProtocolEvent>,
}

enum Received {
    Continue,
    NeedsAck,
    Stop,
}

#[derive(Clone)]
pub struct PersistentProtocol {
    inner: Arc<Inner>,
}

impl PersistentProtocol {
    pub fn new(config: ProtocolConfig) -> (Self, FrameReceiver) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(64);
        let inner = Arc::new(Inner {
            config,
            state: Mutex::new(State {
                status: ProtocolState::Pending,
                generation: 0,
                connection: None,
                outgoing_id: 0,
                peer_ack: 0,
                unacked: VecDeque::new(),
                incoming_id: 0,
                sent_ack: 0,
                inbound: Some(inbound_tx),
                failure: None,
            }),
            events,
        });
        (Self { inner }, inbound_rx)
    }

    pub fn state(&self) -> ProtocolState {
        self.inner.state.lock().status
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProtocolEvent> {
        self.inner.events.subscribe()
    }

    /// Regular frames written but not yet acknowledged by the peer.
    pub fn unacknowledged_len(&self) -> usize {
        self.inner.state.lock().unacked.len()
    }

    /// Enqueues `payload` as one regular frame. Legal before the first
    /// connection and during a reconnect gap; the frame is flushed, in order,
    /// once a connection is attached.
    pub fn write(&self, payload: Bytes) -> Result<(), ProtocolError> {
        let mut state = self.inner.state.lock();
        if state.status.is_terminal() {
            return Err(state.closed_error());
        }
        state.outgoing_id = state.outgoing_id.wrapping_add(1).max(1);
        let id = state.outgoing_id;
        state.unacked.push_back((id, payload.clone()));
        metrics::UNACKED_FRAMES.set(state.unacked.len() as i64);
        if let Some(connection) = &state.connection {
            // A closed writer means the link is going down; the frame stays in
            // `unacked` and is replayed on the next attach.
            let _ = connection
                .outbound
                .send(Outbound::Frame(Frame::regular(id, 0, payload)));
        }
        Ok(())
    }

    /// Installs `stream` as the live connection, replacing any previous one,
    /// and replays every unacknowledged frame.
    pub fn attach(&self, stream: BoxedStream) -> Result<(), ProtocolError> {
        let (reader, writer) = tokio::io::split(stream);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let ack_wakeup = Arc::new(Notify::new());

        let mut state = self.inner.state.lock();
        if state.status.is_terminal() {
            return Err(state.closed_error());
        }
        if let Some(previous) = state.connection.take() {
            previous.reader.abort();
        }
        let resumed = matches!(
            state.status,
            ProtocolState::AwaitingReconnect | ProtocolState::Connected
        );
        state.generation += 1;
        let generation = state.generation;

        let _ = outbound_tx.send(Outbound::Frame(Frame::control(FrameKind::Ack, 0)));
        for (id, payload) in state.unacked.iter() {
            let _ = outbound_tx.send(Outbound::Frame(Frame::regular(*id, 0, payload.clone())));
        }
        let replayed = state.unacked.len();

        let reader_task = tokio::spawn(read_loop(
            Arc::clone(&self.inner),
            generation,
            reader,
            Arc::clone(&ack_wakeup),
        ));
        tokio::spawn(write_loop(
            Arc::clone(&self.inner),
            generation,
            writer,
            outbound_rx,
            ack_wakeup,
        ));

        state.connection = Some(ConnectionHandle {
            outbound: outbound_tx,
            reader: reader_task,
        });
        state.status = ProtocolState::Connected;
        if resumed {
            metrics::RECONNECTS.with_label_values(&["resumed"]).inc();
        }
        info!(
            target = "exthost::protocol",
            generation,
            resumed,
            replayed,
            "connection attached"
        );
        let _ = self
            .inner
            .events
            .send(ProtocolEvent::Connected { generation, resumed });
        Ok(())
    }

    /// Sends a graceful `Disconnect` and closes the protocol for good.
    ///
    /// The frame is written in the background; use [`close`](Self::close)
    /// when the caller is about to exit and needs it on the wire first.
    pub fn disconnect(&self) {
        self.close_locally();
    }

    /// Like [`disconnect`](Self::disconnect), but resolves once the writer
    /// has flushed the `Disconnect` frame and shut its half of the stream.
    /// Resolves immediately when there is no live connection.
    pub async fn close(&self) {
        if let Some(flushed) = self.close_locally() {
            let _ = flushed.await;
        }
    }

    fn close_locally(&self) -> Option<oneshot::Receiver<()>> {
        let mut state = self.inner.state.lock();
        if state.status.is_terminal() {
            return None;
        }
        state.status = ProtocolState::Closed;
        let flushed = state.connection.take().map(|connection| {
            let (done, flushed) = oneshot::channel();
            let _ = connection.outbound.send(Outbound::Frame(Frame::control(
                FrameKind::Disconnect,
                0,
            )));
            let _ = connection.outbound.send(Outbound::Shutdown(Some(done)));
            connection.reader.abort();
            flushed
        });
        state.inbound = None;
        state.unacked.clear();
        metrics::UNACKED_FRAMES.set(0);
        debug!(target = "exthost::protocol", "protocol closed locally");
        let _ = self.inner.events.send(ProtocolEvent::Closed);
        flushed
    }
}

impl ReconnectSink for PersistentProtocol {
    fn accepts_reconnect(&self) -> bool {
        self.state() == ProtocolState::AwaitingReconnect
    }

    fn reconnect(&self, stream: BoxedStream) {
        if let Err(err) = self.attach(stream) {
            warn!(target = "exthost::protocol", error = %err, "reconnect rejected");
        }
    }
}

impl Inner {
    fn receive(&self, generation: u64, frame: Frame) -> Received {
        let mut state = self.state.lock();
        if state.generation != generation || state.status != ProtocolState::Connected {
            return Received::Stop;
        }
        metrics::FRAMES
            .with_label_values(&["received", frame.kind.as_str()])
            .inc();
        state.release_acked(frame.ack);
        match frame.kind {
            FrameKind::Regular => {
                if frame.id <= state.incoming_id {
                    trace!(
                        target = "exthost::protocol",
                        id = frame.id,
                        last = state.incoming_id,
                        "dropping replayed frame"
                    );
                    return Received::Continue;
                }
                if frame.id != state.incoming_id + 1 {
                    warn!(
                        target = "exthost::protocol",
                        id = frame.id,
                        expected = state.incoming_id + 1,
                        "gap in regular frame ids"
                    );
                }
                state.incoming_id = frame.id;
                if let Some(inbound) = &state.inbound {
                    let _ = inbound.send(frame.payload);
                }
                Received::NeedsAck
            }
            FrameKind::Ack | FrameKind::KeepAlive => Received::Continue,
            FrameKind::Disconnect => {
                state.status = ProtocolState::Closed;
                state.inbound = None;
                state.unacked.clear();
                metrics::UNACKED_FRAMES.set(0);
                if let Some(connection) = state.connection.take() {
                    let _ = connection.outbound.send(Outbound::Shutdown(None));
                }
                info!(target = "exthost::protocol", generation, "peer disconnected");
                let _ = self.events.send(ProtocolEvent::PeerClosed);
                Received::Stop
            }
        }
    }

    /// Ack value to stamp on the next outgoing frame.
    fn take_ack(&self) -> u32 {
        let mut state = self.state.lock();
        state.sent_ack = state.incoming_id;
        state.sent_ack
    }

    fn needs_ack(&self) -> bool {
        let state = self.state.lock();
        state.incoming_id > state.sent_ack
    }

    fn connection_lost(self: &Arc<Self>, generation: u64, reason: String) {
        let mut state = self.state.lock();
        if state.generation != generation || state.status != ProtocolState::Connected {
            return;
        }
        state.status = ProtocolState::AwaitingReconnect;
        if let Some(connection) = state.connection.take() {
            connection.reader.abort();
        }
        warn!(
            target = "exthost::protocol",
            generation,
            reason = %reason,
            unacked = state.unacked.len(),
            grace_ms = self.config.reconnection_grace.as_millis() as u64,
            "connection lost; awaiting reconnect"
        );
        let _ = self.events.send(ProtocolEvent::Disconnected {
            generation,
            reason: reason.clone(),
        });
        drop(state);

        let inner = Arc::clone(self);
        let grace = self.config.reconnection_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            inner.expire_reconnect(generation, reason);
        });
    }

    fn expire_reconnect(&self, generation: u64, reason: String) {
        let mut state = self.state.lock();
        if state.generation != generation || state.status != ProtocolState::AwaitingReconnect {
            return;
        }
        let reason = format!("no reconnect within grace period ({reason})");
        state.status = ProtocolState::Failed;
        state.failure = Some(reason.clone());
        state.inbound = None;
        state.unacked.clear();
        metrics::UNACKED_FRAMES.set(0);
        metrics::RECONNECTS.with_label_values(&["failed"]).inc();
        warn!(target = "exthost::protocol", generation, reason = %reason, "protocol failed");
        let _ = self.events.send(ProtocolEvent::Failed { reason });
    }
}

async fn read_loop<R>(inner: Arc<Inner>, generation: u64, mut reader: R, ack_wakeup: Arc<Notify>)
where
    R: AsyncRead + Unpin,
{
    let mut decoder = FrameDecoder::new(inner.config.max_frame_len);
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        let read = match reader.read(&mut chunk).await {
            Ok(0) => {
                inner.connection_lost(generation, "connection closed by peer".into());
                return;
            }
            Ok(read) => read,
            Err(err) => {
                inner.connection_lost(generation, format!("read failed: {err}"));
                return;
            }
        };
        decoder.push(&chunk[..read]);
        loop {
            match decoder.next_frame() {
                Ok(Some(frame)) => match inner.receive(generation, frame) {
                    Received::Continue => {}
                    Received::NeedsAck => ack_wakeup.notify_one(),
                    Received::Stop => return,
                },
                Ok(None) => break,
                Err(err) => {
                    let pending = decoder.pending();
                    debug!(
                        target = "exthost::protocol",
                        generation,
                        bytes = %logging::hexdump(&pending[..pending.len().min(64)]),
                        "rejected frame bytes"
                    );
                    inner.connection_lost(generation, format!("framing error: {err}"));
                    return;
                }
            }
        }
    }
}

async fn write_loop<W>(
    inner: Arc<Inner>,
    generation: u64,
    mut writer: W,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    ack_wakeup: Arc<Notify>,
) where
    W: AsyncWrite + Unpin,
{
    let mut keep_alive = tokio::time::interval(inner.config.keep_alive_interval);
    keep_alive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    keep_alive.tick().await;
    let mut ack_deadline: Option<tokio::time::Instant> = None;
    let mut buffer = BytesMut::with_capacity(READ_CHUNK);

    loop {
        let frame = tokio::select! {
            message = outbound.recv() => match message {
                Some(Outbound::Frame(frame)) => frame,
                Some(Outbound::Shutdown(done)) => {
                    let _ = writer.shutdown().await;
                    if let Some(done) = done {
                        let _ = done.send(());
                    }
                    return;
                }
                None => {
                    let _ = writer.shutdown().await;
                    return;
                }
            },
            _ = ack_wakeup.notified() => {
                if ack_deadline.is_none() {
                    ack_deadline = Some(tokio::time::Instant::now() + inner.config.ack_delay);
                }
                continue;
            }
            _ = sleep_until(ack_deadline), if ack_deadline.is_some() => {
                ack_deadline = None;
                if !inner.needs_ack() {
                    continue;
                }
                Frame::control(FrameKind::Ack, 0)
            }
            _ = keep_alive.tick() => Frame::control(FrameKind::KeepAlive, 0),
        };

        let kind = frame.kind;
        let mut frame = frame;
        frame.ack = inner.take_ack();
        if frame.kind != FrameKind::Ack {
            ack_deadline = None;
        }
        buffer.clear();
        frame.encode_into(&mut buffer);
        let result = match writer.write_all(&buffer).await {
            Ok(()) => writer.flush().await,
            Err(err) => Err(err),
        };
        if let Err(err) = result {
            inner.connection_lost(generation, format!("write failed: {err}"));
            return;
        }
        metrics::FRAMES
            .with_label_values(&["sent", kind.as_str()])
            .inc();
        keep_alive.reset();
    }
}

async fn sleep_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
