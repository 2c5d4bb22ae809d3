use std::fs;
use std::io::{self, ErrorKind};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::net::{TcpListener, TcpStream};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::metrics;
use crate::transport::{BoxedStream, TransportAddress, TransportError};

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Directory that holds the per-session socket file.
    pub socket_dir: PathBuf,
    /// Listen on loopback TCP even where local sockets are available.
    pub force_tcp: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            socket_dir: std::env::temp_dir(),
            force_tcp: false,
        }
    }
}

/// Receives connections that arrive after the first one was accepted.
pub trait ReconnectSink: Send + Sync + 'static {
    fn accepts_reconnect(&self) -> bool;
    fn reconnect(&self, stream: BoxedStream);
}

enum Listener {
    #[cfg(unix)]
    Unix(UnixListener),
    Tcp(TcpListener),
}

impl Listener {
    async fn accept(&self) -> io::Result<BoxedStream> {
        match self {
            #[cfg(unix)]
            Listener::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(Box::new(stream))
            }
            Listener::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                stream.set_nodelay(true)?;
                debug!(target = "exthost::transport", peer = %peer, "accepted tcp connection");
                Ok(Box::new(stream))
            }
        }
    }
}

struct SocketCleanup(PathBuf);

impl Drop for SocketCleanup {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.0) {
            if err.kind() != ErrorKind::NotFound {
                warn!(
                    target = "exthost::transport",
                    path = %self.0.display(),
                    error = %err,
                    "failed to remove socket file"
                );
            }
        }
    }
}

/// Listening endpoint for exactly one worker. The first connection is handed
/// out by [`SocketTransport::accept`]; later ones go to the reconnect sink.
pub struct SocketTransport {
    address: TransportAddress,
    listener: Option<Arc<Listener>>,
    cleanup: Option<SocketCleanup>,
    cancel: CancellationToken,
    accepted: bool,
    reconnect_task: Option<JoinHandle<()>>,
}

impl SocketTransport {
    /// `context_hint` (usually the workspace identity) scopes the socket name.
    pub fn start(config: &TransportConfig, context_hint: &str) -> Result<Self, TransportError> {
        #[cfg(unix)]
        if !config.force_tcp {
            return Self::start_unix(config, context_hint);
        }
        #[cfg(not(unix))]
        let _ = context_hint;
        Self::start_tcp()
    }

    #[cfg(unix)]
    fn start_unix(config: &TransportConfig, context_hint: &str) -> Result<Self, TransportError> {
        use std::os::unix::fs::PermissionsExt;

        let path = socket_path(&config.socket_dir, context_hint);
        let bind_error = |source: io::Error| TransportError::Bind {
            endpoint: path.display().to_string(),
            source,
        };
        fs::create_dir_all(&config.socket_dir).map_err(bind_error)?;
        if path.exists() {
            fs::remove_file(&path).map_err(bind_error)?;
        }
        let listener = UnixListener::bind(&path).map_err(bind_error)?;
        let cleanup = SocketCleanup(path.clone());
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600)).map_err(bind_error)?;
        info!(target = "exthost::transport", socket = %path.display(), "listening");
        Ok(Self {
            address: TransportAddress::Unix(path),
            listener: Some(Arc::new(Listener::Unix(listener))),
            cleanup: Some(cleanup),
            cancel: CancellationToken::new(),
            accepted: false,
            reconnect_task: None,
        })
    }

    fn start_tcp() -> Result<Self, TransportError> {
        let endpoint = SocketAddr::from((Ipv4Addr::LOCALHOST, 0));
        let bind_error = |source: io::Error| TransportError::Bind {
            endpoint: endpoint.to_string(),
            source,
        };
        let std_listener = std::net::TcpListener::bind(endpoint).map_err(bind_error)?;
        std_listener.set_nonblocking(true).map_err(bind_error)?;
        let listener = TcpListener::from_std(std_listener).map_err(bind_error)?;
        let local = listener.local_addr().map_err(bind_error)?;
        info!(target = "exthost::transport", addr = %local, "listening");
        Ok(Self {
            address: TransportAddress::Tcp(local),
            listener: Some(Arc::new(Listener::Tcp(listener))),
            cleanup: None,
            cancel: CancellationToken::new(),
            accepted: false,
            reconnect_task: None,
        })
    }

    pub fn address(&self) -> &TransportAddress {
        &self.address
    }

    /// Waits for the worker's first connection.
    pub async fn accept(&mut self, timeout: Duration) -> Result<BoxedStream, TransportError> {
        let listener = self.listener.clone().ok_or(TransportError::Stopped)?;
        let stream = tokio::select! {
            _ = self.cancel.cancelled() => return Err(TransportError::Stopped),
            accepted = tokio::time::timeout(timeout, listener.accept()) => match accepted {
                Err(_) => return Err(TransportError::AcceptTimeout(timeout)),
                Ok(result) => result.map_err(TransportError::Accept)?,
            },
        };
        self.accepted = true;
        info!(target = "exthost::transport", address = %self.address, "worker connected");
        Ok(stream)
    }

    /// Keeps accepting after the first connection: streams go to `sink` while
    /// it is awaiting a reconnect and are closed immediately otherwise.
    pub fn serve_reconnects(&mut self, sink: Arc<dyn ReconnectSink>) -> Result<(), TransportError> {
        let listener = self.listener.clone().ok_or(TransportError::Stopped)?;
        if let Some(previous) = self.reconnect_task.take() {
            previous.abort();
        }
        let cancel = self.cancel.clone();
        let address = self.address.clone();
        self.reconnect_task = Some(tokio::spawn(async move {
            loop {
                let stream = tokio::select! {
                    _ = cancel.cancelled() => return,
                    accepted = listener.accept() => accepted,
                };
                match stream {
                    Ok(stream) if sink.accepts_reconnect() => {
                        info!(target = "exthost::transport", address = %address, "reconnect accepted");
                        sink.reconnect(stream);
                    }
                    Ok(stream) => {
                        metrics::RECONNECTS.with_label_values(&["rejected"]).inc();
                        warn!(
                            target = "exthost::transport",
                            address = %address,
                            "rejecting extra connection; no reconnect pending"
                        );
                        drop(stream);
                    }
                    Err(err) => {
                        warn!(target = "exthost::transport", error = %err, "accept failed");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                }
            }
        }));
        Ok(())
    }

    pub fn has_accepted(&self) -> bool {
        self.accepted
    }

    /// Closes the listener and removes the socket file. Idempotent.
    pub fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.reconnect_task.take() {
            task.abort();
        }
        if self.listener.take().is_some() {
            debug!(target = "exthost::transport", address = %self.address, "transport stopped");
        }
        self.cleanup.take();
    }
}

impl Drop for SocketTransport {
    fn drop(&mut self) {
        self.stop();
    }
}

/// `<dir>/exthost-<context hash>-<random>.sock`, short enough for `sun_path`.
pub fn socket_path(dir: &Path, context: &str) -> PathBuf {
    let digest = hex::encode(Sha256::digest(context.as_bytes()));
    let nonce = uuid::Uuid::new_v4().simple().to_string();
    dir.join(format!("exthost-{}-{}.sock", &digest[..12], &nonce[..8]))
}

/// Worker-side connect to the address it was given at startup.
pub async fn connect(address: &TransportAddress) -> Result<BoxedStream, TransportError> {
    let connect_error = |source: io::Error| TransportError::Connect {
        address: address.clone(),
        source,
    };
    match address {
        #[cfg(unix)]
        TransportAddress::Unix(path) => {
            let stream = UnixStream::connect(path).await.map_err(connect_error)?;
            Ok(Box::new(stream))
        }
        #[cfg(not(unix))]
        TransportAddress::Unix(_) => Err(TransportError::Unsupported),
        TransportAddress::Tcp(addr) => {
            let stream = TcpStream::connect(addr).await.map_err(connect_error)?;
            stream.set_nodelay(true).map_err(connect_error)?;
            Ok(Box::new(stream))
        }
    }
}
