use std::fmt;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

pub mod framed;
pub mod persistent;
pub mod socket;

pub use framed::{Frame, FrameDecoder, FrameKind, FramingError};
pub use persistent::{
    FrameReceiver, PersistentProtocol, ProtocolConfig, ProtocolError, ProtocolEvent,
    ProtocolState,
};
pub use socket::{connect, ReconnectSink, SocketTransport, TransportConfig};

/// Raw duplex byte stream backing one connection.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type BoxedStream = Box<dyn AsyncStream>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to bind {endpoint}: {source}")]
    Bind {
        endpoint: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to connect to {address}: {source}")]
    Connect {
        address: TransportAddress,
        #[source]
        source: io::Error,
    },
    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),
    #[error("no connection within {0:?}")]
    AcceptTimeout(std::time::Duration),
    #[error("transport already stopped")]
    Stopped,
    #[error("local sockets are not supported on this platform")]
    Unsupported,
}

/// Opaque token a separate process needs to reach the listening endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TransportAddress {
    Unix(PathBuf),
    Tcp(SocketAddr),
}

impl TransportAddress {
    /// Interprets a worker startup argument: all digits is a loopback TCP port,
    /// anything else is a socket path.
    pub fn parse(arg: &str) -> Self {
        let trimmed = arg.trim();
        match trimmed.parse::<u16>() {
            Ok(port) if !trimmed.is_empty() => {
                TransportAddress::Tcp(SocketAddr::from((Ipv4Addr::LOCALHOST, port)))
            }
            _ => TransportAddress::Unix(PathBuf::from(trimmed)),
        }
    }

    /// Rendering passed to the worker process.
    pub fn as_arg(&self) -> String {
        match self {
            TransportAddress::Unix(path) => path.display().to_string(),
            TransportAddress::Tcp(addr) => addr.port().to_string(),
        }
    }
}

impl fmt::Display for TransportAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportAddress::Unix(path) => write!(f, "unix:{}", path.display()),
            TransportAddress::Tcp(addr) => write!(f, "tcp:{addr}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_argument_is_loopback_port() {
        let address = TransportAddress::parse("40123");
        assert_eq!(
            address,
            TransportAddress::Tcp(SocketAddr::from((Ipv4Addr::LOCALHOST, 40123)))
        );
        assert_eq!(address.as_arg(), "40123");
    }

    #[test]
    fn path_argument_is_unix_socket() {
        let address = TransportAddress::parse("/tmp/exthost-abc.sock");
        assert_eq!(
            address,
            TransportAddress::Unix(PathBuf::from("/tmp/exthost-abc.sock"))
        );
        assert_eq!(address.as_arg(), "/tmp/exthost-abc.sock");
    }

    #[test]
    fn out_of_range_number_is_treated_as_path() {
        assert!(matches!(
            TransportAddress::parse("99999"),
            TransportAddress::Unix(_)
        ));
    }
}
