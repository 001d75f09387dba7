//! Transport backends behind one host/client contract.
//!
//! Hosts and clients only see [`Transport`], [`Acceptor`], and
//! [`Connection`]. Which backend serves them is decided when they are built,
//! by [`TransportKind::detect`], unless the consumer passes one explicitly.
//!
//! # Backends
//!
//! - **Abstract socket** (Linux): Unix stream socket in the abstract
//!   namespace. No file on disk; the name vanishes with the listener.
//! - **Filesystem socket** (any Unix): socket file under a private runtime
//!   directory. Stale files are removed before binding.
//! - **Named pipe** (Windows): first-instance-only pipe, so a second host on
//!   the same name fails like an in-use socket address.

use std::fmt;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::endpoint::{ConnectionId, EndpointAddress};
use crate::error::{IpcError, Result};

pub mod pipe;
pub mod unix;

#[cfg(windows)]
pub use pipe::PipeTransport;
#[cfg(unix)]
pub use unix::UnixTransport;

/// Selects a backend by name at runtime, e.g. `filesystem`.
pub const TRANSPORT_ENV: &str = "BRIDGE_IPC_TRANSPORT";

/// Pending-error check on a live connection, used by the host's health
/// monitor.
pub trait ConnectionProbe: Send + Sync + 'static {
    /// `Err` once the transport reports an error condition.
    fn check(&self) -> io::Result<()>;

    /// Tear the connection down for every handle sharing it.
    fn shutdown(&self);
}

/// One established duplex byte stream.
pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin + 'static {
    fn probe(&self) -> Option<Arc<dyn ConnectionProbe>> {
        None
    }
}

pub type BoxedConnection = Box<dyn Connection>;

/// A bound listening endpoint.
#[async_trait]
pub trait Acceptor: Send + 'static {
    async fn accept(&mut self) -> io::Result<BoxedConnection>;

    fn address(&self) -> &EndpointAddress;
}

pub type BoxedAcceptor = Box<dyn Acceptor>;

/// A way to bind and reach endpoints.
#[async_trait]
pub trait Transport: fmt::Debug + Send + Sync + 'static {
    fn kind(&self) -> TransportKind;

    /// Pure mapping from a connection id to this backend's address.
    fn derive_address(&self, id: &ConnectionId) -> EndpointAddress;

    /// Bind `address`. An address owned by another live instance is
    /// [`IpcError::AddressInUse`].
    async fn bind(&self, address: &EndpointAddress) -> Result<BoxedAcceptor>;

    async fn connect(&self, address: &EndpointAddress) -> io::Result<BoxedConnection>;
}

/// Available backend families, in preference order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    AbstractSocket,
    FilesystemSocket,
    NamedPipe,
}

impl TransportKind {
    pub const PREFERENCE: [TransportKind; 3] = [
        TransportKind::AbstractSocket,
        TransportKind::FilesystemSocket,
        TransportKind::NamedPipe,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::AbstractSocket => "abstract",
            TransportKind::FilesystemSocket => "filesystem",
            TransportKind::NamedPipe => "pipe",
        }
    }

    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "abstract" => Some(TransportKind::AbstractSocket),
            "filesystem" | "file" => Some(TransportKind::FilesystemSocket),
            "pipe" | "named_pipe" => Some(TransportKind::NamedPipe),
            _ => None,
        }
    }

    /// Whether this process can use the backend.
    pub fn is_available(&self) -> bool {
        match self {
            TransportKind::AbstractSocket => cfg!(target_os = "linux"),
            TransportKind::FilesystemSocket => cfg!(unix),
            TransportKind::NamedPipe => cfg!(windows),
        }
    }

    /// Capability check: the `BRIDGE_IPC_TRANSPORT` override if it names an
    /// available backend, otherwise the first available in preference order.
    pub fn detect() -> Self {
        let requested = std::env::var(TRANSPORT_ENV)
            .ok()
            .and_then(|name| Self::from_name(&name))
            .filter(TransportKind::is_available);
        requested.unwrap_or_else(|| {
            Self::PREFERENCE
                .into_iter()
                .find(TransportKind::is_available)
                .unwrap_or(TransportKind::FilesystemSocket)
        })
    }

    /// Construct the backend.
    pub fn create(self) -> Result<Arc<dyn Transport>> {
        match self {
            #[cfg(target_os = "linux")]
            TransportKind::AbstractSocket => Ok(Arc::new(UnixTransport::abstract_namespace())),
            #[cfg(unix)]
            TransportKind::FilesystemSocket => Ok(Arc::new(UnixTransport::filesystem_default())),
            #[cfg(windows)]
            TransportKind::NamedPipe => Ok(Arc::new(PipeTransport::new())),
            #[allow(unreachable_patterns)]
            other => Err(IpcError::Transport {
                message: format!("{} transport is not available on this platform", other),
                source: None,
            }),
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The backend [`TransportKind::detect`] picks.
pub fn default_transport() -> Result<Arc<dyn Transport>> {
    TransportKind::detect().create()
}

/// Connect errors meaning "nobody is listening there".
pub fn is_peer_absent(err: &io::Error) -> bool {
    // ERROR_PIPE_BUSY: every instance of the pipe is already connected.
    const PIPE_BUSY: i32 = 231;
    matches!(
        err.kind(),
        io::ErrorKind::NotFound
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::AddrNotAvailable
    ) || (cfg!(windows) && err.raw_os_error() == Some(PIPE_BUSY))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_name_roundtrip() {
        for kind in TransportKind::PREFERENCE {
            assert_eq!(TransportKind::from_name(kind.as_str()), Some(kind));
        }
        assert_eq!(TransportKind::from_name("carrier-pigeon"), None);
    }

    #[test]
    fn test_detect_picks_available_backend() {
        assert!(TransportKind::detect().is_available());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_linux_prefers_abstract_namespace() {
        assert!(TransportKind::AbstractSocket.is_available());
        assert!(TransportKind::FilesystemSocket.is_available());
        assert!(!TransportKind::NamedPipe.is_available());
    }

    #[cfg(unix)]
    #[test]
    fn test_unavailable_backend_is_an_error() {
        assert!(TransportKind::NamedPipe.create().is_err());
    }

    #[test]
    fn test_peer_absent_classification() {
        assert!(is_peer_absent(&io::Error::from(io::ErrorKind::ConnectionRefused)));
        assert!(is_peer_absent(&io::Error::from(io::ErrorKind::NotFound)));
        assert!(!is_peer_absent(&io::Error::from(io::ErrorKind::PermissionDenied)));
    }
}
