//! Unix stream socket transport, in the abstract namespace or on disk.
#![cfg(unix)]

use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::DirBuilderExt;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use fs2::FileExt;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, warn};

use super::{Acceptor, BoxedAcceptor, BoxedConnection, Connection, ConnectionProbe, Transport, TransportKind};
use crate::config::EndpointConfig;
use crate::endpoint::{self, ConnectionId, EndpointAddress};
use crate::error::{IpcError, Result};

/// Directory for socket files: `BRIDGE_IPC_SOCKET_DIR`, else the user runtime
/// directory, else the system temp directory.
pub fn default_socket_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(EndpointConfig::SOCKET_DIR_ENV) {
        return PathBuf::from(dir);
    }
    dirs::runtime_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(EndpointConfig::SOCKET_DIR_NAME)
}

#[derive(Debug, Clone)]
enum Namespace {
    #[cfg(target_os = "linux")]
    Abstract,
    Filesystem(PathBuf),
}

/// Unix domain socket backend.
#[derive(Debug, Clone)]
pub struct UnixTransport {
    namespace: Namespace,
}

impl UnixTransport {
    /// Names live in the kernel's abstract namespace and disappear with the
    /// listener.
    #[cfg(target_os = "linux")]
    pub fn abstract_namespace() -> Self {
        Self {
            namespace: Namespace::Abstract,
        }
    }

    /// Socket files under `dir`.
    pub fn filesystem(dir: impl Into<PathBuf>) -> Self {
        Self {
            namespace: Namespace::Filesystem(dir.into()),
        }
    }

    pub fn filesystem_default() -> Self {
        Self::filesystem(default_socket_dir())
    }

    /// Socket directory, for filesystem sockets.
    pub fn socket_dir(&self) -> Option<&Path> {
        match &self.namespace {
            Namespace::Filesystem(dir) => Some(dir),
            #[cfg(target_os = "linux")]
            Namespace::Abstract => None,
        }
    }
}

#[async_trait]
impl Transport for UnixTransport {
    fn kind(&self) -> TransportKind {
        match self.namespace {
            #[cfg(target_os = "linux")]
            Namespace::Abstract => TransportKind::AbstractSocket,
            Namespace::Filesystem(_) => TransportKind::FilesystemSocket,
        }
    }

    fn derive_address(&self, id: &ConnectionId) -> EndpointAddress {
        match &self.namespace {
            #[cfg(target_os = "linux")]
            Namespace::Abstract => EndpointAddress::Abstract(endpoint::abstract_name(id)),
            Namespace::Filesystem(dir) => EndpointAddress::Path(endpoint::socket_path(dir, id)),
        }
    }

    async fn bind(&self, address: &EndpointAddress) -> Result<BoxedAcceptor> {
        let (listener, socket_file) = match address {
            #[cfg(target_os = "linux")]
            EndpointAddress::Abstract(name) => (bind_abstract(name).map_err(|e| bind_error(address, e))?, None),
            EndpointAddress::Path(path) => {
                let lock = claim_socket_file(address, path)?;
                let listener = UnixListener::bind(path).map_err(|e| bind_error(address, e))?;
                (
                    listener,
                    Some(SocketFile {
                        path: path.clone(),
                        _lock: lock,
                    }),
                )
            }
            other => return Err(unsupported(other)),
        };
        debug!("Listening on {}", address);
        Ok(Box::new(UnixAcceptor {
            listener,
            address: address.clone(),
            _socket_file: socket_file,
        }))
    }

    async fn connect(&self, address: &EndpointAddress) -> io::Result<BoxedConnection> {
        let stream = match address {
            #[cfg(target_os = "linux")]
            EndpointAddress::Abstract(name) => connect_abstract(name)?,
            EndpointAddress::Path(path) => UnixStream::connect(path).await?,
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("not a unix socket address: {}", other),
                ))
            }
        };
        Ok(Box::new(UnixConnection::new(stream)?))
    }
}

#[cfg(target_os = "linux")]
fn abstract_addr(name: &str) -> io::Result<std::os::unix::net::SocketAddr> {
    use std::os::linux::net::SocketAddrExt;
    std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes())
}

#[cfg(target_os = "linux")]
fn bind_abstract(name: &str) -> io::Result<UnixListener> {
    let listener = std::os::unix::net::UnixListener::bind_addr(&abstract_addr(name)?)?;
    listener.set_nonblocking(true)?;
    UnixListener::from_std(listener)
}

#[cfg(target_os = "linux")]
fn connect_abstract(name: &str) -> io::Result<UnixStream> {
    let stream = StdUnixStream::connect_addr(&abstract_addr(name)?)?;
    stream.set_nonblocking(true)?;
    UnixStream::from_std(stream)
}

/// Sidecar lock file guarding ownership of `path`.
fn lock_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(EndpointConfig::LOCK_FILE_EXTENSION);
    PathBuf::from(name)
}

/// Take ownership of the socket file at `path`.
///
/// Ownership is an exclusive advisory lock on the sidecar lock file, held for
/// the acceptor's lifetime; the socket itself is never connected to. With the
/// lock held, a socket file already on disk is one a crashed host left
/// behind and is removed.
fn claim_socket_file(address: &EndpointAddress, path: &Path) -> Result<File> {
    let len = path.as_os_str().as_bytes().len();
    if len > EndpointConfig::SOCKET_PATH_MAX_LEN {
        return Err(IpcError::Transport {
            message: format!(
                "socket path {} is {} bytes (maximum {}); use a shorter socket directory",
                path.display(),
                len,
                EndpointConfig::SOCKET_PATH_MAX_LEN
            ),
            source: None,
        });
    }
    if let Some(dir) = path.parent() {
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(dir)?;
    }

    let lock_file = lock_path(path);
    let lock = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(&lock_file)?;
    if let Err(e) = FileExt::try_lock_exclusive(&lock) {
        if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() {
            return Err(IpcError::AddressInUse {
                address: address.to_string(),
            });
        }
        return Err(IpcError::Transport {
            message: format!("Failed to lock {}: {}", lock_file.display(), e),
            source: Some(e),
        });
    }

    match std::fs::remove_file(path) {
        Ok(()) => warn!("Removing stale socket file: {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    Ok(lock)
}

fn bind_error(address: &EndpointAddress, err: io::Error) -> IpcError {
    if err.kind() == io::ErrorKind::AddrInUse {
        IpcError::AddressInUse {
            address: address.to_string(),
        }
    } else {
        IpcError::Transport {
            message: format!("Failed to bind {}: {}", address, err),
            source: Some(err),
        }
    }
}

fn unsupported(address: &EndpointAddress) -> IpcError {
    IpcError::Transport {
        message: format!("not a unix socket address: {}", address),
        source: None,
    }
}

/// An owned socket file. It is removed before the lock is released.
struct SocketFile {
    path: PathBuf,
    // The lock file itself stays on disk; unlinking it could hand ownership
    // to two hosts at once.
    _lock: File,
}

impl Drop for SocketFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("Failed to remove socket file {}: {}", self.path.display(), e);
            }
        }
    }
}

struct UnixAcceptor {
    listener: UnixListener,
    address: EndpointAddress,
    _socket_file: Option<SocketFile>,
}

#[async_trait]
impl Acceptor for UnixAcceptor {
    async fn accept(&mut self) -> io::Result<BoxedConnection> {
        let (stream, _) = self.listener.accept().await?;
        Ok(Box::new(UnixConnection::new(stream)?))
    }

    fn address(&self) -> &EndpointAddress {
        &self.address
    }
}

/// Stream plus a shared duplicate descriptor for health checks and forced
/// teardown.
struct UnixConnection {
    stream: UnixStream,
    probe: Arc<SocketProbe>,
}

impl UnixConnection {
    fn new(stream: UnixStream) -> io::Result<Self> {
        let std_stream = stream.into_std()?;
        let duplicate = std_stream.try_clone()?;
        let stream = UnixStream::from_std(std_stream)?;
        Ok(Self {
            stream,
            probe: Arc::new(SocketProbe(duplicate)),
        })
    }
}

impl AsyncRead for UnixConnection {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for UnixConnection {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}

impl Connection for UnixConnection {
    fn probe(&self) -> Option<Arc<dyn ConnectionProbe>> {
        Some(self.probe.clone())
    }
}

struct SocketProbe(StdUnixStream);

impl ConnectionProbe for SocketProbe {
    fn check(&self) -> io::Result<()> {
        match self.0.take_error()? {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn shutdown(&self) {
        let _ = self.0.shutdown(std::net::Shutdown::Both);
    }
}
