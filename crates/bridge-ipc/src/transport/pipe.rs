//! Windows named pipe transport.
#![cfg(windows)]

use std::io;

use async_trait::async_trait;
use tokio::net::windows::named_pipe::{ClientOptions, NamedPipeClient, NamedPipeServer, ServerOptions};
use tracing::debug;

use super::{Acceptor, BoxedAcceptor, BoxedConnection, Connection, Transport, TransportKind};
use crate::endpoint::{self, ConnectionId, EndpointAddress};
use crate::error::{IpcError, Result};

/// Named pipe backend. The first pipe instance claims the name, so a second
/// host on the same id fails to bind.
#[derive(Debug, Clone, Default)]
pub struct PipeTransport;

impl PipeTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for PipeTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::NamedPipe
    }

    fn derive_address(&self, id: &ConnectionId) -> EndpointAddress {
        EndpointAddress::Pipe(endpoint::pipe_name(id))
    }

    async fn bind(&self, address: &EndpointAddress) -> Result<BoxedAcceptor> {
        let EndpointAddress::Pipe(name) = address else {
            return Err(IpcError::Transport {
                message: format!("not a pipe address: {}", address),
                source: None,
            });
        };
        let server = ServerOptions::new()
            .first_pipe_instance(true)
            .create(name)
            .map_err(|err| match err.kind() {
                io::ErrorKind::PermissionDenied | io::ErrorKind::AddrInUse => IpcError::AddressInUse {
                    address: address.to_string(),
                },
                _ => IpcError::Transport {
                    message: format!("Failed to create pipe {}: {}", address, err),
                    source: Some(err),
                },
            })?;
        debug!("Listening on {}", address);
        Ok(Box::new(PipeAcceptor {
            server: Some(server),
            address: address.clone(),
        }))
    }

    async fn connect(&self, address: &EndpointAddress) -> io::Result<BoxedConnection> {
        let EndpointAddress::Pipe(name) = address else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("not a pipe address: {}", address),
            ));
        };
        let client = ClientOptions::new().open(name)?;
        Ok(Box::new(client))
    }
}

/// Hands out its single pipe instance. Hosts accept exactly once.
struct PipeAcceptor {
    server: Option<NamedPipeServer>,
    address: EndpointAddress,
}

#[async_trait]
impl Acceptor for PipeAcceptor {
    async fn accept(&mut self) -> io::Result<BoxedConnection> {
        let Some(server) = self.server.as_ref() else {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "pipe instance already handed out",
            ));
        };
        server.connect().await?;
        match self.server.take() {
            Some(server) => Ok(Box::new(server)),
            None => Err(io::Error::new(io::ErrorKind::Other, "pipe instance vanished")),
        }
    }

    fn address(&self) -> &EndpointAddress {
        &self.address
    }
}

impl Connection for NamedPipeServer {}

impl Connection for NamedPipeClient {}
