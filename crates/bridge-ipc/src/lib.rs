//! Bridge IPC - duplex named-call IPC between two cooperating processes.
//!
//! One process exposes a [`Service`] through a [`Host`]; the other holds a
//! [`Client`] and invokes its operations by name. Running one of each in both
//! processes gives a duplex pair, so either side can call into the other.
//!
//! Calls carry positional scalar arguments (text, boolean, 32-bit integer)
//! and are answered only with an acknowledgment. A client has at most one
//! call in flight.
//!
//! # Example
//!
//! ```rust,ignore
//! use bridge_ipc::{BridgeEvents, Client, HostBuilder};
//!
//! #[tokio::main]
//! async fn main() -> bridge_ipc::Result<()> {
//!     let host = HostBuilder::new("Bridge-proj").serve::<BridgeEvents>().await?;
//!
//!     let client = Client::builder("Bridge-proj").connect().await?;
//!     client.call_sync("ready", &[]).await?;
//!     assert!(host.service().is_ready());
//!
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod event;
pub mod helper;
pub mod host;
pub mod protocol;
pub mod service;
pub mod services;
pub mod transport;

pub use client::{Client, ClientBuilder, ClientState, DoneHook};
pub use endpoint::{ConnectionId, EndpointAddress};
pub use error::{IpcError, Result};
pub use event::{Completion, CrossProcessEvent, WaitHandle};
pub use helper::{AppConnection, BridgeConnection, LaunchOptions, WorkOutcome, WorkReport};
pub use host::{Host, HostBuilder, HostEvent, HostState};
pub use protocol::{Arg, Message, ParamType};
pub use service::{DispatchTable, DispatchTableBuilder, Service};
pub use services::{BridgeEvents, BridgeRecord, BridgeWork, Operations};
pub use transport::{default_transport, Transport, TransportKind};
