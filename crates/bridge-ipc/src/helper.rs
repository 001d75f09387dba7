//! Both ends of a bridge session, wired from a host and a client apiece.
//!
//! The main application hosts [`BridgeEvents`] on `FLExBridgeEndpoint<pipe>`
//! and launches the bridge with `-pipeID <pipe>`. The bridge hosts
//! [`BridgeWork`] on `FLExEndpoint<pipe>`, connects back and announces
//! `ready`. The application then parks in `workOngoing` until the bridge
//! reports `workComplete`.
//!
//! A peer that isn't listening is never fatal: the side that noticed keeps
//! running with notifications turned into no-ops.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::client::{Client, DoneHook};
use crate::config::LaunchConfig;
use crate::endpoint::ConnectionId;
use crate::error::{IpcError, Result};
use crate::event::{Completion, CrossProcessEvent};
use crate::host::{Host, HostBuilder};
use crate::protocol::Arg;
use crate::services::{BridgeEvents, BridgeWork, Operations};
use crate::transport::{self, Transport};

/// Launch options as `-flag value` pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchOptions {
    values: HashMap<String, String>,
}

impl LaunchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collect `-flag value` pairs. A flag followed by another flag, or at
    /// the end, gets an empty value; stray values are ignored.
    pub fn from_args<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut values = HashMap::new();
        let mut current: Option<String> = None;
        for arg in args {
            let arg = arg.as_ref();
            if arg.starts_with('-') {
                if let Some(flag) = current.replace(arg.to_string()) {
                    values.insert(flag, String::new());
                }
            } else if let Some(flag) = current.take() {
                values.insert(flag, arg.to_string());
            }
        }
        if let Some(flag) = current {
            values.insert(flag, String::new());
        }
        Self { values }
    }

    pub fn with(mut self, flag: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(flag.into(), value.into());
        self
    }

    pub fn get(&self, flag: &str) -> Option<&str> {
        self.values.get(flag).map(String::as_str)
    }

    /// Session id both processes derive their endpoints from. Missing means
    /// the empty id.
    pub fn pipe_id(&self) -> &str {
        self.get(LaunchConfig::PIPE_ID_FLAG).unwrap_or_default()
    }
}

fn resolve(transport: Option<Arc<dyn Transport>>) -> Result<Arc<dyn Transport>> {
    match transport {
        Some(transport) => Ok(transport),
        None => transport::default_transport(),
    }
}

/// The bridge's side of a session.
pub struct BridgeConnection {
    host: Host<BridgeWork>,
    client: Option<Client>,
}

impl BridgeConnection {
    /// Host [`BridgeWork`] and announce readiness to the application.
    ///
    /// [`IpcError::AddressInUse`] means another bridge already serves this
    /// session. An application that isn't listening leaves the connection
    /// working in degraded mode.
    pub async fn init(options: &LaunchOptions) -> Result<Self> {
        Self::init_with(options, None).await
    }

    pub async fn init_with(options: &LaunchOptions, transport: Option<Arc<dyn Transport>>) -> Result<Self> {
        let transport = resolve(transport)?;
        let pipe_id = options.pipe_id();

        let event = CrossProcessEvent::new();
        let host = HostBuilder::new(ConnectionId::app_endpoint(pipe_id))
            .transport(transport.clone())
            .serve_with(Arc::new(BridgeWork::with_event(event.clone())))
            .await
            .inspect_err(|e| {
                if e.is_already_running() {
                    warn!("Bridge already running for session {:?}", pipe_id);
                }
            })?;

        let client = match Client::builder(ConnectionId::bridge_endpoint(pipe_id))
            .transport(transport)
            .wait_handle(event.wait_handle())
            .connect()
            .await
        {
            Ok(client) => match client.call_sync(Operations::READY, &[]).await {
                Ok(()) => Some(client),
                Err(e) => {
                    info!("Application not listening: {}", e);
                    None
                }
            },
            Err(e) if e.is_peer_unavailable() => {
                info!("Application not listening: {}", e);
                None
            }
            Err(e) => return Err(e),
        };

        Ok(Self { host, client })
    }

    /// True while notifications reach the application.
    pub fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    pub fn host(&self) -> &Host<BridgeWork> {
        &self.host
    }

    async fn notify(&self, operation: &str, args: &[Arg]) -> Result<()> {
        let Some(client) = &self.client else {
            debug!("Not connected; {} dropped", operation);
            return Ok(());
        };
        client.call_sync(operation, args).await.inspect_err(|e| {
            warn!("Application not listening to {}: {}", operation, e);
        })
    }

    /// Tell the application which project was chosen, or none.
    pub async fn send_project_name(&self, path: Option<&str>) -> Result<()> {
        self.notify(Operations::SET_PROJECT_NAME, &[Arg::from(path.unwrap_or_default())])
            .await
    }

    /// An obtain was cancelled or failed.
    pub async fn tell_no_new_project(&self) -> Result<()> {
        self.send_project_name(None).await
    }

    pub async fn send_jump_url(&self, url: &str) -> Result<()> {
        self.notify(Operations::SENT_JUMP_URL, &[Arg::from(url)]).await
    }

    /// Report completion directly and release the application's parked
    /// `workOngoing` call.
    pub async fn signal_work_complete(&self, changes_received: bool) -> Result<()> {
        info!("Signalling work complete (changes received: {})", changes_received);
        let notified = self
            .notify(Operations::WORK_COMPLETE, &[Arg::from(changes_received)])
            .await;
        self.host.service().event().signal(changes_received);
        notified
    }

    pub fn close(&mut self) {
        if let Some(client) = self.client.take() {
            client.close();
        }
        self.host.close();
    }
}

/// How the bridge session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkOutcome {
    Completed { changes_received: bool },
    /// The bridge went away without reporting completion.
    BridgeVanished,
}

/// Everything the bridge reported during one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkReport {
    pub outcome: WorkOutcome,
    pub project_name: Option<String>,
    pub jump_urls: Vec<String>,
}

impl WorkReport {
    pub fn changes_received(&self) -> bool {
        matches!(
            self.outcome,
            WorkOutcome::Completed {
                changes_received: true
            }
        )
    }
}

/// The main application's side of a session.
pub struct AppConnection {
    pipe_id: String,
    transport: Arc<dyn Transport>,
    host: Host<BridgeEvents>,
    client: Option<Client>,
}

impl AppConnection {
    /// Host [`BridgeEvents`] for the bridge that will be launched with
    /// `-pipeID pipe_id`.
    pub async fn start(pipe_id: &str) -> Result<Self> {
        Self::start_with(pipe_id, None).await
    }

    pub async fn start_with(pipe_id: &str, transport: Option<Arc<dyn Transport>>) -> Result<Self> {
        let transport = resolve(transport)?;
        let events = Arc::new(BridgeEvents::new());
        let activity = events.activity();
        let completion = events.completion().wait_handle();

        let host = HostBuilder::new(ConnectionId::bridge_endpoint(pipe_id))
            .transport(transport.clone())
            .on_alert(move || {
                activity.pulse();
                completion.pulse();
            })
            .serve_with(events)
            .await?;

        Ok(Self {
            pipe_id: pipe_id.to_string(),
            transport,
            host,
            client: None,
        })
    }

    pub fn events(&self) -> &Arc<BridgeEvents> {
        self.host.service()
    }

    pub fn host(&self) -> &Host<BridgeEvents> {
        &self.host
    }

    /// Park until the bridge announces `ready`.
    pub async fn wait_ready(&self) -> Result<()> {
        let activity = self.events().activity();
        loop {
            let seen = activity.generation();
            if self.events().is_ready() {
                return Ok(());
            }
            if self.host.state().is_final() {
                return Err(IpcError::peer_unavailable(
                    self.host.tag(),
                    "bridge went away before announcing ready",
                ));
            }
            activity.wait_past(seen).await;
        }
    }

    /// Open the reverse channel to the bridge's [`BridgeWork`] host.
    pub async fn connect_back(&mut self) -> Result<()> {
        if self.client.is_some() {
            return Ok(());
        }
        let client = Client::builder(ConnectionId::app_endpoint(&self.pipe_id))
            .transport(self.transport.clone())
            .wait_handle(self.events().completion().wait_handle())
            .connect()
            .await?;
        self.client = Some(client);
        Ok(())
    }

    /// Issue `workOngoing` and park until the bridge reports completion.
    pub async fn run_work(&mut self) -> Result<WorkReport> {
        self.connect_back().await?;
        let Some(client) = &self.client else {
            return Err(IpcError::Closed);
        };
        // Anything that pulses the completion handle from here on, including
        // a fault before the wait starts, ends the wait.
        let seen = self.events().completion().wait_handle().generation();

        let on_done: DoneHook = Box::new(|result: Result<()>| match result {
            Ok(()) => debug!("workOngoing acknowledged"),
            Err(e) => debug!("workOngoing ended without acknowledgment: {}", e),
        });
        let sent = client
            .call_async(Operations::WORK_ONGOING, &[], Some(on_done))
            .await;
        if let Err(e) = sent {
            // The failed send pulsed the completion handle; a signal that
            // arrived earlier still wins below.
            warn!("Bridge not listening for workOngoing: {}", e);
        }

        let completion = self.events().completion().wait_since(seen).await?;
        let record = self.events().snapshot();
        let outcome = match completion {
            Completion::Signaled(changes_received) => WorkOutcome::Completed { changes_received },
            Completion::Interrupted => match record.changes_received {
                Some(changes_received) => WorkOutcome::Completed { changes_received },
                None => WorkOutcome::BridgeVanished,
            },
        };
        Ok(WorkReport {
            outcome,
            project_name: record.project_name,
            jump_urls: record.jump_urls,
        })
    }

    /// Wait for the bridge, then run its work to completion.
    pub async fn run(&mut self) -> Result<WorkReport> {
        self.wait_ready().await?;
        self.run_work().await
    }

    pub fn close(&mut self) {
        if let Some(client) = self.client.take() {
            client.close();
        }
        self.host.close();
    }
}
