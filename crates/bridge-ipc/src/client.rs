//! Calling side of one directional channel.
//!
//! A [`Client`] owns one outbound connection to a host and issues at most one
//! call at a time. A second call while one awaits its acknowledgment is
//! rejected with [`IpcError::CallInFlight`] instead of clobbering the first.
//!
//! [`call_async`](Client::call_async) returns once the message is written; the
//! acknowledgment is read on a background task which then runs `on_done` and
//! pulses the client's [`WaitHandle`]. The pulse also happens when the call
//! fails, so a task parked on that handle always wakes.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::OwnedMutexGuard;
use tokio::task::AbortHandle;
use tracing::{debug, trace, warn};

use crate::endpoint::{ConnectionId, EndpointAddress};
use crate::error::{IpcError, Result};
use crate::event::WaitHandle;
use crate::protocol::{encode, write_message, Arg, FrameReader};
use crate::transport::{self, BoxedConnection, ConnectionProbe, Transport};

type Hook = Box<dyn FnOnce() + Send>;

/// Completion callback for [`Client::call_async`].
pub type DoneHook = Box<dyn FnOnce(Result<()>) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Connected,
    /// A call hit a transport error; every later call fails fast.
    Faulted,
    Closed,
}

struct Link {
    reader: FrameReader<ReadHalf<BoxedConnection>>,
    writer: WriteHalf<BoxedConnection>,
}

type LinkSlot = Arc<tokio::sync::Mutex<Option<Link>>>;

struct Inner {
    tag: String,
    link: LinkSlot,
    probe: Option<Arc<dyn ConnectionProbe>>,
    state: Mutex<ClientState>,
    /// Operation awaiting acknowledgment.
    pending: Mutex<Option<String>>,
    wait_handle: WaitHandle,
    cleanup: Mutex<Option<Hook>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Inner {
    fn state(&self) -> ClientState {
        *lock(&self.state)
    }

    fn unavailable(&self, reason: impl std::fmt::Display) -> IpcError {
        IpcError::peer_unavailable(&self.tag, reason)
    }

    /// Mark the connection dead. False if it already was, or was closed.
    fn mark_faulted(&self, reason: &str) -> bool {
        {
            let mut state = lock(&self.state);
            if *state != ClientState::Connected {
                return false;
            }
            *state = ClientState::Faulted;
        }
        warn!("{}: call failed, peer unavailable: {}", self.tag, reason);
        true
    }

    /// Mark the connection dead and release consumer resources.
    fn fault(&self, reason: &str) {
        if self.mark_faulted(reason) {
            self.run_cleanup();
        }
    }

    /// Fault after an async call: waiters are woken before cleanup runs.
    fn fault_and_pulse(&self, reason: Option<&str>) {
        let faulted = reason.is_some_and(|reason| self.mark_faulted(reason));
        self.wait_handle.pulse();
        if faulted {
            self.run_cleanup();
        }
    }

    fn run_cleanup(&self) {
        let cleanup = lock(&self.cleanup).take();
        if let Some(cleanup) = cleanup {
            cleanup();
        }
    }
}

/// Occupies the single pending-call slot until dropped.
struct PendingCall {
    inner: Arc<Inner>,
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        lock(&self.inner.pending).take();
    }
}

/// Configures and connects a [`Client`].
pub struct ClientBuilder {
    id: ConnectionId,
    transport: Option<Arc<dyn Transport>>,
    wait_handle: Option<WaitHandle>,
    cleanup: Option<Hook>,
}

impl ClientBuilder {
    pub fn new(id: impl Into<ConnectionId>) -> Self {
        Self {
            id: id.into(),
            transport: None,
            wait_handle: None,
            cleanup: None,
        }
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Handle pulsed whenever an async call completes or fails. Defaults to a
    /// fresh handle.
    pub fn wait_handle(mut self, handle: WaitHandle) -> Self {
        self.wait_handle = Some(handle);
        self
    }

    /// Runs once, on close or when a call finds the peer gone.
    pub fn on_cleanup(mut self, cleanup: impl FnOnce() + Send + 'static) -> Self {
        self.cleanup = Some(Box::new(cleanup));
        self
    }

    /// Open the connection.
    ///
    /// Nobody listening at the derived address is
    /// [`IpcError::PeerUnavailable`]; any other connect failure is a
    /// transport error.
    pub async fn connect(self) -> Result<Client> {
        let transport = match self.transport {
            Some(transport) => transport,
            None => transport::default_transport()?,
        };
        let address = transport.derive_address(&self.id);
        let tag = self.id.tag();

        let conn = transport.connect(&address).await.map_err(|e| {
            if transport::is_peer_absent(&e) {
                debug!("{}: nobody listening on {}: {}", tag, address, e);
                IpcError::peer_unavailable(&tag, format!("nobody listening on {}", address))
            } else {
                IpcError::Transport {
                    message: format!("Failed to connect to {}: {}", address, e),
                    source: Some(e),
                }
            }
        })?;
        debug!("{}: connected to {}", tag, address);

        let probe = conn.probe();
        let (reader, writer) = tokio::io::split(conn);
        let inner = Arc::new(Inner {
            tag,
            link: Arc::new(tokio::sync::Mutex::new(Some(Link {
                reader: FrameReader::new(reader),
                writer,
            }))),
            probe,
            state: Mutex::new(ClientState::Connected),
            pending: Mutex::new(None),
            wait_handle: self.wait_handle.unwrap_or_default(),
            cleanup: Mutex::new(self.cleanup),
        });

        Ok(Client {
            id: self.id,
            address,
            inner,
            task: Mutex::new(None),
        })
    }
}

/// One outbound connection with a single call slot.
pub struct Client {
    id: ConnectionId,
    address: EndpointAddress,
    inner: Arc<Inner>,
    task: Mutex<Option<AbortHandle>>,
}

impl Client {
    pub fn builder(id: impl Into<ConnectionId>) -> ClientBuilder {
        ClientBuilder::new(id)
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn tag(&self) -> &str {
        &self.inner.tag
    }

    pub fn address(&self) -> &EndpointAddress {
        &self.address
    }

    pub fn state(&self) -> ClientState {
        self.inner.state()
    }

    pub fn wait_handle(&self) -> WaitHandle {
        self.inner.wait_handle.clone()
    }

    /// Operation currently awaiting acknowledgment, if any.
    pub fn pending_call(&self) -> Option<String> {
        lock(&self.inner.pending).clone()
    }

    /// Claim the call slot, or explain why no call can be issued.
    fn begin(&self, operation: &str) -> Result<PendingCall> {
        match self.inner.state() {
            ClientState::Connected => {}
            ClientState::Faulted => return Err(self.inner.unavailable("connection faulted")),
            ClientState::Closed => return Err(IpcError::Closed),
        }
        let mut pending = lock(&self.inner.pending);
        if let Some(current) = pending.as_ref() {
            return Err(IpcError::CallInFlight {
                pending: current.clone(),
                requested: operation.to_string(),
            });
        }
        *pending = Some(operation.to_string());
        Ok(PendingCall {
            inner: self.inner.clone(),
        })
    }

    /// Send and wait for the acknowledgment.
    ///
    /// Arguments the wire format cannot carry are rejected before anything
    /// is sent, leaving the connection usable.
    pub async fn call_sync(&self, operation: &str, args: &[Arg]) -> Result<()> {
        let bytes = encode(operation, args)?;
        let _pending = self.begin(operation)?;
        trace!("{}: calling {} {:?}", self.inner.tag, operation, args);

        let mut link = self.inner.link.lock().await;
        let Some(link) = link.as_mut() else {
            return Err(IpcError::Closed);
        };
        let result = async {
            write_message(&mut link.writer, &bytes).await?;
            read_ack(link, operation, &self.inner.tag).await
        }
        .await;

        result.map_err(|e| {
            let reason = e.to_string();
            self.inner.fault(&reason);
            self.inner.unavailable(reason)
        })
    }

    /// Send and return; the acknowledgment is handled in the background.
    ///
    /// The result reflects only the send. `on_done` receives the call's final
    /// outcome, after which the wait handle is pulsed; on failure the cleanup
    /// hook runs last. A failed send also does all of this before returning.
    pub async fn call_async(&self, operation: &str, args: &[Arg], on_done: Option<DoneHook>) -> Result<()> {
        let bytes = encode(operation, args)?;
        let pending = self.begin(operation)?;
        trace!("{}: calling {} {:?} (async)", self.inner.tag, operation, args);

        let mut link: OwnedMutexGuard<Option<Link>> = self.inner.link.clone().lock_owned().await;
        let sent = match link.as_mut() {
            Some(link) => write_message(&mut link.writer, &bytes).await,
            None => Err(IpcError::Closed),
        };
        if let Err(e) = sent {
            let reason = e.to_string();
            drop(link);
            drop(pending);
            if let Some(done) = on_done {
                done(Err(self.inner.unavailable(&reason)));
            }
            self.inner.fault_and_pulse(Some(&reason));
            return Err(self.inner.unavailable(reason));
        }

        let inner = self.inner.clone();
        let operation = operation.to_string();
        let task = tokio::spawn(async move {
            let result = match link.as_mut() {
                Some(l) => read_ack(l, &operation, &inner.tag).await,
                None => Err(IpcError::Closed),
            };
            // Free the slot before callbacks so `on_done` may call again.
            drop(link);
            drop(pending);

            let failure = result.as_ref().err().map(|e| e.to_string());
            let result = result.map_err(|e| inner.unavailable(e));
            if let Some(done) = on_done {
                done(result);
            }
            inner.fault_and_pulse(failure.as_deref());
        });
        *lock(&self.task) = Some(task.abort_handle());
        Ok(())
    }

    /// Release the connection and run the cleanup hook. Idempotent.
    ///
    /// An async call still awaiting acknowledgment is abandoned; its
    /// `on_done` does not run, but the wait handle is pulsed.
    pub fn close(&self) {
        {
            let mut state = lock(&self.inner.state);
            if *state == ClientState::Closed {
                return;
            }
            *state = ClientState::Closed;
        }

        let abandoned = match lock(&self.task).take() {
            Some(task) => {
                let running = !task.is_finished();
                task.abort();
                running
            }
            None => false,
        };
        if let Some(probe) = &self.inner.probe {
            probe.shutdown();
        }
        match self.inner.link.try_lock() {
            Ok(mut link) => {
                link.take();
            }
            // Held by a call that is unwinding; the connection goes with it.
            Err(_) => debug!("{}: connection busy during close", self.inner.tag),
        }
        if abandoned {
            self.inner.wait_handle.pulse();
        }
        self.inner.run_cleanup();
        debug!("{}: client closed", self.inner.tag);
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close();
    }
}

/// Read one acknowledgment. Its operation name is only compared for
/// diagnostics.
async fn read_ack(link: &mut Link, operation: &str, tag: &str) -> Result<()> {
    let Some(ack) = link.reader.read_message().await? else {
        return Err(IpcError::Transport {
            message: format!("connection closed before {} was acknowledged", operation),
            source: None,
        });
    };
    match ack.acknowledged_operation() {
        Some(name) if name == operation => trace!("{}: {} acknowledged", tag, operation),
        Some(name) => debug!("{}: acknowledgment for {} while {} was pending", tag, name, operation),
        None => debug!("{}: unexpected reply {} while {} was pending", tag, ack.operation, operation),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::CrossProcessEvent;
    use crate::host::{Host, HostBuilder, HostState};
    use crate::service::{DispatchTableBuilder, Service};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct Gate {
        event: CrossProcessEvent,
        noted: AtomicBool,
    }

    impl Service for Gate {
        fn register(self: Arc<Self>, ops: &mut DispatchTableBuilder) {
            let svc = self.clone();
            ops.operation("hold", move |_: ()| {
                let svc = svc.clone();
                async move {
                    let _ = svc.event.wait().await;
                }
            });
            let svc = self.clone();
            ops.operation("note", move |_: ()| {
                let svc = svc.clone();
                async move {
                    svc.noted.store(true, Ordering::SeqCst);
                }
            });
        }
    }

    fn unique_id() -> ConnectionId {
        ConnectionId::new(format!("FLExEndpoint/client-unit/{}", uuid::Uuid::new_v4()))
    }

    async fn pair() -> (Host<Gate>, Client) {
        let id = unique_id();
        let host = HostBuilder::new(id.clone()).serve::<Gate>().await.unwrap();
        let client = Client::builder(id).connect().await.unwrap();
        (host, client)
    }

    #[tokio::test]
    async fn test_connect_without_listener_is_peer_unavailable() {
        let result = tokio::time::timeout(Duration::from_secs(2), Client::builder(unique_id()).connect())
            .await
            .expect("connect must not hang");
        assert!(result.err().unwrap().is_peer_unavailable());
    }

    #[tokio::test]
    async fn test_call_sync_waits_for_acknowledgment() {
        let (host, client) = pair().await;
        client.call_sync("note", &[]).await.unwrap();
        assert!(host.service().noted.load(Ordering::SeqCst));
        assert_eq!(client.pending_call(), None);
        assert_eq!(client.state(), ClientState::Connected);
    }

    #[tokio::test]
    async fn test_overlapping_call_is_rejected() {
        let (host, client) = pair().await;
        let handle = client.wait_handle();
        let seen = handle.generation();

        client.call_async("hold", &[], None).await.unwrap();
        assert_eq!(client.pending_call().as_deref(), Some("hold"));

        let err = client.call_sync("note", &[]).await.unwrap_err();
        assert!(matches!(
            err,
            IpcError::CallInFlight { ref pending, ref requested } if pending == "hold" && requested == "note"
        ));
        assert!(err.is_usage_error());

        host.service().event.signal(true);
        tokio::time::timeout(Duration::from_secs(2), handle.wait_past(seen))
            .await
            .unwrap();
        assert_eq!(client.pending_call(), None);
        client.call_sync("note", &[]).await.unwrap();
    }

    #[tokio::test]
    async fn test_on_done_runs_before_pulse() {
        let (_host, client) = pair().await;
        let handle = client.wait_handle();
        let seen = handle.generation();
        let (tx, rx) = tokio::sync::oneshot::channel();

        let on_done: DoneHook = Box::new(move |result| {
            let _ = tx.send(result.is_ok());
        });
        client.call_async("note", &[], Some(on_done)).await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), handle.wait_past(seen))
            .await
            .unwrap();
        assert!(rx.await.unwrap());
    }

    #[tokio::test]
    async fn test_host_close_fails_pending_call_and_pulses() {
        let (mut host, client) = pair().await;
        let cleaned = Arc::new(AtomicBool::new(false));
        let flag = cleaned.clone();
        let cleanup: Hook = Box::new(move || flag.store(true, Ordering::SeqCst));
        *lock(&client.inner.cleanup) = Some(cleanup);
        let handle = client.wait_handle();
        let seen = handle.generation();
        let (tx, rx) = tokio::sync::oneshot::channel();

        let on_done: DoneHook = Box::new(move |result: Result<()>| {
            let _ = tx.send(result);
        });
        client.call_async("hold", &[], Some(on_done)).await.unwrap();
        host.wait_for_state(|s| s == HostState::Dispatching).await;
        host.close();

        tokio::time::timeout(Duration::from_secs(2), handle.wait_past(seen))
            .await
            .expect("failure must pulse the wait handle");
        assert!(rx.await.unwrap().unwrap_err().is_peer_unavailable());
        assert_eq!(client.state(), ClientState::Faulted);
        assert!(cleaned.load(Ordering::SeqCst));
        assert!(client.call_sync("note", &[]).await.unwrap_err().is_peer_unavailable());
    }

    #[tokio::test]
    async fn test_failed_async_call_pulses_before_cleanup() {
        let (mut host, client) = pair().await;
        let handle = client.wait_handle();
        let seen = handle.generation();
        let order = Arc::new(Mutex::new(Vec::new()));

        let (done_order, cleanup_order) = (order.clone(), order.clone());
        let cleanup_handle = handle.clone();
        let cleanup: Hook = Box::new(move || {
            let pulsed = cleanup_handle.generation() != seen;
            cleanup_order.lock().unwrap().push(if pulsed { "cleanup after pulse" } else { "cleanup" });
        });
        *lock(&client.inner.cleanup) = Some(cleanup);
        let on_done: DoneHook = Box::new(move |_: Result<()>| done_order.lock().unwrap().push("done"));

        client.call_async("hold", &[], Some(on_done)).await.unwrap();
        host.wait_for_state(|s| s == HostState::Dispatching).await;
        host.close();

        tokio::time::timeout(Duration::from_secs(2), handle.wait_past(seen))
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while order.lock().unwrap().len() < 2 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["done", "cleanup after pulse"]);
    }

    #[tokio::test]
    async fn test_unencodable_argument_leaves_client_usable() {
        let (host, client) = pair().await;
        let err = client.call_sync("note", &[Arg::from("two\nlines")]).await.unwrap_err();
        assert!(err.is_usage_error());
        assert_eq!(client.state(), ClientState::Connected);
        assert_eq!(client.pending_call(), None);

        client.call_sync("note", &[]).await.unwrap();
        assert!(host.service().noted.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_runs_cleanup_once() {
        let id = unique_id();
        let _host = HostBuilder::new(id.clone()).serve::<Gate>().await.unwrap();
        let runs = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = runs.clone();
        let client = Client::builder(id)
            .on_cleanup(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .connect()
            .await
            .unwrap();

        client.close();
        client.close();
        drop(client);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_call_after_close_is_closed_error() {
        let (_host, client) = pair().await;
        client.close();
        assert!(matches!(client.call_sync("note", &[]).await, Err(IpcError::Closed)));
    }
}
