//! Listening side of one directional channel.
//!
//! A [`Host`] binds the address derived from its connection id, accepts a
//! single connection, and runs the receive/dispatch/acknowledge loop against
//! its service's [`DispatchTable`]. A health monitor polls the same connection
//! alongside the loop.
//!
//! # States
//!
//! `Unbound -> Listening -> Accepted <-> Dispatching -> Finished`, with
//! `Faulted` reachable from any live state and `Closed` from every state.
//! `Faulted` and `Closed` are final.
//!
//! # Faults
//!
//! A transport error, a decode failure, or the peer hanging up before a
//! terminal operation ends the loop. The consumer's `on_alert` then
//! `on_cleanup` hooks run exactly once, whichever task noticed first.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::config::HostConfig;
use crate::endpoint::{ConnectionId, EndpointAddress};
use crate::error::{IpcError, Result};
use crate::protocol::{encode_ack, write_message, FrameReader};
use crate::service::{DispatchTable, Dispatched, Service};
use crate::transport::{self, BoxedAcceptor, BoxedConnection, ConnectionProbe, Transport};

type Hook = Box<dyn FnOnce() + Send>;

/// Host lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostState {
    Unbound,
    Listening,
    Accepted,
    Dispatching,
    /// A terminal operation was acknowledged; the connection stays open but
    /// is no longer read.
    Finished,
    Faulted,
    Closed,
}

impl HostState {
    /// No further transitions happen out of this state.
    pub fn is_final(self) -> bool {
        matches!(self, HostState::Faulted | HostState::Closed)
    }
}

/// Diagnostics published to [`Host::subscribe`]rs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    Accepted,
    Dispatched { operation: String, terminal: bool },
    /// No handler was invoked, but the peer still got its acknowledgment.
    UnknownOperation { operation: String },
    DecodeFailure { message: String },
    Faulted { message: String },
    Closed,
}

#[derive(Default)]
struct Hooks {
    alert: Option<Hook>,
    cleanup: Option<Hook>,
}

/// State shared by the host handle and its background tasks.
struct Shared {
    tag: String,
    state: watch::Sender<HostState>,
    events: broadcast::Sender<HostEvent>,
    hooks: Mutex<Hooks>,
    probe: Mutex<Option<Arc<dyn ConnectionProbe>>>,
}

impl Shared {
    fn state(&self) -> HostState {
        *self.state.borrow()
    }

    /// Move to `next` unless already in a final state.
    fn transition(&self, next: HostState) {
        self.state.send_if_modified(|state| {
            if state.is_final() || *state == next {
                return false;
            }
            trace!("{}: {:?} -> {:?}", self.tag, state, next);
            *state = next;
            true
        });
    }

    fn emit(&self, event: HostEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Record a fault and run the consumer hooks, once.
    fn fault(&self, message: String) {
        if self.state().is_final() {
            debug!("{}: ignoring fault after shutdown: {}", self.tag, message);
            return;
        }
        warn!("{}: connection faulted: {}", self.tag, message);
        self.transition(HostState::Faulted);
        self.emit(HostEvent::Faulted { message });

        let (alert, cleanup) = {
            let mut hooks = self.hooks.lock().unwrap_or_else(PoisonError::into_inner);
            (hooks.alert.take(), hooks.cleanup.take())
        };
        if let Some(alert) = alert {
            alert();
        }
        if let Some(cleanup) = cleanup {
            cleanup();
        }
    }

    fn set_probe(&self, probe: Option<Arc<dyn ConnectionProbe>>) {
        *self.probe.lock().unwrap_or_else(PoisonError::into_inner) = probe;
    }

    fn take_probe(&self) -> Option<Arc<dyn ConnectionProbe>> {
        self.probe.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

/// Configures and starts a [`Host`].
pub struct HostBuilder {
    id: ConnectionId,
    transport: Option<Arc<dyn Transport>>,
    health_interval: Duration,
    hooks: Hooks,
}

impl HostBuilder {
    pub fn new(id: impl Into<ConnectionId>) -> Self {
        Self {
            id: id.into(),
            transport: None,
            health_interval: HostConfig::HEALTH_POLL_INTERVAL,
            hooks: Hooks::default(),
        }
    }

    /// Use this backend instead of [`transport::default_transport`].
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// How often the health monitor polls the connection (default 10 s).
    pub fn health_interval(mut self, interval: Duration) -> Self {
        self.health_interval = interval;
        self
    }

    /// Runs first when the connection faults. Meant to wake consumer logic
    /// blocked on host activity.
    pub fn on_alert(mut self, alert: impl FnOnce() + Send + 'static) -> Self {
        self.hooks.alert = Some(Box::new(alert));
        self
    }

    /// Runs after `on_alert` when the connection faults. Meant to release
    /// consumer resources tied to this host.
    pub fn on_cleanup(mut self, cleanup: impl FnOnce() + Send + 'static) -> Self {
        self.hooks.cleanup = Some(Box::new(cleanup));
        self
    }

    /// Host a default-constructed service.
    pub async fn serve<S: Service + Default>(self) -> Result<Host<S>> {
        self.serve_with(Arc::new(S::default())).await
    }

    /// Bind and start accepting for `service`.
    ///
    /// Fails with [`IpcError::AddressInUse`] when another instance already
    /// hosts this id.
    pub async fn serve_with<S: Service>(self, service: Arc<S>) -> Result<Host<S>> {
        let transport = match self.transport {
            Some(transport) => transport,
            None => transport::default_transport()?,
        };
        let address = transport.derive_address(&self.id);
        let tag = self.id.tag();

        let (events, _) = broadcast::channel(HostConfig::EVENT_CHANNEL_CAPACITY);
        let (state, _) = watch::channel(HostState::Unbound);
        let shared = Arc::new(Shared {
            tag: tag.clone(),
            state,
            events,
            hooks: Mutex::new(self.hooks),
            probe: Mutex::new(None),
        });

        let acceptor = transport.bind(&address).await.map_err(|e| {
            debug!("{}: bind {} failed: {}", tag, address, e);
            e
        })?;
        let table = DispatchTable::for_service(service.clone());
        debug!(
            "{}: hosting {} operations on {} ({})",
            tag,
            table.len(),
            address,
            transport.kind()
        );
        shared.transition(HostState::Listening);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_connection(
            acceptor,
            table,
            shared.clone(),
            self.health_interval,
            shutdown_rx,
        ));

        Ok(Host {
            id: self.id,
            address,
            service,
            shared,
            shutdown_tx,
            task: Some(task),
        })
    }
}

/// A running host. Dropping it closes it.
pub struct Host<S: Service> {
    id: ConnectionId,
    address: EndpointAddress,
    service: Arc<S>,
    shared: Arc<Shared>,
    shutdown_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl<S: Service> Host<S> {
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn tag(&self) -> &str {
        &self.shared.tag
    }

    pub fn address(&self) -> &EndpointAddress {
        &self.address
    }

    /// The service instance the dispatch table calls into.
    pub fn service(&self) -> &Arc<S> {
        &self.service
    }

    pub fn state(&self) -> HostState {
        self.shared.state()
    }

    /// Wait until the state satisfies `pred`, returning that state.
    pub async fn wait_for_state(&self, mut pred: impl FnMut(HostState) -> bool) -> HostState {
        let mut rx = self.shared.state.subscribe();
        let reached = rx.wait_for(|state| pred(*state)).await.map(|state| *state);
        reached.unwrap_or_else(|_| *rx.borrow())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.shared.events.subscribe()
    }

    /// Stop listening and release the connection. Idempotent. Hooks do not
    /// run on a deliberate close.
    pub fn close(&mut self) {
        if self.shared.state() == HostState::Closed {
            return;
        }
        self.shared.state.send_replace(HostState::Closed);
        let _ = self.shutdown_tx.send(true);
        if let Some(probe) = self.shared.take_probe() {
            probe.shutdown();
        }
        self.shared.emit(HostEvent::Closed);
        debug!("{}: host closed", self.shared.tag);
    }

    /// [`close`](Self::close), then wait until the listener and connection
    /// are actually released.
    pub async fn shutdown(&mut self) {
        self.close();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                debug!("{}: connection task ended abnormally: {}", self.shared.tag, e);
            }
        }
    }
}

impl<S: Service> Drop for Host<S> {
    fn drop(&mut self) {
        self.close();
    }
}

async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    // A dropped sender counts as a shutdown request.
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Accept once, then drive the connection until it finishes or faults.
///
/// The acceptor stays bound until shutdown so a second host on the same id
/// keeps failing with `AddressInUse`.
async fn run_connection(
    mut acceptor: BoxedAcceptor,
    table: DispatchTable,
    shared: Arc<Shared>,
    health_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let accepted = tokio::select! {
        _ = shutdown_requested(&mut shutdown) => return,
        accepted = acceptor.accept() => accepted,
    };
    let conn = match accepted {
        Ok(conn) => conn,
        Err(e) => {
            shared.fault(format!("accept on {} failed: {}", acceptor.address(), e));
            shutdown_requested(&mut shutdown).await;
            return;
        }
    };
    let probe = conn.probe();
    shared.set_probe(probe.clone());
    if shared.state() == HostState::Closed {
        // Closed while accepting; the probe was installed too late to be torn
        // down by close.
        return;
    }
    debug!("{}: accepted connection on {}", shared.tag, acceptor.address());
    shared.transition(HostState::Accepted);
    shared.emit(HostEvent::Accepted);

    if let Some(probe) = probe {
        tokio::spawn(monitor(probe, shared.clone(), health_interval, shutdown.clone()));
    }

    let held = tokio::select! {
        _ = shutdown_requested(&mut shutdown) => return,
        held = receive_loop(conn, &table, &shared) => held,
    };
    shutdown_requested(&mut shutdown).await;
    drop(held);
    drop(acceptor);
}

/// Connection halves kept alive after a terminal operation.
type HeldConnection = (FrameReader<ReadHalf<BoxedConnection>>, WriteHalf<BoxedConnection>);

/// Read, dispatch, and acknowledge messages in arrival order.
///
/// Returns the connection after a terminal operation, `None` after a fault.
async fn receive_loop(conn: BoxedConnection, table: &DispatchTable, shared: &Shared) -> Option<HeldConnection> {
    let (reader, mut writer) = tokio::io::split(conn);
    let mut frames = FrameReader::new(reader);

    loop {
        let message = match frames.read_message().await {
            Ok(Some(message)) => message,
            Ok(None) => {
                shared.fault("peer closed the connection before a terminal operation".into());
                return None;
            }
            Err(IpcError::Decode { message }) => {
                shared.emit(HostEvent::DecodeFailure {
                    message: message.clone(),
                });
                shared.fault(message);
                return None;
            }
            Err(e) => {
                shared.fault(e.to_string());
                return None;
            }
        };

        shared.transition(HostState::Dispatching);
        trace!("{}: dispatching {} {:?}", shared.tag, message.operation, message.fields);
        let outcome = table.dispatch(&message).await;

        // The peer is acknowledged whatever the dispatch outcome.
        if let Err(e) = write_message(&mut writer, &encode_ack(&message.operation)).await {
            shared.fault(format!("failed to acknowledge {}: {}", message.operation, e));
            return None;
        }

        match outcome {
            Ok(Dispatched { terminal }) => {
                shared.emit(HostEvent::Dispatched {
                    operation: message.operation.clone(),
                    terminal,
                });
                if terminal {
                    debug!("{}: {} ended the session", shared.tag, message.operation);
                    shared.transition(HostState::Finished);
                    return Some((frames, writer));
                }
                shared.transition(HostState::Accepted);
            }
            Err(IpcError::UnknownOperation { operation }) => {
                warn!("{}: no handler for operation {}", shared.tag, operation);
                shared.emit(HostEvent::UnknownOperation { operation });
                shared.transition(HostState::Accepted);
            }
            Err(IpcError::Decode { message }) => {
                shared.emit(HostEvent::DecodeFailure {
                    message: message.clone(),
                });
                shared.fault(message);
                return None;
            }
            Err(e) => {
                shared.fault(e.to_string());
                return None;
            }
        }
    }
}

/// Poll the connection for a pending transport error.
async fn monitor(
    probe: Arc<dyn ConnectionProbe>,
    shared: Arc<Shared>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown_requested(&mut shutdown) => return,
            _ = ticker.tick() => {}
        }
        if shared.state().is_final() {
            return;
        }
        if let Err(e) = probe.check() {
            shared.fault(format!("health check failed: {}", e));
            return;
        }
        trace!("{}: health check ok", shared.tag);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{encode, Message};
    use crate::service::DispatchTableBuilder;
    use crate::transport::{Acceptor, Connection, TransportKind};
    use async_trait::async_trait;
    use std::io;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::task::{Context, Poll};
    use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
    use tokio::sync::mpsc;

    /// Health check that starts failing once armed.
    #[derive(Default)]
    struct ArmedProbe {
        armed: AtomicBool,
        checks: AtomicUsize,
    }

    impl ConnectionProbe for ArmedProbe {
        fn check(&self) -> io::Result<()> {
            self.checks.fetch_add(1, Ordering::SeqCst);
            if self.armed.load(Ordering::SeqCst) {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "link dropped"));
            }
            Ok(())
        }

        fn shutdown(&self) {}
    }

    struct MemoryConnection {
        stream: DuplexStream,
        probe: Option<Arc<ArmedProbe>>,
    }

    impl AsyncRead for MemoryConnection {
        fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.get_mut().stream).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for MemoryConnection {
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

    impl Connection for MemoryConnection {
        fn probe(&self) -> Option<Arc<dyn ConnectionProbe>> {
            self.probe.clone().map(|probe| probe as Arc<dyn ConnectionProbe>)
        }
    }

    /// In-process transport whose accepted connections share one probe.
    struct MemoryTransport {
        probe: Arc<ArmedProbe>,
        incoming: mpsc::UnboundedSender<BoxedConnection>,
        listener: Mutex<Option<mpsc::UnboundedReceiver<BoxedConnection>>>,
    }

    impl std::fmt::Debug for MemoryTransport {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("MemoryTransport")
        }
    }

    impl MemoryTransport {
        fn new() -> Self {
            let (incoming, listener) = mpsc::unbounded_channel();
            Self {
                probe: Arc::new(ArmedProbe::default()),
                incoming,
                listener: Mutex::new(Some(listener)),
            }
        }
    }

    struct MemoryAcceptor {
        address: EndpointAddress,
        incoming: mpsc::UnboundedReceiver<BoxedConnection>,
    }

    #[async_trait]
    impl Acceptor for MemoryAcceptor {
        async fn accept(&mut self) -> io::Result<BoxedConnection> {
            self.incoming
                .recv()
                .await
                .ok_or_else(|| io::Error::new(io::ErrorKind::ConnectionAborted, "transport dropped"))
        }

        fn address(&self) -> &EndpointAddress {
            &self.address
        }
    }

    #[async_trait]
    impl Transport for MemoryTransport {
        fn kind(&self) -> TransportKind {
            TransportKind::AbstractSocket
        }

        fn derive_address(&self, id: &ConnectionId) -> EndpointAddress {
            EndpointAddress::Abstract(id.as_str().to_string())
        }

        async fn bind(&self, address: &EndpointAddress) -> Result<BoxedAcceptor> {
            let incoming = self.listener.lock().unwrap().take().ok_or_else(|| IpcError::AddressInUse {
                address: address.to_string(),
            })?;
            Ok(Box::new(MemoryAcceptor {
                address: address.clone(),
                incoming,
            }))
        }

        async fn connect(&self, _address: &EndpointAddress) -> io::Result<BoxedConnection> {
            let (near, far) = tokio::io::duplex(4096);
            let server: BoxedConnection = Box::new(MemoryConnection {
                stream: far,
                probe: Some(self.probe.clone()),
            });
            self.incoming
                .send(server)
                .map_err(|_| io::Error::new(io::ErrorKind::ConnectionRefused, "not listening"))?;
            Ok(Box::new(MemoryConnection {
                stream: near,
                probe: None,
            }))
        }
    }

    #[derive(Default)]
    struct Flags {
        pinged: AtomicUsize,
        stopped: AtomicBool,
    }

    impl Service for Flags {
        fn register(self: Arc<Self>, ops: &mut DispatchTableBuilder) {
            let svc = self.clone();
            ops.operation("ping", move |_: ()| {
                let svc = svc.clone();
                async move {
                    svc.pinged.fetch_add(1, Ordering::SeqCst);
                }
            });
            let svc = self.clone();
            ops.terminal("stop", move |_: ()| {
                let svc = svc.clone();
                async move {
                    svc.stopped.store(true, Ordering::SeqCst);
                }
            });
        }
    }

    fn unique_id() -> ConnectionId {
        ConnectionId::new(format!("FLExEndpoint/host-unit/{}", uuid::Uuid::new_v4()))
    }

    async fn connect(host: &Host<Flags>, transport: &Arc<dyn Transport>) -> BoxedConnection {
        transport.connect(host.address()).await.unwrap()
    }

    async fn recv(frames: &mut FrameReader<ReadHalf<BoxedConnection>>) -> Message {
        tokio::time::timeout(Duration::from_secs(2), frames.read_message())
            .await
            .expect("acknowledgment should arrive")
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_terminal_operation_finishes_session() {
        let transport = transport::default_transport().unwrap();
        let host = HostBuilder::new(unique_id())
            .transport(transport.clone())
            .serve::<Flags>()
            .await
            .unwrap();
        assert_eq!(host.state(), HostState::Listening);

        let (reader, mut writer) = tokio::io::split(connect(&host, &transport).await);
        let mut frames = FrameReader::new(reader);

        write_message(&mut writer, &encode("ping", &[]).unwrap()).await.unwrap();
        assert_eq!(recv(&mut frames).await.acknowledged_operation(), Some("ping"));

        write_message(&mut writer, &encode("stop", &[]).unwrap()).await.unwrap();
        assert_eq!(recv(&mut frames).await.acknowledged_operation(), Some("stop"));

        let state = host.wait_for_state(|s| s == HostState::Finished).await;
        assert_eq!(state, HostState::Finished);
        assert_eq!(host.service().pinged.load(Ordering::SeqCst), 1);
        assert!(host.service().stopped.load(Ordering::SeqCst));

        // Nothing reads after a terminal operation.
        write_message(&mut writer, &encode("ping", &[]).unwrap()).await.unwrap();
        let late = tokio::time::timeout(Duration::from_millis(100), frames.read_message()).await;
        assert!(late.is_err());
        assert_eq!(host.service().pinged.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_coalesced_messages_dispatch_in_order() {
        let transport = transport::default_transport().unwrap();
        let host = HostBuilder::new(unique_id())
            .transport(transport.clone())
            .serve::<Flags>()
            .await
            .unwrap();
        let mut events = host.subscribe();

        let (reader, mut writer) = tokio::io::split(connect(&host, &transport).await);
        let mut frames = FrameReader::new(reader);

        let mut burst = encode("ping", &[]).unwrap();
        burst.extend(encode("ping", &[]).unwrap());
        burst.extend(encode("stop", &[]).unwrap());
        writer.write_all(&burst).await.unwrap();

        for expected in ["ping", "ping", "stop"] {
            assert_eq!(recv(&mut frames).await.acknowledged_operation(), Some(expected));
        }
        assert_eq!(events.recv().await.unwrap(), HostEvent::Accepted);
        for (operation, terminal) in [("ping", false), ("ping", false), ("stop", true)] {
            assert_eq!(
                events.recv().await.unwrap(),
                HostEvent::Dispatched {
                    operation: operation.into(),
                    terminal
                }
            );
        }
    }

    #[tokio::test]
    async fn test_peer_hangup_fires_hooks_once() {
        let transport = transport::default_transport().unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        let (alert_order, cleanup_order) = (order.clone(), order.clone());
        let host = HostBuilder::new(unique_id())
            .transport(transport.clone())
            .on_alert(move || alert_order.lock().unwrap().push("alert"))
            .on_cleanup(move || cleanup_order.lock().unwrap().push("cleanup"))
            .serve::<Flags>()
            .await
            .unwrap();

        let conn = connect(&host, &transport).await;
        host.wait_for_state(|s| s == HostState::Accepted).await;
        drop(conn);

        let state = tokio::time::timeout(Duration::from_secs(2), host.wait_for_state(HostState::is_final))
            .await
            .unwrap();
        assert_eq!(state, HostState::Faulted);
        assert_eq!(*order.lock().unwrap(), vec!["alert", "cleanup"]);
    }

    #[tokio::test]
    async fn test_failed_health_check_faults_once() {
        let memory = Arc::new(MemoryTransport::new());
        let probe = memory.probe.clone();
        let transport: Arc<dyn Transport> = memory;
        let order = Arc::new(Mutex::new(Vec::new()));
        let (alert_order, cleanup_order) = (order.clone(), order.clone());
        let host = HostBuilder::new(unique_id())
            .transport(transport.clone())
            .health_interval(Duration::from_millis(10))
            .on_alert(move || alert_order.lock().unwrap().push("alert"))
            .on_cleanup(move || cleanup_order.lock().unwrap().push("cleanup"))
            .serve::<Flags>()
            .await
            .unwrap();
        let mut events = host.subscribe();

        let conn = connect(&host, &transport).await;
        host.wait_for_state(|s| s == HostState::Accepted).await;

        // Healthy polls leave the session alone.
        tokio::time::timeout(Duration::from_secs(2), async {
            while probe.checks.load(Ordering::SeqCst) < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(host.state(), HostState::Accepted);
        assert!(order.lock().unwrap().is_empty());

        probe.armed.store(true, Ordering::SeqCst);
        let state = tokio::time::timeout(Duration::from_secs(2), host.wait_for_state(HostState::is_final))
            .await
            .unwrap();
        assert_eq!(state, HostState::Faulted);
        assert_eq!(*order.lock().unwrap(), vec!["alert", "cleanup"]);

        // The receive loop failing afterwards does not fire the hooks again.
        drop(conn);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*order.lock().unwrap(), vec!["alert", "cleanup"]);
        assert_eq!(host.state(), HostState::Faulted);

        assert_eq!(events.recv().await.unwrap(), HostEvent::Accepted);
        match events.recv().await.unwrap() {
            HostEvent::Faulted { message } => assert!(message.contains("health check"), "{}", message),
            other => panic!("expected a fault, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_skips_hooks() {
        let transport = transport::default_transport().unwrap();
        let alerted = Arc::new(AtomicBool::new(false));
        let flag = alerted.clone();
        let mut host = HostBuilder::new(unique_id())
            .transport(transport.clone())
            .on_alert(move || flag.store(true, Ordering::SeqCst))
            .serve::<Flags>()
            .await
            .unwrap();

        let conn = connect(&host, &transport).await;
        host.wait_for_state(|s| s == HostState::Accepted).await;

        host.close();
        host.close();
        host.shutdown().await;
        assert_eq!(host.state(), HostState::Closed);
        assert!(!alerted.load(Ordering::SeqCst));

        let (reader, _writer) = tokio::io::split(conn);
        let mut frames = FrameReader::new(reader);
        let eof = tokio::time::timeout(Duration::from_secs(2), frames.read_message())
            .await
            .unwrap();
        assert!(matches!(eof, Ok(None)));
    }

    #[tokio::test]
    async fn test_rebind_after_shutdown() {
        let transport = transport::default_transport().unwrap();
        let id = unique_id();
        let mut first = HostBuilder::new(id.clone())
            .transport(transport.clone())
            .serve::<Flags>()
            .await
            .unwrap();

        let err = HostBuilder::new(id.clone())
            .transport(transport.clone())
            .serve::<Flags>()
            .await
            .err()
            .unwrap();
        assert!(err.is_already_running());

        first.shutdown().await;
        let second = HostBuilder::new(id).transport(transport).serve::<Flags>().await;
        assert!(second.is_ok());
    }
}
