//! [`Connection`] – one robot session and its dedicated execution context.
//!
//! # Lifecycle
//!
//! ```text
//! Disconnected ──connect──▶ Connecting ──▶ Connected ──close──▶ Disconnecting
//!                               │                                    │
//!                               └──error──▶ Failed                   ▼
//!                                                              Disconnected
//! ```
//!
//! [`Connection::connect`] spawns exactly one thread running a
//! single-threaded tokio runtime. On that thread the session opens the
//! channel, performs the version handshake, starts the [`ControlChannel`],
//! sends the client identity, and acquires the default control priority if
//! one was configured. The calling thread blocks until that sequence reports
//! readiness and re-raises any error it produced.
//!
//! All network I/O and every submitted command run as tasks on that one
//! runtime. Callers on other threads only schedule work onto it.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, mpsc};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tokio::sync::{oneshot, watch};
use tokio::task::AbortHandle;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;
use vector_types::{
    CancelReason, ClientInfo, ConnectionState, ControlPriorityLevel, Endpoint, VectorError,
};

use crate::channel::ControlChannel;
use crate::config::ConnectionConfig;
use crate::dispatcher::{
    Command, CommandContext, CommandDispatcher, CommandRegistry, PendingOperation,
};
use crate::grpc::GrpcConnector;
use crate::lease::ControlLeaseState;
use crate::link::{Connector, RobotLink};
use crate::proto::{FIRST_SDK_TAG, LAST_SDK_TAG, PROTOCOL_VERSION_CURRENT, PROTOCOL_VERSION_MINIMUM};
use crate::signal::SignalListener;

/// Behaviour of a [`Connection`] that is fixed at construction.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Control level acquired during `connect`. [`ControlPriorityLevel::None`]
    /// connects without requesting control.
    pub default_priority: ControlPriorityLevel,
    /// How long a command that needs control waits for a grant before it
    /// proceeds anyway.
    pub control_wait: Duration,
    /// Upper bound on joining the session thread in [`Connection::close`].
    pub close_join_timeout: Duration,
    /// Identity sent to the robot once per session.
    pub client_info: ClientInfo,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            default_priority: ControlPriorityLevel::None,
            control_wait: Duration::from_secs(10),
            close_join_timeout: Duration::from_secs(5),
            client_info: ClientInfo::current(),
        }
    }
}

/// What the session thread hands back once it is ready.
struct Established<L> {
    dispatcher: CommandDispatcher<L>,
    control_task: AbortHandle,
}

struct Worker<L> {
    thread: JoinHandle<()>,
    done: Option<oneshot::Sender<()>>,
    dispatcher: CommandDispatcher<L>,
    control_task: AbortHandle,
}

/// A session with one robot.
pub struct Connection<C: Connector> {
    endpoint: Endpoint,
    connector: Arc<C>,
    options: ConnectionOptions,
    control_level: Mutex<ControlPriorityLevel>,
    lease: Mutex<Arc<ControlLeaseState>>,
    registry: Arc<CommandRegistry>,
    state: watch::Sender<ConnectionState>,
    worker: Mutex<Option<Worker<C::Link>>>,
    next_action_tag: AtomicU32,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Connection<GrpcConnector> {
    /// A connection that reaches the robot over gRPC.
    pub fn grpc(endpoint: Endpoint, options: ConnectionOptions) -> Self {
        Self::new(endpoint, GrpcConnector, options)
    }

    /// Build a gRPC connection from a loaded configuration file.
    pub fn from_config(config: &ConnectionConfig) -> Result<Self, VectorError> {
        Ok(Self::grpc(config.endpoint()?, config.options()))
    }
}

impl<C: Connector> Connection<C> {
    pub fn new(endpoint: Endpoint, connector: C, options: ConnectionOptions) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            control_level: Mutex::new(options.default_priority),
            lease: Mutex::new(Arc::new(ControlLeaseState::new(options.default_priority))),
            registry: Arc::new(CommandRegistry::new()),
            state,
            worker: Mutex::new(None),
            next_action_tag: AtomicU32::new(FIRST_SDK_TAG),
            endpoint,
            connector: Arc::new(connector),
            options,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receive every lifecycle transition of this connection.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!(
                host = %self.endpoint.authority(),
                from = ?previous,
                to = ?next,
                "connection state"
            );
        }
    }

    /// The lease of the current (or most recent) session.
    pub fn lease(&self) -> Arc<ControlLeaseState> {
        Arc::clone(&lock(&self.lease))
    }

    /// Fires when the robot grants behaviour control.
    pub fn control_granted(&self) -> SignalListener {
        self.lease().granted_listener()
    }

    /// Fires when behaviour control is not held, including after a takeover
    /// by the robot's own behaviour system.
    pub fn control_lost(&self) -> SignalListener {
        self.lease().lost_listener()
    }

    /// Whether commands that need control should wait for it rather than be
    /// rejected.
    pub fn requires_behavior_control(&self) -> bool {
        !lock(&self.control_level).is_none()
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.worker).is_some()
    }

    /// True when the caller runs on this connection's own thread.
    pub fn is_session_thread(&self) -> bool {
        lock(&self.worker)
            .as_ref()
            .is_some_and(|worker| worker.dispatcher.is_session_thread())
    }

    pub fn active_command_count(&self) -> usize {
        self.registry.len()
    }

    /// Next id tag for a cancellable action, wrapping within the client tag
    /// range.
    pub fn next_action_tag(&self) -> u32 {
        self.next_action_tag
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |tag| {
                Some(if tag >= LAST_SDK_TAG { FIRST_SDK_TAG } else { tag + 1 })
            })
            .unwrap_or_else(|tag| tag)
    }

    fn dispatcher(&self) -> Result<CommandDispatcher<C::Link>, VectorError> {
        lock(&self.worker)
            .as_ref()
            .map(|worker| worker.dispatcher.clone())
            .ok_or(VectorError::NotConnected)
    }

    /// Open the session and block until it is ready.
    ///
    /// `timeout` bounds channel readiness, each handshake step, and the
    /// initial control request.
    ///
    /// # Errors
    ///
    /// * [`VectorError::AlreadyConnected`] when a session thread exists.
    /// * [`VectorError::Configuration`] when no certificate was provided.
    /// * [`VectorError::NotFound`] when the robot cannot be reached or does
    ///   not answer the handshake in time.
    /// * [`VectorError::IncompatibleVersion`] when the robot is too old.
    /// * [`VectorError::ControlTimeout`] when the default control level is
    ///   not granted in time.
    pub fn connect(&self, timeout: Duration) -> Result<(), VectorError> {
        let mut worker = lock(&self.worker);
        if worker.is_some() {
            return Err(VectorError::AlreadyConnected);
        }

        let level = *lock(&self.control_level);
        let lease = Arc::new(ControlLeaseState::new(level));
        *lock(&self.lease) = Arc::clone(&lease);
        self.set_state(ConnectionState::Connecting);

        let session_id = Uuid::new_v4();
        let span = info_span!("session", session = %session_id, host = %self.endpoint.authority());
        let setup = Setup {
            connector: Arc::clone(&self.connector),
            endpoint: self.endpoint.clone(),
            lease,
            registry: Arc::clone(&self.registry),
            level,
            control_wait: self.options.control_wait,
            client_info: self.options.client_info.clone(),
            timeout,
        };

        let (ready_tx, ready_rx) = mpsc::sync_channel(1);
        let (done_tx, done_rx) = oneshot::channel::<()>();
        let spawned = thread::Builder::new()
            .name(format!("vector-{}", self.endpoint.name))
            .spawn(move || {
                let built = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build();
                let runtime = match built {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = ready_tx.send(Err(VectorError::Runtime(format!(
                            "failed to build session runtime: {e}"
                        ))));
                        return;
                    }
                };
                runtime.block_on(
                    async move {
                        match establish(setup).await {
                            Ok(established) => {
                                if ready_tx.send(Ok(established)).is_ok() {
                                    let _ = done_rx.await;
                                }
                            }
                            Err(e) => {
                                let _ = ready_tx.send(Err(e));
                            }
                        }
                        debug!("session runtime stopping");
                    }
                    .instrument(span),
                );
            });

        let thread = match spawned {
            Ok(thread) => thread,
            Err(e) => {
                self.set_state(ConnectionState::Failed);
                return Err(VectorError::Runtime(format!("failed to spawn session thread: {e}")));
            }
        };

        let established = ready_rx.recv().unwrap_or_else(|_| {
            Err(VectorError::Runtime(
                "session thread exited before reporting readiness".to_string(),
            ))
        });

        match established {
            Ok(Established {
                dispatcher,
                control_task,
            }) => {
                *worker = Some(Worker {
                    thread,
                    done: Some(done_tx),
                    dispatcher,
                    control_task,
                });
                drop(worker);
                self.set_state(ConnectionState::Connected);
                Ok(())
            }
            Err(e) => {
                drop(worker);
                if thread.join().is_err() {
                    warn!(
                        host = %self.endpoint.authority(),
                        "session thread panicked during connect"
                    );
                }
                warn!(host = %self.endpoint.authority(), error = %e, "connect failed");
                self.set_state(ConnectionState::Failed);
                Err(e)
            }
        }
    }

    /// Request behaviour control and block until it is granted.
    ///
    /// Overlapping requests are last-write-wins: only the latest priority is
    /// sent once the control channel wakes.
    ///
    /// # Errors
    ///
    /// * [`VectorError::InvalidUsage`] on the connection's own thread; use
    ///   [`request_control_soon`][Self::request_control_soon] there.
    /// * [`VectorError::ControlTimeout`] when no grant arrives within `timeout`.
    pub fn request_control(
        &self,
        level: ControlPriorityLevel,
        timeout: Duration,
    ) -> Result<(), VectorError> {
        if self.is_session_thread() {
            return Err(VectorError::InvalidUsage(
                "request_control blocks; await request_control_soon on the connection thread"
                    .to_string(),
            ));
        }
        self.request_control_soon(level, timeout)?.wait()
    }

    /// Request behaviour control without blocking.
    pub fn request_control_soon(
        &self,
        level: ControlPriorityLevel,
        timeout: Duration,
    ) -> Result<PendingOperation<()>, VectorError> {
        if level.is_none() {
            return Err(VectorError::InvalidArgument(
                "must provide a priority level to request; \
                 to disable control, use release_control()"
                    .to_string(),
            ));
        }
        let dispatcher = self.dispatcher()?;
        *lock(&self.control_level) = level;
        let lease = Arc::clone(dispatcher.lease());
        Ok(dispatcher.run_soon("request_control", async move {
            lease.request(level)?;
            await_granted(&lease, timeout).await
        }))
    }

    /// Hand control back to the robot and block until it is released.
    ///
    /// # Errors
    ///
    /// As for [`request_control`][Self::request_control].
    pub fn release_control(&self, timeout: Duration) -> Result<(), VectorError> {
        if self.is_session_thread() {
            return Err(VectorError::InvalidUsage(
                "release_control blocks; await release_control_soon on the connection thread"
                    .to_string(),
            ));
        }
        self.release_control_soon(timeout)?.wait()
    }

    /// Release control without blocking.
    pub fn release_control_soon(
        &self,
        timeout: Duration,
    ) -> Result<PendingOperation<()>, VectorError> {
        let dispatcher = self.dispatcher()?;
        *lock(&self.control_level) = ControlPriorityLevel::None;
        let lease = Arc::clone(dispatcher.lease());
        Ok(dispatcher.run_soon("release_control", async move {
            lease.release();
            tokio::time::timeout(timeout, lease.lost().wait())
                .await
                .map_err(|_| VectorError::ControlTimeout { timeout })
        }))
    }

    /// Run `call` on the connection thread as a registered command.
    ///
    /// A lease loss cancels the command only when it needs behaviour control;
    /// [`close`][Self::close] cancels it either way.
    ///
    /// # Errors
    ///
    /// [`VectorError::NotConnected`] before `connect`, and
    /// [`VectorError::NotInControl`] as described on
    /// [`CommandDispatcher::submit`].
    pub fn submit<T, F, Fut>(
        &self,
        command: Command,
        call: F,
    ) -> Result<PendingOperation<T>, VectorError>
    where
        T: Send + 'static,
        F: FnOnce(CommandContext<C::Link>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<T, VectorError>> + Send + 'static,
    {
        self.dispatcher()?
            .submit(command, self.requires_behavior_control(), call)
    }

    /// Tear the session down. Never fails and may be called any number of
    /// times, from any thread.
    pub fn close(&self) {
        let Some(mut worker) = lock(&self.worker).take() else {
            return;
        };
        self.set_state(ConnectionState::Disconnecting);

        worker.dispatcher.lease().shutdown();
        worker.control_task.abort();
        let cancelled = self.registry.cancel_all(CancelReason::SessionClosed);
        if cancelled > 0 {
            info!(
                host = %self.endpoint.authority(),
                cancelled,
                "cancelled active commands on close"
            );
        }

        let link = Arc::clone(worker.dispatcher.link());
        let done = worker.done.take();
        worker.dispatcher.runtime().spawn(async move {
            link.close().await;
            if let Some(done) = done {
                let _ = done.send(());
            }
        });

        if worker.dispatcher.is_session_thread() {
            debug!("close called on the session thread, not joining it");
        } else {
            let deadline = Instant::now() + self.options.close_join_timeout;
            while !worker.thread.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(5));
            }
            if !worker.thread.is_finished() {
                warn!(
                    host = %self.endpoint.authority(),
                    timeout = ?self.options.close_join_timeout,
                    "session thread did not stop in time"
                );
            } else if worker.thread.join().is_err() {
                warn!(host = %self.endpoint.authority(), "session thread panicked");
            }
        }

        self.set_state(ConnectionState::Disconnected);
    }
}

impl<C: Connector> Drop for Connection<C> {
    fn drop(&mut self) {
        self.close();
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Session thread
// ────────────────────────────────────────────────────────────────────────────

struct Setup<C> {
    connector: Arc<C>,
    endpoint: Endpoint,
    lease: Arc<ControlLeaseState>,
    registry: Arc<CommandRegistry>,
    level: ControlPriorityLevel,
    control_wait: Duration,
    client_info: ClientInfo,
    timeout: Duration,
}

async fn establish<C: Connector>(setup: Setup<C>) -> Result<Established<C::Link>, VectorError> {
    let Setup {
        connector,
        endpoint,
        lease,
        registry,
        level,
        control_wait,
        client_info,
        timeout,
    } = setup;
    let authority = endpoint.authority();

    if endpoint.certificate.is_none() {
        return Err(VectorError::Configuration(
            "Must provide a cert file to authenticate to the robot".to_string(),
        ));
    }

    let link = tokio::time::timeout(timeout, connector.open(&endpoint, timeout))
        .await
        .map_err(|_| VectorError::NotFound(authority.clone()))??;
    let link = Arc::new(link);
    debug!("channel ready");

    let version = match handshake(&*link, &authority, timeout).await {
        Ok(version) => version,
        Err(e) => {
            link.close().await;
            return Err(e);
        }
    };
    debug!(host_version = version, "protocol version accepted");

    let dispatcher = CommandDispatcher::on_current_thread(
        Arc::clone(&link),
        Arc::clone(&lease),
        Arc::clone(&registry),
        control_wait,
    );
    let channel = ControlChannel::new(Arc::clone(&lease), registry, Arc::clone(&link));
    let control_task = tokio::spawn(channel.run()).abort_handle();

    let ready = async {
        tokio::time::timeout(timeout, link.initialize_session(&client_info))
            .await
            .map_err(|_| VectorError::NotFound(authority.clone()))??;
        debug!("session initialized");
        if !level.is_none() {
            lease.request(level)?;
            await_granted(&lease, timeout).await?;
        }
        Ok::<_, VectorError>(())
    }
    .await;

    if let Err(e) = ready {
        lease.shutdown();
        control_task.abort();
        link.close().await;
        return Err(e);
    }

    info!(name = %endpoint.name, control = %level, "connected to robot");
    Ok(Established {
        dispatcher,
        control_task,
    })
}

async fn handshake<L: RobotLink>(
    link: &L,
    authority: &str,
    timeout: Duration,
) -> Result<i64, VectorError> {
    let version = tokio::time::timeout(
        timeout,
        link.protocol_version(PROTOCOL_VERSION_CURRENT, PROTOCOL_VERSION_MINIMUM),
    )
    .await
    .map_err(|_| VectorError::NotFound(authority.to_string()))??;

    if !version.supported || version.host_version < PROTOCOL_VERSION_MINIMUM {
        return Err(VectorError::IncompatibleVersion {
            host_version: version.host_version,
            min_host_version: PROTOCOL_VERSION_MINIMUM,
        });
    }
    Ok(version.host_version)
}

async fn await_granted(lease: &ControlLeaseState, timeout: Duration) -> Result<(), VectorError> {
    tokio::time::timeout(timeout, lease.granted().wait())
        .await
        .map_err(|_| VectorError::ControlTimeout { timeout })?;
    if lease.is_shutdown() {
        return Err(VectorError::Cancelled(CancelReason::SessionClosed));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MockConnector, MockPeer, Sent};
    use vector_types::{CancelPolicy, ControlMessage};

    const CONNECT: Duration = Duration::from_secs(2);

    fn endpoint() -> Endpoint {
        Endpoint::new("Vector-T3S7", "127.0.0.1", 443, Some(b"robot cert".to_vec()), "guid")
    }

    fn connection(
        peer: &Arc<MockPeer>,
        priority: ControlPriorityLevel,
    ) -> Connection<MockConnector> {
        Connection::new(
            endpoint(),
            peer.connector(),
            ConnectionOptions {
                default_priority: priority,
                control_wait: Duration::from_millis(100),
                close_join_timeout: Duration::from_secs(1),
                ..ConnectionOptions::default()
            },
        )
    }

    fn forever() -> impl std::future::Future<Output = Result<(), VectorError>> {
        futures::future::pending()
    }

    #[test]
    fn default_priority_is_granted_before_connect_returns() {
        let peer = MockPeer::new();
        let conn = connection(&peer, ControlPriorityLevel::Default);
        conn.connect(CONNECT).unwrap();

        assert!(conn.control_granted().is_set());
        assert!(!conn.control_lost().is_set());
        assert!(conn.lease().is_held());
        assert_eq!(
            peer.control_messages(),
            vec![ControlMessage::Request(ControlPriorityLevel::Default)]
        );
        assert_eq!(conn.state(), ConnectionState::Connected);
        conn.close();
    }

    #[test]
    fn connect_without_priority_sends_no_request() {
        let peer = MockPeer::new();
        let conn = connection(&peer, ControlPriorityLevel::None);
        conn.connect(CONNECT).unwrap();
        assert!(!conn.lease().is_held());
        assert!(!conn.requires_behavior_control());
        assert!(peer.control_messages().is_empty());
    }

    #[test]
    fn session_identity_is_sent_once() {
        let peer = MockPeer::new();
        let conn = connection(&peer, ControlPriorityLevel::None);
        conn.connect(CONNECT).unwrap();
        assert_eq!(peer.initialized_with(), Some(conn.options().client_info.clone()));
    }

    #[test]
    fn second_connect_is_rejected() {
        let peer = MockPeer::new();
        let conn = connection(&peer, ControlPriorityLevel::None);
        conn.connect(CONNECT).unwrap();
        assert_eq!(conn.connect(CONNECT), Err(VectorError::AlreadyConnected));
        assert_eq!(conn.state(), ConnectionState::Connected);
    }

    #[test]
    fn unreachable_robot_is_not_found() {
        let peer = MockPeer::new();
        peer.set_unreachable();
        let conn = connection(&peer, ControlPriorityLevel::Default);
        assert!(matches!(
            conn.connect(CONNECT),
            Err(VectorError::NotFound(host)) if host == "127.0.0.1:443"
        ));
        assert_eq!(conn.state(), ConnectionState::Failed);
        assert!(!conn.is_connected());
    }

    #[test]
    fn old_robot_is_incompatible() {
        let peer = MockPeer::new();
        peer.set_host_version(false, 0);
        let conn = connection(&peer, ControlPriorityLevel::None);
        assert!(matches!(
            conn.connect(CONNECT),
            Err(VectorError::IncompatibleVersion { .. })
        ));
        assert!(peer.is_closed());

        peer.set_host_version(true, -1);
        assert!(matches!(
            conn.connect(CONNECT),
            Err(VectorError::IncompatibleVersion { host_version: -1, .. })
        ));
    }

    #[test]
    fn hanging_handshake_is_bounded_by_timeout() {
        let peer = MockPeer::new();
        peer.set_hang_handshake();
        let conn = connection(&peer, ControlPriorityLevel::None);
        let started = Instant::now();
        assert!(matches!(
            conn.connect(Duration::from_millis(50)),
            Err(VectorError::NotFound(_))
        ));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn missing_certificate_is_a_configuration_error() {
        let peer = MockPeer::new();
        let mut endpoint = endpoint();
        endpoint.certificate = None;
        let conn = Connection::new(endpoint, peer.connector(), ConnectionOptions::default());
        assert!(matches!(conn.connect(CONNECT), Err(VectorError::Configuration(_))));
    }

    #[test]
    fn control_times_out_against_silent_peer() {
        let peer = MockPeer::silent();
        let conn = connection(&peer, ControlPriorityLevel::None);
        conn.connect(CONNECT).unwrap();

        let timeout = Duration::from_millis(50);
        let started = Instant::now();
        assert_eq!(
            conn.request_control(ControlPriorityLevel::OverrideBehaviors, timeout),
            Err(VectorError::ControlTimeout { timeout })
        );
        let elapsed = started.elapsed();
        assert!(elapsed >= timeout, "gave up after {elapsed:?}");
        assert!(elapsed < Duration::from_secs(1), "gave up after {elapsed:?}");
        assert!(!conn.lease().is_held());

        let expected = vec![ControlMessage::Request(ControlPriorityLevel::OverrideBehaviors)];
        assert!(peer.eventually(Duration::from_secs(1), |p| p.control_messages() == expected));
    }

    #[test]
    fn release_times_out_against_silent_peer() {
        let peer = MockPeer::silent();
        let conn = connection(&peer, ControlPriorityLevel::None);
        conn.connect(CONNECT).unwrap();
        conn.lease().update(true);

        let timeout = Duration::from_millis(30);
        let started = Instant::now();
        assert_eq!(
            conn.release_control(timeout),
            Err(VectorError::ControlTimeout { timeout })
        );
        assert!(started.elapsed() >= timeout);
        assert!(conn.lease().is_held());
        assert!(peer.eventually(Duration::from_secs(1), |p| {
            p.control_messages() == vec![ControlMessage::Release]
        }));
    }

    #[test]
    fn default_priority_not_granted_fails_connect() {
        let peer = MockPeer::silent();
        let conn = connection(&peer, ControlPriorityLevel::Default);
        let timeout = Duration::from_millis(30);
        assert_eq!(conn.connect(timeout), Err(VectorError::ControlTimeout { timeout }));
        assert!(peer.is_closed());
        assert!(conn.lease().is_shutdown());
    }

    #[test]
    fn request_then_release_control() {
        let peer = MockPeer::new();
        let conn = connection(&peer, ControlPriorityLevel::None);
        conn.connect(CONNECT).unwrap();

        conn.request_control(ControlPriorityLevel::ReserveControl, CONNECT).unwrap();
        assert!(conn.lease().is_held());
        assert!(conn.requires_behavior_control());

        conn.release_control(CONNECT).unwrap();
        assert!(!conn.lease().is_held());
        assert!(!conn.requires_behavior_control());
        assert_eq!(
            peer.control_messages(),
            vec![
                ControlMessage::Request(ControlPriorityLevel::ReserveControl),
                ControlMessage::Release
            ]
        );
    }

    #[test]
    fn request_control_rejects_none_and_needs_connection() {
        let peer = MockPeer::new();
        let conn = connection(&peer, ControlPriorityLevel::None);
        assert!(matches!(
            conn.request_control(ControlPriorityLevel::Default, CONNECT),
            Err(VectorError::NotConnected)
        ));
        conn.connect(CONNECT).unwrap();
        assert!(matches!(
            conn.request_control(ControlPriorityLevel::None, CONNECT),
            Err(VectorError::InvalidArgument(_))
        ));
    }

    #[test]
    fn blocking_control_on_session_thread_is_invalid_usage() {
        let peer = MockPeer::new();
        let conn = Arc::new(connection(&peer, ControlPriorityLevel::None));
        conn.connect(CONNECT).unwrap();

        let inner = Arc::clone(&conn);
        let outcome = conn
            .submit(Command::new("nested_control").without_control(), move |_| async move {
                let level = ControlPriorityLevel::Default;
                let blocking = inner.request_control(level, CONNECT);
                let awaited = match inner.request_control_soon(level, CONNECT) {
                    Ok(op) => op.await,
                    Err(e) => Err(e),
                };
                Ok::<_, VectorError>((blocking, awaited))
            })
            .unwrap()
            .wait()
            .unwrap();

        assert!(matches!(outcome.0, Err(VectorError::InvalidUsage(_))));
        assert_eq!(outcome.1, Ok(()));
        conn.close();
    }

    #[test]
    fn lease_loss_cancels_every_active_command_without_aborts() {
        let peer = MockPeer::new();
        let conn = connection(&peer, ControlPriorityLevel::Default);
        conn.connect(CONNECT).unwrap();

        let pending: Vec<_> = (0..3)
            .map(|_| {
                let tag = conn.next_action_tag();
                conn.submit(
                    Command::new("drive_straight").cancellable(CancelPolicy::Action(tag)),
                    |_| forever(),
                )
                .unwrap()
            })
            .collect();
        assert_eq!(conn.active_command_count(), 3);

        assert!(peer.inject(vector_types::ControlEvent::Lost));
        for op in pending {
            assert_eq!(op.wait(), Err(VectorError::Cancelled(CancelReason::ControlLost)));
        }
        assert_eq!(conn.active_command_count(), 0);
        assert!(!conn.lease().is_held());
        assert!(conn.control_lost().is_set());
        assert!(peer.aborts().is_empty());
    }

    #[test]
    fn cancelling_one_of_two_tagged_actions_sends_one_abort() {
        let peer = MockPeer::new();
        let conn = connection(&peer, ControlPriorityLevel::Default);
        conn.connect(CONNECT).unwrap();

        let tag = conn.next_action_tag();
        let command = Command::new("turn_in_place").cancellable(CancelPolicy::Action(tag));
        let first = conn.submit(command, |_| forever()).unwrap();
        let second = conn.submit(command, |_| async { Ok(()) }).unwrap();

        assert!(first.cancel());
        assert_eq!(first.wait(), Err(VectorError::Cancelled(CancelReason::Caller)));
        assert_eq!(second.wait(), Ok(()));
        assert_eq!(peer.aborts(), vec![Sent::CancelAction(tag)]);
        assert_eq!(conn.active_command_count(), 0);
    }

    #[test]
    fn control_command_without_lease_is_rejected() {
        let peer = MockPeer::new();
        let conn = connection(&peer, ControlPriorityLevel::None);
        conn.connect(CONNECT).unwrap();
        let result = conn.submit(Command::new("set_lift_height"), |_| async { Ok(()) });
        assert!(matches!(result, Err(VectorError::NotInControl { .. })));
        assert!(matches!(
            Connection::new(endpoint(), peer.connector(), ConnectionOptions::default())
                .submit(Command::new("battery_state").without_control(), |_| async { Ok(()) }),
            Err(VectorError::NotConnected)
        ));
    }

    #[test]
    fn action_tags_wrap_within_client_range() {
        let peer = MockPeer::new();
        let conn = connection(&peer, ControlPriorityLevel::None);
        assert_eq!(conn.next_action_tag(), FIRST_SDK_TAG);
        assert_eq!(conn.next_action_tag(), FIRST_SDK_TAG + 1);
        conn.next_action_tag.store(LAST_SDK_TAG, Ordering::Relaxed);
        assert_eq!(conn.next_action_tag(), LAST_SDK_TAG);
        assert_eq!(conn.next_action_tag(), FIRST_SDK_TAG);
    }

    #[test]
    fn close_cancels_commands_and_closes_link() {
        let peer = MockPeer::new();
        let conn = connection(&peer, ControlPriorityLevel::Default);
        conn.connect(CONNECT).unwrap();
        let pending = conn.submit(Command::new("say_text"), |_| forever()).unwrap();

        conn.close();
        assert_eq!(pending.wait(), Err(VectorError::Cancelled(CancelReason::SessionClosed)));
        assert_eq!(conn.active_command_count(), 0);
        assert!(peer.is_closed());
        assert!(!conn.is_connected());
        assert!(peer.aborts().is_empty());
    }

    #[test]
    fn close_never_fails() {
        let peer = MockPeer::new();
        let conn = connection(&peer, ControlPriorityLevel::Default);
        conn.close();

        conn.connect(CONNECT).unwrap();
        conn.lease().shutdown();
        peer.fail_stream(VectorError::StreamClosed("peer went away".into()));
        conn.close();
        conn.close();
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn close_after_session_thread_exited() {
        let peer = MockPeer::new();
        let conn = connection(&peer, ControlPriorityLevel::Default);
        conn.connect(CONNECT).unwrap();
        let pending = conn.submit(Command::new("say_text"), |_| forever()).unwrap();

        {
            let mut guard = lock(&conn.worker);
            let worker = guard.as_mut().unwrap();
            worker.done.take().unwrap().send(()).unwrap();
            let deadline = Instant::now() + Duration::from_secs(1);
            while !worker.thread.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(2));
            }
            assert!(worker.thread.is_finished());
        }

        let started = Instant::now();
        conn.close();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(pending.wait().unwrap_err().is_cancelled());
        assert_eq!(conn.active_command_count(), 0);
    }

    #[test]
    fn lease_loss_spares_commands_without_control() {
        let peer = MockPeer::new();
        let conn = connection(&peer, ControlPriorityLevel::Default);
        conn.connect(CONNECT).unwrap();

        let battery = conn
            .submit(Command::new("battery_state").without_control(), |_| async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(7u8)
            })
            .unwrap();
        let drive = conn.submit(Command::new("drive_straight"), |_| forever()).unwrap();

        assert!(peer.inject(vector_types::ControlEvent::Lost));
        assert_eq!(drive.wait(), Err(VectorError::Cancelled(CancelReason::ControlLost)));
        assert_eq!(battery.wait(), Ok(7));
        assert_eq!(conn.active_command_count(), 0);
        assert!(!conn.lease().is_held());
    }

    #[test]
    fn reconnect_after_close_uses_a_fresh_lease() {
        let peer = MockPeer::new();
        let conn = connection(&peer, ControlPriorityLevel::Default);
        conn.connect(CONNECT).unwrap();
        let first = conn.lease();
        conn.close();
        assert!(first.is_shutdown());

        conn.connect(CONNECT).unwrap();
        assert!(!conn.lease().is_shutdown());
        assert!(conn.lease().is_held());
    }

    #[test]
    fn state_transitions_are_published() {
        let peer = MockPeer::new();
        let conn = connection(&peer, ControlPriorityLevel::None);
        let mut states = conn.subscribe_state();
        assert_eq!(*states.borrow_and_update(), ConnectionState::Disconnected);

        conn.connect(CONNECT).unwrap();
        assert!(states.has_changed().unwrap());
        assert_eq!(*states.borrow_and_update(), ConnectionState::Connected);

        conn.close();
        assert_eq!(*states.borrow_and_update(), ConnectionState::Disconnected);
    }
}
