//! In-memory robot used by the unit tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use tokio::sync::mpsc;
use vector_types::{ClientInfo, ControlEvent, ControlMessage, Endpoint, HostVersion, VectorError};

use crate::link::{ControlEvents, ControlRequests, Connector, RobotLink};

/// Everything the client sent to the peer, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Sent {
    Control(ControlMessage),
    CancelAction(u32),
    CancelBehavior,
}

#[derive(Debug)]
struct PeerConfig {
    reachable: bool,
    host_version: HostVersion,
    hang_handshake: bool,
}

#[derive(Debug)]
pub(crate) struct MockPeer {
    config: Mutex<PeerConfig>,
    auto_grant: AtomicBool,
    sent: Mutex<Vec<Sent>>,
    events: Mutex<Option<mpsc::UnboundedSender<Result<ControlEvent, VectorError>>>>,
    initialized: Mutex<Option<ClientInfo>>,
    closed: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockPeer {
    /// A reachable, compatible peer that grants every request.
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            config: Mutex::new(PeerConfig {
                reachable: true,
                host_version: HostVersion {
                    supported: true,
                    host_version: 5,
                },
                hang_handshake: false,
            }),
            auto_grant: AtomicBool::new(true),
            sent: Mutex::new(Vec::new()),
            events: Mutex::new(None),
            initialized: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    /// A peer that accepts the connection but never answers lease requests.
    pub(crate) fn silent() -> Arc<Self> {
        let peer = Self::new();
        peer.set_auto_grant(false);
        peer
    }

    pub(crate) fn set_auto_grant(&self, grant: bool) {
        self.auto_grant.store(grant, Ordering::SeqCst);
    }

    pub(crate) fn set_unreachable(&self) {
        lock(&self.config).reachable = false;
    }

    pub(crate) fn set_host_version(&self, supported: bool, host_version: i64) {
        lock(&self.config).host_version = HostVersion {
            supported,
            host_version,
        };
    }

    pub(crate) fn set_hang_handshake(&self) {
        lock(&self.config).hang_handshake = true;
    }

    pub(crate) fn link(self: &Arc<Self>) -> MockLink {
        MockLink {
            peer: Arc::clone(self),
        }
    }

    pub(crate) fn connector(self: &Arc<Self>) -> MockConnector {
        MockConnector {
            peer: Arc::clone(self),
        }
    }

    /// Push a lease notification to the client. Returns `false` when no
    /// control stream is open.
    pub(crate) fn inject(&self, event: ControlEvent) -> bool {
        lock(&self.events)
            .as_ref()
            .map(|tx| tx.send(Ok(event)).is_ok())
            .unwrap_or(false)
    }

    /// End the control stream from the peer side with `error`.
    pub(crate) fn fail_stream(&self, error: VectorError) {
        if let Some(tx) = lock(&self.events).take() {
            let _ = tx.send(Err(error));
        }
    }

    pub(crate) fn control_messages(&self) -> Vec<ControlMessage> {
        lock(&self.sent)
            .iter()
            .filter_map(|sent| match sent {
                Sent::Control(msg) => Some(*msg),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn aborts(&self) -> Vec<Sent> {
        lock(&self.sent)
            .iter()
            .filter(|sent| !matches!(sent, Sent::Control(_)))
            .copied()
            .collect()
    }

    pub(crate) fn initialized_with(&self) -> Option<ClientInfo> {
        lock(&self.initialized).clone()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Poll until `check` holds or `timeout` passes.
    pub(crate) fn eventually(&self, timeout: Duration, check: impl Fn(&Self) -> bool) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        while std::time::Instant::now() < deadline {
            if check(self) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        check(self)
    }

    fn record(&self, sent: Sent) {
        lock(&self.sent).push(sent);
    }
}

pub(crate) struct MockConnector {
    peer: Arc<MockPeer>,
}

#[async_trait]
impl Connector for MockConnector {
    type Link = MockLink;

    async fn open(&self, endpoint: &Endpoint, _timeout: Duration) -> Result<MockLink, VectorError> {
        if !lock(&self.peer.config).reachable {
            return Err(VectorError::NotFound(endpoint.authority()));
        }
        Ok(self.peer.link())
    }
}

pub(crate) struct MockLink {
    peer: Arc<MockPeer>,
}

#[async_trait]
impl RobotLink for MockLink {
    async fn protocol_version(
        &self,
        _client_version: i64,
        _min_host_version: i64,
    ) -> Result<HostVersion, VectorError> {
        let (hang, version) = {
            let config = lock(&self.peer.config);
            (config.hang_handshake, config.host_version)
        };
        if hang {
            futures::future::pending::<()>().await;
        }
        Ok(version)
    }

    async fn initialize_session(&self, info: &ClientInfo) -> Result<(), VectorError> {
        *lock(&self.peer.initialized) = Some(info.clone());
        Ok(())
    }

    async fn behavior_control(
        &self,
        mut outgoing: ControlRequests,
    ) -> Result<ControlEvents, VectorError> {
        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&self.peer.events) = Some(tx.clone());
        let peer = Arc::clone(&self.peer);
        tokio::spawn(async move {
            while let Some(msg) = outgoing.next().await {
                peer.record(Sent::Control(msg));
                if peer.auto_grant.load(Ordering::SeqCst) {
                    let event = match msg {
                        ControlMessage::Request(_) => ControlEvent::Granted,
                        ControlMessage::Release => ControlEvent::Lost,
                    };
                    let _ = tx.send(Ok(event));
                }
            }
            // Client half closed: end the response stream too.
            lock(&peer.events).take();
        });
        let events = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        });
        Ok(events.boxed())
    }

    async fn cancel_action(&self, id_tag: u32) -> Result<(), VectorError> {
        self.peer.record(Sent::CancelAction(id_tag));
        Ok(())
    }

    async fn cancel_behavior(&self) -> Result<(), VectorError> {
        self.peer.record(Sent::CancelBehavior);
        Ok(())
    }

    async fn close(&self) {
        self.peer.closed.store(true, Ordering::SeqCst);
        lock(&self.peer.events).take();
    }
}
