//! [`ControlChannel`] – bridges the [`ControlLeaseState`] and the robot's
//! persistent behaviour-control stream.
//!
//! * **Outgoing** – a stream that wakes on every posted request, sends a
//!   request or release for the latest desired priority, and ends once the
//!   lease is shut down. It is the only writer to the stream.
//! * **Incoming** – applies each robot notification to the lease. A loss
//!   cancels every active command that needs control *before* the lease
//!   flips, so cancellation never observes `held == true`. Commands that run
//!   without control are left alone.

use std::sync::Arc;

use futures::StreamExt;
use futures::stream;
use tracing::{debug, info, trace, warn};
use vector_types::{CancelReason, ControlEvent};

use crate::dispatcher::CommandRegistry;
use crate::lease::ControlLeaseState;
use crate::link::{ControlRequests, RobotLink};

/// One behaviour-control stream for one connection.
pub struct ControlChannel<L> {
    lease: Arc<ControlLeaseState>,
    registry: Arc<CommandRegistry>,
    link: Arc<L>,
}

impl<L: RobotLink> ControlChannel<L> {
    pub fn new(
        lease: Arc<ControlLeaseState>,
        registry: Arc<CommandRegistry>,
        link: Arc<L>,
    ) -> Self {
        Self {
            lease,
            registry,
            link,
        }
    }

    /// The outgoing half: one message per consumed request, latest value wins.
    pub fn outgoing(lease: Arc<ControlLeaseState>) -> ControlRequests {
        stream::unfold(lease, |lease| async move {
            let msg = lease.next_message().await?;
            debug!(?msg, "BehaviorControl request");
            Some((msg, lease))
        })
        .boxed()
    }

    /// Open the stream and process notifications until it ends.
    ///
    /// Closure of the stream, whether by the peer or by disconnection, ends
    /// the loop quietly.
    pub async fn run(self) {
        let outgoing = Self::outgoing(Arc::clone(&self.lease));
        let mut incoming = match self.link.behavior_control(outgoing).await {
            Ok(incoming) => incoming,
            Err(e) if e.is_stream_closed() => {
                debug!(error = %e, "behavior control stream closed before it opened");
                return;
            }
            Err(e) => {
                warn!(error = %e, "failed to open behavior control stream");
                return;
            }
        };

        while let Some(received) = incoming.next().await {
            match received {
                Ok(ControlEvent::Granted) => {
                    info!("BehaviorControl control_granted_response");
                    self.lease.update(true);
                }
                Ok(ControlEvent::Lost) => {
                    let cancelled = self.registry.cancel_controlled(CancelReason::ControlLost);
                    info!(cancelled, "BehaviorControl control_lost_event");
                    self.lease.update(false);
                }
                Ok(ControlEvent::KeepAlive) => trace!("BehaviorControl keep_alive"),
                Ok(other) => debug!(event = ?other, "ignoring behavior control response"),
                Err(e) if e.is_stream_closed() => {
                    debug!("behavior control stream closed, expected during disconnection");
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "behavior control stream failed");
                    return;
                }
            }
        }
        debug!("behavior control stream ended");
    }
}
