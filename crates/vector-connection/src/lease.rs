//! [`ControlLeaseState`] – the single source of truth for behaviour control.
//!
//! The lease knows nothing about the wire. Callers post the priority they
//! want with [`ControlLeaseState::request`] / [`ControlLeaseState::release`];
//! the control channel consumes those requests and reports the robot's
//! answers back through [`ControlLeaseState::update`].
//!
//! Three [`Signal`]s mirror the state:
//!
//! | Signal | Set when |
//! |---|---|
//! | `granted` | the robot handed control to this client |
//! | `lost` | control is not held (initially, or revoked) |
//! | `request_pending` | a new desired priority is waiting to be sent |
//!
//! `granted` and `lost` are complementary until [`ControlLeaseState::shutdown`]
//! sets both to release every waiter.

use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::debug;
use vector_types::{ControlMessage, ControlPriorityLevel, VectorError};

use crate::signal::{Signal, SignalListener};

#[derive(Debug)]
struct LeaseInner {
    held: bool,
    requested: ControlPriorityLevel,
    shutdown: bool,
}

/// Lease status plus its awaitable signals.
#[derive(Debug)]
pub struct ControlLeaseState {
    inner: Mutex<LeaseInner>,
    granted: Signal,
    lost: Signal,
    request_pending: Signal,
}

impl ControlLeaseState {
    /// Create a lease that is not held, remembering `priority` as the desired
    /// level without posting a request for it.
    pub fn new(priority: ControlPriorityLevel) -> Self {
        Self {
            inner: Mutex::new(LeaseInner {
                held: false,
                requested: priority,
                shutdown: false,
            }),
            granted: Signal::new(false),
            lost: Signal::new(true),
            request_pending: Signal::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LeaseInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ask for control at `priority`. Does not block.
    ///
    /// # Errors
    ///
    /// [`VectorError::InvalidArgument`] when `priority` is
    /// [`ControlPriorityLevel::None`]; use [`release`][Self::release] instead.
    pub fn request(&self, priority: ControlPriorityLevel) -> Result<(), VectorError> {
        if priority.is_none() {
            return Err(VectorError::InvalidArgument(
                "must provide a priority level to request; to disable control, use release()"
                    .to_string(),
            ));
        }
        self.lock().requested = priority;
        self.request_pending.set();
        Ok(())
    }

    /// Give control back to the robot's behaviour system. Does not block.
    pub fn release(&self) {
        self.lock().requested = ControlPriorityLevel::None;
        self.request_pending.set();
    }

    /// Apply the robot's answer. The only place `held` changes outside of
    /// [`shutdown`][Self::shutdown].
    pub fn update(&self, granted: bool) {
        let mut inner = self.lock();
        if granted {
            inner.held = true;
            self.granted.set();
            self.lost.clear();
        } else {
            self.lost.set();
            self.granted.clear();
            inner.held = false;
        }
    }

    /// Terminal transition: drop the lease, wake every waiter, and let the
    /// outgoing loop observe termination. Safe to call repeatedly.
    pub fn shutdown(&self) {
        let mut inner = self.lock();
        inner.held = false;
        self.granted.set();
        self.lost.set();
        inner.shutdown = true;
        drop(inner);
        self.request_pending.set();
    }

    /// Consume a posted request.
    ///
    /// Waits for `request_pending`, clears it, and returns the message for the
    /// latest requested priority, or `None` once the lease has been shut down.
    pub async fn next_message(&self) -> Option<ControlMessage> {
        self.request_pending.wait().await;
        self.request_pending.clear();
        let inner = self.lock();
        if inner.shutdown {
            debug!("control lease shut down, closing outgoing control stream");
            return None;
        }
        Some(match inner.requested {
            ControlPriorityLevel::None => ControlMessage::Release,
            priority => ControlMessage::Request(priority),
        })
    }

    pub fn is_held(&self) -> bool {
        self.lock().held
    }

    pub fn requested_priority(&self) -> ControlPriorityLevel {
        self.lock().requested
    }

    pub fn is_shutdown(&self) -> bool {
        self.lock().shutdown
    }

    pub fn granted(&self) -> &Signal {
        &self.granted
    }

    pub fn lost(&self) -> &Signal {
        &self.lost
    }

    pub fn request_pending(&self) -> &Signal {
        &self.request_pending
    }

    pub fn granted_listener(&self) -> SignalListener {
        self.granted.listener()
    }

    pub fn lost_listener(&self) -> SignalListener {
        self.lost.listener()
    }
}

impl Default for ControlLeaseState {
    fn default() -> Self {
        Self::new(ControlPriorityLevel::None)
    }
}
