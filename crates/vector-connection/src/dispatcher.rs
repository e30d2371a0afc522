//! [`CommandDispatcher`] – uniform execution and cancellation for every
//! outgoing robot command.
//!
//! [`CommandDispatcher::submit`] runs a command through fixed steps:
//!
//! 1. **wait-for-lease** – reject, or wait a bounded time, when the command
//!    needs behaviour control that is not currently held;
//! 2. **marshal** – spawn onto the connection's execution context, whichever
//!    thread the caller is on;
//! 3. **register** – record the command in the [`CommandRegistry`] so a close
//!    can cancel it, and a lease loss too when it needs control;
//! 4. **execute** – run the call against the link;
//! 5. **deregister** – always, through a drop guard;
//! 6. **abort upstream** – only when the caller (not a lease loss) cancelled a
//!    cancellable action or behaviour.
//!
//! The caller gets a [`PendingOperation`], which can be awaited or waited on
//! synchronously.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use tokio::runtime::Handle;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};
use vector_types::{CancelPolicy, CancelReason, VectorError};

use crate::lease::ControlLeaseState;
use crate::link::RobotLink;

// ────────────────────────────────────────────────────────────────────────────
// Cancellation
// ────────────────────────────────────────────────────────────────────────────

/// One-shot cancellation flag that remembers why it fired.
#[derive(Debug)]
pub(crate) struct CancelToken {
    reason: watch::Sender<Option<CancelReason>>,
}

impl CancelToken {
    pub(crate) fn new() -> Self {
        let (reason, _) = watch::channel(None);
        Self { reason }
    }

    /// Fire the token. Only the first reason sticks; returns whether this
    /// call fired it.
    pub(crate) fn cancel(&self, reason: CancelReason) -> bool {
        self.reason.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        })
    }

    pub(crate) fn reason(&self) -> Option<CancelReason> {
        *self.reason.borrow()
    }

    pub(crate) async fn cancelled(&self) -> CancelReason {
        let mut rx = self.reason.subscribe();
        match rx.wait_for(Option::is_some).await {
            Ok(reason) => (*reason).unwrap_or(CancelReason::SessionClosed),
            Err(_) => CancelReason::SessionClosed,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Registry of active commands
// ────────────────────────────────────────────────────────────────────────────

/// The set of commands currently in flight on one connection.
///
/// Each entry remembers whether its command needs behaviour control: a lease
/// loss cancels only those, a close cancels everything.
#[derive(Debug, Default)]
pub struct CommandRegistry {
    next_id: AtomicU64,
    active: Mutex<HashMap<u64, Entry>>,
}

#[derive(Debug)]
struct Entry {
    token: Arc<CancelToken>,
    requires_control: bool,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, Entry>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn register(
        self: &Arc<Self>,
        token: Arc<CancelToken>,
        requires_control: bool,
    ) -> Registration {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().insert(
            id,
            Entry {
                token,
                requires_control,
            },
        );
        Registration {
            registry: Arc::clone(self),
            id,
        }
    }

    /// Cancel every active command with `reason` and empty the registry.
    /// Returns how many commands were cancelled.
    pub fn cancel_all(&self, reason: CancelReason) -> usize {
        let drained: Vec<Entry> = self.lock().drain().map(|(_, entry)| entry).collect();
        for entry in &drained {
            entry.token.cancel(reason);
        }
        drained.len()
    }

    /// Cancel and remove only the commands that need behaviour control.
    /// Returns how many commands were cancelled.
    pub fn cancel_controlled(&self, reason: CancelReason) -> usize {
        let mut drained = Vec::new();
        self.lock().retain(|_, entry| {
            if entry.requires_control {
                drained.push(Arc::clone(&entry.token));
            }
            !entry.requires_control
        });
        for token in &drained {
            token.cancel(reason);
        }
        drained.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Number of active commands that need behaviour control.
    pub fn controlled_len(&self) -> usize {
        self.lock().values().filter(|entry| entry.requires_control).count()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Removes its command from the registry when dropped.
#[derive(Debug)]
pub(crate) struct Registration {
    registry: Arc<CommandRegistry>,
    id: u64,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.id);
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Pending operations
// ────────────────────────────────────────────────────────────────────────────

/// Handle to one outstanding call.
///
/// Await it from async code, or call [`wait`][Self::wait] from a plain
/// thread. Both observe the same operation.
#[derive(Debug)]
pub struct PendingOperation<T> {
    name: &'static str,
    result: oneshot::Receiver<Result<T, VectorError>>,
    token: Arc<CancelToken>,
    session_thread: ThreadId,
}

impl<T> PendingOperation<T> {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Cancel the operation on behalf of the caller. Returns `false` if it was
    /// already cancelled.
    pub fn cancel(&self) -> bool {
        self.token.cancel(CancelReason::Caller)
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.reason().is_some()
    }

    /// Block the current thread until the operation finishes.
    ///
    /// # Errors
    ///
    /// [`VectorError::InvalidUsage`] when called on the connection's own
    /// thread, which would deadlock; await the operation there instead.
    pub fn wait(self) -> Result<T, VectorError> {
        if thread::current().id() == self.session_thread {
            return Err(VectorError::InvalidUsage(format!(
                "'{}' cannot be waited on from the connection thread; await it instead",
                self.name
            )));
        }
        futures::executor::block_on(self)
    }
}

impl<T> Future for PendingOperation<T> {
    type Output = Result<T, VectorError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.result)
            .poll(cx)
            .map(|received| {
                received.unwrap_or(Err(VectorError::Cancelled(CancelReason::SessionClosed)))
            })
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Commands
// ────────────────────────────────────────────────────────────────────────────

/// Static description of an outgoing command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    pub name: &'static str,
    pub requires_control: bool,
    pub cancel: CancelPolicy,
}

impl Command {
    /// A command that needs behaviour control and cannot be aborted upstream.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            requires_control: true,
            cancel: CancelPolicy::None,
        }
    }

    pub fn without_control(mut self) -> Self {
        self.requires_control = false;
        self
    }

    pub fn cancellable(mut self, policy: CancelPolicy) -> Self {
        self.cancel = policy;
        self
    }
}

/// What a running command gets to work with.
pub struct CommandContext<L> {
    link: Arc<L>,
    action_tag: Option<u32>,
}

impl<L> CommandContext<L> {
    pub fn link(&self) -> &L {
        &self.link
    }

    /// The id tag to attach to the action, for [`CancelPolicy::Action`].
    pub fn action_tag(&self) -> Option<u32> {
        self.action_tag
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Dispatcher
// ────────────────────────────────────────────────────────────────────────────

/// Runs commands on one connection's execution context.
pub struct CommandDispatcher<L> {
    runtime: Handle,
    session_thread: ThreadId,
    link: Arc<L>,
    lease: Arc<ControlLeaseState>,
    registry: Arc<CommandRegistry>,
    control_wait: Duration,
}

impl<L> Clone for CommandDispatcher<L> {
    fn clone(&self) -> Self {
        Self {
            runtime: self.runtime.clone(),
            session_thread: self.session_thread,
            link: Arc::clone(&self.link),
            lease: Arc::clone(&self.lease),
            registry: Arc::clone(&self.registry),
            control_wait: self.control_wait,
        }
    }
}

impl<L: RobotLink> CommandDispatcher<L> {
    /// Build a dispatcher bound to the runtime of the *current* thread, which
    /// must be the connection's own thread.
    pub(crate) fn on_current_thread(
        link: Arc<L>,
        lease: Arc<ControlLeaseState>,
        registry: Arc<CommandRegistry>,
        control_wait: Duration,
    ) -> Self {
        Self {
            runtime: Handle::current(),
            session_thread: thread::current().id(),
            link,
            lease,
            registry,
            control_wait,
        }
    }

    /// True when the caller is running on the connection's own thread.
    pub fn is_session_thread(&self) -> bool {
        thread::current().id() == self.session_thread
    }

    pub fn link(&self) -> &Arc<L> {
        &self.link
    }

    pub fn lease(&self) -> &Arc<ControlLeaseState> {
        &self.lease
    }

    pub fn registry(&self) -> &Arc<CommandRegistry> {
        &self.registry
    }

    pub(crate) fn runtime(&self) -> &Handle {
        &self.runtime
    }

    /// Submit `call` for execution.
    ///
    /// `requires_behavior_control` is the connection-wide setting: when it is
    /// off, a command that needs control fails immediately unless control is
    /// already held; when it is on, the command waits up to the configured
    /// bound for control to be granted and then proceeds.
    ///
    /// # Errors
    ///
    /// [`VectorError::NotInControl`] as described above. Every other failure
    /// arrives through the returned [`PendingOperation`].
    pub fn submit<T, F, Fut>(
        &self,
        command: Command,
        requires_behavior_control: bool,
        call: F,
    ) -> Result<PendingOperation<T>, VectorError>
    where
        T: Send + 'static,
        F: FnOnce(CommandContext<L>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, VectorError>> + Send + 'static,
    {
        if command.requires_control && !self.lease.is_held() && !requires_behavior_control {
            return Err(VectorError::NotInControl {
                command: command.name.to_string(),
            });
        }

        let token = Arc::new(CancelToken::new());
        let registration = self
            .registry
            .register(Arc::clone(&token), command.requires_control);
        let (tx, rx) = oneshot::channel();

        let context = CommandContext {
            link: Arc::clone(&self.link),
            action_tag: match command.cancel {
                CancelPolicy::Action(tag) => Some(tag),
                _ => None,
            },
        };
        let lease = Arc::clone(&self.lease);
        let link = Arc::clone(&self.link);
        let control_wait = self.control_wait;
        let task_token = Arc::clone(&token);

        self.runtime.spawn(async move {
            let started = Instant::now();
            let execute = async move {
                if command.requires_control && !lease.granted().is_set() {
                    info!(command = command.name, "delaying until behavior control is granted");
                    if tokio::time::timeout(control_wait, lease.granted().wait()).await.is_err() {
                        warn!(
                            command = command.name,
                            waited = ?control_wait,
                            "behavior control not granted in time, proceeding"
                        );
                    }
                }
                debug!(command = command.name, "outgoing");
                call(context).await
            };

            let outcome = tokio::select! {
                biased;
                reason = task_token.cancelled() => Err(reason),
                result = execute => Ok(result),
            };

            let result = match outcome {
                Ok(result) => {
                    debug!(
                        command = command.name,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        ok = result.is_ok(),
                        "incoming"
                    );
                    result
                }
                Err(reason) => {
                    match reason {
                        CancelReason::Caller => abort_upstream(link.as_ref(), command).await,
                        CancelReason::ControlLost => warn!(
                            command = command.name,
                            "cancelled because behavior control was lost"
                        ),
                        CancelReason::SessionClosed => {
                            debug!(command = command.name, "cancelled by connection close")
                        }
                    }
                    Err(VectorError::Cancelled(reason))
                }
            };

            drop(registration);
            let _ = tx.send(result);
        });

        Ok(PendingOperation {
            name: command.name,
            result: rx,
            token,
            session_thread: self.session_thread,
        })
    }

    /// Schedule `work` on the execution context without registering it as a
    /// command. Caller cancellation stops it but sends nothing upstream.
    pub fn run_soon<T, Fut>(&self, name: &'static str, work: Fut) -> PendingOperation<T>
    where
        T: Send + 'static,
        Fut: Future<Output = Result<T, VectorError>> + Send + 'static,
    {
        let token = Arc::new(CancelToken::new());
        let task_token = Arc::clone(&token);
        let (tx, rx) = oneshot::channel();
        self.runtime.spawn(async move {
            let result = tokio::select! {
                biased;
                reason = task_token.cancelled() => Err(VectorError::Cancelled(reason)),
                result = work => result,
            };
            let _ = tx.send(result);
        });
        PendingOperation {
            name,
            result: rx,
            token,
            session_thread: self.session_thread,
        }
    }
}

async fn abort_upstream<L: RobotLink>(link: &L, command: Command) {
    let outcome = match command.cancel {
        CancelPolicy::None => return,
        CancelPolicy::Action(tag) => {
            info!(command = command.name, id_tag = tag, "aborting cancelled action");
            link.cancel_action(tag).await
        }
        CancelPolicy::Behavior => {
            info!(command = command.name, "aborting cancelled behavior");
            link.cancel_behavior().await
        }
    };
    if let Err(e) = outcome {
        warn!(command = command.name, error = %e, "abort request failed");
    }
}
