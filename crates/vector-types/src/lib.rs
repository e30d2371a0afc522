use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Strength of a behaviour-control request.
///
/// Lower variants pre-empt more of the robot's autonomous behaviours.
/// [`ControlPriorityLevel::None`] means "no control desired" and is never put
/// on the wire as a request; it is expressed as a release instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlPriorityLevel {
    /// Runs above mandatory physical reactions (drives off tables, ignores
    /// low battery, works in the dark).
    #[serde(alias = "override")]
    OverrideBehaviors,
    /// Runs below mandatory physical reactions but above trigger-word
    /// detection. Normal operation.
    Default,
    /// Holds control before/after other client connections, used to keep
    /// idle behaviours quiet.
    #[serde(alias = "reserve")]
    ReserveControl,
    /// No control priority needed.
    #[default]
    None,
}

impl ControlPriorityLevel {
    /// Numeric priority carried by a control request on the wire, or `None`
    /// for [`ControlPriorityLevel::None`].
    pub fn wire_value(self) -> Option<i32> {
        match self {
            ControlPriorityLevel::OverrideBehaviors => Some(10),
            ControlPriorityLevel::Default => Some(20),
            ControlPriorityLevel::ReserveControl => Some(30),
            ControlPriorityLevel::None => None,
        }
    }

    pub fn is_none(self) -> bool {
        self == ControlPriorityLevel::None
    }
}

impl fmt::Display for ControlPriorityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlPriorityLevel::OverrideBehaviors => write!(f, "override_behaviors"),
            ControlPriorityLevel::Default => write!(f, "default"),
            ControlPriorityLevel::ReserveControl => write!(f, "reserve_control"),
            ControlPriorityLevel::None => write!(f, "none"),
        }
    }
}

/// Identity and trust material of one robot. Immutable once a connection has
/// been built from it.
#[derive(Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    /// Robot display name, e.g. `Vector-A1B2`. Also the TLS server name the
    /// robot certificate is issued for.
    pub name: String,
    /// PEM-encoded robot certificate, pinned as the only trust root.
    pub certificate: Option<Vec<u8>>,
    /// Authorization token (the client guid).
    pub token: String,
}

impl Endpoint {
    pub fn new(
        name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        certificate: Option<Vec<u8>>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            name: name.into(),
            certificate,
            token: token.into(),
        }
    }

    /// `host:port` as used when dialing.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("name", &self.name)
            .field(
                "certificate",
                &self.certificate.as_ref().map(|c| format!("{} bytes", c.len())),
            )
            .field(
                "token",
                if self.token.is_empty() { &"<not set>" } else { &"<redacted>" },
            )
            .finish()
    }
}

/// Client identity sent once per session right after the version handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub module_version: String,
    pub runtime_version: String,
    pub runtime_implementation: String,
    pub os_version: String,
    pub cpu_version: String,
}

impl ClientInfo {
    /// Describe the running process.
    pub fn current() -> Self {
        Self {
            module_version: env!("CARGO_PKG_VERSION").to_string(),
            runtime_version: String::from("edition-2024"),
            runtime_implementation: String::from("rust"),
            os_version: format!("{}-{}", std::env::consts::OS, std::env::consts::FAMILY),
            cpu_version: std::env::consts::ARCH.to_string(),
        }
    }
}

/// Result of the protocol-version handshake as reported by the robot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostVersion {
    /// Whether the robot accepted the client's version.
    pub supported: bool,
    pub host_version: i64,
}

/// Lease message sent from the client to the robot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    Request(ControlPriorityLevel),
    Release,
}

/// Lease notification received from the robot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    Granted,
    Lost,
    /// Reserved control was taken by another client.
    ReservedLost,
    KeepAlive,
    /// A response kind this client does not know.
    Unknown,
}

/// How a command is aborted upstream when its caller cancels it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CancelPolicy {
    /// Nothing is sent upstream.
    #[default]
    None,
    /// Cancellable as an action carrying this id tag.
    Action(u32),
    /// Cancellable as a behaviour.
    Behavior,
}

/// Why a pending operation stopped before producing a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CancelReason {
    /// The caller cancelled it.
    Caller,
    /// The robot revoked behaviour control.
    ControlLost,
    /// The connection was closed underneath it.
    SessionClosed,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Caller => write!(f, "cancelled by caller"),
            CancelReason::ControlLost => write!(f, "behavior control was lost"),
            CancelReason::SessionClosed => write!(f, "connection closed"),
        }
    }
}

/// Lifecycle of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    /// The last `connect` attempt failed; the error went to its caller.
    Failed,
}

/// Error type for everything the connection core can report.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum VectorError {
    #[error("Configuration Error: {0}")]
    Configuration(String),

    #[error("Unable to reach robot at {0}")]
    NotFound(String),

    #[error("Incompatible protocol version: robot reports {host_version}, need {min_host_version}")]
    IncompatibleVersion {
        host_version: i64,
        min_host_version: i64,
    },

    #[error("Repeated connections made to open connection")]
    AlreadyConnected,

    #[error("Connection is not open")]
    NotConnected,

    #[error("Surpassed timeout of {timeout:?} waiting for behavior control")]
    ControlTimeout { timeout: Duration },

    #[error("Unable to run '{command}' without behavior control")]
    NotInControl { command: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid usage: {0}")]
    InvalidUsage(String),

    #[error("Operation {0}")]
    Cancelled(CancelReason),

    #[error("Failed to authenticate with robot: {0}")]
    Unauthenticated(String),

    #[error("Robot is unavailable: {0}")]
    Unavailable(String),

    #[error("Robot does not implement this call: {0}")]
    Unimplemented(String),

    #[error("Robot call timed out: {0}")]
    Timeout(String),

    #[error("Stream closed by peer: {0}")]
    StreamClosed(String),

    #[error("Remote error {code}: {message}")]
    Remote { code: i32, message: String },

    #[error("Execution context error: {0}")]
    Runtime(String),
}

impl VectorError {
    /// True for outcomes that mean the stream ended, which is the normal way
    /// for the control stream to terminate during disconnection.
    pub fn is_stream_closed(&self) -> bool {
        matches!(
            self,
            VectorError::StreamClosed(_) | VectorError::Cancelled(CancelReason::SessionClosed)
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, VectorError::Cancelled(_))
    }
}
