//! `vector-connection` – Robot Session & Behaviour Control
//!
//! Owns the link to one Vector robot, negotiates the exclusive
//! behaviour-control lease, and runs every outgoing command on the session's
//! own execution context so it can be cancelled when control is lost.
//!
//! # Modules
//!
//! - [`lease`] – [`ControlLeaseState`]: whether control is held or wanted,
//!   with awaitable `granted` / `lost` signals.
//! - [`channel`] – [`ControlChannel`]: pumps lease requests onto the robot's
//!   behaviour-control stream and applies grant/loss notifications.
//! - [`session`] – [`Connection`]: connect, handshake, dedicated thread and
//!   runtime, request/release control, close.
//! - [`dispatcher`] – [`CommandDispatcher`]: wait-for-lease, marshal,
//!   register, execute, deregister and abort for every command.
//! - [`link`] – the [`Connector`] / [`RobotLink`] transport seam, with
//!   [`grpc`] as the production transport and [`proto`] its wire messages.
//! - [`config`] / [`telemetry`] – TOML configuration and tracing setup.
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use vector_connection::{Connection, ConnectionOptions, ControlPriorityLevel, Endpoint};
//!
//! let cert = std::fs::read("Vector-A1B2.cert").unwrap();
//! let endpoint = Endpoint::new("Vector-A1B2", "192.168.1.40", 443, Some(cert), "guid");
//! let conn = Connection::grpc(
//!     endpoint,
//!     ConnectionOptions { default_priority: ControlPriorityLevel::Default, ..Default::default() },
//! );
//! conn.connect(Duration::from_secs(10)).unwrap();
//! assert!(conn.control_granted().is_set());
//! conn.close();
//! ```

pub mod channel;
pub mod config;
pub mod dispatcher;
pub mod grpc;
pub mod lease;
pub mod link;
pub mod proto;
pub mod session;
pub mod signal;
pub mod telemetry;

#[cfg(test)]
mod test_support;

pub use channel::ControlChannel;
pub use config::{ConnectionConfig, TelemetryConfig};
pub use dispatcher::{Command, CommandContext, CommandDispatcher, CommandRegistry, PendingOperation};
pub use grpc::{GrpcConnector, GrpcLink};
pub use lease::ControlLeaseState;
pub use link::{Connector, RobotLink};
pub use session::{Connection, ConnectionOptions};
pub use signal::{Signal, SignalListener};
pub use vector_types::{
    CancelPolicy, CancelReason, ConnectionState, ControlPriorityLevel, Endpoint, VectorError,
};
