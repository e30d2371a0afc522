//! The transport seam.
//!
//! The connection core never talks to the network directly. It opens a
//! [`RobotLink`] through a [`Connector`] and drives everything through the
//! link's methods.
//!
//! - [`GrpcConnector`][crate::grpc::GrpcConnector] – TLS + gRPC to a physical
//!   robot.
//! - tests use an in-memory peer that records what it is sent.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use vector_types::{ClientInfo, ControlEvent, ControlMessage, Endpoint, HostVersion, VectorError};

/// Incoming half of the behaviour-control stream.
pub type ControlEvents = BoxStream<'static, Result<ControlEvent, VectorError>>;

/// Outgoing half of the behaviour-control stream.
pub type ControlRequests = BoxStream<'static, ControlMessage>;

/// Opens links to a robot.
///
/// `open` runs on the connection's own execution context, so implementations
/// may spawn background I/O tasks with [`tokio::spawn`].
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Link: RobotLink;

    /// Open a secure channel to `endpoint` and wait until it is ready.
    ///
    /// # Errors
    ///
    /// [`VectorError::NotFound`] when the channel is not ready within
    /// `timeout`.
    async fn open(&self, endpoint: &Endpoint, timeout: Duration) -> Result<Self::Link, VectorError>;
}

/// An open channel to one robot.
#[async_trait]
pub trait RobotLink: Send + Sync + 'static {
    /// Exchange protocol versions.
    async fn protocol_version(
        &self,
        client_version: i64,
        min_host_version: i64,
    ) -> Result<HostVersion, VectorError>;

    /// Send the one-time client identity message.
    async fn initialize_session(&self, info: &ClientInfo) -> Result<(), VectorError>;

    /// Open the persistent behaviour-control stream.
    ///
    /// `outgoing` is polled for as long as the stream is open; when it ends
    /// the client half of the stream is closed.
    async fn behavior_control(
        &self,
        outgoing: ControlRequests,
    ) -> Result<ControlEvents, VectorError>;

    /// Abort the action carrying `id_tag`.
    async fn cancel_action(&self, id_tag: u32) -> Result<(), VectorError>;

    /// Abort the running behaviour.
    async fn cancel_behavior(&self) -> Result<(), VectorError>;

    /// Close the channel. Must not fail.
    async fn close(&self);
}
