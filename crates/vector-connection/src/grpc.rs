//! gRPC transport to a physical robot.
//!
//! [`GrpcConnector`] opens an HTTP/2 channel secured with the robot's own
//! certificate as the only trust root, using the robot's display name as the
//! TLS server name. Every call carries `authorization: Bearer <token>`.
//!
//! Transport failures never leave this module as [`tonic::Status`]; they are
//! translated by [`status_error`].

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tonic::client::Grpc;
use tonic::codec::ProstCodec;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::metadata::{Ascii, MetadataValue};
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint as TransportEndpoint};
use tonic::{Code, Request, Status};
use tracing::debug;
use vector_types::{ClientInfo, ControlEvent, ControlMessage, Endpoint, HostVersion, VectorError};

use crate::link::{ControlEvents, ControlRequests, Connector, RobotLink};
use crate::proto::{self, path};

/// Opens [`GrpcLink`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct GrpcConnector;

#[async_trait]
impl Connector for GrpcConnector {
    type Link = GrpcLink;

    async fn open(&self, endpoint: &Endpoint, timeout: Duration) -> Result<GrpcLink, VectorError> {
        let authority = endpoint.authority();
        let certificate = endpoint.certificate.clone().ok_or_else(|| {
            VectorError::Configuration(
                "Must provide a cert file to authenticate to the robot".to_string(),
            )
        })?;
        let authorization: MetadataValue<Ascii> =
            format!("Bearer {}", endpoint.token).parse().map_err(|_| {
                VectorError::Configuration(
                    "authorization token is not a valid header value".to_string(),
                )
            })?;

        let tls = ClientTlsConfig::new()
            .ca_certificate(Certificate::from_pem(certificate))
            .domain_name(endpoint.name.clone());
        let transport = TransportEndpoint::from_shared(format!("https://{authority}"))
            .map_err(|e| {
                VectorError::Configuration(format!("invalid robot address {authority}: {e}"))
            })?
            .tls_config(tls)
            .map_err(|e| {
                VectorError::Configuration(format!("invalid TLS settings for {authority}: {e}"))
            })?
            .connect_timeout(timeout);

        debug!(host = %authority, name = %endpoint.name, "opening channel");
        let channel = match tokio::time::timeout(timeout, transport.connect()).await {
            Ok(Ok(channel)) => channel,
            Ok(Err(e)) => {
                debug!(host = %authority, error = %e, "channel failed");
                return Err(VectorError::NotFound(authority));
            }
            Err(_) => {
                debug!(host = %authority, ?timeout, "channel not ready in time");
                return Err(VectorError::NotFound(authority));
            }
        };

        Ok(GrpcLink {
            channel: Mutex::new(Some(channel)),
            authorization,
        })
    }
}

/// An open gRPC channel to one robot.
#[derive(Debug)]
pub struct GrpcLink {
    channel: Mutex<Option<Channel>>,
    authorization: MetadataValue<Ascii>,
}

impl GrpcLink {
    fn lock(&self) -> MutexGuard<'_, Option<Channel>> {
        self.channel.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn request<T>(&self, message: T) -> Request<T> {
        let mut request = Request::new(message);
        request
            .metadata_mut()
            .insert("authorization", self.authorization.clone());
        request
    }

    async fn client(&self) -> Result<Grpc<Channel>, VectorError> {
        let channel = self.lock().clone().ok_or(VectorError::NotConnected)?;
        let mut grpc = Grpc::new(channel);
        grpc.ready()
            .await
            .map_err(|e| VectorError::Unavailable(format!("channel not ready: {e}")))?;
        Ok(grpc)
    }

    /// Issue any unary call of the robot's interface.
    ///
    /// `path` is the full method path, e.g.
    /// `/Anki.Vector.external_interface.ExternalInterface/BatteryState`.
    pub async fn unary<Req, Resp>(
        &self,
        path: &'static str,
        message: Req,
    ) -> Result<Resp, VectorError>
    where
        Req: prost::Message + Send + Sync + 'static,
        Resp: prost::Message + Default + Send + Sync + 'static,
    {
        let mut grpc = self.client().await?;
        let codec: ProstCodec<Req, Resp> = ProstCodec::default();
        let response = grpc
            .unary(self.request(message), PathAndQuery::from_static(path), codec)
            .await
            .map_err(status_error)?;
        Ok(response.into_inner())
    }
}

#[async_trait]
impl RobotLink for GrpcLink {
    async fn protocol_version(
        &self,
        client_version: i64,
        min_host_version: i64,
    ) -> Result<HostVersion, VectorError> {
        let response: proto::ProtocolVersionResponse = self
            .unary(
                path::PROTOCOL_VERSION,
                proto::ProtocolVersionRequest {
                    client_version,
                    min_host_version,
                },
            )
            .await?;
        Ok(HostVersion {
            supported: response.result == proto::PROTOCOL_VERSION_SUCCESS,
            host_version: response.host_version,
        })
    }

    async fn initialize_session(&self, info: &ClientInfo) -> Result<(), VectorError> {
        let _: proto::Ignored = self
            .unary(
                path::SDK_INITIALIZATION,
                proto::SdkInitializationRequest {
                    sdk_module_version: info.module_version.clone(),
                    python_version: info.runtime_version.clone(),
                    python_implementation: info.runtime_implementation.clone(),
                    os_version: info.os_version.clone(),
                    cpu_version: info.cpu_version.clone(),
                },
            )
            .await?;
        Ok(())
    }

    async fn behavior_control(
        &self,
        outgoing: ControlRequests,
    ) -> Result<ControlEvents, VectorError> {
        let mut grpc = self.client().await?;
        let codec: ProstCodec<proto::BehaviorControlRequest, proto::BehaviorControlResponse> =
            ProstCodec::default();
        let response = grpc
            .streaming(
                self.request(outgoing.map(encode_control)),
                PathAndQuery::from_static(path::BEHAVIOR_CONTROL),
                codec,
            )
            .await
            .map_err(status_error)?;
        Ok(response
            .into_inner()
            .map(|received| received.map(decode_control).map_err(status_error))
            .boxed())
    }

    async fn cancel_action(&self, id_tag: u32) -> Result<(), VectorError> {
        let _: proto::Ignored = self
            .unary(
                path::CANCEL_ACTION_BY_ID_TAG,
                proto::CancelActionByIdTagRequest { id_tag },
            )
            .await?;
        Ok(())
    }

    async fn cancel_behavior(&self) -> Result<(), VectorError> {
        let _: proto::Ignored = self
            .unary(path::CANCEL_BEHAVIOR, proto::CancelBehaviorRequest {})
            .await?;
        Ok(())
    }

    async fn close(&self) {
        // Dropping the last clone of the channel tears the connection down.
        if self.lock().take().is_some() {
            debug!("grpc channel closed");
        }
    }
}

/// Translate a transport status into the connection's error taxonomy.
pub fn status_error(status: Status) -> VectorError {
    let message = status.message().to_string();
    match status.code() {
        Code::Unauthenticated => VectorError::Unauthenticated(message),
        Code::Unavailable => VectorError::Unavailable(message),
        Code::Unimplemented => VectorError::Unimplemented(message),
        Code::DeadlineExceeded => VectorError::Timeout(message),
        Code::Cancelled => VectorError::StreamClosed(message),
        code => VectorError::Remote {
            code: i32::from(code),
            message,
        },
    }
}

fn encode_control(msg: ControlMessage) -> proto::BehaviorControlRequest {
    use proto::behavior_control_request::RequestType;

    let request_type = match msg {
        ControlMessage::Request(priority) => match priority.wire_value() {
            Some(priority) => RequestType::ControlRequest(proto::ControlRequest { priority }),
            None => RequestType::ControlRelease(proto::ControlRelease {}),
        },
        ControlMessage::Release => RequestType::ControlRelease(proto::ControlRelease {}),
    };
    proto::BehaviorControlRequest {
        request_type: Some(request_type),
    }
}

fn decode_control(response: proto::BehaviorControlResponse) -> ControlEvent {
    use proto::behavior_control_response::ResponseType;

    match response.response_type {
        Some(ResponseType::ControlGrantedResponse(_)) => ControlEvent::Granted,
        Some(ResponseType::ControlLostEvent(_)) => ControlEvent::Lost,
        Some(ResponseType::KeepAlive(_)) => ControlEvent::KeepAlive,
        Some(ResponseType::ReservedControlLostEvent(_)) => ControlEvent::ReservedLost,
        None => ControlEvent::Unknown,
    }
}
