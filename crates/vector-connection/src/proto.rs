//! Wire messages of the robot's `ExternalInterface` service used by the
//! connection core.
//!
//! Only the handshake, behaviour-control and abort messages are described
//! here; prost skips any field the robot sends that is not listed.

pub const PROTOCOL_VERSION_CURRENT: i64 = 5;
pub const PROTOCOL_VERSION_MINIMUM: i64 = 0;

/// `ProtocolVersionResponse.Result.SUCCESS`.
pub const PROTOCOL_VERSION_SUCCESS: i32 = 1;

/// First and last id tags reserved for client-initiated actions.
pub const FIRST_SDK_TAG: u32 = 2_000_001;
pub const LAST_SDK_TAG: u32 = 3_000_000;

pub mod path {
    pub const PROTOCOL_VERSION: &str =
        "/Anki.Vector.external_interface.ExternalInterface/ProtocolVersion";
    pub const SDK_INITIALIZATION: &str =
        "/Anki.Vector.external_interface.ExternalInterface/SDKInitialization";
    pub const BEHAVIOR_CONTROL: &str =
        "/Anki.Vector.external_interface.ExternalInterface/BehaviorControl";
    pub const CANCEL_ACTION_BY_ID_TAG: &str =
        "/Anki.Vector.external_interface.ExternalInterface/CancelActionByIdTag";
    pub const CANCEL_BEHAVIOR: &str =
        "/Anki.Vector.external_interface.ExternalInterface/CancelBehavior";
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtocolVersionRequest {
    #[prost(int64, tag = "1")]
    pub client_version: i64,
    #[prost(int64, tag = "2")]
    pub min_host_version: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtocolVersionResponse {
    #[prost(int32, tag = "1")]
    pub result: i32,
    #[prost(int64, tag = "2")]
    pub host_version: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SdkInitializationRequest {
    #[prost(string, tag = "1")]
    pub sdk_module_version: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub python_version: ::prost::alloc::string::String,
    #[prost(string, tag = "3")]
    pub python_implementation: ::prost::alloc::string::String,
    #[prost(string, tag = "4")]
    pub os_version: ::prost::alloc::string::String,
    #[prost(string, tag = "5")]
    pub cpu_version: ::prost::alloc::string::String,
}

/// Any response whose content the core does not inspect.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Ignored {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ControlRequest {
    #[prost(int32, tag = "1")]
    pub priority: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ControlRelease {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BehaviorControlRequest {
    #[prost(oneof = "behavior_control_request::RequestType", tags = "1, 2")]
    pub request_type: ::core::option::Option<behavior_control_request::RequestType>,
}

pub mod behavior_control_request {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum RequestType {
        #[prost(message, tag = "1")]
        ControlRelease(super::ControlRelease),
        #[prost(message, tag = "2")]
        ControlRequest(super::ControlRequest),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BehaviorControlResponse {
    #[prost(oneof = "behavior_control_response::ResponseType", tags = "1, 2, 3, 4")]
    pub response_type: ::core::option::Option<behavior_control_response::ResponseType>,
}

pub mod behavior_control_response {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum ResponseType {
        #[prost(message, tag = "1")]
        ControlGrantedResponse(super::Ignored),
        #[prost(message, tag = "2")]
        ControlLostEvent(super::Ignored),
        #[prost(message, tag = "3")]
        KeepAlive(super::Ignored),
        #[prost(message, tag = "4")]
        ReservedControlLostEvent(super::Ignored),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CancelActionByIdTagRequest {
    #[prost(uint32, tag = "1")]
    pub id_tag: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CancelBehaviorRequest {}
