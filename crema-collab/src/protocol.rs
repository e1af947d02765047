//! Wire protocol between Crema servers and clients.
//!
//! Wire format (bincode-encoded envelope, JSON payload):
//! ```text
//! ┌────────────┬──────────┬──────────────────────────────────┐
//! │ frame_type │ id       │ payload                          │
//! │ 1 byte     │ varint   │ JSON: Request | Response |       │
//! │            │          │       CallbackMessage | empty    │
//! └────────────┴──────────┴──────────────────────────────────┘
//! ```
//!
//! A request and its response share the same `id`. Callbacks carry id 0;
//! their order is given by [`CallbackInfo::index`]. Payloads are JSON because
//! row values are dynamic [`serde_json::Value`]s, which bincode cannot carry.

use crema_core::{
    CallbackInfo, CloseReason, DataBaseId, DomainAccessType, DomainLocationInfo, DomainRowInfo,
    ResultBase,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::broadcast::DomainEventKind;
use crate::context::CreateDomain;

/// Frame types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FrameType {
    /// Client → server call
    Request = 1,
    /// Server → client result of a call
    Response = 2,
    /// Server → client notification
    Callback = 3,
    /// Heartbeat ping
    Ping = 4,
    /// Heartbeat pong
    Pong = 5,
}

/// A remote call. `token` is the caller's authentication token; the
/// subscription calls take the connection's peer token instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method")]
pub enum Request {
    // ─── HostService ──────────────────────────────────────────────────
    Subscribe,
    Unsubscribe {
        peer_token: Uuid,
    },
    Login {
        user_id: String,
        password: String,
    },
    Logout {
        token: Uuid,
    },
    IsAlive {
        token: Uuid,
    },
    KickUser {
        token: Uuid,
        user_id: String,
        comment: String,
    },
    BanUser {
        token: Uuid,
        user_id: String,
        comment: String,
    },
    UnbanUser {
        token: Uuid,
        user_id: String,
    },

    // ─── DomainContextService ─────────────────────────────────────────
    SubscribeDomains {
        peer_token: Uuid,
    },
    UnsubscribeDomains {
        peer_token: Uuid,
    },
    GetMetaData {
        token: Uuid,
        #[serde(default)]
        data_base_id: Option<DataBaseId>,
    },
    CreateDomain {
        token: Uuid,
        domain: CreateDomain,
    },
    EnterDomain {
        token: Uuid,
        domain_id: Uuid,
        access_type: DomainAccessType,
    },
    LeaveDomain {
        token: Uuid,
        domain_id: Uuid,
    },
    BeginUserEdit {
        token: Uuid,
        domain_id: Uuid,
        location: DomainLocationInfo,
    },
    EndUserEdit {
        token: Uuid,
        domain_id: Uuid,
    },
    SetUserLocation {
        token: Uuid,
        domain_id: Uuid,
        location: DomainLocationInfo,
    },
    NewRow {
        token: Uuid,
        domain_id: Uuid,
        rows: Vec<DomainRowInfo>,
    },
    SetRow {
        token: Uuid,
        domain_id: Uuid,
        rows: Vec<DomainRowInfo>,
    },
    RemoveRow {
        token: Uuid,
        domain_id: Uuid,
        rows: Vec<DomainRowInfo>,
    },
    SetProperty {
        token: Uuid,
        domain_id: Uuid,
        name: String,
        value: Value,
    },
    Kick {
        token: Uuid,
        domain_id: Uuid,
        user_id: String,
        comment: String,
    },
    SetOwner {
        token: Uuid,
        domain_id: Uuid,
        user_id: String,
    },
    DeleteDomain {
        token: Uuid,
        domain_id: Uuid,
        force: bool,
    },
    DeleteDomains {
        token: Uuid,
        data_base_id: DataBaseId,
    },
}

impl Request {
    pub fn method(&self) -> &'static str {
        match self {
            Request::Subscribe => "Subscribe",
            Request::Unsubscribe { .. } => "Unsubscribe",
            Request::Login { .. } => "Login",
            Request::Logout { .. } => "Logout",
            Request::IsAlive { .. } => "IsAlive",
            Request::KickUser { .. } => "KickUser",
            Request::BanUser { .. } => "BanUser",
            Request::UnbanUser { .. } => "UnbanUser",
            Request::SubscribeDomains { .. } => "SubscribeDomains",
            Request::UnsubscribeDomains { .. } => "UnsubscribeDomains",
            Request::GetMetaData { .. } => "GetMetaData",
            Request::CreateDomain { .. } => "CreateDomain",
            Request::EnterDomain { .. } => "EnterDomain",
            Request::LeaveDomain { .. } => "LeaveDomain",
            Request::BeginUserEdit { .. } => "BeginUserEdit",
            Request::EndUserEdit { .. } => "EndUserEdit",
            Request::SetUserLocation { .. } => "SetUserLocation",
            Request::NewRow { .. } => "NewRow",
            Request::SetRow { .. } => "SetRow",
            Request::RemoveRow { .. } => "RemoveRow",
            Request::SetProperty { .. } => "SetProperty",
            Request::Kick { .. } => "Kick",
            Request::SetOwner { .. } => "SetOwner",
            Request::DeleteDomain { .. } => "DeleteDomain",
            Request::DeleteDomains { .. } => "DeleteDomains",
        }
    }
}

/// Result of a call as it travels on the wire.
pub type Response = ResultBase<Value>;

/// Server → client notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "callback", content = "args")]
pub enum Callback {
    /// An event of the domain context.
    Domain(DomainEventKind),
    /// An authentication of this connection ended.
    AuthenticationExpired { token: Uuid, reason: CloseReason },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackMessage {
    pub info: CallbackInfo,
    pub callback: Callback,
}

/// One message on the socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub frame_type: FrameType,
    pub id: u64,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn request(id: u64, request: &Request) -> Result<Self, ProtocolError> {
        Self::with_payload(FrameType::Request, id, request)
    }

    pub fn response(id: u64, response: &Response) -> Result<Self, ProtocolError> {
        Self::with_payload(FrameType::Response, id, response)
    }

    pub fn callback(message: &CallbackMessage) -> Result<Self, ProtocolError> {
        Self::with_payload(FrameType::Callback, 0, message)
    }

    pub fn ping(id: u64) -> Self {
        Self {
            frame_type: FrameType::Ping,
            id,
            payload: Vec::new(),
        }
    }

    pub fn pong(id: u64) -> Self {
        Self {
            frame_type: FrameType::Pong,
            id,
            payload: Vec::new(),
        }
    }

    fn with_payload<T: Serialize>(frame_type: FrameType, id: u64, value: &T) -> Result<Self, ProtocolError> {
        let payload =
            serde_json::to_vec(value).map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        Ok(Self {
            frame_type,
            id,
            payload,
        })
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(frame)
    }

    /// Parse a request payload.
    pub fn to_request(&self) -> Result<Request, ProtocolError> {
        self.payload_as(FrameType::Request)
    }

    /// Parse a response payload.
    pub fn to_response(&self) -> Result<Response, ProtocolError> {
        self.payload_as(FrameType::Response)
    }

    /// Parse a callback payload.
    pub fn to_callback(&self) -> Result<CallbackMessage, ProtocolError> {
        self.payload_as(FrameType::Callback)
    }

    fn payload_as<T: DeserializeOwned>(&self, expected: FrameType) -> Result<T, ProtocolError> {
        if self.frame_type != expected {
            return Err(ProtocolError::InvalidFrameType(self.frame_type));
        }
        serde_json::from_slice(&self.payload).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    InvalidFrameType(FrameType),
    ConnectionFailed(String),
    ConnectionClosed,
    Timeout,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidFrameType(t) => write!(f, "Unexpected frame type {t:?}"),
            Self::ConnectionFailed(e) => write!(f, "Connection failed: {e}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Request timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}
