//! Typed control messages and their JSON envelope
//!
//! Every frame payload is `{"Type": <kind>, "Payload": {...}}` with
//! PascalCase field names. Clients are lax about optional fields and send
//! `null` or omit them, so all request fields fall back to their defaults.

use super::{ErrorCode, ProtocolError};
use crate::tunnel::encode_frame;
use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// `Auth` payload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct AuthRequest {
    #[serde(deserialize_with = "null_as_default")]
    pub version: String,
    #[serde(deserialize_with = "null_as_default")]
    pub mm_version: String,
    #[serde(deserialize_with = "null_as_default")]
    pub user: String,
    #[serde(deserialize_with = "null_as_default")]
    pub password: String,
    #[serde(rename = "OS", deserialize_with = "null_as_default")]
    pub os: String,
    #[serde(deserialize_with = "null_as_default")]
    pub arch: String,
    /// Sent by reconnecting clients; the broker always issues a fresh id
    #[serde(deserialize_with = "null_as_default")]
    pub client_id: String,
}

/// `ReqTunnel` payload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct TunnelRequest {
    #[serde(deserialize_with = "null_as_default")]
    pub req_id: String,
    #[serde(deserialize_with = "null_as_default")]
    pub protocol: String,
    #[serde(deserialize_with = "null_as_default")]
    pub hostname: String,
    #[serde(deserialize_with = "null_as_default")]
    pub subdomain: String,
    #[serde(deserialize_with = "null_as_default")]
    pub http_auth: String,
    #[serde(deserialize_with = "null_as_default")]
    pub remote_port: u16,
}

/// `RegProxy` payload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RegProxyRequest {
    #[serde(deserialize_with = "null_as_default")]
    pub client_id: String,
}

/// Client-to-broker messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Auth(AuthRequest),
    ReqTunnel(TunnelRequest),
    RegProxy(RegProxyRequest),
    Ping,
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "Type")]
    kind: String,
    #[serde(rename = "Payload", default)]
    payload: Value,
}

impl Request {
    /// Decode a frame payload
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let envelope: Envelope = serde_json::from_slice(payload)
            .map_err(|e| ProtocolError::MalformedJson(e.to_string()))?;

        let body = match envelope.payload {
            Value::Null => Value::Object(Default::default()),
            other => other,
        };

        match envelope.kind.as_str() {
            "Auth" => Ok(Request::Auth(from_body(body)?)),
            "ReqTunnel" => Ok(Request::ReqTunnel(from_body(body)?)),
            "RegProxy" => Ok(Request::RegProxy(from_body(body)?)),
            "Ping" => Ok(Request::Ping),
            other => Err(ProtocolError::UnknownRequest(other.to_string())),
        }
    }

    /// Message kind, for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Request::Auth(_) => "Auth",
            Request::ReqTunnel(_) => "ReqTunnel",
            Request::RegProxy(_) => "RegProxy",
            Request::Ping => "Ping",
        }
    }
}

fn from_body<T: for<'de> Deserialize<'de>>(body: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(body).map_err(|e| ProtocolError::MalformedJson(e.to_string()))
}

/// Empty payload object (`{}`)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Empty {}

/// `AuthResp` payload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct AuthResponse {
    pub version: String,
    pub mm_version: String,
    pub client_id: String,
    pub error: String,
}

/// `NewTunnel` payload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct NewTunnel {
    pub req_id: String,
    pub url: String,
    pub protocol: String,
    pub error: String,
}

/// `StartProxy` payload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct StartProxy {
    pub url: String,
    pub client_addr: String,
}

/// Broker-to-client messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "Type", content = "Payload")]
pub enum Response {
    AuthResp(AuthResponse),
    NewTunnel(NewTunnel),
    StartProxy(StartProxy),
    ReqProxy(Empty),
    Pong(Empty),
}

impl Response {
    pub fn auth_ok(client_id: impl Into<String>) -> Self {
        Response::AuthResp(AuthResponse {
            version: super::PROTOCOL_VERSION.to_string(),
            mm_version: super::MM_VERSION.to_string(),
            client_id: client_id.into(),
            error: ErrorCode::Success.message().to_string(),
        })
    }

    pub fn auth_error(error: impl Into<String>) -> Self {
        Response::AuthResp(AuthResponse {
            version: super::PROTOCOL_VERSION.to_string(),
            mm_version: super::MM_VERSION.to_string(),
            client_id: String::new(),
            error: error.into(),
        })
    }

    pub fn new_tunnel(req_id: &str, url: &str, protocol: &str) -> Self {
        Response::NewTunnel(NewTunnel {
            req_id: req_id.to_string(),
            url: url.to_string(),
            protocol: protocol.to_string(),
            error: ErrorCode::Success.message().to_string(),
        })
    }

    pub fn tunnel_error(req_id: &str, error: impl Into<String>) -> Self {
        Response::NewTunnel(NewTunnel {
            req_id: req_id.to_string(),
            error: error.into(),
            ..Default::default()
        })
    }

    pub fn start_proxy(url: &str, client_addr: &str) -> Self {
        Response::StartProxy(StartProxy {
            url: url.to_string(),
            client_addr: client_addr.to_string(),
        })
    }

    pub fn req_proxy() -> Self {
        Response::ReqProxy(Empty {})
    }

    pub fn pong() -> Self {
        Response::Pong(Empty {})
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Response::AuthResp(_) => "AuthResp",
            Response::NewTunnel(_) => "NewTunnel",
            Response::StartProxy(_) => "StartProxy",
            Response::ReqProxy(_) => "ReqProxy",
            Response::Pong(_) => "Pong",
        }
    }

    /// Serialize into a complete wire frame
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let json =
            serde_json::to_vec(self).map_err(|e| ProtocolError::MalformedJson(e.to_string()))?;
        Ok(encode_frame(&json))
    }

    /// Parse a response payload (client side, used by tests and tooling)
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(payload).map_err(|e| ProtocolError::MalformedJson(e.to_string()))
    }
}
