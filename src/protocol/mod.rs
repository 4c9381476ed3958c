pub mod codec;

use serde::{Deserialize, Serialize};

/// Stream protocol tag carried in `init` payloads. HTTP request/response is
/// the only protocol the router speaks today.
pub const PROTOCOL_HTTP: &str = "http";

/// First message from the client on a fresh control connection.
///
/// Hellos ride on the wire as bare JSON objects, never wrapped in an
/// [`Envelope`]. Everything after the hello exchange is envelope-framed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientHello {
    #[serde(default)]
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_domain: Option<String>,

    #[serde(default)]
    pub client_type: ClientType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<SecretKey>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconnect_token: Option<ReconnectToken>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientType {
    Auth,
    #[default]
    Anonymous,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretKey {
    pub key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectToken {
    pub token: String,
}

/// First message from the server, answering the [`ClientHello`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerHello {
    #[serde(rename = "type")]
    pub kind: ServerHelloType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_domain: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconnect_token: Option<ReconnectToken>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerHelloType {
    Success,
    SubDomainInUse,
    InvalidSubDomain,
    AuthFailed,
    Error,
}

impl ServerHello {
    pub fn success(sub_domain: String, hostname: String, public_url: String) -> Self {
        Self {
            kind: ServerHelloType::Success,
            sub_domain: Some(sub_domain),
            hostname: Some(hostname),
            public_url: Some(public_url),
            client_id: None,
            reconnect_token: None,
            error: None,
        }
    }

    pub fn failure(kind: ServerHelloType, error: impl Into<String>) -> Self {
        Self {
            kind,
            sub_domain: None,
            hostname: None,
            public_url: None,
            client_id: None,
            reconnect_token: None,
            error: Some(error.into()),
        }
    }
}

/// Envelope for all post-hello traffic, in both directions.
///
/// `data` is an opaque JSON value whose shape depends on `type`:
/// `init` carries [`InitPayload`], `data` carries [`DataPayload`], and
/// `end`/`ping`/`pong` carry nothing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Init,
    Data,
    End,
    Ping,
    Pong,
    /// Anything a newer peer might send. Logged and ignored on receipt.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitPayload {
    pub stream_id: String,
    pub protocol: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataPayload {
    /// Base64-encoded bytes. Base64 is mandatory on the encode side so that
    /// arbitrary octets survive the JSON text transport.
    pub data: String,
}

impl Envelope {
    pub fn init(stream_id: &str, protocol: &str) -> Self {
        let payload = InitPayload {
            stream_id: stream_id.to_string(),
            protocol: protocol.to_string(),
        };
        Self {
            kind: MessageType::Init,
            stream_id: Some(stream_id.to_string()),
            data: serde_json::to_value(payload).ok(),
        }
    }

    pub fn data(stream_id: &str, bytes: &[u8]) -> Self {
        Self {
            kind: MessageType::Data,
            stream_id: Some(stream_id.to_string()),
            data: serde_json::to_value(DataPayload {
                data: codec::b64_encode(bytes),
            })
            .ok(),
        }
    }

    pub fn end(stream_id: &str) -> Self {
        Self {
            kind: MessageType::End,
            stream_id: Some(stream_id.to_string()),
            data: None,
        }
    }

    pub fn ping() -> Self {
        Self {
            kind: MessageType::Ping,
            stream_id: None,
            data: None,
        }
    }

    pub fn pong() -> Self {
        Self {
            kind: MessageType::Pong,
            stream_id: None,
            data: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_hello_roundtrip() {
        let hello = ClientHello {
            id: "c1".into(),
            sub_domain: Some("demo".into()),
            client_type: ClientType::Auth,
            client_version: Some("0.1.0".into()),
            secret_key: Some(SecretKey { key: "s3cret".into() }),
            reconnect_token: None,
            password: Some("letmein".into()),
        };
        let text = serde_json::to_string(&hello).unwrap();
        let back: ClientHello = serde_json::from_str(&text).unwrap();
        assert_eq!(back.sub_domain.as_deref(), Some("demo"));
        assert_eq!(back.client_type, ClientType::Auth);
        assert_eq!(back.secret_key.unwrap().key, "s3cret");
    }

    #[test]
    fn test_client_hello_tolerates_unknown_fields() {
        let text = r#"{"id":"x","client_type":"anonymous","future_field":{"a":1}}"#;
        let hello: ClientHello = serde_json::from_str(text).unwrap();
        assert_eq!(hello.client_type, ClientType::Anonymous);
        assert!(hello.sub_domain.is_none());
    }

    #[test]
    fn test_server_hello_variants() {
        for (kind, wire) in [
            (ServerHelloType::Success, "success"),
            (ServerHelloType::SubDomainInUse, "sub_domain_in_use"),
            (ServerHelloType::InvalidSubDomain, "invalid_sub_domain"),
            (ServerHelloType::AuthFailed, "auth_failed"),
            (ServerHelloType::Error, "error"),
        ] {
            let hello = ServerHello::failure(kind, "why");
            let text = serde_json::to_string(&hello).unwrap();
            assert!(text.contains(&format!(r#""type":"{}""#, wire)), "{}", text);
            let back: ServerHello = serde_json::from_str(&text).unwrap();
            assert_eq!(back.kind, kind);
        }
    }

    #[test]
    fn test_envelope_init_shape() {
        let env = Envelope::init("st-1", PROTOCOL_HTTP);
        let text = serde_json::to_string(&env).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "init");
        assert_eq!(value["stream_id"], "st-1");
        assert_eq!(value["data"]["protocol"], "http");
    }

    #[test]
    fn test_envelope_unknown_type_decodes() {
        let env: Envelope = serde_json::from_str(r#"{"type":"frobnicate"}"#).unwrap();
        assert_eq!(env.kind, MessageType::Unknown);
    }

    #[test]
    fn test_ping_pong_have_no_payload() {
        let text = serde_json::to_string(&Envelope::ping()).unwrap();
        assert_eq!(text, r#"{"type":"ping"}"#);
        let text = serde_json::to_string(&Envelope::pong()).unwrap();
        assert_eq!(text, r#"{"type":"pong"}"#);
    }
}
