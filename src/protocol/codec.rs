use crate::error::TunnelError;
use crate::protocol::Envelope;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Upper bound on a single wire frame. Large response chunks fit comfortably;
/// anything bigger is a protocol violation.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

pub fn b64_encode(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

pub fn b64_decode(text: &str) -> Result<Vec<u8>, TunnelError> {
    BASE64
        .decode(text.as_bytes())
        .map_err(|e| TunnelError::Internal(format!("bad base64 payload: {}", e)))
}

/// Serialize a hello or envelope as one newline-terminated JSON text frame.
pub fn encode<T: Serialize>(item: &T) -> Result<String, TunnelError> {
    let mut text = serde_json::to_string(item)
        .map_err(|e| TunnelError::Internal(format!("encode failed: {}", e)))?;
    text.push('\n');
    Ok(text)
}

/// Parse one frame. Rejects frames over [`MAX_FRAME_BYTES`]; tolerates a
/// trailing newline and unknown fields.
pub fn decode<T: DeserializeOwned>(text: &str) -> Result<T, TunnelError> {
    if text.len() > MAX_FRAME_BYTES {
        return Err(TunnelError::InvalidHello(format!(
            "frame of {} bytes exceeds cap",
            text.len()
        )));
    }
    serde_json::from_str(text.trim_end_matches(['\r', '\n']))
        .map_err(|e| TunnelError::InvalidHello(format!("malformed frame: {}", e)))
}

/// Extract the raw bytes out of a `data` envelope.
///
/// The canonical shape is `{"data": "<base64>"}`, but peers have been seen
/// sending a bare base64 string or a raw JSON byte array; all three decode.
pub fn data_bytes(envelope: &Envelope) -> Result<Vec<u8>, TunnelError> {
    let value = envelope
        .data
        .as_ref()
        .ok_or_else(|| TunnelError::Internal("data frame without payload".into()))?;

    match value {
        serde_json::Value::Object(map) => match map.get("data") {
            Some(serde_json::Value::String(s)) => b64_decode(s),
            Some(serde_json::Value::Array(items)) => array_bytes(items),
            _ => Err(TunnelError::Internal("data frame payload missing".into())),
        },
        serde_json::Value::String(s) => b64_decode(s),
        serde_json::Value::Array(items) => array_bytes(items),
        _ => Err(TunnelError::Internal("unrecognized data payload shape".into())),
    }
}

fn array_bytes(items: &[serde_json::Value]) -> Result<Vec<u8>, TunnelError> {
    items
        .iter()
        .map(|v| {
            v.as_u64()
                .filter(|n| *n <= u8::MAX as u64)
                .map(|n| n as u8)
                .ok_or_else(|| TunnelError::Internal("byte array element out of range".into()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ClientHello, MessageType};

    #[test]
    fn test_encode_terminates_with_newline() {
        let text = encode(&Envelope::ping()).unwrap();
        assert!(text.ends_with('\n'));
        assert!(!text[..text.len() - 1].contains('\n'));
    }

    #[test]
    fn test_decode_strips_newline() {
        let env: Envelope = decode("{\"type\":\"end\",\"stream_id\":\"s\"}\r\n").unwrap();
        assert_eq!(env.kind, MessageType::End);
        assert_eq!(env.stream_id.as_deref(), Some("s"));
    }

    #[test]
    fn test_envelope_roundtrip_identity() {
        let original = Envelope::data("s-9", b"\x00\xffbinary\r\n");
        let text = encode(&original).unwrap();
        let back: Envelope = decode(&text).unwrap();
        assert_eq!(back.kind, MessageType::Data);
        assert_eq!(data_bytes(&back).unwrap(), b"\x00\xffbinary\r\n");
    }

    #[test]
    fn test_data_bytes_accepts_raw_array() {
        let env: Envelope =
            decode(r#"{"type":"data","stream_id":"s","data":[104,105]}"#).unwrap();
        assert_eq!(data_bytes(&env).unwrap(), b"hi");
    }

    #[test]
    fn test_data_bytes_accepts_nested_array() {
        let env: Envelope =
            decode(r#"{"type":"data","stream_id":"s","data":{"data":[104,105]}}"#).unwrap();
        assert_eq!(data_bytes(&env).unwrap(), b"hi");
    }

    #[test]
    fn test_frame_cap_enforced() {
        let huge = format!("{{\"id\":\"{}\"}}", "a".repeat(MAX_FRAME_BYTES));
        assert!(decode::<ClientHello>(&huge).is_err());
    }

    #[test]
    fn test_malformed_frame_rejected() {
        assert!(decode::<Envelope>("{not json").is_err());
    }
}
