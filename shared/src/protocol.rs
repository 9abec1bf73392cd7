//! Envelope types for relay communication.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

/// Maximum serialized size of an outbound envelope (1 MiB, inclusive)
pub const MAX_ENVELOPE_SIZE: usize = 1024 * 1024;

/// Close code sent when a frame exceeds the peer's size limit
pub const CLOSE_MESSAGE_TOO_BIG: u16 = 1009;

/// Close code for a client-initiated shutdown
pub const CLOSE_NORMAL: u16 = 1000;

/// Handshake header identifying the client application
pub const CLIENT_HEADER: &str = "x-dotunnel-client";

/// Request forwarded by the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub id: String,
    pub path: String,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<serde_json::Value>,
}

impl RequestEnvelope {
    /// Upper-cased method, GET when absent or empty
    pub fn method(&self) -> String {
        match self.method.as_deref().map(str::trim) {
            Some(m) if !m.is_empty() => m.to_ascii_uppercase(),
            _ => "GET".to_string(),
        }
    }

    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// True when the request asks for a connection upgrade (e.g. WebSocket HMR)
    pub fn is_upgrade(&self) -> bool {
        self.header("connection")
            .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("upgrade")))
            .unwrap_or(false)
    }

    /// Client address as reported by the relay
    pub fn origin(&self) -> Option<&str> {
        self.header("x-real-ip").or_else(|| {
            self.header("x-forwarded-for")
                .and_then(|v| v.split(',').next())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        })
    }
}

/// Response returned to the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope {
    pub id: String,
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    /// Base64 when `is_binary`, raw text otherwise
    pub body: String,
    pub is_binary: bool,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(headers: &[(&str, &str)]) -> RequestEnvelope {
        RequestEnvelope {
            id: "1".into(),
            path: "/".into(),
            method: None,
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            body: None,
        }
    }

    #[test]
    fn test_method_defaults_to_get() {
        let mut req = request(&[]);
        assert_eq!(req.method(), "GET");
        req.method = Some(String::new());
        assert_eq!(req.method(), "GET");
        req.method = Some("post".into());
        assert_eq!(req.method(), "POST");
    }

    #[test]
    fn test_upgrade_detection() {
        assert!(request(&[("connection", "Upgrade")]).is_upgrade());
        assert!(request(&[("Connection", "keep-alive, Upgrade")]).is_upgrade());
        assert!(!request(&[("connection", "keep-alive")]).is_upgrade());
        assert!(!request(&[("upgrade", "websocket")]).is_upgrade());
    }

    #[test]
    fn test_origin_prefers_real_ip() {
        let req = request(&[("x-real-ip", "1.2.3.4"), ("x-forwarded-for", "5.6.7.8")]);
        assert_eq!(req.origin(), Some("1.2.3.4"));
        let req = request(&[("X-Forwarded-For", "5.6.7.8, 10.0.0.1")]);
        assert_eq!(req.origin(), Some("5.6.7.8"));
        assert_eq!(request(&[]).origin(), None);
    }

    #[test]
    fn test_null_headers_and_body() {
        let req: RequestEnvelope =
            serde_json::from_str(r#"{"id":"9","path":"/x","headers":null,"body":null}"#).unwrap();
        assert!(req.headers.is_empty());
        assert_eq!(req.body, None);
        assert_eq!(req.method(), "GET");
    }

    #[test]
    fn test_response_wire_names() {
        let resp = ResponseEnvelope {
            id: "1".into(),
            status: 200,
            headers: BTreeMap::new(),
            body: "pong".into(),
            is_binary: false,
        };
        let json: serde_json::Value = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["isBinary"], false);
        assert_eq!(json["body"], "pong");
        assert_eq!(json["status"], 200);
    }
}
