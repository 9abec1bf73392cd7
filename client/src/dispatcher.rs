//! Request dispatcher.
//!
//! Turns one inbound envelope into one call against the local service and, at
//! most, one outbound frame.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use dotunnel_shared::codec::{self, BodyKind};
use dotunnel_shared::{Error as ProtocolError, RequestEnvelope, ResponseEnvelope};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::redirect::Policy;
use reqwest::Method;
use tracing::{debug, error, info, warn};

use crate::error::TunnelError;
use crate::reporter::{Outcome, StatusReporter};

/// Inbound headers that describe the relay hop rather than the request
const SKIPPED_HEADERS: &[&str] = &[
    "host",
    "connection",
    "keep-alive",
    "upgrade",
    "transfer-encoding",
    "content-length",
    "accept-encoding",
];

/// Result of dispatching a single envelope
#[derive(Debug)]
pub enum Reply {
    /// Serialized response envelope, within the frame ceiling
    Frame(String),
    /// Connection-upgrade request, not forwarded
    Skipped,
}

pub struct Dispatcher {
    client: reqwest::Client,
    local_base: String,
    reporter: Arc<dyn StatusReporter>,
    debug: bool,
}

impl Dispatcher {
    pub fn new(
        local_base: impl Into<String>,
        reporter: Arc<dyn StatusReporter>,
        debug: bool,
    ) -> Result<Self, TunnelError> {
        let client = reqwest::Client::builder()
            .redirect(Policy::none())
            .build()
            .map_err(|e| TunnelError::Config(format!("HTTP client: {}", e)))?;

        Ok(Self {
            client,
            local_base: local_base.into().trim_end_matches('/').to_string(),
            reporter,
            debug,
        })
    }

    /// Decode and handle one raw frame. Every failure is logged here and
    /// never reaches the connection.
    pub async fn handle_frame(&self, raw: &str) -> Option<String> {
        if self.debug {
            debug!("Raw message data: {}", raw);
        }

        let request = match codec::decode(raw) {
            Ok(request) => request,
            Err(e) => {
                warn!("Skipping inbound frame: {}", e);
                return None;
            }
        };

        self.handle(request).await
    }

    pub async fn handle(&self, request: RequestEnvelope) -> Option<String> {
        let id = request.id.clone();

        match self.dispatch(request).await {
            Ok(Reply::Frame(frame)) => {
                debug!("Handled request {}", id);
                Some(frame)
            }
            Ok(Reply::Skipped) => None,
            Err(TunnelError::Protocol(ProtocolError::Oversize { size, limit, .. })) => {
                error!(
                    "Response {} dropped: {} bytes exceeds the {} byte limit. Try to reduce the size of your responses.",
                    id, size, limit
                );
                None
            }
            Err(e @ TunnelError::LocalService { .. }) => {
                error!("{}", e);
                info!("Make sure your local server is running on {}", self.local_base);
                None
            }
            Err(e) => {
                warn!("Error handling request {}: {}", id, e);
                None
            }
        }
    }

    /// Run the local call for one envelope and encode the reply
    pub async fn dispatch(&self, request: RequestEnvelope) -> Result<Reply, TunnelError> {
        if request.is_upgrade() {
            warn!(
                "WebSocket upgrade requests are not supported yet ({})",
                request.path
            );
            return Ok(Reply::Skipped);
        }

        let method_name = request.method();
        let method = Method::from_bytes(method_name.as_bytes())
            .map_err(|_| TunnelError::InvalidMethod(method_name.clone()))?;
        let url = format!("{}{}", self.local_base, request.path);

        let mut builder = self
            .client
            .request(method.clone(), &url)
            .headers(forward_headers(&request.headers));

        if method != Method::GET && method != Method::HEAD {
            let body = match &request.body {
                Some(value) if !value.is_null() => value.to_string(),
                _ => "{}".to_string(),
            };
            builder = builder.body(body);
        }

        let started = Instant::now();
        let response = builder.send().await.map_err(|source| self.local_error(source))?;

        let status = response.status().as_u16();
        let headers = collect_headers(response.headers());
        let kind = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(codec::classify)
            .unwrap_or(BodyKind::Text);

        self.reporter.report(&Outcome {
            id: request.id.clone(),
            timestamp: chrono::Local::now(),
            method: method_name,
            path: request.path.clone(),
            status,
            origin: request.origin().map(String::from),
            latency_ms: started.elapsed().as_millis() as u64,
        });

        if kind.is_binary() {
            debug!("Handling binary response for {}", request.id);
        }
        let bytes = response.bytes().await.map_err(|source| self.local_error(source))?;

        let envelope = ResponseEnvelope {
            id: request.id,
            status,
            headers,
            body: kind.encode(&bytes),
            is_binary: kind.is_binary(),
        };

        Ok(Reply::Frame(codec::encode_response(&envelope)?))
    }

    fn local_error(&self, source: reqwest::Error) -> TunnelError {
        TunnelError::LocalService {
            base: self.local_base.clone(),
            source,
        }
    }
}

fn forward_headers(headers: &BTreeMap<String, String>) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        if SKIPPED_HEADERS.iter().any(|h| name.eq_ignore_ascii_case(h)) {
            continue;
        }
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                map.append(name, value);
            }
            _ => debug!("Dropping invalid header {}", name),
        }
    }
    map
}

fn collect_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut out: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes());
        out.entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert_with(|| value.into_owned());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        http::{header, HeaderMap as AxumHeaders},
        routing::{any, get, post},
        Router,
    };
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use dotunnel_shared::protocol::MAX_ENVELOPE_SIZE;
    use std::sync::Mutex;

    const PNG: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x00, 0xff];

    #[derive(Default)]
    struct Recorder(Mutex<Vec<Outcome>>);

    impl StatusReporter for Recorder {
        fn report(&self, outcome: &Outcome) {
            self.0.lock().unwrap().push(outcome.clone());
        }
    }

    impl Recorder {
        fn outcomes(&self) -> Vec<Outcome> {
            self.0.lock().unwrap().clone()
        }
    }

    async fn spawn_local() -> String {
        let app = Router::new()
            .route("/ping", get(|| async { ([(header::CONTENT_TYPE, "text/plain")], "pong") }))
            .route("/logo.png", get(|| async { ([(header::CONTENT_TYPE, "image/png")], PNG.to_vec()) }))
            .route("/echo", post(|body: String| async move { body }))
            .route(
                "/body-len",
                any(|body: String| async move { ([("x-body-len", body.len().to_string())], "") }),
            )
            .route(
                "/whoami",
                get(|headers: AxumHeaders| async move {
                    let tag = headers
                        .get("x-test")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("none")
                        .to_string();
                    let host = headers
                        .get(header::HOST)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("")
                        .to_string();
                    format!("{} {}", tag, host)
                }),
            )
            .route("/huge", get(|| async { "a".repeat(MAX_ENVELOPE_SIZE) }));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn envelope(id: &str, method: &str, path: &str, headers: &[(&str, &str)]) -> RequestEnvelope {
        RequestEnvelope {
            id: id.into(),
            path: path.into(),
            method: Some(method.into()),
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            body: None,
        }
    }

    fn dispatcher(base: &str) -> (Dispatcher, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let dispatcher = Dispatcher::new(base, recorder.clone(), false).unwrap();
        (dispatcher, recorder)
    }

    fn frame(reply: Reply) -> ResponseEnvelope {
        match reply {
            Reply::Frame(frame) => serde_json::from_str(&frame).unwrap(),
            Reply::Skipped => panic!("expected a frame"),
        }
    }

    #[tokio::test]
    async fn test_text_response() {
        let base = spawn_local().await;
        let (dispatcher, recorder) = dispatcher(&base);

        let req = envelope("1", "GET", "/ping", &[("x-real-ip", "9.9.9.9")]);
        let resp = frame(dispatcher.dispatch(req).await.unwrap());

        assert_eq!(resp.id, "1");
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, "pong");
        assert!(!resp.is_binary);
        assert_eq!(resp.headers.get("content-type").map(String::as_str), Some("text/plain"));

        let outcomes = recorder.outcomes();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].method, "GET");
        assert_eq!(outcomes[0].path, "/ping");
        assert_eq!(outcomes[0].status, 200);
        assert_eq!(outcomes[0].origin.as_deref(), Some("9.9.9.9"));
    }

    #[tokio::test]
    async fn test_binary_response() {
        let base = spawn_local().await;
        let (dispatcher, _) = dispatcher(&base);

        let resp = frame(dispatcher.dispatch(envelope("2", "GET", "/logo.png", &[])).await.unwrap());
        assert!(resp.is_binary);
        assert_eq!(STANDARD.decode(&resp.body).unwrap(), PNG);
    }

    #[tokio::test]
    async fn test_post_body_is_json() {
        let base = spawn_local().await;
        let (dispatcher, _) = dispatcher(&base);

        let mut req = envelope("3", "post", "/echo", &[]);
        req.body = Some(serde_json::json!({"a": 1}));
        let resp = frame(dispatcher.dispatch(req).await.unwrap());
        assert_eq!(resp.body, r#"{"a":1}"#);

        let resp = frame(dispatcher.dispatch(envelope("4", "POST", "/echo", &[])).await.unwrap());
        assert_eq!(resp.body, "{}");
    }

    #[tokio::test]
    async fn test_get_and_head_send_no_body() {
        let base = spawn_local().await;
        let (dispatcher, _) = dispatcher(&base);

        for (id, method, expected) in [("g", "GET", "0"), ("h", "HEAD", "0"), ("p", "PUT", "7")] {
            let mut req = envelope(id, method, "/body-len", &[]);
            req.body = Some(serde_json::json!({"a": 1}));
            let resp = frame(dispatcher.dispatch(req).await.unwrap());
            assert_eq!(resp.headers.get("x-body-len").map(String::as_str), Some(expected), "{}", method);
        }
    }

    #[tokio::test]
    async fn test_headers_forwarded_without_hop_headers() {
        let base = spawn_local().await;
        let (dispatcher, _) = dispatcher(&base);

        let req = envelope(
            "5",
            "GET",
            "/whoami",
            &[("X-Test", "yes"), ("Host", "demo-prxy.example.com")],
        );
        let resp = frame(dispatcher.dispatch(req).await.unwrap());
        assert!(resp.body.starts_with("yes "));
        assert!(!resp.body.contains("demo-prxy"));
    }

    #[tokio::test]
    async fn test_upgrade_is_skipped() {
        // Nothing listens here; a dispatched call would fail
        let (dispatcher, recorder) = dispatcher("http://127.0.0.1:1");

        let req = envelope("6", "GET", "/_next/webpack-hmr", &[("connection", "Upgrade")]);
        assert!(matches!(dispatcher.dispatch(req.clone()).await, Ok(Reply::Skipped)));
        assert!(dispatcher.handle(req).await.is_none());
        assert!(recorder.outcomes().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_local_service() {
        let (dispatcher, recorder) = dispatcher("http://127.0.0.1:1");

        let req = envelope("7", "GET", "/ping", &[]);
        match dispatcher.dispatch(req.clone()).await {
            Err(TunnelError::LocalService { base, .. }) => assert_eq!(base, "http://127.0.0.1:1"),
            other => panic!("expected local service error, got {:?}", other),
        }
        assert!(dispatcher.handle(req).await.is_none());
        assert!(recorder.outcomes().is_empty());
    }

    #[tokio::test]
    async fn test_oversize_response_is_dropped() {
        let base = spawn_local().await;
        let (dispatcher, recorder) = dispatcher(&base);

        let req = envelope("8", "GET", "/huge", &[]);
        assert!(matches!(
            dispatcher.dispatch(req.clone()).await,
            Err(TunnelError::Protocol(ProtocolError::Oversize { .. }))
        ));
        assert!(dispatcher.handle(req).await.is_none());
        assert_eq!(recorder.outcomes().len(), 2);
    }

    #[tokio::test]
    async fn test_malformed_frame_is_skipped() {
        let (dispatcher, recorder) = dispatcher("http://127.0.0.1:1");
        assert!(dispatcher.handle_frame("{not json").await.is_none());
        assert!(dispatcher.handle_frame("{not json").await.is_none());
        assert!(recorder.outcomes().is_empty());
    }
}
