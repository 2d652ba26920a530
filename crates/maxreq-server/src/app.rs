//! Built-in HTTP applications.
//!
//! Each accepted connection carries exactly one request: hyper serves it with
//! keep-alive disabled, so the connection closes once the response is written.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::{Bytes, HttpBody},
    extract::{Request, State},
    http::{header, HeaderMap, Method, Uri, Version},
    middleware::{self, Next},
    response::{Json, Response},
    Extension, Router,
};
use chrono::Utc;
use clap::ValueEnum;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use maxreq_handoff::{Connection, ConnectionContext, ConnectionHandler, HandlerError};
use serde::Serialize;
use tower::Service;
use tracing::{debug, warn};

use crate::access_log::{AccessEntry, AccessLog};

const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Which built-in application answers requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AppKind {
    /// JSON describing the serving process.
    #[default]
    Identity,
    /// The request, as plain text.
    Echo,
}

#[derive(Debug, Clone, Copy)]
struct Process {
    pid: u32,
    generation: u64,
}

#[derive(Debug, Serialize)]
struct Identity {
    pid: u32,
    generation: u64,
    request: u64,
    listener: String,
}

async fn identity(
    State(process): State<Process>,
    Extension(context): Extension<ConnectionContext>,
    _body: Bytes,
) -> Json<Identity> {
    Json(Identity {
        pid: process.pid,
        generation: process.generation,
        request: context.sequence,
        listener: context.listener,
    })
}

async fn echo(method: Method, uri: Uri, version: Version, headers: HeaderMap, body: Bytes) -> String {
    let mut out = format!("{method} {uri} {version:?}\r\n");
    for (name, value) in &headers {
        out.push_str(name.as_str());
        out.push_str(": ");
        out.push_str(&String::from_utf8_lossy(value.as_bytes()));
        out.push_str("\r\n");
    }
    out.push_str("\r\n");
    out.push_str(&String::from_utf8_lossy(&body));
    out
}

/// Append one combined-format line per request once its response is ready.
async fn record_access(State(log): State<Arc<AccessLog>>, request: Request, next: Next) -> Response {
    let host = request
        .extensions()
        .get::<ConnectionContext>()
        .map_or_else(|| "-".to_string(), |context| context.peer.host());
    let request_line = format!("{} {} {:?}", request.method(), request.uri(), request.version());
    let (referer, user_agent) = {
        let header_value = |name: header::HeaderName| {
            request
                .headers()
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        };
        (header_value(header::REFERER), header_value(header::USER_AGENT))
    };

    let response = next.run(request).await;

    let bytes = response.body().size_hint().exact().unwrap_or(0);
    let entry = AccessEntry {
        host,
        time: Utc::now(),
        request_line: &request_line,
        status: response.status().as_u16(),
        bytes: usize::try_from(bytes).unwrap_or(usize::MAX),
        referer: referer.as_deref(),
        user_agent: user_agent.as_deref(),
    };
    if let Err(e) = log.record(&entry).await {
        warn!(error = %e, path = %log.path().display(), "Failed to write access log");
    }
    response
}

/// Router for `kind`, logging to `access_log` when one is configured.
///
/// Handlers expect a [`ConnectionContext`] in the request extensions.
pub fn router(kind: AppKind, access_log: Option<Arc<AccessLog>>) -> Router {
    let process = Process {
        pid: std::process::id(),
        generation: maxreq_handoff::current_generation(),
    };
    let router = match kind {
        AppKind::Identity => Router::new().fallback(identity),
        AppKind::Echo => Router::new().fallback(echo),
    }
    .with_state(process);

    match access_log {
        Some(log) => router.layer(middleware::from_fn_with_state(log, record_access)),
        None => router,
    }
}

/// Connection handler serving one of the built-in applications.
pub struct HttpApp {
    router: Router,
}

impl HttpApp {
    pub fn new(kind: AppKind, access_log: Option<Arc<AccessLog>>) -> Self {
        Self {
            router: router(kind, access_log),
        }
    }
}

impl ConnectionHandler for HttpApp {
    async fn handle(&self, connection: Connection, context: ConnectionContext) -> Result<(), HandlerError> {
        let router = self.router.clone();
        let service = service_fn(move |mut request: hyper::Request<Incoming>| {
            request.extensions_mut().insert(context.clone());
            let mut router = router.clone();
            router.call(request)
        });

        let mut builder = http1::Builder::new();
        builder
            .keep_alive(false)
            .timer(TokioTimer::new())
            .header_read_timeout(HEADER_READ_TIMEOUT);
        builder.serve_connection(TokioIo::new(connection), service).await?;

        debug!("Connection served");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use maxreq_handoff::PeerAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tower::ServiceExt;

    fn context(sequence: u64) -> ConnectionContext {
        ConnectionContext {
            id: 7,
            peer: PeerAddr::Tcp("127.0.0.1:40000".parse().unwrap()),
            listener: "listen-0".to_string(),
            sequence,
        }
    }

    async fn body_text(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    /// Serve one raw request through `HttpApp` over loopback TCP.
    async fn exchange(app: HttpApp, request: Vec<u8>) -> (String, Result<(), HandlerError>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            app.handle(Connection::Tcp(stream), context(1)).await
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&request).await.unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();

        (String::from_utf8(response).unwrap(), server.await.unwrap())
    }

    #[tokio::test]
    async fn test_identity_body() {
        let request = Request::builder()
            .uri("/anything")
            .extension(context(3))
            .body(Body::empty())
            .unwrap();
        let response = router(AppKind::Identity, None).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(body["pid"], std::process::id());
        assert_eq!(body["request"], 3);
        assert_eq!(body["listener"], "listen-0");
    }

    #[tokio::test]
    async fn test_echo_includes_headers_and_body() {
        let request = Request::builder()
            .method(Method::PUT)
            .uri("/items/1?x=y")
            .header("x-trace", "abc")
            .extension(context(1))
            .body(Body::from("payload"))
            .unwrap();
        let response = router(AppKind::Echo, None).oneshot(request).await.unwrap();
        let text = body_text(response).await;
        assert!(text.starts_with("PUT /items/1?x=y HTTP/1.1\r\n"), "{text}");
        assert!(text.contains("x-trace: abc\r\n"), "{text}");
        assert!(text.ends_with("\r\n\r\npayload"), "{text}");
    }

    #[tokio::test]
    async fn test_access_log_written_after_response() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(AccessLog::open(&dir.path().join("access.log")).await.unwrap());
        let request = Request::builder()
            .uri("/")
            .header(header::USER_AGENT, "curl/8.5.0")
            .extension(context(1))
            .body(Body::empty())
            .unwrap();
        let response = router(AppKind::Identity, Some(log.clone()))
            .oneshot(request)
            .await
            .unwrap();
        let body = body_text(response).await;

        let contents = std::fs::read_to_string(log.path()).unwrap();
        let line = contents.lines().next().unwrap();
        assert!(line.starts_with("127.0.0.1 - - ["), "{line}");
        assert!(
            line.contains(&format!("\"GET / HTTP/1.1\" 200 {} \"-\" \"curl/8.5.0\"", body.len())),
            "{line}"
        );
    }

    #[tokio::test]
    async fn test_connection_closed_after_one_response() {
        let app = HttpApp::new(AppKind::Identity, None);
        let (response, served) = exchange(app, b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n".to_vec()).await;
        assert!(served.is_ok());
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{response}");
        let (_, body) = response.split_once("\r\n\r\n").unwrap();
        let body: serde_json::Value = serde_json::from_str(body).unwrap();
        assert_eq!(body["request"], 1);
    }

    #[tokio::test]
    async fn test_large_post_body_is_read() {
        let payload = "a".repeat(256 * 1024);
        let mut request = format!(
            "POST /upload HTTP/1.1\r\nHost: localhost\r\nContent-Length: {}\r\n\r\n",
            payload.len()
        )
        .into_bytes();
        request.extend_from_slice(payload.as_bytes());

        let (response, served) = exchange(HttpApp::new(AppKind::Echo, None), request).await;
        assert!(served.is_ok());
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{}", &response[..64]);
        assert!(response.contains("POST /upload HTTP/1.1\r\n"));
        assert!(response.ends_with(&payload));
    }

    #[tokio::test]
    async fn test_chunked_request_body() {
        let request = b"POST / HTTP/1.1\r\nHost: localhost\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n";
        let (response, served) = exchange(HttpApp::new(AppKind::Echo, None), request.to_vec()).await;
        assert!(served.is_ok());
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{response}");
        assert!(response.ends_with("\r\n\r\nhello"), "{response}");
    }

    #[tokio::test]
    async fn test_malformed_request_gets_400() {
        let (response, served) = exchange(HttpApp::new(AppKind::Identity, None), b"hello\r\n\r\n".to_vec()).await;
        assert!(response.starts_with("HTTP/1.1 400"), "{response}");
        assert!(served.is_err());
    }
}
