//! HTTP binding of the link, for running units and the coordinator as
//! separate processes.
//!
//! Every path is served by one fallback handler that turns the HTTP request
//! into an [`Inbound`] event for the node's actor and waits for its reply.
//! Confirmable requests map onto plain request/response; observe is a GET
//! carrying an `observe: 0` header; notifications are a POST with
//! `x-notify: 1` that is answered before the actor sees it.
//!
//! The sender's listen address travels in `x-node-addr`. Its IP must match
//! the connection's peer, otherwise the request is refused with 403; without
//! the header the peer address itself is the source.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    Router,
    body::Bytes,
    extract::{ConnectInfo, State},
    http::{HeaderMap, Method as HttpMethod, StatusCode, Uri},
    response::{IntoResponse, Response as HttpResponse},
};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::error::LinkError;
use crate::link::{Code, ContentFormat, Inbound, Link, Method, NodeAddr, Notification, Request, Response};

pub const SOURCE_HEADER: &str = "x-node-addr";
pub const NOTIFY_HEADER: &str = "x-notify";
pub const OBSERVE_HEADER: &str = "observe";
pub const COMPACT_MEDIA_TYPE: &str = "application/x-compact+json";

pub fn code_to_status(code: Code) -> StatusCode {
    match code {
        Code::Content => StatusCode::OK,
        Code::Created => StatusCode::CREATED,
        Code::Changed => StatusCode::NO_CONTENT,
        Code::BadRequest => StatusCode::BAD_REQUEST,
        Code::Forbidden => StatusCode::FORBIDDEN,
        Code::NotFound => StatusCode::NOT_FOUND,
        Code::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
        Code::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        Code::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
    }
}

pub fn status_to_code(status: u16) -> Code {
    match status {
        200 => Code::Content,
        201 => Code::Created,
        204 => Code::Changed,
        400 => Code::BadRequest,
        403 => Code::Forbidden,
        404 => Code::NotFound,
        405 => Code::MethodNotAllowed,
        503 => Code::ServiceUnavailable,
        _ => Code::InternalError,
    }
}

/// Client half: one shared connection pool per node.
pub struct HttpLink {
    addr: NodeAddr,
    client: reqwest::Client,
}

impl HttpLink {
    pub fn new(addr: NodeAddr, timeout: Duration) -> Result<Self, LinkError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LinkError::Transport(e.to_string()))?;
        Ok(Self { addr, client })
    }

    fn url(to: &NodeAddr, path: &str) -> String {
        format!("http://{to}/{}", path.trim_start_matches('/'))
    }
}

fn transport_error(err: reqwest::Error, to: &NodeAddr) -> LinkError {
    if err.is_timeout() {
        LinkError::Timeout
    } else if err.is_connect() {
        LinkError::Unreachable(to.to_string())
    } else {
        LinkError::Transport(err.to_string())
    }
}

#[async_trait]
impl Link for HttpLink {
    fn local_addr(&self) -> &NodeAddr {
        &self.addr
    }

    async fn request(&self, to: &NodeAddr, request: Request) -> Result<Response, LinkError> {
        let url = Self::url(to, &request.path);
        let builder = match request.method {
            Method::Get => self.client.get(&url),
            Method::Observe => self.client.get(&url).header(OBSERVE_HEADER, "0"),
            Method::Post => self.client.post(&url),
            Method::Put => self.client.put(&url),
        };
        let builder = match request.accept {
            ContentFormat::Json => builder.header("accept", "application/json"),
            ContentFormat::Compact => builder.header("accept", COMPACT_MEDIA_TYPE),
        };
        let response = builder
            .header(SOURCE_HEADER, self.addr.as_str())
            .body(request.payload)
            .send()
            .await
            .map_err(|e| transport_error(e, to))?;
        let code = status_to_code(response.status().as_u16());
        let payload = response.bytes().await.map_err(|e| transport_error(e, to))?;
        Ok(Response::with_payload(code, payload.to_vec()))
    }

    async fn notify(&self, to: &NodeAddr, path: &str, payload: Vec<u8>) -> Result<(), LinkError> {
        let request = self
            .client
            .post(Self::url(to, path))
            .header(SOURCE_HEADER, self.addr.as_str())
            .header(NOTIFY_HEADER, "1")
            .body(payload);
        let to = to.clone();
        tokio::spawn(async move {
            if let Err(err) = request.send().await {
                debug!(%to, %err, "notification not delivered");
            }
        });
        Ok(())
    }
}

/// Server half: every path goes to the node's inbox.
pub fn router(inbox: mpsc::Sender<Inbound>) -> Router {
    Router::new()
        .fallback(handle)
        .with_state(inbox)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &axum::http::Request<_>| {
                    tracing::info_span!(
                        "http_request",
                        method = %req.method(),
                        path = %req.uri().path(),
                        source = ?req.headers().get(SOURCE_HEADER),
                    )
                })
                .on_response(
                    |res: &axum::http::Response<_>, latency: Duration, span: &tracing::Span| {
                        tracing::debug!(
                            parent: span,
                            status = %res.status(),
                            latency_ms = %latency.as_millis(),
                            "response sent"
                        );
                    },
                ),
        )
}

pub async fn serve(listen: SocketAddr, inbox: mpsc::Sender<Inbound>) -> std::io::Result<()> {
    let listener = TcpListener::bind(listen).await?;
    info!(addr = %listen, "link listening");
    serve_on(listener, inbox).await
}

pub async fn serve_on(listener: TcpListener, inbox: mpsc::Sender<Inbound>) -> std::io::Result<()> {
    axum::serve(
        listener,
        router(inbox).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Source address for a request from `peer` that claims `claimed`.
pub fn verified_source(claimed: Option<&str>, peer: SocketAddr) -> Result<NodeAddr, StatusCode> {
    let Some(claimed) = claimed else {
        return Ok(NodeAddr::from(peer.to_string()));
    };
    let addr: SocketAddr = claimed.parse().map_err(|_| StatusCode::BAD_REQUEST)?;
    if addr.ip().to_canonical() != peer.ip().to_canonical() {
        return Err(StatusCode::FORBIDDEN);
    }
    Ok(NodeAddr::from(claimed))
}

async fn handle(
    State(inbox): State<mpsc::Sender<Inbound>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    method: HttpMethod,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> HttpResponse {
    let path = uri.path().trim_start_matches('/').to_string();
    let source = match verified_source(header(&headers, SOURCE_HEADER), peer) {
        Ok(source) => source,
        Err(status) => {
            warn!(%peer, claimed = ?headers.get(SOURCE_HEADER), %status, "sender address refused");
            return status.into_response();
        }
    };

    if method == HttpMethod::POST && header(&headers, NOTIFY_HEADER) == Some("1") {
        let notification = Notification {
            path,
            payload: body.to_vec(),
            source,
        };
        // A full inbox drops the push.
        let _ = inbox.try_send(Inbound::Notification(notification));
        return StatusCode::NO_CONTENT.into_response();
    }

    let method = match method {
        HttpMethod::GET if headers.contains_key(OBSERVE_HEADER) => Method::Observe,
        HttpMethod::GET => Method::Get,
        HttpMethod::POST => Method::Post,
        HttpMethod::PUT => Method::Put,
        _ => return StatusCode::METHOD_NOT_ALLOWED.into_response(),
    };
    let accept = match header(&headers, "accept") {
        Some(value) if value.contains(COMPACT_MEDIA_TYPE) => ContentFormat::Compact,
        _ => ContentFormat::Json,
    };
    let request = Request {
        method,
        path,
        payload: body.to_vec(),
        accept,
        source,
    };

    let (reply_tx, reply_rx) = oneshot::channel();
    if inbox
        .send(Inbound::Request {
            request,
            reply: reply_tx,
        })
        .await
        .is_err()
    {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    match reply_rx.await {
        Ok(response) => (code_to_status(response.code), response.payload).into_response(),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_code_survives_the_status_mapping() {
        for code in [
            Code::Content,
            Code::Created,
            Code::Changed,
            Code::BadRequest,
            Code::Forbidden,
            Code::NotFound,
            Code::MethodNotAllowed,
            Code::InternalError,
            Code::ServiceUnavailable,
        ] {
            assert_eq!(status_to_code(code_to_status(code).as_u16()), code);
        }
        assert_eq!(status_to_code(418), Code::InternalError);
    }

    #[tokio::test]
    async fn loopback_request_and_notification() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let server_addr = NodeAddr::from(listener.local_addr().expect("addr").to_string());
        let (tx, mut inbox) = mpsc::channel(8);
        tokio::spawn(serve_on(listener, tx));

        let link = HttpLink::new(NodeAddr::from("127.0.0.1:1"), Duration::from_secs(5)).expect("client");

        let server = tokio::spawn(async move {
            let Some(Inbound::Request { request, reply }) = inbox.recv().await else {
                panic!("expected a request");
            };
            assert_eq!(request.method, Method::Observe);
            assert_eq!(request.path, "dev/state");
            assert_eq!(request.accept, ContentFormat::Compact);
            assert_eq!(request.source, NodeAddr::from("127.0.0.1:1"));
            let _ = reply.send(Response::with_payload(Code::Content, b"{}".to_vec()));

            let Some(Inbound::Notification(n)) = inbox.recv().await else {
                panic!("expected a notification");
            };
            assert_eq!(n.path, "dev/state");
            assert_eq!(n.payload, b"{\"S\":5000}".to_vec());
        });

        let response = link
            .request(&server_addr, Request::observe("dev/state").accept(ContentFormat::Compact))
            .await
            .expect("answered");
        assert_eq!(response.code, Code::Content);
        assert_eq!(response.payload, b"{}".to_vec());

        link.notify(&server_addr, "dev/state", b"{\"S\":5000}".to_vec())
            .await
            .expect("sent");
        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .expect("server finished")
            .expect("assertions held");
    }

    #[test]
    fn claimed_source_must_match_the_peer() {
        let peer: SocketAddr = "10.0.0.7:50123".parse().expect("addr");
        assert_eq!(verified_source(Some("10.0.0.7:5701"), peer), Ok(NodeAddr::from("10.0.0.7:5701")));
        assert_eq!(verified_source(Some("10.0.0.9:5701"), peer), Err(StatusCode::FORBIDDEN));
        assert_eq!(verified_source(Some("unit-1"), peer), Err(StatusCode::BAD_REQUEST));
        assert_eq!(verified_source(None, peer), Ok(NodeAddr::from("10.0.0.7:50123")));

        let mapped: SocketAddr = "[::ffff:10.0.0.7]:50123".parse().expect("addr");
        assert!(verified_source(Some("10.0.0.7:5701"), mapped).is_ok());
    }

    #[tokio::test]
    async fn spoofed_sender_is_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let server_addr = NodeAddr::from(listener.local_addr().expect("addr").to_string());
        let (tx, mut inbox) = mpsc::channel(8);
        tokio::spawn(serve_on(listener, tx));

        let link = HttpLink::new(NodeAddr::from("192.0.2.10:5701"), Duration::from_secs(5)).expect("client");
        let response = link
            .request(&server_addr, Request::get("dev/state"))
            .await
            .expect("answered");
        assert_eq!(response.code, Code::Forbidden);
        assert!(inbox.try_recv().is_err());
    }

    #[tokio::test]
    async fn closed_port_is_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = NodeAddr::from(listener.local_addr().expect("addr").to_string());
        drop(listener);
        let link = HttpLink::new(NodeAddr::from("127.0.0.1:1"), Duration::from_secs(2)).expect("client");
        let err = link.request(&addr, Request::get("dev/state")).await.unwrap_err();
        assert!(matches!(err, LinkError::Unreachable(_) | LinkError::Transport(_)));
    }
}
