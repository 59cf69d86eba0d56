//! Message boundary between units and the coordinator.
//!
//! Every node owns an inbox of [`Inbound`] events and talks to its peers
//! through a [`Link`]. Requests are confirmable and bounded by a timeout;
//! notifications are fire-and-forget and may be lost.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rand::{Rng, SeedableRng, rngs::StdRng};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::error::LinkError;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeAddr(String);

impl NodeAddr {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeAddr {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for NodeAddr {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Observe,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Code {
    Content,
    Created,
    Changed,
    BadRequest,
    Forbidden,
    NotFound,
    MethodNotAllowed,
    InternalError,
    ServiceUnavailable,
}

impl Code {
    pub fn is_success(self) -> bool {
        matches!(self, Code::Content | Code::Created | Code::Changed)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ContentFormat {
    #[default]
    Json,
    Compact,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Request {
    pub method: Method,
    pub path: String,
    pub payload: Vec<u8>,
    pub accept: ContentFormat,
    pub source: NodeAddr,
}

impl Request {
    pub fn new(method: Method, path: &str, payload: Vec<u8>) -> Self {
        Self {
            method,
            path: path.to_string(),
            payload,
            accept: ContentFormat::Json,
            source: NodeAddr::from(""),
        }
    }

    pub fn get(path: &str) -> Self {
        Self::new(Method::Get, path, Vec::new())
    }

    pub fn observe(path: &str) -> Self {
        Self::new(Method::Observe, path, Vec::new())
    }

    pub fn put(path: &str, payload: Vec<u8>) -> Self {
        Self::new(Method::Put, path, payload)
    }

    pub fn post(path: &str, payload: Vec<u8>) -> Self {
        Self::new(Method::Post, path, payload)
    }

    pub fn accept(mut self, format: ContentFormat) -> Self {
        self.accept = format;
        self
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Response {
    pub code: Code,
    pub payload: Vec<u8>,
}

impl Response {
    pub fn new(code: Code) -> Self {
        Self {
            code,
            payload: Vec::new(),
        }
    }

    pub fn with_payload(code: Code, payload: Vec<u8>) -> Self {
        Self { code, payload }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Notification {
    pub path: String,
    pub payload: Vec<u8>,
    pub source: NodeAddr,
}

/// Event delivered to a node's inbox.
#[derive(Debug)]
pub enum Inbound {
    Request {
        request: Request,
        reply: oneshot::Sender<Response>,
    },
    Notification(Notification),
}

#[async_trait]
pub trait Link: Send + Sync {
    fn local_addr(&self) -> &NodeAddr;

    /// Confirmable exchange; fails with [`LinkError::Timeout`] when no
    /// response arrives in time.
    async fn request(&self, to: &NodeAddr, request: Request) -> Result<Response, LinkError>;

    /// Non-confirmable push.
    async fn notify(&self, to: &NodeAddr, path: &str, payload: Vec<u8>) -> Result<(), LinkError>;
}

/// Behavior of the simulated radio.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LinkConditions {
    pub latency_ms: u64,
    pub jitter_ms: u64,
    pub loss: f64,
    pub timeout_ms: u64,
    pub inbox_depth: usize,
}

impl Default for LinkConditions {
    fn default() -> Self {
        Self {
            latency_ms: 20,
            jitter_ms: 10,
            loss: 0.0,
            timeout_ms: 2_000,
            inbox_depth: 64,
        }
    }
}

impl LinkConditions {
    pub fn ideal() -> Self {
        Self {
            latency_ms: 0,
            jitter_ms: 0,
            loss: 0.0,
            ..Self::default()
        }
    }
}

struct NetworkInner {
    nodes: HashMap<NodeAddr, mpsc::Sender<Inbound>>,
    rng: StdRng,
}

/// In-process network of nodes with configurable latency and loss.
#[derive(Clone)]
pub struct LocalNetwork {
    conditions: LinkConditions,
    inner: Arc<Mutex<NetworkInner>>,
}

impl LocalNetwork {
    pub fn new(conditions: LinkConditions, seed: u64) -> Self {
        Self {
            conditions,
            inner: Arc::new(Mutex::new(NetworkInner {
                nodes: HashMap::new(),
                rng: StdRng::seed_from_u64(seed),
            })),
        }
    }

    pub fn conditions(&self) -> &LinkConditions {
        &self.conditions
    }

    /// Join the network as `addr`. Re-attaching replaces the previous inbox.
    pub fn attach(&self, addr: impl Into<NodeAddr>) -> (LocalLink, mpsc::Receiver<Inbound>) {
        let addr = addr.into();
        let (tx, rx) = mpsc::channel(self.conditions.inbox_depth.max(1));
        self.lock().nodes.insert(addr.clone(), tx);
        let link = LocalLink {
            addr,
            network: self.clone(),
        };
        (link, rx)
    }

    pub fn detach(&self, addr: &NodeAddr) {
        self.lock().nodes.remove(addr);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, NetworkInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn route(&self, to: &NodeAddr) -> Result<(mpsc::Sender<Inbound>, Duration, bool), LinkError> {
        let mut inner = self.lock();
        let tx = inner
            .nodes
            .get(to)
            .cloned()
            .ok_or_else(|| LinkError::Unreachable(to.to_string()))?;
        let jitter = if self.conditions.jitter_ms > 0 {
            inner.rng.gen_range(0..=self.conditions.jitter_ms)
        } else {
            0
        };
        let lost = self.conditions.loss > 0.0 && inner.rng.gen_bool(self.conditions.loss.clamp(0.0, 1.0));
        Ok((tx, Duration::from_millis(self.conditions.latency_ms + jitter), lost))
    }
}

pub struct LocalLink {
    addr: NodeAddr,
    network: LocalNetwork,
}

#[async_trait]
impl Link for LocalLink {
    fn local_addr(&self) -> &NodeAddr {
        &self.addr
    }

    async fn request(&self, to: &NodeAddr, mut request: Request) -> Result<Response, LinkError> {
        let (tx, delay, lost) = self.network.route(to)?;
        request.source = self.addr.clone();
        let timeout = Duration::from_millis(self.network.conditions.timeout_ms);
        let exchange = async move {
            tokio::time::sleep(delay).await;
            if lost {
                debug!(%to, path = %request.path, "request lost in transit");
                return std::future::pending().await;
            }
            let (reply_tx, reply_rx) = oneshot::channel();
            tx.send(Inbound::Request {
                request,
                reply: reply_tx,
            })
            .await
            .map_err(|_| LinkError::Closed)?;
            let response = reply_rx.await.map_err(|_| LinkError::Closed)?;
            tokio::time::sleep(delay).await;
            Ok(response)
        };
        tokio::time::timeout(timeout, exchange)
            .await
            .unwrap_or(Err(LinkError::Timeout))
    }

    async fn notify(&self, to: &NodeAddr, path: &str, payload: Vec<u8>) -> Result<(), LinkError> {
        let (tx, delay, lost) = self.network.route(to)?;
        if lost {
            debug!(%to, path, "notification lost in transit");
            return Ok(());
        }
        let notification = Notification {
            path: path.to_string(),
            payload,
            source: self.addr.clone(),
        };
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // A full inbox drops the push, like any other lost datagram.
            let _ = tx.try_send(Inbound::Notification(notification));
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn echo(mut inbox: mpsc::Receiver<Inbound>) {
        while let Some(event) = inbox.recv().await {
            if let Inbound::Request { request, reply } = event {
                let _ = reply.send(Response::with_payload(Code::Content, request.source.to_string().into_bytes()));
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn request_carries_source_address() {
        let net = LocalNetwork::new(LinkConditions::default(), 1);
        let (client, _client_inbox) = net.attach("client");
        let (_server, server_inbox) = net.attach("server");
        tokio::spawn(echo(server_inbox));

        let response = client
            .request(&NodeAddr::from("server"), Request::get("dev/state"))
            .await
            .expect("answered");
        assert_eq!(response.code, Code::Content);
        assert_eq!(response.payload, b"client".to_vec());
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_destination_is_unreachable() {
        let net = LocalNetwork::new(LinkConditions::ideal(), 1);
        let (client, _inbox) = net.attach("client");
        let err = client
            .request(&NodeAddr::from("nobody"), Request::get("dev/state"))
            .await
            .unwrap_err();
        assert_eq!(err, LinkError::Unreachable("nobody".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_times_out() {
        let net = LocalNetwork::new(LinkConditions::ideal(), 1);
        let (client, _inbox) = net.attach("client");
        let (_server, _server_inbox) = net.attach("server");
        let err = client
            .request(&NodeAddr::from("server"), Request::get("dev/state"))
            .await
            .unwrap_err();
        assert_eq!(err, LinkError::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn lossy_link_drops_notifications_quietly() {
        let conditions = LinkConditions {
            loss: 1.0,
            ..LinkConditions::ideal()
        };
        let net = LocalNetwork::new(conditions, 1);
        let (client, _inbox) = net.attach("client");
        let (_server, mut server_inbox) = net.attach("server");
        client
            .notify(&NodeAddr::from("server"), "dev/state", b"{}".to_vec())
            .await
            .expect("fire and forget");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(server_inbox.try_recv().is_err());
    }
}
