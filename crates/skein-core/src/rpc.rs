//! The RPC boundary between nodes.
//!
//! A node's server loop consumes [`Envelope`]s from a bounded channel. The
//! [`Transport`] trait is how the rest of the crate reaches other nodes;
//! [`LocalNetwork`] implements it in-process by handing envelopes straight
//! to each node's channel.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::BoxFuture;
use skein_cluster::NodeId;
use tokio::sync::{mpsc, oneshot};

use crate::error::RpcError;
use crate::message::{Request, Response};

/// A request in flight to a node, with the channel for its reply.
#[derive(Debug)]
pub struct Envelope {
    pub from: NodeId,
    pub request: Request,
    pub reply: oneshot::Sender<Response>,
}

/// Sending half of a node's request channel.
///
/// Cloning is cheap; it is an mpsc sender under the hood.
#[derive(Debug, Clone)]
pub struct NodeHandle {
    node: NodeId,
    tx: mpsc::Sender<Envelope>,
}

impl NodeHandle {
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Sends a request and waits for the response.
    pub async fn send(&self, from: NodeId, request: Request) -> Result<Response, RpcError> {
        let rx = self.dispatch(from, request).await?;
        rx.await.map_err(|_| RpcError::Closed(self.node))
    }

    /// Enqueues a request and returns the reply channel without waiting.
    pub async fn dispatch(
        &self,
        from: NodeId,
        request: Request,
    ) -> Result<oneshot::Receiver<Response>, RpcError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let envelope = Envelope {
            from,
            request,
            reply: reply_tx,
        };
        self.tx
            .send(envelope)
            .await
            .map_err(|_| RpcError::Unreachable(self.node))?;
        Ok(reply_rx)
    }
}

/// Creates the request channel for a node.
pub fn channel(node: NodeId, buffer: usize) -> (NodeHandle, mpsc::Receiver<Envelope>) {
    let (tx, rx) = mpsc::channel(buffer);
    (NodeHandle { node, tx }, rx)
}

/// Reliable unicast between nodes.
pub trait Transport: Send + Sync + 'static {
    fn call(
        &self,
        from: NodeId,
        to: NodeId,
        request: Request,
    ) -> BoxFuture<'static, Result<Response, RpcError>>;
}

/// Calls `to` and fails with [`RpcError::Timeout`] if no reply arrives in
/// time.
pub async fn call_with_timeout(
    transport: &dyn Transport,
    from: NodeId,
    to: NodeId,
    request: Request,
    timeout: Duration,
) -> Result<Response, RpcError> {
    match tokio::time::timeout(timeout, transport.call(from, to, request)).await {
        Ok(result) => result,
        Err(_) => Err(RpcError::Timeout(to)),
    }
}

/// In-process network of node handles.
#[derive(Debug, Clone, Default)]
pub struct LocalNetwork {
    nodes: Arc<DashMap<NodeId, NodeHandle>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handle: NodeHandle) {
        self.nodes.insert(handle.node(), handle);
    }

    /// Removes a node. Calls to it fail with `Unreachable` from now on.
    pub fn deregister(&self, node: &NodeId) -> bool {
        self.nodes.remove(node).is_some()
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        self.nodes.contains_key(node)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl Transport for LocalNetwork {
    fn call(
        &self,
        from: NodeId,
        to: NodeId,
        request: Request,
    ) -> BoxFuture<'static, Result<Response, RpcError>> {
        let handle = self.nodes.get(&to).map(|h| h.clone());
        Box::pin(async move {
            match handle {
                Some(handle) => handle.send(from, request).await,
                None => Err(RpcError::Unreachable(to)),
            }
        })
    }
}
