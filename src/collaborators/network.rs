//! Network interface and an in-process loopback transport.
//!
//! `LocalNetworkHub` connects any number of `LocalNetwork` endpoints living in
//! one process. Every message crosses the hub as an encoded wire frame, and
//! replies travel back through a per-(operation, remote peer) session.

use std::fmt;
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{NodeError, Result};
use crate::operation::OperationId;
use crate::protocol::wire::Frame;
use crate::protocol::{MessageType, ProtocolMessage, ProtocolResponse};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[async_trait]
pub trait Network: Send + Sync {
    fn peer_id(&self) -> PeerId;

    /// Send a request and wait for the peer's reply.
    async fn send_message(
        &self,
        protocol: &str,
        remote: &PeerId,
        message: ProtocolMessage,
        timeout: Duration,
    ) -> Result<ProtocolResponse>;

    /// Answer the request held in the (operation, remote) session.
    async fn send_message_response(
        &self,
        protocol: &str,
        remote: &PeerId,
        message_type: MessageType,
        operation_id: OperationId,
        data: Value,
    ) -> Result<()>;

    /// Drop the (operation, remote) session so a later request starts fresh.
    fn remove_cached_session(&self, operation_id: OperationId, remote: &PeerId);

    /// Peers currently known to this node, closest to `key` first.
    async fn find_nodes_local(&self, key: &str) -> Result<Vec<PeerId>>;
}

/// Receiver of inbound protocol messages.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn handle_message(&self, protocol: String, remote: PeerId, message: ProtocolMessage);
}

/// Registry of the endpoints sharing one process.
#[derive(Default)]
pub struct LocalNetworkHub {
    endpoints: DashMap<PeerId, Weak<LocalNetwork>>,
    offline: DashSet<PeerId>,
}

impl LocalNetworkHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create and register the endpoint for `peer_id`.
    pub fn connect(self: &Arc<Self>, peer_id: PeerId) -> Arc<LocalNetwork> {
        let endpoint = Arc::new(LocalNetwork {
            hub: self.clone(),
            peer_id: peer_id.clone(),
            sessions: DashMap::new(),
            inbound: RwLock::new(None),
        });
        self.endpoints.insert(peer_id, Arc::downgrade(&endpoint));
        endpoint
    }

    /// Take a peer off the network (or bring it back).
    pub fn set_offline(&self, peer_id: &PeerId, offline: bool) {
        if offline {
            self.offline.insert(peer_id.clone());
        } else {
            self.offline.remove(peer_id);
        }
    }

    fn endpoint(&self, peer_id: &PeerId) -> Option<Arc<LocalNetwork>> {
        if self.offline.contains(peer_id) {
            return None;
        }
        self.endpoints.get(peer_id).and_then(|w| w.upgrade())
    }

    fn peers(&self) -> Vec<PeerId> {
        self.endpoints
            .iter()
            .filter(|e| e.value().strong_count() > 0 && !self.offline.contains(e.key()))
            .map(|e| e.key().clone())
            .collect()
    }
}

type SessionKey = (OperationId, PeerId);

pub struct LocalNetwork {
    hub: Arc<LocalNetworkHub>,
    peer_id: PeerId,
    sessions: DashMap<SessionKey, oneshot::Sender<Vec<u8>>>,
    inbound: RwLock<Option<Weak<dyn InboundHandler>>>,
}

impl LocalNetwork {
    /// Attach the handler that receives this endpoint's inbound messages.
    pub fn set_inbound_handler(&self, handler: Weak<dyn InboundHandler>) {
        if let Ok(mut slot) = self.inbound.write() {
            *slot = Some(handler);
        }
    }

    pub fn open_sessions(&self) -> usize {
        self.sessions.len()
    }

    fn inbound_handler(&self) -> Option<Arc<dyn InboundHandler>> {
        self.inbound
            .read()
            .ok()
            .and_then(|slot| slot.as_ref().and_then(|w| w.upgrade()))
    }

    /// Accept a framed request from `from` and hand it to the inbound handler.
    fn deliver(
        &self,
        protocol: &str,
        from: PeerId,
        bytes: Vec<u8>,
        reply: oneshot::Sender<Vec<u8>>,
    ) -> Result<()> {
        let message: ProtocolMessage = Frame::from_bytes(&bytes)?.decode()?;
        let handler = self
            .inbound_handler()
            .ok_or_else(|| NodeError::Network(format!("peer {} is not accepting messages", self.peer_id)))?;

        self.sessions
            .insert((message.header.operation_id, from.clone()), reply);

        let protocol = protocol.to_string();
        tokio::spawn(async move {
            handler.handle_message(protocol, from, message).await;
        });
        Ok(())
    }
}

#[async_trait]
impl Network for LocalNetwork {
    fn peer_id(&self) -> PeerId {
        self.peer_id.clone()
    }

    async fn send_message(
        &self,
        protocol: &str,
        remote: &PeerId,
        message: ProtocolMessage,
        timeout: Duration,
    ) -> Result<ProtocolResponse> {
        let endpoint = self
            .hub
            .endpoint(remote)
            .ok_or_else(|| NodeError::Network(format!("peer {} unreachable", remote)))?;
        let operation_id = message.header.operation_id;
        let bytes = Frame::encode(&message)?.to_bytes();

        let (tx, rx) = oneshot::channel();
        endpoint.deliver(protocol, self.peer_id.clone(), bytes, tx)?;
        debug!(operation_id = %operation_id, remote = %remote, protocol, "Message sent");

        let reply = tokio::time::timeout(timeout, rx)
            .await
            .map_err(|_| {
                NodeError::Network(format!("timed out waiting for {} on {}", remote, protocol))
            })?
            .map_err(|_| NodeError::Network(format!("{} closed the session without reply", remote)))?;

        Frame::from_bytes(&reply)?.decode()
    }

    async fn send_message_response(
        &self,
        protocol: &str,
        remote: &PeerId,
        message_type: MessageType,
        operation_id: OperationId,
        data: Value,
    ) -> Result<()> {
        let Some((_, reply)) = self.sessions.remove(&(operation_id, remote.clone())) else {
            warn!(operation_id = %operation_id, remote = %remote, protocol, "No open session for response");
            return Err(NodeError::Network(format!(
                "no session for operation {} with {}",
                operation_id, remote
            )));
        };
        let response = ProtocolResponse {
            message_type,
            message_data: data,
        };
        let bytes = Frame::encode(&response)?.to_bytes();
        reply
            .send(bytes)
            .map_err(|_| NodeError::Network(format!("{} stopped waiting for a reply", remote)))
    }

    fn remove_cached_session(&self, operation_id: OperationId, remote: &PeerId) {
        self.sessions.remove(&(operation_id, remote.clone()));
    }

    async fn find_nodes_local(&self, key: &str) -> Result<Vec<PeerId>> {
        let mut peers = self.hub.peers();
        let target = crate::collaborators::neighborhood::distance_key(key.as_bytes());
        peers.sort_by_key(|p| crate::collaborators::neighborhood::xor_distance(&target, p));
        Ok(peers)
    }
}
