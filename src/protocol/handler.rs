//! Receiver-side message handling shared by every protocol.
//!
//! `handle_protocol_message` wraps one `ProtocolHandler::prepare_message`
//! call: it creates the remote operation record, runs the handler with panics
//! contained, turns any failure into a NACK, answers the peer and finally
//! releases the (operation, peer) session whatever happened.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::json;
use tracing::{debug, error, warn};

use super::{MessageType, Protocol, ProtocolMessage, ProtocolResponse};
use crate::collaborators::{InboundHandler, Network, PeerId};
use crate::error::Result;
use crate::operation::{OperationService, OperationStatus, Phase};

#[async_trait]
pub trait ProtocolHandler: Send + Sync {
    /// Validate the inbound message, apply its local effect and build the
    /// reply. Returning `Err` is answered with a NACK.
    async fn prepare_message(
        &self,
        remote: &PeerId,
        message: &ProtocolMessage,
    ) -> Result<ProtocolResponse>;
}

/// Run one inbound message through `handler` and answer the peer.
pub async fn handle_protocol_message(
    operations: &OperationService,
    network: &dyn Network,
    protocol: Protocol,
    handler: &dyn ProtocolHandler,
    remote: PeerId,
    message: ProtocolMessage,
) {
    let operation_id = message.header.operation_id;
    let kind = protocol.kind();
    let (start, end) = match message.header.message_type {
        MessageType::ProtocolInit => (Phase::RemoteInitStart, Phase::RemoteInitEnd),
        _ => (Phase::RemoteRequestStart, Phase::RemoteRequestEnd),
    };
    debug!(
        operation_id = %operation_id,
        protocol = %protocol,
        remote = %remote,
        message_type = %message.header.message_type,
        "Handling protocol message"
    );

    if let Err(e) = operations.ensure_remote_record(operation_id, kind) {
        warn!(operation_id = %operation_id, error = %e, "Unable to record remote operation");
    }
    if let Err(e) = operations.update_remote_status(operation_id, OperationStatus::phase(kind, start)) {
        warn!(operation_id = %operation_id, error = %e, "Unable to record remote status");
    }

    let outcome = AssertUnwindSafe(handler.prepare_message(&remote, &message))
        .catch_unwind()
        .await;
    let response = match outcome {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => ProtocolResponse::nack(json!({ "errorMessage": e.to_string() })),
        Err(panic) => {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(operation_id = %operation_id, protocol = %protocol, "Protocol handler panicked: {}", reason);
            ProtocolResponse::nack(json!({ "errorMessage": format!("Internal error: {}", reason) }))
        }
    };

    let bookkeeping = if response.is_ack() {
        operations
            .update_remote_status(operation_id, OperationStatus::phase(kind, end))
            .and_then(|_| match message.header.message_type {
                MessageType::ProtocolInit => Ok(false),
                _ => operations.complete_remote(operation_id),
            })
    } else {
        operations.record_remote_error(
            operation_id,
            &response.error_message(),
            protocol.remote_error_type(),
        )
    };
    if let Err(e) = bookkeeping {
        warn!(operation_id = %operation_id, error = %e, "Remote operation bookkeeping failed");
    }

    if let Err(e) = network
        .send_message_response(
            protocol.id(),
            &remote,
            response.message_type,
            operation_id,
            response.message_data,
        )
        .await
    {
        warn!(operation_id = %operation_id, remote = %remote, error = %e, "Unable to send response");
    }
    network.remove_cached_session(operation_id, &remote);
}

/// Routes inbound messages to the handler registered for their protocol.
pub struct ProtocolDispatcher {
    operations: Arc<OperationService>,
    network: Arc<dyn Network>,
    handlers: HashMap<Protocol, Arc<dyn ProtocolHandler>>,
}

impl ProtocolDispatcher {
    pub fn new(operations: Arc<OperationService>, network: Arc<dyn Network>) -> Self {
        Self {
            operations,
            network,
            handlers: HashMap::new(),
        }
    }

    pub fn register(&mut self, protocol: Protocol, handler: Arc<dyn ProtocolHandler>) {
        self.handlers.insert(protocol, handler);
    }

    pub fn protocols(&self) -> Vec<Protocol> {
        Protocol::ALL
            .iter()
            .filter(|p| self.handlers.contains_key(p))
            .copied()
            .collect()
    }
}

#[async_trait]
impl InboundHandler for ProtocolDispatcher {
    async fn handle_message(&self, protocol: String, remote: PeerId, message: ProtocolMessage) {
        let operation_id = message.header.operation_id;
        let handler = protocol
            .parse::<Protocol>()
            .ok()
            .and_then(|p| self.handlers.get(&p).cloned().map(|h| (p, h)));
        let Some((protocol, handler)) = handler else {
            warn!(operation_id = %operation_id, protocol = %protocol, "No handler for protocol");
            let _ = self
                .network
                .send_message_response(
                    &protocol,
                    &remote,
                    MessageType::Nack,
                    operation_id,
                    json!({ "errorMessage": format!("Unsupported protocol {}", protocol) }),
                )
                .await;
            self.network.remove_cached_session(operation_id, &remote);
            return;
        };
        handle_protocol_message(
            &self.operations,
            self.network.as_ref(),
            protocol,
            handler.as_ref(),
            remote,
            message,
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::LocalNetworkHub;
    use crate::db::Database;
    use crate::error::NodeError;
    use crate::operation::{OperationCache, OperationId, OperationRegistry};
    use std::time::Duration;

    struct Failing;

    #[async_trait]
    impl ProtocolHandler for Failing {
        async fn prepare_message(
            &self,
            _remote: &PeerId,
            message: &ProtocolMessage,
        ) -> Result<ProtocolResponse> {
            if message.data["panic"].as_bool().unwrap_or(false) {
                panic!("boom");
            }
            Err(NodeError::Validation("Invalid neighbourhood".to_string()))
        }
    }

    fn operations() -> Arc<OperationService> {
        Arc::new(OperationService::new(
            OperationRegistry::new(Database::open_in_memory().unwrap()),
            OperationCache::in_memory(),
        ))
    }

    #[tokio::test]
    async fn test_errors_and_panics_become_nacks() {
        let hub = LocalNetworkHub::new();
        let sender = hub.connect(PeerId::from("a"));
        let receiver = hub.connect(PeerId::from("b"));
        let ops = operations();

        let mut dispatcher = ProtocolDispatcher::new(ops.clone(), receiver.clone());
        dispatcher.register(Protocol::Store, Arc::new(Failing));
        let dispatcher: Arc<dyn InboundHandler> = Arc::new(dispatcher);
        receiver.set_inbound_handler(Arc::downgrade(&dispatcher));

        let op = OperationId::new();
        let response = sender
            .send_message(
                Protocol::Store.id(),
                &PeerId::from("b"),
                ProtocolMessage::init(op, json!({})),
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert!(!response.is_ack());
        assert!(response.error_message().contains("Invalid neighbourhood"));
        let record = ops.get_operation_record(op).unwrap().unwrap();
        assert_eq!(record.status, OperationStatus::Failed);

        let op = OperationId::new();
        let response = sender
            .send_message(
                Protocol::Store.id(),
                &PeerId::from("b"),
                ProtocolMessage::request(op, json!({"panic": true})),
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert!(response.error_message().contains("boom"));
        assert_eq!(receiver.open_sessions(), 0);

        let response = sender
            .send_message(
                Protocol::Ask.id(),
                &PeerId::from("b"),
                ProtocolMessage::request(OperationId::new(), json!({})),
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert!(response.error_message().contains("Unsupported protocol"));
    }

    #[tokio::test]
    async fn test_broken_bookkeeping_still_answers_peer() {
        let hub = LocalNetworkHub::new();
        let sender = hub.connect(PeerId::from("a"));
        let receiver = hub.connect(PeerId::from("b"));
        let db = Database::open_in_memory().unwrap();
        let ops = Arc::new(OperationService::new(
            OperationRegistry::new(db.clone()),
            OperationCache::in_memory(),
        ));

        let mut dispatcher = ProtocolDispatcher::new(ops.clone(), receiver.clone());
        dispatcher.register(Protocol::Store, Arc::new(Failing));
        let dispatcher: Arc<dyn InboundHandler> = Arc::new(dispatcher);
        receiver.set_inbound_handler(Arc::downgrade(&dispatcher));

        // the record exists but every status write now fails
        let op = OperationId::new();
        ops.ensure_remote_record(op, Protocol::Store.kind()).unwrap();
        db.conn()
            .unwrap()
            .execute_batch("DROP TABLE operation_events")
            .unwrap();
        assert!(ops
            .update_remote_status(op, OperationStatus::phase(Protocol::Store.kind(), Phase::RemoteRequestStart))
            .is_err());

        let response = sender
            .send_message(
                Protocol::Store.id(),
                &PeerId::from("b"),
                ProtocolMessage::request(op, json!({})),
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert!(!response.is_ack());
        assert!(response.error_message().contains("Invalid neighbourhood"));
        assert_eq!(receiver.open_sessions(), 0);
        let record = ops.get_operation_record(op).unwrap().unwrap();
        assert_eq!(record.status, OperationStatus::start(Protocol::Store.kind()));
    }
}
