//! Operation lifecycle service: the narrow entry point every pipeline phase,
//! protocol handler and the HTTP surface use to move an operation along.

use serde::Serialize;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use super::{
    CacheWrite, OperationCache, OperationId, OperationKind, OperationRecord, OperationRegistry,
    OperationStatus, Origin,
};
use crate::error::{ErrorType, NodeError, Result};
use crate::time::now_millis;

/// Payload served to callers polling an operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationResult {
    pub status: OperationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

pub struct OperationService {
    registry: OperationRegistry,
    cache: OperationCache,
}

impl OperationService {
    pub fn new(registry: OperationRegistry, cache: OperationCache) -> Self {
        Self { registry, cache }
    }

    pub fn registry(&self) -> &OperationRegistry {
        &self.registry
    }

    pub fn cache(&self) -> &OperationCache {
        &self.cache
    }

    /// Create a locally originated operation and return its id.
    pub fn generate_operation_id(
        &self,
        kind: OperationKind,
        initial_status: OperationStatus,
    ) -> Result<OperationId> {
        let id = OperationId::new();
        self.registry.create(id, kind, initial_status, Origin::Local)?;
        info!(operation_id = %id, kind = %kind, "Generated operation id");
        Ok(id)
    }

    /// Create the receiver-side record for an inbound operation id, once.
    pub fn ensure_remote_record(&self, id: OperationId, kind: OperationKind) -> Result<()> {
        self.registry
            .create_if_absent(id, kind, OperationStatus::start(kind), Origin::Remote)?;
        Ok(())
    }

    pub fn operation_id_in_right_format(&self, id: &str) -> bool {
        OperationId::is_valid(id)
    }

    pub fn update_status(
        &self,
        id: OperationId,
        blockchain: Option<&str>,
        status: OperationStatus,
    ) -> Result<bool> {
        self.registry.update_status(id, blockchain, status)
    }

    /// Status update coming from the receiver side. Only moves records this
    /// node holds on behalf of a peer.
    pub fn update_remote_status(&self, id: OperationId, status: OperationStatus) -> Result<bool> {
        match self.registry.get(id)? {
            Some(record) if record.origin == Origin::Remote => {
                self.registry.update_status(id, None, status)
            }
            _ => Ok(false),
        }
    }

    /// Mark an operation FAILED with `{errorMessage, errorType}` and drop its
    /// cached payloads.
    pub fn mark_failed(
        &self,
        id: OperationId,
        message: &str,
        error_type: ErrorType,
    ) -> Result<bool> {
        let data = json!({ "errorMessage": message, "errorType": error_type });
        let applied = self.registry.mark_failed(id, &data)?;
        if applied {
            error!(operation_id = %id, error_type = %error_type, "Operation failed: {}", message);
            self.cache.remove(id);
        }
        Ok(applied)
    }

    /// Record a receiver-side failure. Local records are left alone.
    pub fn record_remote_error(
        &self,
        id: OperationId,
        message: &str,
        error_type: ErrorType,
    ) -> Result<bool> {
        match self.registry.get(id)? {
            Some(record) if record.origin == Origin::Remote => {
                let data = json!({ "errorMessage": message, "errorType": error_type });
                let applied = self.registry.mark_failed(id, &data)?;
                if applied {
                    warn!(operation_id = %id, error_type = %error_type, "Remote request failed: {}", message);
                }
                Ok(applied)
            }
            _ => Ok(false),
        }
    }

    /// Move to COMPLETED. Returns `false` when the operation was already terminal.
    pub fn complete(
        &self,
        id: OperationId,
        data: Option<Value>,
        min_acks_reached: bool,
    ) -> Result<bool> {
        let applied = self
            .registry
            .mark_completed(id, data.as_ref(), min_acks_reached)?;
        if applied {
            info!(operation_id = %id, min_acks_reached, "Operation completed");
        }
        Ok(applied)
    }

    /// Complete a record this node holds on behalf of a peer.
    pub fn complete_remote(&self, id: OperationId) -> Result<bool> {
        match self.registry.get(id)? {
            Some(record) if record.origin == Origin::Remote => {
                self.registry.mark_completed(id, None, false)
            }
            _ => Ok(false),
        }
    }

    /// Cache `result` under the `result` field and complete the operation.
    pub fn complete_with_result(&self, id: OperationId, result: Value) -> Result<bool> {
        if self.is_terminal(id)? {
            return Ok(false);
        }
        self.cache.put(id, json!({ "result": result }))?;
        self.complete(id, None, false)
    }

    pub fn cache_data(&self, id: OperationId, payload: Value) -> Result<CacheWrite> {
        self.cache.put(id, payload)
    }

    pub fn get_cached_data(&self, id: OperationId) -> Result<Option<Value>> {
        self.cache.get(id)
    }

    pub fn get_cached_field(&self, id: OperationId, field: &str) -> Result<Option<Value>> {
        self.cache.get_field(id, field)
    }

    pub fn get_operation_record(&self, id: OperationId) -> Result<Option<OperationRecord>> {
        self.registry.get(id)
    }

    pub fn is_terminal(&self, id: OperationId) -> Result<bool> {
        Ok(self
            .registry
            .get(id)?
            .map(|r| r.status.is_terminal())
            .unwrap_or(false))
    }

    /// Build the polling payload for `kind`/`id`.
    pub fn get_result(&self, kind: OperationKind, id: &str) -> Result<OperationResult> {
        let id = OperationId::parse(id)?;
        let record = self
            .registry
            .get(id)?
            .filter(|r| r.kind == kind)
            .ok_or_else(|| NodeError::OperationNotFound(id.to_string()))?;

        let data = match record.status {
            OperationStatus::Failed => record.data,
            OperationStatus::Completed => match kind {
                OperationKind::Publish | OperationKind::Update => {
                    let mut payload = json!({ "minAcksReached": record.min_acks_reached });
                    if let (Some(Value::Object(extra)), Some(obj)) =
                        (record.data, payload.as_object_mut())
                    {
                        obj.extend(extra);
                    }
                    Some(payload)
                }
                _ => self.cache.get_field(id, "result")?.or(record.data),
            },
            _ => None,
        };

        Ok(OperationResult {
            status: record.status,
            data,
        })
    }

    /// Remove terminal operations idle for longer than `retention_ms`.
    pub fn sweep(&self, retention_ms: u64) -> Result<usize> {
        let cutoff = now_millis().saturating_sub(retention_ms);
        let removed = self.registry.sweep(cutoff)?;
        for id in &removed {
            self.cache.remove(*id);
        }
        if !removed.is_empty() {
            info!(count = removed.len(), "Swept expired operations");
        }
        Ok(removed.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::operation::Phase;

    fn service() -> OperationService {
        OperationService::new(
            OperationRegistry::new(Database::open_in_memory().unwrap()),
            OperationCache::in_memory(),
        )
    }

    #[test]
    fn test_failed_result_carries_error() {
        let svc = service();
        let kind = OperationKind::Get;
        let id = svc.generate_operation_id(kind, OperationStatus::start(kind)).unwrap();
        svc.cache_data(id, json!({"keyword": "k"})).unwrap();

        svc.mark_failed(id, "not found", ErrorType::GetNetworkError).unwrap();

        let result = svc.get_result(kind, &id.to_string()).unwrap();
        assert_eq!(result.status, OperationStatus::Failed);
        let data = result.data.unwrap();
        assert_eq!(data["errorMessage"], "not found");
        assert_eq!(data["errorType"], "GetNetworkError");
        assert!(svc.get_cached_data(id).unwrap().is_none());
    }

    #[test]
    fn test_pending_result_has_no_data() {
        let svc = service();
        let kind = OperationKind::Publish;
        let id = svc.generate_operation_id(kind, OperationStatus::start(kind)).unwrap();
        svc.update_status(id, None, OperationStatus::phase(kind, Phase::ReplicateStart))
            .unwrap();
        let result = svc.get_result(kind, &id.to_string()).unwrap();
        assert!(result.data.is_none());
    }

    #[test]
    fn test_completed_publish_reports_min_acks() {
        let svc = service();
        let kind = OperationKind::Publish;
        let id = svc.generate_operation_id(kind, OperationStatus::start(kind)).unwrap();
        svc.complete(id, None, true).unwrap();
        let result = svc.get_result(kind, &id.to_string()).unwrap();
        assert_eq!(result.data.unwrap(), json!({"minAcksReached": true}));
    }

    #[test]
    fn test_completed_get_returns_cached_result() {
        let svc = service();
        let kind = OperationKind::Get;
        let id = svc.generate_operation_id(kind, OperationStatus::start(kind)).unwrap();
        svc.complete_with_result(id, json!({"assertion": ["<a> <b> <c> ."]})).unwrap();
        let result = svc.get_result(kind, &id.to_string()).unwrap();
        assert_eq!(result.status, OperationStatus::Completed);
        assert_eq!(result.data.unwrap()["assertion"][0], "<a> <b> <c> .");
    }

    #[test]
    fn test_remote_error_does_not_touch_local_record() {
        let svc = service();
        let kind = OperationKind::Publish;
        let id = svc.generate_operation_id(kind, OperationStatus::start(kind)).unwrap();
        svc.ensure_remote_record(id, kind).unwrap();

        assert!(!svc.record_remote_error(id, "bad", ErrorType::PublishRemoteError).unwrap());
        assert!(!svc
            .update_remote_status(id, OperationStatus::phase(kind, Phase::RemoteInitStart))
            .unwrap());
        assert_eq!(
            svc.get_operation_record(id).unwrap().unwrap().status,
            OperationStatus::start(kind)
        );
    }

    #[test]
    fn test_get_result_validates_id_and_kind() {
        let svc = service();
        assert!(matches!(
            svc.get_result(OperationKind::Get, "nope"),
            Err(NodeError::InvalidOperationId(_))
        ));
        let id = svc
            .generate_operation_id(OperationKind::Ask, OperationStatus::start(OperationKind::Ask))
            .unwrap();
        assert!(matches!(
            svc.get_result(OperationKind::Get, &id.to_string()),
            Err(NodeError::OperationNotFound(_))
        ));
    }
}
