//! Publish and update flows across a small cluster
//!
//! - Replication to the whole neighborhood with finality acknowledgements
//! - Bid rejection failing the quorum
//! - Receiver-side INIT/REQUEST handling driven directly over the network
//! - Update co-signatures and pending state promotion

mod common;

use std::time::Duration;

use serde_json::json;

use common::*;
use dkg_node::collaborators::{Network, PeerId, Repository, TripleStore};
use dkg_node::operation::{OperationId, OperationKind, OperationStatus};
use dkg_node::pipeline::FetchRequest;
use dkg_node::protocol::get::GetState;
use dkg_node::protocol::validation::AssetParams;
use dkg_node::protocol::{Protocol, ProtocolMessage};
use dkg_node::storage::default_keyword;

// =============================================================================
// Publish
// =============================================================================

#[tokio::test]
async fn test_publish_reaches_quorum_and_collects_finality() {
    let cluster = TestCluster::start(3);
    let nquads = sample_assertion("publish-a");
    cluster.mint(1, &nquads);

    let id = cluster
        .node(0)
        .publish(asset_request(1, &nquads, Some(3)))
        .unwrap();
    let result = wait_for_terminal(cluster.node(0), OperationKind::Publish, id).await;

    assert_eq!(result.status, OperationStatus::Completed);
    assert_eq!(result.data.unwrap()["minAcksReached"], json!(true));
    for test_node in &cluster.nodes {
        assert_eq!(test_node.store.metadata_count(Repository::PublicCurrent), 1);
        assert_eq!(test_node.store.assertion_writes(), 1);
    }

    // every replica holder, the publisher included, reports back once
    let publisher = cluster.node(0);
    eventually(|| publisher.finality_count(&ual(1)).unwrap() == 3).await;

    assert_eq!(
        status_history(publisher, id),
        vec![
            "PUBLISH_START",
            "PUBLISH_INIT_START",
            "PUBLISH_INIT_END",
            "PUBLISH_VALIDATE_ASSERTION_START",
            "PUBLISH_VALIDATE_ASSERTION_END",
            "PUBLISH_FIND_NODES_START",
            "PUBLISH_FIND_NODES_END",
            "PUBLISH_REPLICATE_START",
            "PUBLISH_REPLICATE_END",
            "COMPLETED",
        ]
    );

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_publish_fails_when_bids_are_rejected() {
    let cluster = TestCluster::start(3);
    let nquads = sample_assertion("publish-b");
    cluster.mint(2, &nquads);
    cluster.node(1).context().bids.set_ask("100");
    cluster.node(2).context().bids.set_ask("100");

    let id = cluster
        .node(0)
        .publish(asset_request(2, &nquads, Some(2)))
        .unwrap();
    let result = wait_for_terminal(cluster.node(0), OperationKind::Publish, id).await;

    assert_eq!(result.status, OperationStatus::Failed);
    let data = result.data.unwrap();
    assert_eq!(data["errorType"], json!("PublishReplicateError"));
    let message = data["errorMessage"].as_str().unwrap();
    assert!(message.contains("node-1: Bid too low"));
    assert!(message.contains("node-2: Bid too low"));
    assert_eq!(
        status_history(cluster.node(0), id),
        vec![
            "PUBLISH_START",
            "PUBLISH_INIT_START",
            "PUBLISH_INIT_END",
            "PUBLISH_VALIDATE_ASSERTION_START",
            "PUBLISH_VALIDATE_ASSERTION_END",
            "PUBLISH_FIND_NODES_START",
            "PUBLISH_FIND_NODES_END",
            "PUBLISH_REPLICATE_START",
            "FAILED",
        ]
    );

    // the rejecting receivers keep a failed record of their own
    for index in [1, 2] {
        let record = cluster
            .node(index)
            .context()
            .operations
            .get_operation_record(id)
            .unwrap()
            .unwrap();
        assert_eq!(record.status, OperationStatus::Failed);
    }
    assert_eq!(cluster.nodes[1].store.assertion_writes(), 0);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_publish_fails_without_enough_nodes() {
    let cluster = TestCluster::start(2);
    let nquads = sample_assertion("publish-c");
    cluster.mint(3, &nquads);

    let id = cluster
        .node(0)
        .publish(asset_request(3, &nquads, Some(3)))
        .unwrap();
    let result = wait_for_terminal(cluster.node(0), OperationKind::Publish, id).await;

    assert_eq!(result.status, OperationStatus::Failed);
    assert_eq!(result.data.unwrap()["errorType"], json!("PublishFindNodesError"));

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_publish_rejects_assertion_not_on_chain() {
    let cluster = TestCluster::start(1);
    let nquads = sample_assertion("publish-d");
    cluster.mint(4, &sample_assertion("something-else"));

    let id = cluster
        .node(0)
        .publish(asset_request(4, &nquads, Some(1)))
        .unwrap();
    let result = wait_for_terminal(cluster.node(0), OperationKind::Publish, id).await;

    assert_eq!(result.status, OperationStatus::Failed);
    assert_eq!(
        result.data.unwrap()["errorType"],
        json!("PublishValidateAssertionError")
    );

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_publish_request_validation_is_synchronous() {
    let cluster = TestCluster::start(1);
    let node = cluster.node(0);

    assert!(node.publish(asset_request(5, &[], None)).is_err());
    assert!(node
        .publish(asset_request(5, &sample_assertion("x"), Some(0)))
        .is_err());
    let mut request = asset_request(5, &sample_assertion("x"), None);
    request.blockchain = "unknown:1".to_string();
    assert!(node.publish(request).is_err());

    cluster.shutdown().await;
}

// =============================================================================
// Receiver side, driven by a bare network endpoint
// =============================================================================

fn asset_params(token_id: u64, assertion_id: &str) -> AssetParams {
    AssetParams {
        blockchain: BLOCKCHAIN.to_string(),
        contract: CONTRACT.to_string(),
        token_id,
        keyword: default_keyword(CONTRACT, assertion_id),
        hash_function_id: 1,
        assertion_id: assertion_id.to_string(),
    }
}

#[tokio::test]
async fn test_store_receiver_is_idempotent() {
    let cluster = TestCluster::start_with(2, |c| c.protocol.send_finality_ack = false);
    let outsider = cluster.hub.connect(PeerId::from("outsider"));
    let target = PeerId::from("node-1");
    let timeout = Duration::from_secs(2);

    let nquads = sample_assertion("receiver-a");
    let assertion_id = cluster.mint(6, &nquads);
    let params = asset_params(6, &assertion_id);
    let op = OperationId::new();

    for _ in 0..2 {
        let response = outsider
            .send_message(
                Protocol::Store.id(),
                &target,
                ProtocolMessage::init(op, serde_json::to_value(&params).unwrap()),
                timeout,
            )
            .await
            .unwrap();
        assert!(response.is_ack(), "{}", response.error_message());
    }

    let mut request = serde_json::to_value(&params).unwrap();
    request["assertion"] = json!(nquads);
    for _ in 0..2 {
        let response = outsider
            .send_message(
                Protocol::Store.id(),
                &target,
                ProtocolMessage::request(op, request.clone()),
                timeout,
            )
            .await
            .unwrap();
        assert!(response.is_ack(), "{}", response.error_message());
    }

    assert_eq!(cluster.nodes[1].store.assertion_writes(), 1);
    assert_eq!(cluster.nodes[1].network.open_sessions(), 0);
    let record = cluster
        .node(1)
        .context()
        .operations
        .get_operation_record(op)
        .unwrap()
        .unwrap();
    assert_eq!(record.status, OperationStatus::Completed);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_store_receiver_rejects_tampered_request() {
    let cluster = TestCluster::start_with(1, |c| c.protocol.send_finality_ack = false);
    let outsider = cluster.hub.connect(PeerId::from("outsider"));
    let target = PeerId::from("node-0");
    let timeout = Duration::from_secs(2);

    let nquads = sample_assertion("receiver-b");
    let assertion_id = cluster.mint(7, &nquads);
    let params = asset_params(7, &assertion_id);

    // REQUEST without INIT
    let mut request = serde_json::to_value(&params).unwrap();
    request["assertion"] = json!(nquads);
    let response = outsider
        .send_message(
            Protocol::Store.id(),
            &target,
            ProtocolMessage::request(OperationId::new(), request),
            timeout,
        )
        .await
        .unwrap();
    assert!(!response.is_ack());
    assert!(response.error_message().contains("No accepted INIT"));

    // REQUEST whose content does not hash to the announced id
    let op = OperationId::new();
    let response = outsider
        .send_message(
            Protocol::Store.id(),
            &target,
            ProtocolMessage::init(op, serde_json::to_value(&params).unwrap()),
            timeout,
        )
        .await
        .unwrap();
    assert!(response.is_ack());
    let mut request = serde_json::to_value(&params).unwrap();
    request["assertion"] = json!(sample_assertion("forged"));
    let response = outsider
        .send_message(
            Protocol::Store.id(),
            &target,
            ProtocolMessage::request(op, request),
            timeout,
        )
        .await
        .unwrap();
    assert!(!response.is_ack());
    assert!(response.error_message().contains("Invalid assertion"));
    assert_eq!(cluster.nodes[0].store.assertion_writes(), 0);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_store_receiver_outside_neighbourhood_nacks() {
    let cluster = TestCluster::start_with(2, |c| c.protocol.send_finality_ack = false);
    cluster.table.remove(&PeerId::from("node-1"));
    let outsider = cluster.hub.connect(PeerId::from("outsider"));

    let nquads = sample_assertion("receiver-c");
    let assertion_id = cluster.mint(8, &nquads);
    let response = outsider
        .send_message(
            Protocol::Store.id(),
            &PeerId::from("node-1"),
            ProtocolMessage::init(
                OperationId::new(),
                serde_json::to_value(asset_params(8, &assertion_id)).unwrap(),
            ),
            Duration::from_secs(2),
        )
        .await
        .unwrap();
    assert!(!response.is_ack());
    assert!(response.error_message().contains("Invalid neighbourhood"));

    cluster.shutdown().await;
}

// =============================================================================
// Local store
// =============================================================================

#[tokio::test]
async fn test_local_store_writes_once() {
    let cluster = TestCluster::start(1);
    let node = cluster.node(0);
    let nquads = sample_assertion("local-a");

    let first = node.local_store(asset_request(9, &nquads, None)).unwrap();
    let result = wait_for_terminal(node, OperationKind::LocalStore, first).await;
    assert_eq!(result.status, OperationStatus::Completed);
    assert_eq!(result.data.unwrap()["assetWasNew"], json!(true));
    assert_eq!(
        status_history(node, first),
        vec![
            "LOCAL_STORE_START",
            "LOCAL_STORE_INIT_START",
            "LOCAL_STORE_INIT_END",
            "LOCAL_STORE_LOCAL_START",
            "LOCAL_STORE_LOCAL_END",
            "COMPLETED",
        ]
    );

    let second = node.local_store(asset_request(9, &nquads, None)).unwrap();
    let result = wait_for_terminal(node, OperationKind::LocalStore, second).await;
    assert_eq!(result.status, OperationStatus::Completed);
    assert_eq!(result.data.unwrap()["assetWasNew"], json!(false));
    assert_eq!(cluster.nodes[0].store.assertion_writes(), 1);

    cluster.shutdown().await;
}

// =============================================================================
// Update
// =============================================================================

#[tokio::test]
async fn test_update_collects_valid_signatures() {
    let cluster = TestCluster::start(3);
    cluster.mint(10, &sample_assertion("update-v1"));
    let next = sample_assertion("update-v2");
    let next_id = cluster.stage_update(10, &next);

    let id = cluster
        .node(0)
        .update(asset_request(10, &next, Some(3)))
        .unwrap();
    let result = wait_for_terminal(cluster.node(0), OperationKind::Update, id).await;

    assert_eq!(result.status, OperationStatus::Completed);
    let data = result.data.unwrap();
    assert_eq!(data["minAcksReached"], json!(true));
    assert_eq!(data["signatures"].as_array().unwrap().len(), 3);

    for test_node in &cluster.nodes {
        assert_eq!(test_node.node.context().pending.len(), 1);
        // nothing reaches current storage before finalization
        assert_eq!(test_node.store.metadata_count(Repository::PublicCurrent), 0);
    }

    // a LATEST get on a holder is served from pending state
    let holder = cluster.node(1);
    let get = holder
        .get(FetchRequest {
            ual: ual(10),
            state: GetState::Latest,
            assertion_id: None,
        })
        .unwrap();
    let result = wait_for_terminal(holder, OperationKind::Get, get).await;
    assert_eq!(result.status, OperationStatus::Completed);
    assert_eq!(result.data.unwrap()["assertionId"], json!(next_id));

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_pending_state_promoted_after_finalization() {
    let cluster = TestCluster::start_with(1, |c| c.protocol.pending_state_ttl_ms = 1_000);
    cluster.mint(11, &sample_assertion("promote-v1"));
    let next = sample_assertion("promote-v2");
    let next_id = cluster.stage_update(11, &next);

    let id = cluster
        .node(0)
        .update(asset_request(11, &next, Some(1)))
        .unwrap();
    let result = wait_for_terminal(cluster.node(0), OperationKind::Update, id).await;
    assert_eq!(result.status, OperationStatus::Completed);
    cluster.chain.finalize(BLOCKCHAIN, CONTRACT, 11);

    let pending = cluster.node(0).context().pending.clone();
    eventually(|| pending.is_empty()).await;

    let metadata = cluster.nodes[0]
        .store
        .asset_metadata(Repository::PublicCurrent, &ual(11))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(metadata.assertion_id, next_id);

    cluster.shutdown().await;
}
