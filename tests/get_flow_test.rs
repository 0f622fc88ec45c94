//! GET and ASK across a small cluster

mod common;

use std::time::Duration;

use serde_json::json;

use common::*;
use dkg_node::collaborators::{Network, PeerId};
use dkg_node::operation::{OperationId, OperationKind, OperationStatus};
use dkg_node::pipeline::{AskRequest, FetchRequest};
use dkg_node::protocol::get::GetState;
use dkg_node::protocol::{Protocol, ProtocolMessage};
use dkg_node::storage::calculate_assertion_id;

fn fetch(token_id: u64) -> FetchRequest {
    FetchRequest {
        ual: ual(token_id),
        state: GetState::Latest,
        assertion_id: None,
    }
}

// =============================================================================
// GET
// =============================================================================

#[tokio::test]
async fn test_get_fetches_from_holder() {
    let cluster = TestCluster::start(3);
    let nquads = sample_assertion("get-a");
    cluster.mint(20, &nquads);

    let stored = cluster
        .node(1)
        .local_store(asset_request(20, &nquads, None))
        .unwrap();
    let result = wait_for_terminal(cluster.node(1), OperationKind::LocalStore, stored).await;
    assert_eq!(result.status, OperationStatus::Completed);

    let id = cluster.node(0).get(fetch(20)).unwrap();
    let result = wait_for_terminal(cluster.node(0), OperationKind::Get, id).await;

    assert_eq!(result.status, OperationStatus::Completed);
    let data = result.data.unwrap();
    assert_eq!(data["assertionId"], json!(calculate_assertion_id(&nquads)));
    let mut fetched: Vec<String> = serde_json::from_value(data["assertion"].clone()).unwrap();
    let mut expected = nquads.clone();
    fetched.sort();
    expected.sort();
    assert_eq!(fetched, expected);
    assert_eq!(
        status_history(cluster.node(0), id),
        vec![
            "GET_START",
            "GET_INIT_START",
            "GET_INIT_END",
            "GET_LOCAL_START",
            "GET_LOCAL_END",
            "GET_FIND_NODES_START",
            "GET_FIND_NODES_END",
            "GET_FETCH_START",
            "GET_FETCH_END",
            "COMPLETED",
        ]
    );

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_get_served_locally() {
    let cluster = TestCluster::start(1);
    let nquads = sample_assertion("get-b");
    let node = cluster.node(0);

    let stored = node.local_store(asset_request(21, &nquads, None)).unwrap();
    wait_for_terminal(node, OperationKind::LocalStore, stored).await;

    let id = node.get(fetch(21)).unwrap();
    let result = wait_for_terminal(node, OperationKind::Get, id).await;
    assert_eq!(result.status, OperationStatus::Completed);
    assert_eq!(
        result.data.unwrap()["assertionId"],
        json!(calculate_assertion_id(&nquads))
    );

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_get_fails_when_nobody_holds_the_asset() {
    let cluster = TestCluster::start(3);
    cluster.mint(22, &sample_assertion("get-c"));

    let id = cluster.node(0).get(fetch(22)).unwrap();
    let result = wait_for_terminal(cluster.node(0), OperationKind::Get, id).await;

    assert_eq!(result.status, OperationStatus::Failed);
    let data = result.data.unwrap();
    assert_eq!(data["errorType"], json!("GetNetworkError"));
    assert!(data["errorMessage"]
        .as_str()
        .unwrap()
        .contains("Unable to get assertion"));

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_get_with_no_peers_fails() {
    let cluster = TestCluster::start(1);
    cluster.mint(23, &sample_assertion("get-d"));

    let id = cluster.node(0).get(fetch(23)).unwrap();
    let result = wait_for_terminal(cluster.node(0), OperationKind::Get, id).await;

    assert_eq!(result.status, OperationStatus::Failed);
    assert!(result.data.unwrap()["errorMessage"]
        .as_str()
        .unwrap()
        .contains("no peers to ask"));

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_get_receiver_nack_lists_closer_peers() {
    let cluster = TestCluster::start(3);
    let outsider = cluster.hub.connect(PeerId::from("outsider"));

    let response = outsider
        .send_message(
            Protocol::Get.id(),
            &PeerId::from("node-1"),
            ProtocolMessage::request(OperationId::new(), json!({ "ual": ual(24) })),
            Duration::from_secs(2),
        )
        .await
        .unwrap();

    assert!(!response.is_ack());
    assert!(response.error_message().contains("Unable to find assertion"));
    let nodes: Vec<PeerId> =
        serde_json::from_value(response.message_data["nodes"].clone()).unwrap();
    assert!(!nodes.contains(&PeerId::from("node-1")));
    assert!(!nodes.contains(&PeerId::from("outsider")));

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_get_rejects_malformed_ual() {
    let cluster = TestCluster::start(1);
    let result = cluster.node(0).get(FetchRequest {
        ual: "not-a-ual".to_string(),
        state: GetState::Latest,
        assertion_id: None,
    });
    assert!(result.is_err());
    cluster.shutdown().await;
}

// =============================================================================
// ASK
// =============================================================================

#[tokio::test]
async fn test_ask_counts_holders() {
    let cluster = TestCluster::start(3);
    let nquads = sample_assertion("ask-a");
    cluster.mint(25, &nquads);
    for index in [1, 2] {
        let node = cluster.node(index);
        let id = node.local_store(asset_request(25, &nquads, None)).unwrap();
        wait_for_terminal(node, OperationKind::LocalStore, id).await;
    }

    let id = cluster
        .node(0)
        .ask(AskRequest {
            ual: vec![ual(25)],
            minimum_number_of_node_replications: Some(2),
        })
        .unwrap();
    let result = wait_for_terminal(cluster.node(0), OperationKind::Ask, id).await;

    assert_eq!(result.status, OperationStatus::Completed);
    let data = result.data.unwrap();
    assert_eq!(data["completedNodes"], json!(2));
    assert_eq!(data["allNodesReplicatedData"], json!(true));
    assert_eq!(
        status_history(cluster.node(0), id),
        vec![
            "ASK_START",
            "ASK_INIT_START",
            "ASK_INIT_END",
            "ASK_FIND_NODES_START",
            "ASK_FIND_NODES_END",
            "ASK_FETCH_START",
            "ASK_FETCH_END",
            "COMPLETED",
        ]
    );

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_ask_fails_when_assets_are_missing() {
    let cluster = TestCluster::start(2);
    cluster.mint(26, &sample_assertion("ask-b"));

    let id = cluster
        .node(0)
        .ask(AskRequest {
            ual: vec![ual(26)],
            minimum_number_of_node_replications: Some(1),
        })
        .unwrap();
    let result = wait_for_terminal(cluster.node(0), OperationKind::Ask, id).await;

    assert_eq!(result.status, OperationStatus::Failed);
    let data = result.data.unwrap();
    assert_eq!(data["errorType"], json!("AskNetworkError"));
    assert!(data["errorMessage"].as_str().unwrap().contains("assets missing"));

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_ask_requires_a_ual() {
    let cluster = TestCluster::start(1);
    let result = cluster.node(0).ask(AskRequest {
        ual: vec![],
        minimum_number_of_node_replications: None,
    });
    assert!(result.is_err());
    cluster.shutdown().await;
}
