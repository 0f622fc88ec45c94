//! Finality acknowledgements arriving at the publisher

mod common;

use std::time::Duration;

use serde_json::json;

use common::*;
use dkg_node::collaborators::{Network, PeerId};
use dkg_node::operation::{OperationId, OperationKind, OperationStatus};
use dkg_node::protocol::{Protocol, ProtocolMessage};

#[tokio::test]
async fn test_duplicate_finality_is_recorded_once() {
    let cluster = TestCluster::start(1);
    let outsider = cluster.hub.connect(PeerId::from("outsider"));
    let publish_operation_id = OperationId::new();
    let payload = json!({
        "ual": ual(40),
        "publishOperationId": publish_operation_id,
    });

    let mut recorded = Vec::new();
    for _ in 0..2 {
        let response = outsider
            .send_message(
                Protocol::Finality.id(),
                &PeerId::from("node-0"),
                ProtocolMessage::request(OperationId::new(), payload.clone()),
                Duration::from_secs(2),
            )
            .await
            .unwrap();
        assert!(response.is_ack(), "{}", response.error_message());
        recorded.push(response.message_data["recorded"].clone());
    }

    assert_eq!(recorded, vec![json!(true), json!(false)]);
    assert_eq!(cluster.node(0).finality_count(&ual(40)).unwrap(), 1);
    assert_eq!(
        cluster
            .node(0)
            .context()
            .finality
            .count_for_operation(publish_operation_id)
            .unwrap(),
        1
    );

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_finality_with_bad_ual_is_rejected() {
    let cluster = TestCluster::start(1);
    let outsider = cluster.hub.connect(PeerId::from("outsider"));

    let response = outsider
        .send_message(
            Protocol::Finality.id(),
            &PeerId::from("node-0"),
            ProtocolMessage::request(
                OperationId::new(),
                json!({ "ual": "bogus", "publishOperationId": OperationId::new() }),
            ),
            Duration::from_secs(2),
        )
        .await
        .unwrap();

    assert!(!response.is_ack());
    assert!(response.error_message().contains("invalid UAL"));
    assert_eq!(cluster.node(0).finality_count("bogus").unwrap(), 0);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_replica_holders_report_finality_operations() {
    let cluster = TestCluster::start(2);
    let nquads = sample_assertion("finality-a");
    cluster.mint(41, &nquads);

    let id = cluster
        .node(0)
        .publish(asset_request(41, &nquads, Some(2)))
        .unwrap();
    let result = wait_for_terminal(cluster.node(0), OperationKind::Publish, id).await;
    assert_eq!(result.status, OperationStatus::Completed);

    let publisher = cluster.node(0);
    eventually(|| publisher.finality_count(&ual(41)).unwrap() == 2).await;
    assert_eq!(
        publisher.context().finality.count_for_operation(id).unwrap(),
        2
    );

    cluster.shutdown().await;
}
