//! Housekeeping commands run by a live node

mod common;

use serde_json::json;

use common::*;
use dkg_node::bid::agreement_id;
use dkg_node::collaborators::{PeerId, Repository, TripleStore};
use dkg_node::command::{Command, CommandName, CommandStatus};
use dkg_node::operation::{OperationId, OperationKind, OperationStatus};
use dkg_node::protocol::validation::AssetParams;
use dkg_node::storage::{calculate_assertion_id, default_keyword, PendingState};
use dkg_node::time::now_millis;

fn asset(token_id: u64, assertion_id: &str) -> AssetParams {
    AssetParams {
        blockchain: BLOCKCHAIN.to_string(),
        contract: CONTRACT.to_string(),
        token_id,
        keyword: default_keyword(CONTRACT, assertion_id),
        hash_function_id: 1,
        assertion_id: assertion_id.to_string(),
    }
}

async fn wait_for_command(cluster: &TestCluster, id: i64, status: CommandStatus) {
    let store = cluster.node(0).context().scheduler.store().clone();
    eventually(|| store.get(id).unwrap().map(|c| c.status) == Some(status)).await;
}

#[tokio::test]
async fn test_quorum_deadline_fails_open_replication() {
    let cluster = TestCluster::start(1);
    let ctx = cluster.node(0).context().clone();
    let kind = OperationKind::Publish;
    let op = ctx
        .operations
        .generate_operation_id(kind, OperationStatus::start(kind))
        .unwrap();
    ctx.quorum
        .open(op, vec![PeerId::from("node-0"), PeerId::from("node-9")], 2)
        .unwrap();

    ctx.scheduler
        .schedule(Command::for_operation(
            CommandName::QuorumDeadline,
            op,
            json!({ "kind": kind }),
            vec![],
        ))
        .unwrap();

    let node = cluster.node(0);
    let result = wait_for_terminal(node, kind, op).await;
    assert_eq!(result.status, OperationStatus::Failed);
    let data = result.data.unwrap();
    assert_eq!(data["errorType"], json!("QuorumTimeoutError"));
    assert!(data["errorMessage"]
        .as_str()
        .unwrap()
        .contains("deadline passed with 0 of 2 required acks"));
    assert!(ctx.quorum.is_empty());

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_quorum_deadline_leaves_finished_operation() {
    let cluster = TestCluster::start(1);
    let ctx = cluster.node(0).context().clone();
    let kind = OperationKind::Publish;
    let op = ctx
        .operations
        .generate_operation_id(kind, OperationStatus::start(kind))
        .unwrap();
    ctx.operations.complete(op, None, true).unwrap();

    let id = ctx
        .scheduler
        .schedule(Command::for_operation(
            CommandName::QuorumDeadline,
            op,
            json!({ "kind": kind }),
            vec![],
        ))
        .unwrap();
    wait_for_command(&cluster, id, CommandStatus::Completed).await;

    let result = cluster.node(0).result(kind, &op.to_string()).unwrap();
    assert_eq!(result.status, OperationStatus::Completed);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_epoch_check_stops_without_agreement() {
    let cluster = TestCluster::start(1);
    let ctx = cluster.node(0).context().clone();
    let assertion_id = calculate_assertion_id(&sample_assertion("epoch-a"));

    let id = ctx
        .scheduler
        .schedule(Command::for_operation(
            CommandName::EpochCheck,
            OperationId::new(),
            json!({
                "asset": asset(50, &assertion_id),
                "agreementId": "0xmissing",
            }),
            vec![],
        ))
        .unwrap();

    wait_for_command(&cluster, id, CommandStatus::Completed).await;
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_epoch_check_restores_lost_replica() {
    let cluster = TestCluster::start(3);
    let nquads = sample_assertion("epoch-b");
    let assertion_id = cluster.mint(52, &nquads);
    let id = cluster
        .node(0)
        .publish(asset_request(52, &nquads, Some(3)))
        .unwrap();
    let result = wait_for_terminal(cluster.node(0), OperationKind::Publish, id).await;
    assert_eq!(result.status, OperationStatus::Completed);

    let holder = cluster.node(1).context().clone();
    holder
        .assets
        .delete_asset(Repository::PublicCurrent, &ual(52))
        .await
        .unwrap();
    assert_eq!(cluster.nodes[1].store.metadata_count(Repository::PublicCurrent), 0);

    let keyword = default_keyword(CONTRACT, &assertion_id);
    holder
        .scheduler
        .schedule(Command::for_operation(
            CommandName::EpochCheck,
            id,
            json!({
                "asset": asset(52, &assertion_id),
                "agreementId": agreement_id(CONTRACT, 52, &keyword, 1),
            }),
            vec![],
        ))
        .unwrap();

    let store = cluster.nodes[1].store.clone();
    eventually(|| store.metadata_count(Repository::PublicCurrent) == 1).await;
    let restored = store
        .asset_metadata(Repository::PublicCurrent, &ual(52))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(restored.assertion_id, assertion_id);
    let mut stored = store
        .get_assertion(Repository::PublicCurrent, &assertion_id)
        .await
        .unwrap()
        .unwrap();
    let mut expected = nquads.clone();
    stored.sort();
    expected.sort();
    assert_eq!(stored, expected);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_unfinalized_pending_state_is_dropped() {
    let cluster = TestCluster::start(1);
    let ctx = cluster.node(0).context().clone();
    let nquads = sample_assertion("pending-a");
    let assertion_id = cluster.stage_update(51, &nquads);

    ctx.pending
        .cache(PendingState {
            ual: ual(51),
            assertion_id: assertion_id.clone(),
            nquads: nquads.clone(),
            operation_id: OperationId::new(),
            keyword: default_keyword(CONTRACT, &assertion_id),
            created_at: now_millis(),
        })
        .unwrap();

    let id = ctx
        .scheduler
        .schedule(Command::for_operation(
            CommandName::DeletePendingState,
            OperationId::new(),
            json!({ "asset": asset(51, &assertion_id) }),
            vec![],
        ))
        .unwrap();
    wait_for_command(&cluster, id, CommandStatus::Completed).await;

    assert!(ctx.pending.is_empty());
    let stored = cluster.nodes[0]
        .store
        .asset_metadata(Repository::PublicCurrent, &ual(51))
        .await
        .unwrap();
    assert!(stored.is_none());

    cluster.shutdown().await;
}
