//! Shared fixtures: a cluster of nodes on one in-process network, sharing a
//! chain view and a sharding table.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use dkg_node::bid::agreement_id;
use dkg_node::collaborators::{
    AgreementData, InMemoryChain, LocalNetwork, LocalNetworkHub, MemoryTripleStore, PeerId,
    PeerRecord, ShardingTable,
};
use dkg_node::operation::{OperationId, OperationKind, OperationResult, OperationStatus};
use dkg_node::pipeline::AssetRequest;
use dkg_node::storage::{assertion_size, calculate_assertion_id, default_keyword, format_ual};
use dkg_node::time::{now_millis, now_secs};
use dkg_node::{Config, Node, NodeBuilder};

pub const BLOCKCHAIN: &str = "hardhat:31337";
pub const CONTRACT: &str = "0xabcdef0123456789abcdef0123456789abcdef01";

pub struct TestNode {
    pub node: Node,
    pub network: Arc<LocalNetwork>,
    pub store: Arc<MemoryTripleStore>,
}

pub struct TestCluster {
    pub hub: Arc<LocalNetworkHub>,
    pub chain: Arc<InMemoryChain>,
    pub table: Arc<ShardingTable>,
    pub nodes: Vec<TestNode>,
}

/// Fast timers, everything in memory.
pub fn test_config(peer_id: &str) -> Config {
    let mut config = Config::default();
    config.node.peer_id = peer_id.to_string();
    config.commands.tick_ms = 10;
    config.commands.default_retry_backoff_ms = 20;
    config.commands.default_repeat_interval_ms = 60_000;
    config.operations.timeout_ms = 10_000;
    config.operations.file_cache = false;
    config.protocol.message_timeout_ms = 2_000;
    config.protocol.pending_state_ttl_ms = 60_000;
    config
}

pub fn sample_assertion(tag: &str) -> Vec<String> {
    vec![
        format!("<urn:asset:{tag}> <http://schema.org/name> \"{tag}\" ."),
        format!("<urn:asset:{tag}> <http://schema.org/version> \"1\" ."),
        format!("<urn:asset:{tag}> <http://schema.org/description> \"sample {tag}\" ."),
    ]
}

pub fn ual(token_id: u64) -> String {
    format_ual(BLOCKCHAIN, CONTRACT, token_id)
}

impl TestCluster {
    pub fn start(size: usize) -> Self {
        Self::start_with(size, |_| {})
    }

    /// Start `size` nodes; `tweak` adjusts each node's config.
    pub fn start_with(size: usize, tweak: impl Fn(&mut Config)) -> Self {
        let hub = LocalNetworkHub::new();
        let chain = Arc::new(InMemoryChain::new(vec![BLOCKCHAIN.to_string()], 3, 20));
        let table = Arc::new(ShardingTable::new());

        let mut nodes = Vec::with_capacity(size);
        for i in 0..size {
            let peer_id = format!("node-{}", i);
            let mut config = test_config(&peer_id);
            tweak(&mut config);
            table.upsert(PeerRecord {
                peer_id: PeerId::new(peer_id.clone()),
                ask: config.node.ask.clone(),
                stake: 50_000,
                last_seen: now_millis(),
            });

            let network = hub.connect(PeerId::new(peer_id));
            let store = Arc::new(MemoryTripleStore::new());
            let node = NodeBuilder::new(config)
                .in_memory()
                .network(network.clone())
                .blockchain(chain.clone())
                .triple_store(store.clone())
                .neighborhood(table.clone())
                .start()
                .expect("node starts");
            nodes.push(TestNode {
                node,
                network,
                store,
            });
        }

        Self {
            hub,
            chain,
            table,
            nodes,
        }
    }

    pub fn node(&self, index: usize) -> &Node {
        &self.nodes[index].node
    }

    /// Put `nquads` on chain as the finalized state of `token_id`, with a
    /// funded service agreement. Returns the assertion id.
    pub fn mint(&self, token_id: u64, nquads: &[String]) -> String {
        let assertion_id = calculate_assertion_id(nquads);
        self.chain.set_latest_assertion(
            BLOCKCHAIN,
            CONTRACT,
            token_id,
            &assertion_id,
            assertion_size(nquads),
        );
        self.fund(token_id, &assertion_id);
        assertion_id
    }

    /// Put `nquads` on chain as the unfinalized state of `token_id`.
    pub fn stage_update(&self, token_id: u64, nquads: &[String]) -> String {
        let assertion_id = calculate_assertion_id(nquads);
        self.chain.set_unfinalized_assertion(
            BLOCKCHAIN,
            CONTRACT,
            token_id,
            &assertion_id,
            assertion_size(nquads),
        );
        self.fund(token_id, &assertion_id);
        assertion_id
    }

    fn fund(&self, token_id: u64, assertion_id: &str) {
        let keyword = default_keyword(CONTRACT, assertion_id);
        self.chain.set_agreement(
            &agreement_id(CONTRACT, token_id, &keyword, 1),
            AgreementData {
                token_amount: 1_000_000_000_000_000_000,
                epochs_number: 5,
                epoch_length: 3600,
                start_time: now_secs(),
                score_function_id: 1,
                proof_window_offset_percentage: 50,
            },
        );
    }

    pub async fn shutdown(self) {
        for test_node in self.nodes {
            test_node.node.shutdown().await;
        }
    }
}

pub fn asset_request(token_id: u64, nquads: &[String], min: Option<usize>) -> AssetRequest {
    AssetRequest {
        assertion: nquads.to_vec(),
        blockchain: BLOCKCHAIN.to_string(),
        contract: CONTRACT.to_string(),
        token_id,
        keyword: None,
        hash_function_id: None,
        minimum_number_of_node_replications: min,
    }
}

/// Poll until the operation is COMPLETED or FAILED.
pub async fn wait_for_terminal(node: &Node, kind: OperationKind, id: OperationId) -> OperationResult {
    for _ in 0..500 {
        let result = node.result(kind, &id.to_string()).expect("operation exists");
        if result.status == OperationStatus::Completed || result.status == OperationStatus::Failed {
            return result;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("operation {} never finished", id);
}

/// Poll `check` until it holds.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..250 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition never became true");
}

/// Status history of an operation as it would appear in the API, oldest first.
pub fn status_history(node: &Node, id: OperationId) -> Vec<String> {
    node.context()
        .operations
        .registry()
        .events(id)
        .unwrap()
        .into_iter()
        .map(|event| event.status.to_string())
        .collect()
}
