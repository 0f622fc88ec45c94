//! Node assembly: storage, operation service, command executor and protocol
//! receivers wired around one network endpoint.

use std::sync::Arc;

use tracing::info;

use crate::bid::BidValidator;
use crate::collaborators::{
    Blockchain, Ed25519Signer, InMemoryChain, InboundHandler, LocalNetwork, LocalNetworkHub,
    MemoryTripleStore, NeighborhoodResolver, Network, PeerId, PeerRecord, ShardingTable, Signer,
    TripleStore,
};
use crate::command::{CommandExecutor, CommandScheduler, CommandStore, ExecutorHandle};
use crate::config::Config;
use crate::context::NodeContext;
use crate::db::Database;
use crate::error::Result;
use crate::operation::{OperationCache, OperationId, OperationKind, OperationRegistry, OperationResult, OperationService};
use crate::pipeline::{self, AskRequest, AssetRequest, FetchRequest};
use crate::protocol::ask::AskReceiver;
use crate::protocol::finality::FinalityReceiver;
use crate::protocol::get::GetReceiver;
use crate::protocol::publish::PublishReceiver;
use crate::protocol::update::UpdateReceiver;
use crate::protocol::{Protocol, ProtocolDispatcher};
use crate::quorum::QuorumTracker;
use crate::storage::{AssetStore, FinalityStore, PendingStorage};
use crate::time::now_millis;

/// Collects collaborators; anything left unset gets its in-process default.
pub struct NodeBuilder {
    config: Config,
    persistent: bool,
    network: Option<Arc<LocalNetwork>>,
    blockchain: Option<Arc<dyn Blockchain>>,
    triple_store: Option<Arc<dyn TripleStore>>,
    neighborhood: Option<Arc<dyn NeighborhoodResolver>>,
    signer: Option<Arc<dyn Signer>>,
}

impl NodeBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            persistent: true,
            network: None,
            blockchain: None,
            triple_store: None,
            neighborhood: None,
            signer: None,
        }
    }

    /// Keep everything in memory instead of under `node.data_dir`.
    pub fn in_memory(mut self) -> Self {
        self.persistent = false;
        self
    }

    pub fn network(mut self, network: Arc<LocalNetwork>) -> Self {
        self.network = Some(network);
        self
    }

    pub fn blockchain(mut self, blockchain: Arc<dyn Blockchain>) -> Self {
        self.blockchain = Some(blockchain);
        self
    }

    pub fn triple_store(mut self, triple_store: Arc<dyn TripleStore>) -> Self {
        self.triple_store = Some(triple_store);
        self
    }

    pub fn neighborhood(mut self, neighborhood: Arc<dyn NeighborhoodResolver>) -> Self {
        self.neighborhood = Some(neighborhood);
        self
    }

    pub fn signer(mut self, signer: Arc<dyn Signer>) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Open storage, replay unfinished commands and start accepting
    /// protocol messages. Must run inside a tokio runtime.
    pub fn start(self) -> Result<Node> {
        let config = self.config;
        let data_dir = config.node.data_dir.clone();

        let (db, cache, pending) = if self.persistent {
            std::fs::create_dir_all(&data_dir)?;
            let cache = if config.operations.file_cache {
                OperationCache::with_dir(&data_dir.join("operation_cache"))?
            } else {
                OperationCache::in_memory()
            };
            (
                Database::open(&data_dir.join("node.db"))?,
                cache,
                PendingStorage::with_dir(&data_dir.join("pending_storage"))?,
            )
        } else {
            (
                Database::open_in_memory()?,
                OperationCache::in_memory(),
                PendingStorage::in_memory(),
            )
        };

        let network = self.network.unwrap_or_else(|| {
            LocalNetworkHub::new().connect(PeerId::new(config.node.peer_id.clone()))
        });
        let blockchain = self.blockchain.unwrap_or_else(|| {
            Arc::new(InMemoryChain::new(
                config.chain.implementations.clone(),
                config.chain.r0,
                config.chain.r2,
            ))
        });
        let triple_store = self
            .triple_store
            .unwrap_or_else(|| Arc::new(MemoryTripleStore::new()));
        let neighborhood = match self.neighborhood {
            Some(n) => n,
            None => standalone_table(&config, &network.peer_id()),
        };
        let signer = self
            .signer
            .unwrap_or_else(|| Arc::new(Ed25519Signer::generate()));

        let operations = Arc::new(OperationService::new(OperationRegistry::new(db.clone()), cache));
        let (scheduler, inbox) = CommandScheduler::new(CommandStore::new(db.clone()));
        let ctx = Arc::new(NodeContext {
            bids: BidValidator::new(blockchain.clone(), config.node.ask.clone()),
            config: config.clone(),
            operations: operations.clone(),
            scheduler: scheduler.clone(),
            assets: AssetStore::new(triple_store),
            pending: Arc::new(pending),
            finality: FinalityStore::new(db),
            blockchain,
            network: network.clone(),
            neighborhood,
            signer,
            quorum: QuorumTracker::new(),
        });

        let handlers = pipeline::build_registry(&ctx);
        handlers.verify()?;
        let executor = CommandExecutor::new(scheduler, handlers, operations.clone(), config.commands.clone())
            .start(inbox)?;

        let mut dispatcher = ProtocolDispatcher::new(operations, network.clone());
        dispatcher.register(Protocol::Store, Arc::new(PublishReceiver::new(ctx.clone())));
        dispatcher.register(Protocol::Get, Arc::new(GetReceiver::new(ctx.clone())));
        dispatcher.register(Protocol::Update, Arc::new(UpdateReceiver::new(ctx.clone())));
        dispatcher.register(Protocol::Ask, Arc::new(AskReceiver::new(ctx.clone())));
        dispatcher.register(Protocol::Finality, Arc::new(FinalityReceiver::new(ctx.clone())));
        let dispatcher: Arc<dyn InboundHandler> = Arc::new(dispatcher);
        network.set_inbound_handler(Arc::downgrade(&dispatcher));

        info!(peer_id = %ctx.peer_id(), persistent = self.persistent, "Node started");
        Ok(Node {
            ctx,
            _dispatcher: dispatcher,
            executor,
        })
    }
}

/// Single-peer sharding table so a standalone node can serve itself.
fn standalone_table(config: &Config, peer_id: &PeerId) -> Arc<dyn NeighborhoodResolver> {
    let table = ShardingTable::new();
    table.upsert(PeerRecord {
        peer_id: peer_id.clone(),
        ask: config.node.ask.clone(),
        stake: 0,
        last_seen: now_millis(),
    });
    Arc::new(table)
}

/// A running node. Dropping it stops inbound handling.
pub struct Node {
    ctx: Arc<NodeContext>,
    _dispatcher: Arc<dyn InboundHandler>,
    executor: ExecutorHandle,
}

impl Node {
    pub fn context(&self) -> &Arc<NodeContext> {
        &self.ctx
    }

    pub fn peer_id(&self) -> PeerId {
        self.ctx.peer_id()
    }

    pub fn publish(&self, request: AssetRequest) -> Result<OperationId> {
        pipeline::start_publish(&self.ctx, request)
    }

    pub fn update(&self, request: AssetRequest) -> Result<OperationId> {
        pipeline::start_update(&self.ctx, request)
    }

    pub fn local_store(&self, request: AssetRequest) -> Result<OperationId> {
        pipeline::start_local_store(&self.ctx, request)
    }

    pub fn get(&self, request: FetchRequest) -> Result<OperationId> {
        pipeline::start_get(&self.ctx, request)
    }

    pub fn ask(&self, request: AskRequest) -> Result<OperationId> {
        pipeline::start_ask(&self.ctx, request)
    }

    pub fn result(&self, kind: OperationKind, operation_id: &str) -> Result<OperationResult> {
        self.ctx.operations.get_result(kind, operation_id)
    }

    /// Finality acknowledgements received for `ual`.
    pub fn finality_count(&self, ual: &str) -> Result<u64> {
        self.ctx.finality.count_for_ual(ual)
    }

    pub async fn shutdown(self) {
        self.executor.shutdown().await;
        info!(peer_id = %self.ctx.peer_id(), "Node stopped");
    }
}
