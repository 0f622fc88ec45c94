//! Everything a command or protocol handler needs, passed explicitly.

use std::sync::Arc;

use crate::bid::BidValidator;
use crate::collaborators::{Blockchain, NeighborhoodResolver, Network, PeerId, Signer};
use crate::command::CommandScheduler;
use crate::config::Config;
use crate::operation::OperationService;
use crate::quorum::QuorumTracker;
use crate::storage::{AssetStore, FinalityStore, PendingStorage};

pub struct NodeContext {
    pub config: Config,
    pub operations: Arc<OperationService>,
    pub scheduler: CommandScheduler,
    pub assets: AssetStore,
    pub pending: Arc<PendingStorage>,
    pub finality: FinalityStore,
    pub blockchain: Arc<dyn Blockchain>,
    pub network: Arc<dyn Network>,
    pub neighborhood: Arc<dyn NeighborhoodResolver>,
    pub signer: Arc<dyn Signer>,
    pub bids: BidValidator,
    pub quorum: QuorumTracker,
}

impl NodeContext {
    pub fn peer_id(&self) -> PeerId {
        self.network.peer_id()
    }

    pub fn message_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.config.protocol.message_timeout_ms)
    }
}
