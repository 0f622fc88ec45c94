//! Narrow interfaces to the systems the pipeline consumes, plus in-process
//! reference implementations used by the standalone node and the tests.

pub mod blockchain;
pub mod neighborhood;
pub mod network;
pub mod signer;
pub mod storage;

pub use blockchain::{AgreementData, Blockchain, InMemoryChain};
pub use neighborhood::{NeighborhoodResolver, PeerRecord, ShardingTable};
pub use network::{InboundHandler, LocalNetwork, LocalNetworkHub, Network, PeerId};
pub use signer::{Ed25519Signer, Signature, Signer};
pub use storage::{AssetMetadata, MemoryTripleStore, Repository, TripleStore};
