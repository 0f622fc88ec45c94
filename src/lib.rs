//! dkg-node: protocol operation pipeline for a decentralized knowledge-graph node
//!
//! - Durable command executor with retries, repeats and replay after restart
//! - Operation lifecycle registry and two-tier payload cache
//! - Receiver-side handling of the publish, get, update, ask and finality protocols
//! - Bid admission against on-chain service agreements
//! - Quorum tracking for replication and fetches

pub mod api;
pub mod bid;
pub mod collaborators;
pub mod command;
pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod node;
pub mod operation;
pub mod pipeline;
pub mod protocol;
pub mod quorum;
pub mod storage;
pub mod time;

pub use config::Config;
pub use error::{NodeError, Result};
pub use node::{Node, NodeBuilder};
