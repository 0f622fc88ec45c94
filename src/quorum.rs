//! Initiator-side response accounting.
//!
//! One `QuorumState` per operation collects ACKs and NACKs from the peers it
//! was sent to. The operation completes at the `min_acks`-th distinct ACK and
//! fails as soon as the NACKs make that impossible. A decision is handed out
//! exactly once; everything after it is recorded as a no-op.

use std::collections::{BTreeMap, HashSet};

use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, info};

use crate::collaborators::PeerId;
use crate::error::{NodeError, Result};
use crate::operation::OperationId;

/// A single peer's reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerResponse {
    Ack,
    Nack(String),
}

/// Terminal outcome of a quorum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "camelCase")]
pub enum QuorumDecision {
    Completed { acks: usize },
    Failed { reasons: Vec<String> },
}

impl QuorumDecision {
    /// NACK reasons joined for an operation error message.
    pub fn failure_message(&self) -> Option<String> {
        match self {
            QuorumDecision::Failed { reasons } => Some(reasons.join("; ")),
            QuorumDecision::Completed { .. } => None,
        }
    }
}

#[derive(Debug)]
struct QuorumState {
    neighborhood: HashSet<PeerId>,
    min_acks: usize,
    acks: HashSet<PeerId>,
    nacks: BTreeMap<PeerId, String>,
    decided: Option<QuorumDecision>,
}

impl QuorumState {
    fn reasons(&self) -> Vec<String> {
        self.nacks
            .iter()
            .map(|(peer, reason)| format!("{}: {}", peer, reason))
            .collect()
    }

    fn evaluate(&mut self) -> Option<QuorumDecision> {
        if self.decided.is_some() {
            return None;
        }
        let decision = if self.acks.len() >= self.min_acks {
            QuorumDecision::Completed {
                acks: self.acks.len(),
            }
        } else if self.nacks.len() > self.neighborhood.len().saturating_sub(self.min_acks) {
            QuorumDecision::Failed {
                reasons: self.reasons(),
            }
        } else {
            return None;
        };
        self.decided = Some(decision.clone());
        Some(decision)
    }
}

/// Counts seen so far, for logs and result payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuorumSnapshot {
    pub neighborhood: usize,
    pub min_acks: usize,
    pub acks: usize,
    pub nacks: usize,
    pub decided: Option<QuorumDecision>,
}

#[derive(Default)]
pub struct QuorumTracker {
    states: DashMap<OperationId, QuorumState>,
}

impl QuorumTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start counting for `operation_id`. Reopening keeps the existing state.
    pub fn open(
        &self,
        operation_id: OperationId,
        neighborhood: impl IntoIterator<Item = PeerId>,
        min_acks: usize,
    ) -> Result<()> {
        if min_acks == 0 {
            return Err(NodeError::Validation("minimum acks must be positive".to_string()));
        }
        let neighborhood: HashSet<PeerId> = neighborhood.into_iter().collect();
        if neighborhood.len() < min_acks {
            return Err(NodeError::QuorumUnreachable(format!(
                "{} peers cannot provide {} acks",
                neighborhood.len(),
                min_acks
            )));
        }
        self.states.entry(operation_id).or_insert_with(|| {
            debug!(operation_id = %operation_id, peers = neighborhood.len(), min_acks, "Quorum opened");
            QuorumState {
                neighborhood,
                min_acks,
                acks: HashSet::new(),
                nacks: BTreeMap::new(),
                decided: None,
            }
        });
        Ok(())
    }

    /// Record one reply. Returns the decision on the reply that produced it.
    /// Replies from outsiders, repeats from the same peer and anything after
    /// the decision change nothing.
    pub fn record(
        &self,
        operation_id: OperationId,
        peer: &PeerId,
        response: PeerResponse,
    ) -> Option<QuorumDecision> {
        let mut state = self.states.get_mut(&operation_id)?;
        if state.decided.is_some() {
            debug!(operation_id = %operation_id, peer = %peer, "Late response ignored");
            return None;
        }
        if !state.neighborhood.contains(peer)
            || state.acks.contains(peer)
            || state.nacks.contains_key(peer)
        {
            return None;
        }
        match response {
            PeerResponse::Ack => {
                state.acks.insert(peer.clone());
            }
            PeerResponse::Nack(reason) => {
                state.nacks.insert(peer.clone(), reason);
            }
        }
        let decision = state.evaluate();
        if let Some(d) = &decision {
            info!(operation_id = %operation_id, acks = state.acks.len(), nacks = state.nacks.len(), decision = ?d, "Quorum decided");
        }
        decision
    }

    /// Admit more candidate peers, e.g. closer nodes reported in a NACK.
    pub fn extend_neighborhood(
        &self,
        operation_id: OperationId,
        peers: impl IntoIterator<Item = PeerId>,
    ) -> usize {
        match self.states.get_mut(&operation_id) {
            Some(mut state) if state.decided.is_none() => {
                let before = state.neighborhood.len();
                state.neighborhood.extend(peers);
                state.neighborhood.len() - before
            }
            _ => 0,
        }
    }

    /// Force a decision for an operation whose deadline passed.
    pub fn expire(&self, operation_id: OperationId) -> Option<QuorumDecision> {
        let mut state = self.states.get_mut(&operation_id)?;
        if state.decided.is_some() {
            return None;
        }
        let mut reasons = state.reasons();
        reasons.push(format!(
            "deadline passed with {} of {} required acks",
            state.acks.len(),
            state.min_acks
        ));
        let decision = QuorumDecision::Failed { reasons };
        state.decided = Some(decision.clone());
        Some(decision)
    }

    /// Give up without a decision, e.g. after every candidate was asked.
    pub fn exhaust(&self, operation_id: OperationId) -> Option<QuorumDecision> {
        let mut state = self.states.get_mut(&operation_id)?;
        if state.decided.is_some() {
            return None;
        }
        let decision = QuorumDecision::Failed {
            reasons: state.reasons(),
        };
        state.decided = Some(decision.clone());
        Some(decision)
    }

    pub fn snapshot(&self, operation_id: OperationId) -> Option<QuorumSnapshot> {
        self.states.get(&operation_id).map(|s| QuorumSnapshot {
            neighborhood: s.neighborhood.len(),
            min_acks: s.min_acks,
            acks: s.acks.len(),
            nacks: s.nacks.len(),
            decided: s.decided.clone(),
        })
    }

    pub fn close(&self, operation_id: OperationId) {
        self.states.remove(&operation_id);
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}
