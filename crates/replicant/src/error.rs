//! Error kinds the replica actor can fail with, modeled as a `thiserror`
//! enum at the library boundary.

use crate::model::{AgentHandle, SeqNo};

#[derive(Debug, thiserror::Error)]
pub enum ReplicaError {
    /// Inbound seqno exceeds expected; fatal.
    #[error("gap in tlog for agent {agent}: expected {expected}, got {got}")]
    GapInTlog {
        expected: SeqNo,
        got: SeqNo,
        agent: AgentHandle,
    },

    /// Agent handle terminated while in `bootstrap` or `local_replay`; fatal,
    /// no usable checkpoint exists yet to resume from.
    #[error("agent {agent} died during sync (state = {state})")]
    AgentDiedDuringSync {
        agent: AgentHandle,
        state: &'static str,
    },

    /// Discovery produced no reachable candidate core node; non-fatal.
    #[error("no core node available for shard {shard}")]
    NoCoreAvailable { shard: crate::model::Shard },

    /// Transactional-apply worker exited with anything other than success.
    #[error("transactional apply failed: {0}")]
    BadApplyResult(String),

    /// The spill queue or applier collaborator returned an error.
    #[error("collaborator error: {0}")]
    Collaborator(#[source] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, ReplicaError>;
