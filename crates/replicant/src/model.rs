//! Core data model — shards, checkpoints, sequence numbers, transaction
//! batches, and the replica's per-shard mutable state.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The unit of replication; identified by an opaque name.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Shard(pub String);

impl fmt::Display for Shard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A table owned by a shard.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TableName(pub String);

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A table's shape as announced by the upstream's `table_specs`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSpec {
    pub name: TableName,
}

/// An opaque token produced by the upstream marking a point in the log from
/// which incremental resumption is valid. May be absent (initial attach).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint(pub String);

/// Monotonic per-agent batch counter used to detect gaps.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SeqNo(pub u64);

impl SeqNo {
    pub const ZERO: SeqNo = SeqNo(0);

    pub fn next(self) -> SeqNo {
        SeqNo(self.0 + 1)
    }
}

impl fmt::Display for SeqNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An opaque reference to the upstream streaming peer. Equality identifies
/// whether an inbound batch or death notification belongs to the replica's
/// current subscription.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentHandle(pub String);

impl fmt::Display for AgentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A reachable core node, as returned by discovery and by subscribe.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreNode(pub String);

impl fmt::Display for CoreNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A batch's commit mode: either dirty (applied immediately, no isolation)
/// or transactional (carries an upstream transaction id).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxKind {
    Dirty,
    Transactional { tid: String },
}

/// A single table operation within a transaction batch's `ops` list.
/// The operation payload itself is opaque to the replica core — it is
/// forwarded verbatim to the applier/store, which is out of scope here.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableOp {
    pub table: TableName,
    pub payload: serde_json::Value,
}

/// A transaction batch as pushed by the upstream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxBatch {
    pub agent: AgentHandle,
    pub seqno: SeqNo,
    pub tx_kind: TxKind,
    pub ops: Vec<TableOp>,
}

/// The four states of the replica lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateTag {
    Disconnected,
    Bootstrap,
    LocalReplay,
    Normal,
}

impl fmt::Display for StateTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StateTag::Disconnected => "disconnected",
            StateTag::Bootstrap => "bootstrap",
            StateTag::LocalReplay => "local_replay",
            StateTag::Normal => "normal",
        };
        f.write_str(s)
    }
}

/// Which node local reads for a shard's tables should be served from (§4.4).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadTarget {
    Remote,
    Local,
}
