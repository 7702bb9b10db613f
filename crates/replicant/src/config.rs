//! Configuration: a `clap::Parser` struct loading the four environment
//! variables the replica's spill queue and reconnect loop need, plus the
//! ambient shard/candidate lists a runnable binary needs.

use crate::model::{CoreNode, Shard};
use crate::spill::SpillQueueOptions;
use std::path::PathBuf;
use std::time::Duration;

#[derive(clap::Parser, Debug, Clone)]
pub struct Config {
    /// Whether the spill queue holds buffered batches purely in memory.
    #[arg(long, env = "RLOG_REPLAYQ_MEM_ONLY", default_value_t = true)]
    pub rlog_replayq_mem_only: bool,

    /// Base directory for on-disk spill segments, when not memory-only.
    #[arg(long, env = "RLOG_REPLAYQ_DIR", default_value = "/tmp/rlog")]
    pub rlog_replayq_dir: PathBuf,

    /// Opaque map forwarded to `SpillQueue::open`.
    #[arg(long, env = "RLOG_REPLAYQ_OPTIONS", default_value = "{}")]
    pub rlog_replayq_options: String,

    /// Delay, in milliseconds, before retrying discovery after a failed
    /// connection attempt.
    #[arg(long, env = "RLOG_REPLICA_RECONNECT_INTERVAL", default_value_t = 5000)]
    pub rlog_replica_reconnect_interval_ms: u64,

    /// Shards this process replicates. Cluster discovery/enumeration
    /// policy is a separate concern; this is the minimal ambient seam
    /// needed to run the crate at all.
    #[arg(long = "shard", env = "SHARD_NAMES", value_delimiter = ',')]
    pub shards: Vec<String>,

    /// Candidate core node addresses, shared across all configured shards.
    #[arg(long = "candidate", env = "CORE_CANDIDATES", value_delimiter = ',')]
    pub candidates: Vec<String>,
}

impl Config {
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.rlog_replica_reconnect_interval_ms)
    }

    pub fn spill_options(&self) -> anyhow::Result<SpillQueueOptions> {
        Ok(SpillQueueOptions {
            mem_only: self.rlog_replayq_mem_only,
            dir: self.rlog_replayq_dir.clone(),
            extra: serde_json::from_str(&self.rlog_replayq_options)?,
        })
    }

    pub fn shards(&self) -> Vec<Shard> {
        self.shards.iter().cloned().map(Shard).collect()
    }

    pub fn candidates(&self) -> Vec<CoreNode> {
        self.candidates.iter().cloned().map(CoreNode).collect()
    }
}
