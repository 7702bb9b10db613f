//! Spill queue contract: a bounded, optionally disk-backed FIFO used to
//! hold real-time transactions during bootstrap and local-replay phases.
//! Durability is not required — on crash the queue is discarded along
//! with the partially bootstrapped state.

mod disk;
mod mem;

pub use disk::DiskSpillQueue;
pub use mem::MemSpillQueue;

use crate::model::TxBatch;
use async_trait::async_trait;

/// Options forwarded to `open`, sourced from `rlog_replayq_mem_only` /
/// `rlog_replayq_dir` / `rlog_replayq_options` in [`crate::config`].
#[derive(Clone, Debug)]
pub struct SpillQueueOptions {
    pub mem_only: bool,
    pub dir: std::path::PathBuf,
    pub extra: serde_json::Value,
}

/// Opaque handle returned by `pop`, redeemed by `ack`. Only one `pop` may be
/// outstanding (unacked) at a time — this matches the replica's usage
/// pattern of popping exactly one batch per replay tick and acking it once
/// the dirty apply of that batch has completed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AckToken(pub(crate) u64);

#[async_trait]
pub trait SpillQueue: Send {
    /// Append a batch worth of ops to the tail of the queue.
    async fn append(&mut self, batch: TxBatch) -> anyhow::Result<()>;

    /// Pop one batch worth of items from the head, without discarding it.
    /// Returns `None` if the queue is empty. The batch is only durably
    /// removed once the returned token is passed to `ack`.
    async fn pop(&mut self) -> anyhow::Result<Option<(TxBatch, AckToken)>>;

    /// Acknowledge a prior `pop`, durably discarding that item.
    async fn ack(&mut self, token: AckToken) -> anyhow::Result<()>;

    /// Number of items currently queued, including one popped-but-unacked.
    fn count(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Release any resources (segment files, buffers) held by the queue.
    async fn close(&mut self) -> anyhow::Result<()>;
}

/// Open a fresh spill queue per the options, choosing the in-memory or
/// disk-backed implementation per `mem_only`. Called on entry to
/// `bootstrap`.
pub fn open(opts: &SpillQueueOptions, shard: &crate::model::Shard) -> Box<dyn SpillQueue> {
    if opts.mem_only {
        Box::new(MemSpillQueue::new())
    } else {
        Box::new(DiskSpillQueue::new(opts.dir.join(&shard.0)))
    }
}
