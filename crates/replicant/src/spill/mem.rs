use super::{AckToken, SpillQueue};
use crate::model::TxBatch;
use async_trait::async_trait;
use std::collections::VecDeque;

/// In-memory FIFO, used when `mem_only = true` (the default) or in tests.
#[derive(Default)]
pub struct MemSpillQueue {
    items: VecDeque<TxBatch>,
    /// Set while a `pop` is outstanding and not yet `ack`ed.
    pending: Option<AckToken>,
    next_token: u64,
}

impl MemSpillQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SpillQueue for MemSpillQueue {
    async fn append(&mut self, batch: TxBatch) -> anyhow::Result<()> {
        self.items.push_back(batch);
        Ok(())
    }

    async fn pop(&mut self) -> anyhow::Result<Option<(TxBatch, AckToken)>> {
        if let Some(pending) = self.pending {
            anyhow::bail!("pop called with outstanding unacked token {:?}", pending);
        }
        let Some(front) = self.items.front().cloned() else {
            return Ok(None);
        };
        let token = AckToken(self.next_token);
        self.next_token += 1;
        self.pending = Some(token);
        Ok(Some((front, token)))
    }

    async fn ack(&mut self, token: AckToken) -> anyhow::Result<()> {
        match self.pending {
            Some(pending) if pending == token => {
                self.items.pop_front();
                self.pending = None;
                Ok(())
            }
            Some(pending) => anyhow::bail!("ack token {:?} does not match pending {:?}", token, pending),
            None => anyhow::bail!("ack called with no outstanding pop"),
        }
    }

    fn count(&self) -> usize {
        self.items.len()
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        self.items.clear();
        self.pending = None;
        Ok(())
    }
}
