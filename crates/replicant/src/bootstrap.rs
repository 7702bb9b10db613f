//! Bootstrap client boundary: the task that copies a shard's table
//! contents from the upstream and signals completion with a checkpoint.

use crate::model::{Checkpoint, CoreNode, Shard, TableSpec};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Copies current table contents from `node` for `shard`'s tables, then
/// posts `Event::BootstrapComplete` to the replica's inbox. The copy
/// mechanism itself (what RPCs it issues, how it paginates tables) is
/// this trait's sole concern; the replica only depends on the completion
/// contract below.
#[async_trait]
pub trait BootstrapClient: Send + Sync {
    /// Spawn the copy task. Returns immediately; completion is signalled
    /// asynchronously through `tx`.
    fn spawn(
        &self,
        node: CoreNode,
        shard: Shard,
        tables: Vec<TableSpec>,
        tx: mpsc::Sender<crate::actor::Event>,
    );
}

#[cfg(any(test, feature = "testing"))]
pub mod fake {
    use super::*;
    use std::sync::Mutex;
    use tokio::sync::oneshot;

    /// A fake bootstrap client whose copy completes only once the test
    /// calls `complete`, letting tests interleave real-time batches with an
    /// in-flight bootstrap deterministically.
    pub struct FakeBootstrap {
        waiters: Mutex<Vec<oneshot::Sender<Checkpoint>>>,
    }

    impl FakeBootstrap {
        pub fn new() -> Self {
            Self { waiters: Mutex::new(Vec::new()) }
        }

        pub fn complete(&self, checkpoint: Checkpoint) {
            for tx in self.waiters.lock().unwrap().drain(..) {
                let _ = tx.send(checkpoint.clone());
            }
        }
    }

    impl Default for FakeBootstrap {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl BootstrapClient for FakeBootstrap {
        fn spawn(
            &self,
            _node: CoreNode,
            _shard: Shard,
            _tables: Vec<TableSpec>,
            tx: mpsc::Sender<crate::actor::Event>,
        ) {
            let (done_tx, done_rx) = oneshot::channel();
            self.waiters.lock().unwrap().push(done_tx);
            tokio::spawn(async move {
                if let Ok(checkpoint) = done_rx.await {
                    let _ = tx.send(crate::actor::Event::BootstrapComplete { checkpoint }).await;
                }
            });
        }
    }
}
