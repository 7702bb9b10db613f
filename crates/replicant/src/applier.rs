//! Store primitives: `clear_table`, `apply_batch`. The transactional-apply
//! worker trade-off discussed in the actor module is expressed through
//! `wants_isolated_worker`.

use crate::model::{TableName, TableOp};
use async_trait::async_trait;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyMode {
    Dirty,
    Transactional,
}

/// The local facility that commits operations to a shard's tables.
#[async_trait]
pub trait Applier: Send + Sync {
    /// Idempotent on a missing table.
    async fn clear_table(&self, table: &TableName) -> anyhow::Result<()>;

    async fn apply_batch(&self, mode: ApplyMode, ops: &[TableOp]) -> anyhow::Result<()>;

    /// Whether transactional applies should run in a short-lived worker
    /// task rather than in-actor. Selective-receive cost does not exist
    /// for a `tokio::sync::mpsc` inbox, so the default is `false`; an
    /// applier backed by a commit primitive that does scan its own inbox
    /// may override this to `true`.
    fn wants_isolated_worker(&self) -> bool {
        false
    }
}

/// Hand-written fake collaborators, gated behind the `testing` feature so
/// integration tests in `tests/` (a separate crate) can use them too.
#[cfg(any(test, feature = "testing"))]
pub mod fake {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Recorded {
        Cleared(TableName),
        Applied(ApplyMode, Vec<TableOp>),
    }

    #[derive(Default)]
    pub struct FakeApplier {
        pub calls: Mutex<Vec<Recorded>>,
        pub fail_next_apply: Mutex<bool>,
        pub isolated_worker: bool,
    }

    impl FakeApplier {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn applied_ops(&self) -> Vec<TableOp> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter_map(|c| match c {
                    Recorded::Applied(_, ops) => Some(ops.clone()),
                    _ => None,
                })
                .flatten()
                .collect()
        }
    }

    #[async_trait]
    impl Applier for FakeApplier {
        async fn clear_table(&self, table: &TableName) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push(Recorded::Cleared(table.clone()));
            Ok(())
        }

        async fn apply_batch(&self, mode: ApplyMode, ops: &[TableOp]) -> anyhow::Result<()> {
            let mut fail = self.fail_next_apply.lock().unwrap();
            if *fail {
                *fail = false;
                anyhow::bail!("forced apply failure");
            }
            drop(fail);
            self.calls.lock().unwrap().push(Recorded::Applied(mode, ops.to_vec()));
            Ok(())
        }

        fn wants_isolated_worker(&self) -> bool {
            self.isolated_worker
        }
    }
}
