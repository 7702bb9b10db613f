//! Outbound status notifications: `shard_down`, `shard_up`,
//! `replicant_import_trans`, `replicant_replayq_len`, `replicant_state`.

use crate::model::{AgentHandle, SeqNo, Shard, StateTag};

pub trait StatusSink: Send + Sync {
    fn shard_down(&self, shard: &Shard);
    fn shard_up(&self, shard: &Shard, agent: &AgentHandle);
    fn import_trans(&self, shard: &Shard, seqno: SeqNo);
    fn replayq_len(&self, shard: &Shard, count: usize);
    fn state(&self, shard: &Shard, state: StateTag);
}

/// Default sink: a `tracing` event plus a `metrics` gauge/counter update
/// per notification.
#[derive(Default)]
pub struct TracingStatusSink;

impl StatusSink for TracingStatusSink {
    fn shard_down(&self, shard: &Shard) {
        tracing::warn!(shard = %shard, "shard_down");
        metrics::gauge!("replicant_shard_up", "shard" => shard.0.clone()).set(0.0);
    }

    fn shard_up(&self, shard: &Shard, agent: &AgentHandle) {
        tracing::info!(shard = %shard, agent = %agent, "shard_up");
        metrics::gauge!("replicant_shard_up", "shard" => shard.0.clone()).set(1.0);
    }

    fn import_trans(&self, shard: &Shard, seqno: SeqNo) {
        tracing::debug!(shard = %shard, seqno = %seqno, "replicant_import_trans");
        metrics::counter!("replicant_import_trans", "shard" => shard.0.clone()).increment(1);
    }

    fn replayq_len(&self, shard: &Shard, count: usize) {
        tracing::debug!(shard = %shard, count, "replicant_replayq_len");
        metrics::gauge!("replicant_replayq_len", "shard" => shard.0.clone()).set(count as f64);
    }

    fn state(&self, shard: &Shard, state: StateTag) {
        tracing::info!(shard = %shard, state = %state, "replicant_state");
    }
}

#[cfg(any(test, feature = "testing"))]
pub mod fake {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Event {
        ShardDown(Shard),
        ShardUp(Shard, AgentHandle),
        ImportTrans(Shard, SeqNo),
        ReplayqLen(Shard, usize),
        State(Shard, StateTag),
    }

    #[derive(Default)]
    pub struct RecordingStatusSink {
        pub events: Mutex<Vec<Event>>,
    }

    impl RecordingStatusSink {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn events(&self) -> Vec<Event> {
            self.events.lock().unwrap().clone()
        }
    }

    impl StatusSink for RecordingStatusSink {
        fn shard_down(&self, shard: &Shard) {
            self.events.lock().unwrap().push(Event::ShardDown(shard.clone()));
        }

        fn shard_up(&self, shard: &Shard, agent: &AgentHandle) {
            self.events
                .lock()
                .unwrap()
                .push(Event::ShardUp(shard.clone(), agent.clone()));
        }

        fn import_trans(&self, shard: &Shard, seqno: SeqNo) {
            self.events.lock().unwrap().push(Event::ImportTrans(shard.clone(), seqno));
        }

        fn replayq_len(&self, shard: &Shard, count: usize) {
            self.events
                .lock()
                .unwrap()
                .push(Event::ReplayqLen(shard.clone(), count));
        }

        fn state(&self, shard: &Shard, state: StateTag) {
            self.events.lock().unwrap().push(Event::State(shard.clone(), state));
        }
    }
}
