//! The replica state machine. Implemented as an owned `tokio::task` driven
//! by a typed `Event` enum over a bounded `mpsc` inbox; timers are posted
//! back through the same inbox so their relative order with inbound
//! batches is well-defined.

mod state;

pub use state::{BootstrapData, LocalReplayData, NormalData, State};

use crate::applier::{ApplyMode, Applier};
use crate::bootstrap::BootstrapClient;
use crate::error::{ReplicaError, Result};
use crate::model::{
    AgentHandle, Checkpoint, CoreNode, ReadTarget, SeqNo, Shard, TableName, TableOp, TableSpec,
    TxBatch, TxKind,
};
use crate::read_router::ReadRouter;
use crate::status::StatusSink;
use crate::supervisor::CheckpointStore;
use crate::upstream::{self, UpstreamClient};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Events the replica reacts to.
#[derive(Debug)]
pub enum Event {
    TlogEntry {
        agent: AgentHandle,
        seqno: SeqNo,
        tx_kind: TxKind,
        ops: Vec<TableOp>,
    },
    BootstrapComplete {
        checkpoint: Checkpoint,
    },
    AgentDown {
        agent: AgentHandle,
        reason: String,
    },
    ReconnectTick,
    ReplayTick,
}

/// Collaborators a replica needs, bundled for `spawn`.
pub struct Collaborators {
    pub upstream: Arc<dyn UpstreamClient>,
    pub bootstrap: Arc<dyn BootstrapClient>,
    pub applier: Arc<dyn Applier>,
    pub status: Arc<dyn StatusSink>,
    pub read_router: Arc<ReadRouter>,
    pub checkpoint_store: Arc<dyn CheckpointStore>,
    pub candidates: Vec<CoreNode>,
    pub reconnect_interval: Duration,
    pub spill_options: crate::spill::SpillQueueOptions,
}

const INBOX_CAPACITY: usize = 256;

/// Spawn a replica for `shard`, starting in `disconnected`, optionally
/// resuming from a checkpoint persisted by a prior actor lifetime (the
/// supervisor's role, §10.5). Returns the task handle and a sender usable
/// to post external events (used by `watch_agent`/`BootstrapClient::spawn`
/// to feed events back in, and by tests).
pub fn spawn(
    shard: Shard,
    checkpoint: Option<Checkpoint>,
    deps: Collaborators,
) -> (JoinHandle<Result<()>>, mpsc::Sender<Event>) {
    let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
    let replica = Replica {
        shard,
        tables: Vec::new(),
        remote_core: None,
        agent: None,
        checkpoint,
        next_seqno: SeqNo::ZERO,
        state: State::Disconnected,
        inbox: rx,
        self_tx: tx.clone(),
        candidates: deps.candidates,
        reconnect_interval: deps.reconnect_interval,
        spill_options: deps.spill_options,
        upstream: deps.upstream,
        bootstrap: deps.bootstrap,
        applier: deps.applier,
        status: deps.status,
        read_router: deps.read_router,
        checkpoint_store: deps.checkpoint_store,
    };
    let handle = tokio::spawn(replica.run());
    (handle, tx)
}

fn table_names(tables: &[TableSpec]) -> Vec<TableName> {
    tables.iter().map(|t| t.name.clone()).collect()
}

struct Replica {
    shard: Shard,
    tables: Vec<TableSpec>,
    remote_core: Option<CoreNode>,
    agent: Option<AgentHandle>,
    checkpoint: Option<Checkpoint>,
    next_seqno: SeqNo,
    state: State,

    inbox: mpsc::Receiver<Event>,
    self_tx: mpsc::Sender<Event>,

    candidates: Vec<CoreNode>,
    reconnect_interval: Duration,
    spill_options: crate::spill::SpillQueueOptions,

    upstream: Arc<dyn UpstreamClient>,
    bootstrap: Arc<dyn BootstrapClient>,
    applier: Arc<dyn Applier>,
    status: Arc<dyn StatusSink>,
    read_router: Arc<ReadRouter>,
    checkpoint_store: Arc<dyn CheckpointStore>,
}

impl Replica {
    #[tracing::instrument(skip(self), fields(shard = %self.shard))]
    async fn run(mut self) -> Result<()> {
        self.enter_disconnected().await;
        while let Some(event) = self.inbox.recv().await {
            if let Err(err) = self.handle_event(event).await {
                tracing::error!(shard = %self.shard, error = %err, "replica exiting fatally");
                return Err(err);
            }
        }
        Ok(())
    }

    /// Post `event` to this replica's own inbox after `after`, without
    /// blocking the run loop. Timers are posted through the same inbox as
    /// inbound batches, so their relative order is well-defined.
    fn schedule(&self, event: Event, after: Duration) {
        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            if !after.is_zero() {
                tokio::time::sleep(after).await;
            }
            let _ = tx.send(event).await;
        });
    }

    async fn handle_event(&mut self, event: Event) -> Result<()> {
        match event {
            Event::TlogEntry { agent, seqno, tx_kind, ops } => {
                self.handle_tlog_entry(agent, seqno, tx_kind, ops).await
            }
            Event::BootstrapComplete { checkpoint } => self.handle_bootstrap_complete(checkpoint).await,
            Event::AgentDown { agent, reason } => self.handle_agent_down(agent, reason).await,
            Event::ReconnectTick => self.handle_reconnect_tick().await,
            Event::ReplayTick => self.handle_replay_tick().await,
        }
    }

    // ---- Ingestion & ordering ----

    async fn handle_tlog_entry(
        &mut self,
        agent: AgentHandle,
        seqno: SeqNo,
        tx_kind: TxKind,
        ops: Vec<TableOp>,
    ) -> Result<()> {
        match &self.agent {
            Some(current) if *current == agent => {}
            _ => {
                tracing::warn!(shard = %self.shard, agent = %agent, "dropping batch from unknown/stale agent");
                return Ok(());
            }
        }

        if seqno < self.next_seqno {
            tracing::warn!(shard = %self.shard, expected = %self.next_seqno, got = %seqno, "dropping stale batch");
            return Ok(());
        }
        if seqno > self.next_seqno {
            return Err(ReplicaError::GapInTlog {
                expected: self.next_seqno,
                got: seqno,
                agent,
            });
        }

        match &mut self.state {
            State::Normal(_) => {
                let mode = match &tx_kind {
                    TxKind::Dirty => ApplyMode::Dirty,
                    TxKind::Transactional { .. } => ApplyMode::Transactional,
                };
                self.run_apply(mode, &ops).await?;
            }
            State::Bootstrap(data) => {
                data.spill
                    .append(TxBatch { agent, seqno, tx_kind, ops })
                    .await
                    .map_err(ReplicaError::Collaborator)?;
                self.status.replayq_len(&self.shard, data.spill.count());
            }
            State::LocalReplay(data) => {
                data.spill
                    .append(TxBatch { agent, seqno, tx_kind, ops })
                    .await
                    .map_err(ReplicaError::Collaborator)?;
                self.status.replayq_len(&self.shard, data.spill.count());
            }
            State::Disconnected => {
                tracing::warn!(shard = %self.shard, "tlog_entry received while disconnected, ignoring");
                return Ok(());
            }
        }

        self.status.import_trans(&self.shard, seqno);
        self.next_seqno = self.next_seqno.next();
        Ok(())
    }

    /// Apply a batch of ops. Dirty applies always run in-actor; a
    /// transactional apply runs in a short-lived worker only if the
    /// applier asks for isolation (dirty batches never carry the
    /// selective-receive cost the worker indirection exists to avoid).
    async fn run_apply(&self, mode: ApplyMode, ops: &[TableOp]) -> Result<()> {
        let result = if mode == ApplyMode::Transactional && self.applier.wants_isolated_worker() {
            let applier = self.applier.clone();
            let ops = ops.to_vec();
            match tokio::spawn(async move { applier.apply_batch(mode, &ops).await }).await {
                Ok(result) => result,
                Err(join_err) => return Err(ReplicaError::BadApplyResult(join_err.to_string())),
            }
        } else {
            self.applier.apply_batch(mode, ops).await
        };
        result.map_err(|err| ReplicaError::BadApplyResult(err.to_string()))
    }

    // ---- bootstrap_complete ----

    async fn handle_bootstrap_complete(&mut self, checkpoint: Checkpoint) -> Result<()> {
        if !matches!(self.state, State::Bootstrap(_)) {
            tracing::info!(shard = %self.shard, "ignoring bootstrap_complete outside bootstrap (stale)");
            return Ok(());
        }
        self.checkpoint_store.store(&self.shard, &checkpoint);
        self.checkpoint = Some(checkpoint);
        let spill = match std::mem::replace(&mut self.state, State::Disconnected) {
            State::Bootstrap(data) => data.spill,
            _ => unreachable!("checked above"),
        };
        self.enter_local_replay(spill);
        Ok(())
    }

    // ---- agent death ----

    async fn handle_agent_down(&mut self, agent: AgentHandle, reason: String) -> Result<()> {
        if self.agent.as_ref() != Some(&agent) {
            tracing::info!(shard = %self.shard, agent = %agent, "ignoring agent_down for non-current agent");
            return Ok(());
        }

        match &self.state {
            State::Bootstrap(_) | State::LocalReplay(_) => {
                let state = if matches!(self.state, State::Bootstrap(_)) {
                    "bootstrap"
                } else {
                    "local_replay"
                };
                Err(ReplicaError::AgentDiedDuringSync { agent, state })
            }
            State::Normal(_) => {
                tracing::warn!(shard = %self.shard, agent = %agent, reason, "agent died in normal, reconnecting");
                self.agent = None;
                self.remote_core = None;
                self.enter_disconnected().await;
                Ok(())
            }
            State::Disconnected => {
                tracing::debug!(shard = %self.shard, "ignoring agent_down while already disconnected");
                Ok(())
            }
        }
    }

    // ---- reconnect ----

    async fn handle_reconnect_tick(&mut self) -> Result<()> {
        if !matches!(self.state, State::Disconnected) {
            tracing::debug!(shard = %self.shard, "ignoring reconnect tick outside disconnected");
            return Ok(());
        }

        match upstream::try_connect(
            self.upstream.as_ref(),
            &self.candidates,
            &self.shard,
            self.checkpoint.as_ref(),
        )
        .await
        {
            Ok((node, ok)) if ok.bootstrap_needed => {
                self.enter_bootstrap(node, ok.agent, ok.tables, ok.starting_seqno)
                    .await
                    .map_err(ReplicaError::Collaborator)
            }
            Ok((node, ok)) => {
                self.remote_core = Some(node);
                self.agent = Some(ok.agent.clone());
                self.tables = ok.tables;
                self.next_seqno = ok.starting_seqno;
                self.upstream.watch_agent(ok.agent, self.self_tx.clone());
                self.enter_normal().await;
                Ok(())
            }
            Err(err) => {
                tracing::warn!(shard = %self.shard, error = %err, "no core available, rescheduling reconnect");
                self.schedule(Event::ReconnectTick, self.reconnect_interval);
                Ok(())
            }
        }
    }

    // ---- local replay drain ----

    async fn handle_replay_tick(&mut self) -> Result<()> {
        let popped = match &mut self.state {
            State::LocalReplay(data) => data.spill.pop().await.map_err(ReplicaError::Collaborator)?,
            _ => {
                tracing::debug!(shard = %self.shard, "ignoring replay tick outside local_replay");
                return Ok(());
            }
        };

        let Some((batch, token)) = popped else {
            return self.finish_local_replay().await;
        };

        self.run_apply(ApplyMode::Dirty, &batch.ops).await?;

        let is_empty = match &mut self.state {
            State::LocalReplay(data) => {
                data.spill.ack(token).await.map_err(ReplicaError::Collaborator)?;
                self.status.replayq_len(&self.shard, data.spill.count());
                data.spill.is_empty()
            }
            _ => unreachable!("state cannot change while a replay tick is in flight"),
        };

        if is_empty {
            self.finish_local_replay().await
        } else {
            self.schedule(Event::ReplayTick, Duration::ZERO);
            Ok(())
        }
    }

    async fn finish_local_replay(&mut self) -> Result<()> {
        let State::LocalReplay(mut data) = std::mem::replace(&mut self.state, State::Disconnected) else {
            unreachable!("finish_local_replay called outside local_replay");
        };
        data.spill.close().await.map_err(ReplicaError::Collaborator)?;
        self.enter_normal().await;
        Ok(())
    }

    // ---- entry actions ----

    async fn enter_disconnected(&mut self) {
        self.state = State::Disconnected;
        self.status.shard_down(&self.shard);
        self.status.state(&self.shard, self.state.tag());
        // Reads must not be served locally once replication has stopped;
        // a no-op on the very first entry, where `tables` is still empty.
        self.read_router
            .set_shard(&self.shard, &table_names(&self.tables), ReadTarget::Remote);
        self.schedule(Event::ReconnectTick, Duration::ZERO);
    }

    async fn enter_bootstrap(
        &mut self,
        node: CoreNode,
        agent: AgentHandle,
        tables: Vec<TableSpec>,
        starting_seqno: SeqNo,
    ) -> anyhow::Result<()> {
        self.remote_core = Some(node.clone());
        self.agent = Some(agent.clone());
        self.tables = tables.clone();
        self.next_seqno = starting_seqno;

        self.read_router
            .set_shard(&self.shard, &table_names(&self.tables), ReadTarget::Remote);

        for table in &tables {
            self.applier.clear_table(&table.name).await?;
        }

        self.bootstrap
            .spawn(node, self.shard.clone(), tables, self.self_tx.clone());
        self.upstream.watch_agent(agent, self.self_tx.clone());

        let spill = crate::spill::open(&self.spill_options, &self.shard);
        self.state = State::Bootstrap(BootstrapData { spill });
        self.status.state(&self.shard, self.state.tag());
        Ok(())
    }

    fn enter_local_replay(&mut self, spill: Box<dyn crate::spill::SpillQueue>) {
        self.state = State::LocalReplay(LocalReplayData { spill });
        self.status.state(&self.shard, self.state.tag());
        self.schedule(Event::ReplayTick, Duration::ZERO);
    }

    async fn enter_normal(&mut self) {
        self.state = State::Normal(NormalData);
        if let Some(agent) = self.agent.clone() {
            self.status.shard_up(&self.shard, &agent);
        }
        self.read_router
            .set_shard(&self.shard, &table_names(&self.tables), ReadTarget::Local);
        self.status.state(&self.shard, self.state.tag());
    }
}
