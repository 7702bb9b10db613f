//! Discovery & subscribe: `try_connect` shuffles the candidate core nodes
//! and returns the first successful subscription.

use crate::model::{AgentHandle, Checkpoint, CoreNode, SeqNo, Shard, TableSpec};
use async_trait::async_trait;
use rand::seq::SliceRandom;
use tokio::sync::mpsc;

/// Result of a successful `subscribe` call.
#[derive(Debug, Clone)]
pub struct SubscribeOk {
    pub bootstrap_needed: bool,
    pub agent: AgentHandle,
    pub tables: Vec<TableSpec>,
    pub starting_seqno: SeqNo,
}

/// A single upstream candidate. Production implementations wrap an RPC
/// client; `post_connect` converges local schema to `tables` before any
/// apply is admitted.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    async fn subscribe(
        &self,
        node: &CoreNode,
        shard: &Shard,
        checkpoint: Option<&Checkpoint>,
    ) -> anyhow::Result<SubscribeOk>;

    /// Register the table list locally and converge schema. Called once
    /// per successful subscribe, before any `tlog_entry` is admitted.
    async fn post_connect(&self, shard: &Shard, tables: &[TableSpec]) -> anyhow::Result<()>;

    /// Spawn the task that watches `agent` and posts `AgentDown` to `tx`
    /// once the upstream streaming peer terminates. Returns immediately;
    /// the watch runs until the agent dies or `tx` is dropped.
    fn watch_agent(&self, agent: AgentHandle, tx: mpsc::Sender<crate::actor::Event>);
}

/// Shuffles the candidates per attempt so load spreads across core nodes;
/// the first successful subscribe wins.
pub async fn try_connect(
    client: &dyn UpstreamClient,
    candidates: &[CoreNode],
    shard: &Shard,
    checkpoint: Option<&Checkpoint>,
) -> anyhow::Result<(CoreNode, SubscribeOk)> {
    let mut order: Vec<&CoreNode> = candidates.iter().collect();
    order.shuffle(&mut rand::thread_rng());

    for node in order {
        match client.subscribe(node, shard, checkpoint).await {
            Ok(ok) => {
                client.post_connect(shard, &ok.tables).await?;
                return Ok((node.clone(), ok));
            }
            Err(err) => {
                tracing::debug!(core = %node.0, error = %err, "subscribe attempt failed");
            }
        }
    }

    Err(crate::error::ReplicaError::NoCoreAvailable { shard: shard.clone() }.into())
}

#[cfg(any(test, feature = "testing"))]
pub mod fake {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::oneshot;

    /// Deterministic fake used by integration tests: a fixed mapping of
    /// core node name to canned response (or failure), plus a kill-switch
    /// per agent so tests can simulate agent death.
    pub struct FakeUpstream {
        pub responses: Mutex<std::collections::HashMap<String, anyhow::Result<SubscribeOk>>>,
        pub kill_switches: Mutex<std::collections::HashMap<String, oneshot::Sender<()>>>,
        pub post_connect_calls: AtomicUsize,
    }

    impl FakeUpstream {
        pub fn new() -> Self {
            Self {
                responses: Mutex::new(Default::default()),
                kill_switches: Mutex::new(Default::default()),
                post_connect_calls: AtomicUsize::new(0),
            }
        }

        pub fn set_response(&self, node: &str, result: anyhow::Result<SubscribeOk>) {
            self.responses.lock().unwrap().insert(node.to_string(), result);
        }

        /// Kill the agent previously wired up via `watch_agent`, posting
        /// `AgentDown` to whichever actor is watching it.
        pub fn kill(&self, agent: &AgentHandle) {
            if let Some(tx) = self.kill_switches.lock().unwrap().remove(&agent.0) {
                let _ = tx.send(());
            }
        }
    }

    impl Default for FakeUpstream {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl UpstreamClient for FakeUpstream {
        async fn subscribe(
            &self,
            node: &CoreNode,
            _shard: &Shard,
            _checkpoint: Option<&Checkpoint>,
        ) -> anyhow::Result<SubscribeOk> {
            let mut responses = self.responses.lock().unwrap();
            match responses.remove(&node.0) {
                Some(Ok(ok)) => Ok(ok),
                Some(Err(err)) => Err(err),
                None => anyhow::bail!("fake upstream has no canned response for {}", node.0),
            }
        }

        async fn post_connect(&self, _shard: &Shard, _tables: &[TableSpec]) -> anyhow::Result<()> {
            self.post_connect_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn watch_agent(&self, agent: AgentHandle, tx: mpsc::Sender<crate::actor::Event>) {
            let (kill_tx, kill_rx) = oneshot::channel();
            self.kill_switches.lock().unwrap().insert(agent.0.clone(), kill_tx);
            tokio::spawn(async move {
                let _ = kill_rx.await;
                let _ = tx
                    .send(crate::actor::Event::AgentDown {
                        agent,
                        reason: "fake kill".into(),
                    })
                    .await;
            });
        }
    }
}
