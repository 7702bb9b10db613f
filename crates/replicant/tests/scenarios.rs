//! End-to-end scenarios driving the real actor against hand-written fake
//! collaborators: cold-start bootstrap, warm resume, gap detection, agent
//! death in each state, and a stale bootstrap-complete arriving late.

use replicant::actor::{self, Collaborators, Event};
use replicant::applier::{fake::FakeApplier, ApplyMode};
use replicant::bootstrap::fake::FakeBootstrap;
use replicant::model::{
    AgentHandle, Checkpoint, CoreNode, ReadTarget, SeqNo, Shard, TableName, TableOp, TableSpec,
    TxKind,
};
use replicant::read_router::ReadRouter;
use replicant::status::fake::RecordingStatusSink;
use replicant::status::{self};
use replicant::supervisor::InMemoryCheckpointStore;
use replicant::upstream::{fake::FakeUpstream, SubscribeOk};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn spill_options() -> replicant::spill::SpillQueueOptions {
    replicant::spill::SpillQueueOptions {
        mem_only: true,
        dir: std::path::PathBuf::from("/tmp/rlog-scenarios"),
        extra: serde_json::json!({}),
    }
}

struct Harness {
    upstream: Arc<FakeUpstream>,
    bootstrap: Arc<FakeBootstrap>,
    applier: Arc<FakeApplier>,
    status: Arc<RecordingStatusSink>,
    read_router: Arc<ReadRouter>,
    tx: mpsc::Sender<Event>,
    handle: tokio::task::JoinHandle<replicant::error::Result<()>>,
}

fn spawn_replica(
    shard: Shard,
    checkpoint: Option<Checkpoint>,
    candidates: Vec<CoreNode>,
) -> Harness {
    let upstream = Arc::new(FakeUpstream::new());
    let bootstrap = Arc::new(FakeBootstrap::new());
    let applier = Arc::new(FakeApplier::new());
    let status = Arc::new(RecordingStatusSink::new());
    let read_router = Arc::new(ReadRouter::new());

    let deps = Collaborators {
        upstream: upstream.clone(),
        bootstrap: bootstrap.clone(),
        applier: applier.clone(),
        status: status.clone(),
        read_router: read_router.clone(),
        checkpoint_store: Arc::new(InMemoryCheckpointStore::new()),
        candidates,
        reconnect_interval: Duration::from_millis(20),
        spill_options: spill_options(),
    };

    let (handle, tx) = actor::spawn(shard, checkpoint, deps);
    Harness { upstream, bootstrap, applier, status, read_router, tx, handle }
}

fn table_op(table: &str, marker: u64) -> TableOp {
    TableOp {
        table: TableName(table.into()),
        payload: serde_json::json!({ "marker": marker }),
    }
}

async fn wait_until<F: Fn() -> bool>(pred: F, what: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if pred() {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for: {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn is_state(events: &[status::fake::Event], shard: &Shard, want: replicant::model::StateTag) -> bool {
    events.iter().any(|e| matches!(e, status::fake::Event::State(s, tag) if s == shard && *tag == want))
}

/// Install a `tracing` subscriber once per test binary so `cargo test --
/// --nocapture` shows the replica's structured logs, matching
/// `automations`' `test_fibonacci_bench` convention of installing a
/// `FmtSubscriber` with an `EnvFilter` directly in the test rather than
/// relying on a library-level init function.
fn install_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let subscriber = tracing_subscriber::FmtSubscriber::builder()
            .with_env_filter(
                tracing_subscriber::EnvFilter::builder()
                    .with_default_directive(tracing::level_filters::LevelFilter::INFO.into())
                    .from_env_lossy(),
            )
            .finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}

#[tokio::test]
async fn s1_cold_start_bootstrap_path() {
    install_tracing();
    let shard = Shard("shard1".into());
    let candidates = vec![CoreNode("A".into()), CoreNode("B".into())];
    let h = spawn_replica(shard.clone(), None, candidates);

    h.upstream.set_response(
        "A",
        Ok(SubscribeOk {
            bootstrap_needed: true,
            agent: AgentHandle("alpha".into()),
            tables: vec![TableSpec { name: TableName("t1".into()) }],
            starting_seqno: SeqNo(0),
        }),
    );

    wait_until(|| h.status.events().iter().any(|e| matches!(e, status::fake::Event::ShardDown(_))), "shard_down on entry").await;
    wait_until(|| is_state(&h.status.events(), &shard, replicant::model::StateTag::Bootstrap), "enters bootstrap").await;

    // Tables are cleared on entry to bootstrap.
    assert!(h
        .applier
        .calls
        .lock()
        .unwrap()
        .iter()
        .any(|c| matches!(c, replicant::applier::fake::Recorded::Cleared(t) if t.0 == "t1")));
    assert_eq!(h.read_router.read_target(&shard, &TableName("t1".into())), ReadTarget::Remote);

    for (seqno, marker) in [(0u64, 0u64), (1, 1), (2, 2)] {
        h.tx
            .send(Event::TlogEntry {
                agent: AgentHandle("alpha".into()),
                seqno: SeqNo(seqno),
                tx_kind: TxKind::Dirty,
                ops: vec![table_op("t1", marker)],
            })
            .await
            .unwrap();
    }

    h.bootstrap.complete(Checkpoint("cp1".into()));

    wait_until(|| is_state(&h.status.events(), &shard, replicant::model::StateTag::Normal), "drains into normal").await;

    assert_eq!(h.read_router.read_target(&shard, &TableName("t1".into())), ReadTarget::Local);

    let applied = h.applier.applied_ops();
    assert_eq!(applied.len(), 3, "all three spilled batches replayed: {applied:?}");
    for (i, op) in applied.iter().enumerate() {
        assert_eq!(op.payload, serde_json::json!({ "marker": i as u64 }));
    }
    // local_replay always applies in dirty mode, never transactional.
    for call in h.applier.calls.lock().unwrap().iter() {
        if let replicant::applier::fake::Recorded::Applied(mode, _) = call {
            assert_eq!(*mode, ApplyMode::Dirty);
        }
    }

    // next_seqno advanced to 3: a batch at seqno 3 is accepted and applied
    // immediately now that the replica is in `normal`.
    h.tx
        .send(Event::TlogEntry {
            agent: AgentHandle("alpha".into()),
            seqno: SeqNo(3),
            tx_kind: TxKind::Dirty,
            ops: vec![table_op("t1", 3)],
        })
        .await
        .unwrap();
    wait_until(|| h.applier.applied_ops().len() == 4, "seqno 3 applied directly").await;
    assert!(!h.handle.is_finished());
}

#[tokio::test]
async fn s2_warm_resume_no_bootstrap() {
    let shard = Shard("shard2".into());
    let candidates = vec![CoreNode("A".into())];
    let h = spawn_replica(shard.clone(), Some(Checkpoint("cp1".into())), candidates);

    h.upstream.set_response(
        "A",
        Ok(SubscribeOk {
            bootstrap_needed: false,
            agent: AgentHandle("beta".into()),
            tables: vec![TableSpec { name: TableName("t1".into()) }],
            starting_seqno: SeqNo(7),
        }),
    );

    wait_until(|| is_state(&h.status.events(), &shard, replicant::model::StateTag::Normal), "goes straight to normal").await;
    // Never visits bootstrap or local_replay.
    assert!(!is_state(&h.status.events(), &shard, replicant::model::StateTag::Bootstrap));
    assert!(!is_state(&h.status.events(), &shard, replicant::model::StateTag::LocalReplay));

    for seqno in [7u64, 8] {
        h.tx
            .send(Event::TlogEntry {
                agent: AgentHandle("beta".into()),
                seqno: SeqNo(seqno),
                tx_kind: TxKind::Dirty,
                ops: vec![table_op("t1", seqno)],
            })
            .await
            .unwrap();
    }
    wait_until(|| h.applier.applied_ops().len() == 2, "both batches applied immediately").await;

    // next_seqno == 9: seqno 9 is accepted.
    h.tx
        .send(Event::TlogEntry {
            agent: AgentHandle("beta".into()),
            seqno: SeqNo(9),
            tx_kind: TxKind::Dirty,
            ops: vec![table_op("t1", 9)],
        })
        .await
        .unwrap();
    wait_until(|| h.applier.applied_ops().len() == 3, "seqno 9 applied").await;
    assert!(!h.handle.is_finished());
}

#[tokio::test]
#[tracing_test::traced_test]
async fn s3_gap_detection_is_fatal() {
    let shard = Shard("shard3".into());
    let h = spawn_replica(shard.clone(), None, vec![CoreNode("A".into())]);

    h.upstream.set_response(
        "A",
        Ok(SubscribeOk {
            bootstrap_needed: false,
            agent: AgentHandle("gamma".into()),
            tables: vec![TableSpec { name: TableName("t1".into()) }],
            starting_seqno: SeqNo(10),
        }),
    );
    wait_until(|| is_state(&h.status.events(), &shard, replicant::model::StateTag::Normal), "reaches normal").await;

    h.tx
        .send(Event::TlogEntry {
            agent: AgentHandle("gamma".into()),
            seqno: SeqNo(12),
            tx_kind: TxKind::Dirty,
            ops: vec![table_op("t1", 12)],
        })
        .await
        .unwrap();

    let result = tokio::time::timeout(Duration::from_secs(2), h.handle).await.expect("actor exited").unwrap();
    match result {
        Err(replicant::error::ReplicaError::GapInTlog { expected, got, .. }) => {
            assert_eq!(expected, SeqNo(10));
            assert_eq!(got, SeqNo(12));
        }
        other => panic!("expected GapInTlog, got {other:?}"),
    }
}

#[tokio::test]
async fn s4_agent_death_in_normal_is_recoverable() {
    let shard = Shard("shard4".into());
    let h = spawn_replica(shard.clone(), None, vec![CoreNode("A".into())]);

    h.upstream.set_response(
        "A",
        Ok(SubscribeOk {
            bootstrap_needed: false,
            agent: AgentHandle("delta-normal".into()),
            tables: vec![TableSpec { name: TableName("t1".into()) }],
            starting_seqno: SeqNo(0),
        }),
    );
    wait_until(|| is_state(&h.status.events(), &shard, replicant::model::StateTag::Normal), "reaches normal").await;
    assert_eq!(h.read_router.read_target(&shard, &TableName("t1".into())), ReadTarget::Local);

    h.upstream.kill(&AgentHandle("delta-normal".into()));

    wait_until(
        || {
            let events = h.status.events();
            let shard_downs = events
                .iter()
                .filter(|e| matches!(e, status::fake::Event::ShardDown(s) if s == &shard))
                .count();
            let disconnects = events
                .iter()
                .filter(|e| matches!(e, status::fake::Event::State(s, replicant::model::StateTag::Disconnected) if s == &shard))
                .count();
            // One shard_down/disconnected pair on actor startup, a second
            // pair once the agent's death is observed.
            shard_downs >= 2 && disconnects >= 2
        },
        "a second shard_down/disconnected pair is posted after agent death",
    )
    .await;

    // Reads must stop being served locally the moment the replica drops
    // back to disconnected, not only once a new agent is subscribed.
    assert_eq!(h.read_router.read_target(&shard, &TableName("t1".into())), ReadTarget::Remote);

    let events = h.status.events();
    let last_down = events.iter().rposition(|e| matches!(e, status::fake::Event::ShardDown(s) if s == &shard)).unwrap();
    let last_up = events.iter().rposition(|e| matches!(e, status::fake::Event::ShardUp(s, _) if s == &shard)).unwrap();
    assert!(last_down > last_up, "shard_down must be posted before any reconnect attempt succeeds");
    assert!(!h.handle.is_finished(), "normal agent death is recoverable, not fatal");
}

#[tokio::test]
async fn s5_agent_death_during_bootstrap_is_fatal() {
    let shard = Shard("shard5".into());
    let h = spawn_replica(shard.clone(), None, vec![CoreNode("A".into())]);

    h.upstream.set_response(
        "A",
        Ok(SubscribeOk {
            bootstrap_needed: true,
            agent: AgentHandle("delta".into()),
            tables: vec![TableSpec { name: TableName("t1".into()) }],
            starting_seqno: SeqNo(0),
        }),
    );
    wait_until(|| is_state(&h.status.events(), &shard, replicant::model::StateTag::Bootstrap), "enters bootstrap").await;

    h.upstream.kill(&AgentHandle("delta".into()));

    let result = tokio::time::timeout(Duration::from_secs(2), h.handle).await.expect("actor exited").unwrap();
    assert!(matches!(
        result,
        Err(replicant::error::ReplicaError::AgentDiedDuringSync { state: "bootstrap", .. })
    ));
}

#[tokio::test]
async fn s6_stale_bootstrap_complete_is_ignored() {
    let shard = Shard("shard6".into());
    let h = spawn_replica(shard.clone(), Some(Checkpoint("cp0".into())), vec![CoreNode("A".into())]);

    h.upstream.set_response(
        "A",
        Ok(SubscribeOk {
            bootstrap_needed: false,
            agent: AgentHandle("epsilon".into()),
            tables: vec![TableSpec { name: TableName("t1".into()) }],
            starting_seqno: SeqNo(0),
        }),
    );
    wait_until(|| is_state(&h.status.events(), &shard, replicant::model::StateTag::Normal), "reaches normal via warm resume").await;

    h.tx
        .send(Event::BootstrapComplete { checkpoint: Checkpoint("stale".into()) })
        .await
        .unwrap();

    // State is unaffected: still normal, and ordinary ingestion keeps working.
    h.tx
        .send(Event::TlogEntry {
            agent: AgentHandle("epsilon".into()),
            seqno: SeqNo(0),
            tx_kind: TxKind::Dirty,
            ops: vec![table_op("t1", 0)],
        })
        .await
        .unwrap();
    wait_until(|| h.applier.applied_ops().iter().any(|op| op.payload == serde_json::json!({ "marker": 0 })), "ingestion unaffected by stale event").await;

    assert!(!h.handle.is_finished());
    assert_eq!(
        h.status
            .events()
            .iter()
            .filter(|e| matches!(e, status::fake::Event::State(s, replicant::model::StateTag::LocalReplay) if s == &shard))
            .count(),
        0,
        "stale bootstrap_complete never drives a transition into local_replay"
    );
}

#[tokio::test]
async fn applier_failure_during_normal_apply_is_fatal() {
    let shard = Shard("shard7".into());
    let h = spawn_replica(shard.clone(), None, vec![CoreNode("A".into())]);

    h.upstream.set_response(
        "A",
        Ok(SubscribeOk {
            bootstrap_needed: false,
            agent: AgentHandle("zeta".into()),
            tables: vec![TableSpec { name: TableName("t1".into()) }],
            starting_seqno: SeqNo(0),
        }),
    );
    wait_until(|| is_state(&h.status.events(), &shard, replicant::model::StateTag::Normal), "reaches normal").await;

    *h.applier.fail_next_apply.lock().unwrap() = true;

    h.tx
        .send(Event::TlogEntry {
            agent: AgentHandle("zeta".into()),
            seqno: SeqNo(0),
            tx_kind: TxKind::Transactional { tid: "t-1".into() },
            ops: vec![table_op("t1", 0)],
        })
        .await
        .unwrap();

    let result = tokio::time::timeout(Duration::from_secs(2), h.handle).await.expect("actor exited").unwrap();
    assert!(matches!(result, Err(replicant::error::ReplicaError::BadApplyResult(_))));
}
