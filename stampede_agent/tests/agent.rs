use actix::Actor;
use anyhow::Result;
use chrono::Utc;
use stampede_agent::{Agent, GetStatus, Phase};
use stampede_core::link::UpLink;
use stampede_core::protocol::{Assignment, DumpLog, Envelope, RunCommand, RunOptions};
use stampede_core::schedule::LoadProfile;
use stampede_core::suite::{SuiteRegistry, SuiteSpec};
use stampede_env::StampedeConfig;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn setup_logger() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info,stampede_agent=debug")
        .try_init();
}

struct Harness {
    addr: actix::Addr<Agent>,
    down: mpsc::UnboundedSender<Envelope>,
    up: mpsc::UnboundedReceiver<Envelope>,
}

fn spawn_agent() -> Harness {
    let (up, up_rx) = UpLink::channel();
    let (down_tx, down_rx) = mpsc::unbounded_channel();
    let timing = StampedeConfig::testing().timing;
    let addr = Agent::new(Arc::new(SuiteRegistry::builtin()), timing, up, down_rx).start();
    Harness {
        addr,
        down: down_tx,
        up: up_rx,
    }
}

fn pause_spec(delay_ms: u64) -> SuiteSpec {
    SuiteSpec {
        suite: "pause".to_string(),
        config: serde_json::json!({ "delay_ms": delay_ms }),
    }
}

fn run_command(
    profile: LoadProfile,
    duration: u64,
    worker_index: u64,
    worker_count: u64,
    capacity: u64,
    total: u64,
) -> RunCommand {
    let mut users = BTreeMap::new();
    users.insert("buyer".to_string(), pause_spec(20));

    let mut population = BTreeMap::new();
    population.insert(
        "buyer".to_string(),
        Assignment {
            base: capacity * worker_index,
            capacity,
            total,
        },
    );

    RunCommand {
        users,
        options: RunOptions {
            load_profile: profile,
            duration,
            repeat_delay: Some(stampede_core::protocol::RepeatDelay::Global(20)),
            dump_log: DumpLog::default(),
            verbosity: 0,
            params: serde_json::Value::Null,
        },
        worker_index,
        worker_count,
        population,
    }
}

async fn next_finish(up: &mut mpsc::UnboundedReceiver<Envelope>) -> Result<Envelope> {
    loop {
        let env = tokio::time::timeout(Duration::from_secs(5), up.recv())
            .await?
            .ok_or_else(|| anyhow::anyhow!("up link closed"))?;
        if matches!(env, Envelope::Finish { .. }) {
            return Ok(env);
        }
    }
}

#[actix_rt::test]
async fn worker_init_is_idempotent_and_replies_setup() -> Result<()> {
    setup_logger();
    let mut h = spawn_agent();

    for _ in 0..3 {
        h.down
            .send(Envelope::WorkerInit {
                host: "orc".to_string(),
                time: Utc::now(),
            })
            .unwrap();
    }

    let mut ids = Vec::new();
    for _ in 0..3 {
        match tokio::time::timeout(Duration::from_secs(2), h.up.recv()).await? {
            Some(Envelope::Setup { id }) => ids.push(id),
            other => panic!("expected setup, got {:?}", other.map(|e| e.name())),
        }
    }
    assert_eq!(ids[0], ids[1]);
    assert_eq!(ids[1], ids[2]);

    let status = h.addr.send(GetStatus).await?;
    assert_eq!(status.phase, Phase::Connected);
    Ok(())
}

#[actix_rt::test]
async fn reconciliation_converges_on_partitioned_target() -> Result<()> {
    setup_logger();
    let h = spawn_agent();

    // Flat target 4, two workers: this worker (index 0) owns 2 users.
    let cmd = run_command(LoadProfile::Flat(vec![(0, 4)]), 60, 0, 2, 2, 4);
    h.down.send(Envelope::Run(Box::new(cmd))).unwrap();

    tokio::time::sleep(Duration::from_millis(400)).await;

    let status = h.addr.send(GetStatus).await?;
    assert_eq!(status.phase, Phase::Running);
    assert_eq!(status.population["buyer"], vec![0, 1]);
    Ok(())
}

#[actix_rt::test]
async fn second_worker_gets_its_own_index_range() -> Result<()> {
    setup_logger();
    let h = spawn_agent();

    let cmd = run_command(LoadProfile::Flat(vec![(0, 4)]), 60, 1, 2, 2, 4);
    h.down.send(Envelope::Run(Box::new(cmd))).unwrap();

    tokio::time::sleep(Duration::from_millis(400)).await;

    let status = h.addr.send(GetStatus).await?;
    assert_eq!(status.population["buyer"], vec![2, 3]);
    Ok(())
}

#[actix_rt::test]
async fn ramp_down_and_up_reuses_low_indices_first() -> Result<()> {
    setup_logger();
    let h = spawn_agent();

    // 2 users, down to 0 by t=2, back to 2 by t=3.
    let mut ramps = BTreeMap::new();
    ramps.insert(
        "buyer".to_string(),
        vec![(0, 2), (1, 2), (2, 0), (3, 2), (60, 2)],
    );
    let cmd = run_command(LoadProfile::PerUser(ramps), 60, 0, 1, 2, 2);
    h.down.send(Envelope::Run(Box::new(cmd))).unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    let status = h.addr.send(GetStatus).await?;
    assert_eq!(status.population["buyer"], vec![0, 1]);

    // After the dip and recovery the same low indices are in use, and the
    // completions of retired incarnations were discarded without fuss.
    tokio::time::sleep(Duration::from_millis(3100)).await;
    let status = h.addr.send(GetStatus).await?;
    assert_eq!(status.population["buyer"], vec![0, 1]);
    assert!(status.stat["buyer"].s > 0);
    assert_eq!(status.stat["buyer"].a, 0);
    Ok(())
}

#[actix_rt::test]
async fn duplicate_run_command_is_ignored() -> Result<()> {
    setup_logger();
    let h = spawn_agent();

    let first = run_command(LoadProfile::Flat(vec![(0, 2)]), 60, 0, 1, 2, 2);
    h.down.send(Envelope::Run(Box::new(first))).unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    // A second run with a bigger population must not take effect.
    let second = run_command(LoadProfile::Flat(vec![(0, 8)]), 60, 0, 1, 8, 8);
    h.down.send(Envelope::Run(Box::new(second))).unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let status = h.addr.send(GetStatus).await?;
    assert_eq!(status.population["buyer"].len(), 2);
    Ok(())
}

#[actix_rt::test]
async fn drain_sends_finish_only_after_all_suites_complete() -> Result<()> {
    setup_logger();
    let mut h = spawn_agent();

    let cmd = run_command(LoadProfile::Flat(vec![(0, 2), (5, 2)]), 1, 0, 1, 2, 2);
    h.down.send(Envelope::Run(Box::new(cmd))).unwrap();

    let finish = next_finish(&mut h.up).await?;
    let Envelope::Finish { stat, .. } = finish else {
        unreachable!();
    };
    assert!(stat["buyer"].s > 0);
    assert_eq!(stat["buyer"].a, 0);

    // After the final report every tracked list is empty and the agent is
    // reset for reuse.
    let status = h.addr.send(GetStatus).await?;
    assert_eq!(status.phase, Phase::Idle);
    assert_eq!(status.in_flight, 0);
    assert!(status.population.is_empty());
    Ok(())
}

#[actix_rt::test]
async fn metrics_report_carries_population_and_tallies() -> Result<()> {
    setup_logger();
    let mut h = spawn_agent();

    let cmd = run_command(LoadProfile::Flat(vec![(0, 2)]), 60, 0, 1, 2, 2);
    h.down.send(Envelope::Run(Box::new(cmd))).unwrap();

    // Testing config reports metrics every 500ms.
    let metrics = loop {
        let env = tokio::time::timeout(Duration::from_secs(5), h.up.recv())
            .await?
            .ok_or_else(|| anyhow::anyhow!("up link closed"))?;
        if let Envelope::WorkerMetrics(m) = env {
            break m;
        }
    };

    assert_eq!(metrics.pop["buyer"], 2);
    assert!(metrics.metrics.mem >= 0.0);
    // 20ms suites against a 500ms reporting interval: completions certain.
    assert!(metrics.stat["buyer"].total() > 0);
    assert!(metrics.clock.contains_key("buyer"));
    Ok(())
}
