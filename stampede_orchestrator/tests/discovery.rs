use actix::{Actor, Context, Handler};
use anyhow::Result;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serial_test::serial;
use stampede_core::clock::ClockMap;
use stampede_core::error::LoadError;
use stampede_core::protocol::{
    AgentMetrics, Assignment, DumpLog, Envelope, HostMetrics, LoadTest, RepeatDelay, RunOptions,
};
use stampede_core::runlog::RunLog;
use stampede_core::schedule::LoadProfile;
use stampede_core::stats::{StatMap, Tally, UserStat};
use stampede_core::suite::{SuiteRegistry, SuiteSpec};
use stampede_env::StampedeConfig;
use stampede_orchestrator::{run_load, run_load_with, LiveSnapshot, RunSummary};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

fn setup_logger() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info,stampede_orchestrator=debug")
        .try_init();
}

fn testing(dport: u16, uport: u16) -> StampedeConfig {
    let mut settings = StampedeConfig::testing();
    settings.net.down_port = dport;
    settings.net.up_port = uport;
    settings
}

fn spec(suite: &str, config: serde_json::Value) -> SuiteSpec {
    SuiteSpec {
        suite: suite.to_string(),
        config,
    }
}

fn one_user_test() -> LoadTest {
    let mut users = BTreeMap::new();
    users.insert(
        "buyer".to_string(),
        spec("pause", serde_json::json!({"delay_ms": 10})),
    );
    LoadTest {
        start: None,
        users,
        finish: None,
    }
}

fn options(duration: u64) -> RunOptions {
    RunOptions {
        load_profile: LoadProfile::Flat(vec![(0, 2)]),
        duration,
        repeat_delay: Some(RepeatDelay::Global(10)),
        dump_log: DumpLog::default(),
        verbosity: 0,
        params: serde_json::Value::Null,
    }
}

fn spawn_run(
    test: LoadTest,
    options: RunOptions,
    settings: StampedeConfig,
) -> oneshot::Receiver<Result<RunSummary, LoadError>> {
    let (tx, rx) = oneshot::channel();
    actix_rt::spawn(async move {
        let registry = Arc::new(SuiteRegistry::builtin());
        let _ = tx.send(run_load(test, options, registry, &settings).await);
    });
    rx
}

async fn connect(port: u16) -> Result<TcpStream> {
    for _ in 0..100 {
        if let Ok(stream) = TcpStream::connect(("127.0.0.1", port)).await {
            return Ok(stream);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    anyhow::bail!("port {} never opened", port)
}

async fn send(up: &mut FramedWrite<TcpStream, LinesCodec>, env: &Envelope) -> Result<()> {
    up.send(serde_json::to_string(env)?).await?;
    Ok(())
}

async fn recv(down: &mut FramedRead<TcpStream, LinesCodec>) -> Result<Envelope> {
    let line = tokio::time::timeout(Duration::from_secs(5), down.next())
        .await?
        .ok_or_else(|| anyhow::anyhow!("down link closed early"))??;
    Ok(serde_json::from_str(&line)?)
}

#[actix_rt::test]
#[serial]
async fn empty_discovery_window_fails_the_run() -> Result<()> {
    setup_logger();
    let settings = testing(9500, 9501);

    let registry = Arc::new(SuiteRegistry::builtin());
    let err = run_load(one_user_test(), options(1), registry, &settings)
        .await
        .unwrap_err();
    assert!(matches!(err, LoadError::Discovery(_)));
    Ok(())
}

#[actix_rt::test]
#[serial]
async fn one_fake_agent_carries_a_run_end_to_end() -> Result<()> {
    setup_logger();
    let settings = testing(9504, 9505);
    let rx = spawn_run(one_user_test(), options(5), settings);

    let mut down = FramedRead::new(connect(9504).await?, LinesCodec::new());
    let mut up = FramedWrite::new(connect(9505).await?, LinesCodec::new());

    // Answer two strobes with the same id; discovery must deduplicate and
    // dispatch exactly one run command.
    let mut replied = 0;
    let cmd = loop {
        match recv(&mut down).await? {
            Envelope::WorkerInit { .. } if replied < 2 => {
                replied += 1;
                send(
                    &mut up,
                    &Envelope::Setup {
                        id: "fake:1-0".to_string(),
                    },
                )
                .await?;
            }
            Envelope::WorkerInit { .. } => {}
            Envelope::Run(cmd) => break cmd,
            other => panic!("unexpected {} on down link", other.name()),
        }
    };

    assert_eq!(cmd.worker_index, 0);
    assert_eq!(cmd.worker_count, 1);
    assert_eq!(
        cmd.population["buyer"],
        Assignment {
            base: 0,
            capacity: 2,
            total: 2
        }
    );

    // A setup outside the discovery mode is dropped, not fatal.
    send(
        &mut up,
        &Envelope::Setup {
            id: "fake:9-9".to_string(),
        },
    )
    .await?;

    let mut stat = StatMap::new();
    let mut buyer = UserStat::default();
    buyer.add(7, 1, 0);
    stat.insert("buyer".to_string(), buyer);
    send(
        &mut up,
        &Envelope::Finish {
            id: "fake:1-0".to_string(),
            stat,
            log: RunLog::new(),
            clock: ClockMap::new(),
        },
    )
    .await?;

    let summary = tokio::time::timeout(Duration::from_secs(5), rx).await???;
    assert_eq!(summary.succeeded, 7);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.aborted, 0);
    assert_eq!(summary.total(), 8);

    // The hub closes after the last finish; nothing else arrives.
    let rest = tokio::time::timeout(Duration::from_secs(5), down.next()).await?;
    assert!(rest.is_none());
    Ok(())
}

#[actix_rt::test]
#[serial]
async fn failed_start_suite_skips_straight_to_the_finish_suite() -> Result<()> {
    setup_logger();
    let settings = testing(9508, 9509);

    let mut test = one_user_test();
    test.start = Some(spec("flaky", serde_json::json!({"fail_every": 1})));
    test.finish = Some(spec("pause", serde_json::json!({"delay_ms": 1})));

    let rx = spawn_run(test, options(5), settings);
    let summary = tokio::time::timeout(Duration::from_secs(5), rx).await???;

    assert_eq!(summary.stat["start"].f, 1);
    assert_eq!(summary.stat["finish"].s, 1);
    assert!(!summary.stat.contains_key("buyer"));
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.succeeded, 1);
    Ok(())
}

#[actix_rt::test]
#[serial]
async fn silent_agent_is_warned_once_and_never_excluded() -> Result<()> {
    setup_logger();
    // Testing config: metrics every 500ms, warn after 3 missed intervals.
    let settings = testing(9516, 9517);
    let rx = spawn_run(one_user_test(), options(30), settings);

    let mut down = FramedRead::new(connect(9516).await?, LinesCodec::new());
    let mut up = FramedWrite::new(connect(9517).await?, LinesCodec::new());

    loop {
        match recv(&mut down).await? {
            Envelope::WorkerInit { .. } => {
                send(
                    &mut up,
                    &Envelope::Setup {
                        id: "fake:1-0".to_string(),
                    },
                )
                .await?;
            }
            Envelope::Run(_) => break,
            other => panic!("unexpected {} on down link", other.name()),
        }
    }

    // Withhold every metrics report long enough for two liveness checks
    // past the threshold, then report in late. The lapse must be logged
    // exactly once and the agent's totals must still be merged.
    tokio::time::sleep(Duration::from_millis(2200)).await;

    let mut stat = StatMap::new();
    let mut buyer = UserStat::default();
    buyer.add(2, 0, 0);
    stat.insert("buyer".to_string(), buyer);
    send(
        &mut up,
        &Envelope::Finish {
            id: "fake:1-0".to_string(),
            stat,
            log: RunLog::new(),
            clock: ClockMap::new(),
        },
    )
    .await?;

    let summary = tokio::time::timeout(Duration::from_secs(10), rx).await???;
    assert_eq!(summary.succeeded, 2);

    let warnings = summary
        .log
        .entries()
        .iter()
        .filter(|e| e.message.contains("went silent"))
        .count();
    assert_eq!(warnings, 1);
    Ok(())
}

struct Recorder {
    seen: Arc<Mutex<Vec<LiveSnapshot>>>,
}

impl Actor for Recorder {
    type Context = Context<Self>;
}

impl Handler<LiveSnapshot> for Recorder {
    type Result = ();

    fn handle(&mut self, msg: LiveSnapshot, _ctx: &mut Context<Self>) -> Self::Result {
        self.seen.lock().unwrap().push(msg);
    }
}

#[actix_rt::test]
#[serial]
async fn live_aggregate_reaches_the_subscriber_once_every_agent_reported() -> Result<()> {
    setup_logger();
    let settings = testing(9512, 9513);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorder = Recorder { seen: seen.clone() }.start();

    let (tx, rx) = oneshot::channel();
    let run_settings = settings.clone();
    let recipient = recorder.recipient();
    actix_rt::spawn(async move {
        let registry = Arc::new(SuiteRegistry::builtin());
        let _ = tx.send(
            run_load_with(
                one_user_test(),
                options(5),
                registry,
                &run_settings,
                Some(recipient),
            )
            .await,
        );
    });

    let mut down = FramedRead::new(connect(9512).await?, LinesCodec::new());
    let mut up = FramedWrite::new(connect(9513).await?, LinesCodec::new());

    loop {
        match recv(&mut down).await? {
            Envelope::WorkerInit { .. } => {
                send(
                    &mut up,
                    &Envelope::Setup {
                        id: "fake:1-0".to_string(),
                    },
                )
                .await?;
            }
            Envelope::Run(_) => break,
            other => panic!("unexpected {} on down link", other.name()),
        }
    }

    send(
        &mut up,
        &Envelope::WorkerMetrics(Box::new(AgentMetrics {
            id: "fake:1-0".to_string(),
            metrics: HostMetrics {
                cpu: 12.5,
                mem: 40.0,
                disk: 70.0,
                time: Utc::now(),
            },
            pop: BTreeMap::from([("buyer".to_string(), 2)]),
            stat: BTreeMap::from([("buyer".to_string(), Tally { s: 3, f: 0, a: 0 })]),
            clock: ClockMap::new(),
        })),
    )
    .await?;
    tokio::time::sleep(Duration::from_millis(300)).await;

    send(
        &mut up,
        &Envelope::Finish {
            id: "fake:1-0".to_string(),
            stat: StatMap::new(),
            log: RunLog::new(),
            clock: ClockMap::new(),
        },
    )
    .await?;

    let summary = tokio::time::timeout(Duration::from_secs(5), rx).await???;
    assert_eq!(summary.total(), 0);

    let seen = seen.lock().unwrap();
    assert!(!seen.is_empty());
    assert_eq!(seen[0].pop["buyer"], 2);
    assert_eq!(seen[0].stat["buyer"].s, 3);
    assert!(seen[0].hosts.contains_key("fake:1-0"));
    Ok(())
}
