use actix::Actor;
use anyhow::Result;
use serial_test::serial;
use stampede_agent::Agent;
use stampede_core::link;
use stampede_core::protocol::{DumpLog, LoadTest, RepeatDelay, RunOptions};
use stampede_core::schedule::LoadProfile;
use stampede_core::suite::{SuiteRegistry, SuiteSpec};
use stampede_env::StampedeConfig;
use stampede_orchestrator::run_load;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

fn setup_logger() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info,stampede_orchestrator=debug,stampede_agent=debug")
        .try_init();
}

async fn start_agent(settings: &StampedeConfig, registry: Arc<SuiteRegistry>) -> Result<()> {
    for _ in 0..100 {
        match link::connect(
            "127.0.0.1",
            settings.net.down_port,
            settings.net.up_port,
        )
        .await
        {
            Ok((up, inbound)) => {
                Agent::new(registry, settings.timing.clone(), up, inbound).start();
                return Ok(());
            }
            Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
        }
    }
    anyhow::bail!("orchestrator never opened its ports")
}

#[actix_rt::test]
#[serial]
async fn two_agents_split_the_population_and_totals_add_up() -> Result<()> {
    setup_logger();
    let mut settings = StampedeConfig::testing();
    settings.net.down_port = 9520;
    settings.net.up_port = 9521;

    let registry = Arc::new(SuiteRegistry::builtin());

    let mut users = BTreeMap::new();
    users.insert(
        "buyer".to_string(),
        SuiteSpec {
            suite: "pause".to_string(),
            config: serde_json::json!({"delay_ms": 50}),
        },
    );
    let test = LoadTest {
        start: None,
        users,
        finish: None,
    };
    let options = RunOptions {
        load_profile: LoadProfile::Flat(vec![(0, 2), (5, 2)]),
        duration: 2,
        repeat_delay: Some(RepeatDelay::Global(50)),
        dump_log: DumpLog::default(),
        verbosity: 1,
        params: serde_json::Value::Null,
    };

    let (tx, rx) = tokio::sync::oneshot::channel();
    let run_settings = settings.clone();
    let run_registry = registry.clone();
    actix_rt::spawn(async move {
        let _ = tx.send(run_load(test, options, run_registry, &run_settings).await);
    });

    start_agent(&settings, registry.clone()).await?;
    start_agent(&settings, registry.clone()).await?;

    let summary = tokio::time::timeout(Duration::from_secs(30), rx).await???;

    // partition(2, 2, i) gives every agent exactly one concurrent user, so
    // only global indices 0 and 1 ever run.
    let rendered = summary.log.render(1).join("\n");
    assert!(rendered.contains("(user 0 run"), "log was:\n{}", rendered);
    assert!(rendered.contains("(user 1 run"), "log was:\n{}", rendered);
    assert!(!rendered.contains("(user 2"), "log was:\n{}", rendered);

    assert_eq!(summary.failed, 0);
    assert_eq!(summary.aborted, 0);
    assert!(summary.succeeded > 0);
    assert_eq!(summary.stat["buyer"].tally().total(), summary.total());
    assert!(summary.elapsed_ms >= 2000);

    Ok(())
}
