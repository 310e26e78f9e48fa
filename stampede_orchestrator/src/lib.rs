//! Run driver: bind the hub, start the orchestrator actor and wait for the
//! merged result of one load run.

use actix::{Actor, Recipient};
use stampede_core::clock::ClockMap;
use stampede_core::error::LoadError;
use stampede_core::link::Hub;
use stampede_core::protocol::{LoadTest, RunOptions};
use stampede_core::runlog::RunLog;
use stampede_core::stats::StatMap;
use stampede_core::suite::SuiteRegistry;
use stampede_env::StampedeConfig;
use std::sync::Arc;
use tokio::sync::oneshot;

pub mod orchestrator;
pub mod plan;

pub use orchestrator::message::LiveSnapshot;
pub use orchestrator::{Orchestrator, Phase};

/// Everything one run produced, merged across agents.
#[derive(Debug)]
pub struct RunSummary {
    pub succeeded: u64,
    pub failed: u64,
    pub aborted: u64,
    pub elapsed_ms: u64,
    /// Merged log: orchestrator progress notes, agent logs and every suite
    /// log, in arrival order.
    pub log: RunLog,
    pub stat: StatMap,
    pub clock: ClockMap,
}

impl RunSummary {
    pub fn total(&self) -> u64 {
        self.succeeded + self.failed + self.aborted
    }

    /// `N succeeded, M failed, K aborted in Tms`
    pub fn line(&self) -> String {
        format!(
            "{} succeeded, {} failed, {} aborted in {}ms",
            self.succeeded, self.failed, self.aborted, self.elapsed_ms
        )
    }
}

/// Drive one complete load run to its summary.
///
/// Binds both hub ports from the settings, runs the start suite, discovers
/// agents, dispatches, aggregates and finally runs the finish suite. Only
/// `Config`, `Bind` and `Discovery` errors surface here; suite failures
/// tally into the summary.
pub async fn run_load(
    test: LoadTest,
    options: RunOptions,
    registry: Arc<SuiteRegistry>,
    settings: &StampedeConfig,
) -> Result<RunSummary, LoadError> {
    run_load_with(test, options, registry, settings, None).await
}

/// `run_load` with a live-aggregate subscriber, the seam an external
/// dashboard attaches to.
pub async fn run_load_with(
    test: LoadTest,
    options: RunOptions,
    registry: Arc<SuiteRegistry>,
    settings: &StampedeConfig,
    subscriber: Option<Recipient<LiveSnapshot>>,
) -> Result<RunSummary, LoadError> {
    options.validate()?;

    let (hub, inbound) = Hub::bind(settings.net.down_port, settings.net.up_port).await?;

    let (done_tx, done_rx) = oneshot::channel();
    Orchestrator::new(
        test,
        options,
        registry,
        settings.timing.clone(),
        hub,
        inbound,
    )
    .with_subscriber(subscriber)
    .on_done(done_tx)
    .start();

    match done_rx.await {
        Ok(result) => result,
        Err(_) => Err(LoadError::Config(
            "orchestrator stopped without reporting a result".to_string(),
        )),
    }
}
