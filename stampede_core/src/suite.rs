//! The suite boundary. A suite is an opaque unit of test steps executed by a
//! runner pre-deployed to every process; the wire only ever carries its name
//! and a config object, never code.

use crate::clock::ClockMap;
use crate::runlog::RunLog;
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

/// Data-only suite reference: runner name plus an opaque config blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteSpec {
    pub suite: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

impl SuiteSpec {
    pub fn named(suite: &str) -> Self {
        Self {
            suite: suite.to_string(),
            config: serde_json::Value::Null,
        }
    }
}

/// Identity of the virtual user a suite runs for. Absent for start/finish
/// suites.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserSlot {
    pub user_index: u64,
    pub user_count: u64,
    pub run_count: u64,
}

#[derive(Debug, Clone)]
pub struct SuiteContext {
    /// Log scope the suite should write under (user type, or start/finish).
    pub scope: String,
    pub user: Option<UserSlot>,
    pub params: serde_json::Value,
    /// Global population bound per user type.
    pub population: BTreeMap<String, u64>,
}

impl SuiteContext {
    pub fn user_count_of(&self, user: &str) -> u64 {
        self.population.get(user).copied().unwrap_or(0)
    }
}

/// What every suite completion reports, whatever happened inside.
#[derive(Debug, Clone, Default)]
pub struct SuiteReport {
    pub succeeded: u64,
    pub failed: u64,
    pub aborted: u64,
    pub log: RunLog,
    pub clock: ClockMap,
}

impl SuiteReport {
    pub fn aborted_with(scope: &str, message: impl Into<String>) -> Self {
        let mut log = RunLog::with_scope(scope);
        log.error(message);
        Self {
            aborted: 1,
            log,
            ..Self::default()
        }
    }
}

#[async_trait]
pub trait SuiteRunner: Send + Sync {
    async fn run_suite(&self, spec: &SuiteSpec, cx: &SuiteContext) -> SuiteReport;
}

/// Name -> runner table assembled at process start. Running an unregistered
/// name yields an aborted report, never a crash.
#[derive(Default)]
pub struct SuiteRegistry {
    runners: HashMap<String, Arc<dyn SuiteRunner>>,
}

impl SuiteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The builtin stand-ins used by the launchers and tests.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register("pause", Arc::new(PauseSuite));
        registry.register("flaky", Arc::new(FlakySuite));
        registry
    }

    pub fn register(&mut self, name: &str, runner: Arc<dyn SuiteRunner>) {
        self.runners.insert(name.to_string(), runner);
    }

    pub async fn run(&self, spec: &SuiteSpec, cx: &SuiteContext) -> SuiteReport {
        match self.runners.get(&spec.suite) {
            Some(runner) => {
                debug!(suite = %spec.suite, scope = %cx.scope, "running suite");
                runner.run_suite(spec, cx).await
            }
            None => {
                error!(suite = %spec.suite, "no such suite registered");
                SuiteReport::aborted_with(
                    &cx.scope,
                    format!("no suite named '{}' is registered", spec.suite),
                )
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct PauseConfig {
    #[serde(default = "PauseConfig::default_delay")]
    delay_ms: u64,
    #[serde(default)]
    jitter_ms: u64,
}

impl PauseConfig {
    fn default_delay() -> u64 {
        100
    }
}

/// Sleeps a configured interval (plus optional jitter) and succeeds.
pub struct PauseSuite;

#[async_trait]
impl SuiteRunner for PauseSuite {
    async fn run_suite(&self, spec: &SuiteSpec, cx: &SuiteContext) -> SuiteReport {
        let config: PauseConfig =
            serde_json::from_value(spec.config.clone()).unwrap_or(PauseConfig {
                delay_ms: PauseConfig::default_delay(),
                jitter_ms: 0,
            });

        let jitter = if config.jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=config.jitter_ms)
        } else {
            0
        };
        tokio::time::sleep(Duration::from_millis(config.delay_ms + jitter)).await;

        let mut log = RunLog::with_scope(&cx.scope);
        match cx.user {
            Some(slot) => log.good(format!(
                "pause ok (user {} run {})",
                slot.user_index, slot.run_count
            )),
            None => log.good("pause ok"),
        }

        SuiteReport {
            succeeded: 1,
            log,
            ..SuiteReport::default()
        }
    }
}

#[derive(Debug, Deserialize)]
struct FlakyConfig {
    /// Fail every n-th iteration; 0 never fails.
    #[serde(default)]
    fail_every: u64,
}

/// Succeeds except on every n-th iteration of a virtual user.
pub struct FlakySuite;

#[async_trait]
impl SuiteRunner for FlakySuite {
    async fn run_suite(&self, spec: &SuiteSpec, cx: &SuiteContext) -> SuiteReport {
        let config: FlakyConfig =
            serde_json::from_value(spec.config.clone()).unwrap_or(FlakyConfig { fail_every: 0 });

        let run_count = cx.user.map(|u| u.run_count).unwrap_or(0);
        let mut log = RunLog::with_scope(&cx.scope);

        if config.fail_every > 0 && (run_count + 1) % config.fail_every == 0 {
            log.error(format!("flaky failure on run {}", run_count));
            SuiteReport {
                failed: 1,
                log,
                ..SuiteReport::default()
            }
        } else {
            log.good(format!("flaky ok on run {}", run_count));
            SuiteReport {
                succeeded: 1,
                log,
                ..SuiteReport::default()
            }
        }
    }
}
