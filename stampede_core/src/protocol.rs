//! Wire protocol: the command envelope and every payload crossing the two
//! links. One JSON envelope per line, tagged by `cmd`, so routing is an
//! ordinary `match` instead of name lookup.

use crate::clock::ClockMap;
use crate::runlog::RunLog;
use crate::schedule::LoadProfile;
use crate::stats::{StatMap, Tally};
use crate::suite::SuiteSpec;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The only unit crossing a link.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd")]
pub enum Envelope {
    /// Discovery probe and clock reference, broadcast by the orchestrator.
    #[serde(rename = "workerInit")]
    WorkerInit {
        host: String,
        time: DateTime<Utc>,
    },

    /// Agent reply to `workerInit`.
    #[serde(rename = "setup")]
    Setup { id: String },

    /// Run parameters, one per discovered agent.
    #[serde(rename = "run")]
    Run(Box<RunCommand>),

    /// Final report from an agent after drain.
    #[serde(rename = "finish")]
    Finish {
        id: String,
        stat: StatMap,
        log: RunLog,
        clock: ClockMap,
    },

    /// Periodic agent report while a run is live.
    #[serde(rename = "workerMetrics")]
    WorkerMetrics(Box<AgentMetrics>),
}

impl Envelope {
    pub fn name(&self) -> &'static str {
        match self {
            Envelope::WorkerInit { .. } => "workerInit",
            Envelope::Setup { .. } => "setup",
            Envelope::Run(_) => "run",
            Envelope::Finish { .. } => "finish",
            Envelope::WorkerMetrics(_) => "workerMetrics",
        }
    }
}

/// The slice of the global population bound one agent may instantiate for
/// one user type. Fixed for the run's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    /// First global index owned by this agent.
    pub base: u64,
    /// Highest number of simultaneous users this agent may create.
    pub capacity: u64,
    /// Global bound across all agents, for `user_count_of`.
    pub total: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunCommand {
    pub users: BTreeMap<String, SuiteSpec>,
    pub options: RunOptions,
    #[serde(rename = "workerIndex")]
    pub worker_index: u64,
    #[serde(rename = "workerCount")]
    pub worker_count: u64,
    pub population: BTreeMap<String, Assignment>,
}

/// Inter-iteration delay, one value for everyone or one per user type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RepeatDelay {
    Global(u64),
    PerUser(BTreeMap<String, u64>),
}

impl RepeatDelay {
    pub fn resolve(delay: Option<&RepeatDelay>, user: &str, default_ms: u64) -> u64 {
        match delay {
            None => default_ms,
            Some(RepeatDelay::Global(ms)) => *ms,
            Some(RepeatDelay::PerUser(map)) => map.get(user).copied().unwrap_or(default_ms),
        }
    }
}

/// `dumpLog` accepts a bool or the string `"onfail"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DumpLog {
    Flag(bool),
    Mode(String),
}

impl Default for DumpLog {
    fn default() -> Self {
        DumpLog::Flag(false)
    }
}

impl DumpLog {
    pub fn dump_all(&self) -> bool {
        matches!(self, DumpLog::Flag(true))
    }

    pub fn dump_failures_only(&self) -> bool {
        matches!(self, DumpLog::Mode(m) if m == "onfail")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOptions {
    #[serde(rename = "loadProfile")]
    pub load_profile: LoadProfile,
    /// Run duration in seconds.
    pub duration: u64,
    #[serde(rename = "repeatDelay", default, skip_serializing_if = "Option::is_none")]
    pub repeat_delay: Option<RepeatDelay>,
    #[serde(rename = "dumpLog", default)]
    pub dump_log: DumpLog,
    #[serde(default)]
    pub verbosity: u8,
    /// Opaque object passed through to every suite context.
    #[serde(default)]
    pub params: serde_json::Value,
}

impl RunOptions {
    pub fn validate(&self) -> Result<(), crate::error::LoadError> {
        if self.duration == 0 {
            return Err(crate::error::LoadError::Config(
                "duration must be at least 1 second".to_string(),
            ));
        }

        // Interpolation assumes strictly ascending offsets; reject the rest
        // up front instead of clamping nonsense at run time.
        match &self.load_profile {
            LoadProfile::Flat(ramp) => {
                if !offsets_ascend(ramp) {
                    return Err(crate::error::LoadError::Config(
                        "load profile offsets must be strictly ascending".to_string(),
                    ));
                }
            }
            LoadProfile::PerUser(ramps) => {
                for (user, ramp) in ramps {
                    if !offsets_ascend(ramp) {
                        return Err(crate::error::LoadError::Config(format!(
                            "load profile offsets for '{}' must be strictly ascending",
                            user
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

fn offsets_ascend(points: &[crate::schedule::RampPoint]) -> bool {
    points.windows(2).all(|w| w[0].0 < w[1].0)
}

/// Test definition: an optional start suite, one suite per user type, an
/// optional finish suite. Owned by the orchestrator, shipped once at run
/// start.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoadTest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<SuiteSpec>,
    #[serde(default)]
    pub users: BTreeMap<String, SuiteSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish: Option<SuiteSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HostMetrics {
    /// CPU utilization percent, delta between two consecutive samples.
    pub cpu: f32,
    /// Memory utilization percent.
    pub mem: f32,
    /// Best-effort disk usage percent.
    pub disk: f32,
    pub time: DateTime<Utc>,
}

/// `workerMetrics` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMetrics {
    pub id: String,
    pub metrics: HostMetrics,
    /// Current active population per user type.
    pub pop: BTreeMap<String, u64>,
    pub stat: BTreeMap<String, Tally>,
    pub clock: ClockMap,
}
