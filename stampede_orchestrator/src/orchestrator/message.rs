use actix::Message;
use serde::Serialize;
use stampede_core::clock::ClockMap;
use stampede_core::protocol::HostMetrics;
use stampede_core::stats::Tally;
use stampede_core::suite::SuiteReport;
use std::collections::BTreeMap;

/// Completion of a start or finish suite.
#[derive(Message)]
#[rtype(result = "()")]
pub struct SuiteDone {
    pub scope: &'static str,
    pub report: SuiteReport,
}

/// One metrics-tick aggregate across every outstanding agent. Emitted as a
/// `stampede::profile` log record and to the optional subscriber.
#[derive(Debug, Clone, Serialize, Message)]
#[rtype(result = "()")]
pub struct LiveSnapshot {
    /// Host metrics by agent id.
    pub hosts: BTreeMap<String, HostMetrics>,
    /// Active population per user type, summed across agents.
    pub pop: BTreeMap<String, u64>,
    /// Outcome tallies per user type, summed across agents.
    pub stat: BTreeMap<String, Tally>,
    pub clock: ClockMap,
}
