use actix::Message;
use stampede_core::stats::Tally;
use stampede_core::suite::SuiteReport;
use std::collections::BTreeMap;

use super::Phase;

/// Natural completion of one suite execution of one virtual user.
#[derive(Message)]
#[rtype(result = "()")]
pub struct SuiteDone {
    pub user: String,
    pub index: u64,
    pub epoch: u64,
    pub elapsed_ms: u64,
    pub report: SuiteReport,
}

/// Snapshot of the agent's internal state, for diagnostics and tests.
#[derive(Message)]
#[rtype(result = "AgentStatus")]
pub struct GetStatus;

#[derive(Debug, Clone)]
pub struct AgentStatus {
    pub phase: Phase,
    /// Active global indices per user type, in tracking order.
    pub population: BTreeMap<String, Vec<u64>>,
    pub in_flight: u64,
    pub stat: BTreeMap<String, Tally>,
}
