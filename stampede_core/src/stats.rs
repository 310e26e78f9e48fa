//! Pass/fail/abort tallies, kept per user type on each agent and merged by
//! the orchestrator on final report.

use crate::runlog::RunLog;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Bare suite outcome counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tally {
    pub s: u64,
    pub f: u64,
    pub a: u64,
}

impl Tally {
    pub fn add(&mut self, s: u64, f: u64, a: u64) {
        self.s += s;
        self.f += f;
        self.a += a;
    }

    pub fn merge(&mut self, other: &Tally) {
        self.add(other.s, other.f, other.a);
    }

    pub fn total(&self) -> u64 {
        self.s + self.f + self.a
    }
}

/// Per-user-type running totals plus the scoped log of every suite run of
/// that type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserStat {
    pub s: u64,
    pub f: u64,
    pub a: u64,
    pub log: RunLog,
}

impl UserStat {
    pub fn tally(&self) -> Tally {
        Tally {
            s: self.s,
            f: self.f,
            a: self.a,
        }
    }

    pub fn add(&mut self, s: u64, f: u64, a: u64) {
        self.s += s;
        self.f += f;
        self.a += a;
    }

    pub fn merge(&mut self, other: &UserStat) {
        self.add(other.s, other.f, other.a);
        self.log.append(&other.log);
    }
}

pub type StatMap = BTreeMap<String, UserStat>;
