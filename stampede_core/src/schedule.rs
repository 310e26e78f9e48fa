//! Population scheduler: pure partitioning and ramp interpolation.
//!
//! Everything here is side-effect free; the agent calls into it every
//! reconciliation tick and the orchestrator once, before dispatch.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One ramp point: (offset in seconds, total population at that offset).
pub type RampPoint = (u64, u64);

/// Time-keyed population target curve, either a single ramp applied to the
/// sum of all user types, or one ramp per user type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LoadProfile {
    Flat(Vec<RampPoint>),
    PerUser(BTreeMap<String, Vec<RampPoint>>),
}

/// A contiguous slice `[base, base + count)` of a partitioned total.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    pub base: u64,
    pub count: u64,
}

/// Divide `total` into `parties` whole partitions, each as equal as possible.
/// The first `total % parties` parties receive one extra unit.
pub fn partition(total: u64, parties: u64, index: u64) -> Partition {
    assert!(parties >= 1, "partition requires at least one party");
    debug_assert!(index < parties);

    let per = total / parties;
    let rem = total % parties;

    let count = if index < rem { per + 1 } else { per };
    let base = per * index + rem.min(index);

    Partition { base, count }
}

/// Interpolated population for `elapsed` seconds into an ascending ramp.
///
/// An empty ramp is 0. A ramp whose first offset is not 0 gets an implied
/// `(0, 0)` origin. Outside the ramp the nearest endpoint's value is used.
/// Interpolation rounds to nearest, ties up.
pub fn ramp_value(points: &[RampPoint], elapsed: f64) -> u64 {
    if points.is_empty() {
        return 0;
    }

    let implied = points[0].0 != 0;
    let len = points.len() + implied as usize;
    let at = |i: usize| -> RampPoint {
        if implied {
            if i == 0 {
                (0, 0)
            } else {
                points[i - 1]
            }
        } else {
            points[i]
        }
    };

    if elapsed <= at(0).0 as f64 {
        return at(0).1;
    }
    if elapsed >= at(len - 1).0 as f64 {
        return at(len - 1).1;
    }

    let mut next = 1;
    while (at(next).0 as f64) < elapsed {
        next += 1;
    }
    let (t0, v0) = at(next - 1);
    let (t1, v1) = at(next);

    let pcnt = (elapsed - t0 as f64) / ((t1 - t0) as f64);
    let value = (v1 as f64 - v0 as f64) * pcnt + v0 as f64;

    (value + 0.5).floor() as u64
}

/// Peak headcount per user type, computed once before dispatch.
///
/// A flat profile divides its peak evenly (floor, minimum 1) across types;
/// a per-type profile gives each type the peak of its own ramp.
pub fn compute_bound<V>(users: &BTreeMap<String, V>, profile: &LoadProfile) -> BTreeMap<String, u64> {
    let mut bounds = BTreeMap::new();

    match profile {
        LoadProfile::Flat(ramp) => {
            let peak = ramp.iter().map(|&(_, n)| n).max().unwrap_or(0);
            let per_type = (peak / users.len().max(1) as u64).max(1);
            for user in users.keys() {
                bounds.insert(user.clone(), per_type);
            }
        }
        LoadProfile::PerUser(ramps) => {
            for user in users.keys() {
                let peak = ramps
                    .get(user)
                    .map(|r| r.iter().map(|&(_, n)| n).max().unwrap_or(0))
                    .unwrap_or(0);
                bounds.insert(user.clone(), peak);
            }
        }
    }

    bounds
}

/// The instantaneous global target for one user type at `elapsed` seconds.
///
/// A flat profile is partitioned across the types by type index; a per-type
/// profile reads the type's own ramp (0 when the type has none).
pub fn instant_target(
    profile: &LoadProfile,
    user: &str,
    type_index: u64,
    type_count: u64,
    elapsed: f64,
) -> u64 {
    match profile {
        LoadProfile::Flat(ramp) => {
            partition(ramp_value(ramp, elapsed), type_count, type_index).count
        }
        LoadProfile::PerUser(ramps) => ramps
            .get(user)
            .map(|r| ramp_value(r, elapsed))
            .unwrap_or(0),
    }
}
