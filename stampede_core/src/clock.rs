//! Per-operation timing statistics with a coarse time-bucketed history.
//!
//! Buckets carry explicit `{offset, span}` ranges; the merging side files an
//! incoming bucket into its own grid by the bucket midpoint, so two parties
//! with slightly different polling phases still land in comparable cells.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClockBucket {
    /// Milliseconds from run start where this bucket's window begins.
    pub offset: u64,
    /// Window length in milliseconds.
    pub span: u64,
    pub count: u64,
    pub elapsed: u64,
    pub avg: f64,
}

impl ClockBucket {
    fn midpoint(&self) -> u64 {
        self.offset + self.span / 2
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClockSample {
    pub count: u64,
    pub elapsed: u64,
    pub avg: f64,
    pub hist: Vec<ClockBucket>,
    #[serde(skip)]
    pending_count: u64,
    #[serde(skip)]
    pending_elapsed: u64,
}

/// Wire form: clock name -> sample.
pub type ClockMap = BTreeMap<String, ClockSample>;

/// Owner-side clock aggregator. Agents record raw timings and roll them into
/// history buckets on each metrics tick; the orchestrator absorbs remote
/// maps into its own grid.
#[derive(Debug, Clone)]
pub struct ClockSet {
    clocks: ClockMap,
    grid_span: u64,
    last_roll: u64,
}

impl ClockSet {
    pub fn new(grid_span_ms: u64) -> Self {
        Self {
            clocks: ClockMap::new(),
            grid_span: grid_span_ms.max(1),
            last_roll: 0,
        }
    }

    /// Record one timed operation.
    pub fn record(&mut self, name: &str, elapsed_ms: u64) {
        let sample = self.clocks.entry(name.to_string()).or_default();
        sample.count += 1;
        sample.elapsed += elapsed_ms;
        sample.avg = sample.elapsed as f64 / sample.count as f64;
        sample.pending_count += 1;
        sample.pending_elapsed += elapsed_ms;
    }

    /// Close the window `[last_roll, offset_ms)` and move the pending deltas
    /// into a history bucket for it.
    pub fn roll(&mut self, offset_ms: u64) {
        let offset_ms = offset_ms.max(self.last_roll);
        let span = (offset_ms - self.last_roll).max(1);

        for sample in self.clocks.values_mut() {
            if sample.pending_count == 0 {
                continue;
            }
            let elapsed = sample.pending_elapsed;
            let count = sample.pending_count;
            sample.hist.push(ClockBucket {
                offset: self.last_roll,
                span,
                count,
                elapsed,
                avg: elapsed as f64 / count as f64,
            });
            sample.pending_count = 0;
            sample.pending_elapsed = 0;
        }

        self.last_roll = offset_ms;
    }

    /// Merge a remote clock map: totals sum per name, history buckets land in
    /// this set's grid cell by midpoint.
    pub fn absorb(&mut self, other: &ClockMap) {
        for (name, remote) in other {
            let sample = self.clocks.entry(name.clone()).or_default();
            sample.count += remote.count;
            sample.elapsed += remote.elapsed;
            if sample.count > 0 {
                sample.avg = sample.elapsed as f64 / sample.count as f64;
            }

            for bucket in &remote.hist {
                let cell = bucket.midpoint() / self.grid_span;
                let offset = cell * self.grid_span;

                let slot = match sample.hist.binary_search_by_key(&offset, |b| b.offset) {
                    Ok(i) => &mut sample.hist[i],
                    Err(i) => {
                        sample.hist.insert(
                            i,
                            ClockBucket {
                                offset,
                                span: self.grid_span,
                                ..ClockBucket::default()
                            },
                        );
                        &mut sample.hist[i]
                    }
                };

                slot.count += bucket.count;
                slot.elapsed += bucket.elapsed;
                if slot.count > 0 {
                    slot.avg = slot.elapsed as f64 / slot.count as f64;
                }
            }
        }
    }

    pub fn to_map(&self) -> ClockMap {
        self.clocks.clone()
    }

    pub fn into_map(self) -> ClockMap {
        self.clocks
    }

    pub fn is_empty(&self) -> bool {
        self.clocks.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&ClockSample> {
        self.clocks.get(name)
    }
}
