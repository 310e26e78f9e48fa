use actix::{Actor, ActorContext, AsyncContext, Context, SpawnHandle};
use chrono::Utc;
use stampede_core::clock::{ClockMap, ClockSet};
use stampede_core::error::LoadError;
use stampede_core::hostinfo;
use stampede_core::link::{DownLink, Hub};
use stampede_core::protocol::{
    AgentMetrics, Assignment, Envelope, LoadTest, RunCommand, RunOptions,
};
use stampede_core::runlog::RunLog;
use stampede_core::schedule;
use stampede_core::stats::{StatMap, Tally};
use stampede_core::suite::{SuiteContext, SuiteRegistry, SuiteSpec};
use stampede_env::TimingConfig;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, warn};

pub mod handler;
pub mod message;

use crate::RunSummary;
use message::{LiveSnapshot, SuiteDone};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    RunningStartSuite,
    Discovering,
    RunningTest,
    RunningFinishSuite,
    Done,
    DiscoveryFailed,
}

/// A mode gives otherwise-meaningless commands their meaning; modes stack,
/// the top one is consulted first when routing an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Discovery,
}

/// The single coordination point of a run: discovers agents, partitions the
/// population bound across them, merges their reports and produces the
/// summary. One run per actor instance by contract.
pub struct Orchestrator {
    test: LoadTest,
    options: RunOptions,
    registry: Arc<SuiteRegistry>,
    timing: TimingConfig,
    host: String,
    hub: Hub,
    down: DownLink,
    inbound: Option<mpsc::UnboundedReceiver<Envelope>>,

    phase: Phase,
    modes: Vec<Mode>,
    /// Peak headcount per user type, fixed before dispatch.
    bound: BTreeMap<String, u64>,
    /// Distinct agent ids collected from `setup` replies.
    agents: BTreeSet<String>,
    /// Agents whose `finish` is still outstanding.
    pending: BTreeSet<String>,

    begun: Instant,
    log: RunLog,
    stat: StatMap,
    clocks: ClockSet,

    /// Per-tick `workerMetrics` buffer, keyed by agent id.
    live: BTreeMap<String, AgentMetrics>,
    last_seen: BTreeMap<String, Instant>,
    /// Agents currently in a silence lapse, so each lapse warns once.
    silent: BTreeSet<String>,

    strobe_handle: Option<SpawnHandle>,
    liveness_handle: Option<SpawnHandle>,
    subscriber: Option<actix::Recipient<LiveSnapshot>>,
    done: Option<oneshot::Sender<Result<RunSummary, LoadError>>>,
}

impl Orchestrator {
    pub fn new(
        test: LoadTest,
        options: RunOptions,
        registry: Arc<SuiteRegistry>,
        timing: TimingConfig,
        hub: Hub,
        inbound: mpsc::UnboundedReceiver<Envelope>,
    ) -> Self {
        let bound = schedule::compute_bound(&test.users, &options.load_profile);
        let grid = timing.metrics_interval_ms;
        let down = hub.down();

        Self {
            test,
            options,
            registry,
            timing,
            host: hostinfo::hostname(),
            hub,
            down,
            inbound: Some(inbound),
            phase: Phase::Idle,
            modes: Vec::new(),
            bound,
            agents: BTreeSet::new(),
            pending: BTreeSet::new(),
            begun: Instant::now(),
            log: RunLog::with_scope("orchestrator"),
            stat: StatMap::new(),
            clocks: ClockSet::new(grid),
            live: BTreeMap::new(),
            last_seen: BTreeMap::new(),
            silent: BTreeSet::new(),
            strobe_handle: None,
            liveness_handle: None,
            subscriber: None,
            done: None,
        }
    }

    pub fn with_subscriber(mut self, subscriber: Option<actix::Recipient<LiveSnapshot>>) -> Self {
        self.subscriber = subscriber;
        self
    }

    /// Receives `Ok(summary)` or the fatal error that ended the run.
    pub fn on_done(mut self, tx: oneshot::Sender<Result<RunSummary, LoadError>>) -> Self {
        self.done = Some(tx);
        self
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    fn run_control_suite(&mut self, spec: SuiteSpec, scope: &'static str, ctx: &mut Context<Self>) {
        info!("running {} suite '{}'", scope, spec.suite);
        let registry = self.registry.clone();
        let cx = SuiteContext {
            scope: scope.to_string(),
            user: None,
            params: self.options.params.clone(),
            population: self.bound.clone(),
        };
        let addr = ctx.address();
        actix::spawn(async move {
            let report = registry.run(&spec, &cx).await;
            addr.do_send(SuiteDone { scope, report });
        });
    }

    fn handle_suite_done(&mut self, msg: SuiteDone, ctx: &mut Context<Self>) {
        let SuiteDone { scope, report } = msg;

        let stat = self.stat.entry(scope.to_string()).or_default();
        stat.add(report.succeeded, report.failed, report.aborted);
        stat.log.append(&report.log);
        self.clocks.absorb(&report.clock);

        match scope {
            "start" => {
                if report.failed > 0 {
                    warn!("start suite failed, skipping the test");
                    self.log.warning("start suite failed, skipping the test");
                    self.begin_finish(ctx);
                } else {
                    self.after_start(ctx);
                }
            }
            _ => self.complete(ctx),
        }
    }

    fn after_start(&mut self, ctx: &mut Context<Self>) {
        if self.test.users.is_empty() {
            info!("no user suites declared, nothing to run");
            self.log.info("no user suites declared, nothing to run");
            self.begin_finish(ctx);
            return;
        }
        self.start_discovery(ctx);
    }

    fn start_discovery(&mut self, ctx: &mut Context<Self>) {
        self.phase = Phase::Discovering;
        self.modes.push(Mode::Discovery);

        info!("searching for agents");
        self.log.info("searching for agents");

        self.strobe();
        self.strobe_handle = Some(ctx.run_interval(
            Duration::from_millis(self.timing.strobe_interval_ms),
            |act, _| act.strobe(),
        ));
        ctx.run_later(
            Duration::from_millis(self.timing.discovery_window_ms),
            |act, ctx| act.end_discovery(ctx),
        );
    }

    fn strobe(&mut self) {
        self.down.broadcast(Envelope::WorkerInit {
            host: self.host.clone(),
            time: Utc::now(),
        });
    }

    fn handle_setup(&mut self, id: String) {
        if self.agents.insert(id.clone()) {
            info!("agent {} answered", id);
        }
    }

    fn end_discovery(&mut self, ctx: &mut Context<Self>) {
        if let Some(handle) = self.strobe_handle.take() {
            ctx.cancel_future(handle);
        }
        self.modes.pop();

        if self.agents.is_empty() {
            self.phase = Phase::DiscoveryFailed;
            error!(
                "no agents answered within {}ms",
                self.timing.discovery_window_ms
            );
            self.fail(LoadError::Discovery(self.timing.discovery_window_ms), ctx);
            return;
        }

        info!("found {} agents", self.agents.len());
        self.log.info(format!("found {} agents", self.agents.len()));
        self.dispatch(ctx);
    }

    /// Carve the population bound into one fixed assignment per agent and
    /// hand each agent its run command through the distributor.
    fn dispatch(&mut self, ctx: &mut Context<Self>) {
        self.phase = Phase::RunningTest;
        self.pending = self.agents.clone();

        let count = self.agents.len() as u64;
        let now = Instant::now();
        for id in &self.agents {
            self.last_seen.insert(id.clone(), now);
        }

        for (i, id) in self.agents.iter().enumerate() {
            let mut population = BTreeMap::new();
            for (user, &total) in &self.bound {
                let share = schedule::partition(total, count, i as u64);
                population.insert(
                    user.clone(),
                    Assignment {
                        base: share.base,
                        capacity: share.count,
                        total,
                    },
                );
            }

            debug!(agent = %id, index = i, "built run command");
            self.down.distribute(Envelope::Run(Box::new(RunCommand {
                users: self.test.users.clone(),
                options: self.options.clone(),
                worker_index: i as u64,
                worker_count: count,
                population,
            })));
        }

        info!("dispatched run to {} agents", count);
        self.liveness_handle = Some(ctx.run_interval(
            Duration::from_millis(self.timing.metrics_interval_ms),
            |act, _| act.check_liveness(),
        ));
    }

    /// A silent agent is logged, never excluded: the run stalls visibly
    /// instead of finishing with partial totals.
    fn check_liveness(&mut self) {
        let threshold = Duration::from_millis(
            self.timing.metrics_interval_ms * self.timing.liveness_warn_intervals,
        );
        for id in &self.pending {
            let Some(seen) = self.last_seen.get(id) else {
                continue;
            };
            if seen.elapsed() >= threshold && self.silent.insert(id.clone()) {
                warn!(
                    "agent {} silent for {}ms, still waiting",
                    id,
                    seen.elapsed().as_millis()
                );
                self.log
                    .warning(format!("agent {} went silent", id));
            }
        }
    }

    fn handle_metrics(&mut self, m: AgentMetrics) {
        self.last_seen.insert(m.id.clone(), Instant::now());
        if self.silent.remove(&m.id) {
            info!("agent {} reporting again", m.id);
        }

        if self.phase != Phase::RunningTest {
            debug!(agent = %m.id, "metrics outside a running test; dropping");
            return;
        }
        if !self.pending.contains(&m.id) {
            debug!(agent = %m.id, "metrics from a finished agent; dropping");
            return;
        }

        self.live.insert(m.id.clone(), m);
        if self.pending.iter().all(|id| self.live.contains_key(id)) {
            self.publish_live();
        }
    }

    /// One aggregate per metrics tick, once every outstanding agent has
    /// reported: host metrics by agent, population and tallies summed per
    /// type, clock histories merged into the grid.
    fn publish_live(&mut self) {
        let mut hosts = BTreeMap::new();
        let mut pop: BTreeMap<String, u64> = BTreeMap::new();
        let mut stat: BTreeMap<String, Tally> = BTreeMap::new();
        let mut clocks = ClockSet::new(self.timing.metrics_interval_ms);

        for (id, m) in std::mem::take(&mut self.live) {
            hosts.insert(id, m.metrics);
            for (user, n) in m.pop {
                *pop.entry(user).or_default() += n;
            }
            for (user, tally) in m.stat {
                stat.entry(user).or_default().merge(&tally);
            }
            clocks.absorb(&m.clock);
        }

        let snapshot = LiveSnapshot {
            hosts,
            pop,
            stat,
            clock: clocks.into_map(),
        };

        match serde_json::to_string(&snapshot) {
            Ok(json) => info!(target: "stampede::profile", profile = %json, "live aggregate"),
            Err(e) => warn!("failed to encode live aggregate: {}", e),
        }
        if let Some(subscriber) = &self.subscriber {
            subscriber.do_send(snapshot);
        }
    }

    fn handle_finish(
        &mut self,
        id: String,
        stat: StatMap,
        log: RunLog,
        clock: ClockMap,
        ctx: &mut Context<Self>,
    ) {
        if !self.pending.remove(&id) {
            debug!(agent = %id, "finish from an unknown or finished agent; dropping");
            return;
        }
        self.last_seen.insert(id.clone(), Instant::now());
        self.silent.remove(&id);
        self.live.remove(&id);

        for (user, user_stat) in &stat {
            self.stat.entry(user.clone()).or_default().merge(user_stat);
        }
        self.log.append(&log);
        self.clocks.absorb(&clock);

        info!("agent {} finished ({} outstanding)", id, self.pending.len());

        if self.pending.is_empty() {
            if let Some(handle) = self.liveness_handle.take() {
                ctx.cancel_future(handle);
            }
            info!("all agents reported, closing links");
            self.hub.close();
            self.begin_finish(ctx);
        }
    }

    fn begin_finish(&mut self, ctx: &mut Context<Self>) {
        self.phase = Phase::RunningFinishSuite;
        match self.test.finish.clone() {
            Some(spec) => self.run_control_suite(spec, "finish", ctx),
            None => self.complete(ctx),
        }
    }

    /// Assemble the summary from everything merged so far and stop.
    fn complete(&mut self, ctx: &mut Context<Self>) {
        self.phase = Phase::Done;
        self.hub.close();

        let stat = std::mem::take(&mut self.stat);
        let mut log = std::mem::take(&mut self.log);
        for user_stat in stat.values() {
            log.append(&user_stat.log);
        }

        let (mut succeeded, mut failed, mut aborted) = (0, 0, 0);
        for user_stat in stat.values() {
            succeeded += user_stat.s;
            failed += user_stat.f;
            aborted += user_stat.a;
        }

        let clocks = std::mem::replace(
            &mut self.clocks,
            ClockSet::new(self.timing.metrics_interval_ms),
        );
        let summary = RunSummary {
            succeeded,
            failed,
            aborted,
            elapsed_ms: self.begun.elapsed().as_millis() as u64,
            log,
            stat,
            clock: clocks.into_map(),
        };

        info!("{}", summary.line());
        if let Some(tx) = self.done.take() {
            let _ = tx.send(Ok(summary));
        }
        ctx.stop();
    }

    fn fail(&mut self, err: LoadError, ctx: &mut Context<Self>) {
        self.hub.close();
        if let Some(tx) = self.done.take() {
            let _ = tx.send(Err(err));
        }
        ctx.stop();
    }
}

impl Actor for Orchestrator {
    type Context = Context<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!("load run starting");
        self.begun = Instant::now();
        if let Some(inbound) = self.inbound.take() {
            ctx.add_stream(UnboundedReceiverStream::new(inbound));
        }

        self.phase = Phase::RunningStartSuite;
        match self.test.start.clone() {
            Some(spec) => self.run_control_suite(spec, "start", ctx),
            None => self.after_start(ctx),
        }
    }
}
