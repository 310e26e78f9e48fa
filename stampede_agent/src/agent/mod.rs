use actix::{Actor, AsyncContext, Context, SpawnHandle};
use chrono::Utc;
use stampede_core::clock::ClockSet;
use stampede_core::hostinfo::{next_agent_id, HostSampler};
use stampede_core::link::UpLink;
use stampede_core::protocol::{
    AgentMetrics, Assignment, Envelope, RepeatDelay, RunCommand, RunOptions,
};
use stampede_core::runlog::RunLog;
use stampede_core::schedule;
use stampede_core::stats::StatMap;
use stampede_core::suite::{SuiteContext, SuiteRegistry, SuiteSpec, UserSlot};
use stampede_env::TimingConfig;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};

pub mod handler;
pub mod message;

use message::SuiteDone;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Connected,
    Running,
    Draining,
}

/// One simulated concurrent actor of a user type. Its global index is
/// stable for its lifetime and always lies within the agent's assigned
/// range; the epoch tells a late completion of a replaced incarnation
/// apart from the current one.
#[derive(Debug)]
struct VirtualUser {
    index: u64,
    epoch: u64,
    run_count: u64,
}

struct ActiveRun {
    users: BTreeMap<String, SuiteSpec>,
    options: RunOptions,
    worker_index: u64,
    worker_count: u64,
    assignment: BTreeMap<String, Assignment>,
    started_at: Instant,
    /// Tracked virtual users per type; tail entries are the first to go.
    pop: BTreeMap<String, Vec<VirtualUser>>,
    stat: StatMap,
    log: RunLog,
    clocks: ClockSet,
    in_flight: u64,
    next_epoch: u64,
    tick_handle: Option<SpawnHandle>,
    metrics_handle: Option<SpawnHandle>,
    drain_handle: Option<SpawnHandle>,
}

/// One agent process: owns its share of the virtual-user population and
/// reconciles it against the ramp target every tick. Exactly one run is
/// supervised at a time; finishing a run resets the agent for reuse.
pub struct Agent {
    id: String,
    registry: Arc<SuiteRegistry>,
    timing: TimingConfig,
    up: UpLink,
    inbound: Option<mpsc::UnboundedReceiver<Envelope>>,
    sampler: HostSampler,
    phase: Phase,
    master_host: Option<String>,
    clock_skew_ms: i64,
    run: Option<ActiveRun>,
    on_disconnect: Option<oneshot::Sender<()>>,
}

impl Agent {
    pub fn new(
        registry: Arc<SuiteRegistry>,
        timing: TimingConfig,
        up: UpLink,
        inbound: mpsc::UnboundedReceiver<Envelope>,
    ) -> Self {
        Self {
            id: next_agent_id(),
            registry,
            timing,
            up,
            inbound: Some(inbound),
            sampler: HostSampler::new(),
            phase: Phase::Idle,
            master_host: None,
            clock_skew_ms: 0,
            run: None,
            on_disconnect: None,
        }
    }

    /// Notified once when the down link closes.
    pub fn on_disconnect(mut self, tx: oneshot::Sender<()>) -> Self {
        self.on_disconnect = Some(tx);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn handle_worker_init(&mut self, host: String, time: chrono::DateTime<Utc>) {
        if self.master_host.as_deref() != Some(host.as_str()) {
            info!("connected to host: {}", host);
            self.master_host = Some(host);
        }

        self.clock_skew_ms = (time - Utc::now()).num_milliseconds();
        if self.phase == Phase::Idle {
            self.phase = Phase::Connected;
        }

        self.up.send(Envelope::Setup {
            id: self.id.clone(),
        });
    }

    fn handle_run(&mut self, cmd: RunCommand, ctx: &mut Context<Self>) {
        if self.run.is_some() {
            warn!("run command received while a run is active; ignoring");
            return;
        }

        info!(
            "running as worker #{} of {}",
            cmd.worker_index, cmd.worker_count
        );

        let mut log = RunLog::with_scope("agent");
        log.set_skew(self.clock_skew_ms);

        self.run = Some(ActiveRun {
            users: cmd.users,
            options: cmd.options,
            worker_index: cmd.worker_index,
            worker_count: cmd.worker_count,
            assignment: cmd.population,
            started_at: Instant::now(),
            pop: BTreeMap::new(),
            stat: StatMap::new(),
            log,
            clocks: ClockSet::new(self.timing.metrics_interval_ms),
            in_flight: 0,
            next_epoch: 0,
            tick_handle: None,
            metrics_handle: None,
            drain_handle: None,
        });
        self.phase = Phase::Running;

        let tick = ctx.run_interval(
            Duration::from_millis(self.timing.reconcile_tick_ms),
            |act, ctx| act.reconcile(ctx),
        );
        let metrics = ctx.run_interval(
            Duration::from_millis(self.timing.metrics_interval_ms),
            |act, _| act.report_metrics(),
        );
        if let Some(run) = self.run.as_mut() {
            run.tick_handle = Some(tick);
            run.metrics_handle = Some(metrics);
        }
    }

    /// One reconciliation tick: bring each type's tracked population to its
    /// share of the instantaneous ramp target.
    fn reconcile(&mut self, ctx: &mut Context<Self>) {
        let (elapsed, duration, users, worker_index, worker_count, profile) = {
            let Some(run) = self.run.as_ref() else { return };
            (
                run.started_at.elapsed().as_secs_f64(),
                run.options.duration,
                run.users.keys().cloned().collect::<Vec<_>>(),
                run.worker_index,
                run.worker_count,
                run.options.load_profile.clone(),
            )
        };

        if elapsed >= duration as f64 {
            self.begin_drain(ctx);
            return;
        }

        let type_count = users.len() as u64;
        for (i, user) in users.iter().enumerate() {
            let target = schedule::instant_target(&profile, user, i as u64, type_count, elapsed);
            let share = schedule::partition(target, worker_count, worker_index).count;
            let capacity = self
                .run
                .as_ref()
                .and_then(|r| r.assignment.get(user))
                .map(|a| a.capacity)
                .unwrap_or(0);
            self.set_population(user, share.min(capacity), ctx);
        }
    }

    /// Grow from the tail with fresh indices, shrink from the tail so low
    /// indices stay persistent across ramp fluctuations.
    fn set_population(&mut self, user: &str, want: u64, ctx: &mut Context<Self>) {
        let mut to_start = Vec::new();
        {
            let Some(run) = self.run.as_mut() else { return };
            let base = run.assignment.get(user).map(|a| a.base).unwrap_or(0);
            let list = run.pop.entry(user.to_string()).or_default();

            while (list.len() as u64) < want {
                run.next_epoch += 1;
                let vu = VirtualUser {
                    index: base + list.len() as u64,
                    epoch: run.next_epoch,
                    run_count: 0,
                };
                debug!("starting {} @ {}", user, vu.index);
                to_start.push((vu.index, vu.epoch));
                list.push(vu);
            }

            while (list.len() as u64) > want {
                if let Some(vu) = list.pop() {
                    debug!("stopping {} @ {}", user, vu.index);
                }
            }
        }

        for (index, epoch) in to_start {
            self.start_iteration(user.to_string(), index, epoch, ctx);
        }
    }

    /// Kick off one suite execution for a tracked virtual user. Skipped when
    /// the incarnation is gone or replaced.
    fn start_iteration(&mut self, user: String, index: u64, epoch: u64, ctx: &mut Context<Self>) {
        let Some(run) = self.run.as_mut() else { return };

        let current = run
            .pop
            .get_mut(&user)
            .and_then(|list| list.iter_mut().find(|v| v.index == index));
        let Some(vu) = current else {
            debug!("skipping iteration for retired {} @ {}", user, index);
            return;
        };
        if vu.epoch != epoch {
            debug!("skipping iteration for replaced {} @ {}", user, index);
            return;
        }

        let run_count = vu.run_count;
        vu.run_count += 1;

        let Some(spec) = run.users.get(&user).cloned() else { return };
        let user_count = run.assignment.get(&user).map(|a| a.total).unwrap_or(0);
        let cx = SuiteContext {
            scope: user.clone(),
            user: Some(UserSlot {
                user_index: index,
                user_count,
                run_count,
            }),
            params: run.options.params.clone(),
            population: run
                .assignment
                .iter()
                .map(|(u, a)| (u.clone(), a.total))
                .collect(),
        };

        run.in_flight += 1;

        let registry = self.registry.clone();
        let addr = ctx.address();
        actix::spawn(async move {
            let started = Instant::now();
            let report = registry.run(&spec, &cx).await;
            addr.do_send(SuiteDone {
                user,
                index,
                epoch,
                elapsed_ms: started.elapsed().as_millis() as u64,
                report,
            });
        });
    }

    fn handle_suite_done(&mut self, msg: SuiteDone, ctx: &mut Context<Self>) {
        let SuiteDone {
            user,
            index,
            epoch,
            elapsed_ms,
            report,
        } = msg;

        let skew = self.clock_skew_ms;
        let default_delay = self.timing.default_repeat_delay_ms;

        let Some(run) = self.run.as_mut() else {
            debug!("suite completion after reset; dropping");
            return;
        };

        run.in_flight = run.in_flight.saturating_sub(1);

        let stat = run.stat.entry(user.clone()).or_default();
        stat.add(report.succeeded, report.failed, report.aborted);
        let mut suite_log = report.log;
        suite_log.shift_time(skew);
        stat.log.append(&suite_log);

        run.clocks.record(&user, elapsed_ms);
        run.clocks.absorb(&report.clock);

        let still_tracked = run
            .pop
            .get(&user)
            .map_or(false, |list| {
                list.iter().any(|v| v.index == index && v.epoch == epoch)
            });

        if still_tracked {
            let delay =
                RepeatDelay::resolve(run.options.repeat_delay.as_ref(), &user, default_delay);
            ctx.run_later(Duration::from_millis(delay), move |act, ctx| {
                act.start_iteration(user, index, epoch, ctx)
            });
        } else {
            debug!("discarding completion for retired {} @ {}", user, index);
        }
    }

    /// Force every type's target to 0 and wait for in-flight suites to end
    /// naturally. No timeout: an unresponsive suite stalls shutdown.
    fn begin_drain(&mut self, ctx: &mut Context<Self>) {
        let users: Vec<String> = match self.run.as_ref() {
            Some(run) => run.users.keys().cloned().collect(),
            None => return,
        };
        for user in users {
            self.set_population(&user, 0, ctx);
        }

        let drain_poll = self.timing.drain_poll_ms;
        let Some(run) = self.run.as_mut() else { return };
        if let Some(handle) = run.tick_handle.take() {
            ctx.cancel_future(handle);
        }

        info!(
            "duration reached, draining ({} suites in flight)",
            run.in_flight
        );
        self.phase = Phase::Draining;
        run.drain_handle = Some(ctx.run_interval(
            Duration::from_millis(drain_poll),
            |act, ctx| act.poll_drain(ctx),
        ));
    }

    fn poll_drain(&mut self, ctx: &mut Context<Self>) {
        let in_flight = match self.run.as_ref() {
            Some(run) => run.in_flight,
            None => return,
        };
        if in_flight > 0 {
            debug!("draining: {} suites in flight", in_flight);
            return;
        }
        self.finish_run(ctx);
    }

    /// Assemble and send the final report, then reset to `Idle` so the
    /// agent can serve a future run.
    fn finish_run(&mut self, ctx: &mut Context<Self>) {
        let Some(mut run) = self.run.take() else { return };

        for handle in [
            run.tick_handle.take(),
            run.metrics_handle.take(),
            run.drain_handle.take(),
        ]
        .into_iter()
        .flatten()
        {
            ctx.cancel_future(handle);
        }

        run.clocks.roll(run.started_at.elapsed().as_millis() as u64);
        run.log.info("run complete");

        info!("run complete, sending final report");
        self.up.send(Envelope::Finish {
            id: self.id.clone(),
            stat: run.stat,
            log: run.log,
            clock: run.clocks.into_map(),
        });

        self.phase = Phase::Idle;
    }

    fn report_metrics(&mut self) {
        if self.run.is_none() {
            return;
        }

        let time = Utc::now() + chrono::Duration::milliseconds(self.clock_skew_ms);
        let metrics = self.sampler.sample(time);
        let id = self.id.clone();

        let Some(run) = self.run.as_mut() else { return };
        run.clocks
            .roll(run.started_at.elapsed().as_millis() as u64);

        self.up.send(Envelope::WorkerMetrics(Box::new(AgentMetrics {
            id,
            metrics,
            pop: run
                .pop
                .iter()
                .map(|(u, list)| (u.clone(), list.len() as u64))
                .collect(),
            stat: run
                .stat
                .iter()
                .map(|(u, s)| (u.clone(), s.tally()))
                .collect(),
            clock: run.clocks.to_map(),
        })));
    }
}

impl Actor for Agent {
    type Context = Context<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(id = %self.id, "agent started");
        if let Some(inbound) = self.inbound.take() {
            ctx.add_stream(UnboundedReceiverStream::new(inbound));
        }
    }
}
