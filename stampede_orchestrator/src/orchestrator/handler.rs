use actix::{Context, Handler, StreamHandler};
use stampede_core::protocol::Envelope;
use tracing::debug;

use super::message::SuiteDone;
use super::{Mode, Orchestrator};

impl StreamHandler<Envelope> for Orchestrator {
    /// Two-level routing: the top of the mode stack is consulted first,
    /// then the mode-independent handlers. Anything unmatched is logged
    /// and dropped, never fatal.
    fn handle(&mut self, env: Envelope, ctx: &mut Context<Self>) {
        match (self.modes.last(), env) {
            (Some(Mode::Discovery), Envelope::Setup { id }) => self.handle_setup(id),
            (_, Envelope::Finish {
                id,
                stat,
                log,
                clock,
            }) => self.handle_finish(id, stat, log, clock, ctx),
            (_, Envelope::WorkerMetrics(m)) => self.handle_metrics(*m),
            (mode, other) => debug!(
                cmd = other.name(),
                ?mode,
                "no handler for command; ignoring"
            ),
        }
    }

    fn finished(&mut self, _ctx: &mut Context<Self>) {
        // The up link drains after the hub closes; completion is driven by
        // the aggregation counter, not by stream end.
        debug!("agent report stream ended");
    }
}

impl Handler<SuiteDone> for Orchestrator {
    type Result = ();

    fn handle(&mut self, msg: SuiteDone, ctx: &mut Context<Self>) -> Self::Result {
        self.handle_suite_done(msg, ctx);
    }
}
