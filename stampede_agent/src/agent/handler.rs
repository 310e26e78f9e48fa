use actix::{ActorContext, Context, Handler, MessageResult, StreamHandler};
use stampede_core::protocol::Envelope;
use std::collections::BTreeMap;
use tracing::{debug, info};

use super::message::{AgentStatus, GetStatus, SuiteDone};
use super::Agent;

impl StreamHandler<Envelope> for Agent {
    fn handle(&mut self, env: Envelope, ctx: &mut Context<Self>) {
        match env {
            Envelope::WorkerInit { host, time } => self.handle_worker_init(host, time),
            Envelope::Run(cmd) => self.handle_run(*cmd, ctx),
            other => debug!(cmd = other.name(), "no handler for command; ignoring"),
        }
    }

    fn finished(&mut self, ctx: &mut Context<Self>) {
        info!("down link closed");
        if let Some(tx) = self.on_disconnect.take() {
            let _ = tx.send(());
        }
        ctx.stop();
    }
}

impl Handler<SuiteDone> for Agent {
    type Result = ();

    fn handle(&mut self, msg: SuiteDone, ctx: &mut Context<Self>) -> Self::Result {
        self.handle_suite_done(msg, ctx);
    }
}

impl Handler<GetStatus> for Agent {
    type Result = MessageResult<GetStatus>;

    fn handle(&mut self, _msg: GetStatus, _ctx: &mut Context<Self>) -> Self::Result {
        let (population, in_flight, stat) = match self.run.as_ref() {
            Some(run) => (
                run.pop
                    .iter()
                    .map(|(u, list)| (u.clone(), list.iter().map(|v| v.index).collect()))
                    .collect(),
                run.in_flight,
                run.stat
                    .iter()
                    .map(|(u, s)| (u.clone(), s.tally()))
                    .collect(),
            ),
            None => (BTreeMap::new(), 0, BTreeMap::new()),
        };

        MessageResult(AgentStatus {
            phase: self.phase,
            population,
            in_flight,
            stat,
        })
    }
}
