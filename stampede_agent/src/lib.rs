pub mod agent;

pub use agent::message::{AgentStatus, GetStatus};
pub use agent::{Agent, Phase};
