pub mod clock;
pub mod error;
pub mod hostinfo;
pub mod link;
pub mod logging;
pub mod protocol;
pub mod runlog;
pub mod schedule;
pub mod stats;
pub mod suite;

pub use error::LoadError;
pub use logging::LoggerManager;
