use thiserror::Error;

/// Run-fatal errors. Everything else (suite failures, dropped sends,
/// unroutable commands) degrades into counters or log lines.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("unable to locate any agents within {0}ms")]
    Discovery(u64),

    #[error("failed to bind hub port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },
}
