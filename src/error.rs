//! Error types for the update orchestrator.

/// Top-level error type for update orchestration.
#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    /// Configuration load, validation or persistence error.
    #[error("config error: {0}")]
    Config(String),

    /// Cron expression could not be turned into a schedule.
    #[error("schedule error: {0}")]
    Schedule(String),

    /// The remote update service rejected or failed a call.
    #[error("update service error: {0}")]
    Service(String),

    /// An update-state event could not be decoded.
    #[error("malformed update event: {0}")]
    Event(String),

    /// Battery, charging or session query failed.
    #[error("sensor error: {0}")]
    Sensor(String),

    /// A restart action could not be carried out.
    #[error("restart error: {0}")]
    Restart(String),

    /// Loader self-update error (release lookup, download, install).
    #[error("loader update error: {0}")]
    Loader(String),

    /// Host bridge channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, UpdateError>;
