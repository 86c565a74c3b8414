use crate::bridge::SchedulerKind;

/// Core error type for the bot.
///
/// Adapter crates map their specific errors into this type so the runtime can
/// decide between retrying (transport), degrading (programming errors) and
/// exiting (fatal configuration/credential errors).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("rate limited for {0:?}")]
    RateLimited(std::time::Duration),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("storage error: {0}")]
    Store(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("no scheduler is active on this call site")]
    NoScheduler,

    #[error("work was detached onto the supervisor and will not report back")]
    Detached,

    #[error("task supervisor is closed")]
    SupervisorClosed,

    #[error("{0:?} scheduler is unavailable")]
    SchedulerGone(SchedulerKind),

    #[error("worker runtime failed: {0}")]
    WorkerRuntime(String),

    #[error("background task {name} panicked")]
    TaskPanicked { name: String },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("external error: {0}")]
    External(String),
}

impl Error {
    /// Whether the outer retry loop should restart the runtime after this error.
    ///
    /// Connectivity problems are recoverable; credentials and configuration are not.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Transport(_)
                | Error::RateLimited(_)
                | Error::WorkerRuntime(_)
                | Error::SchedulerGone(_)
                | Error::TaskPanicked { .. }
        )
    }

    /// Fatal errors terminate the process without retrying.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Config(_) | Error::Auth(_))
    }

    /// Short stable label for logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            Error::Config(_) => "config",
            Error::Auth(_) => "auth",
            Error::Transport(_) => "transport",
            Error::RateLimited(_) => "rate_limited",
            Error::Permission(_) => "permission",
            Error::Store(_) => "store",
            Error::Cancelled => "cancelled",
            Error::NoScheduler => "no_scheduler",
            Error::Detached => "detached",
            Error::SupervisorClosed => "supervisor_closed",
            Error::SchedulerGone(_) => "scheduler_gone",
            Error::WorkerRuntime(_) => "worker_runtime",
            Error::TaskPanicked { .. } => "task_panicked",
            Error::Io(_) => "io",
            Error::Json(_) => "json",
            Error::External(_) => "external",
        }
    }

    /// Process exit code for errors that end the program.
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::Config(_) => 2,
            Error::Auth(_) => 3,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
