use std::{error::Error, fmt, io};

use engine::EngineErr;

/// The runner crate's result type.
pub type Result<T> = std::result::Result<T, RunnerErr>;

/// Training-runner failures.
#[derive(Debug)]
pub enum RunnerErr {
    /// Invalid configuration — caught before any execution.
    InvalidConfig(String),
    /// A dispatch targeted a slot whose previous task was never joined.
    SlotBusy { slot: usize },
    /// A worker task died without producing a result.
    Task { slot: usize, msg: String },
    /// A dispatched execution reported failure; surfaced at join time.
    Engine(EngineErr),
    /// An underlying I/O error (checkpoint directories and files).
    Io(io::Error),
    /// Checkpoint payload could not be encoded or decoded.
    Checkpoint(String),
    /// A required checkpoint property is absent.
    MissingProperty { name: &'static str },
    /// A checkpoint property exists but does not parse.
    InvalidProperty { name: &'static str, value: String },
}

impl fmt::Display for RunnerErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConfig(msg) => write!(f, "invalid config: {msg}"),
            Self::SlotBusy { slot } => {
                write!(f, "slot {slot} already holds an unjoined task")
            }
            Self::Task { slot, msg } => write!(f, "worker task on slot {slot} died: {msg}"),
            Self::Engine(e) => write!(f, "execution failed: {e}"),
            Self::Io(e) => write!(f, "io error: {e}"),
            Self::Checkpoint(msg) => write!(f, "checkpoint error: {msg}"),
            Self::MissingProperty { name } => {
                write!(f, "checkpoint property `{name}` is missing")
            }
            Self::InvalidProperty { name, value } => {
                write!(f, "checkpoint property `{name}` has invalid value `{value}`")
            }
        }
    }
}

impl Error for RunnerErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Engine(e) => Some(e),
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for RunnerErr {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<EngineErr> for RunnerErr {
    fn from(e: EngineErr) -> Self {
        Self::Engine(e)
    }
}

impl From<serde_json::Error> for RunnerErr {
    fn from(e: serde_json::Error) -> Self {
        Self::Checkpoint(e.to_string())
    }
}
