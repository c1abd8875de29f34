use std::{error::Error, fmt};

/// The engine contract's result type.
pub type Result<T> = std::result::Result<T, EngineErr>;

/// Failures reported by an execution-engine implementation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineErr {
    /// A feed name not present in the loaded graph.
    UnknownInput(String),
    /// A fetch name not present in the loaded graph.
    UnknownOutput(String),
    /// The execution itself failed.
    Run(String),
}

impl fmt::Display for EngineErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineErr::UnknownInput(name) => write!(f, "unknown input: {name}"),
            EngineErr::UnknownOutput(name) => write!(f, "unknown output: {name}"),
            EngineErr::Run(msg) => write!(f, "execution failed: {msg}"),
        }
    }
}

impl Error for EngineErr {}
