use std::time::Duration;

use thiserror::Error;

/// Terminal failures of one evaluation run.
///
/// Script mismatches and validation failures are not errors: they are
/// recorded as data and only decide the verdict at the end.
#[derive(Debug, Error)]
pub enum EvalError {
    #[error("Error loading test case: {0}")]
    Load(String),
    #[error("Compilation failed: {0}")]
    Compile(String),
    #[error("Could not find a free port after {attempts} attempts")]
    PortExhausted { attempts: u32 },
    #[error("Server failed to start: {0}")]
    ServerStartup(String),
    #[error("Server failed to start or bind to port {port} within {waited:?}")]
    ServerNotReady { port: u16, waited: Duration },
    #[error("Timeout during {0}")]
    Timeout(&'static str),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, EvalError>;
