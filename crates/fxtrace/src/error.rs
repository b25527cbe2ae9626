use thiserror::Error;

/// Result alias used throughout the tracer.
pub type TraceResult<T> = Result<T, TraceError>;

/// Failures surfaced while recording a program.
///
/// `Tracking` and `DataDependent` abort the whole session; `UnrecognizedInput` is only raised once
/// no dispatch layer claims a call, and `PathResolution` is normally downgraded to a warning by the
/// module-stack tracer.
#[derive(Debug, Error)]
pub enum TraceError {
    #[error("tracking error: {0}")]
    Tracking(String),
    #[error(
        "tried to extract a concrete value from a tracing tensor with {op}; this is usually caused \
         by data-dependent control flow, try tracing with the symbolic discipline"
    )]
    DataDependent { op: String },
    #[error("no dispatch layer handled {op} for tensor types {types:?}")]
    UnrecognizedInput { op: String, types: Vec<String> },
    #[error("unable to find the path of module `{type_name}` under the traced root")]
    PathResolution { type_name: String },
    #[error("kernel executor `{executor}` failed on {op}: {message}")]
    Kernel {
        executor: String,
        op: String,
        message: String,
    },
    #[error(
        "real tensor reached simulated execution of {op}; enable allow_non_simulated_inputs"
    )]
    NonSimulatedInput { op: String },
    #[error("expected {expected}, found {found}")]
    UnexpectedValue {
        expected: &'static str,
        found: String,
    },
    #[error("invalid trace configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl TraceError {
    pub fn tracking(message: impl Into<String>) -> Self {
        TraceError::Tracking(message.into())
    }

    pub fn kernel(executor: &str, op: impl ToString, message: impl Into<String>) -> Self {
        TraceError::Kernel {
            executor: executor.to_string(),
            op: op.to_string(),
            message: message.into(),
        }
    }

    pub fn unexpected(expected: &'static str, found: impl Into<String>) -> Self {
        TraceError::UnexpectedValue {
            expected,
            found: found.into(),
        }
    }
}
