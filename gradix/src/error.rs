//! Runtime error taxonomy.
//!
//! Errors are synchronous at the API call that caused them; deferred work
//! never fails a later unrelated call, though `read`/`to_vec` may surface a
//! prior dispatch's capability or compile error at the first synchronisation
//! point. NaN-producing math is not an error.

use gradix_ir::{DType, IrError};

use crate::backend::{BufferId, Device};

pub type Result<T> = std::result::Result<T, Error>;

/// Runtime errors across the frontend, scheduler and backends.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    // Usage errors (before any dispatch)
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    DTypeMismatch {
        expected: DType,
        got: DType,
    },
    AxisOutOfBounds {
        axis: i64,
        rank: usize,
    },
    DuplicateAxis {
        axis: usize,
    },
    NotBroadcastable {
        from: Vec<usize>,
        to: Vec<usize>,
    },
    EmptyOperandList,
    ScalarRank {
        op: &'static str,
    },
    InvalidOperand {
        op: &'static str,
        message: String,
    },
    Ir(IrError),
    // Handle errors
    InvalidHandle(BufferId),
    // Capability errors
    UninitializedBackend(Device),
    Unsupported {
        device: Device,
        what: String,
    },
    UnsupportedDType {
        device: Device,
        dtype: DType,
    },
    NoAdapter,
    // Resource errors
    Allocation {
        device: Device,
        bytes: usize,
    },
    WorkgroupLimit {
        requested: usize,
        limit: usize,
    },
    // Compilation errors: backend message plus offending source text
    Compile {
        device: Device,
        message: String,
        source: String,
    },
    // Loader errors
    Io(String),
    Header(String),
    /// Invariant violation inside the runtime itself.
    Internal(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ShapeMismatch { expected, got } => {
                write!(f, "shape mismatch: expected {:?}, got {:?}", expected, got)
            }
            Self::DTypeMismatch { expected, got } => {
                write!(f, "dtype mismatch: expected {}, got {}", expected, got)
            }
            Self::AxisOutOfBounds { axis, rank } => {
                write!(f, "axis {} out of bounds for rank {}", axis, rank)
            }
            Self::DuplicateAxis { axis } => write!(f, "duplicate axis {}", axis),
            Self::NotBroadcastable { from, to } => {
                write!(f, "cannot broadcast {:?} to {:?}", from, to)
            }
            Self::EmptyOperandList => write!(f, "expected at least one operand"),
            Self::ScalarRank { op } => write!(f, "{} requires at least one dimension", op),
            Self::InvalidOperand { op, message } => write!(f, "invalid operand to {}: {}", op, message),
            Self::Ir(e) => write!(f, "{}", e),
            Self::InvalidHandle(id) => write!(f, "use of freed or unknown buffer {}", id),
            Self::UninitializedBackend(d) => {
                write!(f, "backend `{}` is not initialised; call init() first", d.name())
            }
            Self::Unsupported { device, what } => {
                write!(f, "backend `{}` does not support {}", device.name(), what)
            }
            Self::UnsupportedDType { device, dtype } => {
                write!(f, "backend `{}` does not support dtype {}", device.name(), dtype)
            }
            Self::NoAdapter => write!(f, "no compatible GPU adapter available"),
            Self::Allocation { device, bytes } => {
                write!(f, "backend `{}` failed to allocate {} bytes", device.name(), bytes)
            }
            Self::WorkgroupLimit { requested, limit } => {
                write!(f, "dispatch of {} threads exceeds device limit {}", requested, limit)
            }
            Self::Compile {
                device,
                message,
                source,
            } => {
                write!(
                    f,
                    "compilation failed on `{}`: {}\n--- offending source ---\n{}",
                    device.name(),
                    message,
                    source
                )
            }
            Self::Io(msg) => write!(f, "io error: {}", msg),
            Self::Header(msg) => write!(f, "malformed safetensors header: {}", msg),
            Self::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<IrError> for Error {
    fn from(e: IrError) -> Self {
        Error::Ir(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Header(e.to_string())
    }
}
