//! Error types for boardio.
//!
//! Every failure in the core contract is a variant of [`Error`]. Device-level
//! bus failures reported by backends are described by [`BusError`] and wrapped
//! in [`Error::Bus`] together with the handle id and the attempted operation,
//! so callers can log or match on them without inspecting OS error codes.

use std::io;
use std::path::PathBuf;

use strum::Display;
use thiserror::Error;

use crate::io::{IoInstance, IoType};

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// The managed store an identity error was raised by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Collection {
    Registry,
    Providers,
    Platforms,
}

/// Device-level failures reported by a bus backend.
#[derive(Debug, Error)]
pub enum BusError {
    /// No acknowledgment from the addressed device
    #[error("no acknowledgment from device at address 0x{0:02x}")]
    NoAck(u16),

    /// Bus arbitration lost to another controller
    #[error("bus arbitration lost")]
    ArbitrationLost,

    /// The device (or adapter) rejected an SMBus command
    #[error("command 0x{0:02x} rejected")]
    CommandRejected(u8),

    /// Fewer bytes arrived than the transaction required
    #[error("short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },

    /// Fewer bytes were accepted than the transaction required
    #[error("short write: expected {expected} bytes, wrote {actual}")]
    ShortWrite { expected: usize, actual: usize },

    /// Device reported a block length above the SMBus maximum
    #[error("device reported block length {0}, maximum is 32")]
    BlockLength(usize),

    /// Device did not respond in time
    #[error("timeout")]
    Timeout,

    /// Operation the backend cannot perform
    #[error("operation not supported by adapter")]
    NotSupported,

    /// Raw OS failure
    #[error(transparent)]
    Os(#[from] io::Error),
}

impl BusError {
    /// Whether retrying the same transaction may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BusError::NoAck(_)
                | BusError::ArbitrationLost
                | BusError::ShortRead { .. }
                | BusError::ShortWrite { .. }
                | BusError::Timeout
        )
    }

    /// Classify an errno returned by a Linux bus ioctl.
    pub fn from_os(err: io::Error, address: u16) -> Self {
        match err.raw_os_error() {
            Some(libc::ENXIO) | Some(libc::EREMOTEIO) => BusError::NoAck(address),
            Some(libc::EAGAIN) => BusError::ArbitrationLost,
            Some(libc::ETIMEDOUT) => BusError::Timeout,
            Some(libc::EOPNOTSUPP) => BusError::NotSupported,
            _ => BusError::Os(err),
        }
    }
}

/// Crate-wide error type.
#[derive(Debug, Error)]
pub enum Error {
    // ------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------
    #[error("missing required configuration key '{0}'")]
    MissingKey(String),

    #[error("invalid value {value:?} for configuration key '{key}': {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("property set is empty")]
    EmptyProperties,

    #[error("no properties found with prefix '{0}'")]
    MissingPrefix(String),

    // ------------------------------------------------------------------
    // Identity
    // ------------------------------------------------------------------
    #[error("{kind}: invalid id {id:?}")]
    InvalidId { kind: Collection, id: String },

    #[error("{kind}: cannot {operation} '{id}', id already exists")]
    AlreadyExists {
        kind: Collection,
        operation: &'static str,
        id: String,
    },

    #[error("{kind}: cannot {operation} '{id}', id not found")]
    NotFound {
        kind: Collection,
        operation: &'static str,
        id: String,
    },

    #[error("{kind}: nothing registered for type {io_type}")]
    NotFoundForType { kind: Collection, io_type: IoType },

    #[error("{kind}: no default selected")]
    NoDefault { kind: Collection },

    #[error("{kind}: '{id}' is {actual}, expected {expected}")]
    TypeMismatch {
        kind: Collection,
        id: String,
        expected: IoType,
        actual: IoType,
    },

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------
    #[error("failed to initialize '{id}': {source}")]
    InitializeFailed {
        id: String,
        #[source]
        source: Box<Error>,
    },

    #[error("failed to shut down '{id}': {source}")]
    ShutdownFailed {
        id: String,
        instance: IoInstance,
        #[source]
        source: Box<Error>,
    },

    #[error("failed to terminate '{id}': {source}")]
    TerminateFailed {
        id: String,
        #[source]
        source: Box<Error>,
    },

    #[error("{operation} failed for {} member(s)", .failures.len())]
    Aggregate {
        operation: &'static str,
        failures: Vec<Error>,
    },

    #[error("context has been dropped")]
    ContextDropped,

    // ------------------------------------------------------------------
    // Transfer
    // ------------------------------------------------------------------
    #[error("offset {offset} + length {length} exceeds capacity {capacity}")]
    OutOfBounds {
        offset: usize,
        length: usize,
        capacity: usize,
    },

    #[error("'{id}': {operation} failed: {source}")]
    Bus {
        id: String,
        operation: &'static str,
        #[source]
        source: BusError,
    },

    #[error("'{id}' is not open")]
    NotOpen { id: String },

    #[error("'{id}' has been shut down")]
    Closed { id: String },

    #[error("'{id}': {} read back mismatched after {attempts} attempt(s)", register_label(.register))]
    DataMismatch {
        id: String,
        register: Option<u8>,
        attempts: usize,
    },

    #[error("'{id}': value {value} outside range {range}")]
    ValueOutOfRange {
        id: String,
        value: String,
        range: String,
    },

    #[error("string cannot be encoded as {charset}")]
    Encoding { charset: String },

    // ------------------------------------------------------------------
    // Operating system
    // ------------------------------------------------------------------
    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn register_label(register: &Option<u8>) -> String {
    match register {
        Some(reg) => format!("register 0x{:02x}", reg),
        None => "device".to_string(),
    }
}

impl Error {
    /// Whether the failure is a transient device-level condition worth
    /// retrying. Bounds, configuration and identity errors never are.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Bus { source, .. } => source.is_transient(),
            _ => false,
        }
    }

    /// Individual failures of a bulk operation, or this error alone.
    pub fn failures(&self) -> &[Error] {
        match self {
            Error::Aggregate { failures, .. } => failures,
            other => std::slice::from_ref(other),
        }
    }

    pub(crate) fn bus(id: &str, operation: &'static str, source: impl Into<BusError>) -> Self {
        Error::Bus {
            id: id.to_string(),
            operation,
            source: source.into(),
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}

/// Turn the failures collected by a best-effort sweep into a single result.
pub(crate) fn aggregate(operation: &'static str, mut failures: Vec<Error>) -> Result<()> {
    match failures.len() {
        0 => Ok(()),
        1 => Err(failures.remove(0)),
        _ => Err(Error::Aggregate {
            operation,
            failures,
        }),
    }
}
