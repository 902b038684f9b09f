//! Error taxonomy for the command channel.
//!
//! Only [`DecodeError`] and [`DispatchError`] ever leave the dispatcher as
//! Rust errors; everything a handler reports becomes an `error` field in the
//! reply. Fragment overflow is not an error at all, see
//! [`crate::reassembly::Assembly::Overflow`].

use crate::storage::StorageError;

/// Errors from parsing a raw characteristic value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FragmentError {
    #[error("fragment is empty (missing control byte)")]
    Empty,
}

/// A logical buffer that could not be turned into an [`crate::RpcRequest`].
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("request too large: {size} bytes (maximum {max})")]
    TooLarge { size: usize, max: usize },

    #[error("request is empty")]
    Empty,

    #[error("msgpack decode error: {0}")]
    Msgpack(#[from] rmpv::decode::Error),

    #[error("{0} trailing bytes after request")]
    TrailingBytes(usize),

    #[error("request is not a map")]
    NotAMap,

    #[error("missing or invalid 'function_name'")]
    MissingFunctionName,
}

/// Failures raised by the dispatcher itself rather than by a handler.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("unknown function")]
    UnknownFunction(String),

    #[error("response too large")]
    ResponseTooLarge { size: usize, max: usize },

    #[error("msgpack encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
}

/// Domain failures reported by handlers.
///
/// `Display` output is the exact string placed in the reply's `error` field.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    #[error("Missing or invalid '{0}'")]
    InvalidField(String),

    #[error("OTA already active")]
    SessionActive,

    #[error("OTA not active")]
    SessionInactive,

    #[error("Base64 decode failed")]
    ChunkDecode,

    #[error("Chunk too large")]
    ChunkTooLarge { len: usize, max: usize },

    #[error("Chunk exceeds declared size")]
    ChunkOverrun { len: u64, remaining: u64 },

    #[error("CRC mismatch")]
    ChecksumMismatch { expected: u64, calculated: u32 },

    #[error("Not enough data written")]
    Incomplete { written: u64, expected: u64 },

    #[error("no partition")]
    NoPartition,

    #[error("{step} failed")]
    Storage { step: StorageStep, source: StorageError },

    #[error("display buffer size mismatch")]
    DisplayGeometry { expected: usize, actual: usize },
}

impl HandlerError {
    pub fn invalid_field(field: impl Into<String>) -> Self {
        Self::InvalidField(field.into())
    }

    pub fn storage(step: StorageStep, source: StorageError) -> Self {
        Self::Storage { step, source }
    }

    /// Platform error code to report alongside the message, if any.
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Storage { source, .. } => Some(source.code),
            _ => None,
        }
    }

    /// Returns `true` when the failure tore down the update session, so the
    /// caller must start again from `ota_begin`.
    pub fn aborts_session(&self) -> bool {
        matches!(self, Self::Storage { step, .. } if *step != StorageStep::Begin)
    }
}

/// Storage operation that produced a [`HandlerError::Storage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageStep {
    Begin,
    Write,
    End,
    SetBootPartition,
}

impl StorageStep {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Begin => "begin",
            Self::Write => "write",
            Self::End => "end",
            Self::SetBootPartition => "set boot partition",
        }
    }
}

impl std::fmt::Display for StorageStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Invalid [`crate::LinkConfig`] values.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("{field} must be between {min} and {max} (got {value})")]
    OutOfRange { field: &'static str, min: u64, max: u64, value: u64 },

    #[error("device_name is empty or contains control characters")]
    InvalidDeviceName,
}
