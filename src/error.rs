use std::fmt;

#[derive(Debug)]
pub enum HeapError {
    NotFound(String),
    AlreadyExists(String),
    LockConflict(String),
    IoError(String),
    /// A write through a handle opened with `OpenMode::Read`.
    ReadOnly(String),
    WrongPassword(String),
    EncryptionRequired(String),
    OutOfRange(String),
    InvalidArgument(String),
    /// Cache parameters that survived clamping but still violate
    /// `0 <= concurrency_level <= cached_levels <= levels`.
    Configuration(String),
    /// A device clone failed while building a top-cached storage.
    /// Everything acquired before the failure has been closed.
    DeviceClone(String),
    /// A routed read or write returned a different number of buckets than
    /// were requested.
    IoConsistency(String),
    Unsupported(String),
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeapError::NotFound(msg) => write!(f, "not found: {}", msg),
            HeapError::AlreadyExists(msg) => write!(f, "already exists: {}", msg),
            HeapError::LockConflict(msg) => write!(f, "lock conflict: {}", msg),
            HeapError::IoError(msg) => write!(f, "I/O error: {}", msg),
            HeapError::ReadOnly(msg) => write!(f, "read-only: {}", msg),
            HeapError::WrongPassword(msg) => write!(f, "wrong password: {}", msg),
            HeapError::EncryptionRequired(msg) => write!(f, "encryption required: {}", msg),
            HeapError::OutOfRange(msg) => write!(f, "out of range: {}", msg),
            HeapError::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
            HeapError::Configuration(msg) => write!(f, "configuration error: {}", msg),
            HeapError::DeviceClone(msg) => write!(f, "device clone failed: {}", msg),
            HeapError::IoConsistency(msg) => write!(f, "I/O consistency error: {}", msg),
            HeapError::Unsupported(msg) => write!(f, "unsupported operation: {}", msg),
        }
    }
}

impl std::error::Error for HeapError {}
