use thiserror::Error;

/// Errors from volume and disk image operations.
///
/// Logical failures (`NotFound`, `NotAFile`, `AlreadyExists`,
/// `InsufficientSpace`) are recoverable and routinely probed for by callers;
/// everything else signals I/O failure or on-disk corruption and should abort
/// the surrounding operation.
#[derive(Error, Debug)]
pub enum DmgError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("short read: wanted {wanted} bytes, got {got}")]
    ShortRead { wanted: usize, got: usize },

    #[error("short write: wanted {wanted} bytes, got {got}")]
    ShortWrite { wanted: usize, got: usize },

    #[error("bad signature: expected {expected}, got {actual:#x}")]
    BadSignature { expected: &'static str, actual: u64 },

    #[error("corrupt structure: {0}")]
    Corrupt(String),

    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("not a file: {0}")]
    NotAFile(String),

    #[error("not a folder: {0}")]
    NotAFolder(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("folder not empty: {0}")]
    NotEmpty(String),

    #[error("insufficient space: need {needed} bytes, have {available} bytes")]
    InsufficientSpace { needed: u64, available: u64 },

    #[error("unsupported: {0}")]
    Unsupported(String),
}

pub type Result<T> = std::result::Result<T, DmgError>;

impl DmgError {
    /// True for failures a caller can sensibly handle and continue from.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            DmgError::NotFound(_)
                | DmgError::NotAFile(_)
                | DmgError::NotAFolder(_)
                | DmgError::AlreadyExists(_)
                | DmgError::NotEmpty(_)
                | DmgError::InsufficientSpace { .. }
        )
    }
}
