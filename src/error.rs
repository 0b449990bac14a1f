use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VmError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Out of GPU virtual memory: {0}")]
    OutOfMemory(String),

    #[error("Unsupported configuration: {0}")]
    Unsupported(String),

    #[error("Sync-unmap timed out on 0x{addr:x} with {refs} reference(s) outstanding")]
    Timeout { addr: u64, refs: u32 },

    #[error("No mapping at 0x{0:x}")]
    NotFound(u64),

    #[error("GMMU backend error: {0}")]
    Backend(String),

    #[error("Page directory depth {depth} exceeds the {max} level hierarchy")]
    PageTableDepth { depth: usize, max: usize },
}

/// Coarse classification of a [`VmError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    OutOfMemory,
    Unsupported,
    Timeout,
    NotFound,
    Backend,
}

impl VmError {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::OutOfMemory(_) => ErrorKind::OutOfMemory,
            Self::Unsupported(_) => ErrorKind::Unsupported,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Backend(_) | Self::PageTableDepth { .. } => ErrorKind::Backend,
        }
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub(crate) fn oom(msg: impl Into<String>) -> Self {
        Self::OutOfMemory(msg.into())
    }

    pub(crate) fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }
}

/// Result of every fallible VM operation.
pub type VmResult<T> = Result<T, VmError>;
