//! pagebuf error types.
//!
//! I/O errors are carried as raw errno values, the same way the block
//! layer reports them. Busy conditions are not errors: try-paths return
//! `None` or hand the handle back instead.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PbError {
    /// A device read or write failed with the given errno.
    #[error("I/O error: errno {0}")]
    Io(i32),
    /// Page or descriptor allocation gave up.
    #[error("out of memory")]
    NoMemory,
    /// The cache is closing or closed.
    #[error("buffer cache shut down")]
    Shutdown,
    /// The collaborator cannot perform the request.
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
    /// OS error with errno.
    #[error("OS error: errno {0}")]
    Os(i32),
    /// Tunable out of range.
    #[error("invalid config: {0}")]
    Config(&'static str),
}

impl PbError {
    /// Errno equivalent, for storing in a buffer's error slot.
    pub fn errno(&self) -> i32 {
        match self {
            Self::Io(e) | Self::Os(e) => *e,
            Self::NoMemory => libc::ENOMEM,
            Self::Shutdown => libc::ESHUTDOWN,
            Self::Unsupported(_) => libc::EOPNOTSUPP,
            Self::Config(_) => libc::EINVAL,
        }
    }

    /// Map an errno back to an error. `ENOMEM` keeps its meaning.
    pub fn from_errno(errno: i32) -> Self {
        match errno {
            libc::ENOMEM => Self::NoMemory,
            libc::ESHUTDOWN => Self::Shutdown,
            e => Self::Io(e),
        }
    }

    /// Last OS error as a `PbError::Os`.
    pub fn last_os_error() -> Self {
        Self::Os(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO))
    }
}

pub type Result<T> = std::result::Result<T, PbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_roundtrip() {
        assert_eq!(PbError::from_errno(libc::EIO), PbError::Io(libc::EIO));
        assert_eq!(PbError::from_errno(libc::ENOMEM), PbError::NoMemory);
        assert_eq!(PbError::NoMemory.errno(), libc::ENOMEM);
        assert_eq!(PbError::Io(5).errno(), 5);
    }

    #[test]
    fn test_display() {
        assert_eq!(PbError::Io(5).to_string(), "I/O error: errno 5");
        assert_eq!(PbError::Config("hash_bits").to_string(), "invalid config: hash_bits");
    }
}
