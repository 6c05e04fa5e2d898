use core::fmt;

/// Failure modes surfaced by the pool's public API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XvError {
    /// The requested size is zero, or larger than `XV_MAX_ALLOC_SIZE`.
    InvalidSize,
    /// The page provider could not supply another backing page.
    OutOfMemory,
}

impl fmt::Display for XvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            XvError::InvalidSize => write!(f, "requested size is zero or exceeds the maximum block size"),
            XvError::OutOfMemory => write!(f, "page provider could not supply a new page"),
        }
    }
}

impl std::error::Error for XvError {}

pub type XvResult<T> = Result<T, XvError>;
