//! Error types.

use core::{error, fmt};

/// A [`core::result::Result`] defaulting to this crate's [`Error`].
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// A generic error that can be produced.
#[derive(Debug)]
pub struct Error {
    /// The kind of the error.
    pub kind: ErrorKind,
}
impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self { kind }
    }
}
impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)
    }
}
impl error::Error for Error {}

/// Possible kinds of errors.
#[derive(Debug)]
pub enum ErrorKind {
    /// A block transfer failed.
    Io,
    /// The operation isn't supported by the collaborator.
    Unsupported,
}
impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Io => "I/O Error",
            Self::Unsupported => "Unsupported operation",
        })
    }
}

/// No page could be allocated.
///
/// Unlike [`Fatal`] conditions, running out of pages is recoverable: the
/// caller decides whether to shed load, wait, or fail its own request.
#[derive(Debug, PartialEq, Eq)]
pub struct OutOfMemory;
impl fmt::Display for OutOfMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("out of physical pages")
    }
}
impl error::Error for OutOfMemory {}

/// Invariant violations that cannot be recovered from.
///
/// Raising one of these through [`fatal`] terminates the whole kernel; the
/// panic is not meant to be caught. These are caller contract breaches or
/// unrecoverable exhaustion, not runtime conditions to handle.
#[derive(Debug, Clone, Copy)]
pub enum Fatal {
    /// A page handed to `free` was not page-aligned.
    FreePageMisaligned,
    /// A page handed to `free` lies outside the managed range.
    FreePageOutOfRange,
    /// Every buffer in the cache is currently held; nothing can be recycled.
    NoFreeBuffers,
    /// A buffer reference count was decremented below zero.
    RefcountUnderflow,
}
impl fmt::Display for Fatal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::FreePageMisaligned => "freeing a misaligned page",
            Self::FreePageOutOfRange => "freeing a page outside the managed range",
            Self::NoFreeBuffers => "no free buffer anywhere in the cache",
            Self::RefcountUnderflow => "buffer reference count underflow",
        })
    }
}

/// Report a [`Fatal`] condition and terminate.
pub(crate) fn fatal(fault: Fatal) -> ! {
    log::error!("fatal: {fault}");
    panic!("fatal: {fault}");
}
