//! Error Types
//!
//! Every fallible operation in the framework reports one of a small closed
//! set of error codes. Success is the usual `Ok(())`; there is no "none"
//! variant. Callers are expected to treat [`Error::Unhandled`] as a normal,
//! non-fatal outcome of control dispatch.

use thiserror::Error;

/// Result type used across the framework
pub type Result<T> = std::result::Result<T, Error>;

/// Closed error set shared by every component
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The endpoint doesn't know this command or event; try elsewhere or
    /// ignore
    #[error("command or event not handled by this endpoint")]
    Unhandled,

    /// Caller contract violation (bad flow definition, wrong attribute type,
    /// range error)
    #[error("invalid argument or flow definition")]
    Invalid,

    /// Out of memory, or an object pool and its heap fallback both failed
    #[error("allocation failed")]
    Alloc,

    /// Writable access requested on a shared buffer; copy-on-write first
    #[error("buffer is shared, writable access refused")]
    Busy,

    /// Backing resource error: I/O, driver, cross-loop queue full
    #[error("external resource error")]
    External,

    /// Failed to install an activity on the event loop
    #[error("event loop refused the pump")]
    Upump,
}

impl Error {
    /// Whether this error is transient and worth retrying later
    ///
    /// Only [`Error::External`] qualifies: a full cross-loop queue drains on
    /// its own, and I/O backends come back.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::External)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(Error::External.is_transient());
        assert!(!Error::Invalid.is_transient());
        assert!(!Error::Busy.is_transient());
    }

    #[test]
    fn display_is_stable() {
        // Log lines embed these strings; keep them short and lowercase.
        assert_eq!(
            Error::Busy.to_string(),
            "buffer is shared, writable access refused"
        );
    }
}
