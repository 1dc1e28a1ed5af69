//! Error classification shared by all Meridian error types.
//!
//! Every crate defines its own error enum; each of them maps its variants
//! onto an [`ErrorClass`] so callers can decide between retrying,
//! resynchronizing, reporting, or suspending a table without matching on
//! crate-specific variants.

use std::fmt;
use std::io;

/// How a failure must be handled by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Contention or a briefly unavailable resource. Retry with backoff.
    Retryable,
    /// The caller works against an outdated structure version and must
    /// resynchronize before trying again.
    StaleStructure,
    /// The request itself is invalid (unknown column, bad value, unknown
    /// table). Local to the caller.
    Rejected,
    /// Corruption, resource exhaustion or critical I/O failure. Durable
    /// state is affected; the table gets suspended.
    Fatal,
}

impl ErrorClass {
    /// Classifies an I/O error.
    ///
    /// Interruptions and timeouts are retryable, everything else is fatal.
    #[must_use]
    pub fn of_io(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
                Self::Retryable
            }
            _ => Self::Fatal,
        }
    }

    /// Returns true for [`ErrorClass::Retryable`].
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Retryable)
    }

    /// Returns true for [`ErrorClass::Fatal`].
    #[must_use]
    pub const fn is_fatal(self) -> bool {
        matches!(self, Self::Fatal)
    }

    /// Stable lowercase name, used in suspension reasons.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Retryable => "retryable",
            Self::StaleStructure => "stale_structure",
            Self::Rejected => "rejected",
            Self::Fatal => "fatal",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
