//! Closed error-kind set shared by every subsystem in the core.
//!
//! The set is deliberately small and closed: callers match on it
//! exhaustively, and no subsystem invents its own error enum that has to be
//! wrapped. Invariant violations (double unlock, freeing unallocated
//! memory, mutex unlock by a non-owner) are not represented here at all --
//! they go through [`panic_fatal`] instead, per the propagation policy.

use core::fmt;

/// Every expected failure mode the core can return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum ErrorKind {
    /// Operation completed normally. Rarely constructed directly; present
    /// so callers that thread an `ErrorKind` through logging/telemetry have
    /// a value for the success case without reaching for `Option`.
    Ok,
    /// Catch-all for conditions that do not fit another variant.
    Unknown,
    /// A caller-supplied argument was malformed, out of range, or
    /// unaligned.
    InvalidArgument,
    /// A resource is exhausted right now but may become available later
    /// (frame pool empty, virtual address range exhausted).
    TemporaryOutage,
    /// A resource is gone for good (peer channel closed, process dead).
    PermanentOutage,
    /// The referenced object does not exist (unknown DID, unknown PID).
    NoSuchResource,
    /// The resource exists but cannot be used right now.
    ResourceUnavailable,
    /// The operation is not permitted for the caller.
    Forbidden,
    /// The operation is recognized but not implemented for this
    /// configuration.
    Unsupported,
    /// A size exceeded a hard limit.
    TooBig,
    /// A size fell below a hard minimum.
    TooSmall,
    /// Another instance of this operation is already in flight
    /// (double `close`, overlapping mapping insert).
    AlreadyInProgress,
    /// The operation was cancelled before completing.
    Cancelled,
    /// The calling thread was marked for interruption before it would have
    /// slept.
    Signaled,
    /// A non-blocking call would have had to block.
    NoWait,
    /// The caller should retry the operation (spurious wake, id wraparound
    /// past the reserved sentinel).
    ShouldRestart,
    /// The operation was aborted by its caller.
    Aborted,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Ok => "ok",
            Self::Unknown => "unknown",
            Self::InvalidArgument => "invalid_argument",
            Self::TemporaryOutage => "temporary_outage",
            Self::PermanentOutage => "permanent_outage",
            Self::NoSuchResource => "no_such_resource",
            Self::ResourceUnavailable => "resource_unavailable",
            Self::Forbidden => "forbidden",
            Self::Unsupported => "unsupported",
            Self::TooBig => "too_big",
            Self::TooSmall => "too_small",
            Self::AlreadyInProgress => "already_in_progress",
            Self::Cancelled => "cancelled",
            Self::Signaled => "signaled",
            Self::NoWait => "no_wait",
            Self::ShouldRestart => "should_restart",
            Self::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// Result alias used throughout the core.
pub type KernelResult<T> = Result<T, ErrorKind>;

/// The single panic entry point for invariant violations (§7).
///
/// Disables interrupts and halts after emitting `reason` on the serial
/// backend. Never returns.
#[cold]
pub fn panic_fatal(reason: &str) -> ! {
    crate::arch::disable_interrupts();
    log::error!("fatal invariant violation: {reason}");
    loop {
        crate::arch::halt();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_spec_wire_names() {
        assert_eq!(ErrorKind::TemporaryOutage.to_string(), "temporary_outage");
        assert_eq!(ErrorKind::NoWait.to_string(), "no_wait");
        assert_eq!(ErrorKind::AlreadyInProgress.to_string(), "already_in_progress");
    }
}
