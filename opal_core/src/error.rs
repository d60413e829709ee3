//! Error types and result definitions.
//!
//! Errors on the interpreter hot path are constructed through the
//! `#[inline]` helpers so the common dispatch arms stay branch-light.

use thiserror::Error;

/// The unified result type used throughout the VM.
pub type VmResult<T> = Result<T, VmError>;

/// Everything the dispatch loop can surface.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VmError {
    /// User-visible runtime error: type mismatch, missing method,
    /// bad coercion. Carries the panic message shown to the user.
    #[error("panic: {msg}")]
    Panic {
        /// Human-readable description.
        msg: String,
    },

    /// Index outside a sequence. Surfaced to users as a panic; kept
    /// distinct so tests can assert on the class.
    #[error("panic: index out of bounds")]
    OutOfBounds,

    /// The heap allocator could not grow.
    #[error("out of memory")]
    OutOfMemory,

    /// A call could not reserve its frame. Recovered transparently by
    /// the grow-stack driver; user code never observes it.
    #[error("stack overflow")]
    StackOverflow,

    /// The debug table had no entry for a pc encountered during
    /// unwinding. Fatal internal error.
    #[error("no debug symbol for pc {pc}")]
    NoDebugSym {
        /// The uncovered pc.
        pc: u32,
    },
}

impl VmError {
    /// A panic with the given message.
    #[inline]
    #[must_use]
    pub fn panic(msg: impl Into<String>) -> Self {
        VmError::Panic { msg: msg.into() }
    }

    /// The canonical missing-symbol panic used by call and field
    /// dispatch misses.
    #[inline]
    #[must_use]
    pub fn missing_symbol(what: &str, name: &str) -> Self {
        VmError::Panic {
            msg: format!("Missing function symbol: {what} `{name}`"),
        }
    }

    /// True for the error classes a user program can trigger.
    #[inline]
    #[must_use]
    pub fn is_panic(&self) -> bool {
        matches!(self, VmError::Panic { .. } | VmError::OutOfBounds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_display() {
        let err = VmError::panic("expected number");
        assert_eq!(err.to_string(), "panic: expected number");
        assert!(err.is_panic());
    }

    #[test]
    fn test_missing_symbol_message() {
        let err = VmError::missing_symbol("method", "foo");
        assert!(err.to_string().starts_with("panic: Missing function symbol"));
        assert!(err.to_string().contains("foo"));
    }

    #[test]
    fn test_out_of_bounds_is_panic_class() {
        assert!(VmError::OutOfBounds.is_panic());
        assert!(!VmError::StackOverflow.is_panic());
        assert!(!VmError::OutOfMemory.is_panic());
    }
}
