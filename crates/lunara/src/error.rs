//! Runtime error model.
//!
//! Lua-visible failures carry an arbitrary Lua value (usually a string) and
//! unwind through the executor's resumable frames until a protected frame
//! catches them. Host-facing invariant violations (`InvalidContinuation`)
//! bypass Lua handlers entirely.

use std::fmt;

use strum::{Display, IntoStaticStr};

use crate::value::LuaValue;

/// Result alias for fallible runtime operations.
pub type RunResult<T> = Result<T, LuaError>;

/// Classification of a runtime failure.
///
/// The kind decides how a failure propagates: everything except
/// `InvalidContinuation` surfaces as a Lua error catchable by `pcall`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr)]
pub enum ErrorKind {
    /// Numeric coercion failed (string that is not a number, bad for-loop
    /// bounds, zero for-loop step, no integer representation).
    ConversionFailure,
    /// Arithmetic, indexing, length, comparison or call on a value of the
    /// wrong type with no metamethod to rescue it.
    IllegalOperationAttempt,
    /// An error raised from Lua itself: `error(...)`, failed `assert`.
    LuaRuntimeError,
    /// A coroutine resume or yield in an illegal status.
    IllegalCoroutineState,
    /// `resume` invoked on a function that never suspends.
    NonSuspendableFunction,
    /// A continuation was resumed after it went stale. Host-facing; never
    /// visible to Lua handlers.
    InvalidContinuation,
}

/// One frame of a traceback, recorded while an error unwinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceFrame {
    /// Function name as known to the compiler (class-name translated id).
    pub function: String,
    /// Most recent source line executed in the frame, when known.
    pub line: Option<u32>,
}

impl fmt::Display for TraceFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(line) => write!(f, "{}:{line}", self.function),
            None => write!(f, "{}", self.function),
        }
    }
}

/// A runtime error travelling up the resumable stack.
#[derive(Debug, Clone)]
pub struct LuaError {
    kind: ErrorKind,
    value: LuaValue,
    traceback: Vec<TraceFrame>,
}

impl LuaError {
    /// Creates an error of `kind` with a string payload.
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            value: LuaValue::from_error_message(message.into()),
            traceback: Vec::new(),
        }
    }

    /// Creates a `LuaRuntimeError` carrying an arbitrary error object.
    ///
    /// This is the `error(obj)` path: the payload is preserved untouched so
    /// `pcall` can hand it back.
    #[must_use]
    pub fn with_value(value: LuaValue) -> Self {
        Self {
            kind: ErrorKind::LuaRuntimeError,
            value,
            traceback: Vec::new(),
        }
    }

    /// Creates a conversion failure with the canonical message.
    #[must_use]
    pub fn conversion(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConversionFailure, message)
    }

    /// Creates an illegal-operation error ("attempt to X a Y value").
    #[must_use]
    pub fn illegal_op(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::IllegalOperationAttempt, message)
    }

    /// Creates an illegal-coroutine-state error.
    #[must_use]
    pub fn coroutine_state(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::IllegalCoroutineState, message)
    }

    /// Creates the error raised by resuming a non-suspendable function.
    #[must_use]
    pub fn non_suspendable() -> Self {
        Self::new(ErrorKind::NonSuspendableFunction, "non-suspendable function")
    }

    /// Creates the stale-continuation error thrown to the host.
    #[must_use]
    pub fn invalid_continuation() -> Self {
        Self::new(ErrorKind::InvalidContinuation, "invalid continuation")
    }

    /// The error classification.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The Lua error object (what `pcall` returns as its second result).
    #[must_use]
    pub fn value(&self) -> &LuaValue {
        &self.value
    }

    /// Consumes the error, yielding its payload value.
    #[must_use]
    pub fn into_value(self) -> LuaValue {
        self.value
    }

    /// Replaces the payload, keeping kind and traceback. Used by `xpcall`
    /// when the message handler rewrites the error object.
    #[must_use]
    pub fn map_value(mut self, value: LuaValue) -> Self {
        self.value = value;
        self
    }

    /// Whether this error can be caught by a Lua protected frame.
    #[must_use]
    pub fn is_catchable(&self) -> bool {
        self.kind != ErrorKind::InvalidContinuation
    }

    /// Appends one unwound frame to the traceback.
    pub fn push_frame(&mut self, function: impl Into<String>, line: Option<u32>) {
        self.traceback.push(TraceFrame {
            function: function.into(),
            line,
        });
    }

    /// The frames recorded while unwinding, innermost first.
    #[must_use]
    pub fn traceback(&self) -> &[TraceFrame] {
        &self.traceback
    }
}

impl fmt::Display for LuaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.value.display_brief())?;
        for frame in &self.traceback {
            write!(f, "\n\tin {frame}")?;
        }
        Ok(())
    }
}

impl std::error::Error for LuaError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_error_payload_round_trips() {
        let err = LuaError::illegal_op("attempt to call a nil value");
        assert_eq!(err.kind(), ErrorKind::IllegalOperationAttempt);
        assert!(err.is_catchable());
        assert_eq!(err.value().display_brief(), "attempt to call a nil value");
    }

    #[test]
    fn invalid_continuation_is_not_catchable() {
        assert!(!LuaError::invalid_continuation().is_catchable());
    }

    #[test]
    fn traceback_accumulates_in_unwind_order() {
        let mut err = LuaError::with_value(LuaValue::Integer(7));
        err.push_frame("inner", Some(3));
        err.push_frame("outer", None);
        assert_eq!(err.traceback().len(), 2);
        assert_eq!(err.traceback()[0].function, "inner");
    }
}
