//! Coroutines: suspended resumable stacks with a guarded status machine.
//!
//! A coroutine owns its pending frames while it is not running; during
//! execution the executor holds them. Status transitions are checked — an
//! illegal transition is a coroutine-state error, never silent.

use std::{cell::{Cell, RefCell}, fmt, rc::Rc};

use strum::Display;

use super::call::Resumable;
use crate::error::{LuaError, RunResult};

/// The four coroutine statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum CoStatus {
    Suspended,
    Running,
    /// Resuming another coroutine.
    Normal,
    Dead,
}

/// A coroutine: a pending resumable stack plus a status.
pub struct Coroutine {
    status: Cell<CoStatus>,
    stack: RefCell<Vec<Resumable>>,
}

/// Shared handle to a coroutine; identity is handle identity.
#[derive(Clone)]
pub struct CoroutineRef(Rc<Coroutine>);

impl CoroutineRef {
    /// Creates a suspended coroutine whose first resume invokes `bootstrap`.
    #[must_use]
    pub fn new(bootstrap: Resumable) -> Self {
        Self(Rc::new(Coroutine {
            status: Cell::new(CoStatus::Suspended),
            stack: RefCell::new(vec![bootstrap]),
        }))
    }

    /// Creates the main coroutine of a call: running from birth.
    #[must_use]
    pub fn main(bootstrap: Resumable) -> Self {
        Self(Rc::new(Coroutine {
            status: Cell::new(CoStatus::Running),
            stack: RefCell::new(vec![bootstrap]),
        }))
    }

    #[must_use]
    pub fn status(&self) -> CoStatus {
        self.0.status.get()
    }

    /// Performs a checked status transition.
    ///
    /// # Errors
    /// Fails with an `IllegalCoroutineState` error when the current status
    /// is not `from`.
    pub fn transition(&self, from: CoStatus, to: CoStatus) -> RunResult<()> {
        if self.0.status.get() != from {
            return Err(LuaError::coroutine_state(format!(
                "illegal coroutine transition: expected {from}, found {}",
                self.0.status.get()
            )));
        }
        self.0.status.set(to);
        Ok(())
    }

    /// Forces a status; used for death, which is legal from any live state.
    pub fn set_status(&self, status: CoStatus) {
        self.0.status.set(status);
    }

    /// Pops the topmost pending resumable.
    #[must_use]
    pub fn pop(&self) -> Option<Resumable> {
        self.0.stack.borrow_mut().pop()
    }

    /// Pushes a pending resumable.
    pub fn push(&self, resumable: Resumable) {
        self.0.stack.borrow_mut().push(resumable);
    }

    /// Depth of the pending stack.
    #[must_use]
    pub fn stack_len(&self) -> usize {
        self.0.stack.borrow().len()
    }

    /// Source position of the `level`-th pending entry from the top
    /// (1 is the immediate caller of a running host function).
    ///
    /// `None` when the entry at that level is not a compiled frame — a
    /// protected barrier or coroutine marker sits there, meaning the caller
    /// at that level is native and has no source position — or when the
    /// frame carries no line annotation.
    #[must_use]
    pub fn frame_position(&self, level: usize) -> Option<(String, u32)> {
        if level == 0 {
            return None;
        }
        let stack = self.0.stack.borrow();
        match stack.iter().rev().nth(level - 1) {
            Some(Resumable::Frame(frame)) if frame.line > 0 => {
                Some((frame.closure.name().to_owned(), frame.line))
            }
            _ => None,
        }
    }

    /// Identity comparison.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// Stable address for display purposes.
    #[must_use]
    pub fn address(&self) -> *const () {
        Rc::as_ptr(&self.0).cast()
    }
}

impl fmt::Debug for CoroutineRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoroutineRef")
            .field("status", &self.status())
            .field("stack_len", &self.stack_len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::LuaValue;

    fn dummy() -> Resumable {
        Resumable::Bootstrap {
            target: LuaValue::Nil,
        }
    }

    #[test]
    fn new_coroutines_start_suspended() {
        let co = CoroutineRef::new(dummy());
        assert_eq!(co.status(), CoStatus::Suspended);
        assert_eq!(co.stack_len(), 1);
    }

    #[test]
    fn legal_resume_yield_cycle_restores_statuses() {
        // resume(a, b): a RUNNING→NORMAL, b SUSPENDED→RUNNING.
        let a = CoroutineRef::main(dummy());
        let b = CoroutineRef::new(dummy());
        a.transition(CoStatus::Running, CoStatus::Normal).unwrap();
        b.transition(CoStatus::Suspended, CoStatus::Running).unwrap();
        // yield(a, b): a NORMAL→RUNNING, b RUNNING→SUSPENDED.
        a.transition(CoStatus::Normal, CoStatus::Running).unwrap();
        b.transition(CoStatus::Running, CoStatus::Suspended).unwrap();
        assert_eq!(a.status(), CoStatus::Running);
        assert_eq!(b.status(), CoStatus::Suspended);
    }

    #[test]
    fn illegal_transition_is_an_error() {
        let co = CoroutineRef::new(dummy());
        let err = co.transition(CoStatus::Running, CoStatus::Suspended).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::IllegalCoroutineState);
        // Status is untouched by a failed transition.
        assert_eq!(co.status(), CoStatus::Suspended);
    }
}
