//! Host functions: native callables living alongside compiled Lua code.
//!
//! A host function receives the execution context and its arguments and
//! answers with a [`HostFlow`]: plain results, a tail call, a protected
//! call, or one of the suspension signals the executor's visitor handles.
//! Host functions do not save frames, so they are non-suspendable: `resume`
//! targeting one is an error unless it opted in through the flow protocol.

use std::{borrow::Cow, fmt, rc::Rc};

use super::{coroutine::CoroutineRef, state::ExecContext};
use crate::{error::RunResult, value::LuaValue};

/// The function pointer type of simple host functions.
pub type HostFn = fn(&mut ExecContext<'_>, Vec<LuaValue>) -> RunResult<HostFlow>;

/// What a host function asks the executor to do next.
pub enum HostFlow {
    /// Return these values to the caller.
    Return(Vec<LuaValue>),
    /// Replace this invocation with a call to `target`.
    TailCall { target: LuaValue, args: Vec<LuaValue> },
    /// Call `target` under a protected frame (`pcall`/`xpcall`).
    Protect {
        target: LuaValue,
        args: Vec<LuaValue>,
        handler: Option<LuaValue>,
    },
    /// Yield the current coroutine with these values.
    Yield(Vec<LuaValue>),
    /// Resume `co` with these values. Protected resumes report failure as
    /// `(false, message)`; unprotected ones re-raise.
    Resume {
        co: CoroutineRef,
        args: Vec<LuaValue>,
        protected: bool,
    },
    /// Cooperative pause: the call reports a paused result to its host.
    Pause,
    /// Suspend until the host completes `task` and resumes the
    /// continuation.
    Async(Box<dyn AsyncTask>),
}

impl fmt::Debug for HostFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Return(_) => "Return",
            Self::TailCall { .. } => "TailCall",
            Self::Protect { .. } => "Protect",
            Self::Yield(_) => "Yield",
            Self::Resume { .. } => "Resume",
            Self::Pause => "Pause",
            Self::Async(_) => "Async",
        };
        f.write_str(name)
    }
}

/// An asynchronous task handed to the host with a paused continuation.
///
/// The host executes the task on whatever executor it owns and then resumes
/// the continuation; the handoff is the happens-before edge between the two
/// threads. Task results travel through captured state, not return values.
pub trait AsyncTask: fmt::Debug {
    fn execute(self: Box<Self>);
}

enum HostKind {
    Simple(HostFn),
    /// The callable `coroutine.wrap` returns: resumes its captured
    /// coroutine unprotected.
    WrapResume(CoroutineRef),
}

/// A named native function.
pub struct HostFunction {
    name: Cow<'static, str>,
    kind: HostKind,
}

impl HostFunction {
    /// Wraps a function pointer as a callable host function value.
    #[must_use]
    pub fn from_fn(name: impl Into<Cow<'static, str>>, f: HostFn) -> Rc<Self> {
        Rc::new(Self {
            name: name.into(),
            kind: HostKind::Simple(f),
        })
    }

    /// The resuming callable of `coroutine.wrap`.
    #[must_use]
    pub fn wrap_resume(co: CoroutineRef) -> Rc<Self> {
        Rc::new(Self {
            name: Cow::Borrowed("wrap"),
            kind: HostKind::WrapResume(co),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn call(&self, ctx: &mut ExecContext<'_>, args: Vec<LuaValue>) -> RunResult<HostFlow> {
        match &self.kind {
            HostKind::Simple(f) => f(ctx, args),
            HostKind::WrapResume(co) => Ok(HostFlow::Resume {
                co: co.clone(),
                args,
                protected: false,
            }),
        }
    }
}

impl fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostFunction({})", self.name)
    }
}
