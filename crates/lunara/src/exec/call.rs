//! The call executor: the invoke/resume state machine driving compiled
//! code, coroutines, tail calls, protected frames and suspensions.
//!
//! A [`Call`] owns the state context, the return buffer, and a stack of
//! coroutines (bottom is the main one). Each coroutine is a stack of
//! [`Resumable`]s. The executor pops the topmost resumable of the current
//! coroutine and runs it; control signals (yield, resume, pause, async) are
//! dispatched to the visitor, errors unwind through resumables until a
//! protected frame catches them.
//!
//! Resuming a paused call is gated by an atomic version: `0` is running,
//! `1` terminated, anything else a distinct paused version. A continuation
//! is one-shot — its compare-and-swap from the paused version to running
//! fails for stale continuations.

use std::{
    cell::{Cell as StdCell, RefCell},
    rc::Rc,
    sync::atomic::{AtomicU32, Ordering},
};

use super::{
    coroutine::{CoStatus, CoroutineRef},
    dispatch,
    frame::{FrameOut, LuaFrame, SavedFrame},
    host::{AsyncTask, HostFlow},
    ret::ReturnBuffer,
    scheduler::Scheduler,
    state::{ExecContext, StateContext},
};
use crate::{
    error::{ErrorKind, LuaError, RunResult},
    tracer::{ExecTracer, NoopTracer, TraceEvent},
    value::{Callable, LuaValue},
};

/// Bound on nested `xpcall` message-handler invocations.
const MAX_HANDLER_DEPTH: usize = 220;

const VERSION_RUNNING: u32 = 0;
const VERSION_TERMINATED: u32 = 1;
const FIRST_PAUSED_VERSION: u32 = 2;

/// One entry of a coroutine's pending stack.
pub enum Resumable {
    /// A fresh coroutine entry: calls its target with the buffer contents.
    Bootstrap { target: LuaValue },
    /// A suspended compiled frame.
    Frame(SavedFrame),
    /// A `pcall`/`xpcall` barrier. Catches errors below it; prefixes `true`
    /// on success.
    Protected { handler: Option<LuaValue> },
    /// Converts an `xpcall` message handler's results into `(false, ...)`.
    HandlerResult,
    /// Awaits a resumed coroutine's yield or death, formatting the results
    /// (`coroutine.resume` is protected; `coroutine.wrap` is not).
    CoResume { protected: bool },
}

impl std::fmt::Debug for Resumable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Bootstrap { .. } => "Bootstrap",
            Self::Frame(_) => "Frame",
            Self::Protected { .. } => "Protected",
            Self::HandlerResult => "HandlerResult",
            Self::CoResume { .. } => "CoResume",
        };
        f.write_str(name)
    }
}

/// Lifecycle state of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Paused,
    Running,
    Terminated,
}

/// Receives the events of one resume.
pub trait CallEventHandler {
    /// The call completed with these values.
    fn returned(&mut self, values: Vec<LuaValue>);
    /// The call failed with an uncaught error.
    fn failed(&mut self, error: LuaError);
    /// The call paused; resume it through the continuation.
    fn paused(&mut self, continuation: Continuation);
    /// The call paused on an asynchronous task; complete the task, then
    /// resume the continuation.
    fn async_task(&mut self, continuation: Continuation, task: Box<dyn AsyncTask>);
}

struct CallInner {
    context: StateContext,
    buffer: ReturnBuffer,
    /// Coroutine stack; index 0 is the main coroutine.
    coroutines: Vec<CoroutineRef>,
    handler_depth: usize,
}

struct CallShared {
    version: AtomicU32,
    next_paused: StdCell<u32>,
    inner: RefCell<CallInner>,
}

/// An execution in progress or paused.
pub struct Call {
    shared: Rc<CallShared>,
}

impl Call {
    /// Builds a paused call: the arguments go into a fresh return buffer
    /// and a new main coroutine is pushed onto an otherwise empty stack.
    #[must_use]
    pub fn new(context: StateContext, target: LuaValue, args: Vec<LuaValue>) -> Self {
        let mut buffer = ReturnBuffer::new();
        buffer.set_to(args);
        let main = CoroutineRef::main(Resumable::Bootstrap { target });
        Self {
            shared: Rc::new(CallShared {
                version: AtomicU32::new(FIRST_PAUSED_VERSION),
                next_paused: StdCell::new(FIRST_PAUSED_VERSION + 1),
                inner: RefCell::new(CallInner {
                    context,
                    buffer,
                    coroutines: vec![main],
                    handler_depth: 0,
                }),
            }),
        }
    }

    #[must_use]
    pub fn state(&self) -> CallState {
        match self.shared.version.load(Ordering::SeqCst) {
            VERSION_RUNNING => CallState::Running,
            VERSION_TERMINATED => CallState::Terminated,
            _ => CallState::Paused,
        }
    }

    /// The continuation of a paused call.
    ///
    /// # Errors
    /// Fails when the call is running or terminated; continuations only
    /// exist while paused.
    pub fn current_continuation(&self) -> RunResult<Continuation> {
        let version = self.shared.version.load(Ordering::SeqCst);
        if version == VERSION_RUNNING || version == VERSION_TERMINATED {
            return Err(LuaError::invalid_continuation());
        }
        Ok(Continuation {
            shared: self.shared.clone(),
            version,
        })
    }

    /// Convenience: fetches the current continuation and resumes it.
    pub fn resume(&self, handler: &mut dyn CallEventHandler, scheduler: &mut dyn Scheduler) -> RunResult<()> {
        self.current_continuation()?.resume(handler, scheduler)
    }
}

impl std::fmt::Debug for Call {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Call").field("state", &self.state()).finish()
    }
}

/// A one-shot resume handle for a paused call.
pub struct Continuation {
    shared: Rc<CallShared>,
    version: u32,
}

impl Continuation {
    /// Resumes the call, reporting the outcome to `handler`.
    ///
    /// # Errors
    /// Fails with `InvalidContinuation` when the continuation is stale:
    /// already used, superseded by a newer pause, or the call terminated.
    pub fn resume(self, handler: &mut dyn CallEventHandler, scheduler: &mut dyn Scheduler) -> RunResult<()> {
        self.resume_traced(handler, scheduler, &mut NoopTracer)
    }

    /// Like [`Self::resume`] with an explicit tracer.
    pub fn resume_traced(
        self,
        handler: &mut dyn CallEventHandler,
        scheduler: &mut dyn Scheduler,
        tracer: &mut dyn ExecTracer,
    ) -> RunResult<()> {
        self.shared
            .version
            .compare_exchange(self.version, VERSION_RUNNING, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| LuaError::invalid_continuation())?;

        let outcome = {
            let mut inner = self.shared.inner.borrow_mut();
            run_executor(&mut inner, scheduler, tracer)
        };

        match outcome {
            ExecOutcome::Returned(values) => {
                self.shared.version.store(VERSION_TERMINATED, Ordering::SeqCst);
                handler.returned(values);
            }
            ExecOutcome::Failed(error) => {
                self.shared.version.store(VERSION_TERMINATED, Ordering::SeqCst);
                handler.failed(error);
            }
            ExecOutcome::Paused => {
                let next = self.fresh_paused_version();
                handler.paused(Continuation {
                    shared: self.shared.clone(),
                    version: next,
                });
            }
            ExecOutcome::AsyncPaused(task) => {
                let next = self.fresh_paused_version();
                handler.async_task(
                    Continuation {
                        shared: self.shared.clone(),
                        version: next,
                    },
                    task,
                );
            }
        }
        Ok(())
    }

    fn fresh_paused_version(&self) -> u32 {
        let mut version = self.shared.next_paused.get();
        // Skip the reserved running/terminated values on wraparound.
        if version < FIRST_PAUSED_VERSION {
            version = FIRST_PAUSED_VERSION;
        }
        self.shared.next_paused.set(version.wrapping_add(1));
        self.shared.version.store(version, Ordering::SeqCst);
        version
    }
}

impl std::fmt::Debug for Continuation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Continuation").field("version", &self.version).finish()
    }
}

enum ExecOutcome {
    Returned(Vec<LuaValue>),
    Failed(LuaError),
    Paused,
    AsyncPaused(Box<dyn AsyncTask>),
}

/// A control signal raised by a frame or host function.
enum Flow {
    Yield(Vec<LuaValue>),
    Resume {
        co: CoroutineRef,
        args: Vec<LuaValue>,
        protected: bool,
    },
    Pause,
    Async(Box<dyn AsyncTask>),
}

enum StepOut {
    /// Keep popping; the buffer holds results or a pending call.
    Continue,
    /// A suspension signal for the visitor.
    Signal(Flow),
}

fn run_executor(inner: &mut CallInner, scheduler: &mut dyn Scheduler, tracer: &mut dyn ExecTracer) -> ExecOutcome {
    let mut pending_error: Option<LuaError> = None;
    loop {
        let current = inner
            .coroutines
            .last()
            .expect("the coroutine stack always holds the main coroutine")
            .clone();

        let Some(resumable) = current.pop() else {
            // The coroutine's stack drained: it dies. The main coroutine's
            // death ends the call; any other's is an implicit yield (or an
            // error transfer) to its resumer.
            current.set_status(CoStatus::Dead);
            if inner.coroutines.len() == 1 {
                return match pending_error.take() {
                    Some(error) => ExecOutcome::Failed(error),
                    None => ExecOutcome::Returned(inner.buffer.get_as_array()),
                };
            }
            inner.coroutines.pop();
            let resumer = inner
                .coroutines
                .last()
                .expect("a resumer exists below a non-main coroutine")
                .clone();
            if let Err(error) = resumer.transition(CoStatus::Normal, CoStatus::Running) {
                pending_error = Some(error);
            }
            tracer.trace(TraceEvent::CoroutineSwitch);
            continue;
        };

        let step = step_resumable(inner, resumable, pending_error.take(), scheduler, tracer, &current);
        let flow = match step {
            Err(error) => {
                pending_error = Some(error);
                continue;
            }
            Ok(StepOut::Signal(flow)) => Some(flow),
            Ok(StepOut::Continue) => match drive_calls(inner, scheduler, tracer) {
                Err(error) => {
                    pending_error = Some(error);
                    continue;
                }
                Ok(flow) => flow,
            },
        };

        if let Some(flow) = flow {
            match handle_flow(inner, flow, tracer) {
                FlowOutcome::Continue => {}
                FlowOutcome::Paused => return ExecOutcome::Paused,
                FlowOutcome::Async(task) => return ExecOutcome::AsyncPaused(task),
                FlowOutcome::Error(error) => pending_error = Some(error),
            }
        }
    }
}

fn step_resumable(
    inner: &mut CallInner,
    resumable: Resumable,
    pending_error: Option<LuaError>,
    scheduler: &mut dyn Scheduler,
    tracer: &mut dyn ExecTracer,
    current: &CoroutineRef,
) -> RunResult<StepOut> {
    match resumable {
        Resumable::Bootstrap { target } => {
            if let Some(error) = pending_error {
                return Err(error);
            }
            let args = inner.buffer.take_values();
            inner.buffer.set_to_call(target, args);
            Ok(StepOut::Continue)
        }
        Resumable::Frame(saved) => {
            match pending_error {
                // Compiled frames never catch; they annotate and re-raise.
                Some(mut error) => {
                    error.push_frame(saved.closure.name().to_owned(), (saved.line > 0).then_some(saved.line));
                    Err(error)
                }
                None => {
                    tracer.trace(TraceEvent::Resume {
                        function: saved.closure.name().to_owned(),
                        point: u32::from(saved.state.point),
                    });
                    let frame = saved.resume()?;
                    run_frame(inner, frame, scheduler, tracer, current)
                }
            }
        }
        Resumable::Protected { handler } => match pending_error {
            None => {
                inner.buffer.prepend(LuaValue::Boolean(true));
                Ok(StepOut::Continue)
            }
            Some(error) if error.is_catchable() => match handler {
                None => {
                    let payload = error.into_value();
                    inner.buffer.set_to([LuaValue::Boolean(false), payload]);
                    Ok(StepOut::Continue)
                }
                Some(handler) => {
                    if inner.handler_depth >= MAX_HANDLER_DEPTH {
                        return Err(LuaError::new(ErrorKind::LuaRuntimeError, "error in error handling"));
                    }
                    inner.handler_depth += 1;
                    current.push(Resumable::HandlerResult);
                    inner.buffer.set_to_call(handler, [error.into_value()]);
                    Ok(StepOut::Continue)
                }
            },
            Some(error) => Err(error),
        },
        Resumable::HandlerResult => {
            inner.handler_depth = inner.handler_depth.saturating_sub(1);
            match pending_error {
                None => {
                    inner.buffer.prepend(LuaValue::Boolean(false));
                    Ok(StepOut::Continue)
                }
                Some(error) => Err(error),
            }
        }
        Resumable::CoResume { protected } => match pending_error {
            None => {
                if protected {
                    inner.buffer.prepend(LuaValue::Boolean(true));
                }
                Ok(StepOut::Continue)
            }
            Some(error) if protected && error.is_catchable() => {
                let payload = error.into_value();
                inner.buffer.set_to([LuaValue::Boolean(false), payload]);
                Ok(StepOut::Continue)
            }
            Some(error) => Err(error),
        },
    }
}

/// Runs one live frame, pushing its saved form back when it suspends.
fn run_frame(
    inner: &mut CallInner,
    frame: LuaFrame,
    scheduler: &mut dyn Scheduler,
    tracer: &mut dyn ExecTracer,
    current: &CoroutineRef,
) -> RunResult<StepOut> {
    let CallInner {
        context,
        buffer,
        coroutines,
        ..
    } = inner;
    let mut ctx = ExecContext {
        state: context,
        buffer,
        scheduler,
        tracer,
        in_coroutine: coroutines.len() > 1,
        current: current.clone(),
    };
    match frame.run(&mut ctx)? {
        FrameOut::Return => Ok(StepOut::Continue),
        FrameOut::Call(saved) => {
            current.push(Resumable::Frame(saved));
            Ok(StepOut::Continue)
        }
        FrameOut::Pause(saved) => {
            current.push(Resumable::Frame(saved));
            Ok(StepOut::Signal(Flow::Pause))
        }
    }
}

/// Honours pending call requests (calls, tail calls, metamethod calls)
/// until the buffer holds plain results or a suspension signal arrives.
fn drive_calls(
    inner: &mut CallInner,
    scheduler: &mut dyn Scheduler,
    tracer: &mut dyn ExecTracer,
) -> RunResult<Option<Flow>> {
    loop {
        if !inner.buffer.is_call() {
            return Ok(None);
        }
        let current = inner
            .coroutines
            .last()
            .expect("the coroutine stack always holds the main coroutine")
            .clone();
        let (target, args) = inner.buffer.take_call();
        let mut args: Vec<LuaValue> = args.into_vec();
        let callable = dispatch::resolve_call(&inner.context, target, &mut args)?;
        match callable {
            Callable::Closure(closure) => {
                tracer.trace(TraceEvent::Invoke {
                    function: closure.name().to_owned(),
                });
                let frame = LuaFrame::invoke(closure, args);
                match run_frame(inner, frame, scheduler, tracer, &current)? {
                    StepOut::Continue => {}
                    StepOut::Signal(flow) => return Ok(Some(flow)),
                }
            }
            Callable::Host(host) => {
                let flow = {
                    let CallInner {
                        context,
                        buffer,
                        coroutines,
                        ..
                    } = &mut *inner;
                    let mut ctx = ExecContext {
                        state: context,
                        buffer,
                        scheduler,
                        tracer,
                        in_coroutine: coroutines.len() > 1,
                        current: current.clone(),
                    };
                    host.call(&mut ctx, args)?
                };
                match flow {
                    HostFlow::Return(values) => inner.buffer.set_to(values),
                    HostFlow::TailCall { target, args } => inner.buffer.set_to_call(target, args),
                    HostFlow::Protect { target, args, handler } => {
                        current.push(Resumable::Protected { handler });
                        inner.buffer.set_to_call(target, args);
                    }
                    HostFlow::Yield(values) => return Ok(Some(Flow::Yield(values))),
                    HostFlow::Resume { co, args, protected } => {
                        return Ok(Some(Flow::Resume { co, args, protected }));
                    }
                    HostFlow::Pause => return Ok(Some(Flow::Pause)),
                    HostFlow::Async(task) => return Ok(Some(Flow::Async(task))),
                }
            }
        }
    }
}

enum FlowOutcome {
    Continue,
    Paused,
    Async(Box<dyn AsyncTask>),
    Error(LuaError),
}

/// The visitor over suspension signals.
fn handle_flow(inner: &mut CallInner, flow: Flow, tracer: &mut dyn ExecTracer) -> FlowOutcome {
    match flow {
        Flow::Pause => {
            inner.buffer.clear();
            FlowOutcome::Paused
        }
        Flow::Async(task) => {
            inner.buffer.clear();
            FlowOutcome::Async(task)
        }
        Flow::Yield(values) => {
            if inner.coroutines.len() == 1 {
                return FlowOutcome::Error(LuaError::coroutine_state(
                    "attempt to yield from outside a coroutine",
                ));
            }
            let yielder = inner.coroutines.pop().expect("yielder is on the stack");
            let resumer = inner
                .coroutines
                .last()
                .expect("a resumer exists below the yielder")
                .clone();
            if let Err(error) = yielder.transition(CoStatus::Running, CoStatus::Suspended) {
                return FlowOutcome::Error(error);
            }
            if let Err(error) = resumer.transition(CoStatus::Normal, CoStatus::Running) {
                return FlowOutcome::Error(error);
            }
            inner.buffer.set_to(values);
            tracer.trace(TraceEvent::CoroutineSwitch);
            FlowOutcome::Continue
        }
        Flow::Resume { co, args, protected } => {
            match co.status() {
                CoStatus::Suspended => {}
                status => {
                    let message = if status == CoStatus::Dead {
                        "cannot resume dead coroutine"
                    } else {
                        "cannot resume non-suspended coroutine"
                    };
                    if protected {
                        let payload = LuaValue::Str(inner.context.interner.intern(message.as_bytes()));
                        inner.buffer.set_to([LuaValue::Boolean(false), payload]);
                        return FlowOutcome::Continue;
                    }
                    return FlowOutcome::Error(LuaError::coroutine_state(message));
                }
            }
            let current = inner
                .coroutines
                .last()
                .expect("the coroutine stack always holds the main coroutine")
                .clone();
            if let Err(error) = current.transition(CoStatus::Running, CoStatus::Normal) {
                return FlowOutcome::Error(error);
            }
            if let Err(error) = co.transition(CoStatus::Suspended, CoStatus::Running) {
                return FlowOutcome::Error(error);
            }
            current.push(Resumable::CoResume { protected });
            inner.coroutines.push(co);
            inner.buffer.set_to(args);
            tracer.trace(TraceEvent::CoroutineSwitch);
            FlowOutcome::Continue
        }
    }
}
