#![doc = include_str!("../../../README.md")]
#![expect(clippy::cast_possible_truncation, reason = "numeric narrowing is checked")]
#![expect(clippy::cast_sign_loss, reason = "sign-changing casts are intentional")]
#![expect(clippy::cast_possible_wrap, reason = "wrap behavior mirrors Lua integers")]
#![expect(clippy::must_use_candidate, reason = "query-style accessors are pervasive")]

pub mod analysis;
pub mod ast;
mod baselib;
pub mod emit;
pub mod error;
pub mod exec;
mod intern;
mod io;
pub mod ir;
mod number;
mod program;
mod table;
pub mod tracer;
pub mod transform;
mod value;

pub use crate::{
    baselib::pause_function,
    emit::{
        compiled::{ClassNameTranslator, CompiledClass, CompiledFunction, CompiledModule, DefaultNameTranslator},
        emitter::{CompilerSettings, TickMode},
    },
    error::{ErrorKind, LuaError, RunResult, TraceFrame},
    exec::{
        call::{Call, CallEventHandler, CallState, Continuation},
        coroutine::{CoStatus, CoroutineRef},
        host::{AsyncTask, HostFlow, HostFn, HostFunction},
        ret::ReturnBuffer,
        scheduler::{NoPauseScheduler, Scheduler, TickLimitScheduler},
        state::{ExecContext, MetatableRegistry, StateContext, TableFactory},
    },
    intern::{LuaStr, StrInterner},
    io::{CollectPrint, NoPrint, PrintWriter, StdPrint},
    ir::translate::CompileError,
    program::{run_to_completion, EventCollector, Program, RunEvent},
    table::TableRef,
    tracer::{ExecTracer, NoopTracer, RecordingTracer, StderrTracer, TraceEvent},
    value::{Callable, Cell, LuaValue, Userdata},
};
