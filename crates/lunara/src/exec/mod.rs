//! The runtime: call executor, frames, coroutines, scheduling, dispatch.

pub mod call;
pub mod coroutine;
pub mod dispatch;
pub mod frame;
pub mod host;
pub mod ret;
pub mod scheduler;
pub mod state;

pub use call::{Call, CallEventHandler, CallState, Continuation, Resumable};
pub use coroutine::{CoStatus, CoroutineRef};
pub use host::{AsyncTask, HostFlow, HostFunction};
pub use ret::ReturnBuffer;
pub use scheduler::{NoPauseScheduler, Scheduler, TickLimitScheduler};
pub use state::{ExecContext, MetatableRegistry, StateContext, TableFactory};
