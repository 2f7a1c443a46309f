//! Execution tracing hooks.
//!
//! A tracer observes the executor without influencing it: instruction-level
//! stepping, suspension points, and coroutine transfers. The default
//! [`NoopTracer`] compiles to nothing on the hot path.

use std::fmt;

/// An execution event worth observing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEvent {
    /// A compiled function frame started running (fresh invoke).
    Invoke { function: String },
    /// A saved frame re-entered at a resumption point.
    Resume { function: String, point: u32 },
    /// A frame suspended, saving its registers.
    Suspend { function: String, point: u32 },
    /// Control transferred between coroutines.
    CoroutineSwitch,
    /// The scheduler requested a pause.
    Pause,
    /// A tail call replaced the current frame.
    TailCall,
}

/// Observer over executor events.
pub trait ExecTracer {
    fn trace(&mut self, event: TraceEvent);
}

/// The default tracer: observes nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTracer;

impl ExecTracer for NoopTracer {
    #[inline]
    fn trace(&mut self, _event: TraceEvent) {}
}

/// Writes each event to stderr; handy when debugging suspension bugs.
#[derive(Debug, Default)]
pub struct StderrTracer;

impl ExecTracer for StderrTracer {
    fn trace(&mut self, event: TraceEvent) {
        eprintln!("[lunara] {event:?}");
    }
}

/// Records all events in memory for assertions in tests.
#[derive(Debug, Default)]
pub struct RecordingTracer {
    events: Vec<TraceEvent>,
}

impl RecordingTracer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    /// Counts events matching a predicate.
    pub fn count(&self, mut pred: impl FnMut(&TraceEvent) -> bool) -> usize {
        self.events.iter().filter(|e| pred(e)).count()
    }
}

impl ExecTracer for RecordingTracer {
    fn trace(&mut self, event: TraceEvent) {
        self.events.push(event);
    }
}

impl fmt::Display for TraceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Invoke { function } => write!(f, "invoke {function}"),
            Self::Resume { function, point } => write!(f, "resume {function} at {point}"),
            Self::Suspend { function, point } => write!(f, "suspend {function} at {point}"),
            Self::CoroutineSwitch => write!(f, "coroutine switch"),
            Self::Pause => write!(f, "pause"),
            Self::TailCall => write!(f, "tail call"),
        }
    }
}
