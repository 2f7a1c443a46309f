//! The compile pipeline and the embedder-facing entry points.
//!
//! [`Program::compile`] drives a resolved chunk through translation, the
//! analyses and transformations, and emission, producing a serializable
//! [`CompiledModule`]. A program then spawns [`Call`]s: suspendable
//! executions the host drives through continuations, or runs to completion
//! with [`Program::run`].

use crate::{
    analysis::{deps, liveness, slots, typing},
    ast::FunctionBody,
    baselib,
    emit::{
        compiled::{CompiledModule, DefaultNameTranslator},
        emitter::{self, CompilerSettings},
        loader,
    },
    error::{LuaError, RunResult},
    exec::{
        call::{Call, CallEventHandler, Continuation},
        host::AsyncTask,
        scheduler::NoPauseScheduler,
        state::StateContext,
    },
    io::PrintWriter,
    ir::{translate::translate_chunk, Code, IRFunc},
    transform::{dce, merge, segment},
    value::LuaValue,
};

/// A compiled chunk, ready to spawn calls.
#[derive(Debug)]
pub struct Program {
    module: CompiledModule,
}

impl Program {
    /// Compiles a resolved chunk with default settings.
    pub fn compile(chunk: &FunctionBody) -> Result<Self, crate::ir::translate::CompileError> {
        Self::compile_with(chunk, &CompilerSettings::default())
    }

    /// Compiles a resolved chunk.
    ///
    /// Pipeline, per function: type propagation; liveness-driven dead-code
    /// pruning to a fixed point; block merging; unreachable pruning;
    /// segmentation; then liveness, slot allocation and dependency analysis
    /// over the segmented code; emission.
    pub fn compile_with(
        chunk: &FunctionBody,
        settings: &CompilerSettings,
    ) -> Result<Self, crate::ir::translate::CompileError> {
        let module = translate_chunk(chunk)?;
        let translator = DefaultNameTranslator {
            prefix: settings.class_prefix.clone(),
        };
        let mut compiled = Vec::with_capacity(module.funcs().len());
        for func in module.funcs() {
            let types = typing::infer(func);

            let mut code = func.code.clone();
            loop {
                let live = liveness::analyze(&code);
                let (next, changed) = dce::prune(&code, &live, &types);
                code = next;
                if !changed {
                    break;
                }
            }
            code = merge::merge_blocks(&merge::prune_unreachable(&code));
            debug_assert_eq!(code.validate(), Ok(()));

            let segmented = segment::segment(&code, settings.segment_limit);
            let flat = Code::new(segmented.iter_blocks().cloned().collect());
            let flat_func = IRFunc {
                id: func.id.clone(),
                params: func.params.clone(),
                upval_names: func.upval_names.clone(),
                vararg: func.vararg,
                code: flat,
            };
            let live = liveness::analyze(&flat_func.code);
            let slot_info = slots::allocate(&flat_func, &live);
            let dep_info = deps::analyze(&flat_func);

            compiled.push(emitter::emit(
                &flat_func,
                &segmented,
                &types,
                &live,
                &slot_info,
                &dep_info,
                settings,
                &translator,
            ));
        }
        Ok(Self {
            module: CompiledModule::new(compiled),
        })
    }

    /// The compiled module (for persisting or inspecting).
    #[must_use]
    pub fn module(&self) -> &CompiledModule {
        &self.module
    }

    /// Serializes the program.
    pub fn dump(&self) -> Result<Vec<u8>, postcard::Error> {
        self.module.dump()
    }

    /// Restores a program serialized with [`Self::dump`].
    pub fn load(bytes: &[u8]) -> Result<Self, postcard::Error> {
        Ok(Self {
            module: CompiledModule::load(bytes)?,
        })
    }

    /// Spawns a paused call of the chunk with a fresh state context and the
    /// base functions installed.
    pub fn call(&self, args: Vec<LuaValue>) -> RunResult<Call> {
        self.call_with_context(StateContext::new(), args)
    }

    /// Spawns a paused call printing through `print`.
    pub fn call_with_print(&self, print: Box<dyn PrintWriter>, args: Vec<LuaValue>) -> RunResult<Call> {
        self.call_with_context(StateContext::with_print(print), args)
    }

    /// Spawns a paused call inside an embedder-prepared context.
    ///
    /// The module is linked against the context's interning registry and
    /// the chunk's `_ENV` is bound to the context's globals table.
    pub fn call_with_context(&self, context: StateContext, args: Vec<LuaValue>) -> RunResult<Call> {
        baselib::install(&context);
        let linked = loader::link_module(&self.module, &context.interner)?;
        let main = loader::instantiate_main(&linked, LuaValue::Table(context.globals.clone()));
        Ok(Call::new(context, LuaValue::Function(main), args))
    }

    /// Runs the chunk to completion, executing async tasks inline and
    /// resuming through every pause.
    pub fn run(&self, args: Vec<LuaValue>) -> RunResult<Vec<LuaValue>> {
        let call = self.call(args)?;
        run_to_completion(&call)
    }

    /// Like [`Self::run`], collecting print output.
    pub fn run_with_print(&self, print: Box<dyn PrintWriter>, args: Vec<LuaValue>) -> RunResult<Vec<LuaValue>> {
        let call = self.call_with_print(print, args)?;
        run_to_completion(&call)
    }
}

/// One resume's reported event.
pub enum RunEvent {
    Returned(Vec<LuaValue>),
    Failed(LuaError),
    Paused(Continuation),
    Async(Continuation, Box<dyn AsyncTask>),
}

impl std::fmt::Debug for RunEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Returned(_) => "Returned",
            Self::Failed(_) => "Failed",
            Self::Paused(_) => "Paused",
            Self::Async(..) => "Async",
        };
        f.write_str(name)
    }
}

/// An event handler that stores the single event of a resume.
#[derive(Debug, Default)]
pub struct EventCollector {
    pub event: Option<RunEvent>,
}

impl EventCollector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the recorded event.
    ///
    /// # Panics
    /// Panics if no resume reported an event yet.
    #[must_use]
    pub fn take(&mut self) -> RunEvent {
        self.event.take().expect("resume reports exactly one event")
    }
}

impl CallEventHandler for EventCollector {
    fn returned(&mut self, values: Vec<LuaValue>) {
        self.event = Some(RunEvent::Returned(values));
    }

    fn failed(&mut self, error: LuaError) {
        self.event = Some(RunEvent::Failed(error));
    }

    fn paused(&mut self, continuation: Continuation) {
        self.event = Some(RunEvent::Paused(continuation));
    }

    fn async_task(&mut self, continuation: Continuation, task: Box<dyn AsyncTask>) {
        self.event = Some(RunEvent::Async(continuation, task));
    }
}

/// Drives a call until it returns or fails: pauses resume immediately,
/// async tasks execute inline.
pub fn run_to_completion(call: &Call) -> RunResult<Vec<LuaValue>> {
    let mut collector = EventCollector::new();
    let mut scheduler = NoPauseScheduler;
    call.resume(&mut collector, &mut scheduler)?;
    loop {
        match collector.take() {
            RunEvent::Returned(values) => return Ok(values),
            RunEvent::Failed(error) => return Err(error),
            RunEvent::Paused(continuation) => {
                continuation.resume(&mut collector, &mut scheduler)?;
            }
            RunEvent::Async(continuation, task) => {
                task.execute();
                continuation.resume(&mut collector, &mut scheduler)?;
            }
        }
    }
}
