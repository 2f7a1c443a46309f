//! The code emitter: IR to executable, resumable compiled functions.

pub mod compiled;
pub mod emitter;
pub mod insn;
pub mod loader;

pub use compiled::{ClassNameTranslator, CompiledClass, CompiledFunction, CompiledModule, DefaultNameTranslator};
pub use emitter::{CompilerSettings, TickMode};
pub use loader::{LinkedFunction, LuaClosure};
