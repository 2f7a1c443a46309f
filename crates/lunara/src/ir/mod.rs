//! The typed intermediate representation.
//!
//! A [`Module`] holds one [`IRFunc`] per function of the chunk, each an
//! ordered list of basic blocks over single-assignment values. The
//! translator produces it from a resolved AST; analyses and transformers
//! refine it; the emitter consumes it.

pub mod code;
pub mod entity;
pub mod node;
pub mod translate;

pub use code::{BasicBlock, Code, FunctionId, IRFunc, Label, Module};
pub use entity::{AnyVal, EntityAlloc, MultiVal, PhiVal, UpVar, Val, Var};
pub use node::{BinOpKind, BodyNode, CallArgs, ClosureUpval, NumberContext, Terminator, UnOpKind};
