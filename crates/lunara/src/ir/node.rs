//! IR node taxonomy: block body nodes and terminators.
//!
//! Nodes are tagged variants matched directly by analyses and transformers;
//! the `defs`/`uses` accessors below are the whole "visitor" surface.

use std::rc::Rc;

use strum::Display;

use super::{
    code::{FunctionId, Label},
    entity::{AnyVal, MultiVal, PhiVal, UpVar, Val, Var},
};

/// Binary operators of the Lua op set. `and`/`or` never appear here: the
/// translator lowers them to control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "UPPERCASE")]
pub enum BinOpKind {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    IDiv,
    Pow,
    Concat,
    BAnd,
    BOr,
    BXor,
    Shl,
    Shr,
    Eq,
    Neq,
    Lt,
    Le,
}

impl BinOpKind {
    /// Whether the operator is a comparison producing a boolean.
    #[must_use]
    pub fn is_comparison(self) -> bool {
        matches!(self, Self::Eq | Self::Neq | Self::Lt | Self::Le)
    }

    /// Whether the operator is an integer bitwise operator.
    #[must_use]
    pub fn is_bitwise(self) -> bool {
        matches!(self, Self::BAnd | Self::BOr | Self::BXor | Self::Shl | Self::Shr)
    }
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "UPPERCASE")]
pub enum UnOpKind {
    Unm,
    BNot,
    Len,
    Not,
}

/// The coercion context of a `ToNumber`, which decides its error message
/// and whether zero is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumberContext {
    ForInit,
    ForLimit,
    /// For-loop step: additionally rejects zero.
    ForStep,
}

impl NumberContext {
    #[must_use]
    pub fn describe(self) -> &'static str {
        match self {
            Self::ForInit => "'for' initial value",
            Self::ForLimit => "'for' limit",
            Self::ForStep => "'for' step",
        }
    }
}

/// Arguments of a call or return: fixed values plus an optional variadic
/// tail that expands in place.
#[derive(Debug, Clone, Default)]
pub struct CallArgs {
    pub fixed: Vec<Val>,
    pub tail: Option<MultiVal>,
}

impl CallArgs {
    #[must_use]
    pub fn fixed(fixed: Vec<Val>) -> Self {
        Self { fixed, tail: None }
    }

    #[must_use]
    pub fn with_tail(fixed: Vec<Val>, tail: MultiVal) -> Self {
        Self {
            fixed,
            tail: Some(tail),
        }
    }
}

/// Source of one captured upvalue at closure creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosureUpval {
    /// A reified local of the enclosing function (its cell is captured).
    FromVar(Var),
    /// An upvalue of the enclosing function, passed through.
    FromUpval(UpVar),
}

/// A straight-line IR instruction.
#[derive(Debug, Clone)]
pub enum BodyNode {
    LoadNil { dest: Val },
    LoadBool { dest: Val, value: bool },
    LoadInt { dest: Val, value: i64 },
    LoadFloat { dest: Val, value: f64 },
    LoadStr { dest: Val, value: Rc<[u8]> },
    BinOp { dest: Val, op: BinOpKind, lhs: Val, rhs: Val },
    UnOp { dest: Val, op: UnOpKind, arg: Val },
    /// Numeric coercion for for-loop bounds.
    ToNumber { dest: Val, src: Val, context: NumberContext },
    /// The numeric-for step: `dest = base + step` in loop-index arithmetic.
    ToNext { dest: Val, base: Val, step: Val },
    TabNew { dest: Val, array: u32, hash: u32 },
    TabGet { dest: Val, table: Val, key: Val },
    TabSet { table: Val, key: Val, value: Val },
    /// Raw integer-keyed store, the table-constructor fast path.
    TabRawSetInt { table: Val, index: i64, value: Val },
    /// Appends an expanded variadic result at `start`, for constructor tails.
    TabStackAppend { table: Val, source: MultiVal, start: i64 },
    VarInit { var: Var, value: Val },
    VarLoad { dest: Val, var: Var },
    VarStore { var: Var, value: Val },
    UpLoad { dest: Val, upvar: UpVar },
    UpStore { upvar: UpVar, value: Val },
    PhiStore { phi: PhiVal, value: Val },
    PhiLoad { dest: Val, phi: PhiVal },
    MultiGet { dest: Val, source: MultiVal, index: u32 },
    Call { dest: MultiVal, target: Val, args: CallArgs },
    Vararg { dest: MultiVal },
    Closure { dest: Val, func: FunctionId, upvals: Vec<ClosureUpval> },
    /// Source line annotation for tracebacks.
    Line { line: u32 },
    /// Tick-accounting hook consumed by the scheduler.
    CpuWithdraw { cost: u32 },
}

impl BodyNode {
    /// The value-like entity this node defines, if any.
    #[must_use]
    pub fn def_val(&self) -> Option<AnyVal> {
        match self {
            Self::LoadNil { dest }
            | Self::LoadBool { dest, .. }
            | Self::LoadInt { dest, .. }
            | Self::LoadFloat { dest, .. }
            | Self::LoadStr { dest, .. }
            | Self::BinOp { dest, .. }
            | Self::UnOp { dest, .. }
            | Self::ToNumber { dest, .. }
            | Self::ToNext { dest, .. }
            | Self::TabNew { dest, .. }
            | Self::TabGet { dest, .. }
            | Self::VarLoad { dest, .. }
            | Self::UpLoad { dest, .. }
            | Self::PhiLoad { dest, .. }
            | Self::MultiGet { dest, .. }
            | Self::Closure { dest, .. } => Some(AnyVal::Val(*dest)),
            Self::PhiStore { phi, .. } => Some(AnyVal::Phi(*phi)),
            Self::Call { dest, .. } | Self::Vararg { dest } => Some(AnyVal::Multi(*dest)),
            Self::TabSet { .. }
            | Self::TabRawSetInt { .. }
            | Self::TabStackAppend { .. }
            | Self::VarInit { .. }
            | Self::VarStore { .. }
            | Self::UpStore { .. }
            | Self::Line { .. }
            | Self::CpuWithdraw { .. } => None,
        }
    }

    /// The variable this node defines, if any.
    ///
    /// `VarStore` deliberately defines nothing: the assignment reads the
    /// variable's identity, so stores count as uses (see `uses_vars`).
    #[must_use]
    pub fn def_var(&self) -> Option<Var> {
        match self {
            Self::VarInit { var, .. } => Some(*var),
            _ => None,
        }
    }

    /// Collects the value-like entities this node reads.
    pub fn uses_vals(&self, out: &mut Vec<AnyVal>) {
        match self {
            Self::BinOp { lhs, rhs, .. } => {
                out.push((*lhs).into());
                out.push((*rhs).into());
            }
            Self::UnOp { arg, .. } => out.push((*arg).into()),
            Self::ToNumber { src, .. } => out.push((*src).into()),
            Self::ToNext { base, step, .. } => {
                out.push((*base).into());
                out.push((*step).into());
            }
            Self::TabGet { table, key, .. } => {
                out.push((*table).into());
                out.push((*key).into());
            }
            Self::TabSet { table, key, value } => {
                out.push((*table).into());
                out.push((*key).into());
                out.push((*value).into());
            }
            Self::TabRawSetInt { table, value, .. } => {
                out.push((*table).into());
                out.push((*value).into());
            }
            Self::TabStackAppend { table, source, .. } => {
                out.push((*table).into());
                out.push((*source).into());
            }
            Self::VarInit { value, .. }
            | Self::VarStore { value, .. }
            | Self::UpStore { value, .. }
            | Self::PhiStore { value, .. } => out.push((*value).into()),
            Self::MultiGet { source, .. } => out.push((*source).into()),
            Self::PhiLoad { phi, .. } => out.push((*phi).into()),
            Self::Call { target, args, .. } => {
                out.push((*target).into());
                args_uses(args, out);
            }
            Self::LoadNil { .. }
            | Self::LoadBool { .. }
            | Self::LoadInt { .. }
            | Self::LoadFloat { .. }
            | Self::LoadStr { .. }
            | Self::TabNew { .. }
            | Self::VarLoad { .. }
            | Self::UpLoad { .. }
            | Self::Vararg { .. }
            | Self::Closure { .. }
            | Self::Line { .. }
            | Self::CpuWithdraw { .. } => {}
        }
    }

    /// Collects the variables this node reads.
    ///
    /// `VarStore` reads both its source value and its destination variable;
    /// closure creation reads every captured variable (the cell identity must
    /// stay live until capture).
    pub fn uses_vars(&self, out: &mut Vec<Var>) {
        match self {
            Self::VarLoad { var, .. } | Self::VarStore { var, .. } => out.push(*var),
            Self::Closure { upvals, .. } => {
                for upval in upvals {
                    if let ClosureUpval::FromVar(var) = upval {
                        out.push(*var);
                    }
                }
            }
            _ => {}
        }
    }
}

/// The single exit of a basic block.
#[derive(Debug, Clone)]
pub enum Terminator {
    ToNext { target: Label },
    Branch { cond: Val, if_true: Label, if_false: Label },
    Ret { args: CallArgs },
    TCall { target: Val, args: CallArgs },
}

impl Terminator {
    /// Labels this terminator can transfer to.
    pub fn successors(&self, out: &mut Vec<Label>) {
        match self {
            Self::ToNext { target } => out.push(*target),
            Self::Branch { if_true, if_false, .. } => {
                out.push(*if_true);
                out.push(*if_false);
            }
            Self::Ret { .. } | Self::TCall { .. } => {}
        }
    }

    /// Collects the value-like entities this terminator reads.
    pub fn uses_vals(&self, out: &mut Vec<AnyVal>) {
        match self {
            Self::ToNext { .. } => {}
            Self::Branch { cond, .. } => out.push((*cond).into()),
            Self::Ret { args } => args_uses(args, out),
            Self::TCall { target, args } => {
                out.push((*target).into());
                args_uses(args, out);
            }
        }
    }

    /// Rewrites one successor label, for the block merger and segmenter.
    pub fn replace_target(&mut self, from: Label, to: Label) {
        match self {
            Self::ToNext { target } => {
                if *target == from {
                    *target = to;
                }
            }
            Self::Branch { if_true, if_false, .. } => {
                if *if_true == from {
                    *if_true = to;
                }
                if *if_false == from {
                    *if_false = to;
                }
            }
            Self::Ret { .. } | Self::TCall { .. } => {}
        }
    }
}

fn args_uses(args: &CallArgs, out: &mut Vec<AnyVal>) {
    for v in &args.fixed {
        out.push((*v).into());
    }
    if let Some(tail) = args.tail {
        out.push(tail.into());
    }
}
