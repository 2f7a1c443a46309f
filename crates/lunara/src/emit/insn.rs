//! The register instruction set emitted code runs on.
//!
//! One instruction per IR node, operating on the slot-allocated register
//! window. Instructions that can reach a metamethod are *paired*: the
//! emitter places a companion `ReadResult`/`ReadResultTest`/`Nop` directly
//! after them. The fast path skips the companion; the metamethod path
//! suspends with a resumption point at the companion, which consumes the
//! call result from the return buffer when the frame resumes.

use serde::{Deserialize, Serialize};
use strum::Display;

/// A register index (a slot from the allocator).
pub type Reg = u16;

/// Sentinel for "no resumption point".
pub const NO_POINT: u16 = u16::MAX;

/// Arithmetic and bitwise operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[strum(serialize_all = "UPPERCASE")]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    IDiv,
    Pow,
    BAnd,
    BOr,
    BXor,
    Shl,
    Shr,
}

impl ArithOp {
    #[must_use]
    pub fn is_bitwise(self) -> bool {
        matches!(self, Self::BAnd | Self::BOr | Self::BXor | Self::Shl | Self::Shr)
    }

    /// The metamethod event name, without the `__` prefix.
    #[must_use]
    pub fn event(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::Div => "div",
            Self::Mod => "mod",
            Self::IDiv => "idiv",
            Self::Pow => "pow",
            Self::BAnd => "band",
            Self::BOr => "bor",
            Self::BXor => "bxor",
            Self::Shl => "shl",
            Self::Shr => "shr",
        }
    }
}

/// Comparison operators; `Ne` is `Eq` with the negate flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[strum(serialize_all = "UPPERCASE")]
pub enum CmpOp {
    Eq,
    Lt,
    Le,
}

/// Unary operators with a runtime presence (`not` never has one).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[strum(serialize_all = "UPPERCASE")]
pub enum UnaryOp {
    Neg,
    BNot,
    Not,
}

/// What the type analysis proved about an operation's operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NumericHint {
    /// Both operands are integers: the integer helper applies directly.
    IntInt,
    /// Both operands subtype number: no metamethod is possible.
    Numeric,
    /// Unknown operands: the operation may dispatch a metamethod and is a
    /// suspension point (paired).
    Dynamic,
}

impl NumericHint {
    /// Paired operations carry a companion instruction.
    #[must_use]
    pub fn is_paired(self) -> bool {
        matches!(self, Self::Dynamic)
    }
}

/// The coercion context of a `ToNumber`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoercionContext {
    ForInit,
    ForLimit,
    ForStep,
}

impl CoercionContext {
    #[must_use]
    pub fn describe(self) -> &'static str {
        match self {
            Self::ForInit => "'for' initial value",
            Self::ForLimit => "'for' limit",
            Self::ForStep => "'for' step",
        }
    }
}

/// Argument shape of a call or return: registers plus an optional expanding
/// tail (the current buffer contents or the frame's varargs).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgPack {
    pub regs: Box<[Reg]>,
    pub tail: ArgTail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArgTail {
    None,
    /// Expand the return buffer's current contents.
    Buffer,
    /// Expand the frame's varargs.
    Varargs,
}

/// Source of one captured upvalue in `MakeClosure`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClosureCapture {
    /// The register holds a variable cell (a reified local).
    FromReg(Reg),
    /// An upvalue of the running closure, passed through.
    FromUpval(u16),
}

/// One emitted instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Insn {
    LoadNil { dst: Reg },
    LoadBool { dst: Reg, value: bool },
    LoadInt { dst: Reg, value: i64 },
    LoadFloat { dst: Reg, value: f64 },
    /// Loads an entry of the constant pool (interned at link time).
    LoadConst { dst: Reg, index: u16 },
    Copy { dst: Reg, src: Reg },

    /// Wraps the value in a fresh variable cell (variable reification).
    CellNew { dst: Reg, src: Reg },
    CellGet { dst: Reg, cell: Reg },
    CellSet { cell: Reg, src: Reg },
    UpGet { dst: Reg, upval: u16 },
    UpSet { upval: u16, src: Reg },
    MakeClosure {
        dst: Reg,
        link: u16,
        upvals: Box<[ClosureCapture]>,
    },

    /// Paired when `hint` is `Dynamic`; resumption point at the companion.
    Arith {
        dst: Reg,
        op: ArithOp,
        lhs: Reg,
        rhs: Reg,
        hint: NumericHint,
        point: u16,
    },
    Unary {
        dst: Reg,
        op: UnaryOp,
        src: Reg,
        paired: bool,
        point: u16,
    },
    Concat {
        dst: Reg,
        lhs: Reg,
        rhs: Reg,
        paired: bool,
        point: u16,
    },
    Len {
        dst: Reg,
        src: Reg,
        paired: bool,
        point: u16,
    },
    Cmp {
        dst: Reg,
        op: CmpOp,
        negate: bool,
        lhs: Reg,
        rhs: Reg,
        paired: bool,
        point: u16,
    },
    ToNumber {
        dst: Reg,
        src: Reg,
        context: CoercionContext,
    },
    /// The numeric-for increment.
    NextIndex { dst: Reg, base: Reg, step: Reg },

    NewTable { dst: Reg, array: u32, hash: u32 },
    GetIndex {
        dst: Reg,
        obj: Reg,
        key: Reg,
        point: u16,
    },
    SetIndex {
        obj: Reg,
        key: Reg,
        src: Reg,
        point: u16,
    },
    RawSetInt { obj: Reg, index: i64, src: Reg },
    /// Appends the buffer contents to the table starting at `start`.
    AppendBuffer { obj: Reg, start: i64 },
    AppendVarargs { obj: Reg, start: i64 },

    /// Reads one value of the current buffer (a call's results).
    ReadBuffer { dst: Reg, index: u16 },
    ReadVarargs { dst: Reg, index: u16 },
    /// Companion: consumes a dispatched call's single result.
    ReadResult { dst: Reg },
    /// Companion for comparisons: booleanises the dispatched result.
    ReadResultTest { dst: Reg, negate: bool },

    /// Saves the frame and hands the pending call to the executor; resumes
    /// at the following instruction.
    Call {
        target: Reg,
        args: ArgPack,
        point: u16,
    },
    /// Requests frame replacement through the buffer's call flag.
    TailCall { target: Reg, args: ArgPack },
    Return { args: ArgPack },

    Jump { target: u32 },
    /// Branches when the register is truthy, else falls through.
    BranchIf { cond: Reg, target: u32 },

    Line { line: u32 },
    /// Tick accounting; may suspend when the scheduler requests a pause.
    TickWithdraw { cost: u32, point: u16 },
    Nop,
}

/// A resumption point: where `resume` re-enters and which registers the
/// saved state carries across the suspension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumePoint {
    /// Instruction index execution continues at.
    pub pc: u32,
    /// Registers live across the suspension (liveness ∩ slot allocation).
    pub live_slots: Box<[Reg]>,
}
