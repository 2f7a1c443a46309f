//! The resolved AST the compiler consumes.
//!
//! This is the input contract of the pipeline: a chunk whose names are fully
//! resolved. Every variable reference is a [`VarRef`] pointing at a local
//! slot or an upvalue of the enclosing function; globals have already been
//! rewritten by the resolver into `_ENV[name]` indexing, so no "global"
//! reference survives here. Function bodies carry their parameter lists,
//! vararg flags, and the set of locals captured by nested bodies.
//!
//! The lexer and parser producing this form are external collaborators; the
//! [`build`] module provides the builders tests use in their place.

use std::rc::Rc;

/// Index of a local variable within its declaring function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalId(pub u32);

/// Index into the enclosing function's upvalue list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UpvalId(pub u32);

/// A resolved variable reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarRef {
    Local(LocalId),
    Upval(UpvalId),
}

/// Where an upvalue's storage comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpvalSource {
    /// A captured local of the directly enclosing function.
    ParentLocal(LocalId),
    /// An upvalue passed through from the enclosing function.
    ParentUpval(UpvalId),
    /// Supplied by the loader at instantiation time (the chunk's `_ENV`).
    Root,
}

/// One upvalue of a function body.
#[derive(Debug, Clone)]
pub struct UpvalDesc {
    pub name: Rc<str>,
    pub source: UpvalSource,
}

/// A resolved function body (or the main chunk).
#[derive(Debug)]
pub struct FunctionBody {
    /// Debug name, e.g. `"main"` or `"f"`.
    pub name: String,
    /// Parameter locals, in declaration order. Always a prefix of the
    /// function's locals.
    pub params: Vec<LocalId>,
    pub is_vararg: bool,
    /// One name per local; the length is the local count.
    pub local_names: Vec<Rc<str>>,
    pub upvals: Vec<UpvalDesc>,
    /// Locals captured by nested function bodies. The resolver computes
    /// this; the compiler reifies exactly these into cells.
    pub captured: Vec<LocalId>,
    pub block: Block,
}

impl FunctionBody {
    /// Whether `local_id` is captured by some nested body.
    #[must_use]
    pub fn is_captured(&self, local: LocalId) -> bool {
        self.captured.contains(&local)
    }
}

/// A statement list.
#[derive(Debug, Default)]
pub struct Block {
    pub stats: Vec<Stat>,
}

/// A statement with its source line.
#[derive(Debug)]
pub struct Stat {
    pub line: u32,
    pub kind: StatKind,
}

#[derive(Debug)]
pub enum StatKind {
    /// `local a, b = e1, e2`
    LocalDecl { targets: Vec<LocalId>, exprs: Vec<Expr> },
    /// `a, t[k] = e1, e2`
    Assign { targets: Vec<AssignTarget>, exprs: Vec<Expr> },
    /// A call in statement position; results are discarded.
    CallStat(Expr),
    Do(Block),
    While { cond: Expr, body: Block },
    Repeat { body: Block, cond: Expr },
    If { arms: Vec<(Expr, Block)>, orelse: Option<Block> },
    NumericFor {
        var: LocalId,
        init: Expr,
        limit: Expr,
        step: Option<Expr>,
        body: Block,
    },
    GenericFor { vars: Vec<LocalId>, exprs: Vec<Expr>, body: Block },
    Return(Vec<Expr>),
    Break,
    Goto(Rc<str>),
    Label(Rc<str>),
    /// `local function f() ... end`; the local is visible inside the body.
    LocalFunction { target: LocalId, body: Rc<FunctionBody> },
}

#[derive(Debug)]
pub enum AssignTarget {
    Var(VarRef),
    Index { object: Expr, key: Expr },
}

/// An expression.
#[derive(Debug)]
pub enum Expr {
    Nil,
    True,
    False,
    Int(i64),
    Float(f64),
    Str(Vec<u8>),
    Vararg,
    Var(VarRef),
    Index(Box<Expr>, Box<Expr>),
    Call { target: Box<Expr>, args: Vec<Expr> },
    /// `obj:name(args)` — indexes then calls with `obj` prepended.
    MethodCall {
        object: Box<Expr>,
        name: Vec<u8>,
        args: Vec<Expr>,
    },
    Function(Rc<FunctionBody>),
    Table(Vec<TableItem>),
    BinOp(BinAstOp, Box<Expr>, Box<Expr>),
    UnOp(UnAstOp, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    /// Parenthesised expression: truncates a multi-value to one value.
    Paren(Box<Expr>),
}

impl Expr {
    /// Whether the expression can produce multiple values in tail position.
    #[must_use]
    pub fn is_multivalue(&self) -> bool {
        matches!(self, Self::Vararg | Self::Call { .. } | Self::MethodCall { .. })
    }
}

/// One item of a table constructor.
#[derive(Debug)]
pub enum TableItem {
    /// A positional item, appended at the next sequence index.
    Positional(Expr),
    /// `[k] = v` or `name = v`.
    Named { key: Expr, value: Expr },
}

/// Binary operators as they appear in source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinAstOp {
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
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Unary operators as they appear in source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnAstOp {
    Neg,
    Not,
    Len,
    BNot,
}

/// Builders for constructing resolved chunks programmatically.
///
/// Tests use these in place of the external parser. `FnBuilder` hands out
/// local ids and tracks captures; the free functions below keep expression
/// construction terse.
pub mod build {
    use std::rc::Rc;

    use super::{
        AssignTarget, BinAstOp, Block, Expr, FunctionBody, LocalId, Stat, StatKind, UnAstOp, UpvalDesc, UpvalId,
        UpvalSource, VarRef,
    };

    /// Builds one function body, handing out locals and collecting captures.
    #[derive(Debug)]
    pub struct FnBuilder {
        name: String,
        params: Vec<LocalId>,
        is_vararg: bool,
        local_names: Vec<Rc<str>>,
        upvals: Vec<UpvalDesc>,
        captured: Vec<LocalId>,
    }

    impl FnBuilder {
        /// Starts a main chunk: vararg, with `_ENV` as upvalue 0.
        #[must_use]
        pub fn main() -> Self {
            Self {
                name: "main".to_owned(),
                params: Vec::new(),
                is_vararg: true,
                local_names: Vec::new(),
                upvals: vec![UpvalDesc {
                    name: "_ENV".into(),
                    source: UpvalSource::Root,
                }],
                captured: Vec::new(),
            }
        }

        /// Starts a nested function body.
        #[must_use]
        pub fn function(name: &str) -> Self {
            Self {
                name: name.to_owned(),
                params: Vec::new(),
                is_vararg: false,
                local_names: Vec::new(),
                upvals: Vec::new(),
                captured: Vec::new(),
            }
        }

        /// Declares a parameter (must precede other locals).
        pub fn param(&mut self, name: &str) -> LocalId {
            let id = self.local(name);
            self.params.push(id);
            id
        }

        /// Declares a local.
        pub fn local(&mut self, name: &str) -> LocalId {
            let id = LocalId(u32::try_from(self.local_names.len()).expect("local count exceeds u32"));
            self.local_names.push(name.into());
            id
        }

        /// Marks a local as captured by a nested body.
        pub fn capture(&mut self, local: LocalId) {
            if !self.captured.contains(&local) {
                self.captured.push(local);
            }
        }

        /// Declares an upvalue referring to a parent local.
        pub fn upval_of_local(&mut self, name: &str, parent: LocalId) -> UpvalId {
            self.push_upval(name, UpvalSource::ParentLocal(parent))
        }

        /// Declares an upvalue passed through from the parent's upvalues.
        pub fn upval_of_upval(&mut self, name: &str, parent: UpvalId) -> UpvalId {
            self.push_upval(name, UpvalSource::ParentUpval(parent))
        }

        pub fn set_vararg(&mut self, vararg: bool) {
            self.is_vararg = vararg;
        }

        fn push_upval(&mut self, name: &str, source: UpvalSource) -> UpvalId {
            let id = UpvalId(u32::try_from(self.upvals.len()).expect("upvalue count exceeds u32"));
            self.upvals.push(UpvalDesc {
                name: name.into(),
                source,
            });
            id
        }

        /// Finishes the body with the given block.
        #[must_use]
        pub fn finish(self, block: Block) -> FunctionBody {
            FunctionBody {
                name: self.name,
                params: self.params,
                is_vararg: self.is_vararg,
                local_names: self.local_names,
                upvals: self.upvals,
                captured: self.captured,
                block,
            }
        }
    }

    /// A block from statements, numbering lines 1..=n.
    #[must_use]
    pub fn block(stats: Vec<StatKind>) -> Block {
        Block {
            stats: stats
                .into_iter()
                .enumerate()
                .map(|(i, kind)| Stat {
                    line: u32::try_from(i).unwrap_or(u32::MAX) + 1,
                    kind,
                })
                .collect(),
        }
    }

    #[must_use]
    pub fn int(value: i64) -> Expr {
        Expr::Int(value)
    }

    #[must_use]
    pub fn float(value: f64) -> Expr {
        Expr::Float(value)
    }

    #[must_use]
    pub fn str(value: &str) -> Expr {
        Expr::Str(value.as_bytes().to_vec())
    }

    #[must_use]
    pub fn nil() -> Expr {
        Expr::Nil
    }

    #[must_use]
    pub fn local_ref(id: LocalId) -> Expr {
        Expr::Var(VarRef::Local(id))
    }

    #[must_use]
    pub fn upval_ref(id: UpvalId) -> Expr {
        Expr::Var(VarRef::Upval(id))
    }

    /// A global read: `_ENV[name]` with `_ENV` as upvalue 0.
    #[must_use]
    pub fn global(name: &str) -> Expr {
        Expr::Index(Box::new(upval_ref(UpvalId(0))), Box::new(str(name)))
    }

    #[must_use]
    pub fn index(object: Expr, key: Expr) -> Expr {
        Expr::Index(Box::new(object), Box::new(key))
    }

    #[must_use]
    pub fn binop(op: BinAstOp, lhs: Expr, rhs: Expr) -> Expr {
        Expr::BinOp(op, Box::new(lhs), Box::new(rhs))
    }

    #[must_use]
    pub fn unop(op: UnAstOp, value: Expr) -> Expr {
        Expr::UnOp(op, Box::new(value))
    }

    #[must_use]
    pub fn call(target: Expr, args: Vec<Expr>) -> Expr {
        Expr::Call {
            target: Box::new(target),
            args,
        }
    }

    /// A statement-position call.
    #[must_use]
    pub fn call_stat(target: Expr, args: Vec<Expr>) -> StatKind {
        StatKind::CallStat(call(target, args))
    }

    #[must_use]
    pub fn local_decl(targets: Vec<LocalId>, exprs: Vec<Expr>) -> StatKind {
        StatKind::LocalDecl { targets, exprs }
    }

    #[must_use]
    pub fn assign_local(target: LocalId, expr: Expr) -> StatKind {
        StatKind::Assign {
            targets: vec![AssignTarget::Var(VarRef::Local(target))],
            exprs: vec![expr],
        }
    }

    /// `_ENV[name] = expr`
    #[must_use]
    pub fn assign_global(name: &str, expr: Expr) -> StatKind {
        StatKind::Assign {
            targets: vec![AssignTarget::Index {
                object: upval_ref(UpvalId(0)),
                key: str(name),
            }],
            exprs: vec![expr],
        }
    }

    #[must_use]
    pub fn assign_index(object: Expr, key: Expr, value: Expr) -> StatKind {
        StatKind::Assign {
            targets: vec![AssignTarget::Index { object, key }],
            exprs: vec![value],
        }
    }

    #[must_use]
    pub fn ret(exprs: Vec<Expr>) -> StatKind {
        StatKind::Return(exprs)
    }

    #[must_use]
    pub fn numeric_for(var: LocalId, init: Expr, limit: Expr, step: Option<Expr>, body: Block) -> StatKind {
        StatKind::NumericFor {
            var,
            init,
            limit,
            step,
            body,
        }
    }

    #[must_use]
    pub fn while_loop(cond: Expr, body: Block) -> StatKind {
        StatKind::While { cond, body }
    }

    #[must_use]
    pub fn if_then(cond: Expr, then: Block, orelse: Option<Block>) -> StatKind {
        StatKind::If {
            arms: vec![(cond, then)],
            orelse,
        }
    }

    #[must_use]
    pub fn function_expr(body: FunctionBody) -> Expr {
        Expr::Function(Rc::new(body))
    }
}
