//! AST → IR translation.
//!
//! Walks a resolved chunk and emits IR, lifting nested function bodies into
//! module siblings with path-derived [`FunctionId`]s. `and`/`or` lower to
//! short-circuit control flow joining through phi values; numeric `for`
//! lowers to a three-test header with a step-back edge; generic `for` to an
//! iterator-protocol call loop; `break` and `goto` to plain edges.

use std::{fmt, rc::Rc};

use ahash::{AHashMap, AHashSet};

use crate::{
    ast::{self, AssignTarget, Block, Expr, FunctionBody, LocalId, StatKind, TableItem, UpvalSource, VarRef},
    ir::{
        code::{BasicBlock, Code, FunctionId, IRFunc, Label, Module},
        entity::{EntityAlloc, MultiVal, UpVar, Val, Var},
        node::{BinOpKind, BodyNode, CallArgs, ClosureUpval, NumberContext, Terminator, UnOpKind},
    },
};

/// A structural problem in the input chunk.
///
/// The parser and resolver normally rule these out; the builders tests use
/// can still produce them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    /// `goto` names a label never defined in the function.
    UndefinedLabel(String),
    /// `break` with no enclosing loop.
    BreakOutsideLoop,
    /// `...` used in a non-vararg function.
    VarargOutsideVarargFunction,
    /// A `Root` upvalue source in a nested function body.
    RootUpvalueInNestedFunction,
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UndefinedLabel(name) => write!(f, "no visible label '{name}' for goto"),
            Self::BreakOutsideLoop => write!(f, "break outside a loop"),
            Self::VarargOutsideVarargFunction => {
                write!(f, "cannot use '...' outside a vararg function")
            }
            Self::RootUpvalueInNestedFunction => {
                write!(f, "loader-supplied upvalue in a nested function")
            }
        }
    }
}

impl std::error::Error for CompileError {}

/// Translates a resolved chunk into an IR module.
///
/// The chunk becomes the root function; nested bodies are appended in
/// pre-order with child ids.
pub fn translate_chunk(chunk: &FunctionBody) -> Result<Module, CompileError> {
    let mut funcs = Vec::new();
    translate_function(FunctionId::root(), chunk, &mut funcs)?;
    Ok(Module::new(funcs))
}

fn translate_function(id: FunctionId, body: &FunctionBody, out: &mut Vec<IRFunc>) -> Result<(), CompileError> {
    let mut tr = FuncTranslator::new(id.clone(), body);
    let code = tr.run()?;
    let nested = tr.nested;
    out.push(IRFunc {
        id: id.clone(),
        params: tr.param_vars,
        upval_names: body.upvals.iter().map(|u| u.name.clone()).collect(),
        vararg: body.is_vararg,
        code,
    });
    for (ordinal, nested_body) in nested.iter().enumerate() {
        let child_id = id.child(u16::try_from(ordinal).expect("nested function count exceeds u16"));
        translate_function(child_id, nested_body, out)?;
    }
    Ok(())
}

struct FuncTranslator<'a> {
    id: FunctionId,
    source: &'a FunctionBody,
    alloc: EntityAlloc,
    /// Resolved local slot → IR variable.
    vars: AHashMap<LocalId, Var>,
    param_vars: Vec<Var>,
    blocks: Vec<BasicBlock>,
    current_label: Label,
    current_body: Vec<BodyNode>,
    next_label: i32,
    /// Exit labels of enclosing loops, innermost last.
    loop_exits: Vec<Label>,
    named_labels: AHashMap<Rc<str>, Label>,
    defined_labels: AHashSet<Rc<str>>,
    /// Nested function bodies in closure-creation order.
    nested: Vec<Rc<FunctionBody>>,
    current_line: u32,
}

impl<'a> FuncTranslator<'a> {
    fn new(id: FunctionId, source: &'a FunctionBody) -> Self {
        let mut alloc = EntityAlloc::new();
        let mut vars = AHashMap::with_capacity(source.local_names.len());
        let mut param_vars = Vec::with_capacity(source.params.len());
        // Parameters first so their variables line up with pre-allocated
        // slots 0..n-1.
        for local in &source.params {
            let var = alloc.var();
            vars.insert(*local, var);
            param_vars.push(var);
        }
        for index in 0..source.local_names.len() {
            let local = LocalId(u32::try_from(index).expect("local index exceeds u32"));
            vars.entry(local).or_insert_with(|| alloc.var());
        }
        Self {
            id,
            source,
            alloc,
            vars,
            param_vars,
            blocks: Vec::new(),
            current_label: Label(0),
            current_body: Vec::new(),
            next_label: 1,
            loop_exits: Vec::new(),
            named_labels: AHashMap::new(),
            defined_labels: AHashSet::new(),
            nested: Vec::new(),
            current_line: 0,
        }
    }

    fn run(&mut self) -> Result<Code, CompileError> {
        let source = self.source;
        self.block(&source.block)?;
        // Implicit `return` at the end of the body.
        self.seal(Terminator::Ret { args: CallArgs::default() });
        for (name, _) in &self.named_labels {
            if !self.defined_labels.contains(name) {
                return Err(CompileError::UndefinedLabel(name.to_string()));
            }
        }
        Ok(Code::new(std::mem::take(&mut self.blocks)))
    }

    // ---- block plumbing ----

    fn fresh_label(&mut self) -> Label {
        let label = Label(self.next_label);
        self.next_label += 1;
        label
    }

    /// Finishes the current block with `term` and leaves no block open.
    fn seal(&mut self, term: Terminator) {
        let body = std::mem::take(&mut self.current_body);
        self.blocks.push(BasicBlock::new(self.current_label, body, term));
    }

    /// Finishes the current block and opens `label`.
    fn seal_to(&mut self, term: Terminator, label: Label) {
        self.seal(term);
        self.current_label = label;
    }

    /// Finishes the current block jumping to `label` and continues there.
    fn jump_to(&mut self, label: Label) {
        self.seal_to(Terminator::ToNext { target: label }, label);
    }

    fn emit(&mut self, node: BodyNode) {
        self.current_body.push(node);
    }

    fn var_of(&self, local: LocalId) -> Var {
        *self.vars.get(&local).expect("locals are declared before use")
    }

    fn note_line(&mut self, line: u32) {
        if line != 0 && line != self.current_line {
            self.current_line = line;
            self.emit(BodyNode::Line { line });
        }
    }

    // ---- statements ----

    fn block(&mut self, block: &Block) -> Result<(), CompileError> {
        for stat in &block.stats {
            self.note_line(stat.line);
            self.statement(&stat.kind)?;
        }
        Ok(())
    }

    fn statement(&mut self, stat: &StatKind) -> Result<(), CompileError> {
        match stat {
            StatKind::LocalDecl { targets, exprs } => {
                let values = self.explist_exact(exprs, targets.len())?;
                for (local, value) in targets.iter().zip(values) {
                    let var = self.var_of(*local);
                    self.emit(BodyNode::VarInit { var, value });
                }
                Ok(())
            }
            StatKind::Assign { targets, exprs } => self.assign(targets, exprs),
            StatKind::CallStat(expr) => {
                if expr.is_multivalue() {
                    self.expr_multi(expr)?;
                } else {
                    self.expr(expr)?;
                }
                Ok(())
            }
            StatKind::Do(inner) => self.block(inner),
            StatKind::While { cond, body } => self.while_loop(cond, body),
            StatKind::Repeat { body, cond } => self.repeat_loop(body, cond),
            StatKind::If { arms, orelse } => self.if_chain(arms, orelse.as_ref()),
            StatKind::NumericFor {
                var,
                init,
                limit,
                step,
                body,
            } => self.numeric_for(*var, init, limit, step.as_ref(), body),
            StatKind::GenericFor { vars, exprs, body } => self.generic_for(vars, exprs, body),
            StatKind::Return(exprs) => self.return_stat(exprs),
            StatKind::Break => {
                let Some(exit) = self.loop_exits.last().copied() else {
                    return Err(CompileError::BreakOutsideLoop);
                };
                let dead = self.fresh_label();
                self.seal_to(Terminator::ToNext { target: exit }, dead);
                Ok(())
            }
            StatKind::Goto(name) => {
                let target = self.named_label(name);
                let dead = self.fresh_label();
                self.seal_to(Terminator::ToNext { target }, dead);
                Ok(())
            }
            StatKind::Label(name) => {
                let label = self.named_label(name);
                self.defined_labels.insert(name.clone());
                self.jump_to(label);
                Ok(())
            }
            StatKind::LocalFunction { target, body } => {
                // The local is visible inside the body (recursion), so it is
                // initialised before the closure captures it.
                let var = self.var_of(*target);
                let nil = self.alloc.val();
                self.emit(BodyNode::LoadNil { dest: nil });
                self.emit(BodyNode::VarInit { var, value: nil });
                let closure = self.closure(body)?;
                self.emit(BodyNode::VarStore { var, value: closure });
                Ok(())
            }
        }
    }

    fn named_label(&mut self, name: &Rc<str>) -> Label {
        if let Some(label) = self.named_labels.get(name) {
            return *label;
        }
        let label = self.fresh_label();
        self.named_labels.insert(name.clone(), label);
        label
    }

    fn assign(&mut self, targets: &[AssignTarget], exprs: &[Expr]) -> Result<(), CompileError> {
        // Target prefixes evaluate before the value list, left to right.
        let mut prepared = Vec::with_capacity(targets.len());
        for target in targets {
            prepared.push(match target {
                AssignTarget::Var(var) => PreparedTarget::Var(*var),
                AssignTarget::Index { object, key } => {
                    let object = self.expr(object)?;
                    let key = self.expr(key)?;
                    PreparedTarget::Index { object, key }
                }
            });
        }
        let values = self.explist_exact(exprs, targets.len())?;
        for (target, value) in prepared.into_iter().zip(values) {
            match target {
                PreparedTarget::Var(VarRef::Local(local)) => {
                    let var = self.var_of(local);
                    self.emit(BodyNode::VarStore { var, value });
                }
                PreparedTarget::Var(VarRef::Upval(upval)) => {
                    self.emit(BodyNode::UpStore {
                        upvar: UpVar::new(upval.0),
                        value,
                    });
                }
                PreparedTarget::Index { object, key } => {
                    self.emit(BodyNode::TabSet {
                        table: object,
                        key,
                        value,
                    });
                }
            }
        }
        Ok(())
    }

    fn while_loop(&mut self, cond: &Expr, body: &Block) -> Result<(), CompileError> {
        let test = self.fresh_label();
        let body_label = self.fresh_label();
        let exit = self.fresh_label();
        self.jump_to(test);
        let cond_val = self.expr(cond)?;
        self.seal_to(
            Terminator::Branch {
                cond: cond_val,
                if_true: body_label,
                if_false: exit,
            },
            body_label,
        );
        self.loop_exits.push(exit);
        self.block(body)?;
        self.loop_exits.pop();
        self.seal_to(Terminator::ToNext { target: test }, exit);
        Ok(())
    }

    fn repeat_loop(&mut self, body: &Block, cond: &Expr) -> Result<(), CompileError> {
        let body_label = self.fresh_label();
        let exit = self.fresh_label();
        self.jump_to(body_label);
        self.loop_exits.push(exit);
        self.block(body)?;
        self.loop_exits.pop();
        // `repeat` exits when the condition turns true.
        let cond_val = self.expr(cond)?;
        self.seal_to(
            Terminator::Branch {
                cond: cond_val,
                if_true: exit,
                if_false: body_label,
            },
            exit,
        );
        Ok(())
    }

    fn if_chain(&mut self, arms: &[(Expr, Block)], orelse: Option<&Block>) -> Result<(), CompileError> {
        let join = self.fresh_label();
        for (cond, then_block) in arms {
            let then_label = self.fresh_label();
            let next_label = self.fresh_label();
            let cond_val = self.expr(cond)?;
            self.seal_to(
                Terminator::Branch {
                    cond: cond_val,
                    if_true: then_label,
                    if_false: next_label,
                },
                then_label,
            );
            self.block(then_block)?;
            self.seal_to(Terminator::ToNext { target: join }, next_label);
        }
        if let Some(orelse) = orelse {
            self.block(orelse)?;
        }
        self.jump_to(join);
        Ok(())
    }

    /// Numeric `for`: coerce the three bounds, test by step sign, and loop
    /// the control value through a phi.
    fn numeric_for(
        &mut self,
        var: LocalId,
        init: &Expr,
        limit: &Expr,
        step: Option<&Expr>,
        body: &Block,
    ) -> Result<(), CompileError> {
        let init_raw = self.expr(init)?;
        let limit_raw = self.expr(limit)?;
        let step_raw = match step {
            Some(step) => self.expr(step)?,
            None => {
                let one = self.alloc.val();
                self.emit(BodyNode::LoadInt { dest: one, value: 1 });
                one
            }
        };
        let init_val = self.alloc.val();
        let limit_val = self.alloc.val();
        let step_val = self.alloc.val();
        self.emit(BodyNode::ToNumber {
            dest: init_val,
            src: init_raw,
            context: NumberContext::ForInit,
        });
        self.emit(BodyNode::ToNumber {
            dest: limit_val,
            src: limit_raw,
            context: NumberContext::ForLimit,
        });
        self.emit(BodyNode::ToNumber {
            dest: step_val,
            src: step_raw,
            context: NumberContext::ForStep,
        });

        let phi = self.alloc.phi();
        self.emit(BodyNode::PhiStore { phi, value: init_val });

        let test = self.fresh_label();
        let test_up = self.fresh_label();
        let test_down = self.fresh_label();
        let body_label = self.fresh_label();
        let step_label = self.fresh_label();
        let exit = self.fresh_label();

        self.jump_to(test);
        let index = self.alloc.val();
        self.emit(BodyNode::PhiLoad { dest: index, phi });
        let zero = self.alloc.val();
        self.emit(BodyNode::LoadInt { dest: zero, value: 0 });
        let ascending = self.alloc.val();
        self.emit(BodyNode::BinOp {
            dest: ascending,
            op: BinOpKind::Lt,
            lhs: zero,
            rhs: step_val,
        });
        self.seal_to(
            Terminator::Branch {
                cond: ascending,
                if_true: test_up,
                if_false: test_down,
            },
            test_up,
        );

        let in_up = self.alloc.val();
        self.emit(BodyNode::BinOp {
            dest: in_up,
            op: BinOpKind::Le,
            lhs: index,
            rhs: limit_val,
        });
        self.seal_to(
            Terminator::Branch {
                cond: in_up,
                if_true: body_label,
                if_false: exit,
            },
            test_down,
        );

        let in_down = self.alloc.val();
        self.emit(BodyNode::BinOp {
            dest: in_down,
            op: BinOpKind::Le,
            lhs: limit_val,
            rhs: index,
        });
        self.seal_to(
            Terminator::Branch {
                cond: in_down,
                if_true: body_label,
                if_false: exit,
            },
            body_label,
        );

        let loop_var = self.var_of(var);
        self.emit(BodyNode::VarInit {
            var: loop_var,
            value: index,
        });
        self.loop_exits.push(exit);
        self.block(body)?;
        self.loop_exits.pop();
        self.jump_to(step_label);
        let next = self.alloc.val();
        self.emit(BodyNode::ToNext {
            dest: next,
            base: index,
            step: step_val,
        });
        self.emit(BodyNode::PhiStore { phi, value: next });
        self.seal_to(Terminator::ToNext { target: test }, exit);
        Ok(())
    }

    /// Generic `for`: the iterator protocol. The iterator function, state
    /// and control live in hidden variables so they survive the loop edges.
    fn generic_for(&mut self, vars: &[LocalId], exprs: &[Expr], body: &Block) -> Result<(), CompileError> {
        let triple = self.explist_exact(exprs, 3)?;
        let iter_var = self.alloc.var();
        let state_var = self.alloc.var();
        let control_var = self.alloc.var();
        for (var, value) in [iter_var, state_var, control_var].into_iter().zip(triple) {
            self.emit(BodyNode::VarInit { var, value });
        }

        let test = self.fresh_label();
        let body_label = self.fresh_label();
        let exit = self.fresh_label();
        self.jump_to(test);

        let iter = self.alloc.val();
        self.emit(BodyNode::VarLoad {
            dest: iter,
            var: iter_var,
        });
        let state = self.alloc.val();
        self.emit(BodyNode::VarLoad {
            dest: state,
            var: state_var,
        });
        let control = self.alloc.val();
        self.emit(BodyNode::VarLoad {
            dest: control,
            var: control_var,
        });
        let results = self.alloc.multi();
        self.emit(BodyNode::Call {
            dest: results,
            target: iter,
            args: CallArgs::fixed(vec![state, control]),
        });
        let first = self.alloc.val();
        self.emit(BodyNode::MultiGet {
            dest: first,
            source: results,
            index: 0,
        });
        let nil = self.alloc.val();
        self.emit(BodyNode::LoadNil { dest: nil });
        let done = self.alloc.val();
        self.emit(BodyNode::BinOp {
            dest: done,
            op: BinOpKind::Eq,
            lhs: first,
            rhs: nil,
        });
        self.seal_to(
            Terminator::Branch {
                cond: done,
                if_true: exit,
                if_false: body_label,
            },
            body_label,
        );

        self.emit(BodyNode::VarStore {
            var: control_var,
            value: first,
        });
        for (position, local) in vars.iter().enumerate() {
            let var = self.var_of(*local);
            if position == 0 {
                self.emit(BodyNode::VarInit { var, value: first });
            } else {
                let value = self.alloc.val();
                self.emit(BodyNode::MultiGet {
                    dest: value,
                    source: results,
                    index: u32::try_from(position).expect("loop variable count exceeds u32"),
                });
                self.emit(BodyNode::VarInit { var, value });
            }
        }
        self.loop_exits.push(exit);
        self.block(body)?;
        self.loop_exits.pop();
        self.seal_to(Terminator::ToNext { target: test }, exit);
        Ok(())
    }

    fn return_stat(&mut self, exprs: &[Expr]) -> Result<(), CompileError> {
        // `return f(...)` is a proper tail call.
        if let [Expr::Call { target, args }] = exprs {
            let target_val = self.expr(target)?;
            let call_args = self.explist(args)?;
            let dead = self.fresh_label();
            self.seal_to(
                Terminator::TCall {
                    target: target_val,
                    args: call_args,
                },
                dead,
            );
            return Ok(());
        }
        if let [Expr::MethodCall { object, name, args }] = exprs {
            let (target_val, mut call_args) = self.method_target(object, name, args)?;
            let dead = self.fresh_label();
            self.seal_to(
                Terminator::TCall {
                    target: target_val,
                    args: std::mem::take(&mut call_args),
                },
                dead,
            );
            return Ok(());
        }
        let args = self.explist(exprs)?;
        let dead = self.fresh_label();
        self.seal_to(Terminator::Ret { args }, dead);
        Ok(())
    }

    // ---- expressions ----

    /// Evaluates an expression to a single value.
    fn expr(&mut self, expr: &Expr) -> Result<Val, CompileError> {
        match expr {
            Expr::Nil => {
                let dest = self.alloc.val();
                self.emit(BodyNode::LoadNil { dest });
                Ok(dest)
            }
            Expr::True | Expr::False => {
                let dest = self.alloc.val();
                self.emit(BodyNode::LoadBool {
                    dest,
                    value: matches!(expr, Expr::True),
                });
                Ok(dest)
            }
            Expr::Int(value) => {
                let dest = self.alloc.val();
                self.emit(BodyNode::LoadInt { dest, value: *value });
                Ok(dest)
            }
            Expr::Float(value) => {
                let dest = self.alloc.val();
                self.emit(BodyNode::LoadFloat { dest, value: *value });
                Ok(dest)
            }
            Expr::Str(bytes) => {
                let dest = self.alloc.val();
                self.emit(BodyNode::LoadStr {
                    dest,
                    value: Rc::from(bytes.as_slice()),
                });
                Ok(dest)
            }
            Expr::Vararg | Expr::Call { .. } | Expr::MethodCall { .. } => {
                let source = self.expr_multi(expr)?;
                let dest = self.alloc.val();
                self.emit(BodyNode::MultiGet {
                    dest,
                    source,
                    index: 0,
                });
                Ok(dest)
            }
            Expr::Var(VarRef::Local(local)) => {
                let dest = self.alloc.val();
                let var = self.var_of(*local);
                self.emit(BodyNode::VarLoad { dest, var });
                Ok(dest)
            }
            Expr::Var(VarRef::Upval(upval)) => {
                let dest = self.alloc.val();
                self.emit(BodyNode::UpLoad {
                    dest,
                    upvar: UpVar::new(upval.0),
                });
                Ok(dest)
            }
            Expr::Index(object, key) => {
                let table = self.expr(object)?;
                let key = self.expr(key)?;
                let dest = self.alloc.val();
                self.emit(BodyNode::TabGet { dest, table, key });
                Ok(dest)
            }
            Expr::Function(body) => self.closure(body),
            Expr::Table(items) => self.table_constructor(items),
            Expr::BinOp(op, lhs, rhs) => {
                use ast::BinAstOp as A;
                // `a > b` is `b < a`, `a >= b` is `b <= a`.
                let (op, swap) = match op {
                    A::Add => (BinOpKind::Add, false),
                    A::Sub => (BinOpKind::Sub, false),
                    A::Mul => (BinOpKind::Mul, false),
                    A::Div => (BinOpKind::Div, false),
                    A::Mod => (BinOpKind::Mod, false),
                    A::IDiv => (BinOpKind::IDiv, false),
                    A::Pow => (BinOpKind::Pow, false),
                    A::Concat => (BinOpKind::Concat, false),
                    A::BAnd => (BinOpKind::BAnd, false),
                    A::BOr => (BinOpKind::BOr, false),
                    A::BXor => (BinOpKind::BXor, false),
                    A::Shl => (BinOpKind::Shl, false),
                    A::Shr => (BinOpKind::Shr, false),
                    A::Eq => (BinOpKind::Eq, false),
                    A::Ne => (BinOpKind::Neq, false),
                    A::Lt => (BinOpKind::Lt, false),
                    A::Le => (BinOpKind::Le, false),
                    A::Gt => (BinOpKind::Lt, true),
                    A::Ge => (BinOpKind::Le, true),
                };
                let mut lhs_val = self.expr(lhs)?;
                let mut rhs_val = self.expr(rhs)?;
                if swap {
                    std::mem::swap(&mut lhs_val, &mut rhs_val);
                }
                let dest = self.alloc.val();
                self.emit(BodyNode::BinOp {
                    dest,
                    op,
                    lhs: lhs_val,
                    rhs: rhs_val,
                });
                Ok(dest)
            }
            Expr::UnOp(op, operand) => {
                let op = match op {
                    ast::UnAstOp::Neg => UnOpKind::Unm,
                    ast::UnAstOp::Not => UnOpKind::Not,
                    ast::UnAstOp::Len => UnOpKind::Len,
                    ast::UnAstOp::BNot => UnOpKind::BNot,
                };
                let arg = self.expr(operand)?;
                let dest = self.alloc.val();
                self.emit(BodyNode::UnOp { dest, op, arg });
                Ok(dest)
            }
            Expr::And(lhs, rhs) => self.short_circuit(lhs, rhs, true),
            Expr::Or(lhs, rhs) => self.short_circuit(lhs, rhs, false),
            Expr::Paren(inner) => self.expr(inner),
        }
    }

    /// Short-circuit `and`/`or`: both arms store into one phi that joins at
    /// the continuation block.
    fn short_circuit(&mut self, lhs: &Expr, rhs: &Expr, is_and: bool) -> Result<Val, CompileError> {
        let phi = self.alloc.phi();
        let rhs_label = self.fresh_label();
        let join = self.fresh_label();
        let lhs_val = self.expr(lhs)?;
        self.emit(BodyNode::PhiStore { phi, value: lhs_val });
        let (if_true, if_false) = if is_and { (rhs_label, join) } else { (join, rhs_label) };
        self.seal_to(
            Terminator::Branch {
                cond: lhs_val,
                if_true,
                if_false,
            },
            rhs_label,
        );
        let rhs_val = self.expr(rhs)?;
        self.emit(BodyNode::PhiStore { phi, value: rhs_val });
        self.jump_to(join);
        let dest = self.alloc.val();
        self.emit(BodyNode::PhiLoad { dest, phi });
        Ok(dest)
    }

    fn closure(&mut self, body: &Rc<FunctionBody>) -> Result<Val, CompileError> {
        let ordinal = self.nested.len();
        self.nested.push(body.clone());
        let mut upvals = Vec::with_capacity(body.upvals.len());
        for upval in &body.upvals {
            upvals.push(match upval.source {
                UpvalSource::ParentLocal(local) => ClosureUpval::FromVar(self.var_of(local)),
                UpvalSource::ParentUpval(parent) => ClosureUpval::FromUpval(UpVar::new(parent.0)),
                UpvalSource::Root => return Err(CompileError::RootUpvalueInNestedFunction),
            });
        }
        let dest = self.alloc.val();
        self.emit(BodyNode::Closure {
            dest,
            func: self.id.child(u16::try_from(ordinal).expect("nested ordinal exceeds u16")),
            upvals,
        });
        Ok(dest)
    }

    fn table_constructor(&mut self, items: &[TableItem]) -> Result<Val, CompileError> {
        let array_hint = items
            .iter()
            .filter(|i| matches!(i, TableItem::Positional(_)))
            .count();
        let hash_hint = items.len() - array_hint;
        let dest = self.alloc.val();
        self.emit(BodyNode::TabNew {
            dest,
            array: u32::try_from(array_hint).unwrap_or(u32::MAX),
            hash: u32::try_from(hash_hint).unwrap_or(u32::MAX),
        });
        let mut next_index: i64 = 1;
        for (position, item) in items.iter().enumerate() {
            match item {
                TableItem::Positional(expr) => {
                    let is_last = position + 1 == items.len();
                    if is_last && expr.is_multivalue() {
                        let source = self.expr_multi(expr)?;
                        self.emit(BodyNode::TabStackAppend {
                            table: dest,
                            source,
                            start: next_index,
                        });
                    } else {
                        let value = self.expr(expr)?;
                        self.emit(BodyNode::TabRawSetInt {
                            table: dest,
                            index: next_index,
                            value,
                        });
                        next_index += 1;
                    }
                }
                TableItem::Named { key, value } => {
                    let key = self.expr(key)?;
                    let value = self.expr(value)?;
                    self.emit(BodyNode::TabSet {
                        table: dest,
                        key,
                        value,
                    });
                }
            }
        }
        Ok(dest)
    }

    /// Evaluates an expression for its full value list.
    fn expr_multi(&mut self, expr: &Expr) -> Result<MultiVal, CompileError> {
        match expr {
            Expr::Call { target, args } => {
                let target_val = self.expr(target)?;
                let call_args = self.explist(args)?;
                let dest = self.alloc.multi();
                self.emit(BodyNode::Call {
                    dest,
                    target: target_val,
                    args: call_args,
                });
                Ok(dest)
            }
            Expr::MethodCall { object, name, args } => {
                let (target_val, call_args) = self.method_target(object, name, args)?;
                let dest = self.alloc.multi();
                self.emit(BodyNode::Call {
                    dest,
                    target: target_val,
                    args: call_args,
                });
                Ok(dest)
            }
            Expr::Vararg => {
                if !self.source.is_vararg {
                    return Err(CompileError::VarargOutsideVarargFunction);
                }
                let dest = self.alloc.multi();
                self.emit(BodyNode::Vararg { dest });
                Ok(dest)
            }
            // Callers guard with `is_multivalue`.
            _ => unreachable!("expr_multi on a single-value expression"),
        }
    }

    fn method_target(
        &mut self,
        object: &Expr,
        name: &[u8],
        args: &[Expr],
    ) -> Result<(Val, CallArgs), CompileError> {
        let object_val = self.expr(object)?;
        let name_val = self.alloc.val();
        self.emit(BodyNode::LoadStr {
            dest: name_val,
            value: Rc::from(name),
        });
        let target = self.alloc.val();
        self.emit(BodyNode::TabGet {
            dest: target,
            table: object_val,
            key: name_val,
        });
        let mut call_args = self.explist(args)?;
        call_args.fixed.insert(0, object_val);
        Ok((target, call_args))
    }

    /// Evaluates an expression list into call arguments: every expression
    /// but the last yields one value; a multi-value last expression expands.
    fn explist(&mut self, exprs: &[Expr]) -> Result<CallArgs, CompileError> {
        let mut fixed = Vec::with_capacity(exprs.len());
        for (position, expr) in exprs.iter().enumerate() {
            let is_last = position + 1 == exprs.len();
            if is_last && expr.is_multivalue() {
                let tail = self.expr_multi(expr)?;
                return Ok(CallArgs::with_tail(fixed, tail));
            }
            fixed.push(self.expr(expr)?);
        }
        Ok(CallArgs::fixed(fixed))
    }

    /// Evaluates an expression list adjusted to exactly `want` values,
    /// padding with nil and truncating as assignment does. Every expression
    /// is evaluated regardless.
    fn explist_exact(&mut self, exprs: &[Expr], want: usize) -> Result<Vec<Val>, CompileError> {
        let mut values = Vec::with_capacity(want);
        for (position, expr) in exprs.iter().enumerate() {
            let is_last = position + 1 == exprs.len();
            if is_last && expr.is_multivalue() {
                let source = self.expr_multi(expr)?;
                let mut index = 0u32;
                while values.len() < want {
                    let dest = self.alloc.val();
                    self.emit(BodyNode::MultiGet {
                        dest,
                        source,
                        index,
                    });
                    values.push(dest);
                    index += 1;
                }
                return Ok(values);
            }
            let value = self.expr(expr)?;
            if values.len() < want {
                values.push(value);
            }
        }
        while values.len() < want {
            let dest = self.alloc.val();
            self.emit(BodyNode::LoadNil { dest });
            values.push(dest);
        }
        Ok(values)
    }
}

enum PreparedTarget {
    Var(VarRef),
    Index { object: Val, key: Val },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::build::{self, FnBuilder};

    #[test]
    fn trivial_return_translates_to_one_ret() {
        let mut fb = FnBuilder::main();
        fb.set_vararg(true);
        let chunk = fb.finish(build::block(vec![build::ret(vec![build::int(1)])]));
        let module = translate_chunk(&chunk).unwrap();
        let main = module.main();
        assert!(main.code.validate().is_ok());
        let entry = &main.code.blocks()[0];
        assert!(matches!(entry.term, Terminator::Ret { .. }));
    }

    #[test]
    fn numeric_for_produces_the_three_test_header() {
        let mut fb = FnBuilder::main();
        let i = fb.local("i");
        let chunk = fb.finish(build::block(vec![
            build::numeric_for(i, build::int(1), build::int(10), None, build::block(vec![])),
            build::ret(vec![]),
        ]));
        let module = translate_chunk(&chunk).unwrap();
        let code = &module.main().code;
        assert!(code.validate().is_ok());
        // The sign test plus the two bound tests branch.
        let branches = code
            .blocks()
            .iter()
            .filter(|b| matches!(b.term, Terminator::Branch { .. }))
            .count();
        assert!(branches >= 3, "expected three-test header, got {branches} branches");
    }

    #[test]
    fn tail_position_call_becomes_tcall() {
        let mut fb = FnBuilder::main();
        let chunk = fb.finish(build::block(vec![build::ret(vec![build::call(
            build::global("f"),
            vec![],
        )])]));
        let module = translate_chunk(&chunk).unwrap();
        let has_tcall = module
            .main()
            .code
            .blocks()
            .iter()
            .any(|b| matches!(b.term, Terminator::TCall { .. }));
        assert!(has_tcall);
    }

    #[test]
    fn and_lowering_joins_through_a_phi() {
        let mut fb = FnBuilder::main();
        let chunk = fb.finish(build::block(vec![build::ret(vec![Expr::And(
            Box::new(build::int(1)),
            Box::new(build::int(2)),
        )])]));
        let module = translate_chunk(&chunk).unwrap();
        let phi_stores = module
            .main()
            .code
            .blocks()
            .iter()
            .flat_map(|b| &b.body)
            .filter(|n| matches!(n, BodyNode::PhiStore { .. }))
            .count();
        assert_eq!(phi_stores, 2);
    }

    #[test]
    fn break_outside_a_loop_is_rejected() {
        let fb = FnBuilder::main();
        let chunk = fb.finish(build::block(vec![StatKind::Break]));
        assert_eq!(translate_chunk(&chunk).unwrap_err(), CompileError::BreakOutsideLoop);
    }

    #[test]
    fn undefined_goto_label_is_rejected() {
        let fb = FnBuilder::main();
        let chunk = fb.finish(build::block(vec![StatKind::Goto("missing".into())]));
        assert_eq!(
            translate_chunk(&chunk).unwrap_err(),
            CompileError::UndefinedLabel("missing".to_owned())
        );
    }
}
