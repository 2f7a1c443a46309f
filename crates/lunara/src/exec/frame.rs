//! The runtime frame: invoke, run, suspend and resume for compiled code.
//!
//! A frame owns a register window over one compiled function. Its run loop
//! never calls Lua code natively: calls, tail calls and metamethod
//! dispatches go through the return buffer to the executor, with the frame
//! saving its live registers and a resumption point first. Resuming reads
//! the point number, restores the registers, and re-enters the loop at the
//! recorded instruction.

use std::rc::Rc;

use crate::{
    emit::{
        insn::{ArgPack, ArgTail, Insn, NumericHint, Reg, UnaryOp},
        loader::LuaClosure,
    },
    error::{LuaError, RunResult},
    exec::{
        dispatch::{self, RawResult},
        state::ExecContext,
    },
    tracer::TraceEvent,
    value::{Cell, LuaValue},
};

/// One register: a plain value, or the cell of a reified variable.
#[derive(Debug, Clone, Default)]
pub enum Slot {
    #[default]
    Nil,
    Value(LuaValue),
    Cell(Cell),
}

impl Slot {
    fn value(&self) -> LuaValue {
        match self {
            Self::Nil => LuaValue::Nil,
            Self::Value(v) => v.clone(),
            // A cell in value position would be a compiler bug; registers
            // are read as values only where the emitter placed values.
            Self::Cell(_) => LuaValue::Nil,
        }
    }
}

/// The saved state of a suspended frame: the varargs (for vararg
/// functions), the register window, and the resumption point — exactly the
/// layout the emitter's save sites write and its resume entry reads.
#[derive(Debug)]
pub struct SavedState {
    pub varargs: Option<Box<[LuaValue]>>,
    pub slots: Box<[Slot]>,
    pub point: u16,
}

/// A suspended frame, ready to resume.
#[derive(Debug)]
pub struct SavedFrame {
    pub closure: Rc<LuaClosure>,
    pub state: SavedState,
    /// Source line at the suspension point; `0` when unknown. Feeds
    /// tracebacks and `error` position prefixes.
    pub line: u32,
}

impl SavedFrame {
    /// The resume entry: rebuilds the live frame at the recorded point.
    ///
    /// # Errors
    /// Fails with `NonSuspendableFunction` if the compiled function has no
    /// resumption points (a stale or mismatched artifact).
    pub fn resume(self) -> RunResult<LuaFrame> {
        let mut frame = LuaFrame::resume(self.closure, self.state)?;
        frame.line = self.line;
        Ok(frame)
    }
}

/// How a frame left its run loop.
#[derive(Debug)]
pub enum FrameOut {
    /// A return or tail call: the buffer holds the results, or a pending
    /// call request to honour.
    Return,
    /// A call: the buffer holds the request; the frame saved itself.
    Call(SavedFrame),
    /// The scheduler asked for a pause; the frame saved itself.
    Pause(SavedFrame),
}

/// A live frame executing compiled code.
#[derive(Debug)]
pub struct LuaFrame {
    closure: Rc<LuaClosure>,
    registers: Vec<Slot>,
    varargs: Vec<LuaValue>,
    pc: usize,
    /// Most recent line annotation, for tracebacks.
    line: u32,
}

impl LuaFrame {
    /// The invoke entry: binds arguments into registers according to the
    /// function's arity kind and pins the varargs.
    #[must_use]
    pub fn invoke(closure: Rc<LuaClosure>, mut args: Vec<LuaValue>) -> Self {
        let compiled = closure.func.compiled.clone();
        let reg_count = usize::from(compiled.reg_count);
        let param_count = usize::from(compiled.param_count);
        let mut registers = vec![Slot::Nil; reg_count];
        let varargs = if args.len() > param_count {
            args.split_off(param_count)
        } else {
            Vec::new()
        };
        for (index, value) in args.into_iter().enumerate() {
            if index < reg_count {
                registers[index] = Slot::Value(value);
            }
        }
        Self {
            closure,
            registers,
            varargs: if compiled.vararg { varargs } else { Vec::new() },
            pc: 0,
            line: 0,
        }
    }

    /// The resume entry: reads the resumption point, restores the
    /// registers, and positions the loop at the recorded instruction.
    pub fn resume(closure: Rc<LuaClosure>, state: SavedState) -> RunResult<LuaFrame> {
        let compiled = closure.func.compiled.clone();
        if !compiled.suspendable() {
            return Err(LuaError::non_suspendable());
        }
        let point = compiled
            .resume_points
            .get(usize::from(state.point))
            .ok_or_else(|| LuaError::non_suspendable())?;
        let mut registers: Vec<Slot> = state.slots.into_vec();
        registers.resize(usize::from(compiled.reg_count), Slot::Nil);
        Ok(Self {
            closure,
            registers,
            varargs: state.varargs.map(Vec::from).unwrap_or_default(),
            pc: point.pc as usize,
            line: 0,
        })
    }

    /// Saves the frame at `point`, keeping only the registers the point
    /// declares live.
    fn save(&mut self, point: u16) -> SavedFrame {
        let compiled = &self.closure.func.compiled;
        let live = &compiled.resume_points[usize::from(point)].live_slots;
        let mut slots = vec![Slot::Nil; self.registers.len()];
        for &slot in live.iter() {
            slots[usize::from(slot)] = std::mem::take(&mut self.registers[usize::from(slot)]);
        }
        SavedFrame {
            closure: self.closure.clone(),
            state: SavedState {
                varargs: if compiled.vararg {
                    Some(std::mem::take(&mut self.varargs).into_boxed_slice())
                } else {
                    None
                },
                slots: slots.into_boxed_slice(),
                point,
            },
            line: self.line,
        }
    }

    /// Runs until the frame returns, requests a call, or pauses.
    pub fn run(mut self, ctx: &mut ExecContext<'_>) -> RunResult<FrameOut> {
        match self.run_inner(ctx) {
            Ok(out) => Ok(out),
            Err(mut err) => {
                err.push_frame(self.closure.name(), (self.line > 0).then_some(self.line));
                Err(err)
            }
        }
    }

    fn run_inner(&mut self, ctx: &mut ExecContext<'_>) -> RunResult<FrameOut> {
        let func = self.closure.func.clone();
        let insns = &func.compiled.insns;
        loop {
            let insn = &insns[self.pc];
            self.pc += 1;
            match insn {
                Insn::LoadNil { dst } => self.set(*dst, LuaValue::Nil),
                Insn::LoadBool { dst, value } => self.set(*dst, LuaValue::Boolean(*value)),
                Insn::LoadInt { dst, value } => self.set(*dst, LuaValue::Integer(*value)),
                Insn::LoadFloat { dst, value } => self.set(*dst, LuaValue::Float(*value)),
                Insn::LoadConst { dst, index } => {
                    let value = func.consts[usize::from(*index)].clone();
                    self.set(*dst, value);
                }
                Insn::Copy { dst, src } => {
                    let slot = self.registers[usize::from(*src)].clone();
                    self.registers[usize::from(*dst)] = slot;
                }
                Insn::CellNew { dst, src } => {
                    let value = self.get(*src);
                    self.registers[usize::from(*dst)] = Slot::Cell(Cell::new(value));
                }
                Insn::CellGet { dst, cell } => {
                    let value = self.cell(*cell)?.get();
                    self.set(*dst, value);
                }
                Insn::CellSet { cell, src } => {
                    let value = self.get(*src);
                    self.cell(*cell)?.set(value);
                }
                Insn::UpGet { dst, upval } => {
                    let value = self.closure.upval(usize::from(*upval)).get();
                    self.set(*dst, value);
                }
                Insn::UpSet { upval, src } => {
                    let value = self.get(*src);
                    self.closure.upval(usize::from(*upval)).set(value);
                }
                Insn::MakeClosure { dst, link, upvals } => {
                    let target = func.links[usize::from(*link)].clone();
                    let mut cells = Vec::with_capacity(upvals.len());
                    for capture in upvals.iter() {
                        cells.push(match capture {
                            crate::emit::insn::ClosureCapture::FromReg(reg) => self.cell(*reg)?,
                            crate::emit::insn::ClosureCapture::FromUpval(index) => {
                                self.closure.upval(usize::from(*index)).clone()
                            }
                        });
                    }
                    let instance = target.instantiate(cells.into_boxed_slice());
                    self.set(*dst, LuaValue::Function(crate::value::Callable::Closure(instance)));
                }
                Insn::Arith { dst, op, lhs, rhs, hint, point } => {
                    let a = self.get(*lhs);
                    let b = self.get(*rhs);
                    match dispatch::arith(ctx.state, *op, &a, &b)? {
                        RawResult::Value(value) => {
                            self.set(*dst, value);
                            if hint.is_paired() {
                                self.pc += 1;
                            }
                        }
                        RawResult::Meta { target, args } => {
                            debug_assert!(matches!(hint, NumericHint::Dynamic));
                            return self.suspend_for_call(ctx, *point, target, args);
                        }
                    }
                }
                Insn::Unary { dst, op, src, paired, point } => {
                    let value = self.get(*src);
                    let result = match op {
                        UnaryOp::Not => RawResult::Value(LuaValue::Boolean(!value.truthy())),
                        UnaryOp::Neg => dispatch::negate(ctx.state, &value)?,
                        UnaryOp::BNot => dispatch::bitwise_not(ctx.state, &value)?,
                    };
                    match result {
                        RawResult::Value(value) => {
                            self.set(*dst, value);
                            if *paired {
                                self.pc += 1;
                            }
                        }
                        RawResult::Meta { target, args } => {
                            return self.suspend_for_call(ctx, *point, target, args);
                        }
                    }
                }
                Insn::Concat { dst, lhs, rhs, paired, point } => {
                    let a = self.get(*lhs);
                    let b = self.get(*rhs);
                    match dispatch::concat(ctx.state, &a, &b)? {
                        RawResult::Value(value) => {
                            self.set(*dst, value);
                            if *paired {
                                self.pc += 1;
                            }
                        }
                        RawResult::Meta { target, args } => {
                            return self.suspend_for_call(ctx, *point, target, args);
                        }
                    }
                }
                Insn::Len { dst, src, paired, point } => {
                    let value = self.get(*src);
                    match dispatch::length(ctx.state, &value)? {
                        RawResult::Value(value) => {
                            self.set(*dst, value);
                            if *paired {
                                self.pc += 1;
                            }
                        }
                        RawResult::Meta { target, args } => {
                            return self.suspend_for_call(ctx, *point, target, args);
                        }
                    }
                }
                Insn::Cmp { dst, op, negate, lhs, rhs, paired, point } => {
                    let a = self.get(*lhs);
                    let b = self.get(*rhs);
                    match dispatch::compare(ctx.state, *op, &a, &b)? {
                        RawResult::Value(value) => {
                            let truth = value.truthy() != *negate;
                            self.set(*dst, LuaValue::Boolean(truth));
                            if *paired {
                                self.pc += 1;
                            }
                        }
                        RawResult::Meta { target, args } => {
                            return self.suspend_for_call(ctx, *point, target, args);
                        }
                    }
                }
                Insn::ToNumber { dst, src, context } => {
                    let value = self.get(*src);
                    let Some(coerced) = crate::number::coerce_to_number(&value) else {
                        return Err(LuaError::conversion(format!(
                            "{} must be a number",
                            context.describe()
                        )));
                    };
                    if matches!(context, crate::emit::insn::CoercionContext::ForStep)
                        && coerced.raw_eq(&LuaValue::Integer(0))
                    {
                        return Err(LuaError::conversion("'for' step is zero"));
                    }
                    self.set(*dst, coerced);
                }
                Insn::NextIndex { dst, base, step } => {
                    let next = match (self.get(*base), self.get(*step)) {
                        (LuaValue::Integer(a), LuaValue::Integer(b)) => LuaValue::Integer(a.wrapping_add(b)),
                        (a, b) => {
                            let a = crate::number::coerce_to_float(&a).unwrap_or(f64::NAN);
                            let b = crate::number::coerce_to_float(&b).unwrap_or(f64::NAN);
                            LuaValue::Float(a + b)
                        }
                    };
                    self.set(*dst, next);
                }
                Insn::NewTable { dst, array, hash } => {
                    let table = ctx
                        .state
                        .table_factory
                        .new_table(*array as usize, *hash as usize);
                    self.set(*dst, LuaValue::Table(table));
                }
                Insn::GetIndex { dst, obj, key, point } => {
                    let obj = self.get(*obj);
                    let key = self.get(*key);
                    match dispatch::index_get(ctx.state, &obj, &key)? {
                        RawResult::Value(value) => {
                            self.set(*dst, value);
                            self.pc += 1;
                        }
                        RawResult::Meta { target, args } => {
                            return self.suspend_for_call(ctx, *point, target, args);
                        }
                    }
                }
                Insn::SetIndex { obj, key, src, point } => {
                    let obj = self.get(*obj);
                    let key = self.get(*key);
                    let value = self.get(*src);
                    match dispatch::index_set(ctx.state, &obj, &key, &value)? {
                        None => self.pc += 1,
                        Some((target, args)) => {
                            return self.suspend_for_call(ctx, *point, target, args);
                        }
                    }
                }
                Insn::RawSetInt { obj, index, src } => {
                    let value = self.get(*src);
                    match self.get(*obj) {
                        LuaValue::Table(table) => table.raw_set_int(*index, value),
                        other => {
                            return Err(LuaError::illegal_op(format!(
                                "attempt to index a {} value",
                                other.type_name()
                            )));
                        }
                    }
                }
                Insn::AppendBuffer { obj, start } => {
                    let values = ctx.buffer.get_as_array();
                    match self.get(*obj) {
                        LuaValue::Table(table) => table.append_from(*start, values),
                        other => {
                            return Err(LuaError::illegal_op(format!(
                                "attempt to index a {} value",
                                other.type_name()
                            )));
                        }
                    }
                }
                Insn::AppendVarargs { obj, start } => {
                    let values = self.varargs.clone();
                    match self.get(*obj) {
                        LuaValue::Table(table) => table.append_from(*start, values),
                        other => {
                            return Err(LuaError::illegal_op(format!(
                                "attempt to index a {} value",
                                other.type_name()
                            )));
                        }
                    }
                }
                Insn::ReadBuffer { dst, index } => {
                    let value = ctx.buffer.get(usize::from(*index));
                    self.set(*dst, value);
                }
                Insn::ReadVarargs { dst, index } => {
                    let value = self.varargs.get(usize::from(*index)).cloned().unwrap_or(LuaValue::Nil);
                    self.set(*dst, value);
                }
                Insn::ReadResult { dst } => {
                    let value = ctx.buffer.get(0);
                    self.set(*dst, value);
                }
                Insn::ReadResultTest { dst, negate } => {
                    let truth = ctx.buffer.get(0).truthy() != *negate;
                    self.set(*dst, LuaValue::Boolean(truth));
                }
                Insn::Call { target, args, point } => {
                    let target = self.get(*target);
                    let args = self.collect_args(ctx, args);
                    let saved = self.save(*point);
                    ctx.tracer.trace(TraceEvent::Suspend {
                        function: self.closure.name().to_owned(),
                        point: u32::from(*point),
                    });
                    ctx.buffer.set_to_call(target, args);
                    return Ok(FrameOut::Call(saved));
                }
                Insn::TailCall { target, args } => {
                    let target = self.get(*target);
                    let args = self.collect_args(ctx, args);
                    ctx.tracer.trace(TraceEvent::TailCall);
                    ctx.buffer.set_to_call(target, args);
                    return Ok(FrameOut::Return);
                }
                Insn::Return { args } => {
                    let args = self.collect_args(ctx, args);
                    ctx.buffer.set_to(args);
                    return Ok(FrameOut::Return);
                }
                Insn::Jump { target } => self.pc = *target as usize,
                Insn::BranchIf { cond, target } => {
                    if self.get(*cond).truthy() {
                        self.pc = *target as usize;
                    }
                }
                Insn::Line { line } => self.line = *line,
                Insn::TickWithdraw { cost, point } => {
                    ctx.scheduler.register_ticks(*cost);
                    if ctx.scheduler.should_pause() {
                        let saved = self.save(*point);
                        ctx.tracer.trace(TraceEvent::Pause);
                        return Ok(FrameOut::Pause(saved));
                    }
                }
                Insn::Nop => {}
            }
        }
    }

    /// Saves at `point` and turns a metamethod dispatch into a pending call.
    fn suspend_for_call(
        &mut self,
        ctx: &mut ExecContext<'_>,
        point: u16,
        target: LuaValue,
        args: Vec<LuaValue>,
    ) -> RunResult<FrameOut> {
        let saved = self.save(point);
        ctx.tracer.trace(TraceEvent::Suspend {
            function: self.closure.name().to_owned(),
            point: u32::from(point),
        });
        ctx.buffer.set_to_call(target, args);
        Ok(FrameOut::Call(saved))
    }

    fn collect_args(&self, ctx: &ExecContext<'_>, pack: &ArgPack) -> Vec<LuaValue> {
        let mut args: Vec<LuaValue> = pack.regs.iter().map(|r| self.get(*r)).collect();
        match pack.tail {
            ArgTail::None => {}
            ArgTail::Buffer => args.extend(ctx.buffer.as_slice().iter().cloned()),
            ArgTail::Varargs => args.extend(self.varargs.iter().cloned()),
        }
        args
    }

    fn get(&self, reg: Reg) -> LuaValue {
        self.registers[usize::from(reg)].value()
    }

    fn set(&mut self, reg: Reg, value: LuaValue) {
        self.registers[usize::from(reg)] = Slot::Value(value);
    }

    fn cell(&self, reg: Reg) -> RunResult<Cell> {
        match &self.registers[usize::from(reg)] {
            Slot::Cell(cell) => Ok(cell.clone()),
            other => Err(LuaError::illegal_op(format!(
                "variable cell expected in register, found {other:?}"
            ))),
        }
    }

    /// Traceback name of the running function.
    #[must_use]
    pub fn name(&self) -> &str {
        self.closure.name()
    }
}
