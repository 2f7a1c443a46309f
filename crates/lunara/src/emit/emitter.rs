//! IR → compiled function emission.
//!
//! Mechanical per-instruction lowering: every IR node maps onto one
//! register instruction (plus a companion for operations that may dispatch
//! a metamethod), with slots as registers. The emitter also decides each
//! function's arity kind, numbers its resumption points, inserts tick
//! withdrawals, and resolves labels to instruction addresses.

use ahash::AHashMap;
use serde::{Deserialize, Serialize};

use super::{
    compiled::{ClassNameTranslator, CompiledFunction, ConstValue, MAX_FIXED_PARAMS},
    insn::{
        ArgPack, ArgTail, ArithOp, ClosureCapture, CmpOp, CoercionContext, Insn, NumericHint, Reg, ResumePoint,
        UnaryOp, NO_POINT,
    },
};
use crate::{
    analysis::{
        deps::DependencyInfo,
        liveness::{Entry, LivenessInfo},
        slots::SlotAllocInfo,
        typing::{LuaType, TypeInfo},
    },
    ir::{
        entity::{AnyVal, MultiVal},
        node::{BinOpKind, BodyNode, CallArgs, ClosureUpval, NumberContext, Terminator, UnOpKind},
        IRFunc, Label,
    },
    transform::SegmentedCode,
};

/// Tick-accounting placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TickMode {
    /// No accounting instructions.
    None,
    /// One withdrawal per basic-block entry, weighted by the block.
    #[default]
    PerBlock,
}

/// Compiler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompilerSettings {
    /// Node-count ceiling per code segment; zero disables splitting.
    pub segment_limit: usize,
    pub tick_mode: TickMode,
    /// Prefix of the default class-name scheme.
    pub class_prefix: String,
}

impl Default for CompilerSettings {
    fn default() -> Self {
        Self {
            segment_limit: 0,
            tick_mode: TickMode::PerBlock,
            class_prefix: "lua".to_owned(),
        }
    }
}

/// Where a variadic result lives at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MvOrigin {
    Buffer,
    Varargs,
}

/// Emits one function.
///
/// `liveness` and `slots` must have been computed over the flattened
/// segmented code so node indices and labels line up.
#[must_use]
pub fn emit(
    func: &IRFunc,
    segmented: &SegmentedCode,
    types: &TypeInfo,
    liveness: &LivenessInfo,
    slots: &SlotAllocInfo,
    deps: &DependencyInfo,
    settings: &CompilerSettings,
    translator: &dyn ClassNameTranslator,
) -> CompiledFunction {
    let mut emitter = Emitter {
        func,
        types,
        liveness,
        slots,
        deps,
        insns: Vec::new(),
        consts: Vec::new(),
        const_index: AHashMap::new(),
        resume_points: Vec::new(),
        label_addr: AHashMap::new(),
        fixups: Vec::new(),
        mv_origin: AHashMap::new(),
    };

    // Captured parameters are bound as plain values by `invoke`; the
    // prologue reifies them into cells before any code can capture them.
    // Nothing jumps to the entry label, so the prologue runs exactly once.
    for param in &func.params {
        if types.is_reified(*param) {
            let slot = slots.slot(*param);
            emitter.insns.push(Insn::CellNew { dst: slot, src: slot });
        }
    }

    let blocks: Vec<_> = segmented.iter_blocks().collect();
    for (position, block) in blocks.iter().enumerate() {
        let next_label = blocks.get(position + 1).map(|b| b.label);
        emitter.begin_block(block.label, block.weight(), settings.tick_mode);
        for (index, node) in block.body.iter().enumerate() {
            emitter.node(block.label, index, node);
        }
        emitter.terminator(&block.term, next_label);
    }
    emitter.patch_fixups();

    let param_count = u16::try_from(func.params.len()).expect("parameter count exceeds u16");
    let kind = if func.vararg || param_count > MAX_FIXED_PARAMS {
        0
    } else {
        u8::try_from(param_count + 1).expect("arity kind exceeds u8")
    };

    CompiledFunction {
        id: func.id.clone(),
        class_name: translator.class_name(&func.id),
        kind,
        param_count,
        vararg: func.vararg,
        reg_count: slots.slot_count().max(param_count),
        upval_names: dedup_names(&func.upval_names),
        consts: emitter.consts,
        insns: emitter.insns,
        resume_points: emitter.resume_points,
        links: deps.iter().cloned().collect(),
    }
}

/// Deduplicates upvalue field names by suffixing repeats.
fn dedup_names(names: &[std::rc::Rc<str>]) -> Vec<String> {
    let mut seen: AHashMap<&str, usize> = AHashMap::new();
    names
        .iter()
        .map(|name| {
            let count = seen.entry(name.as_ref()).or_insert(0);
            let unique = if *count == 0 {
                name.to_string()
            } else {
                format!("{name}_{count}")
            };
            *count += 1;
            unique
        })
        .collect()
}

struct Emitter<'a> {
    func: &'a IRFunc,
    types: &'a TypeInfo,
    liveness: &'a LivenessInfo,
    slots: &'a SlotAllocInfo,
    deps: &'a DependencyInfo,
    insns: Vec<Insn>,
    consts: Vec<ConstValue>,
    const_index: AHashMap<Vec<u8>, u16>,
    resume_points: Vec<ResumePoint>,
    label_addr: AHashMap<Label, u32>,
    fixups: Vec<(usize, Label)>,
    mv_origin: AHashMap<MultiVal, MvOrigin>,
}

impl Emitter<'_> {
    fn begin_block(&mut self, label: Label, weight: usize, tick_mode: TickMode) {
        let addr = u32::try_from(self.insns.len()).expect("instruction count exceeds u32");
        self.label_addr.insert(label, addr);
        if matches!(tick_mode, TickMode::PerBlock) {
            let live = self
                .liveness
                .block(label)
                .map(|bl| {
                    let (vars, vals) = bl.block_in();
                    self.live_slots_of(vars.iter().copied(), vals.iter().copied())
                })
                .unwrap_or_default();
            let point = self.add_point_after_next(live);
            self.insns.push(Insn::TickWithdraw {
                cost: u32::try_from(weight).expect("block weight exceeds u32"),
                point,
            });
        }
    }

    fn node(&mut self, label: Label, index: usize, node: &BodyNode) {
        match node {
            BodyNode::LoadNil { dest } => {
                let dst = self.slots.slot(*dest);
                self.insns.push(Insn::LoadNil { dst });
            }
            BodyNode::LoadBool { dest, value } => {
                let dst = self.slots.slot(*dest);
                self.insns.push(Insn::LoadBool { dst, value: *value });
            }
            BodyNode::LoadInt { dest, value } => {
                let dst = self.slots.slot(*dest);
                self.insns.push(Insn::LoadInt { dst, value: *value });
            }
            BodyNode::LoadFloat { dest, value } => {
                let dst = self.slots.slot(*dest);
                self.insns.push(Insn::LoadFloat { dst, value: *value });
            }
            BodyNode::LoadStr { dest, value } => {
                let dst = self.slots.slot(*dest);
                let index = self.intern_const(value);
                self.insns.push(Insn::LoadConst { dst, index });
            }
            BodyNode::BinOp { dest, op, lhs, rhs } => self.binop(label, index, *dest, *op, *lhs, *rhs),
            BodyNode::UnOp { dest, op, arg } => self.unop(label, index, *dest, *op, *arg),
            BodyNode::ToNumber { dest, src, context } => {
                let insn = Insn::ToNumber {
                    dst: self.slots.slot(*dest),
                    src: self.slots.slot(*src),
                    context: match context {
                        NumberContext::ForInit => CoercionContext::ForInit,
                        NumberContext::ForLimit => CoercionContext::ForLimit,
                        NumberContext::ForStep => CoercionContext::ForStep,
                    },
                };
                self.insns.push(insn);
            }
            BodyNode::ToNext { dest, base, step } => {
                let insn = Insn::NextIndex {
                    dst: self.slots.slot(*dest),
                    base: self.slots.slot(*base),
                    step: self.slots.slot(*step),
                };
                self.insns.push(insn);
            }
            BodyNode::TabNew { dest, array, hash } => {
                let dst = self.slots.slot(*dest);
                self.insns.push(Insn::NewTable {
                    dst,
                    array: *array,
                    hash: *hash,
                });
            }
            BodyNode::TabGet { dest, table, key } => {
                let point = self.point_for_node(label, index);
                let insn = Insn::GetIndex {
                    dst: self.slots.slot(*dest),
                    obj: self.slots.slot(*table),
                    key: self.slots.slot(*key),
                    point,
                };
                self.insns.push(insn);
                self.insns.push(Insn::ReadResult {
                    dst: self.slots.slot(*dest),
                });
            }
            BodyNode::TabSet { table, key, value } => {
                let point = self.point_for_node(label, index);
                let insn = Insn::SetIndex {
                    obj: self.slots.slot(*table),
                    key: self.slots.slot(*key),
                    src: self.slots.slot(*value),
                    point,
                };
                self.insns.push(insn);
                self.insns.push(Insn::Nop);
            }
            BodyNode::TabRawSetInt { table, index: key, value } => {
                let insn = Insn::RawSetInt {
                    obj: self.slots.slot(*table),
                    index: *key,
                    src: self.slots.slot(*value),
                };
                self.insns.push(insn);
            }
            BodyNode::TabStackAppend { table, source, start } => {
                let obj = self.slots.slot(*table);
                let insn = match self.mv_origin.get(source) {
                    Some(MvOrigin::Varargs) => Insn::AppendVarargs { obj, start: *start },
                    _ => Insn::AppendBuffer { obj, start: *start },
                };
                self.insns.push(insn);
            }
            BodyNode::VarInit { var, value } => {
                let src = self.slots.slot(*value);
                let dst = self.slots.slot(*var);
                if self.types.is_reified(*var) {
                    self.insns.push(Insn::CellNew { dst, src });
                } else if dst != src {
                    self.insns.push(Insn::Copy { dst, src });
                }
            }
            BodyNode::VarLoad { dest, var } => {
                let dst = self.slots.slot(*dest);
                let src = self.slots.slot(*var);
                if self.types.is_reified(*var) {
                    self.insns.push(Insn::CellGet { dst, cell: src });
                } else if dst != src {
                    self.insns.push(Insn::Copy { dst, src });
                }
            }
            BodyNode::VarStore { var, value } => {
                let src = self.slots.slot(*value);
                let dst = self.slots.slot(*var);
                if self.types.is_reified(*var) {
                    self.insns.push(Insn::CellSet { cell: dst, src });
                } else if dst != src {
                    self.insns.push(Insn::Copy { dst, src });
                }
            }
            BodyNode::UpLoad { dest, upvar } => {
                let dst = self.slots.slot(*dest);
                self.insns.push(Insn::UpGet {
                    dst,
                    upval: u16::try_from(upvar.index()).expect("upvalue index exceeds u16"),
                });
            }
            BodyNode::UpStore { upvar, value } => {
                let src = self.slots.slot(*value);
                self.insns.push(Insn::UpSet {
                    upval: u16::try_from(upvar.index()).expect("upvalue index exceeds u16"),
                    src,
                });
            }
            BodyNode::PhiStore { phi, value } => {
                let dst = self.slots.slot(*phi);
                let src = self.slots.slot(*value);
                if dst != src {
                    self.insns.push(Insn::Copy { dst, src });
                }
            }
            BodyNode::PhiLoad { dest, phi } => {
                let dst = self.slots.slot(*dest);
                let src = self.slots.slot(*phi);
                if dst != src {
                    self.insns.push(Insn::Copy { dst, src });
                }
            }
            BodyNode::MultiGet { dest, source, index: mv_index } => {
                let dst = self.slots.slot(*dest);
                let mv_index = u16::try_from(*mv_index).expect("multivalue index exceeds u16");
                let insn = match self.mv_origin.get(source) {
                    Some(MvOrigin::Varargs) => Insn::ReadVarargs { dst, index: mv_index },
                    _ => Insn::ReadBuffer { dst, index: mv_index },
                };
                self.insns.push(insn);
            }
            BodyNode::Call { dest, target, args } => {
                self.mv_origin.insert(*dest, MvOrigin::Buffer);
                let target = self.slots.slot(*target);
                let args = self.arg_pack(args);
                let point = self.point_for_node(label, index);
                self.insns.push(Insn::Call { target, args, point });
            }
            BodyNode::Vararg { dest } => {
                // Varargs are pinned in the frame; reads resolve directly.
                self.mv_origin.insert(*dest, MvOrigin::Varargs);
            }
            BodyNode::Closure { dest, func, upvals } => {
                let dst = self.slots.slot(*dest);
                let link = self
                    .deps
                    .index_of(func)
                    .expect("closure target is in the dependency set");
                let captures: Vec<ClosureCapture> = upvals
                    .iter()
                    .map(|upval| match upval {
                        ClosureUpval::FromVar(var) => ClosureCapture::FromReg(self.slots.slot(*var)),
                        ClosureUpval::FromUpval(uv) => ClosureCapture::FromUpval(
                            u16::try_from(uv.index()).expect("upvalue index exceeds u16"),
                        ),
                    })
                    .collect();
                self.insns.push(Insn::MakeClosure {
                    dst,
                    link: u16::try_from(link).expect("link table exceeds u16"),
                    upvals: captures.into_boxed_slice(),
                });
            }
            BodyNode::Line { line } => self.insns.push(Insn::Line { line: *line }),
            BodyNode::CpuWithdraw { cost } => {
                let live = self.node_live_out(label, index);
                let point = self.add_point_after_next(live);
                self.insns.push(Insn::TickWithdraw { cost: *cost, point });
            }
        }
    }

    fn binop(&mut self, label: Label, index: usize, dest: crate::ir::Val, op: BinOpKind, lhs: crate::ir::Val, rhs: crate::ir::Val) {
        let dst = self.slots.slot(dest);
        let lhs_ty = self.types.type_of(lhs);
        let rhs_ty = self.types.type_of(rhs);
        let lhs = self.slots.slot(lhs);
        let rhs = self.slots.slot(rhs);

        if op.is_comparison() {
            let (cmp, negate) = match op {
                BinOpKind::Eq => (CmpOp::Eq, false),
                BinOpKind::Neq => (CmpOp::Eq, true),
                BinOpKind::Lt => (CmpOp::Lt, false),
                BinOpKind::Le => (CmpOp::Le, false),
                _ => unreachable!("comparison kinds are exhaustive"),
            };
            // A metamethod is only reachable for operands that can carry
            // metatables; primitives compare directly.
            let primitive = |t: LuaType| {
                matches!(
                    t,
                    LuaType::Nil | LuaType::Boolean | LuaType::Integer | LuaType::Float | LuaType::Number | LuaType::String
                )
            };
            let paired = !(primitive(lhs_ty) && primitive(rhs_ty));
            let point = if paired { self.point_for_node(label, index) } else { NO_POINT };
            self.insns.push(Insn::Cmp {
                dst,
                op: cmp,
                negate,
                lhs,
                rhs,
                paired,
                point,
            });
            if paired {
                self.insns.push(Insn::ReadResultTest { dst, negate });
            }
            return;
        }

        if op == BinOpKind::Concat {
            let stringish =
                |t: LuaType| t == LuaType::String || t.subtypes_number();
            let paired = !(stringish(lhs_ty) && stringish(rhs_ty));
            let point = if paired { self.point_for_node(label, index) } else { NO_POINT };
            self.insns.push(Insn::Concat {
                dst,
                lhs,
                rhs,
                paired,
                point,
            });
            if paired {
                self.insns.push(Insn::ReadResult { dst });
            }
            return;
        }

        let arith = match op {
            BinOpKind::Add => ArithOp::Add,
            BinOpKind::Sub => ArithOp::Sub,
            BinOpKind::Mul => ArithOp::Mul,
            BinOpKind::Div => ArithOp::Div,
            BinOpKind::Mod => ArithOp::Mod,
            BinOpKind::IDiv => ArithOp::IDiv,
            BinOpKind::Pow => ArithOp::Pow,
            BinOpKind::BAnd => ArithOp::BAnd,
            BinOpKind::BOr => ArithOp::BOr,
            BinOpKind::BXor => ArithOp::BXor,
            BinOpKind::Shl => ArithOp::Shl,
            BinOpKind::Shr => ArithOp::Shr,
            _ => unreachable!("remaining kinds are arithmetic"),
        };
        // The helper variant is selected by the type analysis.
        let hint = if lhs_ty == LuaType::Integer && rhs_ty == LuaType::Integer {
            NumericHint::IntInt
        } else if lhs_ty.subtypes_number() && rhs_ty.subtypes_number() {
            NumericHint::Numeric
        } else {
            NumericHint::Dynamic
        };
        let point = if hint.is_paired() { self.point_for_node(label, index) } else { NO_POINT };
        self.insns.push(Insn::Arith {
            dst,
            op: arith,
            lhs,
            rhs,
            hint,
            point,
        });
        if hint.is_paired() {
            self.insns.push(Insn::ReadResult { dst });
        }
    }

    fn unop(&mut self, label: Label, index: usize, dest: crate::ir::Val, op: UnOpKind, arg: crate::ir::Val) {
        let dst = self.slots.slot(dest);
        let arg_ty = self.types.type_of(arg);
        let src = self.slots.slot(arg);
        match op {
            UnOpKind::Not => {
                self.insns.push(Insn::Unary {
                    dst,
                    op: UnaryOp::Not,
                    src,
                    paired: false,
                    point: NO_POINT,
                });
            }
            UnOpKind::Len => {
                let paired = arg_ty != LuaType::String;
                let point = if paired { self.point_for_node(label, index) } else { NO_POINT };
                self.insns.push(Insn::Len {
                    dst,
                    src,
                    paired,
                    point,
                });
                if paired {
                    self.insns.push(Insn::ReadResult { dst });
                }
            }
            UnOpKind::Unm | UnOpKind::BNot => {
                let unary = if op == UnOpKind::Unm { UnaryOp::Neg } else { UnaryOp::BNot };
                let paired = !arg_ty.subtypes_number();
                let point = if paired { self.point_for_node(label, index) } else { NO_POINT };
                self.insns.push(Insn::Unary {
                    dst,
                    op: unary,
                    src,
                    paired,
                    point,
                });
                if paired {
                    self.insns.push(Insn::ReadResult { dst });
                }
            }
        }
    }

    fn terminator(&mut self, term: &Terminator, next_label: Option<Label>) {
        match term {
            Terminator::ToNext { target } => {
                if Some(*target) != next_label {
                    self.push_jump(*target);
                }
            }
            Terminator::Branch { cond, if_true, if_false } => {
                let cond = self.slots.slot(*cond);
                self.fixups.push((self.insns.len(), *if_true));
                self.insns.push(Insn::BranchIf { cond, target: 0 });
                if Some(*if_false) != next_label {
                    self.push_jump(*if_false);
                }
            }
            Terminator::Ret { args } => {
                let args = self.arg_pack(args);
                self.insns.push(Insn::Return { args });
            }
            Terminator::TCall { target, args } => {
                let target = self.slots.slot(*target);
                let args = self.arg_pack(args);
                self.insns.push(Insn::TailCall { target, args });
            }
        }
    }

    fn push_jump(&mut self, target: Label) {
        self.fixups.push((self.insns.len(), target));
        self.insns.push(Insn::Jump { target: 0 });
    }

    fn patch_fixups(&mut self) {
        for (index, label) in &self.fixups {
            let addr = *self
                .label_addr
                .get(label)
                .unwrap_or_else(|| panic!("unresolved label {label}"));
            match &mut self.insns[*index] {
                Insn::Jump { target } | Insn::BranchIf { target, .. } => *target = addr,
                other => panic!("fixup points at a non-jump instruction {other:?}"),
            }
        }
    }

    fn arg_pack(&mut self, args: &CallArgs) -> ArgPack {
        let regs: Vec<Reg> = args.fixed.iter().map(|v| self.slots.slot(*v)).collect();
        let tail = match args.tail {
            None => ArgTail::None,
            Some(mv) => match self.mv_origin.get(&mv) {
                Some(MvOrigin::Varargs) => ArgTail::Varargs,
                _ => ArgTail::Buffer,
            },
        };
        ArgPack {
            regs: regs.into_boxed_slice(),
            tail,
        }
    }

    fn intern_const(&mut self, bytes: &[u8]) -> u16 {
        if let Some(index) = self.const_index.get(bytes) {
            return *index;
        }
        let index = u16::try_from(self.consts.len()).expect("constant pool exceeds u16");
        self.consts.push(ConstValue::Bytes(bytes.to_vec()));
        self.const_index.insert(bytes.to_vec(), index);
        index
    }

    /// Registers a resumption point continuing at the next instruction
    /// after the one about to be pushed.
    fn add_point_after_next(&mut self, live_slots: Vec<Reg>) -> u16 {
        let point = u16::try_from(self.resume_points.len()).expect("resume point count exceeds u16");
        let pc = u32::try_from(self.insns.len() + 1).expect("instruction count exceeds u32");
        self.resume_points.push(ResumePoint {
            pc,
            live_slots: live_slots.into_boxed_slice(),
        });
        point
    }

    /// A resumption point for the suspendable node at `(label, index)`,
    /// saving the registers live out of it.
    fn point_for_node(&mut self, label: Label, index: usize) -> u16 {
        let live = self.node_live_out(label, index);
        self.add_point_after_next(live)
    }

    fn node_live_out(&self, label: Label, index: usize) -> Vec<Reg> {
        self.liveness
            .node_entry(label, index)
            .map(|entry| self.live_entry_slots(entry))
            .unwrap_or_default()
    }

    fn live_entry_slots(&self, entry: &Entry) -> Vec<Reg> {
        self.live_slots_of(entry.out_var.iter().copied(), entry.out_val.iter().copied())
    }

    fn live_slots_of(
        &self,
        vars: impl Iterator<Item = crate::ir::Var>,
        vals: impl Iterator<Item = AnyVal>,
    ) -> Vec<Reg> {
        let mut slots: Vec<Reg> = vars
            .filter_map(|v| self.slots.slot_opt(v))
            .chain(vals.filter_map(|v| match v {
                AnyVal::Val(v) => self.slots.slot_opt(v),
                AnyVal::Phi(p) => self.slots.slot_opt(p),
                AnyVal::Multi(_) => None,
            }))
            .collect();
        slots.sort_unstable();
        slots.dedup();
        slots
    }
}
