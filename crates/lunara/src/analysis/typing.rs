//! Type propagation by abstract interpretation.
//!
//! Types flow forward over the IR until a fixed point. The interesting part
//! of the lattice is numeric: `Integer` and `Float` sit under `Number`,
//! everything joins to `Any`. Results of calls, table reads and variadic
//! extraction are `Dynamic` — runtime-determined, treated as `Any` by every
//! consumer but kept distinct for diagnostics.

use ahash::{AHashMap, AHashSet};
use strum::Display;

use crate::ir::{
    entity::{AnyVal, PhiVal, Var},
    node::{BinOpKind, BodyNode, ClosureUpval, UnOpKind},
    IRFunc,
};

/// An inferred Lua type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "lowercase")]
pub enum LuaType {
    Any,
    /// Runtime-determined: a call result, table read or vararg slot.
    Dynamic,
    Nil,
    Boolean,
    Number,
    Integer,
    Float,
    String,
    Table,
    Function,
    Thread,
    Userdata,
}

impl LuaType {
    /// Whether the type is a subtype of `number`.
    #[must_use]
    pub fn subtypes_number(self) -> bool {
        matches!(self, Self::Integer | Self::Float | Self::Number)
    }

    /// The least upper bound of two types.
    #[must_use]
    pub fn join(self, other: Self) -> Self {
        if self == other {
            return self;
        }
        if self.subtypes_number() && other.subtypes_number() {
            return Self::Number;
        }
        Self::Any
    }
}

/// Function-level read-only typing results.
#[derive(Debug, Default)]
pub struct TypeInfo {
    vals: AHashMap<AnyVal, LuaType>,
    reified: AHashSet<Var>,
}

impl TypeInfo {
    /// The inferred type of a value-like entity; unknown entities are `Any`.
    #[must_use]
    pub fn type_of(&self, val: impl Into<AnyVal>) -> LuaType {
        self.vals.get(&val.into()).copied().unwrap_or(LuaType::Any)
    }

    /// Whether the variable is reified (captured into an upvalue cell).
    #[must_use]
    pub fn is_reified(&self, var: Var) -> bool {
        self.reified.contains(&var)
    }

    #[must_use]
    pub fn reified_vars(&self) -> &AHashSet<Var> {
        &self.reified
    }
}

/// Infers types for one function.
#[must_use]
pub fn infer(func: &IRFunc) -> TypeInfo {
    let mut info = TypeInfo::default();
    // Reification: a variable captured by any closure-creating node.
    for block in func.code.blocks() {
        for node in &block.body {
            if let BodyNode::Closure { upvals, .. } = node {
                for upval in upvals {
                    if let ClosureUpval::FromVar(var) = upval {
                        info.reified.insert(*var);
                    }
                }
            }
        }
    }

    // Variable types join over every store; parameters are unknown.
    let mut var_types: AHashMap<Var, LuaType> = func.params.iter().map(|p| (*p, LuaType::Any)).collect();
    let mut phi_types: AHashMap<PhiVal, LuaType> = AHashMap::new();

    loop {
        let mut changed = false;
        for block in func.code.blocks() {
            for node in &block.body {
                step(node, &mut info, &mut var_types, &mut phi_types, &mut changed);
            }
        }
        if !changed {
            break;
        }
    }
    info
}

fn step(
    node: &BodyNode,
    info: &mut TypeInfo,
    var_types: &mut AHashMap<Var, LuaType>,
    phi_types: &mut AHashMap<PhiVal, LuaType>,
    changed: &mut bool,
) {
    let assign = |info: &mut TypeInfo, key: AnyVal, ty: LuaType, changed: &mut bool| {
        match info.vals.get(&key) {
            Some(old) if *old == ty => {}
            _ => {
                info.vals.insert(key, ty);
                *changed = true;
            }
        }
    };

    match node {
        BodyNode::LoadNil { dest } => assign(info, (*dest).into(), LuaType::Nil, changed),
        BodyNode::LoadBool { dest, .. } => assign(info, (*dest).into(), LuaType::Boolean, changed),
        BodyNode::LoadInt { dest, .. } => assign(info, (*dest).into(), LuaType::Integer, changed),
        BodyNode::LoadFloat { dest, .. } => assign(info, (*dest).into(), LuaType::Float, changed),
        BodyNode::LoadStr { dest, .. } => assign(info, (*dest).into(), LuaType::String, changed),
        BodyNode::BinOp { dest, op, lhs, rhs } => {
            let ty = binop_type(*op, info.type_of(*lhs), info.type_of(*rhs));
            assign(info, (*dest).into(), ty, changed);
        }
        BodyNode::UnOp { dest, op, arg } => {
            let ty = unop_type(*op, info.type_of(*arg));
            assign(info, (*dest).into(), ty, changed);
        }
        BodyNode::ToNumber { dest, .. } => assign(info, (*dest).into(), LuaType::Number, changed),
        BodyNode::ToNext { dest, base, step } => {
            let ty = binop_type(BinOpKind::Add, info.type_of(*base), info.type_of(*step));
            assign(info, (*dest).into(), ty, changed);
        }
        BodyNode::TabNew { dest, .. } => assign(info, (*dest).into(), LuaType::Table, changed),
        BodyNode::TabGet { dest, .. } => assign(info, (*dest).into(), LuaType::Dynamic, changed),
        BodyNode::VarLoad { dest, var } => {
            // Reified variables are opaque: any capturing closure may write
            // them between any two points.
            let ty = if info.reified.contains(var) {
                LuaType::Any
            } else {
                var_types.get(var).copied().unwrap_or(LuaType::Any)
            };
            assign(info, (*dest).into(), ty, changed);
        }
        BodyNode::VarInit { var, value } | BodyNode::VarStore { var, value } => {
            let stored = info.type_of(*value);
            let joined = match var_types.get(var) {
                Some(old) => old.join(stored),
                None => stored,
            };
            if var_types.get(var) != Some(&joined) {
                var_types.insert(*var, joined);
                *changed = true;
            }
        }
        BodyNode::UpLoad { dest, .. } => assign(info, (*dest).into(), LuaType::Any, changed),
        BodyNode::UpStore { .. } => {}
        BodyNode::PhiStore { phi, value } => {
            let stored = info.type_of(*value);
            let joined = match phi_types.get(phi) {
                Some(old) => old.join(stored),
                None => stored,
            };
            if phi_types.get(phi) != Some(&joined) {
                phi_types.insert(*phi, joined);
                *changed = true;
            }
            assign(info, (*phi).into(), joined, changed);
        }
        BodyNode::PhiLoad { dest, phi } => {
            let ty = phi_types.get(phi).copied().unwrap_or(LuaType::Any);
            assign(info, (*dest).into(), ty, changed);
        }
        BodyNode::MultiGet { dest, .. } => assign(info, (*dest).into(), LuaType::Dynamic, changed),
        BodyNode::Call { dest, .. } | BodyNode::Vararg { dest } => {
            assign(info, (*dest).into(), LuaType::Dynamic, changed);
        }
        BodyNode::Closure { dest, .. } => assign(info, (*dest).into(), LuaType::Function, changed),
        BodyNode::TabSet { .. }
        | BodyNode::TabRawSetInt { .. }
        | BodyNode::TabStackAppend { .. }
        | BodyNode::Line { .. }
        | BodyNode::CpuWithdraw { .. } => {}
    }
}

/// The numeric result rules of binary operators.
fn binop_type(op: BinOpKind, lhs: LuaType, rhs: LuaType) -> LuaType {
    if op.is_comparison() {
        return LuaType::Boolean;
    }
    if op == BinOpKind::Concat {
        let stringish = |t: LuaType| t == LuaType::String || t.subtypes_number();
        return if stringish(lhs) && stringish(rhs) {
            LuaType::String
        } else {
            LuaType::Any
        };
    }
    if op.is_bitwise() {
        return if lhs.subtypes_number() && rhs.subtypes_number() {
            LuaType::Integer
        } else {
            LuaType::Any
        };
    }
    if !(lhs.subtypes_number() && rhs.subtypes_number()) {
        return LuaType::Any;
    }
    match op {
        // Division and exponentiation always produce floats.
        BinOpKind::Div | BinOpKind::Pow => LuaType::Float,
        _ => {
            if lhs == LuaType::Integer && rhs == LuaType::Integer {
                LuaType::Integer
            } else if lhs == LuaType::Float || rhs == LuaType::Float {
                LuaType::Float
            } else {
                LuaType::Number
            }
        }
    }
}

fn unop_type(op: UnOpKind, arg: LuaType) -> LuaType {
    match op {
        UnOpKind::Not => LuaType::Boolean,
        UnOpKind::Unm => {
            if arg.subtypes_number() {
                arg
            } else {
                LuaType::Any
            }
        }
        UnOpKind::BNot => {
            if arg.subtypes_number() {
                LuaType::Integer
            } else {
                LuaType::Any
            }
        }
        UnOpKind::Len => {
            if arg == LuaType::String {
                LuaType::Integer
            } else {
                LuaType::Any
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ast::build::{self, FnBuilder},
        ir::translate::translate_chunk,
    };

    fn infer_main(stats: Vec<crate::ast::StatKind>) -> (crate::ir::Module, TypeInfo) {
        let fb = FnBuilder::main();
        let chunk = fb.finish(build::block(stats));
        let module = translate_chunk(&chunk).unwrap();
        let info = infer(module.main());
        (module, info)
    }

    #[test]
    fn integer_addition_stays_integer() {
        let (module, info) = infer_main(vec![build::ret(vec![build::binop(
            crate::ast::BinAstOp::Add,
            build::int(1),
            build::int(2),
        )])]);
        let main = module.main();
        let dest = main.code.blocks()[0]
            .body
            .iter()
            .find_map(|n| match n {
                BodyNode::BinOp { dest, .. } => Some(*dest),
                _ => None,
            })
            .unwrap();
        assert_eq!(info.type_of(dest), LuaType::Integer);
    }

    #[test]
    fn division_of_integers_is_float() {
        let (module, info) = infer_main(vec![build::ret(vec![build::binop(
            crate::ast::BinAstOp::Div,
            build::int(1),
            build::int(2),
        )])]);
        let dest = module.main().code.blocks()[0]
            .body
            .iter()
            .find_map(|n| match n {
                BodyNode::BinOp { dest, .. } => Some(*dest),
                _ => None,
            })
            .unwrap();
        assert_eq!(info.type_of(dest), LuaType::Float);
    }

    #[test]
    fn mixed_arithmetic_is_float() {
        let (module, info) = infer_main(vec![build::ret(vec![build::binop(
            crate::ast::BinAstOp::Mul,
            build::int(2),
            build::float(1.5),
        )])]);
        let dest = module.main().code.blocks()[0]
            .body
            .iter()
            .find_map(|n| match n {
                BodyNode::BinOp { dest, .. } => Some(*dest),
                _ => None,
            })
            .unwrap();
        assert_eq!(info.type_of(dest), LuaType::Float);
    }

    #[test]
    fn captured_variables_are_reified_and_opaque() {
        let mut fb = FnBuilder::main();
        let x = fb.local("x");
        fb.capture(x);
        let mut inner = FnBuilder::function("inner");
        let ux = inner.upval_of_local("x", x);
        let inner_body = inner.finish(build::block(vec![build::ret(vec![build::upval_ref(ux)])]));
        let chunk = fb.finish(build::block(vec![
            build::local_decl(vec![x], vec![build::int(1)]),
            build::ret(vec![build::function_expr(inner_body), build::local_ref(x)]),
        ]));
        let module = translate_chunk(&chunk).unwrap();
        let info = infer(module.main());
        let var = module.main().code.blocks()[0]
            .body
            .iter()
            .find_map(|n| match n {
                BodyNode::VarInit { var, .. } => Some(*var),
                _ => None,
            })
            .unwrap();
        assert!(info.is_reified(var));
        let load_dest = module
            .main()
            .code
            .blocks()
            .iter()
            .flat_map(|b| &b.body)
            .find_map(|n| match n {
                BodyNode::VarLoad { dest, .. } => Some(*dest),
                _ => None,
            })
            .unwrap();
        assert_eq!(info.type_of(load_dest), LuaType::Any);
    }

    #[test]
    fn lattice_join_rules() {
        assert_eq!(LuaType::Integer.join(LuaType::Float), LuaType::Number);
        assert_eq!(LuaType::Integer.join(LuaType::Integer), LuaType::Integer);
        assert_eq!(LuaType::Integer.join(LuaType::String), LuaType::Any);
        assert_eq!(LuaType::Number.join(LuaType::Integer), LuaType::Number);
    }
}
