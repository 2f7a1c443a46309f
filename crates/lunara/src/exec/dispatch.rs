//! Dispatch: the Lua semantics of arithmetic, comparison, indexing, length,
//! concatenation and call resolution, including metamethod handling.
//!
//! This is the single channel through which emitted code touches Lua
//! semantics. Operations either produce a value directly or name the
//! metamethod call that must run — in which case the interpreter frame
//! saves itself and the executor performs the call, because any of these
//! operations may suspend.

use crate::{
    emit::insn::{ArithOp, CmpOp},
    error::{LuaError, RunResult},
    exec::state::StateContext,
    number,
    value::{Callable, LuaValue},
};

/// Chain limit for `__index`/`__newindex`/`__call` resolution.
const LOOP_LIMIT: usize = 100;

/// Outcome of a raw dispatch attempt.
#[derive(Debug)]
pub enum RawResult {
    /// The operation completed without running Lua code.
    Value(LuaValue),
    /// A metamethod must be called; its first result is the answer.
    Meta { target: LuaValue, args: Vec<LuaValue> },
}

/// Arithmetic and bitwise dispatch.
pub fn arith(state: &StateContext, op: ArithOp, a: &LuaValue, b: &LuaValue) -> RunResult<RawResult> {
    if op.is_bitwise() {
        return bitwise(state, op, a, b);
    }

    if let (LuaValue::Integer(x), LuaValue::Integer(y)) = (a, b) {
        if !matches!(op, ArithOp::Div | ArithOp::Pow) {
            return int_arith(op, *x, *y).map(RawResult::Value);
        }
    }
    // Mixed numeric operands, and string operands, run in float space.
    if let (Some(x), Some(y)) = (number::coerce_to_float(a), number::coerce_to_float(b)) {
        return Ok(RawResult::Value(LuaValue::Float(float_arith(op, x, y))));
    }

    match metamethod_pair(state, a, b, op.event()) {
        Some(target) => Ok(RawResult::Meta {
            target,
            args: vec![a.clone(), b.clone()],
        }),
        None => {
            let offender = if number::coerce_to_float(a).is_none() { a } else { b };
            Err(LuaError::illegal_op(format!(
                "attempt to perform arithmetic on a {} value",
                offender.type_name()
            )))
        }
    }
}

fn int_arith(op: ArithOp, x: i64, y: i64) -> RunResult<LuaValue> {
    let value = match op {
        ArithOp::Add => x.wrapping_add(y),
        ArithOp::Sub => x.wrapping_sub(y),
        ArithOp::Mul => x.wrapping_mul(y),
        ArithOp::Mod => {
            if y == 0 {
                return Err(LuaError::illegal_op("attempt to perform 'n%%0'"));
            }
            let r = x.wrapping_rem(y);
            // Lua's modulo follows the divisor's sign.
            if r != 0 && (r ^ y) < 0 {
                r.wrapping_add(y)
            } else {
                r
            }
        }
        ArithOp::IDiv => {
            if y == 0 {
                return Err(LuaError::illegal_op("attempt to perform 'n//0'"));
            }
            let q = x.wrapping_div(y);
            // Floor division: round toward negative infinity.
            if x.wrapping_rem(y) != 0 && (x ^ y) < 0 {
                q.wrapping_sub(1)
            } else {
                q
            }
        }
        ArithOp::Div | ArithOp::Pow => unreachable!("always float"),
        _ => unreachable!("bitwise handled separately"),
    };
    Ok(LuaValue::Integer(value))
}

fn float_arith(op: ArithOp, x: f64, y: f64) -> f64 {
    match op {
        ArithOp::Add => x + y,
        ArithOp::Sub => x - y,
        ArithOp::Mul => x * y,
        ArithOp::Div => x / y,
        ArithOp::Pow => x.powf(y),
        ArithOp::Mod => x - (x / y).floor() * y,
        ArithOp::IDiv => (x / y).floor(),
        _ => unreachable!("bitwise handled separately"),
    }
}

fn bitwise(state: &StateContext, op: ArithOp, a: &LuaValue, b: &LuaValue) -> RunResult<RawResult> {
    let ints = match (number::int_representation(a), number::int_representation(b)) {
        (Ok(x), Ok(y)) => Some((x, y)),
        _ => None,
    };
    if let Some((x, y)) = ints {
        let value = match op {
            ArithOp::BAnd => x & y,
            ArithOp::BOr => x | y,
            ArithOp::BXor => x ^ y,
            ArithOp::Shl => shift(x, y),
            ArithOp::Shr => shift(x, y.wrapping_neg()),
            _ => unreachable!("bitwise ops are exhaustive"),
        };
        return Ok(RawResult::Value(LuaValue::Integer(value)));
    }
    match metamethod_pair(state, a, b, op.event()) {
        Some(target) => Ok(RawResult::Meta {
            target,
            args: vec![a.clone(), b.clone()],
        }),
        None => {
            // Distinguish "no integer representation" from wrong types.
            number::int_representation(a)?;
            number::int_representation(b)?;
            unreachable!("one operand must have failed")
        }
    }
}

/// Lua shifts: logical, any amount; |n| ≥ 64 shifts everything out.
/// Positive shifts left, negative shifts right.
fn shift(x: i64, n: i64) -> i64 {
    if n <= -64 || n >= 64 {
        0
    } else if n >= 0 {
        ((x as u64) << n) as i64
    } else {
        ((x as u64) >> (-n)) as i64
    }
}

/// Comparison dispatch. The raw result is a boolean; a metamethod result
/// must be booleanised (and possibly negated) by the caller.
pub fn compare(state: &StateContext, op: CmpOp, a: &LuaValue, b: &LuaValue) -> RunResult<RawResult> {
    match op {
        CmpOp::Eq => {
            if a.raw_eq(b) {
                return Ok(RawResult::Value(LuaValue::Boolean(true)));
            }
            // `__eq` is only consulted for two tables or two userdata.
            let both_tables = matches!((a, b), (LuaValue::Table(_), LuaValue::Table(_)));
            let both_userdata = matches!((a, b), (LuaValue::Userdata(_), LuaValue::Userdata(_)));
            if both_tables || both_userdata {
                if let Some(target) = metamethod_pair(state, a, b, "eq") {
                    return Ok(RawResult::Meta {
                        target,
                        args: vec![a.clone(), b.clone()],
                    });
                }
            }
            Ok(RawResult::Value(LuaValue::Boolean(false)))
        }
        CmpOp::Lt | CmpOp::Le => {
            if let Some(ordering) = numeric_order(a, b) {
                let result = match op {
                    CmpOp::Lt => ordering == std::cmp::Ordering::Less,
                    _ => ordering != std::cmp::Ordering::Greater,
                };
                return Ok(RawResult::Value(LuaValue::Boolean(result)));
            }
            if let (LuaValue::Str(x), LuaValue::Str(y)) = (a, b) {
                let result = match op {
                    CmpOp::Lt => x < y,
                    _ => x <= y,
                };
                return Ok(RawResult::Value(LuaValue::Boolean(result)));
            }
            let event = if op == CmpOp::Lt { "lt" } else { "le" };
            match metamethod_pair(state, a, b, event) {
                Some(target) => Ok(RawResult::Meta {
                    target,
                    args: vec![a.clone(), b.clone()],
                }),
                None => Err(LuaError::illegal_op(format!(
                    "attempt to compare {} with {}",
                    a.type_name(),
                    b.type_name()
                ))),
            }
        }
    }
}

/// Numeric ordering across the integer/float split; `None` when either
/// operand is not a number. Integer-versus-float comparisons are exact
/// (no lossy widening of the integer). NaN operands resolve to `Greater`
/// so both `<` and `<=` come out false.
fn numeric_order(a: &LuaValue, b: &LuaValue) -> Option<std::cmp::Ordering> {
    use std::cmp::Ordering;
    match (a, b) {
        (LuaValue::Integer(x), LuaValue::Integer(y)) => Some(x.cmp(y)),
        (LuaValue::Integer(x), LuaValue::Float(y)) => {
            Some(number::int_float_order(*x, *y).unwrap_or(Ordering::Greater))
        }
        (LuaValue::Float(x), LuaValue::Integer(y)) => Some(
            number::int_float_order(*y, *x)
                .map(Ordering::reverse)
                .unwrap_or(Ordering::Greater),
        ),
        (LuaValue::Float(x), LuaValue::Float(y)) => x.partial_cmp(y).or(Some(Ordering::Greater)),
        _ => None,
    }
}

/// Index read dispatch, following `__index` chains.
pub fn index_get(state: &StateContext, obj: &LuaValue, key: &LuaValue) -> RunResult<RawResult> {
    let mut current = obj.clone();
    for _ in 0..LOOP_LIMIT {
        if let LuaValue::Table(table) = &current {
            let value = table.raw_get(key);
            if !value.is_nil() {
                return Ok(RawResult::Value(value));
            }
            match state.metamethod(&current, "index") {
                None => return Ok(RawResult::Value(LuaValue::Nil)),
                Some(LuaValue::Function(f)) => {
                    return Ok(RawResult::Meta {
                        target: LuaValue::Function(f),
                        args: vec![current, key.clone()],
                    });
                }
                Some(next) => current = next,
            }
        } else {
            match state.metamethod(&current, "index") {
                None => {
                    return Err(LuaError::illegal_op(format!(
                        "attempt to index a {} value",
                        current.type_name()
                    )));
                }
                Some(LuaValue::Function(f)) => {
                    return Ok(RawResult::Meta {
                        target: LuaValue::Function(f),
                        args: vec![current, key.clone()],
                    });
                }
                Some(next) => current = next,
            }
        }
    }
    Err(LuaError::illegal_op("'__index' chain too long; possible loop"))
}

/// Index write dispatch. `Ok(None)` means the write happened raw;
/// `Ok(Some(..))` names the `__newindex` call to perform.
pub fn index_set(
    state: &StateContext,
    obj: &LuaValue,
    key: &LuaValue,
    value: &LuaValue,
) -> RunResult<Option<(LuaValue, Vec<LuaValue>)>> {
    let mut current = obj.clone();
    for _ in 0..LOOP_LIMIT {
        if let LuaValue::Table(table) = &current {
            if !table.raw_get(key).is_nil() {
                table.raw_set(key.clone(), value.clone())?;
                return Ok(None);
            }
            match state.metamethod(&current, "newindex") {
                None => {
                    table.raw_set(key.clone(), value.clone())?;
                    return Ok(None);
                }
                Some(LuaValue::Function(f)) => {
                    return Ok(Some((
                        LuaValue::Function(f),
                        vec![current, key.clone(), value.clone()],
                    )));
                }
                Some(next) => current = next,
            }
        } else {
            match state.metamethod(&current, "newindex") {
                None => {
                    return Err(LuaError::illegal_op(format!(
                        "attempt to index a {} value",
                        current.type_name()
                    )));
                }
                Some(LuaValue::Function(f)) => {
                    return Ok(Some((
                        LuaValue::Function(f),
                        vec![current, key.clone(), value.clone()],
                    )));
                }
                Some(next) => current = next,
            }
        }
    }
    Err(LuaError::illegal_op("'__newindex' chain too long; possible loop"))
}

/// Length dispatch.
pub fn length(state: &StateContext, value: &LuaValue) -> RunResult<RawResult> {
    match value {
        LuaValue::Str(s) => Ok(RawResult::Value(LuaValue::Integer(
            i64::try_from(s.len()).unwrap_or(i64::MAX),
        ))),
        LuaValue::Table(t) => match state.metamethod(value, "len") {
            Some(target) => Ok(RawResult::Meta {
                target,
                args: vec![value.clone()],
            }),
            None => Ok(RawResult::Value(LuaValue::Integer(t.raw_len()))),
        },
        other => match state.metamethod(other, "len") {
            Some(target) => Ok(RawResult::Meta {
                target,
                args: vec![other.clone()],
            }),
            None => Err(LuaError::illegal_op(format!(
                "attempt to get length of a {} value",
                other.type_name()
            ))),
        },
    }
}

/// Concatenation dispatch. Strings and numbers concatenate; anything else
/// goes through `__concat`.
pub fn concat(state: &StateContext, a: &LuaValue, b: &LuaValue) -> RunResult<RawResult> {
    let piece = |v: &LuaValue| -> Option<Vec<u8>> {
        match v {
            LuaValue::Str(s) => Some(s.as_bytes().to_vec()),
            LuaValue::Integer(_) | LuaValue::Float(_) => Some(v.display_value().into_bytes()),
            _ => None,
        }
    };
    if let (Some(mut left), Some(right)) = (piece(a), piece(b)) {
        left.extend_from_slice(&right);
        return Ok(RawResult::Value(LuaValue::Str(state.interner.intern(&left))));
    }
    match metamethod_pair(state, a, b, "concat") {
        Some(target) => Ok(RawResult::Meta {
            target,
            args: vec![a.clone(), b.clone()],
        }),
        None => {
            let offender = if piece(a).is_none() { a } else { b };
            Err(LuaError::illegal_op(format!(
                "attempt to concatenate a {} value",
                offender.type_name()
            )))
        }
    }
}

/// Unary minus dispatch.
pub fn negate(state: &StateContext, value: &LuaValue) -> RunResult<RawResult> {
    match value {
        LuaValue::Integer(i) => return Ok(RawResult::Value(LuaValue::Integer(i.wrapping_neg()))),
        LuaValue::Float(f) => return Ok(RawResult::Value(LuaValue::Float(-f))),
        _ => {}
    }
    if let Some(f) = number::coerce_to_float(value) {
        return Ok(RawResult::Value(LuaValue::Float(-f)));
    }
    match state.metamethod(value, "unm") {
        Some(target) => Ok(RawResult::Meta {
            target,
            args: vec![value.clone(), value.clone()],
        }),
        None => Err(LuaError::illegal_op(format!(
            "attempt to perform arithmetic on a {} value",
            value.type_name()
        ))),
    }
}

/// Bitwise-not dispatch.
pub fn bitwise_not(state: &StateContext, value: &LuaValue) -> RunResult<RawResult> {
    match number::int_representation(value) {
        Ok(i) => Ok(RawResult::Value(LuaValue::Integer(!i))),
        Err(err) => match state.metamethod(value, "bnot") {
            Some(target) => Ok(RawResult::Meta {
                target,
                args: vec![value.clone(), value.clone()],
            }),
            None => Err(err),
        },
    }
}

/// Resolves a called value to a callable, unwrapping `__call` chains by
/// prepending the handled value to the argument list.
pub fn resolve_call(state: &StateContext, target: LuaValue, args: &mut Vec<LuaValue>) -> RunResult<Callable> {
    let mut current = target;
    for _ in 0..LOOP_LIMIT {
        match current {
            LuaValue::Function(callable) => return Ok(callable),
            other => match state.metamethod(&other, "call") {
                Some(handler) => {
                    args.insert(0, other);
                    current = handler;
                }
                None => {
                    return Err(LuaError::illegal_op(format!(
                        "attempt to call a {} value",
                        other.type_name()
                    )));
                }
            },
        }
    }
    Err(LuaError::illegal_op("'__call' chain too long; possible loop"))
}

/// The `__tostring` handler of a value, if any.
#[must_use]
pub fn tostring_handler(state: &StateContext, value: &LuaValue) -> Option<LuaValue> {
    state.metamethod(value, "tostring")
}

fn metamethod_pair(state: &StateContext, a: &LuaValue, b: &LuaValue, event: &str) -> Option<LuaValue> {
    state.metamethod(a, event).or_else(|| state.metamethod(b, event))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::TableRef;

    fn state() -> StateContext {
        StateContext::new()
    }

    fn value(result: RawResult) -> LuaValue {
        match result {
            RawResult::Value(v) => v,
            RawResult::Meta { .. } => panic!("expected a direct value"),
        }
    }

    #[test]
    fn integer_addition_wraps() {
        let s = state();
        let r = value(arith(&s, ArithOp::Add, &LuaValue::Integer(i64::MAX), &LuaValue::Integer(1)).unwrap());
        assert!(r.raw_eq(&LuaValue::Integer(i64::MIN)));
    }

    #[test]
    fn division_always_produces_floats() {
        let s = state();
        let r = value(arith(&s, ArithOp::Div, &LuaValue::Integer(1), &LuaValue::Integer(2)).unwrap());
        assert!(r.raw_eq(&LuaValue::Float(0.5)));
    }

    #[test]
    fn string_operands_coerce_to_floats() {
        let s = state();
        let lhs = LuaValue::Str(s.interner.intern(b"0x10"));
        let r = value(arith(&s, ArithOp::Add, &lhs, &LuaValue::Integer(1)).unwrap());
        assert!(r.raw_eq(&LuaValue::Float(17.0)));
    }

    #[test]
    fn modulo_follows_the_divisor_sign() {
        let s = state();
        let r = value(arith(&s, ArithOp::Mod, &LuaValue::Integer(-5), &LuaValue::Integer(3)).unwrap());
        assert!(r.raw_eq(&LuaValue::Integer(1)));
        let r = value(arith(&s, ArithOp::Mod, &LuaValue::Integer(5), &LuaValue::Integer(-3)).unwrap());
        assert!(r.raw_eq(&LuaValue::Integer(-1)));
    }

    #[test]
    fn floor_division_rounds_down() {
        let s = state();
        let r = value(arith(&s, ArithOp::IDiv, &LuaValue::Integer(-7), &LuaValue::Integer(2)).unwrap());
        assert!(r.raw_eq(&LuaValue::Integer(-4)));
    }

    #[test]
    fn bitwise_requires_integer_representation() {
        let s = state();
        let err = arith(&s, ArithOp::BAnd, &LuaValue::Float(1.5), &LuaValue::Integer(1)).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ConversionFailure);
        let ok = value(arith(&s, ArithOp::BAnd, &LuaValue::Float(6.0), &LuaValue::Integer(3)).unwrap());
        assert!(ok.raw_eq(&LuaValue::Integer(2)));
    }

    #[test]
    fn shifts_of_64_or_more_clear() {
        let s = state();
        let r = value(arith(&s, ArithOp::Shl, &LuaValue::Integer(1), &LuaValue::Integer(64)).unwrap());
        assert!(r.raw_eq(&LuaValue::Integer(0)));
        let r = value(arith(&s, ArithOp::Shr, &LuaValue::Integer(-1), &LuaValue::Integer(63)).unwrap());
        assert!(r.raw_eq(&LuaValue::Integer(1)));
    }

    #[test]
    fn numeric_equality_ignores_representation() {
        let s = state();
        let r = value(compare(&s, CmpOp::Eq, &LuaValue::Integer(2), &LuaValue::Float(2.0)).unwrap());
        assert!(r.raw_eq(&LuaValue::Boolean(true)));
    }

    #[test]
    fn int_float_comparisons_are_exact_past_two_pow_53() {
        let s = state();
        let two_pow_63 = 9_223_372_036_854_775_808.0f64;
        // maxinteger < 2.0^63, even though a lossy cast would equate them.
        let r = value(compare(&s, CmpOp::Lt, &LuaValue::Integer(i64::MAX), &LuaValue::Float(two_pow_63)).unwrap());
        assert!(r.raw_eq(&LuaValue::Boolean(true)));
        let r = value(compare(&s, CmpOp::Le, &LuaValue::Float(two_pow_63), &LuaValue::Integer(i64::MAX)).unwrap());
        assert!(r.raw_eq(&LuaValue::Boolean(false)));
        // mininteger == -2.0^63 exactly.
        let r = value(compare(&s, CmpOp::Le, &LuaValue::Float(-two_pow_63), &LuaValue::Integer(i64::MIN)).unwrap());
        assert!(r.raw_eq(&LuaValue::Boolean(true)));
        let r = value(compare(&s, CmpOp::Eq, &LuaValue::Integer(i64::MAX), &LuaValue::Float(two_pow_63)).unwrap());
        assert!(r.raw_eq(&LuaValue::Boolean(false)));
    }

    #[test]
    fn string_order_is_lexicographic_by_bytes() {
        let s = state();
        let a = LuaValue::Str(s.interner.intern(b"abc"));
        let b = LuaValue::Str(s.interner.intern(b"abd"));
        let r = value(compare(&s, CmpOp::Lt, &a, &b).unwrap());
        assert!(r.raw_eq(&LuaValue::Boolean(true)));
    }

    #[test]
    fn comparing_mixed_types_errors() {
        let s = state();
        let err = compare(&s, CmpOp::Lt, &LuaValue::Integer(1), &LuaValue::Nil).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::IllegalOperationAttempt);
    }

    #[test]
    fn index_chain_through_metatables() {
        let s = state();
        let base = TableRef::new();
        base.raw_set(LuaValue::Str(s.interner.intern(b"k")), LuaValue::Integer(1))
            .unwrap();
        let mt = TableRef::new();
        mt.raw_set(
            LuaValue::Str(s.meta_event("index")),
            LuaValue::Table(base),
        )
        .unwrap();
        let t = TableRef::new();
        t.set_metatable(Some(mt));
        let r = value(index_get(&s, &LuaValue::Table(t), &LuaValue::Str(s.interner.intern(b"k"))).unwrap());
        assert!(r.raw_eq(&LuaValue::Integer(1)));
    }

    #[test]
    fn concat_of_numbers_makes_strings() {
        let s = state();
        let r = value(concat(&s, &LuaValue::Integer(1), &LuaValue::Integer(2)).unwrap());
        match r {
            LuaValue::Str(st) => assert_eq!(st.as_bytes(), b"12"),
            other => panic!("expected string, got {other:?}"),
        }
    }
}
