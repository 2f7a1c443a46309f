//! Runtime-support functions: the thin native surface the executor's
//! contract is exercised through.
//!
//! This is deliberately not a standard library. It provides the base
//! functions tied to the execution model (`pcall`, `error`, `coroutine.*`,
//! `select`, the raw table accessors, metatable access) and nothing of the
//! string/math/table/io/os libraries.

use std::rc::Rc;

use crate::{
    error::{LuaError, RunResult},
    exec::{
        call::Resumable,
        coroutine::{CoStatus, CoroutineRef},
        dispatch,
        host::{HostFlow, HostFunction},
        state::{ExecContext, StateContext},
    },
    number,
    table::TableRef,
    value::{Callable, LuaValue},
};

/// Installs the base functions into the context's globals table.
pub fn install(state: &StateContext) {
    let set_global = |name: &str, value: LuaValue| {
        state
            .globals
            .raw_set(LuaValue::Str(state.interner.intern(name.as_bytes())), value)
            .expect("baselib keys are never nil");
    };
    let host = |name: &'static str, f: crate::exec::host::HostFn| {
        LuaValue::Function(Callable::Host(HostFunction::from_fn(name, f)))
    };

    set_global("print", host("print", lua_print));
    set_global("type", host("type", lua_type));
    set_global("tostring", host("tostring", lua_tostring));
    set_global("tonumber", host("tonumber", lua_tonumber));
    set_global("assert", host("assert", lua_assert));
    set_global("error", host("error", lua_error));
    set_global("pcall", host("pcall", lua_pcall));
    set_global("xpcall", host("xpcall", lua_xpcall));
    set_global("select", host("select", lua_select));
    set_global("rawget", host("rawget", lua_rawget));
    set_global("rawset", host("rawset", lua_rawset));
    set_global("rawequal", host("rawequal", lua_rawequal));
    set_global("rawlen", host("rawlen", lua_rawlen));
    set_global("setmetatable", host("setmetatable", lua_setmetatable));
    set_global("getmetatable", host("getmetatable", lua_getmetatable));

    let coroutine = TableRef::new();
    let set_co = |name: &str, value: LuaValue| {
        coroutine
            .raw_set(LuaValue::Str(state.interner.intern(name.as_bytes())), value)
            .expect("baselib keys are never nil");
    };
    set_co("create", host("create", co_create));
    set_co("resume", host("resume", co_resume));
    set_co("yield", host("yield", co_yield));
    set_co("status", host("status", co_status));
    set_co("isyieldable", host("isyieldable", co_isyieldable));
    set_co("wrap", host("wrap", co_wrap));
    set_global("coroutine", LuaValue::Table(coroutine));

    set_global("_G", LuaValue::Table(state.globals.clone()));
}

/// A host function that requests a cooperative pause; embedders install it
/// when scripts should be able to pause themselves.
#[must_use]
pub fn pause_function() -> Rc<HostFunction> {
    HostFunction::from_fn("pause", |_ctx, _args| Ok(HostFlow::Pause))
}

fn arg(args: &[LuaValue], index: usize) -> LuaValue {
    args.get(index).cloned().unwrap_or(LuaValue::Nil)
}

fn lua_print(ctx: &mut ExecContext<'_>, args: Vec<LuaValue>) -> RunResult<HostFlow> {
    let line = args
        .iter()
        .map(LuaValue::display_value)
        .collect::<Vec<_>>()
        .join("\t");
    ctx.state.print_line(&line);
    Ok(HostFlow::Return(Vec::new()))
}

fn lua_type(ctx: &mut ExecContext<'_>, args: Vec<LuaValue>) -> RunResult<HostFlow> {
    let value = arg(&args, 0);
    let name = ctx.state.interner.intern(value.type_name().as_bytes());
    Ok(HostFlow::Return(vec![LuaValue::Str(name)]))
}

fn lua_tostring(ctx: &mut ExecContext<'_>, args: Vec<LuaValue>) -> RunResult<HostFlow> {
    let value = arg(&args, 0);
    if let Some(handler) = dispatch::tostring_handler(ctx.state, &value) {
        return Ok(HostFlow::TailCall {
            target: handler,
            args: vec![value],
        });
    }
    let text = ctx.state.interner.intern(value.display_value().as_bytes());
    Ok(HostFlow::Return(vec![LuaValue::Str(text)]))
}

fn lua_tonumber(_ctx: &mut ExecContext<'_>, args: Vec<LuaValue>) -> RunResult<HostFlow> {
    let value = arg(&args, 0);
    let result = match args.get(1) {
        None | Some(LuaValue::Nil) => number::coerce_to_number(&value).unwrap_or(LuaValue::Nil),
        Some(base) => {
            let base = match number::int_representation(base) {
                Ok(b) if (2..=36).contains(&b) => b as u32,
                _ => return Err(LuaError::illegal_op("bad argument #2 to 'tonumber' (base out of range)")),
            };
            match &value {
                LuaValue::Str(s) => match s.as_str().map(str::trim) {
                    Some(text) if !text.is_empty() => i64::from_str_radix(text, base)
                        .map(LuaValue::Integer)
                        .unwrap_or(LuaValue::Nil),
                    _ => LuaValue::Nil,
                },
                _ => {
                    return Err(LuaError::illegal_op(
                        "bad argument #1 to 'tonumber' (string expected)",
                    ));
                }
            }
        }
    };
    Ok(HostFlow::Return(vec![result]))
}

fn lua_assert(_ctx: &mut ExecContext<'_>, args: Vec<LuaValue>) -> RunResult<HostFlow> {
    if arg(&args, 0).truthy() {
        return Ok(HostFlow::Return(args));
    }
    match args.get(1) {
        Some(message) => Err(LuaError::with_value(message.clone())),
        None => Err(LuaError::new(crate::error::ErrorKind::LuaRuntimeError, "assertion failed!")),
    }
}

/// `error(message [, level])`: string messages at level ≥ 1 are prefixed
/// with the position of the frame `level` levels up (1 is the function
/// that called `error`). Level 0, non-string messages, and levels that
/// land on a native caller raise the message untouched.
fn lua_error(ctx: &mut ExecContext<'_>, args: Vec<LuaValue>) -> RunResult<HostFlow> {
    let message = arg(&args, 0);
    let level = match args.get(1) {
        None | Some(LuaValue::Nil) => 1,
        Some(value) => number::int_representation(value)
            .ok()
            .and_then(|l| usize::try_from(l).ok())
            .unwrap_or(1),
    };
    if level > 0 {
        if let LuaValue::Str(text) = &message {
            if let Some((function, line)) = ctx.current.frame_position(level) {
                let mut prefixed = format!("{function}:{line}: ").into_bytes();
                prefixed.extend_from_slice(text.as_bytes());
                return Err(LuaError::with_value(LuaValue::Str(
                    ctx.state.interner.intern(&prefixed),
                )));
            }
        }
    }
    Err(LuaError::with_value(message))
}

fn lua_pcall(_ctx: &mut ExecContext<'_>, mut args: Vec<LuaValue>) -> RunResult<HostFlow> {
    if args.is_empty() {
        return Err(LuaError::illegal_op("bad argument #1 to 'pcall' (value expected)"));
    }
    let target = args.remove(0);
    Ok(HostFlow::Protect {
        target,
        args,
        handler: None,
    })
}

fn lua_xpcall(_ctx: &mut ExecContext<'_>, mut args: Vec<LuaValue>) -> RunResult<HostFlow> {
    if args.len() < 2 {
        return Err(LuaError::illegal_op("bad argument #2 to 'xpcall' (value expected)"));
    }
    let target = args.remove(0);
    let handler = args.remove(0);
    Ok(HostFlow::Protect {
        target,
        args,
        handler: Some(handler),
    })
}

fn lua_select(_ctx: &mut ExecContext<'_>, args: Vec<LuaValue>) -> RunResult<HostFlow> {
    let selector = arg(&args, 0);
    let rest = &args[1.min(args.len())..];
    if let LuaValue::Str(s) = &selector {
        if s.as_bytes() == b"#" {
            return Ok(HostFlow::Return(vec![LuaValue::Integer(rest.len() as i64)]));
        }
    }
    let n = number::int_representation(&selector)
        .map_err(|_| LuaError::illegal_op("bad argument #1 to 'select' (number expected)"))?;
    let start = if n > 0 {
        (n - 1) as usize
    } else if n < 0 {
        let back = usize::try_from(-n).unwrap_or(usize::MAX);
        if back > rest.len() {
            return Err(LuaError::illegal_op("bad argument #1 to 'select' (index out of range)"));
        }
        rest.len() - back
    } else {
        return Err(LuaError::illegal_op("bad argument #1 to 'select' (index out of range)"));
    };
    Ok(HostFlow::Return(rest.get(start..).unwrap_or(&[]).to_vec()))
}

fn lua_rawget(_ctx: &mut ExecContext<'_>, args: Vec<LuaValue>) -> RunResult<HostFlow> {
    match arg(&args, 0) {
        LuaValue::Table(t) => Ok(HostFlow::Return(vec![t.raw_get(&arg(&args, 1))])),
        other => Err(LuaError::illegal_op(format!(
            "bad argument #1 to 'rawget' (table expected, got {})",
            other.type_name()
        ))),
    }
}

fn lua_rawset(_ctx: &mut ExecContext<'_>, args: Vec<LuaValue>) -> RunResult<HostFlow> {
    match arg(&args, 0) {
        LuaValue::Table(t) => {
            t.raw_set(arg(&args, 1), arg(&args, 2))?;
            Ok(HostFlow::Return(vec![LuaValue::Table(t)]))
        }
        other => Err(LuaError::illegal_op(format!(
            "bad argument #1 to 'rawset' (table expected, got {})",
            other.type_name()
        ))),
    }
}

fn lua_rawequal(_ctx: &mut ExecContext<'_>, args: Vec<LuaValue>) -> RunResult<HostFlow> {
    let equal = arg(&args, 0).raw_eq(&arg(&args, 1));
    Ok(HostFlow::Return(vec![LuaValue::Boolean(equal)]))
}

fn lua_rawlen(_ctx: &mut ExecContext<'_>, args: Vec<LuaValue>) -> RunResult<HostFlow> {
    match arg(&args, 0) {
        LuaValue::Table(t) => Ok(HostFlow::Return(vec![LuaValue::Integer(t.raw_len())])),
        LuaValue::Str(s) => Ok(HostFlow::Return(vec![LuaValue::Integer(
            i64::try_from(s.len()).unwrap_or(i64::MAX),
        )])),
        other => Err(LuaError::illegal_op(format!(
            "table or string expected, got {}",
            other.type_name()
        ))),
    }
}

fn lua_setmetatable(ctx: &mut ExecContext<'_>, args: Vec<LuaValue>) -> RunResult<HostFlow> {
    let LuaValue::Table(table) = arg(&args, 0) else {
        return Err(LuaError::illegal_op(
            "bad argument #1 to 'setmetatable' (table expected)",
        ));
    };
    let metatable = match arg(&args, 1) {
        LuaValue::Nil => None,
        LuaValue::Table(mt) => Some(mt),
        _ => {
            return Err(LuaError::illegal_op(
                "bad argument #2 to 'setmetatable' (nil or table expected)",
            ));
        }
    };
    if let Some(existing) = table.metatable() {
        let guard = existing.raw_get(&LuaValue::Str(ctx.state.meta_event("metatable")));
        if !guard.is_nil() {
            return Err(LuaError::illegal_op("cannot change a protected metatable"));
        }
    }
    table.set_metatable(metatable);
    Ok(HostFlow::Return(vec![LuaValue::Table(table)]))
}

fn lua_getmetatable(ctx: &mut ExecContext<'_>, args: Vec<LuaValue>) -> RunResult<HostFlow> {
    let value = arg(&args, 0);
    let result = match ctx.state.metatables.metatable_of(&value) {
        None => LuaValue::Nil,
        Some(mt) => {
            let guard = mt.raw_get(&LuaValue::Str(ctx.state.meta_event("metatable")));
            if guard.is_nil() {
                LuaValue::Table(mt)
            } else {
                guard
            }
        }
    };
    Ok(HostFlow::Return(vec![result]))
}

// ---- coroutine ----

fn co_create(_ctx: &mut ExecContext<'_>, args: Vec<LuaValue>) -> RunResult<HostFlow> {
    let target = arg(&args, 0);
    if !matches!(target, LuaValue::Function(_)) {
        return Err(LuaError::illegal_op(
            "bad argument #1 to 'create' (function expected)",
        ));
    }
    let co = CoroutineRef::new(Resumable::Bootstrap { target });
    Ok(HostFlow::Return(vec![LuaValue::Coroutine(co)]))
}

fn co_resume(_ctx: &mut ExecContext<'_>, mut args: Vec<LuaValue>) -> RunResult<HostFlow> {
    if args.is_empty() {
        return Err(LuaError::illegal_op(
            "bad argument #1 to 'resume' (coroutine expected)",
        ));
    }
    let LuaValue::Coroutine(co) = args.remove(0) else {
        return Err(LuaError::illegal_op(
            "bad argument #1 to 'resume' (coroutine expected)",
        ));
    };
    Ok(HostFlow::Resume {
        co,
        args,
        protected: true,
    })
}

fn co_yield(_ctx: &mut ExecContext<'_>, args: Vec<LuaValue>) -> RunResult<HostFlow> {
    Ok(HostFlow::Yield(args))
}

fn co_status(ctx: &mut ExecContext<'_>, args: Vec<LuaValue>) -> RunResult<HostFlow> {
    let LuaValue::Coroutine(co) = arg(&args, 0) else {
        return Err(LuaError::illegal_op(
            "bad argument #1 to 'status' (coroutine expected)",
        ));
    };
    let status = match co.status() {
        CoStatus::Suspended => "suspended",
        CoStatus::Running => "running",
        CoStatus::Normal => "normal",
        CoStatus::Dead => "dead",
    };
    Ok(HostFlow::Return(vec![LuaValue::Str(
        ctx.state.interner.intern(status.as_bytes()),
    )]))
}

fn co_isyieldable(ctx: &mut ExecContext<'_>, _args: Vec<LuaValue>) -> RunResult<HostFlow> {
    Ok(HostFlow::Return(vec![LuaValue::Boolean(ctx.in_coroutine)]))
}

fn co_wrap(_ctx: &mut ExecContext<'_>, args: Vec<LuaValue>) -> RunResult<HostFlow> {
    let target = arg(&args, 0);
    if !matches!(target, LuaValue::Function(_)) {
        return Err(LuaError::illegal_op(
            "bad argument #1 to 'wrap' (function expected)",
        ));
    }
    let co = CoroutineRef::new(Resumable::Bootstrap { target });
    Ok(HostFlow::Return(vec![LuaValue::Function(Callable::Host(
        HostFunction::wrap_resume(co),
    ))]))
}
