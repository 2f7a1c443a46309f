//! Shared helpers for the integration suites.
#![allow(dead_code)]

use lunara::{
    ast::FunctionBody,
    LuaError, LuaValue, Program,
};

/// Compiles and runs a chunk to completion with no limits.
pub fn run(chunk: &FunctionBody) -> Result<Vec<LuaValue>, LuaError> {
    let program = Program::compile(chunk).expect("chunk compiles");
    program.run(vec![])
}

/// Compiles and runs, passing arguments to the chunk.
pub fn run_with_args(chunk: &FunctionBody, args: Vec<LuaValue>) -> Result<Vec<LuaValue>, LuaError> {
    let program = Program::compile(chunk).expect("chunk compiles");
    program.run(args)
}

/// Asserts a result list against expected values using raw equality.
pub fn assert_values(actual: &[LuaValue], expected: &[LuaValue]) {
    assert_eq!(
        actual.len(),
        expected.len(),
        "result arity mismatch: {actual:?} vs {expected:?}"
    );
    for (index, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!(a.raw_eq(e), "result #{index}: expected {e:?}, got {a:?}");
    }
}

/// A string value for assertions; detached strings compare by content.
pub fn s(text: &str) -> LuaValue {
    LuaValue::Str(lunara::LuaStr::detached(text.as_bytes()))
}
