//! Coroutine semantics end to end: creation, resume/yield transfers,
//! status transitions, wrap, and death.

mod common;

use common::{assert_values, run, s};
use lunara::{
    ast::{
        build::{self, FnBuilder},
        BinAstOp, Expr,
    },
    LuaValue,
};

/// Builds the ping-pong coroutine body:
/// `function() coroutine.yield(1); coroutine.yield(2); return 3 end`.
/// The body reaches `coroutine` through the chunk's `_ENV`.
fn ping_pong_body() -> lunara::ast::FunctionBody {
    let mut fb = FnBuilder::function("pingpong");
    let env = fb.upval_of_upval("_ENV", lunara::ast::UpvalId(0));
    let co_yield = |n: i64| {
        build::call_stat(
            build::index(
                build::index(build::upval_ref(env), build::str("coroutine")),
                build::str("yield"),
            ),
            vec![build::int(n)],
        )
    };
    fb.finish(build::block(vec![
        co_yield(1),
        co_yield(2),
        build::ret(vec![build::int(3)]),
    ]))
}

/// The ping-pong scenario: three resumes observe the two yields and the
/// return; a fourth resume reports the death.
#[test]
fn ping_pong_resume_sequence() {
    // local c = coroutine.create(<body>)
    // local a1, b1 = coroutine.resume(c)
    // ...
    // return a1, b1, a2, b2, a3, b3, a4, b4
    let mut main = FnBuilder::main();
    let c = main.local("c");
    let pairs: Vec<(lunara::ast::LocalId, lunara::ast::LocalId)> = (0..4)
        .map(|i| (main.local(&format!("a{i}")), main.local(&format!("b{i}"))))
        .collect();

    let mut stats = vec![build::local_decl(
        vec![c],
        vec![build::call(
            build::index(build::global("coroutine"), build::str("create")),
            vec![build::function_expr(ping_pong_body())],
        )],
    )];
    for (a, b) in &pairs {
        stats.push(build::local_decl(
            vec![*a, *b],
            vec![build::call(
                build::index(build::global("coroutine"), build::str("resume")),
                vec![build::local_ref(c)],
            )],
        ));
    }
    let mut returns = Vec::new();
    for (a, b) in &pairs {
        returns.push(build::local_ref(*a));
        returns.push(build::local_ref(*b));
    }
    stats.push(build::ret(returns));

    let chunk = main.finish(build::block(stats));
    let results = run(&chunk).unwrap();
    assert_values(
        &results,
        &[
            LuaValue::Boolean(true),
            LuaValue::Integer(1),
            LuaValue::Boolean(true),
            LuaValue::Integer(2),
            LuaValue::Boolean(true),
            LuaValue::Integer(3),
            LuaValue::Boolean(false),
            s("cannot resume dead coroutine"),
        ],
    );
}

/// Values passed to resume become yield's results inside the coroutine.
#[test]
fn resume_arguments_flow_into_yield_results() {
    // local c = coroutine.create(function(x)
    //   local y = coroutine.yield(x + 1)
    //   return y * 10
    // end)
    // local _, first = coroutine.resume(c, 5)
    // local _, second = coroutine.resume(c, 4)
    // return first, second
    let mut body_fb = FnBuilder::function("adder");
    let x = body_fb.param("x");
    let env = body_fb.upval_of_upval("_ENV", lunara::ast::UpvalId(0));
    let y = body_fb.local("y");
    let body = body_fb.finish(build::block(vec![
        build::local_decl(
            vec![y],
            vec![build::call(
                build::index(
                    build::index(build::upval_ref(env), build::str("coroutine")),
                    build::str("yield"),
                ),
                vec![build::binop(BinAstOp::Add, build::local_ref(x), build::int(1))],
            )],
        ),
        build::ret(vec![build::binop(BinAstOp::Mul, build::local_ref(y), build::int(10))]),
    ]));

    let mut main = FnBuilder::main();
    let c = main.local("c");
    let ok1 = main.local("ok1");
    let first = main.local("first");
    let ok2 = main.local("ok2");
    let second = main.local("second");
    let chunk = main.finish(build::block(vec![
        build::local_decl(
            vec![c],
            vec![build::call(
                build::index(build::global("coroutine"), build::str("create")),
                vec![build::function_expr(body)],
            )],
        ),
        build::local_decl(
            vec![ok1, first],
            vec![build::call(
                build::index(build::global("coroutine"), build::str("resume")),
                vec![build::local_ref(c), build::int(5)],
            )],
        ),
        build::local_decl(
            vec![ok2, second],
            vec![build::call(
                build::index(build::global("coroutine"), build::str("resume")),
                vec![build::local_ref(c), build::int(4)],
            )],
        ),
        build::ret(vec![build::local_ref(first), build::local_ref(second)]),
    ]));
    let results = run(&chunk).unwrap();
    assert_values(&results, &[LuaValue::Integer(6), LuaValue::Integer(40)]);
}

/// `coroutine.wrap` passes values through without the success flag and
/// propagates errors into the resumer.
#[test]
fn wrap_passes_values_directly() {
    // local g = coroutine.wrap(function() coroutine.yield(10); return 20 end)
    // return g(), g()
    let mut body_fb = FnBuilder::function("wrapped");
    let env = body_fb.upval_of_upval("_ENV", lunara::ast::UpvalId(0));
    let body = body_fb.finish(build::block(vec![
        build::call_stat(
            build::index(
                build::index(build::upval_ref(env), build::str("coroutine")),
                build::str("yield"),
            ),
            vec![build::int(10)],
        ),
        build::ret(vec![build::int(20)]),
    ]));

    let mut main = FnBuilder::main();
    let g = main.local("g");
    let chunk = main.finish(build::block(vec![
        build::local_decl(
            vec![g],
            vec![build::call(
                build::index(build::global("coroutine"), build::str("wrap")),
                vec![build::function_expr(body)],
            )],
        ),
        build::ret(vec![
            Expr::Paren(Box::new(build::call(build::local_ref(g), vec![]))),
            build::call(build::local_ref(g), vec![]),
        ]),
    ]));
    let results = run(&chunk).unwrap();
    assert_values(&results, &[LuaValue::Integer(10), LuaValue::Integer(20)]);
}

/// Statuses as seen from outside: suspended before the first resume,
/// dead after the body returns.
#[test]
fn status_reflects_the_lifecycle() {
    // local c = coroutine.create(function() return 1 end)
    // local before = coroutine.status(c)
    // coroutine.resume(c)
    // return before, coroutine.status(c)
    let mut body_fb = FnBuilder::function("noop");
    let body = body_fb.finish(build::block(vec![build::ret(vec![build::int(1)])]));

    let mut main = FnBuilder::main();
    let c = main.local("c");
    let before = main.local("before");
    let chunk = main.finish(build::block(vec![
        build::local_decl(
            vec![c],
            vec![build::call(
                build::index(build::global("coroutine"), build::str("create")),
                vec![build::function_expr(body)],
            )],
        ),
        build::local_decl(
            vec![before],
            vec![build::call(
                build::index(build::global("coroutine"), build::str("status")),
                vec![build::local_ref(c)],
            )],
        ),
        build::call_stat(
            build::index(build::global("coroutine"), build::str("resume")),
            vec![build::local_ref(c)],
        ),
        build::ret(vec![
            build::local_ref(before),
            build::call(
                build::index(build::global("coroutine"), build::str("status")),
                vec![build::local_ref(c)],
            ),
        ]),
    ]));
    let results = run(&chunk).unwrap();
    assert_values(&results, &[s("suspended"), s("dead")]);
}

/// Yielding from the main coroutine is an error, catchable by pcall.
#[test]
fn yield_outside_a_coroutine_errors() {
    // return pcall(coroutine.yield, 1)
    let fb = FnBuilder::main();
    let chunk = fb.finish(build::block(vec![build::ret(vec![build::call(
        build::global("pcall"),
        vec![
            build::index(build::global("coroutine"), build::str("yield")),
            build::int(1),
        ],
    )])]));
    let results = run(&chunk).unwrap();
    assert_eq!(results.len(), 2);
    assert!(results[0].raw_eq(&LuaValue::Boolean(false)));
}

/// An error inside a coroutine surfaces as resume's `(false, message)`,
/// with the raiser's position prefixed onto the string message.
#[test]
fn errors_inside_coroutines_are_reported_by_resume() {
    // local c = coroutine.create(function() error("inner") end)
    // return coroutine.resume(c)
    let mut body_fb = FnBuilder::function("failing");
    let env = body_fb.upval_of_upval("_ENV", lunara::ast::UpvalId(0));
    let body = body_fb.finish(build::block(vec![build::call_stat(
        build::index(build::upval_ref(env), build::str("error")),
        vec![build::str("inner")],
    )]));

    let mut main = FnBuilder::main();
    let c = main.local("c");
    let chunk = main.finish(build::block(vec![
        build::local_decl(
            vec![c],
            vec![build::call(
                build::index(build::global("coroutine"), build::str("create")),
                vec![build::function_expr(body)],
            )],
        ),
        build::ret(vec![build::call(
            build::index(build::global("coroutine"), build::str("resume")),
            vec![build::local_ref(c)],
        )]),
    ]));
    let results = run(&chunk).unwrap();
    assert_values(&results, &[LuaValue::Boolean(false), s("lua.Main$0:1: inner")]);
}

/// `isyieldable` is false on the main coroutine and true inside one.
#[test]
fn isyieldable_tracks_the_coroutine_depth() {
    // local c = coroutine.create(function() return coroutine.isyieldable() end)
    // local _, inner = coroutine.resume(c)
    // return coroutine.isyieldable(), inner
    let mut body_fb = FnBuilder::function("probe");
    let env = body_fb.upval_of_upval("_ENV", lunara::ast::UpvalId(0));
    let body = body_fb.finish(build::block(vec![build::ret(vec![build::call(
        build::index(
            build::index(build::upval_ref(env), build::str("coroutine")),
            build::str("isyieldable"),
        ),
        vec![],
    )])]));

    let mut main = FnBuilder::main();
    let c = main.local("c");
    let ok = main.local("ok");
    let inner = main.local("inner");
    let chunk = main.finish(build::block(vec![
        build::local_decl(
            vec![c],
            vec![build::call(
                build::index(build::global("coroutine"), build::str("create")),
                vec![build::function_expr(body)],
            )],
        ),
        build::local_decl(
            vec![ok, inner],
            vec![build::call(
                build::index(build::global("coroutine"), build::str("resume")),
                vec![build::local_ref(c)],
            )],
        ),
        build::ret(vec![
            Expr::Paren(Box::new(build::call(
                build::index(build::global("coroutine"), build::str("isyieldable")),
                vec![],
            ))),
            build::local_ref(inner),
        ]),
    ]));
    let results = run(&chunk).unwrap();
    assert_values(&results, &[LuaValue::Boolean(false), LuaValue::Boolean(true)]);
}
