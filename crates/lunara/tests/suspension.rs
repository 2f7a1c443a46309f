//! Suspension behavior: tick-limited preemption, cooperative pause,
//! asynchronous tasks, one-shot continuations, and save/resume round trips.

mod common;

use common::assert_values;
use lunara::{
    ast::{
        build::{self, FnBuilder},
        BinAstOp, Expr,
    },
    CallState, CompilerSettings, EventCollector, HostFlow, HostFunction, LuaValue, NoPauseScheduler, Program,
    RunEvent, StateContext, TickLimitScheduler, TickMode,
};

/// `while true do end` under a 1024-tick budget: every resume pauses, the
/// program never terminates, and no resume exceeds its budget by more than
/// one block's withdrawal.
#[test]
fn tick_limited_infinite_loop_keeps_pausing() {
    let fb = FnBuilder::main();
    let chunk = fb.finish(build::block(vec![
        build::while_loop(Expr::True, build::block(vec![])),
        build::ret(vec![]),
    ]));
    let program = Program::compile(&chunk).unwrap();
    let call = program.call(vec![]).unwrap();

    let mut collector = EventCollector::new();
    let mut continuation = call.current_continuation().unwrap();
    for _ in 0..4 {
        let mut scheduler = TickLimitScheduler::new(1024);
        continuation.resume(&mut collector, &mut scheduler).unwrap();
        assert!(scheduler.spent() >= 1024, "the budget must be consumed");
        match collector.take() {
            RunEvent::Paused(next) => continuation = next,
            other => panic!("expected a paused event, got {other:?}"),
        }
        assert_eq!(call.state(), CallState::Paused);
    }
}

/// A tick-limited computation reaches the same result as an unlimited run,
/// resuming through every pause (the save/resume round trip).
#[test]
fn tick_limited_run_matches_unlimited_result() {
    // local s = 0; for i = 1, 100 do s = s + i end; return s
    let mut fb = FnBuilder::main();
    let s = fb.local("s");
    let i = fb.local("i");
    let chunk = fb.finish(build::block(vec![
        build::local_decl(vec![s], vec![build::int(0)]),
        build::numeric_for(
            i,
            build::int(1),
            build::int(100),
            None,
            build::block(vec![build::assign_local(
                s,
                build::binop(BinAstOp::Add, build::local_ref(s), build::local_ref(i)),
            )]),
        ),
        build::ret(vec![build::local_ref(s)]),
    ]));
    let program = Program::compile(&chunk).unwrap();

    let unlimited = program.run(vec![]).unwrap();
    assert_values(&unlimited, &[LuaValue::Integer(5050)]);

    let call = program.call(vec![]).unwrap();
    let mut collector = EventCollector::new();
    let mut continuation = call.current_continuation().unwrap();
    let mut pauses = 0usize;
    let limited = loop {
        let mut scheduler = TickLimitScheduler::new(16);
        continuation.resume(&mut collector, &mut scheduler).unwrap();
        match collector.take() {
            RunEvent::Returned(values) => break values,
            RunEvent::Paused(next) => {
                pauses += 1;
                continuation = next;
            }
            other => panic!("unexpected event {other:?}"),
        }
    };
    assert!(pauses > 0, "a 16-tick budget must force at least one pause");
    assert_values(&limited, &unlimited);
}

/// A continuation is one-shot: after it resumes, the stale handle fails
/// with an invalid-continuation error.
#[test]
fn continuations_are_one_shot() {
    let fb = FnBuilder::main();
    let chunk = fb.finish(build::block(vec![
        build::while_loop(Expr::True, build::block(vec![])),
        build::ret(vec![]),
    ]));
    let program = Program::compile(&chunk).unwrap();
    let call = program.call(vec![]).unwrap();

    let first = call.current_continuation().unwrap();
    let stale = call.current_continuation().unwrap();
    let mut collector = EventCollector::new();
    first
        .resume(&mut collector, &mut TickLimitScheduler::new(64))
        .unwrap();
    let RunEvent::Paused(_) = collector.take() else {
        panic!("expected a pause");
    };
    // The first resume advanced the version; the stale handle must fail.
    let err = stale
        .resume(&mut collector, &mut TickLimitScheduler::new(64))
        .unwrap_err();
    assert_eq!(err.kind(), lunara::ErrorKind::InvalidContinuation);
}

/// A host function requesting a pause produces a paused event, and the
/// resumed call completes.
#[test]
fn explicit_pause_suspends_and_resumes() {
    // pause(); return 9
    let fb = FnBuilder::main();
    let chunk = fb.finish(build::block(vec![
        build::call_stat(build::global("pause"), vec![]),
        build::ret(vec![build::int(9)]),
    ]));
    let program = Program::compile(&chunk).unwrap();
    let context = StateContext::new();
    context
        .globals
        .raw_set(
            LuaValue::Str(context.interner.intern(b"pause")),
            LuaValue::Function(lunara::Callable::Host(lunara::pause_function())),
        )
        .unwrap();
    let call = program.call_with_context(context, vec![]).unwrap();

    let mut collector = EventCollector::new();
    call.resume(&mut collector, &mut NoPauseScheduler).unwrap();
    let RunEvent::Paused(continuation) = collector.take() else {
        panic!("expected the pause");
    };
    continuation.resume(&mut collector, &mut NoPauseScheduler).unwrap();
    let RunEvent::Returned(values) = collector.take() else {
        panic!("expected completion");
    };
    assert_values(&values, &[LuaValue::Integer(9)]);
}

/// An async suspension hands the host the task and a continuation; the
/// handoff completes the task before resuming.
#[test]
fn async_task_round_trip() {
    use std::{cell::Cell, rc::Rc};

    thread_local! {
        static COMPLETED: Rc<Cell<bool>> = Rc::new(Cell::new(false));
    }

    #[derive(Debug)]
    struct MarkDone(Rc<Cell<bool>>);
    impl lunara::AsyncTask for MarkDone {
        fn execute(self: Box<Self>) {
            self.0.set(true);
        }
    }

    fn wait(_ctx: &mut lunara::ExecContext<'_>, _args: Vec<LuaValue>) -> lunara::RunResult<HostFlow> {
        Ok(HostFlow::Async(Box::new(MarkDone(COMPLETED.with(Rc::clone)))))
    }

    // wait(); return 5
    let fb = FnBuilder::main();
    let chunk = fb.finish(build::block(vec![
        build::call_stat(build::global("wait"), vec![]),
        build::ret(vec![build::int(5)]),
    ]));
    let program = Program::compile(&chunk).unwrap();
    let context = StateContext::new();
    context
        .globals
        .raw_set(
            LuaValue::Str(context.interner.intern(b"wait")),
            LuaValue::Function(lunara::Callable::Host(HostFunction::from_fn("wait", wait))),
        )
        .unwrap();
    let call = program.call_with_context(context, vec![]).unwrap();

    let mut collector = EventCollector::new();
    call.resume(&mut collector, &mut NoPauseScheduler).unwrap();
    let RunEvent::Async(continuation, task) = collector.take() else {
        panic!("expected the async suspension");
    };
    assert!(!COMPLETED.with(|c| c.get()));
    task.execute();
    assert!(COMPLETED.with(|c| c.get()));

    continuation.resume(&mut collector, &mut NoPauseScheduler).unwrap();
    let RunEvent::Returned(values) = collector.take() else {
        panic!("expected completion");
    };
    assert_values(&values, &[LuaValue::Integer(5)]);
}

/// Resuming a function with no suspension points is rejected.
#[test]
fn non_suspendable_functions_reject_resume() {
    let fb = FnBuilder::main();
    let chunk = fb.finish(build::block(vec![build::ret(vec![build::int(1)])]));
    let settings = CompilerSettings {
        tick_mode: TickMode::None,
        ..CompilerSettings::default()
    };
    let program = Program::compile_with(&chunk, &settings).unwrap();
    assert!(!program.module().main().suspendable());

    let interner = lunara::StrInterner::new();
    let linked = lunara::emit::loader::link_module(program.module(), &interner).unwrap();
    let lunara::Callable::Closure(closure) =
        lunara::emit::loader::instantiate_main(&linked, LuaValue::Nil)
    else {
        panic!("main instantiates as a closure");
    };
    let err = lunara::exec::frame::LuaFrame::resume(
        closure,
        lunara::exec::frame::SavedState {
            varargs: None,
            slots: Box::new([]),
            point: 0,
        },
    )
    .unwrap_err();
    assert_eq!(err.kind(), lunara::ErrorKind::NonSuspendableFunction);
}

/// Segmented compilation executes identically to unsegmented.
#[test]
fn segmented_code_runs_identically() {
    let mut fb = FnBuilder::main();
    let a = fb.local("a");
    let b = fb.local("b");
    let chunk = fb.finish(build::block(vec![
        build::local_decl(vec![a], vec![build::int(3)]),
        build::local_decl(vec![b], vec![build::int(4)]),
        build::assign_local(
            a,
            build::binop(BinAstOp::Mul, build::local_ref(a), build::local_ref(b)),
        ),
        build::ret(vec![build::binop(
            BinAstOp::Add,
            build::local_ref(a),
            build::local_ref(b),
        )]),
    ]));
    let plain = Program::compile(&chunk).unwrap().run(vec![]).unwrap();
    for limit in [2usize, 3, 5, 8] {
        let settings = CompilerSettings {
            segment_limit: limit,
            ..CompilerSettings::default()
        };
        let segmented = Program::compile_with(&chunk, &settings)
            .unwrap()
            .run(vec![])
            .unwrap();
        assert_values(&segmented, &plain);
    }
}

/// Pausing inside a coroutine preserves the whole coroutine structure
/// across the continuation.
#[test]
fn pause_inside_a_coroutine_survives_resume() {
    // local c = coroutine.create(function()
    //   pause()
    //   coroutine.yield(1)
    //   return 2
    // end)
    // local _, a = coroutine.resume(c)
    // local _, b = coroutine.resume(c)
    // return a, b
    let mut body_fb = FnBuilder::function("pausing");
    let env = body_fb.upval_of_upval("_ENV", lunara::ast::UpvalId(0));
    let body = body_fb.finish(build::block(vec![
        build::call_stat(build::index(build::upval_ref(env), build::str("pause")), vec![]),
        build::call_stat(
            build::index(
                build::index(build::upval_ref(env), build::str("coroutine")),
                build::str("yield"),
            ),
            vec![build::int(1)],
        ),
        build::ret(vec![build::int(2)]),
    ]));

    let mut main = FnBuilder::main();
    let c = main.local("c");
    let ok1 = main.local("ok1");
    let a = main.local("a");
    let ok2 = main.local("ok2");
    let b = main.local("b");
    let chunk = main.finish(build::block(vec![
        build::local_decl(
            vec![c],
            vec![build::call(
                build::index(build::global("coroutine"), build::str("create")),
                vec![build::function_expr(body)],
            )],
        ),
        build::local_decl(
            vec![ok1, a],
            vec![build::call(
                build::index(build::global("coroutine"), build::str("resume")),
                vec![build::local_ref(c)],
            )],
        ),
        build::local_decl(
            vec![ok2, b],
            vec![build::call(
                build::index(build::global("coroutine"), build::str("resume")),
                vec![build::local_ref(c)],
            )],
        ),
        build::ret(vec![build::local_ref(a), build::local_ref(b)]),
    ]));

    let program = Program::compile(&chunk).unwrap();
    let context = StateContext::new();
    context
        .globals
        .raw_set(
            LuaValue::Str(context.interner.intern(b"pause")),
            LuaValue::Function(lunara::Callable::Host(lunara::pause_function())),
        )
        .unwrap();
    let call = program.call_with_context(context, vec![]).unwrap();

    let mut collector = EventCollector::new();
    call.resume(&mut collector, &mut NoPauseScheduler).unwrap();
    let RunEvent::Paused(continuation) = collector.take() else {
        panic!("the inner pause must surface");
    };
    continuation.resume(&mut collector, &mut NoPauseScheduler).unwrap();
    let RunEvent::Returned(values) = collector.take() else {
        panic!("expected completion");
    };
    assert_values(&values, &[LuaValue::Integer(1), LuaValue::Integer(2)]);
}
