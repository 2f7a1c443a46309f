//! Per-call shared state: interning, metatables, table creation, output.
//!
//! A `StateContext` is constructed with its call and torn down with it.
//! Emitted code and host functions reach all Lua-semantic services through
//! the [`ExecContext`] the executor threads into them.

use std::cell::RefCell;

use ahash::AHashMap;

use crate::{
    intern::{LuaStr, StrInterner},
    io::{PrintWriter, StdPrint},
    table::TableRef,
    tracer::ExecTracer,
    value::LuaValue,
    exec::{coroutine::CoroutineRef, ret::ReturnBuffer, scheduler::Scheduler},
};

/// Stateless table construction service.
#[derive(Debug, Default, Clone, Copy)]
pub struct TableFactory;

impl TableFactory {
    #[must_use]
    pub fn new_table(&self, array: usize, hash: usize) -> TableRef {
        TableRef::with_capacity(array, hash)
    }
}

/// Per-type metatables plus access to per-value ones.
///
/// Tables and userdata carry their own metatable; every other type shares
/// one per type name, mutated only through calls.
#[derive(Debug, Default)]
pub struct MetatableRegistry {
    by_type: RefCell<AHashMap<&'static str, TableRef>>,
}

impl MetatableRegistry {
    /// The metatable governing `value`, if any.
    #[must_use]
    pub fn metatable_of(&self, value: &LuaValue) -> Option<TableRef> {
        match value {
            LuaValue::Table(t) => t.metatable(),
            LuaValue::Userdata(u) => u.metatable(),
            other => self.by_type.borrow().get(other.type_name()).cloned(),
        }
    }

    /// Installs a per-type metatable (e.g. the string metatable).
    pub fn set_type_metatable(&self, type_name: &'static str, metatable: Option<TableRef>) {
        let mut map = self.by_type.borrow_mut();
        match metatable {
            Some(mt) => {
                map.insert(type_name, mt);
            }
            None => {
                map.remove(type_name);
            }
        }
    }
}

/// Interned metamethod event names, built once per context.
#[derive(Debug)]
struct MetaNames {
    names: AHashMap<&'static str, LuaStr>,
}

const EVENTS: &[&str] = &[
    "index", "newindex", "call", "add", "sub", "mul", "div", "mod", "idiv", "pow", "unm", "band", "bor", "bxor",
    "bnot", "shl", "shr", "concat", "len", "eq", "lt", "le", "tostring", "metatable",
];

impl MetaNames {
    fn new(interner: &StrInterner) -> Self {
        let names = EVENTS
            .iter()
            .map(|event| (*event, interner.intern(format!("__{event}").as_bytes())))
            .collect();
        Self { names }
    }
}

/// The shared services of one call.
pub struct StateContext {
    pub interner: StrInterner,
    pub metatables: MetatableRegistry,
    pub table_factory: TableFactory,
    /// The globals table the chunk's `_ENV` points at.
    pub globals: TableRef,
    print: RefCell<Box<dyn PrintWriter>>,
    meta_names: MetaNames,
}

impl StateContext {
    #[must_use]
    pub fn new() -> Self {
        Self::with_print(Box::new(StdPrint))
    }

    #[must_use]
    pub fn with_print(print: Box<dyn PrintWriter>) -> Self {
        let interner = StrInterner::new();
        let meta_names = MetaNames::new(&interner);
        Self {
            interner,
            metatables: MetatableRegistry::default(),
            table_factory: TableFactory,
            globals: TableRef::new(),
            print: RefCell::new(print),
            meta_names,
        }
    }

    /// The interned `__event` key for a metamethod event.
    ///
    /// # Panics
    /// Panics on an unknown event name; event names are compile-time
    /// constants.
    #[must_use]
    pub fn meta_event(&self, event: &str) -> LuaStr {
        self.meta_names
            .names
            .get(event)
            .unwrap_or_else(|| panic!("unknown metamethod event {event}"))
            .clone()
    }

    /// Looks up the metamethod `event` for `value`.
    #[must_use]
    pub fn metamethod(&self, value: &LuaValue, event: &str) -> Option<LuaValue> {
        let mt = self.metatables.metatable_of(value)?;
        let key = LuaValue::Str(self.meta_event(event));
        let handler = mt.raw_get(&key);
        if handler.is_nil() {
            None
        } else {
            Some(handler)
        }
    }

    /// Writes one print line.
    pub fn print_line(&self, line: &str) {
        self.print.borrow_mut().print(line);
    }
}

impl Default for StateContext {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StateContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateContext")
            .field("interner", &self.interner)
            .finish_non_exhaustive()
    }
}

/// Everything the interpreter and host functions see while running.
pub struct ExecContext<'a> {
    pub state: &'a StateContext,
    pub buffer: &'a mut ReturnBuffer,
    pub scheduler: &'a mut dyn Scheduler,
    pub tracer: &'a mut dyn ExecTracer,
    /// Whether the current coroutine has a resumer (yield is legal).
    pub in_coroutine: bool,
    /// The coroutine being executed. Its pending frames give host
    /// functions their callers' source positions (`error` level prefixes).
    pub current: CoroutineRef,
}
