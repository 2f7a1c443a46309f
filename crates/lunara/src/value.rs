//! The Lua value model.
//!
//! Values are small and cheaply clonable: heap-backed variants (strings,
//! tables, functions, coroutines) hold reference-counted handles. Reference
//! counting is the memory management contract here; cycles among tables are
//! the host's concern, not modelled by ownership.

use std::{cell::RefCell, fmt, rc::Rc};

use crate::{
    emit::loader::LuaClosure,
    exec::{coroutine::CoroutineRef, host::HostFunction},
    intern::LuaStr,
    number,
    table::TableRef,
};

/// A first-class Lua value.
#[derive(Debug, Clone, Default)]
pub enum LuaValue {
    #[default]
    Nil,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    Str(LuaStr),
    Table(TableRef),
    Function(Callable),
    Coroutine(CoroutineRef),
    Userdata(Rc<Userdata>),
}

impl LuaValue {
    /// Lua type name, as reported by `type()` and used in error messages.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Nil => "nil",
            Self::Boolean(_) => "boolean",
            Self::Integer(_) | Self::Float(_) => "number",
            Self::Str(_) => "string",
            Self::Table(_) => "table",
            Self::Function(_) => "function",
            Self::Coroutine(_) => "thread",
            Self::Userdata(_) => "userdata",
        }
    }

    /// Lua truthiness: everything except `nil` and `false` is true.
    #[inline]
    #[must_use]
    pub fn truthy(&self) -> bool {
        !matches!(self, Self::Nil | Self::Boolean(false))
    }

    #[inline]
    #[must_use]
    pub fn is_nil(&self) -> bool {
        matches!(self, Self::Nil)
    }

    /// Raw (metamethod-free) equality.
    ///
    /// Numbers compare by mathematical value across the integer/float split;
    /// strings by content; tables, functions, coroutines and userdata by
    /// identity.
    #[must_use]
    pub fn raw_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Nil, Self::Nil) => true,
            (Self::Boolean(a), Self::Boolean(b)) => a == b,
            (Self::Integer(a), Self::Integer(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a == b,
            (Self::Integer(a), Self::Float(b)) | (Self::Float(b), Self::Integer(a)) => {
                number::int_float_eq(*a, *b)
            }
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Table(a), Self::Table(b)) => a.ptr_eq(b),
            (Self::Function(a), Self::Function(b)) => a.ptr_eq(b),
            (Self::Coroutine(a), Self::Coroutine(b)) => a.ptr_eq(b),
            (Self::Userdata(a), Self::Userdata(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Builds a string value without touching an interning registry.
    #[must_use]
    pub fn from_error_message(message: String) -> Self {
        Self::Str(LuaStr::detached(message.as_bytes()))
    }

    /// Short single-line rendering used in error text and tracebacks.
    #[must_use]
    pub fn display_brief(&self) -> String {
        match self {
            Self::Str(s) => s.to_string(),
            other => other.display_value(),
        }
    }

    /// The default `tostring` rendering (no `__tostring` consulted).
    #[must_use]
    pub fn display_value(&self) -> String {
        match self {
            Self::Nil => "nil".to_owned(),
            Self::Boolean(b) => b.to_string(),
            Self::Integer(i) => i.to_string(),
            Self::Float(f) => number::float_to_display(*f),
            Self::Str(s) => s.to_string(),
            Self::Table(t) => format!("table: {:p}", t.address()),
            Self::Function(c) => format!("function: {:p}", c.address()),
            Self::Coroutine(c) => format!("thread: {:p}", c.address()),
            Self::Userdata(u) => format!("userdata: {:p}", Rc::as_ptr(u)),
        }
    }
}

impl From<bool> for LuaValue {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl From<i64> for LuaValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for LuaValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<LuaStr> for LuaValue {
    fn from(value: LuaStr) -> Self {
        Self::Str(value)
    }
}

impl From<TableRef> for LuaValue {
    fn from(value: TableRef) -> Self {
        Self::Table(value)
    }
}

/// Something invokable: a compiled Lua closure or a host function.
#[derive(Debug, Clone)]
pub enum Callable {
    Closure(Rc<LuaClosure>),
    Host(Rc<HostFunction>),
}

impl Callable {
    /// Identity comparison (Lua function equality).
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Closure(a), Self::Closure(b)) => Rc::ptr_eq(a, b),
            (Self::Host(a), Self::Host(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Stable address for display purposes.
    #[must_use]
    pub fn address(&self) -> *const () {
        match self {
            Self::Closure(c) => Rc::as_ptr(c).cast(),
            Self::Host(h) => Rc::as_ptr(h).cast(),
        }
    }

    /// Name used in tracebacks.
    #[must_use]
    pub fn name(&self) -> String {
        match self {
            Self::Closure(c) => c.name().to_owned(),
            Self::Host(h) => h.name().to_owned(),
        }
    }
}

/// A mutable variable cell shared between a function and its closures.
///
/// Reified variables live in cells; loads and stores of such variables go
/// through the cell so every capturing function observes the same storage.
/// The cell's lifetime is that of its longest holder.
#[derive(Debug, Clone)]
pub struct Cell(Rc<RefCell<LuaValue>>);

impl Cell {
    /// Creates a cell holding `value`.
    #[must_use]
    pub fn new(value: LuaValue) -> Self {
        Self(Rc::new(RefCell::new(value)))
    }

    /// Reads the current value.
    #[must_use]
    pub fn get(&self) -> LuaValue {
        self.0.borrow().clone()
    }

    /// Replaces the value.
    pub fn set(&self, value: LuaValue) {
        *self.0.borrow_mut() = value;
    }

    /// Identity comparison.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

/// Opaque host data with an optional metatable.
pub struct Userdata {
    data: Box<dyn std::any::Any>,
    metatable: RefCell<Option<TableRef>>,
}

impl Userdata {
    #[must_use]
    pub fn new(data: Box<dyn std::any::Any>) -> Self {
        Self {
            data,
            metatable: RefCell::new(None),
        }
    }

    #[must_use]
    pub fn data(&self) -> &dyn std::any::Any {
        self.data.as_ref()
    }

    #[must_use]
    pub fn metatable(&self) -> Option<TableRef> {
        self.metatable.borrow().clone()
    }

    pub fn set_metatable(&self, metatable: Option<TableRef>) {
        *self.metatable.borrow_mut() = metatable;
    }
}

impl fmt::Debug for Userdata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Userdata").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intern::StrInterner;

    #[test]
    fn truthiness_matches_lua() {
        assert!(!LuaValue::Nil.truthy());
        assert!(!LuaValue::Boolean(false).truthy());
        assert!(LuaValue::Boolean(true).truthy());
        assert!(LuaValue::Integer(0).truthy());
        assert!(LuaValue::Float(0.0).truthy());
    }

    #[test]
    fn numeric_equality_crosses_representations() {
        assert!(LuaValue::Integer(3).raw_eq(&LuaValue::Float(3.0)));
        assert!(!LuaValue::Integer(3).raw_eq(&LuaValue::Float(3.5)));
        // Exact across the whole range: 2^63 as a float is past maxinteger.
        assert!(!LuaValue::Integer(i64::MAX).raw_eq(&LuaValue::Float(9_223_372_036_854_775_808.0)));
        assert!(LuaValue::Integer(i64::MIN).raw_eq(&LuaValue::Float(-9_223_372_036_854_775_808.0)));
    }

    #[test]
    fn string_equality_is_by_content() {
        let interner = StrInterner::new();
        let a = LuaValue::Str(interner.intern(b"x"));
        let b = LuaValue::Str(LuaStr::detached(b"x"));
        assert!(a.raw_eq(&b));
    }

    #[test]
    fn cells_share_storage() {
        let cell = Cell::new(LuaValue::Integer(1));
        let alias = cell.clone();
        alias.set(LuaValue::Integer(2));
        assert!(cell.get().raw_eq(&LuaValue::Integer(2)));
    }
}
