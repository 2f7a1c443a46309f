//! The Lua table: a hybrid array/hash container with an optional metatable.
//!
//! Only the raw (metamethod-free) contract lives here; `__index` and friends
//! are the dispatcher's business. Integer keys in the dense prefix `1..=n`
//! are stored in an array part, everything else in a hash part. Float keys
//! with an exact integer value normalise to integer keys.

use std::{
    cell::RefCell,
    fmt,
    hash::{Hash, Hasher},
    rc::Rc,
};

use ahash::AHashMap;

use crate::{
    error::{LuaError, RunResult},
    intern::LuaStr,
    number,
    value::LuaValue,
};

/// A shared handle to a table. Lua table identity is handle identity.
#[derive(Clone)]
pub struct TableRef(Rc<RefCell<Table>>);

impl TableRef {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(0, 0)
    }

    /// Creates a table with preallocated array and hash capacity.
    #[must_use]
    pub fn with_capacity(array: usize, hash: usize) -> Self {
        Self(Rc::new(RefCell::new(Table {
            array: Vec::with_capacity(array),
            hash: AHashMap::with_capacity(hash),
            metatable: None,
        })))
    }

    /// Raw read; absent keys (and invalid ones) read as nil.
    #[must_use]
    pub fn raw_get(&self, key: &LuaValue) -> LuaValue {
        self.0.borrow().raw_get(key)
    }

    /// Raw write. Rejects nil and NaN keys.
    pub fn raw_set(&self, key: LuaValue, value: LuaValue) -> RunResult<()> {
        self.0.borrow_mut().raw_set(key, value)
    }

    /// Raw write at an integer key, the table-constructor fast path.
    pub fn raw_set_int(&self, index: i64, value: LuaValue) {
        self.0.borrow_mut().set_int(index, value);
    }

    /// Appends values after the current border, for constructor tails.
    pub fn append_from(&self, start: i64, values: impl IntoIterator<Item = LuaValue>) {
        let mut table = self.0.borrow_mut();
        let mut index = start;
        for value in values {
            table.set_int(index, value);
            index += 1;
        }
    }

    /// The raw length: a border of the integer sequence.
    #[must_use]
    pub fn raw_len(&self) -> i64 {
        self.0.borrow().border()
    }

    #[must_use]
    pub fn metatable(&self) -> Option<Self> {
        self.0.borrow().metatable.clone()
    }

    pub fn set_metatable(&self, metatable: Option<Self>) {
        self.0.borrow_mut().metatable = metatable;
    }

    /// Identity comparison.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// Stable address for display purposes.
    #[must_use]
    pub fn address(&self) -> *const () {
        Rc::as_ptr(&self.0).cast()
    }
}

impl Default for TableRef {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let table = self.0.borrow();
        f.debug_struct("TableRef")
            .field("array_len", &table.array.len())
            .field("hash_len", &table.hash.len())
            .field("has_metatable", &table.metatable.is_some())
            .finish()
    }
}

struct Table {
    /// Dense storage for keys `1..=array.len()`; trailing nils are trimmed.
    array: Vec<LuaValue>,
    hash: AHashMap<TableKey, LuaValue>,
    metatable: Option<TableRef>,
}

impl Table {
    fn raw_get(&self, key: &LuaValue) -> LuaValue {
        match normalize_key(key) {
            Some(TableKey::Int(i)) => self.get_int(i),
            Some(key) => self.hash.get(&key).cloned().unwrap_or(LuaValue::Nil),
            None => LuaValue::Nil,
        }
    }

    fn raw_set(&mut self, key: LuaValue, value: LuaValue) -> RunResult<()> {
        match normalize_key(&key) {
            Some(TableKey::Int(i)) => {
                self.set_int(i, value);
                Ok(())
            }
            Some(normalized) => {
                if value.is_nil() {
                    self.hash.remove(&normalized);
                } else {
                    self.hash.insert(normalized, value);
                }
                Ok(())
            }
            None => match key {
                LuaValue::Nil => Err(LuaError::illegal_op("table index is nil")),
                _ => Err(LuaError::illegal_op("table index is NaN")),
            },
        }
    }

    fn get_int(&self, index: i64) -> LuaValue {
        if index >= 1 {
            if let Ok(offset) = usize::try_from(index - 1) {
                if offset < self.array.len() {
                    return self.array[offset].clone();
                }
            }
        }
        self.hash.get(&TableKey::Int(index)).cloned().unwrap_or(LuaValue::Nil)
    }

    fn set_int(&mut self, index: i64, value: LuaValue) {
        if index >= 1 {
            if let Ok(offset) = usize::try_from(index - 1) {
                if offset < self.array.len() {
                    self.array[offset] = value;
                    if offset + 1 == self.array.len() {
                        self.trim_trailing_nils();
                    }
                    return;
                }
                if offset == self.array.len() {
                    if value.is_nil() {
                        return;
                    }
                    self.array.push(value);
                    self.migrate_from_hash();
                    return;
                }
            }
        }
        if value.is_nil() {
            self.hash.remove(&TableKey::Int(index));
        } else {
            self.hash.insert(TableKey::Int(index), value);
        }
    }

    /// Pulls integer keys that directly extend the array part out of the
    /// hash part, so appends keep the sequence dense.
    fn migrate_from_hash(&mut self) {
        loop {
            let next = self.array.len() as i64 + 1;
            match self.hash.remove(&TableKey::Int(next)) {
                Some(value) => self.array.push(value),
                None => break,
            }
        }
    }

    fn trim_trailing_nils(&mut self) {
        while matches!(self.array.last(), Some(LuaValue::Nil)) {
            self.array.pop();
        }
    }

    /// A border: `t[border] ~= nil` and `t[border+1] == nil`.
    fn border(&self) -> i64 {
        let len = self.array.len() as i64;
        if len > 0 {
            return len;
        }
        // No array part; a sequence may still live in the hash part.
        if !self.hash.contains_key(&TableKey::Int(1)) {
            return 0;
        }
        let mut n = 1i64;
        while self.hash.contains_key(&TableKey::Int(n + 1)) {
            n += 1;
        }
        n
    }
}

/// A normalised table key.
#[derive(Clone)]
enum TableKey {
    Int(i64),
    FloatBits(u64),
    Str(LuaStr),
    Bool(bool),
    /// Identity-keyed reference value (table, function, thread, userdata).
    Obj(ObjKey),
}

impl PartialEq for TableKey {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::FloatBits(a), Self::FloatBits(b)) => a == b,
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Obj(a), Self::Obj(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for TableKey {}

impl Hash for TableKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Self::Int(i) => {
                state.write_u8(0);
                i.hash(state);
            }
            Self::FloatBits(bits) => {
                state.write_u8(1);
                bits.hash(state);
            }
            Self::Str(s) => {
                state.write_u8(2);
                s.hash(state);
            }
            Self::Bool(b) => {
                state.write_u8(3);
                b.hash(state);
            }
            Self::Obj(o) => {
                state.write_u8(4);
                o.hash(state);
            }
        }
    }
}

/// Keeps the keyed object alive while hashing and comparing by identity.
#[derive(Clone)]
struct ObjKey(LuaValue);

impl ObjKey {
    fn address(&self) -> usize {
        match &self.0 {
            LuaValue::Table(t) => t.address() as usize,
            LuaValue::Function(f) => f.address() as usize,
            LuaValue::Coroutine(c) => c.address() as usize,
            LuaValue::Userdata(u) => Rc::as_ptr(u) as *const () as usize,
            _ => 0,
        }
    }
}

impl PartialEq for ObjKey {
    fn eq(&self, other: &Self) -> bool {
        self.address() == other.address()
    }
}

impl Eq for ObjKey {}

impl Hash for ObjKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address().hash(state);
    }
}

/// Normalises a Lua value into a table key; `None` marks invalid keys
/// (nil and NaN).
fn normalize_key(key: &LuaValue) -> Option<TableKey> {
    match key {
        LuaValue::Nil => None,
        LuaValue::Boolean(b) => Some(TableKey::Bool(*b)),
        LuaValue::Integer(i) => Some(TableKey::Int(*i)),
        LuaValue::Float(f) => {
            if f.is_nan() {
                None
            } else if let Some(i) = number::float_to_exact_int(*f) {
                Some(TableKey::Int(i))
            } else {
                Some(TableKey::FloatBits(f.to_bits()))
            }
        }
        LuaValue::Str(s) => Some(TableKey::Str(s.clone())),
        other => Some(TableKey::Obj(ObjKey(other.clone()))),
    }
}
