//! Byte-string interning.
//!
//! Lua strings are immutable byte sequences. Interning gives every distinct
//! byte sequence at most one live allocation per registry, which makes
//! equality a pointer comparison on the hot path and keeps table keys cheap.
//!
//! The registry is weak-keyed: it holds [`Weak`] references so that strings
//! dropped by the program do not accumulate. Dead entries are swept lazily at
//! the entry of `intern` once enough garbage has built up, keeping the
//! mutation path short.

use std::{
    cell::RefCell,
    cmp::Ordering,
    fmt,
    hash::{Hash, Hasher},
    rc::{Rc, Weak},
};

use ahash::AHashMap;

/// Number of dead registry entries tolerated before a sweep.
const SWEEP_THRESHOLD: usize = 64;

/// An interned, immutable Lua byte string.
///
/// Two `LuaStr`s produced by the same [`StrInterner`] compare equal iff they
/// are the same allocation; cross-registry comparisons fall back to byte
/// equality. The precomputed hash makes `LuaStr` cheap as a table key.
#[derive(Clone)]
pub struct LuaStr(Rc<StrInner>);

struct StrInner {
    bytes: Box<[u8]>,
    hash: u64,
}

impl LuaStr {
    /// Creates a detached (uninterned) string.
    ///
    /// Used where no registry is at hand, e.g. error message payloads.
    /// Detached strings still compare by content against interned ones.
    #[must_use]
    pub fn detached(bytes: &[u8]) -> Self {
        Self(Rc::new(StrInner {
            bytes: bytes.into(),
            hash: hash_bytes(bytes),
        }))
    }

    /// Returns the raw bytes of the string.
    #[inline]
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0.bytes
    }

    /// Returns the string as UTF-8 if it is valid UTF-8.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.0.bytes).ok()
    }

    /// Returns the byte length.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.bytes.len()
    }

    /// Returns true if the string is empty.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.bytes.is_empty()
    }

    /// Returns the precomputed hash of the byte content.
    #[inline]
    #[must_use]
    pub fn precomputed_hash(&self) -> u64 {
        self.0.hash
    }
}

impl PartialEq for LuaStr {
    fn eq(&self, other: &Self) -> bool {
        // Same registry: identity. Different registries: content.
        Rc::ptr_eq(&self.0, &other.0) || (self.0.hash == other.0.hash && self.0.bytes == other.0.bytes)
    }
}

impl Eq for LuaStr {}

impl PartialOrd for LuaStr {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for LuaStr {
    /// Lua string order is lexicographic by bytes.
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.bytes.cmp(&other.0.bytes)
    }
}

impl Hash for LuaStr {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.0.hash);
    }
}

impl fmt::Debug for LuaStr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", String::from_utf8_lossy(&self.0.bytes))
    }
}

impl fmt::Display for LuaStr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0.bytes))
    }
}

/// Weak-keyed interning registry.
///
/// Owned by the call's state context and torn down with it. The interior
/// mutability keeps `intern` usable behind a shared reference, matching how
/// the runtime threads the context through dispatch.
#[derive(Default)]
pub struct StrInterner {
    map: RefCell<AHashMap<Box<[u8]>, Weak<StrInner>>>,
    /// Interns performed since the last sweep.
    since_sweep: std::cell::Cell<usize>,
}

impl StrInterner {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Interns a byte sequence, returning the canonical `LuaStr` for it.
    #[must_use]
    pub fn intern(&self, bytes: &[u8]) -> LuaStr {
        self.maybe_sweep();
        let mut map = self.map.borrow_mut();
        if let Some(weak) = map.get(bytes) {
            if let Some(inner) = weak.upgrade() {
                return LuaStr(inner);
            }
        }
        let hash = hash_bytes(bytes);
        let inner = Rc::new(StrInner {
            bytes: bytes.into(),
            hash,
        });
        map.insert(inner.bytes.clone(), Rc::downgrade(&inner));
        LuaStr(inner)
    }

    /// Interns an owned string.
    #[must_use]
    pub fn intern_str(&self, s: &str) -> LuaStr {
        self.intern(s.as_bytes())
    }

    /// Returns the number of live entries in the registry.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.map.borrow().values().filter(|w| w.strong_count() > 0).count()
    }

    /// Sweeps dead entries periodically.
    ///
    /// Run at the entry of `intern` so the mutation itself stays short; the
    /// interval amortises the scan cost over many interns.
    fn maybe_sweep(&self) {
        let count = self.since_sweep.get() + 1;
        if count < SWEEP_THRESHOLD {
            self.since_sweep.set(count);
            return;
        }
        self.map.borrow_mut().retain(|_, w| w.strong_count() > 0);
        self.since_sweep.set(0);
    }
}

impl fmt::Debug for StrInterner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StrInterner")
            .field("entries", &self.map.borrow().len())
            .finish()
    }
}

fn hash_bytes(bytes: &[u8]) -> u64 {
    use std::hash::BuildHasher;
    ahash::RandomState::with_seeds(0x9e37_79b9, 0x7f4a_7c15, 0xf39c_c060, 0x5ced_c834).hash_one(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_identity_preserving() {
        let interner = StrInterner::new();
        let a = interner.intern(b"hello");
        let b = interner.intern(b"hello");
        assert!(Rc::ptr_eq(&a.0, &b.0));
        assert_eq!(a, b);
    }

    #[test]
    fn distinct_contents_distinct_strings() {
        let interner = StrInterner::new();
        let a = interner.intern(b"a");
        let b = interner.intern(b"b");
        assert_ne!(a, b);
        assert!(a < b);
    }

    #[test]
    fn dead_strings_can_be_collected() {
        let interner = StrInterner::new();
        for i in 0..200 {
            let s = interner.intern(format!("transient-{i}").as_bytes());
            drop(s);
        }
        // Trigger a sweep with one more interning; the registry should not
        // retain hundreds of dead entries.
        let keep = interner.intern(b"keep");
        assert_eq!(interner.live_count(), 1);
        drop(keep);
    }

    #[test]
    fn byte_order_is_lexicographic() {
        let interner = StrInterner::new();
        let a = interner.intern(b"abc");
        let b = interner.intern(b"abd");
        let c = interner.intern(b"ab");
        assert!(a < b);
        assert!(c < a);
    }
}
