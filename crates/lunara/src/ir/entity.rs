//! IR entities: the value and variable identities the analyses reason about.
//!
//! `Val`s are single-assignment: produced by exactly one instruction. `Var`s
//! are user-visible variables that may be written many times and, when
//! captured by a nested function, are reified into a shared cell. `PhiVal`s
//! join values at control-flow merges and may be defined on several
//! predecessor paths. `MultiVal`s name variadic results (call returns and
//! varargs).

use serde::{Deserialize, Serialize};

macro_rules! entity_id {
    ($(#[$doc:meta])* $name:ident, $prefix:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(u32);

        impl $name {
            #[inline]
            #[must_use]
            pub fn new(index: u32) -> Self {
                Self(index)
            }

            #[inline]
            #[must_use]
            pub fn index(self) -> u32 {
                self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

entity_id!(
    /// A single-assignment value.
    Val,
    "v"
);
entity_id!(
    /// A join value at a block merge; defined on each predecessor path.
    PhiVal,
    "phi"
);
entity_id!(
    /// A variadic result: a call's return list or the varargs.
    MultiVal,
    "mv"
);
entity_id!(
    /// A user-visible variable slot.
    Var,
    "var"
);
entity_id!(
    /// A reference to a variable owned by an enclosing function.
    UpVar,
    "uv"
);

/// Any value-like entity, the key type of the value liveness sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AnyVal {
    Val(Val),
    Phi(PhiVal),
    Multi(MultiVal),
}

impl std::fmt::Display for AnyVal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Val(v) => v.fmt(f),
            Self::Phi(p) => p.fmt(f),
            Self::Multi(m) => m.fmt(f),
        }
    }
}

impl From<Val> for AnyVal {
    fn from(v: Val) -> Self {
        Self::Val(v)
    }
}

impl From<PhiVal> for AnyVal {
    fn from(p: PhiVal) -> Self {
        Self::Phi(p)
    }
}

impl From<MultiVal> for AnyVal {
    fn from(m: MultiVal) -> Self {
        Self::Multi(m)
    }
}

/// Hands out fresh entity ids while a function is being translated.
#[derive(Debug, Default)]
pub struct EntityAlloc {
    next_val: u32,
    next_phi: u32,
    next_multi: u32,
    next_var: u32,
}

impl EntityAlloc {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn val(&mut self) -> Val {
        let id = Val::new(self.next_val);
        self.next_val += 1;
        id
    }

    pub fn phi(&mut self) -> PhiVal {
        let id = PhiVal::new(self.next_phi);
        self.next_phi += 1;
        id
    }

    pub fn multi(&mut self) -> MultiVal {
        let id = MultiVal::new(self.next_multi);
        self.next_multi += 1;
        id
    }

    pub fn var(&mut self) -> Var {
        let id = Var::new(self.next_var);
        self.next_var += 1;
        id
    }
}
