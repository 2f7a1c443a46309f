//! The compiled-function artifact and its serialized class form.
//!
//! A [`CompiledFunction`] is what the emitter produces for one IR function:
//! an instruction vector plus the metadata its runtime frame needs. The
//! serialized form — a class name and an opaque postcard byte vector — is
//! the loadable unit embedders persist and ship ([`CompiledClass`]).
//!
//! Numeric literals are immediate in their instructions; byte-string
//! constants live in the constant pool and are interned when the module is
//! linked, the moral equivalent of a synthetic static constructor running
//! once per load.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use super::insn::{Insn, ResumePoint};
use crate::ir::FunctionId;

/// The fixed-arity invoke entries the runtime supports (`invoke(ctx, a1..aK)`
/// for `K` up to this; beyond it, the packed-array entry point is used).
pub const MAX_FIXED_PARAMS: u16 = 5;

/// A constant-pool entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConstValue {
    /// A byte-string literal.
    Bytes(Vec<u8>),
}

/// One compiled function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledFunction {
    pub id: FunctionId,
    /// Name derived from the id under the configured translator.
    pub class_name: String,
    /// The arity class: `0` is the packed-array entry point (vararg or more
    /// than [`MAX_FIXED_PARAMS`] parameters); otherwise `params + 1`.
    pub kind: u8,
    pub param_count: u16,
    pub vararg: bool,
    /// Size of the register window (the slot count).
    pub reg_count: u16,
    /// Upvalue field names, deduplicated.
    pub upval_names: Vec<String>,
    pub consts: Vec<ConstValue>,
    pub insns: Vec<Insn>,
    /// Resumption points, indexed by the point ids instructions carry.
    pub resume_points: Vec<ResumePoint>,
    /// Functions referenced by `MakeClosure`, in link-table order.
    pub links: Vec<FunctionId>,
}

impl CompiledFunction {
    /// Whether the function can suspend at all. `resume` on a
    /// non-suspendable function is an error.
    #[must_use]
    pub fn suspendable(&self) -> bool {
        !self.resume_points.is_empty()
    }

    /// Pure functions (no upvalues) share one singleton instance.
    #[must_use]
    pub fn is_pure(&self) -> bool {
        self.upval_names.is_empty()
    }

    /// Serializes into the loadable class form.
    pub fn to_class(&self) -> Result<CompiledClass, postcard::Error> {
        Ok(CompiledClass {
            class_name: self.class_name.clone(),
            bytes: postcard::to_allocvec(self)?,
        })
    }

    /// Reconstructs a function from its class form.
    pub fn from_class(class: &CompiledClass) -> Result<Self, postcard::Error> {
        postcard::from_bytes(&class.bytes)
    }
}

/// A class name plus the platform's loadable byte vector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompiledClass {
    pub class_name: String,
    pub bytes: Vec<u8>,
}

/// Derives class names from function ids.
pub trait ClassNameTranslator {
    fn class_name(&self, id: &FunctionId) -> String;
}

/// The default scheme: `<prefix>.Main`, nested functions appending `$n`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultNameTranslator {
    pub prefix: String,
}

impl Default for DefaultNameTranslator {
    fn default() -> Self {
        Self {
            prefix: "lua".to_owned(),
        }
    }
}

impl ClassNameTranslator for DefaultNameTranslator {
    fn class_name(&self, id: &FunctionId) -> String {
        let mut name = format!("{}.Main", self.prefix);
        for index in id.path() {
            name.push('$');
            name.push_str(&index.to_string());
        }
        name
    }
}

/// A compiled module: every function of the chunk keyed by id, in
/// compilation order. The flat map plus per-function link tables replace
/// nested-class metadata.
#[derive(Debug, Serialize, Deserialize)]
pub struct CompiledModule {
    functions: IndexMap<FunctionId, CompiledFunction>,
}

impl CompiledModule {
    /// Builds a module from compiled functions.
    ///
    /// # Panics
    /// Panics if the root function is missing or a link dangles; both are
    /// emitter bugs.
    #[must_use]
    pub fn new(functions: Vec<CompiledFunction>) -> Self {
        let functions: IndexMap<FunctionId, CompiledFunction> =
            functions.into_iter().map(|f| (f.id.clone(), f)).collect();
        assert!(
            functions.contains_key(&FunctionId::root()),
            "compiled module must contain the root function"
        );
        for func in functions.values() {
            for link in &func.links {
                assert!(functions.contains_key(link), "dangling link {link} in {}", func.id);
            }
        }
        Self { functions }
    }

    #[must_use]
    pub fn get(&self, id: &FunctionId) -> Option<&CompiledFunction> {
        self.functions.get(id)
    }

    #[must_use]
    pub fn main(&self) -> &CompiledFunction {
        &self.functions[&FunctionId::root()]
    }

    pub fn iter(&self) -> impl Iterator<Item = &CompiledFunction> {
        self.functions.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.functions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Serializes the whole module.
    pub fn dump(&self) -> Result<Vec<u8>, postcard::Error> {
        postcard::to_allocvec(self)
    }

    /// Deserializes a module produced by [`Self::dump`].
    pub fn load(bytes: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(bytes)
    }

    /// The per-function class forms, for hosts that persist classes
    /// individually.
    pub fn to_classes(&self) -> Result<Vec<CompiledClass>, postcard::Error> {
        self.functions.values().map(CompiledFunction::to_class).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_translation_follows_nesting() {
        let translator = DefaultNameTranslator::default();
        let root = FunctionId::root();
        assert_eq!(translator.class_name(&root), "lua.Main");
        assert_eq!(translator.class_name(&root.child(0).child(2)), "lua.Main$0$2");
    }

    #[test]
    fn class_round_trip() {
        let func = CompiledFunction {
            id: FunctionId::root(),
            class_name: "lua.Main".to_owned(),
            kind: 0,
            param_count: 0,
            vararg: true,
            reg_count: 2,
            upval_names: vec!["_ENV".to_owned()],
            consts: vec![ConstValue::Bytes(b"hello".to_vec())],
            insns: vec![Insn::LoadInt { dst: 0, value: 42 }],
            resume_points: Vec::new(),
            links: Vec::new(),
        };
        let class = func.to_class().unwrap();
        assert_eq!(class.class_name, "lua.Main");
        let back = CompiledFunction::from_class(&class).unwrap();
        assert_eq!(back, func);
        assert!(!back.suspendable());
        assert!(!back.is_pure());
    }
}
