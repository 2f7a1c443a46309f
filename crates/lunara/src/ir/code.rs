//! The IR code model: labels, basic blocks, function bodies and modules.

use std::{fmt, rc::Rc};

use ahash::{AHashMap, AHashSet};
use serde::{Deserialize, Serialize};

use super::{
    entity::{AnyVal, Var},
    node::{BodyNode, Terminator},
};

/// A block identifier, unique within one function.
///
/// Translator-made labels are non-negative; the segmenter hands out negative
/// labels for blocks it synthesises when splitting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Label(pub i32);

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// A path from the module root identifying a function and its textual
/// nesting. The root (`main`) is the empty path; children append their
/// ordinal. Ordering is lexicographic on the path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FunctionId(Vec<u16>);

impl FunctionId {
    /// The module root: `main`.
    #[must_use]
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// The `index`-th nested function of `self`.
    #[must_use]
    pub fn child(&self, index: u16) -> Self {
        let mut path = self.0.clone();
        path.push(index);
        Self(path)
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Nesting depth; the root is 0.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn path(&self) -> &[u16] {
        &self.0
    }
}

impl fmt::Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "main")?;
        for index in &self.0 {
            write!(f, "/{index}")?;
        }
        Ok(())
    }
}

/// A label, an ordered body, and one terminator. Immutable once a
/// transformer has produced it; transformers build replacement blocks
/// rather than editing in place.
#[derive(Debug, Clone)]
pub struct BasicBlock {
    pub label: Label,
    pub body: Vec<BodyNode>,
    pub term: Terminator,
}

impl BasicBlock {
    #[must_use]
    pub fn new(label: Label, body: Vec<BodyNode>, term: Terminator) -> Self {
        Self { label, body, term }
    }

    /// Node count as the segmenter weighs it: the body plus the terminator.
    #[must_use]
    pub fn weight(&self) -> usize {
        self.body.len() + 1
    }
}

/// An ordered, non-empty list of basic blocks; the first is the entry.
#[derive(Debug, Clone)]
pub struct Code {
    blocks: Vec<BasicBlock>,
}

impl Code {
    /// Builds a code object.
    ///
    /// # Panics
    /// Panics if `blocks` is empty or a label is defined twice; both are
    /// translator bugs, not recoverable states.
    #[must_use]
    pub fn new(blocks: Vec<BasicBlock>) -> Self {
        assert!(!blocks.is_empty(), "code must contain at least one block");
        let mut seen = AHashSet::new();
        for block in &blocks {
            assert!(seen.insert(block.label), "duplicate label {}", block.label);
        }
        Self { blocks }
    }

    #[must_use]
    pub fn entry_label(&self) -> Label {
        self.blocks[0].label
    }

    #[must_use]
    pub fn blocks(&self) -> &[BasicBlock] {
        &self.blocks
    }

    #[must_use]
    pub fn block(&self, label: Label) -> Option<&BasicBlock> {
        self.blocks.iter().find(|b| b.label == label)
    }

    /// Total body-node count across all blocks.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.blocks.iter().map(|b| b.body.len()).sum()
    }

    /// Predecessor labels of every block.
    #[must_use]
    pub fn predecessors(&self) -> AHashMap<Label, Vec<Label>> {
        let mut preds: AHashMap<Label, Vec<Label>> = AHashMap::new();
        let mut succs = Vec::new();
        for block in &self.blocks {
            succs.clear();
            block.term.successors(&mut succs);
            for succ in &succs {
                preds.entry(*succ).or_default().push(block.label);
            }
        }
        preds
    }

    /// Checks the structural invariants: every referenced label is defined
    /// (CFG closure) and every value is defined at most once (SSA).
    ///
    /// Used by tests and debug assertions in the pipeline.
    pub fn validate(&self) -> Result<(), String> {
        let labels: AHashSet<Label> = self.blocks.iter().map(|b| b.label).collect();
        let mut succs = Vec::new();
        for block in &self.blocks {
            succs.clear();
            block.term.successors(&mut succs);
            for succ in &succs {
                if !labels.contains(succ) {
                    return Err(format!("{} references undefined label {succ}", block.label));
                }
            }
        }
        let mut defined: AHashSet<AnyVal> = AHashSet::new();
        for block in &self.blocks {
            for node in &block.body {
                if let Some(def) = node.def_val() {
                    // Phi definitions legitimately occur on several paths.
                    if !matches!(def, AnyVal::Phi(_)) && !defined.insert(def) {
                        return Err(format!("{def} defined more than once"));
                    }
                }
            }
        }
        Ok(())
    }
}

/// A function in IR form, immutable after its final transformation.
#[derive(Debug, Clone)]
pub struct IRFunc {
    pub id: FunctionId,
    /// Parameter variables in declaration order.
    pub params: Vec<Var>,
    /// Names of the function's upvalues, index-aligned with `UpVar` ids.
    pub upval_names: Vec<Rc<str>>,
    pub vararg: bool,
    pub code: Code,
}

impl IRFunc {
    #[must_use]
    pub fn upvalue_count(&self) -> usize {
        self.upval_names.len()
    }
}

/// An ordered collection of functions, one of which is the root.
///
/// Every nested reference made by any contained function resolves to a
/// function in the same module.
#[derive(Debug)]
pub struct Module {
    funcs: Vec<IRFunc>,
}

impl Module {
    /// Builds a module from translated functions.
    ///
    /// # Panics
    /// Panics if no function has the root id or ids collide.
    #[must_use]
    pub fn new(funcs: Vec<IRFunc>) -> Self {
        let mut seen = AHashSet::new();
        for func in &funcs {
            assert!(seen.insert(func.id.clone()), "duplicate function id {}", func.id);
        }
        assert!(
            funcs.iter().any(|f| f.id.is_root()),
            "module must contain the root function"
        );
        Self { funcs }
    }

    #[must_use]
    pub fn main(&self) -> &IRFunc {
        self.funcs
            .iter()
            .find(|f| f.id.is_root())
            .expect("module always contains the root function")
    }

    #[must_use]
    pub fn get(&self, id: &FunctionId) -> Option<&IRFunc> {
        self.funcs.iter().find(|f| &f.id == id)
    }

    #[must_use]
    pub fn funcs(&self) -> &[IRFunc] {
        &self.funcs
    }

    /// Replaces a function's body, keeping its position. Used by the
    /// transformation pipeline's immutable-then-replace style.
    pub fn replace(&mut self, id: &FunctionId, code: Code) {
        let func = self
            .funcs
            .iter_mut()
            .find(|f| &f.id == id)
            .expect("replace targets an existing function");
        func.code = code;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{entity::EntityAlloc, node::CallArgs};

    fn trivial_code() -> Code {
        let mut alloc = EntityAlloc::new();
        let v = alloc.val();
        Code::new(vec![BasicBlock::new(
            Label(0),
            vec![BodyNode::LoadInt { dest: v, value: 1 }],
            Terminator::Ret {
                args: CallArgs::fixed(vec![v]),
            },
        )])
    }

    #[test]
    fn validate_accepts_well_formed_code() {
        assert_eq!(trivial_code().validate(), Ok(()));
    }

    #[test]
    fn validate_rejects_dangling_labels() {
        let code = Code::new(vec![BasicBlock::new(
            Label(0),
            vec![],
            Terminator::ToNext { target: Label(9) },
        )]);
        assert!(code.validate().is_err());
    }

    #[test]
    fn validate_rejects_double_definition() {
        let mut alloc = EntityAlloc::new();
        let v = alloc.val();
        let code = Code::new(vec![BasicBlock::new(
            Label(0),
            vec![
                BodyNode::LoadInt { dest: v, value: 1 },
                BodyNode::LoadInt { dest: v, value: 2 },
            ],
            Terminator::Ret {
                args: CallArgs::fixed(vec![v]),
            },
        )]);
        assert!(code.validate().is_err());
    }

    #[test]
    fn function_ids_order_lexicographically() {
        let root = FunctionId::root();
        let a = root.child(0);
        let b = root.child(1);
        let aa = a.child(0);
        assert!(root < a);
        assert!(a < aa);
        assert!(aa < b);
        assert_eq!(aa.to_string(), "main/0/0");
    }
}
