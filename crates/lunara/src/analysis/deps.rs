//! Nested-reference dependency analysis.
//!
//! Collects the set of functions a body references through closure-creating
//! nodes. The loader uses this to wire the flat function table; the emitter
//! uses it to index closure links.

use indexmap::IndexSet;

use crate::ir::{code::FunctionId, node::BodyNode, IRFunc};

/// The functions referenced as nested closures, in first-reference order.
#[derive(Debug, Default)]
pub struct DependencyInfo {
    refs: IndexSet<FunctionId>,
}

impl DependencyInfo {
    /// The referenced function ids, in first-reference order.
    pub fn iter(&self) -> impl Iterator<Item = &FunctionId> {
        self.refs.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.refs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }

    /// The link-table index of `id`, if referenced.
    #[must_use]
    pub fn index_of(&self, id: &FunctionId) -> Option<usize> {
        self.refs.get_index_of(id)
    }

    #[must_use]
    pub fn contains(&self, id: &FunctionId) -> bool {
        self.refs.contains(id)
    }
}

/// Collects the nested references of one function.
#[must_use]
pub fn analyze(func: &IRFunc) -> DependencyInfo {
    let mut info = DependencyInfo::default();
    for block in func.code.blocks() {
        for node in &block.body {
            if let BodyNode::Closure { func: target, .. } = node {
                info.refs.insert(target.clone());
            }
        }
    }
    info
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ast::build::{self, FnBuilder},
        ir::translate::translate_chunk,
    };

    #[test]
    fn closure_references_are_collected_in_order() {
        let fb = FnBuilder::main();
        let first = FnBuilder::function("first").finish(build::block(vec![build::ret(vec![build::int(1)])]));
        let second = FnBuilder::function("second").finish(build::block(vec![build::ret(vec![build::int(2)])]));
        let chunk = fb.finish(build::block(vec![build::ret(vec![
            build::function_expr(first),
            build::function_expr(second),
        ])]));
        let module = translate_chunk(&chunk).unwrap();
        let info = analyze(module.main());
        assert_eq!(info.len(), 2);
        let ids: Vec<String> = info.iter().map(ToString::to_string).collect();
        assert_eq!(ids, vec!["main/0", "main/1"]);
        // Every reference resolves within the module.
        for id in info.iter() {
            assert!(module.get(id).is_some());
        }
    }

    #[test]
    fn leaf_functions_have_no_dependencies() {
        let fb = FnBuilder::main();
        let chunk = fb.finish(build::block(vec![build::ret(vec![build::int(1)])]));
        let module = translate_chunk(&chunk).unwrap();
        assert!(analyze(module.main()).is_empty());
    }
}
