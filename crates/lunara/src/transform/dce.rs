//! Dead-code pruning.
//!
//! Removes constant loads, variable loads and stores, and variadic
//! extractions whose destination is dead on exit. Stores to reified
//! variables survive unconditionally: the cell is observable through
//! captures regardless of local liveness.

use crate::{
    analysis::{liveness::LivenessInfo, typing::TypeInfo},
    ir::{
        code::{BasicBlock, Code},
        node::BodyNode,
    },
};

/// Prunes one function's dead nodes. Returns the new code and whether
/// anything was removed; callers recompute liveness and iterate.
#[must_use]
pub fn prune(code: &Code, liveness: &LivenessInfo, types: &TypeInfo) -> (Code, bool) {
    let mut changed = false;
    let mut blocks = Vec::with_capacity(code.blocks().len());

    for block in code.blocks() {
        let block_liveness = liveness.block(block.label);
        let mut body = Vec::with_capacity(block.body.len());
        for (index, node) in block.body.iter().enumerate() {
            let live_out = block_liveness.and_then(|bl| bl.body.get(index));
            let dead = match (node, live_out) {
                (
                    BodyNode::LoadNil { dest }
                    | BodyNode::LoadBool { dest, .. }
                    | BodyNode::LoadInt { dest, .. }
                    | BodyNode::LoadFloat { dest, .. }
                    | BodyNode::LoadStr { dest, .. }
                    | BodyNode::MultiGet { dest, .. }
                    | BodyNode::VarLoad { dest, .. },
                    Some(entry),
                ) => !entry.out_val.contains(&(*dest).into()),
                (BodyNode::VarStore { var, .. }, Some(entry)) => {
                    !types.is_reified(*var) && !entry.out_var.contains(var)
                }
                _ => false,
            };
            if dead {
                changed = true;
            } else {
                body.push(node.clone());
            }
        }
        blocks.push(BasicBlock::new(block.label, body, block.term.clone()));
    }

    (Code::new(blocks), changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        analysis::{liveness, typing},
        ast::build::{self, FnBuilder},
        ir::translate::translate_chunk,
    };

    #[test]
    fn unused_constant_loads_are_pruned() {
        let mut fb = FnBuilder::main();
        let x = fb.local("x");
        // `x` is written then never read; both the load and the store die.
        let chunk = fb.finish(build::block(vec![
            build::local_decl(vec![x], vec![build::int(1)]),
            build::assign_local(x, build::int(2)),
            build::ret(vec![build::int(3)]),
        ]));
        let module = translate_chunk(&chunk).unwrap();
        let func = module.main();
        let types = typing::infer(func);
        let mut code = func.code.clone();
        loop {
            let live = liveness::analyze(&code);
            let (next, changed) = prune(&code, &live, &types);
            code = next;
            if !changed {
                break;
            }
        }
        let stores = code
            .blocks()
            .iter()
            .flat_map(|b| &b.body)
            .filter(|n| matches!(n, BodyNode::VarStore { .. }))
            .count();
        assert_eq!(stores, 0, "dead store should be pruned");
        assert!(code.validate().is_ok());
    }

    #[test]
    fn stores_to_reified_variables_survive() {
        let mut fb = FnBuilder::main();
        let x = fb.local("x");
        fb.capture(x);
        let mut inner = FnBuilder::function("inner");
        let ux = inner.upval_of_local("x", x);
        let inner_body = inner.finish(build::block(vec![build::ret(vec![build::upval_ref(ux)])]));
        let chunk = fb.finish(build::block(vec![
            build::local_decl(vec![x], vec![build::int(1)]),
            build::assign_local(x, build::int(2)),
            build::ret(vec![build::function_expr(inner_body)]),
        ]));
        let module = translate_chunk(&chunk).unwrap();
        let func = module.main();
        let types = typing::infer(func);
        let live = liveness::analyze(&func.code);
        let (code, _) = prune(&func.code, &live, &types);
        let stores = code
            .blocks()
            .iter()
            .flat_map(|b| &b.body)
            .filter(|n| matches!(n, BodyNode::VarStore { .. }))
            .count();
        assert_eq!(stores, 1, "store through a captured cell must survive");
    }

    #[test]
    fn live_code_is_untouched() {
        let mut fb = FnBuilder::main();
        let x = fb.local("x");
        let chunk = fb.finish(build::block(vec![
            build::local_decl(vec![x], vec![build::int(1)]),
            build::ret(vec![build::local_ref(x)]),
        ]));
        let module = translate_chunk(&chunk).unwrap();
        let func = module.main();
        let types = typing::infer(func);
        let live = liveness::analyze(&func.code);
        let before = func.code.node_count();
        let (code, changed) = prune(&func.code, &live, &types);
        assert!(!changed);
        assert_eq!(code.node_count(), before);
    }
}
