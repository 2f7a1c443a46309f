//! Control-flow cleanup: straight-line block merging and unreachable-block
//! pruning.

use ahash::{AHashMap, AHashSet};

use crate::ir::code::{BasicBlock, Code, Label};

/// Collapses `a → b` edges where `a` ends in an unconditional jump to `b`
/// and `b` has exactly one predecessor: `b`'s body is appended to `a` and
/// `a` takes over `b`'s terminator. Runs to a fixed point.
#[must_use]
pub fn merge_blocks(code: &Code) -> Code {
    let mut blocks: Vec<BasicBlock> = code.blocks().to_vec();

    loop {
        // Predecessor counts by label reference; the entry has an implicit
        // extra predecessor (the function itself), so it is never merged away.
        let mut pred_count: AHashMap<Label, usize> = AHashMap::new();
        *pred_count.entry(blocks[0].label).or_default() += 1;
        let mut succs = Vec::new();
        for block in &blocks {
            succs.clear();
            block.term.successors(&mut succs);
            for succ in &succs {
                *pred_count.entry(*succ).or_default() += 1;
            }
        }

        let mut merged = None;
        for (index, block) in blocks.iter().enumerate() {
            if let crate::ir::Terminator::ToNext { target } = block.term {
                if target != block.label && pred_count.get(&target) == Some(&1) {
                    merged = Some((index, target));
                    break;
                }
            }
        }

        let Some((into_index, target)) = merged else {
            return Code::new(blocks);
        };

        let target_pos = blocks
            .iter()
            .position(|b| b.label == target)
            .expect("merge target exists: CFG closure");
        let absorbed = blocks.remove(target_pos);
        let into_index = if target_pos < into_index { into_index - 1 } else { into_index };
        let into = &mut blocks[into_index];
        into.body.extend(absorbed.body);
        into.term = absorbed.term;
    }
}

/// Removes blocks unreachable from the entry, found by a visit over label
/// references.
#[must_use]
pub fn prune_unreachable(code: &Code) -> Code {
    let mut reachable = AHashSet::new();
    let mut stack = vec![code.entry_label()];
    let mut succs = Vec::new();
    while let Some(label) = stack.pop() {
        if !reachable.insert(label) {
            continue;
        }
        if let Some(block) = code.block(label) {
            succs.clear();
            block.term.successors(&mut succs);
            for succ in &succs {
                if !reachable.contains(succ) {
                    stack.push(*succ);
                }
            }
        }
    }
    let blocks = code
        .blocks()
        .iter()
        .filter(|b| reachable.contains(&b.label))
        .cloned()
        .collect();
    Code::new(blocks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ast::build::{self, FnBuilder},
        ir::{translate::translate_chunk, Terminator},
    };

    #[test]
    fn straight_line_chains_collapse() {
        let mut fb = FnBuilder::main();
        let x = fb.local("x");
        // An if with an empty else produces jump chains worth merging.
        let chunk = fb.finish(build::block(vec![
            build::local_decl(vec![x], vec![build::int(1)]),
            build::if_then(
                build::local_ref(x),
                build::block(vec![build::assign_local(x, build::int(2))]),
                None,
            ),
            build::ret(vec![build::local_ref(x)]),
        ]));
        let module = translate_chunk(&chunk).unwrap();
        let before = module.main().code.blocks().len();
        let merged = merge_blocks(&prune_unreachable(&module.main().code));
        assert!(merged.blocks().len() < before);
        assert!(merged.validate().is_ok());
    }

    #[test]
    fn merging_preserves_node_sequences() {
        let fb = FnBuilder::main();
        let chunk = fb.finish(build::block(vec![build::ret(vec![build::binop(
            crate::ast::BinAstOp::Add,
            build::int(1),
            build::int(2),
        )])]));
        let module = translate_chunk(&chunk).unwrap();
        let original = prune_unreachable(&module.main().code);
        let merged = merge_blocks(&original);
        assert_eq!(merged.node_count(), original.node_count());
    }

    #[test]
    fn code_after_a_return_is_unreachable_and_pruned() {
        let fb = FnBuilder::main();
        let chunk = fb.finish(build::block(vec![
            build::ret(vec![build::int(1)]),
            build::ret(vec![build::int(2)]),
        ]));
        let module = translate_chunk(&chunk).unwrap();
        let pruned = prune_unreachable(&module.main().code);
        // Only the entry survives; its terminator returns 1.
        assert_eq!(pruned.blocks().len(), 1);
        assert!(matches!(pruned.blocks()[0].term, Terminator::Ret { .. }));
    }

    #[test]
    fn self_loops_are_not_merged() {
        let fb = FnBuilder::main();
        let chunk = fb.finish(build::block(vec![
            build::while_loop(build::int(1), build::block(vec![])),
            build::ret(vec![]),
        ]));
        let module = translate_chunk(&chunk).unwrap();
        let merged = merge_blocks(&prune_unreachable(&module.main().code));
        assert!(merged.validate().is_ok());
    }
}
