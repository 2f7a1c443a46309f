//! Liveness analysis: a backward dataflow over IR nodes.
//!
//! For every node the analysis records which variables and which value-like
//! entities are live on entry and on exit. An entity is live-in at a node iff
//! some path from the node uses it before redefining it; live-out is the
//! union of the live-ins of all successors.
//!
//! One deliberate wrinkle, kept from the original system: a `VarStore` is a
//! *use* of its destination variable, not a definition. The store writes
//! through the variable's identity (for reified variables, its cell), so the
//! identity must stay live up to the store.

use std::collections::VecDeque;

use ahash::{AHashMap, AHashSet};

use crate::ir::{
    entity::{AnyVal, Var},
    code::{Code, Label},
    node::Terminator,
};

/// Live sets around one node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Entry {
    pub in_var: AHashSet<Var>,
    pub out_var: AHashSet<Var>,
    pub in_val: AHashSet<AnyVal>,
    pub out_val: AHashSet<AnyVal>,
}

/// Liveness entries for one block: one per body node plus the terminator.
#[derive(Debug, Clone, Default)]
pub struct BlockLiveness {
    pub body: Vec<Entry>,
    pub term: Entry,
}

impl BlockLiveness {
    /// The live-in sets at the block boundary.
    #[must_use]
    pub fn block_in(&self) -> (&AHashSet<Var>, &AHashSet<AnyVal>) {
        match self.body.first() {
            Some(first) => (&first.in_var, &first.in_val),
            None => (&self.term.in_var, &self.term.in_val),
        }
    }
}

/// Per-function liveness results.
#[derive(Debug, Default)]
pub struct LivenessInfo {
    blocks: AHashMap<Label, BlockLiveness>,
}

impl LivenessInfo {
    #[must_use]
    pub fn block(&self, label: Label) -> Option<&BlockLiveness> {
        self.blocks.get(&label)
    }

    /// The entry of the `index`-th body node of `label`.
    #[must_use]
    pub fn node_entry(&self, label: Label, index: usize) -> Option<&Entry> {
        self.blocks.get(&label)?.body.get(index)
    }

    /// The entry of the terminator of `label`.
    #[must_use]
    pub fn term_entry(&self, label: Label) -> Option<&Entry> {
        self.blocks.get(&label).map(|b| &b.term)
    }
}

/// Computes liveness for a function body.
///
/// Iterates a worklist of labels seeded breadth-first from the entry until
/// no live set changes.
#[must_use]
pub fn analyze(code: &Code) -> LivenessInfo {
    let mut info = LivenessInfo::default();
    for block in code.blocks() {
        info.blocks.insert(
            block.label,
            BlockLiveness {
                body: vec![Entry::default(); block.body.len()],
                term: Entry::default(),
            },
        );
    }

    let preds = code.predecessors();

    // Breadth-first seeding from the entry keeps the first sweep cheap; the
    // worklist then follows changes backwards through predecessors.
    let mut worklist: VecDeque<Label> = VecDeque::new();
    let mut seen = AHashSet::new();
    worklist.push_back(code.entry_label());
    seen.insert(code.entry_label());
    let mut order = Vec::new();
    let mut succs = Vec::new();
    while let Some(label) = worklist.pop_front() {
        order.push(label);
        if let Some(block) = code.block(label) {
            succs.clear();
            block.term.successors(&mut succs);
            for succ in &succs {
                if seen.insert(*succ) {
                    worklist.push_back(*succ);
                }
            }
        }
    }
    // Unreachable blocks still get entries; append them after the seeded
    // order so their sets are computed too.
    for block in code.blocks() {
        if seen.insert(block.label) {
            order.push(block.label);
        }
    }

    let mut queue: VecDeque<Label> = order.iter().rev().copied().collect();
    let mut queued: AHashSet<Label> = queue.iter().copied().collect();

    while let Some(label) = queue.pop_front() {
        queued.remove(&label);
        let changed = process_block(code, &mut info, label);
        if changed {
            if let Some(pred_labels) = preds.get(&label) {
                for pred in pred_labels {
                    if queued.insert(*pred) {
                        queue.push_back(*pred);
                    }
                }
            }
        }
    }

    info
}

/// Recomputes one block backwards; returns whether its block-in changed.
fn process_block(code: &Code, info: &mut LivenessInfo, label: Label) -> bool {
    let Some(block) = code.block(label) else {
        return false;
    };

    // Terminator out-sets: union of successors' block-ins.
    let mut out_var = AHashSet::new();
    let mut out_val = AHashSet::new();
    let mut succs = Vec::new();
    block.term.successors(&mut succs);
    for succ in &succs {
        if let Some(succ_liveness) = info.blocks.get(succ) {
            let (vars, vals) = succ_liveness.block_in();
            out_var.extend(vars.iter().copied());
            out_val.extend(vals.iter().copied());
        }
    }

    let (old_in, old_in_val) = {
        let seeded = info.blocks.get(&label).expect("all labels are seeded");
        let (vars, vals) = seeded.block_in();
        (vars.clone(), vals.clone())
    };

    let liveness = info.blocks.get_mut(&label).expect("all labels are seeded");

    // Terminator: in = use ∪ out (terminators define nothing).
    let mut used_vals = Vec::new();
    block.term.uses_vals(&mut used_vals);
    liveness.term.out_var = out_var.clone();
    liveness.term.out_val = out_val.clone();
    liveness.term.in_var = out_var;
    let mut in_val = out_val;
    in_val.extend(used_vals.iter().copied());
    liveness.term.in_val = in_val;

    // Body nodes, last to first: in = use ∪ (out − def).
    let mut next_in_var = liveness.term.in_var.clone();
    let mut next_in_val = liveness.term.in_val.clone();
    let mut uses_v = Vec::new();
    let mut uses_var = Vec::new();
    for (index, node) in block.body.iter().enumerate().rev() {
        let entry = &mut liveness.body[index];
        entry.out_var = next_in_var.clone();
        entry.out_val = next_in_val.clone();

        let mut in_var = entry.out_var.clone();
        let mut in_val = entry.out_val.clone();
        if let Some(def) = node.def_val() {
            in_val.remove(&def);
        }
        if let Some(def) = node.def_var() {
            in_var.remove(&def);
        }
        uses_v.clear();
        node.uses_vals(&mut uses_v);
        in_val.extend(uses_v.iter().copied());
        uses_var.clear();
        node.uses_vars(&mut uses_var);
        in_var.extend(uses_var.iter().copied());

        entry.in_var = in_var.clone();
        entry.in_val = in_val.clone();
        next_in_var = in_var;
        next_in_val = in_val;
    }

    let (new_in_var, new_in_val) = liveness.block_in();
    *new_in_var != old_in || *new_in_val != old_in_val
}

/// True when the terminator is a control transfer with no successors.
#[must_use]
pub fn is_exit(term: &Terminator) -> bool {
    matches!(term, Terminator::Ret { .. } | Terminator::TCall { .. })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ast::build::{self, FnBuilder},
        ir::{node::BodyNode, translate::translate_chunk},
    };

    #[test]
    fn used_values_are_live_in() {
        let fb = FnBuilder::main();
        let chunk = fb.finish(build::block(vec![build::ret(vec![build::binop(
            crate::ast::BinAstOp::Add,
            build::int(1),
            build::int(2),
        )])]));
        let module = translate_chunk(&chunk).unwrap();
        let main = module.main();
        let info = analyze(&main.code);
        let entry = &main.code.blocks()[0];
        // At the BinOp node, both constant operands must be live-in.
        let (index, node) = entry
            .body
            .iter()
            .enumerate()
            .find(|(_, n)| matches!(n, BodyNode::BinOp { .. }))
            .unwrap();
        let mut uses = Vec::new();
        node.uses_vals(&mut uses);
        let node_entry = info.node_entry(entry.label, index).unwrap();
        for used in uses {
            assert!(node_entry.in_val.contains(&used), "{used} should be live-in");
        }
    }

    #[test]
    fn loop_carried_variables_stay_live_around_the_back_edge() {
        let mut fb = FnBuilder::main();
        let sum = fb.local("sum");
        let i = fb.local("i");
        let chunk = fb.finish(build::block(vec![
            build::local_decl(vec![sum], vec![build::int(0)]),
            build::numeric_for(
                i,
                build::int(1),
                build::int(10),
                None,
                build::block(vec![build::assign_local(
                    sum,
                    build::binop(crate::ast::BinAstOp::Add, build::local_ref(sum), build::local_ref(i)),
                )]),
            ),
            build::ret(vec![build::local_ref(sum)]),
        ]));
        let module = translate_chunk(&chunk).unwrap();
        let main = module.main();
        let info = analyze(&main.code);
        // `sum`'s variable must be live-in at the loop test block: the body
        // reads it and the exit returns it.
        let sum_var = main.code.blocks()[0]
            .body
            .iter()
            .find_map(|n| match n {
                BodyNode::VarInit { var, .. } => Some(*var),
                _ => None,
            })
            .unwrap();
        let live_somewhere = main.code.blocks().iter().skip(1).any(|b| {
            info.block(b.label)
                .map(|l| l.block_in().0.contains(&sum_var))
                .unwrap_or(false)
        });
        assert!(live_somewhere, "sum must be live across the loop");
    }

    #[test]
    fn var_store_counts_as_a_use_of_its_destination() {
        let mut fb = FnBuilder::main();
        let x = fb.local("x");
        let chunk = fb.finish(build::block(vec![
            build::local_decl(vec![x], vec![build::int(1)]),
            build::assign_local(x, build::int(2)),
            build::ret(vec![]),
        ]));
        let module = translate_chunk(&chunk).unwrap();
        let main = module.main();
        let info = analyze(&main.code);
        let entry = &main.code.blocks()[0];
        let (index, _) = entry
            .body
            .iter()
            .enumerate()
            .find(|(_, n)| matches!(n, BodyNode::VarStore { .. }))
            .unwrap();
        let var = entry
            .body
            .iter()
            .find_map(|n| match n {
                BodyNode::VarStore { var, .. } => Some(*var),
                _ => None,
            })
            .unwrap();
        let node_entry = info.node_entry(entry.label, index).unwrap();
        assert!(
            node_entry.in_var.contains(&var),
            "the stored variable's identity is read by the store"
        );
    }
}
