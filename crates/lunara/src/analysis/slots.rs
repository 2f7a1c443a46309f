//! Slot allocation: mapping variables and values to storage indices.
//!
//! Slots become the registers of the emitted function and the layout of its
//! saved state. Parameters pre-allocate slots `0..n-1` in declaration order;
//! everything else receives the lowest index free at its definition, where
//! "free" means not occupied by an entity live across that node. Entities
//! with overlapping live ranges therefore never share a slot.
//!
//! `MultiVal`s are not slotted: variadic results live in the return buffer.
//! `UpVar`s are not slotted: upvalues are fields of the closure. Reified
//! variables still receive a slot — it holds the variable cell reference.

use std::collections::VecDeque;

use ahash::{AHashMap, AHashSet};

use crate::{
    analysis::liveness::LivenessInfo,
    ir::{
        entity::{AnyVal, PhiVal, Val, Var},
        IRFunc, Label,
    },
};

/// A slottable entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotKey {
    Var(Var),
    Val(Val),
    Phi(PhiVal),
}

impl From<Var> for SlotKey {
    fn from(v: Var) -> Self {
        Self::Var(v)
    }
}

impl From<Val> for SlotKey {
    fn from(v: Val) -> Self {
        Self::Val(v)
    }
}

impl From<PhiVal> for SlotKey {
    fn from(p: PhiVal) -> Self {
        Self::Phi(p)
    }
}

/// The slot assignment of one function.
#[derive(Debug, Default)]
pub struct SlotAllocInfo {
    map: AHashMap<SlotKey, u16>,
    slot_count: u16,
}

impl SlotAllocInfo {
    /// The slot of an entity.
    ///
    /// # Panics
    /// Panics if the entity was never allocated; that is a pipeline bug
    /// (a use without a reachable definition).
    #[must_use]
    pub fn slot(&self, key: impl Into<SlotKey>) -> u16 {
        let key = key.into();
        *self
            .map
            .get(&key)
            .unwrap_or_else(|| panic!("no slot allocated for {key:?}"))
    }

    #[must_use]
    pub fn slot_opt(&self, key: impl Into<SlotKey>) -> Option<u16> {
        self.map.get(&key.into()).copied()
    }

    /// Total number of slots the function needs.
    #[must_use]
    pub fn slot_count(&self) -> u16 {
        self.slot_count
    }

    fn insert(&mut self, key: SlotKey, slot: u16) {
        self.map.insert(key, slot);
        self.slot_count = self.slot_count.max(slot + 1);
    }
}

/// Allocates slots for one function from its liveness results.
///
/// Blocks are visited breadth-first from the entry. At each node the slots
/// occupied by entities live both into and out of the node are unavailable;
/// a definition takes the lowest remaining index. A `PhiVal` assignment
/// accepts the mapping a sibling predecessor already made.
#[must_use]
pub fn allocate(func: &IRFunc, liveness: &LivenessInfo) -> SlotAllocInfo {
    let mut info = SlotAllocInfo::default();

    for (index, param) in func.params.iter().enumerate() {
        info.insert(SlotKey::Var(*param), u16::try_from(index).expect("parameter count exceeds u16"));
    }

    let mut queue = VecDeque::new();
    let mut visited = AHashSet::new();
    queue.push_back(func.code.entry_label());
    visited.insert(func.code.entry_label());
    let mut succs = Vec::new();

    while let Some(label) = queue.pop_front() {
        allocate_block(func, liveness, label, &mut info);
        if let Some(block) = func.code.block(label) {
            succs.clear();
            block.term.successors(&mut succs);
            for succ in &succs {
                if visited.insert(*succ) {
                    queue.push_back(*succ);
                }
            }
        }
    }

    info
}

fn allocate_block(func: &IRFunc, liveness: &LivenessInfo, label: Label, info: &mut SlotAllocInfo) {
    let Some(block) = func.code.block(label) else {
        return;
    };
    let Some(block_liveness) = liveness.block(label) else {
        return;
    };

    for (index, node) in block.body.iter().enumerate() {
        let entry = &block_liveness.body[index];

        let val_def = node.def_val().and_then(|def| match def {
            AnyVal::Val(v) => Some(SlotKey::Val(v)),
            AnyVal::Phi(p) => Some(SlotKey::Phi(p)),
            AnyVal::Multi(_) => None,
        });
        let var_def = node.def_var().map(SlotKey::Var);

        for def in [val_def, var_def].into_iter().flatten() {
            // A phi assignment accepts the mapping a sibling predecessor
            // made; variables keep their slot across re-initialisation on
            // another path. Plain values are single-assignment.
            if !matches!(def, SlotKey::Val(_)) && info.map.contains_key(&def) {
                continue;
            }
            // Slots of entities live across this node are occupied.
            let mut occupied = AHashSet::new();
            for var in entry.in_var.intersection(&entry.out_var) {
                if let Some(slot) = info.map.get(&SlotKey::Var(*var)) {
                    occupied.insert(*slot);
                }
            }
            for val in entry.in_val.intersection(&entry.out_val) {
                let key = match val {
                    AnyVal::Val(v) => SlotKey::Val(*v),
                    AnyVal::Phi(p) => SlotKey::Phi(*p),
                    AnyVal::Multi(_) => continue,
                };
                if let Some(slot) = info.map.get(&key) {
                    occupied.insert(*slot);
                }
            }
            let mut candidate = 0u16;
            while occupied.contains(&candidate) {
                candidate += 1;
            }
            info.insert(def, candidate);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        analysis::liveness,
        ast::build::{self, FnBuilder},
        ir::{node::BodyNode, translate::translate_chunk},
    };

    fn compile(chunk: &crate::ast::FunctionBody) -> (crate::ir::Module, SlotAllocInfo, LivenessInfo) {
        let module = translate_chunk(chunk).unwrap();
        let live = liveness::analyze(&module.main().code);
        let slots = allocate(module.main(), &live);
        let module_out = module;
        (module_out, slots, live)
    }

    #[test]
    fn parameters_take_the_first_slots_in_order() {
        let mut fb = FnBuilder::function("f");
        let a = fb.param("a");
        let b = fb.param("b");
        let body = fb.finish(build::block(vec![build::ret(vec![
            build::local_ref(a),
            build::local_ref(b),
        ])]));
        let module = translate_chunk(&body).unwrap();
        let func = module.main();
        let live = liveness::analyze(&func.code);
        let slots = allocate(func, &live);
        assert_eq!(slots.slot(func.params[0]), 0);
        assert_eq!(slots.slot(func.params[1]), 1);
    }

    #[test]
    fn simultaneously_live_entities_get_distinct_slots() {
        let mut fb = FnBuilder::main();
        let x = fb.local("x");
        let y = fb.local("y");
        let chunk = fb.finish(build::block(vec![
            build::local_decl(vec![x], vec![build::int(1)]),
            build::local_decl(vec![y], vec![build::int(2)]),
            build::ret(vec![build::local_ref(x), build::local_ref(y)]),
        ]));
        let (module, slots, live) = compile(&chunk);
        let main = module.main();
        // Check the quantified invariant directly at every node: any two
        // live-across entities map to distinct slots.
        for block in main.code.blocks() {
            let bl = live.block(block.label).unwrap();
            for entry in &bl.body {
                let mut seen = std::collections::HashMap::new();
                for var in entry.in_var.intersection(&entry.out_var) {
                    if let Some(slot) = slots.slot_opt(*var) {
                        assert!(
                            seen.insert(slot, format!("{var}")).is_none(),
                            "slot {slot} shared at a node"
                        );
                    }
                }
                for val in entry.in_val.intersection(&entry.out_val) {
                    let slot = match val {
                        crate::ir::AnyVal::Val(v) => slots.slot_opt(*v),
                        crate::ir::AnyVal::Phi(p) => slots.slot_opt(*p),
                        crate::ir::AnyVal::Multi(_) => None,
                    };
                    if let Some(slot) = slot {
                        assert!(
                            seen.insert(slot, format!("{val}")).is_none(),
                            "slot {slot} shared at a node"
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn phi_values_share_their_slot_across_predecessors() {
        let mut fb = FnBuilder::main();
        let i = fb.local("i");
        let chunk = fb.finish(build::block(vec![
            build::numeric_for(i, build::int(1), build::int(3), None, build::block(vec![])),
            build::ret(vec![]),
        ]));
        let (module, slots, _) = compile(&chunk);
        let main = module.main();
        // The loop phi is stored on two paths; both stores resolve to one slot.
        let phis: Vec<_> = main
            .code
            .blocks()
            .iter()
            .flat_map(|b| &b.body)
            .filter_map(|n| match n {
                BodyNode::PhiStore { phi, .. } => Some(*phi),
                _ => None,
            })
            .collect();
        assert!(!phis.is_empty());
        for phi in &phis {
            assert!(slots.slot_opt(*phi).is_some());
        }
    }

    #[test]
    fn dead_definitions_still_receive_slots() {
        let mut fb = FnBuilder::main();
        let x = fb.local("x");
        let chunk = fb.finish(build::block(vec![
            build::local_decl(vec![x], vec![build::int(1)]),
            build::ret(vec![]),
        ]));
        let (module, slots, _) = compile(&chunk);
        let var = module.main().code.blocks()[0]
            .body
            .iter()
            .find_map(|n| match n {
                BodyNode::VarInit { var, .. } => Some(*var),
                _ => None,
            })
            .unwrap();
        assert!(slots.slot_opt(var).is_some());
    }
}
