//! Code segmentation under a node-count limit.
//!
//! Partitions a function's linear block sequence into segments of at most
//! `limit` nodes, where a block weighs its body length plus one for the
//! terminator. A block that does not fit is split: the predecessor part
//! keeps the first `limit − count` body nodes and a synthetic jump; the
//! remainder gets a fresh negative label and carries the last seen line
//! annotation forward as its first body node, preserving the source-line
//! mapping. Emitters whose targets cap per-chunk size consume segments.
//!
//! Boundary predicate, kept exactly: append while `count + len < limit`;
//! append then flush when equal; split when above.

use crate::ir::{
    code::{BasicBlock, Code, Label},
    node::{BodyNode, Terminator},
};

/// One segment: an unmodifiable run of blocks.
#[derive(Debug)]
pub struct Segment {
    blocks: Box<[BasicBlock]>,
}

impl Segment {
    #[must_use]
    pub fn blocks(&self) -> &[BasicBlock] {
        &self.blocks
    }

    /// Total node weight of the segment.
    #[must_use]
    pub fn weight(&self) -> usize {
        self.blocks.iter().map(BasicBlock::weight).sum()
    }
}

/// A function body partitioned into segments.
#[derive(Debug)]
pub struct SegmentedCode {
    segments: Vec<Segment>,
}

impl SegmentedCode {
    #[must_use]
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// All blocks in segment order, as the emitter walks them.
    pub fn iter_blocks(&self) -> impl Iterator<Item = &BasicBlock> {
        self.segments.iter().flat_map(|s| s.blocks.iter())
    }

    /// Total body-node count over all segments.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.iter_blocks().map(|b| b.body.len()).sum()
    }
}

/// Segments `code` under `limit` nodes per segment. A limit of zero means
/// a single segment.
#[must_use]
pub fn segment(code: &Code, limit: usize) -> SegmentedCode {
    if limit == 0 {
        return SegmentedCode {
            segments: vec![Segment {
                blocks: code.blocks().to_vec().into_boxed_slice(),
            }],
        };
    }

    let mut segments = Vec::new();
    let mut current: Vec<BasicBlock> = Vec::new();
    let mut count = 0usize;
    let mut next_split_label = -1i32;
    let mut last_line: Option<u32> = None;

    // Blocks are processed off a queue so a split's remainder re-enters.
    let mut pending: std::collections::VecDeque<BasicBlock> = code.blocks().to_vec().into();

    while let Some(block) = pending.pop_front() {
        for node in &block.body {
            if let BodyNode::Line { line } = node {
                last_line = Some(*line);
            }
        }
        let len = block.weight();
        if count + len < limit {
            count += len;
            current.push(block);
        } else if count + len == limit {
            // Exactly fills the segment: append, then start a new one.
            current.push(block);
            segments.push(Segment {
                blocks: std::mem::take(&mut current).into_boxed_slice(),
            });
            count = 0;
        } else {
            // Does not fit: split at k = limit − count.
            let k = (limit - count).min(block.body.len());
            let mut head_body: Vec<BodyNode> = block.body;
            let tail_body: Vec<BodyNode> = head_body.split_off(k);
            let split_label = Label(next_split_label);
            next_split_label -= 1;

            let head = BasicBlock::new(
                block.label,
                head_body,
                Terminator::ToNext { target: split_label },
            );
            current.push(head);
            segments.push(Segment {
                blocks: std::mem::take(&mut current).into_boxed_slice(),
            });
            count = 0;

            // The remainder carries the last line annotation forward so
            // tracebacks keep pointing at the right source line.
            let mut remainder_body = Vec::with_capacity(tail_body.len() + 1);
            if let Some(line) = last_line {
                remainder_body.push(BodyNode::Line { line });
            }
            remainder_body.extend(tail_body);
            pending.push_front(BasicBlock::new(split_label, remainder_body, block.term));
        }
    }

    if !current.is_empty() {
        segments.push(Segment {
            blocks: current.into_boxed_slice(),
        });
    }
    if segments.is_empty() {
        segments.push(Segment { blocks: Box::new([]) });
    }

    SegmentedCode { segments }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ast::build::{self, FnBuilder},
        ir::translate::translate_chunk,
    };

    fn sample_code() -> Code {
        let mut fb = FnBuilder::main();
        let a = fb.local("a");
        let b = fb.local("b");
        let chunk = fb.finish(build::block(vec![
            build::local_decl(vec![a], vec![build::int(1)]),
            build::local_decl(vec![b], vec![build::int(2)]),
            build::assign_local(a, build::binop(crate::ast::BinAstOp::Add, build::local_ref(a), build::local_ref(b))),
            build::assign_local(b, build::binop(crate::ast::BinAstOp::Mul, build::local_ref(a), build::local_ref(b))),
            build::ret(vec![build::local_ref(a), build::local_ref(b)]),
        ]));
        translate_chunk(&chunk).unwrap().main().code.clone()
    }

    /// The body-node sequence, with line annotations stripped so inserted
    /// carry-forward lines don't affect the comparison.
    fn node_shape(blocks: impl Iterator<Item = BasicBlock>) -> Vec<String> {
        blocks
            .flat_map(|b| b.body)
            .filter(|n| !matches!(n, BodyNode::Line { .. }))
            .map(|n| format!("{n:?}"))
            .collect()
    }

    #[test]
    fn zero_limit_means_single_segment() {
        let code = sample_code();
        let segmented = segment(&code, 0);
        assert_eq!(segmented.segments().len(), 1);
        assert_eq!(segmented.node_count(), code.node_count());
    }

    #[test]
    fn conservation_across_splits() {
        let code = sample_code();
        for limit in 1..=code.node_count() + 2 {
            let segmented = segment(&code, limit);
            let original = node_shape(code.blocks().iter().cloned());
            let segmented_nodes = node_shape(segmented.iter_blocks().cloned());
            assert_eq!(
                original, segmented_nodes,
                "limit {limit} must conserve the node sequence"
            );
        }
    }

    #[test]
    fn split_remainders_get_negative_labels_and_carry_lines() {
        let code = sample_code();
        let total = code.node_count();
        let segmented = segment(&code, 3.min(total));
        let has_negative = segmented.iter_blocks().any(|b| b.label.0 < 0);
        assert!(has_negative, "a split should synthesise a negative label");
        for block in segmented.iter_blocks() {
            if block.label.0 < 0 {
                assert!(
                    matches!(block.body.first(), Some(BodyNode::Line { .. })),
                    "split remainder should lead with the carried line annotation"
                );
            }
        }
    }

    #[test]
    fn exact_fit_flushes_without_splitting() {
        let code = sample_code();
        // Pick a limit equal to the first block's weight: it must flush
        // whole, with no negative labels inside the first segment.
        let first_weight = code.blocks()[0].weight();
        let segmented = segment(&code, first_weight);
        let first = &segmented.segments()[0];
        assert_eq!(first.weight(), first_weight);
        assert!(first.blocks().iter().all(|b| b.label.0 >= 0));
    }

    #[test]
    fn segments_respect_the_weight_ceiling_modulo_split_heads() {
        let code = sample_code();
        let limit = 4;
        let segmented = segment(&code, limit);
        for seg in segmented.segments() {
            // A split head may exceed by the synthetic jump only.
            assert!(seg.weight() <= limit + 1, "segment weight {} over limit", seg.weight());
        }
    }
}
