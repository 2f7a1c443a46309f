//! IR transformations: dead-code pruning, block merging, unreachable-block
//! pruning, and code segmentation.

pub mod dce;
pub mod merge;
pub mod segment;

pub use segment::{Segment, SegmentedCode};
