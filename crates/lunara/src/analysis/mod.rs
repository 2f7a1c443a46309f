//! Dataflow analyses over the IR: type propagation, liveness, nested
//! dependencies, and slot allocation.

pub mod deps;
pub mod liveness;
pub mod slots;
pub mod typing;

pub use deps::DependencyInfo;
pub use liveness::LivenessInfo;
pub use slots::{SlotAllocInfo, SlotKey};
pub use typing::{LuaType, TypeInfo};
