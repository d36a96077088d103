//! Structured control flow over candle tensors.
//!
//! The crate provides `cond`, `while_loop`, `scan`, `associative_scan`, and
//! `map` as first-class operators rather than host-language branches. With
//! no capture session active they execute eagerly and structurally. Inside
//! [`capture`] each branch callable is traced into an isolated, replayable
//! [`graph::Subprogram`], validated by the contract checker (branch outputs
//! and loop carries must agree in pytree structure, dtype, rank, and shape)
//! and the purity checker (a branch may neither mutate nor alias its
//! inputs), and the operator is recorded as a single self-describing node.
//! Operators compose: a branch may itself invoke another operator, which
//! nests its captures in the same arena.

pub mod contract;
pub mod error;
pub mod graph;
pub mod ops;
pub mod pointwise;
pub mod purity;
pub mod pytree;
pub mod trace;
pub mod value;

pub use contract::{BroadcastShapes, ExactShapes, ShapeOracle};
pub use error::{ControlFlowError, Result};
pub use graph::{LeafSpec, Op, OpKind, ProgramArena, Subprogram, SubprogramId, ValueId};
pub use ops::{associative_scan, associative_scan_with_registry, cond, map, scan, while_loop};
pub use pointwise::{CombineMode, PointwiseRegistry};
pub use pytree::{PyTree, TreeStructure};
pub use trace::{capture, is_capturing, CapturedProgram};
pub use value::Value;
