//! The structured control-flow operators.
//!
//! Each operator runs in one of two modes, decided by whether a capture
//! session is ambient. Eager mode executes structurally: exactly one `cond`
//! branch runs, `while_loop` threads its carry until the predicate drops,
//! `scan`/`map` iterate the leading axis. Capture mode first traces every
//! branch callable into an isolated sub-program, runs the contract and
//! purity checkers over the captures, records the operator as a single node
//! in the enclosing tape, and only then produces values, by replaying the
//! captured bodies so the recorded semantics and the returned result cannot
//! disagree.

mod associative_scan;
mod cond;
mod map;
mod scan;
mod while_loop;

pub use associative_scan::{associative_scan, associative_scan_with_registry};
pub use cond::cond;
pub use map::map;
pub use scan::scan;
pub use while_loop::while_loop;
