//! The registry of operations treated as pointwise.
//!
//! `associative_scan`'s doubling algorithm applies the combine function to
//! whole slices of the scan axis at once, which is only sound when every
//! operation inside it acts elementwise. Which operations qualify is policy,
//! not semantics, so the whitelist is an explicit value callers can extend
//! rather than a hardcoded match.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{ControlFlowError, Result};
use crate::graph::{OpKind, Subprogram};

/// How `associative_scan` executes its combine function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CombineMode {
    /// Logarithmic doubling over whole slices; the combine function must
    /// pass the pointwise check.
    Pointwise,
    /// Sequential fold along the axis; no structural restriction.
    Generic,
}

#[derive(Debug, Clone)]
pub struct PointwiseRegistry {
    ops: HashSet<OpKind>,
}

impl Default for PointwiseRegistry {
    fn default() -> Self {
        let ops = [
            OpKind::Add,
            OpKind::Sub,
            OpKind::Mul,
            OpKind::Div,
            OpKind::Maximum,
            OpKind::Minimum,
            OpKind::GreaterEqual,
            OpKind::LessThan,
            OpKind::Equal,
            OpKind::Neg,
            OpKind::Abs,
            OpKind::Exp,
            OpKind::Sin,
            OpKind::Cos,
            OpKind::Sqrt,
            OpKind::AddScalar,
            OpKind::MulScalar,
            OpKind::GreaterEqualScalar,
            OpKind::LessThanScalar,
        ]
        .into_iter()
        .collect();
        Self { ops }
    }
}

impl PointwiseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with no entries; every combine function is rejected.
    pub fn empty() -> Self {
        Self {
            ops: HashSet::new(),
        }
    }

    pub fn register(&mut self, kind: OpKind) -> &mut Self {
        self.ops.insert(kind);
        self
    }

    pub fn contains(&self, kind: OpKind) -> bool {
        self.ops.contains(&kind)
    }

    /// Every recorded operation must be registered; mutating ops and nested
    /// control flow never are.
    pub(crate) fn check(&self, op: &'static str, sub: &Subprogram) -> Result<()> {
        for recorded in &sub.ops {
            if !self.contains(recorded.kind) {
                return Err(ControlFlowError::NonPointwise {
                    op,
                    kind: recorded.kind.name().to_string(),
                });
            }
        }
        Ok(())
    }
}
