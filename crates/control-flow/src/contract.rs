//! Structural I/O contract checking between branches and carries.
//!
//! `cond` demands its two branches produce identical pytree structures with
//! identical per-leaf dtype and rank; `while_loop` and `scan` demand the
//! carry coming out of one body step match the carry going in. Shape
//! agreement is delegated to a [`ShapeOracle`] so a shape-polymorphic
//! runtime can widen "identical" to "compatible" without this crate knowing
//! its symbolic representation.

use crate::error::{ControlFlowError, Result};
use crate::graph::LeafSpec;
use crate::pytree::{PyTree, TreeStructure};
use crate::value::Value;

/// Answers whether two concrete leaf shapes are compatible.
pub trait ShapeOracle {
    fn compatible(&self, expected: &[usize], actual: &[usize]) -> bool;
}

/// Leaf shapes must match exactly; the `cond` branch contract.
pub struct ExactShapes;

impl ShapeOracle for ExactShapes {
    fn compatible(&self, expected: &[usize], actual: &[usize]) -> bool {
        expected == actual
    }
}

/// Leaf shapes must be broadcast-compatible; the carry contract, which
/// tolerates a body step that broadcasts the carry against step inputs.
pub struct BroadcastShapes;

impl ShapeOracle for BroadcastShapes {
    fn compatible(&self, expected: &[usize], actual: &[usize]) -> bool {
        let mut left = expected.iter().rev();
        let mut right = actual.iter().rev();
        loop {
            match (left.next(), right.next()) {
                (None, None) => return true,
                (Some(_), None) | (None, Some(_)) => continue,
                (Some(&l), Some(&r)) => {
                    if l != r && l != 1 && r != 1 {
                        return false;
                    }
                }
            }
        }
    }
}

/// One side of a contract comparison.
pub(crate) struct SideSpec<'a> {
    pub structure: &'a TreeStructure,
    pub specs: &'a [LeafSpec],
}

pub(crate) fn specs_of(tree: &PyTree<Value>) -> (TreeStructure, Vec<LeafSpec>) {
    let (leaves, structure) = tree.flatten();
    let specs = leaves.iter().map(|v| LeafSpec::of(v.tensor())).collect();
    (structure, specs)
}

/// Compare two sides leaf by leaf; the first divergence is the error.
pub(crate) fn check_contract(
    op: &'static str,
    site: &str,
    expected: SideSpec<'_>,
    actual: SideSpec<'_>,
    oracle: &dyn ShapeOracle,
) -> Result<()> {
    let mismatch = |detail: String| ControlFlowError::ContractMismatch {
        op,
        site: site.to_string(),
        detail,
    };

    if expected.specs.len() != actual.specs.len() {
        return Err(mismatch(format!(
            "expected {} output leaves, got {}",
            expected.specs.len(),
            actual.specs.len()
        )));
    }
    if expected.structure != actual.structure {
        return Err(mismatch(format!(
            "pytree structure {} does not match {}",
            actual.structure, expected.structure
        )));
    }

    let paths = expected.structure.leaf_paths();
    for (i, (want, got)) in expected.specs.iter().zip(actual.specs.iter()).enumerate() {
        let leaf = if paths[i].is_empty() {
            "<root>".to_string()
        } else {
            paths[i].clone()
        };
        if want.dtype != got.dtype {
            return Err(mismatch(format!(
                "leaf {} dtype {:?} does not match {:?}",
                leaf, got.dtype, want.dtype
            )));
        }
        if want.rank() != got.rank() {
            return Err(mismatch(format!(
                "leaf {} rank {} does not match {} (shapes {} vs {})",
                leaf,
                got.rank(),
                want.rank(),
                got,
                want
            )));
        }
        if !oracle.compatible(&want.shape, &got.shape) {
            return Err(mismatch(format!(
                "leaf {} shape {} is not compatible with {}",
                leaf, got, want
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_oracle_accepts_unit_dims() {
        let oracle = BroadcastShapes;
        assert!(oracle.compatible(&[4, 1, 3], &[4, 5, 3]));
        assert!(oracle.compatible(&[3], &[2, 3]));
        assert!(!oracle.compatible(&[4, 2, 3], &[4, 5, 3]));
    }

    #[test]
    fn exact_oracle_requires_equality() {
        let oracle = ExactShapes;
        assert!(oracle.compatible(&[2, 3], &[2, 3]));
        assert!(!oracle.compatible(&[2, 3], &[2, 1]));
    }
}
