//! Structural purity checks on captured sub-programs.
//!
//! Both checks inspect the recorded operation list, never runtime values:
//! they must hold for every possible predicate outcome, not just the one
//! observed while tracing. Neither violation is repaired automatically; a
//! silent defensive clone would hide the problem from the branch author.

use std::collections::HashSet;

use crate::error::{ControlFlowError, Result};
use crate::graph::{Subprogram, ValueId};

fn input_leaf_name(sub: &Subprogram, id: ValueId) -> String {
    if let Some(pos) = sub.inputs.iter().position(|i| *i == id) {
        let paths = sub.input_structure.leaf_paths();
        let path = paths.get(pos).cloned().unwrap_or_default();
        if path.is_empty() {
            "<root>".to_string()
        } else {
            path
        }
    } else if let Some(pos) = sub.lifted.iter().position(|(l, _)| *l == id) {
        format!("lifted:{pos}")
    } else {
        "<unknown>".to_string()
    }
}

/// Reject a branch that mutates one of its inputs, or that returns an input
/// leaf untouched (a pointer-identity alias).
pub(crate) fn check_purity(
    op: &'static str,
    branch: &'static str,
    sub: &Subprogram,
) -> Result<()> {
    let inputs: HashSet<ValueId> = sub.all_input_ids().into_iter().collect();

    for recorded in &sub.ops {
        if let Some(target) = recorded.mutated() {
            if inputs.contains(&target) {
                return Err(ControlFlowError::Mutation {
                    op,
                    branch,
                    leaf: input_leaf_name(sub, target),
                });
            }
        }
    }

    let out_paths = sub.output_structure.leaf_paths();
    for (pos, out) in sub.outputs.iter().enumerate() {
        if inputs.contains(out) {
            let path = out_paths.get(pos).cloned().unwrap_or_default();
            let leaf = if path.is_empty() {
                input_leaf_name(sub, *out)
            } else {
                format!("{} (input {})", path, input_leaf_name(sub, *out))
            };
            return Err(ControlFlowError::Aliasing { op, branch, leaf });
        }
    }
    Ok(())
}
