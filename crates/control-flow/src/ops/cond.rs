//! Branch selection with a captured two-armed contract.

use crate::contract::{check_contract, ExactShapes, SideSpec};
use crate::error::{precondition, Result};
use crate::graph::{Op, OpKind};
use crate::purity::check_purity;
use crate::pytree::PyTree;
use crate::trace;
use crate::value::Value;

const OP: &str = "cond";

/// Run `true_fn` or `false_fn` on `operands` depending on `pred`.
///
/// Eagerly, only the selected branch executes. Under capture both branches
/// are traced on the same operands, their outputs must agree in pytree
/// structure, leaf dtype, rank, and shape, and neither may mutate or alias
/// an operand; the call is then recorded as one node holding both captured
/// branches.
pub fn cond<TF, FF>(
    pred: &Value,
    true_fn: TF,
    false_fn: FF,
    operands: &PyTree<Value>,
) -> Result<PyTree<Value>>
where
    TF: Fn(&PyTree<Value>) -> Result<PyTree<Value>>,
    FF: Fn(&PyTree<Value>) -> Result<PyTree<Value>>,
{
    if pred.tensor().elem_count() != 1 {
        return Err(precondition(
            OP,
            format!(
                "predicate must be a single boolean element, got shape {:?}",
                pred.dims()
            ),
        ));
    }
    let taken = pred.as_bool()?;

    if !trace::is_capturing() {
        return if taken {
            true_fn(operands)
        } else {
            false_fn(operands)
        };
    }

    let (true_out, true_id) = trace::trace_subprogram(operands, |ops| true_fn(ops))?;
    let (false_out, false_id) = trace::trace_subprogram(operands, |ops| false_fn(ops))?;

    trace::with_subprogram(true_id, |true_sub| {
        trace::with_subprogram(false_id, |false_sub| {
            check_contract(
                OP,
                "true_fn vs false_fn outputs",
                SideSpec {
                    structure: &true_sub.output_structure,
                    specs: &true_sub.output_specs,
                },
                SideSpec {
                    structure: &false_sub.output_structure,
                    specs: &false_sub.output_specs,
                },
                &ExactShapes,
            )?;
            check_purity(OP, "true_fn", true_sub)?;
            check_purity(OP, "false_fn", false_sub)
        })
    })?;

    let chosen = if taken { true_out } else { false_out };
    let (chosen_leaves, structure) = chosen.flatten();
    let out_values: Vec<Value> = chosen_leaves
        .iter()
        .map(|v| Value::new(v.tensor().clone()))
        .collect();

    let operand_leaves = operands.leaves();
    let mut inputs = vec![pred.id()];
    inputs.extend(operand_leaves.iter().map(|v| v.id()));
    let op = Op {
        kind: OpKind::Cond,
        inputs,
        outputs: out_values.iter().map(|v| v.id()).collect(),
        scalar: None,
        dim: None,
        reverse: false,
        split: None,
        children: vec![true_id, false_id],
    };
    let mut lift: Vec<(crate::graph::ValueId, &candle_core::Tensor)> =
        vec![(pred.id(), pred.tensor())];
    lift.extend(operand_leaves.iter().map(|v| (v.id(), v.tensor())));
    trace::record(op, &lift);

    Ok(PyTree::unflatten(&structure, out_values).expect("leaf count matches structure"))
}
