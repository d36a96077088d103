//! Carry-threading loop with a per-iteration contract.

use candle_core::Tensor;

use crate::contract::{check_contract, specs_of, BroadcastShapes, SideSpec};
use crate::error::{precondition, Result};
use crate::graph::{tensor_to_bool, Op, OpKind};
use crate::purity::check_purity;
use crate::pytree::PyTree;
use crate::trace;
use crate::value::Value;

const OP: &str = "while_loop";

/// Thread `carry` through `body_fn` while `cond_fn` holds.
///
/// The carry coming out of every body step must keep the pytree structure
/// and per-leaf dtype of `init`, with a broadcast-compatible shape. A
/// non-terminating predicate is an authoring error this operator does not
/// bound.
pub fn while_loop<CF, BF>(cond_fn: CF, body_fn: BF, init: &PyTree<Value>) -> Result<PyTree<Value>>
where
    CF: Fn(&PyTree<Value>) -> Result<Value>,
    BF: Fn(&PyTree<Value>) -> Result<PyTree<Value>>,
{
    if init.leaf_count() == 0 {
        return Err(precondition(OP, "carry must contain at least one tensor"));
    }
    let (init_structure, init_specs) = specs_of(init);

    if !trace::is_capturing() {
        let mut carry = init.clone();
        loop {
            let keep = cond_fn(&carry)?;
            if keep.tensor().elem_count() != 1 {
                return Err(precondition(
                    OP,
                    format!(
                        "cond_fn must return a single boolean element, got shape {:?}",
                        keep.dims()
                    ),
                ));
            }
            if !keep.as_bool()? {
                return Ok(carry);
            }
            let next = body_fn(&carry)?;
            let (next_structure, next_specs) = specs_of(&next);
            check_contract(
                OP,
                "body_fn carry vs init",
                SideSpec {
                    structure: &init_structure,
                    specs: &init_specs,
                },
                SideSpec {
                    structure: &next_structure,
                    specs: &next_specs,
                },
                &BroadcastShapes,
            )?;
            carry = next;
        }
    }

    let (_cond_out, cond_id) =
        trace::trace_subprogram(init, |carry| cond_fn(carry).map(PyTree::leaf))?;
    trace::with_subprogram(cond_id, |sub| {
        let elems: usize = sub.output_specs[0].shape.iter().product();
        if elems != 1 {
            return Err(precondition(
                OP,
                format!(
                    "cond_fn must return a single boolean element, got shape {:?}",
                    sub.output_specs[0].shape
                ),
            ));
        }
        check_purity(OP, "cond_fn", sub)
    })?;

    let (_body_out, body_id) = trace::trace_subprogram(init, |carry| body_fn(carry))?;
    trace::with_subprogram(body_id, |sub| {
        check_contract(
            OP,
            "body_fn carry vs init",
            SideSpec {
                structure: &init_structure,
                specs: &init_specs,
            },
            SideSpec {
                structure: &sub.output_structure,
                specs: &sub.output_specs,
            },
            &BroadcastShapes,
        )?;
        check_purity(OP, "body_fn", sub)
    })?;

    // The returned carry comes from replaying the captured body, so the
    // recorded node and the traced result cannot diverge.
    let init_leaves = init.leaves();
    let mut carry_tensors: Vec<Tensor> =
        init_leaves.iter().map(|v| v.tensor().clone()).collect();
    loop {
        let keep = trace::replay_active(cond_id, &carry_tensors)?;
        if !tensor_to_bool(&keep[0])? {
            break;
        }
        carry_tensors = trace::replay_active(body_id, &carry_tensors)?;
    }

    let out_values: Vec<Value> = carry_tensors.into_iter().map(Value::new).collect();
    let op = Op {
        kind: OpKind::WhileLoop,
        inputs: init_leaves.iter().map(|v| v.id()).collect(),
        outputs: out_values.iter().map(|v| v.id()).collect(),
        scalar: None,
        dim: None,
        reverse: false,
        split: None,
        children: vec![cond_id, body_id],
    };
    let lift: Vec<_> = init_leaves.iter().map(|v| (v.id(), v.tensor())).collect();
    trace::record(op, &lift);

    Ok(PyTree::unflatten(&init_structure, out_values).expect("leaf count matches structure"))
}
