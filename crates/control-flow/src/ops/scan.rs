//! Sequential scan with a threaded carry and stacked per-step outputs.

use candle_core::Tensor;

use crate::contract::{check_contract, specs_of, BroadcastShapes, ExactShapes, SideSpec};
use crate::error::{precondition, ControlFlowError, Result};
use crate::graph::{scan_axis_len, stack_along, Op, OpKind};
use crate::purity::check_purity;
use crate::pytree::{PyTree, TreeStructure};
use crate::trace;
use crate::value::Value;

const OP: &str = "scan";

fn xs_tensors(xs: &PyTree<Value>) -> Vec<Tensor> {
    xs.leaves().iter().map(|v| v.tensor().clone()).collect()
}

fn slice_tree(
    leaves: &[Tensor],
    structure: &TreeStructure,
    dim: usize,
    index: usize,
) -> Result<PyTree<Value>> {
    let sliced: Vec<Value> = leaves
        .iter()
        .map(|t| Ok(Value::new(t.narrow(dim, index, 1)?.squeeze(dim)?)))
        .collect::<Result<_>>()?;
    Ok(PyTree::unflatten(structure, sliced).expect("leaf count matches structure"))
}

/// Fold `combine_fn` over the `dim` axis of `xs`, threading a carry and
/// collecting the per-step outputs into a stacked result.
///
/// `combine_fn` maps `(carry, x_slice)` to `(next_carry, y)`. Steps run in
/// axis order, or reversed when `reverse` is set, with outputs always placed
/// at their originating positions. The carry must keep the structure and
/// per-leaf dtype of `init` on every step; a zero-length scan axis is a
/// precondition error.
pub fn scan<F>(
    combine_fn: F,
    init: &PyTree<Value>,
    xs: &PyTree<Value>,
    dim: usize,
    reverse: bool,
) -> Result<(PyTree<Value>, PyTree<Value>)>
where
    F: Fn(&PyTree<Value>, &PyTree<Value>) -> Result<(PyTree<Value>, PyTree<Value>)>,
{
    if init.leaf_count() == 0 {
        return Err(precondition(OP, "init carry must contain at least one tensor"));
    }
    if xs.leaf_count() == 0 {
        return Err(precondition(OP, "xs must contain at least one tensor"));
    }
    let tensors = xs_tensors(xs);
    let xs_structure = xs.structure();
    let steps = scan_axis_len(OP, &tensors, dim)?;
    let (init_structure, init_specs) = specs_of(init);

    let order: Vec<usize> = if reverse {
        (0..steps).rev().collect()
    } else {
        (0..steps).collect()
    };

    if !trace::is_capturing() {
        let mut carry = init.clone();
        let mut y_structure: Option<TreeStructure> = None;
        let mut y_specs = Vec::new();
        let mut buckets: Vec<Vec<Tensor>> = Vec::new();
        for &step in &order {
            let x = slice_tree(&tensors, &xs_structure, dim, step)?;
            let (next, y) = combine_fn(&carry, &x)?;
            let (next_structure, next_specs) = specs_of(&next);
            check_contract(
                OP,
                &format!("combine_fn carry vs init (step {step})"),
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
            let (this_structure, this_specs) = specs_of(&y);
            match &y_structure {
                None => {
                    y_structure = Some(this_structure);
                    y_specs = this_specs;
                }
                Some(first) => {
                    check_contract(
                        OP,
                        &format!("combine_fn per-step output (step {step})"),
                        SideSpec {
                            structure: first,
                            specs: &y_specs,
                        },
                        SideSpec {
                            structure: &this_structure,
                            specs: &this_specs,
                        },
                        &ExactShapes,
                    )?;
                }
            }
            let y_leaves = y.leaves();
            if buckets.is_empty() {
                buckets = y_leaves.iter().map(|v| vec![v.tensor().clone()]).collect();
            } else {
                for (bucket, leaf) in buckets.iter_mut().zip(y_leaves) {
                    bucket.push(leaf.tensor().clone());
                }
            }
            carry = next;
        }
        let y_structure = y_structure.expect("at least one step ran");
        let stacked: Vec<Value> = buckets
            .into_iter()
            .map(|mut bucket| {
                if reverse {
                    bucket.reverse();
                }
                Ok(Value::new(stack_along(&bucket, dim)?))
            })
            .collect::<Result<_>>()?;
        let ys = PyTree::unflatten(&y_structure, stacked).expect("leaf count matches structure");
        return Ok((carry, ys));
    }

    // Capture: probe one combine step, validate, then produce every value by
    // replaying the captured sub-program.
    let probe = slice_tree(&tensors, &xs_structure, dim, order[0])?;
    let wrapped = PyTree::tuple(vec![init.clone(), probe]);
    let (_probe_out, combine_id) = trace::trace_subprogram(&wrapped, |tree| {
        let (carry, x) = match tree {
            PyTree::Tuple(items) if items.len() == 2 => (&items[0], &items[1]),
            _ => unreachable!("scan wraps operands in a 2-tuple"),
        };
        let (next, y) = combine_fn(carry, x)?;
        Ok(PyTree::tuple(vec![next, y]))
    })?;

    let carry_leaves = init.leaf_count();
    trace::with_subprogram(combine_id, |sub| {
        let carry_structure = match &sub.output_structure {
            TreeStructure::Tuple(items) if items.len() == 2 => items[0].clone(),
            other => {
                return Err(ControlFlowError::ContractMismatch {
                    op: OP,
                    site: "combine_fn output".to_string(),
                    detail: format!(
                        "combine_fn must return a (carry, output) pair, got structure {}",
                        other
                    ),
                })
            }
        };
        let carry_count = carry_structure.leaf_count();
        check_contract(
            OP,
            "combine_fn carry vs init",
            SideSpec {
                structure: &init_structure,
                specs: &init_specs,
            },
            SideSpec {
                structure: &carry_structure,
                specs: &sub.output_specs[..carry_count],
            },
            &BroadcastShapes,
        )?;
        check_purity(OP, "combine_fn", sub)
    })?;

    let init_leaves = init.leaves();
    let mut carry_tensors: Vec<Tensor> =
        init_leaves.iter().map(|v| v.tensor().clone()).collect();
    let mut buckets: Vec<Vec<Tensor>> = Vec::new();
    for &step in &order {
        let mut operands = carry_tensors.clone();
        for tensor in &tensors {
            operands.push(tensor.narrow(dim, step, 1)?.squeeze(dim)?);
        }
        let mut result = trace::replay_active(combine_id, &operands)?;
        let ys = result.split_off(carry_leaves);
        carry_tensors = result;
        if buckets.is_empty() {
            buckets = ys.into_iter().map(|y| vec![y]).collect();
        } else {
            for (bucket, y) in buckets.iter_mut().zip(ys) {
                bucket.push(y);
            }
        }
    }

    let carry_values: Vec<Value> = carry_tensors.into_iter().map(Value::new).collect();
    let y_values: Vec<Value> = buckets
        .into_iter()
        .map(|mut bucket| {
            if reverse {
                bucket.reverse();
            }
            Ok(Value::new(stack_along(&bucket, dim)?))
        })
        .collect::<Result<_>>()?;

    let y_structure = trace::with_subprogram(combine_id, |sub| {
        Ok(match &sub.output_structure {
            TreeStructure::Tuple(items) => items[1].clone(),
            _ => unreachable!("validated above"),
        })
    })?;

    let xs_leaves = xs.leaves();
    let mut inputs: Vec<_> = init_leaves.iter().map(|v| v.id()).collect();
    inputs.extend(xs_leaves.iter().map(|v| v.id()));
    let mut outputs: Vec<_> = carry_values.iter().map(|v| v.id()).collect();
    outputs.extend(y_values.iter().map(|v| v.id()));
    let op = Op {
        kind: OpKind::Scan,
        inputs,
        outputs,
        scalar: None,
        dim: Some(dim),
        reverse,
        split: Some(carry_leaves),
        children: vec![combine_id],
    };
    let mut lift: Vec<_> = init_leaves.iter().map(|v| (v.id(), v.tensor())).collect();
    lift.extend(xs_leaves.iter().map(|v| (v.id(), v.tensor())));
    trace::record(op, &lift);

    let carry =
        PyTree::unflatten(&init_structure, carry_values).expect("leaf count matches structure");
    let ys = PyTree::unflatten(&y_structure, y_values).expect("leaf count matches structure");
    Ok((carry, ys))
}
