//! Independent application across the leading axis.

use candle_core::Tensor;

use crate::contract::{check_contract, specs_of, ExactShapes, SideSpec};
use crate::error::{precondition, Result};
use crate::graph::{scan_axis_len, stack_along, Op, OpKind};
use crate::purity::check_purity;
use crate::pytree::{PyTree, TreeStructure};
use crate::trace;
use crate::value::Value;

const OP: &str = "map";

/// Apply `f` to each slice of `xs` along the leading axis, stacking the
/// results. `broadcast_args` reach every invocation unsliced. Steps are
/// independent; this is a carry-free specialization of the scan loop.
pub fn map<F>(f: F, xs: &PyTree<Value>, broadcast_args: &PyTree<Value>) -> Result<PyTree<Value>>
where
    F: Fn(&PyTree<Value>, &PyTree<Value>) -> Result<PyTree<Value>>,
{
    if xs.leaf_count() == 0 {
        return Err(precondition(OP, "xs must contain at least one tensor"));
    }
    let tensors: Vec<Tensor> = xs.leaves().iter().map(|v| v.tensor().clone()).collect();
    let xs_structure = xs.structure();
    let steps = scan_axis_len(OP, &tensors, 0)?;

    let slice_at = |index: usize| -> Result<PyTree<Value>> {
        let sliced: Vec<Value> = tensors
            .iter()
            .map(|t| Ok(Value::new(t.narrow(0, index, 1)?.squeeze(0)?)))
            .collect::<Result<_>>()?;
        Ok(PyTree::unflatten(&xs_structure, sliced).expect("leaf count matches structure"))
    };

    if !trace::is_capturing() {
        let mut out_structure: Option<TreeStructure> = None;
        let mut out_specs = Vec::new();
        let mut buckets: Vec<Vec<Tensor>> = Vec::new();
        for step in 0..steps {
            let slice = slice_at(step)?;
            let out = f(&slice, broadcast_args)?;
            let (this_structure, this_specs) = specs_of(&out);
            match &out_structure {
                None => {
                    out_structure = Some(this_structure);
                    out_specs = this_specs;
                }
                Some(first) => check_contract(
                    OP,
                    &format!("fn per-step output (step {step})"),
                    SideSpec {
                        structure: first,
                        specs: &out_specs,
                    },
                    SideSpec {
                        structure: &this_structure,
                        specs: &this_specs,
                    },
                    &ExactShapes,
                )?,
            }
            let leaves = out.leaves();
            if buckets.is_empty() {
                buckets = leaves.iter().map(|v| vec![v.tensor().clone()]).collect();
            } else {
                for (bucket, leaf) in buckets.iter_mut().zip(leaves) {
                    bucket.push(leaf.tensor().clone());
                }
            }
        }
        let out_structure = out_structure.expect("at least one step ran");
        let stacked: Vec<Value> = buckets
            .into_iter()
            .map(|bucket| Ok(Value::new(stack_along(&bucket, 0)?)))
            .collect::<Result<_>>()?;
        return Ok(
            PyTree::unflatten(&out_structure, stacked).expect("leaf count matches structure")
        );
    }

    let probe = slice_at(0)?;
    let wrapped = PyTree::tuple(vec![probe, broadcast_args.clone()]);
    let (_probe_out, fn_id) = trace::trace_subprogram(&wrapped, |tree| {
        let (slice, extra) = match tree {
            PyTree::Tuple(items) if items.len() == 2 => (&items[0], &items[1]),
            _ => unreachable!("map wraps operands in a 2-tuple"),
        };
        f(slice, extra)
    })?;
    let out_structure =
        trace::with_subprogram(fn_id, |sub| {
            check_purity(OP, "fn", sub)?;
            Ok(sub.output_structure.clone())
        })?;

    let extra_leaves = broadcast_args.leaves();
    let extra_tensors: Vec<Tensor> = extra_leaves.iter().map(|v| v.tensor().clone()).collect();
    let mut buckets: Vec<Vec<Tensor>> = Vec::new();
    for step in 0..steps {
        let mut operands: Vec<Tensor> = tensors
            .iter()
            .map(|t| Ok(t.narrow(0, step, 1)?.squeeze(0)?))
            .collect::<Result<_>>()?;
        operands.extend(extra_tensors.iter().cloned());
        let ys = trace::replay_active(fn_id, &operands)?;
        if buckets.is_empty() {
            buckets = ys.into_iter().map(|y| vec![y]).collect();
        } else {
            for (bucket, y) in buckets.iter_mut().zip(ys) {
                bucket.push(y);
            }
        }
    }
    let out_values: Vec<Value> = buckets
        .into_iter()
        .map(|bucket| Ok(Value::new(stack_along(&bucket, 0)?)))
        .collect::<Result<_>>()?;

    let xs_leaves = xs.leaves();
    let mut inputs: Vec<_> = xs_leaves.iter().map(|v| v.id()).collect();
    inputs.extend(extra_leaves.iter().map(|v| v.id()));
    let op = Op {
        kind: OpKind::Map,
        inputs,
        outputs: out_values.iter().map(|v| v.id()).collect(),
        scalar: None,
        dim: Some(0),
        reverse: false,
        split: Some(xs_leaves.len()),
        children: vec![fn_id],
    };
    let mut lift: Vec<_> = xs_leaves.iter().map(|v| (v.id(), v.tensor())).collect();
    lift.extend(extra_leaves.iter().map(|v| (v.id(), v.tensor())));
    trace::record(op, &lift);

    Ok(PyTree::unflatten(&out_structure, out_values).expect("leaf count matches structure"))
}
