//! Inclusive prefix scan with an associative combine function.
//!
//! Two execution strategies: a sequential fold that accepts any combine
//! function, and a logarithmic doubling pass over whole slices of the scan
//! axis that is only sound for pointwise combine functions. The pointwise
//! claim is checked structurally against the captured combine sub-program,
//! never assumed.

use candle_core::Tensor;

use crate::contract::{check_contract, specs_of, ExactShapes, SideSpec};
use crate::error::{precondition, Result};
use crate::graph::{flip_along, scan_axis_len, stack_along, Op, OpKind, SubprogramId};
use crate::pointwise::{CombineMode, PointwiseRegistry};
use crate::purity::check_purity;
use crate::pytree::{PyTree, TreeStructure};
use crate::trace;
use crate::value::Value;

const OP: &str = "associative_scan";

/// Prefix-scan `xs` along `dim` with the default pointwise registry.
pub fn associative_scan<F>(
    combine_fn: F,
    xs: &PyTree<Value>,
    dim: usize,
    reverse: bool,
    combine_mode: CombineMode,
) -> Result<PyTree<Value>>
where
    F: Fn(&PyTree<Value>, &PyTree<Value>) -> Result<PyTree<Value>>,
{
    associative_scan_with_registry(
        combine_fn,
        xs,
        dim,
        reverse,
        combine_mode,
        &PointwiseRegistry::default(),
    )
}

/// Prefix-scan with a caller-extended pointwise registry.
pub fn associative_scan_with_registry<F>(
    combine_fn: F,
    xs: &PyTree<Value>,
    dim: usize,
    reverse: bool,
    combine_mode: CombineMode,
    registry: &PointwiseRegistry,
) -> Result<PyTree<Value>>
where
    F: Fn(&PyTree<Value>, &PyTree<Value>) -> Result<PyTree<Value>>,
{
    if xs.leaf_count() == 0 {
        return Err(precondition(OP, "xs must contain at least one tensor"));
    }
    let tensors: Vec<Tensor> = xs.leaves().iter().map(|v| v.tensor().clone()).collect();
    let structure = xs.structure();
    let steps = scan_axis_len(OP, &tensors, dim)?;

    match combine_mode {
        CombineMode::Generic => {
            if trace::is_capturing() {
                captured_scan(&combine_fn, xs, &tensors, &structure, dim, reverse, steps, None)
            } else {
                sequential_scan(&combine_fn, &tensors, &structure, dim, reverse, steps)
            }
        }
        CombineMode::Pointwise => {
            // The pointwise check needs the combine function's op list either
            // way; open a throwaway session when none is ambient.
            if trace::is_capturing() {
                captured_scan(
                    &combine_fn,
                    xs,
                    &tensors,
                    &structure,
                    dim,
                    reverse,
                    steps,
                    Some(registry),
                )
            } else {
                trace::with_private_session(|| {
                    captured_scan(
                        &combine_fn,
                        xs,
                        &tensors,
                        &structure,
                        dim,
                        reverse,
                        steps,
                        Some(registry),
                    )
                })
            }
        }
    }
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

/// Plain eager fold, used when nothing needs the combine function's
/// structure.
fn sequential_scan<F>(
    combine_fn: &F,
    tensors: &[Tensor],
    structure: &TreeStructure,
    dim: usize,
    reverse: bool,
    steps: usize,
) -> Result<PyTree<Value>>
where
    F: Fn(&PyTree<Value>, &PyTree<Value>) -> Result<PyTree<Value>>,
{
    let oriented: Vec<Tensor> = if reverse {
        tensors
            .iter()
            .map(|t| flip_along(t, dim))
            .collect::<Result<_>>()?
    } else {
        tensors.to_vec()
    };

    let mut acc = slice_tree(&oriented, structure, dim, 0)?;
    let (element_structure, element_specs) = specs_of(&acc);
    let mut buckets: Vec<Vec<Tensor>> = acc
        .leaves()
        .iter()
        .map(|v| vec![v.tensor().clone()])
        .collect();
    for step in 1..steps {
        let x = slice_tree(&oriented, structure, dim, step)?;
        let next = combine_fn(&acc, &x)?;
        let (next_structure, next_specs) = specs_of(&next);
        check_contract(
            OP,
            &format!("combine_fn output vs element (step {step})"),
            SideSpec {
                structure: &element_structure,
                specs: &element_specs,
            },
            SideSpec {
                structure: &next_structure,
                specs: &next_specs,
            },
            &ExactShapes,
        )?;
        for (bucket, leaf) in buckets.iter_mut().zip(next.leaves()) {
            bucket.push(leaf.tensor().clone());
        }
        acc = next;
    }

    finish_stack(buckets, structure, dim, reverse)
}

/// Capture the combine function, validate it, then compute by replay: the
/// doubling pass when the pointwise check holds, the sequential fold
/// otherwise.
#[allow(clippy::too_many_arguments)]
fn captured_scan<F>(
    combine_fn: &F,
    xs: &PyTree<Value>,
    tensors: &[Tensor],
    structure: &TreeStructure,
    dim: usize,
    reverse: bool,
    steps: usize,
    registry: Option<&PointwiseRegistry>,
) -> Result<PyTree<Value>>
where
    F: Fn(&PyTree<Value>, &PyTree<Value>) -> Result<PyTree<Value>>,
{
    let probe_lhs = slice_tree(tensors, structure, dim, 0)?;
    let probe_rhs = slice_tree(tensors, structure, dim, if steps > 1 { 1 } else { 0 })?;
    let (element_structure, element_specs) = specs_of(&probe_lhs);

    let wrapped = PyTree::tuple(vec![probe_lhs, probe_rhs]);
    let (_probe_out, combine_id) = trace::trace_subprogram(&wrapped, |tree| {
        let (lhs, rhs) = match tree {
            PyTree::Tuple(items) if items.len() == 2 => (&items[0], &items[1]),
            _ => unreachable!("associative_scan wraps operands in a 2-tuple"),
        };
        combine_fn(lhs, rhs)
    })?;

    trace::with_subprogram(combine_id, |sub| {
        check_contract(
            OP,
            "combine_fn output vs element",
            SideSpec {
                structure: &element_structure,
                specs: &element_specs,
            },
            SideSpec {
                structure: &sub.output_structure,
                specs: &sub.output_specs,
            },
            &ExactShapes,
        )?;
        check_purity(OP, "combine_fn", sub)?;
        if let Some(registry) = registry {
            registry.check(OP, sub)?;
        }
        Ok(())
    })?;

    let oriented: Vec<Tensor> = if reverse {
        tensors
            .iter()
            .map(|t| flip_along(t, dim))
            .collect::<Result<_>>()?
    } else {
        tensors.to_vec()
    };

    let scanned = if registry.is_some() {
        doubling_scan(combine_id, &oriented, dim, steps)?
    } else {
        replay_sequential(combine_id, &oriented, dim, steps)?
    };

    let outputs: Vec<Tensor> = if reverse {
        scanned
            .iter()
            .map(|t| flip_along(t, dim))
            .collect::<Result<_>>()?
    } else {
        scanned
    };

    let out_values: Vec<Value> = outputs.into_iter().map(Value::new).collect();
    let xs_leaves = xs.leaves();
    let op = Op {
        kind: OpKind::AssociativeScan,
        inputs: xs_leaves.iter().map(|v| v.id()).collect(),
        outputs: out_values.iter().map(|v| v.id()).collect(),
        scalar: None,
        dim: Some(dim),
        reverse,
        split: None,
        children: vec![combine_id],
    };
    let lift: Vec<_> = xs_leaves.iter().map(|v| (v.id(), v.tensor())).collect();
    trace::record(op, &lift);

    Ok(PyTree::unflatten(structure, out_values).expect("leaf count matches structure"))
}

/// Hillis-Steele doubling: each round combines the sequence with itself
/// shifted by `offset`, so positions `< offset` pass through untouched.
/// Sound only for pointwise combine functions, which is checked before this
/// runs.
fn doubling_scan(
    combine_id: SubprogramId,
    tensors: &[Tensor],
    dim: usize,
    steps: usize,
) -> Result<Vec<Tensor>> {
    let mut current = tensors.to_vec();
    let mut offset = 1;
    while offset < steps {
        let mut operands = Vec::with_capacity(current.len() * 2);
        for t in &current {
            operands.push(t.narrow(dim, 0, steps - offset)?);
        }
        for t in &current {
            operands.push(t.narrow(dim, offset, steps - offset)?);
        }
        let combined = trace::replay_active(combine_id, &operands)?;
        current = current
            .iter()
            .zip(combined)
            .map(|(t, tail)| {
                let head = t.narrow(dim, 0, offset)?;
                Ok(Tensor::cat(&[&head, &tail], dim)?)
            })
            .collect::<Result<_>>()?;
        offset *= 2;
    }
    Ok(current)
}

fn replay_sequential(
    combine_id: SubprogramId,
    tensors: &[Tensor],
    dim: usize,
    steps: usize,
) -> Result<Vec<Tensor>> {
    let mut acc: Vec<Tensor> = tensors
        .iter()
        .map(|t| Ok(t.narrow(dim, 0, 1)?.squeeze(dim)?))
        .collect::<Result<_>>()?;
    let mut buckets: Vec<Vec<Tensor>> = acc.iter().map(|t| vec![t.clone()]).collect();
    for step in 1..steps {
        let mut operands = acc.clone();
        for t in tensors {
            operands.push(t.narrow(dim, step, 1)?.squeeze(dim)?);
        }
        acc = trace::replay_active(combine_id, &operands)?;
        for (bucket, t) in buckets.iter_mut().zip(acc.iter()) {
            bucket.push(t.clone());
        }
    }
    buckets
        .into_iter()
        .map(|bucket| stack_along(&bucket, dim))
        .collect()
}

fn finish_stack(
    buckets: Vec<Vec<Tensor>>,
    structure: &TreeStructure,
    dim: usize,
    reverse: bool,
) -> Result<PyTree<Value>> {
    let stacked: Vec<Value> = buckets
        .into_iter()
        .map(|bucket| {
            let stacked = stack_along(&bucket, dim)?;
            let oriented = if reverse {
                flip_along(&stacked, dim)?
            } else {
                stacked
            };
            Ok(Value::new(oriented))
        })
        .collect::<Result<_>>()?;
    Ok(PyTree::unflatten(structure, stacked).expect("leaf count matches structure"))
}
