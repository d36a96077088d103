//! Capture-mode semantics: tracing, contracts, purity, and replay.

use candle_core::{DType, Device, Tensor};
use control_flow::{
    capture, cond, is_capturing, scan, while_loop, ControlFlowError, OpKind, PyTree, Value,
};

fn tensor(device: &Device, vs: &[f32]) -> Tensor {
    Tensor::from_vec(vs.to_vec(), (vs.len(),), device).unwrap()
}

fn to_vec(t: &Tensor) -> Vec<f32> {
    t.to_dtype(DType::F32)
        .unwrap()
        .flatten_all()
        .unwrap()
        .to_vec1::<f32>()
        .unwrap()
}

fn tree_leaves(tree: &PyTree<Tensor>) -> Vec<Vec<f32>> {
    tree.leaves().iter().map(|t| to_vec(t)).collect()
}

#[test]
fn captured_cond_replays_the_selected_branch() {
    let device = Device::Cpu;
    let pred = Tensor::new(1u8, &device).unwrap();
    let x = tensor(&device, &[0.5, 1.0]);

    let operands = PyTree::tuple(vec![PyTree::leaf(pred.clone()), PyTree::leaf(x.clone())]);
    let (out, program) = capture(operands, |tree| {
        let items = match tree {
            PyTree::Tuple(items) => items,
            _ => unreachable!(),
        };
        let pred = items[0].leaves()[0].clone();
        cond(
            &pred,
            |t: &PyTree<Value>| t.try_map(&mut |v: &Value| v.sin()),
            |t: &PyTree<Value>| t.try_map(&mut |v: &Value| v.neg()),
            &items[1],
        )
    })
    .unwrap();

    // Trace-time result took the true branch.
    let expected_sin: Vec<f32> = to_vec(&x).iter().map(|v| v.sin()).collect();
    assert_eq!(tree_leaves(&out)[0], expected_sin);

    // Replaying the whole capture matches, and flipping the predicate
    // reroutes through the other captured branch.
    let replayed = program.replay(&[pred, x.clone()]).unwrap();
    assert_eq!(to_vec(&replayed[0]), expected_sin);

    let flipped = program
        .replay(&[Tensor::new(0u8, &device).unwrap(), x.clone()])
        .unwrap();
    let expected_neg: Vec<f32> = to_vec(&x).iter().map(|v| -v).collect();
    assert_eq!(to_vec(&flipped[0]), expected_neg);

    // The branches are addressable sub-programs of the recorded node.
    let cond_op = program
        .root()
        .ops
        .iter()
        .find(|op| op.kind == OpKind::Cond)
        .expect("cond node recorded");
    assert_eq!(cond_op.children.len(), 2);
    let true_branch = program
        .replay_subprogram(cond_op.children[0], &[x.clone()])
        .unwrap();
    assert_eq!(to_vec(&true_branch[0]), expected_sin);
    let false_branch = program
        .replay_subprogram(cond_op.children[1], &[x])
        .unwrap();
    assert_eq!(to_vec(&false_branch[0]), expected_neg);
}

#[test]
fn cond_branch_leaf_count_mismatch_is_rejected() {
    let device = Device::Cpu;
    let pred = Tensor::new(1u8, &device).unwrap();
    let x = tensor(&device, &[1.0, 2.0]);

    let operands = PyTree::tuple(vec![PyTree::leaf(pred), PyTree::leaf(x)]);
    let err = capture(operands, |tree| {
        let items = match tree {
            PyTree::Tuple(items) => items,
            _ => unreachable!(),
        };
        let pred = items[0].leaves()[0].clone();
        cond(
            &pred,
            |t: &PyTree<Value>| t.try_map(&mut |v: &Value| v.sin()),
            |t: &PyTree<Value>| {
                let doubled = t.try_map(&mut |v: &Value| v.add_scalar(0.0))?;
                Ok(PyTree::tuple(vec![doubled.clone(), doubled]))
            },
            &items[1],
        )
    })
    .unwrap_err();

    match err {
        ControlFlowError::ContractMismatch { op, site, detail } => {
            assert_eq!(op, "cond");
            assert!(site.contains("true_fn vs false_fn"));
            assert!(detail.contains("1 output leaves"), "{detail}");
        }
        other => panic!("expected a contract mismatch, got {other}"),
    }
    assert!(!is_capturing());
}

#[test]
fn cond_branch_dtype_mismatch_is_rejected() {
    let device = Device::Cpu;
    let pred = Tensor::new(0u8, &device).unwrap();
    let x = tensor(&device, &[1.0]);

    let operands = PyTree::tuple(vec![PyTree::leaf(pred), PyTree::leaf(x)]);
    let err = capture(operands, |tree| {
        let items = match tree {
            PyTree::Tuple(items) => items,
            _ => unreachable!(),
        };
        let pred = items[0].leaves()[0].clone();
        cond(
            &pred,
            |t: &PyTree<Value>| t.try_map(&mut |v: &Value| v.exp()),
            |t: &PyTree<Value>| t.try_map(&mut |v: &Value| v.greater_equal_scalar(0.0)),
            &items[1],
        )
    })
    .unwrap_err();
    assert!(err.to_string().contains("dtype"));
}

#[test]
fn cond_branch_aliasing_is_rejected() {
    let device = Device::Cpu;
    let pred = Tensor::new(1u8, &device).unwrap();
    let x = tensor(&device, &[1.0]);

    let operands = PyTree::tuple(vec![PyTree::leaf(pred), PyTree::leaf(x)]);
    let err = capture(operands, |tree| {
        let items = match tree {
            PyTree::Tuple(items) => items,
            _ => unreachable!(),
        };
        let pred = items[0].leaves()[0].clone();
        cond(
            &pred,
            // Returning the operand untouched is an alias, even via clone:
            // identity survives cloning.
            |t: &PyTree<Value>| Ok(t.clone()),
            |t: &PyTree<Value>| Ok(t.clone()),
            &items[1],
        )
    })
    .unwrap_err();

    match err {
        ControlFlowError::Aliasing { op, branch, .. } => {
            assert_eq!(op, "cond");
            assert_eq!(branch, "true_fn");
        }
        other => panic!("expected an aliasing error, got {other}"),
    }
}

#[test]
fn scan_combine_mutation_is_rejected() {
    let device = Device::Cpu;
    let init = PyTree::leaf(Tensor::new(0f32, &device).unwrap());
    let xs = PyTree::leaf(tensor(&device, &[1.0, 2.0]));

    let operands = PyTree::tuple(vec![init, xs]);
    let err = capture(operands, |tree| {
        let items = match tree {
            PyTree::Tuple(items) => items,
            _ => unreachable!(),
        };
        scan(
            |carry: &PyTree<Value>, x: &PyTree<Value>| {
                // In-place accumulation into the carry argument.
                let mut c = carry.leaves()[0].clone();
                c.add_assign_(x.leaves()[0])?;
                Ok((PyTree::leaf(c.clone()), PyTree::leaf(c)))
            },
            &items[0],
            &items[1],
            0,
            false,
        )
        .map(|(carry, _ys)| carry)
    })
    .unwrap_err();

    match err {
        ControlFlowError::Mutation { op, branch, .. } => {
            assert_eq!(op, "scan");
            assert_eq!(branch, "combine_fn");
        }
        other => panic!("expected a mutation error, got {other}"),
    }
    assert!(!is_capturing());
}

#[test]
fn captured_while_loop_replays_from_new_starts() {
    let device = Device::Cpu;
    let init = Tensor::zeros((1,), DType::F32, &device).unwrap();

    let (out, program) = capture(PyTree::leaf(init), |carry| {
        while_loop(
            |c: &PyTree<Value>| c.leaves()[0].sum_all()?.less_than_scalar(10.0),
            |c: &PyTree<Value>| c.try_map(&mut |v: &Value| v.add_scalar(3.0)),
            carry,
        )
    })
    .unwrap();
    // 0 -> 3 -> 6 -> 9 -> 12.
    assert_eq!(tree_leaves(&out)[0], vec![12.0]);

    let from_five = program
        .replay(&[Tensor::from_vec(vec![5.0f32], (1,), &device).unwrap()])
        .unwrap();
    // 5 -> 8 -> 11.
    assert_eq!(to_vec(&from_five[0]), vec![11.0]);
}

#[test]
fn captured_scan_matches_eager_and_replays() {
    let device = Device::Cpu;
    let init = Tensor::new(0f32, &device).unwrap();
    let xs = tensor(&device, &[0.0, 1.0, 2.0, 3.0]);

    let operands = PyTree::tuple(vec![PyTree::leaf(init), PyTree::leaf(xs)]);
    let (out, program) = capture(operands, |tree| {
        let items = match tree {
            PyTree::Tuple(items) => items,
            _ => unreachable!(),
        };
        let (carry, ys) = scan(
            |carry: &PyTree<Value>, x: &PyTree<Value>| {
                let sum = carry.leaves()[0].add(x.leaves()[0])?;
                Ok((PyTree::leaf(sum.clone()), PyTree::leaf(sum)))
            },
            &items[0],
            &items[1],
            0,
            false,
        )?;
        Ok(PyTree::tuple(vec![carry, ys]))
    })
    .unwrap();

    let leaves = tree_leaves(&out);
    assert_eq!(leaves[0], vec![6.0]);
    assert_eq!(leaves[1], vec![0.0, 1.0, 3.0, 6.0]);

    // Replay on different data follows the same recorded program.
    let replayed = program
        .replay(&[
            Tensor::new(1f32, &device).unwrap(),
            tensor(&device, &[1.0, 1.0, 1.0, 1.0]),
        ])
        .unwrap();
    assert_eq!(to_vec(&replayed[0]), vec![5.0]);
    assert_eq!(to_vec(&replayed[1]), vec![2.0, 3.0, 4.0, 5.0]);
}

#[test]
fn nested_operators_capture_recursively() {
    let device = Device::Cpu;
    let init = Tensor::new(0f32, &device).unwrap();
    let xs = tensor(&device, &[3.0, 3.0, 3.0]);

    let operands = PyTree::tuple(vec![PyTree::leaf(init), PyTree::leaf(xs.clone())]);
    let (out, program) = capture(operands, |tree| {
        let items = match tree {
            PyTree::Tuple(items) => items,
            _ => unreachable!(),
        };
        scan(
            |carry: &PyTree<Value>, x: &PyTree<Value>| {
                let sum = carry.leaves()[0].add(x.leaves()[0])?;
                let saturated = cond(
                    &sum.greater_equal_scalar(5.0)?,
                    |t: &PyTree<Value>| {
                        t.try_map(&mut |v: &Value| v.mul_scalar(0.0)?.add_scalar(5.0))
                    },
                    |t: &PyTree<Value>| t.try_map(&mut |v: &Value| v.add_scalar(0.0)),
                    &PyTree::leaf(sum),
                )?;
                Ok((saturated.clone(), saturated))
            },
            &items[0],
            &items[1],
            0,
            false,
        )
        .map(|(_carry, ys)| ys)
    })
    .unwrap();

    assert_eq!(tree_leaves(&out)[0], vec![3.0, 5.0, 5.0]);

    // The scan node's combine sub-program itself holds a cond node.
    let scan_op = program
        .root()
        .ops
        .iter()
        .find(|op| op.kind == OpKind::Scan)
        .expect("scan node recorded");
    let combine = program.subprogram(scan_op.children[0]);
    assert!(combine.ops.iter().any(|op| op.kind == OpKind::Cond));

    let replayed = program
        .replay(&[Tensor::new(0f32, &device).unwrap(), xs])
        .unwrap();
    assert_eq!(to_vec(&replayed[0]), vec![3.0, 5.0, 5.0]);
}

#[test]
fn closed_over_tensors_are_lifted_into_the_capture() {
    let device = Device::Cpu;
    let bias = Value::new(tensor(&device, &[100.0]));
    let x = tensor(&device, &[1.0, 2.0]);

    let (out, program) = capture(PyTree::leaf(x.clone()), |tree| {
        let pred = Value::new(Tensor::new(1u8, &device).unwrap());
        cond(
            &pred,
            |t: &PyTree<Value>| t.try_map(&mut |v: &Value| v.add(&bias)),
            |t: &PyTree<Value>| t.try_map(&mut |v: &Value| v.sub(&bias)),
            &PyTree::leaf(tree.leaves()[0].clone()),
        )
    })
    .unwrap();
    assert_eq!(tree_leaves(&out)[0], vec![101.0, 102.0]);

    // The free variable rides along as an explicit lifted operand of each
    // branch, so replay does not depend on the host closure.
    let cond_op = program
        .root()
        .ops
        .iter()
        .find(|op| op.kind == OpKind::Cond)
        .expect("cond node recorded");
    let true_branch = program.subprogram(cond_op.children[0]);
    let false_branch = program.subprogram(cond_op.children[1]);
    assert_eq!(true_branch.lifted.len(), 1);
    assert_eq!(false_branch.lifted.len(), 1);
    // Both branches lifted the same value identity.
    assert_eq!(true_branch.lifted[0].0, false_branch.lifted[0].0);

    let replayed = program.replay(&[x]).unwrap();
    assert_eq!(to_vec(&replayed[0]), vec![101.0, 102.0]);
}

#[test]
fn capture_sessions_do_not_nest() {
    let device = Device::Cpu;
    let x = tensor(&device, &[1.0]);
    let err = capture(PyTree::leaf(x.clone()), |_tree| {
        let inner = capture(PyTree::leaf(x.clone()), |t| Ok(t.clone()));
        inner.map(|_| PyTree::leaf(Value::new(x.clone())))
    })
    .unwrap_err();
    assert!(err.to_string().contains("already active"));
    assert!(!is_capturing());
}

#[test]
fn a_failed_capture_releases_the_session() {
    let device = Device::Cpu;
    let x = tensor(&device, &[1.0]);

    let err = capture(PyTree::leaf(x.clone()), |_tree| {
        Err::<PyTree<Value>, _>(control_flow::ControlFlowError::Precondition {
            op: "test",
            message: "forced failure".to_string(),
        })
    })
    .unwrap_err();
    assert!(err.to_string().contains("forced failure"));
    assert!(!is_capturing());

    // A fresh capture on the same thread works.
    let (out, _program) = capture(PyTree::leaf(x), |tree| {
        tree.try_map(&mut |v: &Value| v.add_scalar(1.0))
    })
    .unwrap();
    assert_eq!(tree_leaves(&out)[0], vec![2.0]);
}
