//! Captured sub-programs and their replay interpreter.
//!
//! A [`Subprogram`] is the immutable product of tracing a branch callable:
//! a flat operation list over value identities, the declared input/output
//! leaves with their pytree structures, and the free variables the branch
//! closed over (lifted into explicit operands so the capture is
//! self-describing). Sub-programs live in a [`ProgramArena`] and reference
//! nested control-flow bodies by [`SubprogramId`], so recursion depth is
//! bounded by the tree, not by host-language call frames.

use std::collections::HashMap;

use candle_core::{DType, Tensor};

use crate::error::{precondition, ControlFlowError, Result};
use crate::pytree::TreeStructure;

/// Identity of a traced value. Mutating ops keep the identity of their
/// target, which is exactly what the purity checker looks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(pub(crate) u64);

/// Handle into a [`ProgramArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubprogramId(pub(crate) usize);

/// Operation vocabulary shared by tracing and replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    // binary, broadcasting
    Add,
    Sub,
    Mul,
    Div,
    Maximum,
    Minimum,
    MatMul,
    GreaterEqual,
    LessThan,
    Equal,
    // unary
    Neg,
    Abs,
    Exp,
    Sin,
    Cos,
    Sqrt,
    // scalar forms
    AddScalar,
    MulScalar,
    GreaterEqualScalar,
    LessThanScalar,
    // reductions
    SumAll,
    SumDim,
    // in-place
    AddAssign,
    MulAssign,
    // structured control flow
    Cond,
    WhileLoop,
    Scan,
    AssociativeScan,
    Map,
}

impl OpKind {
    pub fn is_mutating(self) -> bool {
        matches!(self, OpKind::AddAssign | OpKind::MulAssign)
    }

    pub fn is_control_flow(self) -> bool {
        matches!(
            self,
            OpKind::Cond | OpKind::WhileLoop | OpKind::Scan | OpKind::AssociativeScan | OpKind::Map
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            OpKind::Add => "add",
            OpKind::Sub => "sub",
            OpKind::Mul => "mul",
            OpKind::Div => "div",
            OpKind::Maximum => "maximum",
            OpKind::Minimum => "minimum",
            OpKind::MatMul => "matmul",
            OpKind::GreaterEqual => "greater_equal",
            OpKind::LessThan => "less_than",
            OpKind::Equal => "equal",
            OpKind::Neg => "neg",
            OpKind::Abs => "abs",
            OpKind::Exp => "exp",
            OpKind::Sin => "sin",
            OpKind::Cos => "cos",
            OpKind::Sqrt => "sqrt",
            OpKind::AddScalar => "add_scalar",
            OpKind::MulScalar => "mul_scalar",
            OpKind::GreaterEqualScalar => "greater_equal_scalar",
            OpKind::LessThanScalar => "less_than_scalar",
            OpKind::SumAll => "sum_all",
            OpKind::SumDim => "sum_dim",
            OpKind::AddAssign => "add_assign",
            OpKind::MulAssign => "mul_assign",
            OpKind::Cond => "cond",
            OpKind::WhileLoop => "while_loop",
            OpKind::Scan => "scan",
            OpKind::AssociativeScan => "associative_scan",
            OpKind::Map => "map",
        }
    }
}

impl std::fmt::Display for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One recorded operation.
#[derive(Debug, Clone)]
pub struct Op {
    pub kind: OpKind,
    pub inputs: Vec<ValueId>,
    pub outputs: Vec<ValueId>,
    /// Immediate attached to the scalar op forms.
    pub scalar: Option<f64>,
    /// Reduction or scan axis.
    pub dim: Option<usize>,
    pub reverse: bool,
    /// How many leading `inputs` (after any predicate) are carry leaves for
    /// `scan`, or mapped leaves for `map`.
    pub split: Option<usize>,
    /// Captured bodies of a control-flow op, in operator-specific order.
    pub children: Vec<SubprogramId>,
}

impl Op {
    pub(crate) fn simple(kind: OpKind, inputs: Vec<ValueId>, output: ValueId) -> Self {
        Self {
            kind,
            inputs,
            outputs: vec![output],
            scalar: None,
            dim: None,
            reverse: false,
            split: None,
            children: Vec::new(),
        }
    }

    /// The input this op rewrites in place, if any.
    pub fn mutated(&self) -> Option<ValueId> {
        if self.kind.is_mutating() {
            self.inputs.first().copied()
        } else {
            None
        }
    }
}

/// Dtype and shape of one leaf at capture time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafSpec {
    pub dtype: DType,
    pub shape: Vec<usize>,
}

impl LeafSpec {
    pub fn of(tensor: &Tensor) -> Self {
        Self {
            dtype: tensor.dtype(),
            shape: tensor.dims().to_vec(),
        }
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }
}

impl std::fmt::Display for LeafSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}{:?}", self.dtype, self.shape)
    }
}

/// Immutable capture of one branch callable.
#[derive(Debug, Clone)]
pub struct Subprogram {
    /// Declared operand identities, bound positionally on replay.
    pub inputs: Vec<ValueId>,
    /// Free variables the branch closed over, with their capture-time
    /// tensors. Bound automatically on replay.
    pub lifted: Vec<(ValueId, Tensor)>,
    pub outputs: Vec<ValueId>,
    pub ops: Vec<Op>,
    pub input_structure: TreeStructure,
    pub output_structure: TreeStructure,
    pub input_specs: Vec<LeafSpec>,
    pub output_specs: Vec<LeafSpec>,
}

impl Subprogram {
    /// Declared plus lifted input identities, the full operand surface the
    /// purity checker reasons about.
    pub fn all_input_ids(&self) -> Vec<ValueId> {
        let mut ids = self.inputs.clone();
        ids.extend(self.lifted.iter().map(|(id, _)| *id));
        ids
    }
}

/// Arena of captured sub-programs.
#[derive(Debug, Clone, Default)]
pub struct ProgramArena {
    programs: Vec<Subprogram>,
}

impl ProgramArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, sub: Subprogram) -> SubprogramId {
        self.programs.push(sub);
        SubprogramId(self.programs.len() - 1)
    }

    pub fn get(&self, id: SubprogramId) -> &Subprogram {
        &self.programs[id.0]
    }

    pub fn len(&self) -> usize {
        self.programs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.programs.is_empty()
    }

    /// Re-execute a captured sub-program on fresh operand leaves.
    pub fn replay(&self, id: SubprogramId, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
        let sub = self.get(id);
        if inputs.len() != sub.inputs.len() {
            return Err(precondition(
                "replay",
                format!(
                    "sub-program expects {} operand leaves, got {}",
                    sub.inputs.len(),
                    inputs.len()
                ),
            ));
        }
        let mut env: HashMap<ValueId, Tensor> = HashMap::new();
        for (id, tensor) in sub.inputs.iter().zip(inputs.iter()) {
            env.insert(*id, tensor.clone());
        }
        for (id, tensor) in &sub.lifted {
            env.insert(*id, tensor.clone());
        }

        for op in &sub.ops {
            self.eval_op(op, &mut env)?;
        }

        sub.outputs
            .iter()
            .map(|id| {
                env.get(id).cloned().ok_or_else(|| {
                    precondition("replay", "sub-program output was never produced".to_string())
                })
            })
            .collect()
    }

    fn eval_op(&self, op: &Op, env: &mut HashMap<ValueId, Tensor>) -> Result<()> {
        let operand = |id: &ValueId| -> Result<Tensor> {
            env.get(id)
                .cloned()
                .ok_or_else(|| precondition("replay", "operation input missing from environment"))
        };

        if op.kind.is_control_flow() {
            return self.eval_control_op(op, env);
        }

        let out = match op.kind {
            OpKind::Add => operand(&op.inputs[0])?.broadcast_add(&operand(&op.inputs[1])?)?,
            OpKind::Sub => operand(&op.inputs[0])?.broadcast_sub(&operand(&op.inputs[1])?)?,
            OpKind::Mul => operand(&op.inputs[0])?.broadcast_mul(&operand(&op.inputs[1])?)?,
            OpKind::Div => operand(&op.inputs[0])?.broadcast_div(&operand(&op.inputs[1])?)?,
            OpKind::Maximum => {
                operand(&op.inputs[0])?.broadcast_maximum(&operand(&op.inputs[1])?)?
            }
            OpKind::Minimum => {
                operand(&op.inputs[0])?.broadcast_minimum(&operand(&op.inputs[1])?)?
            }
            OpKind::MatMul => {
                operand(&op.inputs[0])?.broadcast_matmul(&operand(&op.inputs[1])?)?
            }
            OpKind::GreaterEqual => {
                operand(&op.inputs[0])?.broadcast_ge(&operand(&op.inputs[1])?)?
            }
            OpKind::LessThan => operand(&op.inputs[0])?.broadcast_lt(&operand(&op.inputs[1])?)?,
            OpKind::Equal => operand(&op.inputs[0])?.broadcast_eq(&operand(&op.inputs[1])?)?,
            OpKind::Neg => operand(&op.inputs[0])?.neg()?,
            OpKind::Abs => operand(&op.inputs[0])?.abs()?,
            OpKind::Exp => operand(&op.inputs[0])?.exp()?,
            OpKind::Sin => operand(&op.inputs[0])?.sin()?,
            OpKind::Cos => operand(&op.inputs[0])?.cos()?,
            OpKind::Sqrt => operand(&op.inputs[0])?.sqrt()?,
            OpKind::AddScalar => {
                let s = op.scalar.unwrap_or(0.0);
                operand(&op.inputs[0])?.affine(1.0, s)?
            }
            OpKind::MulScalar => {
                let s = op.scalar.unwrap_or(1.0);
                operand(&op.inputs[0])?.affine(s, 0.0)?
            }
            OpKind::GreaterEqualScalar => {
                let s = op.scalar.unwrap_or(0.0);
                operand(&op.inputs[0])?.ge(s)?
            }
            OpKind::LessThanScalar => {
                let s = op.scalar.unwrap_or(0.0);
                operand(&op.inputs[0])?.lt(s)?
            }
            OpKind::SumAll => operand(&op.inputs[0])?.sum_all()?,
            OpKind::SumDim => {
                let dim = op.dim.unwrap_or(0);
                operand(&op.inputs[0])?.sum(dim)?
            }
            OpKind::AddAssign => {
                let updated =
                    operand(&op.inputs[0])?.broadcast_add(&operand(&op.inputs[1])?)?;
                env.insert(op.inputs[0], updated);
                return Ok(());
            }
            OpKind::MulAssign => {
                let updated =
                    operand(&op.inputs[0])?.broadcast_mul(&operand(&op.inputs[1])?)?;
                env.insert(op.inputs[0], updated);
                return Ok(());
            }
            OpKind::Cond
            | OpKind::WhileLoop
            | OpKind::Scan
            | OpKind::AssociativeScan
            | OpKind::Map => unreachable!("handled by eval_control_op"),
        };
        env.insert(op.outputs[0], out);
        Ok(())
    }

    fn eval_control_op(&self, op: &Op, env: &mut HashMap<ValueId, Tensor>) -> Result<()> {
        let gather = |ids: &[ValueId]| -> Result<Vec<Tensor>> {
            ids.iter()
                .map(|id| {
                    env.get(id).cloned().ok_or_else(|| {
                        precondition("replay", "operation input missing from environment")
                    })
                })
                .collect()
        };

        let outputs = match op.kind {
            OpKind::Cond => {
                let pred = gather(&op.inputs[..1])?.remove(0);
                let operands = gather(&op.inputs[1..])?;
                let branch = if tensor_to_bool(&pred)? {
                    op.children[0]
                } else {
                    op.children[1]
                };
                self.replay(branch, &operands)?
            }
            OpKind::WhileLoop => {
                let mut carry = gather(&op.inputs)?;
                loop {
                    let keep_going = self.replay(op.children[0], &carry)?;
                    if !tensor_to_bool(&keep_going[0])? {
                        break;
                    }
                    carry = self.replay(op.children[1], &carry)?;
                }
                carry
            }
            OpKind::Scan => {
                let split = op.split.unwrap_or(0);
                let dim = op.dim.unwrap_or(0);
                let mut carry = gather(&op.inputs[..split])?;
                let xs = gather(&op.inputs[split..])?;
                let steps = scan_axis_len("scan", &xs, dim)?;
                let order: Vec<usize> = if op.reverse {
                    (0..steps).rev().collect()
                } else {
                    (0..steps).collect()
                };
                let mut per_leaf: Vec<Vec<Tensor>> = Vec::new();
                for &step in &order {
                    let mut operands = carry.clone();
                    for x in &xs {
                        operands.push(x.narrow(dim, step, 1)?.squeeze(dim)?);
                    }
                    let mut result = self.replay(op.children[0], &operands)?;
                    let ys = result.split_off(split);
                    carry = result;
                    if per_leaf.is_empty() {
                        per_leaf = ys.into_iter().map(|y| vec![y]).collect();
                    } else {
                        for (bucket, y) in per_leaf.iter_mut().zip(ys) {
                            bucket.push(y);
                        }
                    }
                }
                let mut outputs = carry;
                for mut bucket in per_leaf {
                    if op.reverse {
                        bucket.reverse();
                    }
                    outputs.push(stack_along(&bucket, dim)?);
                }
                outputs
            }
            OpKind::Map => {
                let split = op.split.unwrap_or(op.inputs.len());
                let xs = gather(&op.inputs[..split])?;
                let extra = gather(&op.inputs[split..])?;
                let steps = scan_axis_len("map", &xs, 0)?;
                let mut per_leaf: Vec<Vec<Tensor>> = Vec::new();
                for step in 0..steps {
                    let mut operands: Vec<Tensor> = xs
                        .iter()
                        .map(|x| Ok(x.narrow(0, step, 1)?.squeeze(0)?))
                        .collect::<Result<_>>()?;
                    operands.extend(extra.iter().cloned());
                    let ys = self.replay(op.children[0], &operands)?;
                    if per_leaf.is_empty() {
                        per_leaf = ys.into_iter().map(|y| vec![y]).collect();
                    } else {
                        for (bucket, y) in per_leaf.iter_mut().zip(ys) {
                            bucket.push(y);
                        }
                    }
                }
                per_leaf
                    .into_iter()
                    .map(|bucket| stack_along(&bucket, 0))
                    .collect::<Result<_>>()?
            }
            OpKind::AssociativeScan => {
                let dim = op.dim.unwrap_or(0);
                let xs = gather(&op.inputs)?;
                let xs = if op.reverse {
                    xs.iter()
                        .map(|x| flip_along(x, dim))
                        .collect::<Result<Vec<_>>>()?
                } else {
                    xs
                };
                let steps = scan_axis_len("associative_scan", &xs, dim)?;
                let mut acc: Vec<Tensor> = xs
                    .iter()
                    .map(|x| Ok(x.narrow(dim, 0, 1)?.squeeze(dim)?))
                    .collect::<Result<_>>()?;
                let mut per_leaf: Vec<Vec<Tensor>> =
                    acc.iter().map(|t| vec![t.clone()]).collect();
                for step in 1..steps {
                    let mut operands = acc.clone();
                    for x in &xs {
                        operands.push(x.narrow(dim, step, 1)?.squeeze(dim)?);
                    }
                    acc = self.replay(op.children[0], &operands)?;
                    for (bucket, t) in per_leaf.iter_mut().zip(acc.iter()) {
                        bucket.push(t.clone());
                    }
                }
                let stacked: Vec<Tensor> = per_leaf
                    .into_iter()
                    .map(|bucket| stack_along(&bucket, dim))
                    .collect::<Result<_>>()?;
                if op.reverse {
                    stacked
                        .iter()
                        .map(|t| flip_along(t, dim))
                        .collect::<Result<_>>()?
                } else {
                    stacked
                }
            }
            _ => unreachable!("eval_control_op only handles control-flow kinds"),
        };

        if outputs.len() != op.outputs.len() {
            return Err(ControlFlowError::ContractMismatch {
                op: op.kind.name(),
                site: "replay outputs".to_string(),
                detail: format!(
                    "recorded node declares {} output leaves, replay produced {}",
                    op.outputs.len(),
                    outputs.len()
                ),
            });
        }
        for (id, tensor) in op.outputs.iter().zip(outputs) {
            env.insert(*id, tensor);
        }
        Ok(())
    }
}

/// Interpret a single-element tensor as a boolean.
pub(crate) fn tensor_to_bool(tensor: &Tensor) -> Result<bool> {
    if tensor.elem_count() != 1 {
        return Err(precondition(
            "predicate",
            format!(
                "expected a single boolean element, got shape {:?}",
                tensor.dims()
            ),
        ));
    }
    let value = tensor
        .to_dtype(DType::F32)?
        .flatten_all()?
        .to_vec1::<f32>()?[0];
    Ok(value != 0.0)
}

/// Shared size of the scanned axis across leaves; errors on rank or size
/// disagreement and on a zero-length axis.
pub(crate) fn scan_axis_len(op: &'static str, leaves: &[Tensor], dim: usize) -> Result<usize> {
    let mut len: Option<usize> = None;
    for leaf in leaves {
        if leaf.rank() <= dim {
            return Err(precondition(
                op,
                format!(
                    "scan dim {} out of range for leaf of shape {:?}",
                    dim,
                    leaf.dims()
                ),
            ));
        }
        let this = leaf.dims()[dim];
        match len {
            None => len = Some(this),
            Some(prev) if prev != this => {
                return Err(precondition(
                    op,
                    format!("leaves disagree on scan axis length: {} vs {}", prev, this),
                ));
            }
            _ => {}
        }
    }
    match len {
        Some(0) | None => Err(precondition(op, "cannot scan 0 leading dim".to_string())),
        Some(n) => Ok(n),
    }
}

pub(crate) fn stack_along(parts: &[Tensor], dim: usize) -> Result<Tensor> {
    let refs: Vec<&Tensor> = parts.iter().collect();
    Ok(Tensor::stack(&refs, dim)?)
}

/// Reverse a tensor along one axis via index_select; candle has no flip.
pub(crate) fn flip_along(tensor: &Tensor, dim: usize) -> Result<Tensor> {
    let n = tensor.dims()[dim];
    let rev: Vec<u32> = (0..n as u32).rev().collect();
    let idx = Tensor::from_vec(rev, (n,), tensor.device())?;
    Ok(tensor.index_select(&idx, dim)?)
}
