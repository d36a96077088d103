//! Tensor values with capture-time identity.
//!
//! A [`Value`] pairs a candle tensor with a [`ValueId`]. Every operation
//! executes eagerly; when a capture session is ambient the operation is also
//! recorded into the active tape, which is how branch callables become
//! [`Subprogram`](crate::graph::Subprogram)s without a separate symbolic
//! front end. Cloning preserves identity: returning a clone of an operand
//! from a branch is still aliasing, and the purity checker treats it as such.
//!
//! In-place methods (`add_assign_`, `mul_assign_`) rebind the tensor while
//! keeping the identity. That keeps eager semantics ordinary while leaving a
//! structural trail the purity checker can reject when the target is a
//! branch input.

use candle_core::Tensor;

use crate::error::Result;
use crate::graph::{tensor_to_bool, Op, OpKind, ValueId};
use crate::trace;

#[derive(Clone, Debug)]
pub struct Value {
    id: ValueId,
    tensor: Tensor,
}

impl Value {
    /// Wrap a tensor as a fresh traced value.
    pub fn new(tensor: Tensor) -> Self {
        Self {
            id: trace::next_value_id(),
            tensor,
        }
    }

    pub fn id(&self) -> ValueId {
        self.id
    }

    pub fn tensor(&self) -> &Tensor {
        &self.tensor
    }

    pub fn into_tensor(self) -> Tensor {
        self.tensor
    }

    pub fn dims(&self) -> &[usize] {
        self.tensor.dims()
    }

    pub fn dtype(&self) -> candle_core::DType {
        self.tensor.dtype()
    }

    /// Interpret a single-element value as a boolean.
    pub fn as_bool(&self) -> Result<bool> {
        tensor_to_bool(&self.tensor)
    }

    fn binary(&self, rhs: &Value, kind: OpKind, out: Tensor) -> Value {
        let out = Value::new(out);
        trace::record(
            Op::simple(kind, vec![self.id, rhs.id], out.id),
            &[(self.id, &self.tensor), (rhs.id, &rhs.tensor)],
        );
        out
    }

    fn unary(&self, kind: OpKind, out: Tensor) -> Value {
        let out = Value::new(out);
        trace::record(
            Op::simple(kind, vec![self.id], out.id),
            &[(self.id, &self.tensor)],
        );
        out
    }

    fn scalar_op(&self, kind: OpKind, scalar: f64, out: Tensor) -> Value {
        let out = Value::new(out);
        let mut op = Op::simple(kind, vec![self.id], out.id);
        op.scalar = Some(scalar);
        trace::record(op, &[(self.id, &self.tensor)]);
        out
    }

    pub fn add(&self, rhs: &Value) -> Result<Value> {
        Ok(self.binary(rhs, OpKind::Add, self.tensor.broadcast_add(&rhs.tensor)?))
    }

    pub fn sub(&self, rhs: &Value) -> Result<Value> {
        Ok(self.binary(rhs, OpKind::Sub, self.tensor.broadcast_sub(&rhs.tensor)?))
    }

    pub fn mul(&self, rhs: &Value) -> Result<Value> {
        Ok(self.binary(rhs, OpKind::Mul, self.tensor.broadcast_mul(&rhs.tensor)?))
    }

    pub fn div(&self, rhs: &Value) -> Result<Value> {
        Ok(self.binary(rhs, OpKind::Div, self.tensor.broadcast_div(&rhs.tensor)?))
    }

    pub fn maximum(&self, rhs: &Value) -> Result<Value> {
        Ok(self.binary(rhs, OpKind::Maximum, self.tensor.broadcast_maximum(&rhs.tensor)?))
    }

    pub fn minimum(&self, rhs: &Value) -> Result<Value> {
        Ok(self.binary(rhs, OpKind::Minimum, self.tensor.broadcast_minimum(&rhs.tensor)?))
    }

    pub fn matmul(&self, rhs: &Value) -> Result<Value> {
        Ok(self.binary(rhs, OpKind::MatMul, self.tensor.broadcast_matmul(&rhs.tensor)?))
    }

    pub fn greater_equal(&self, rhs: &Value) -> Result<Value> {
        Ok(self.binary(rhs, OpKind::GreaterEqual, self.tensor.broadcast_ge(&rhs.tensor)?))
    }

    pub fn less_than(&self, rhs: &Value) -> Result<Value> {
        Ok(self.binary(rhs, OpKind::LessThan, self.tensor.broadcast_lt(&rhs.tensor)?))
    }

    pub fn equal(&self, rhs: &Value) -> Result<Value> {
        Ok(self.binary(rhs, OpKind::Equal, self.tensor.broadcast_eq(&rhs.tensor)?))
    }

    pub fn neg(&self) -> Result<Value> {
        Ok(self.unary(OpKind::Neg, self.tensor.neg()?))
    }

    pub fn abs(&self) -> Result<Value> {
        Ok(self.unary(OpKind::Abs, self.tensor.abs()?))
    }

    pub fn exp(&self) -> Result<Value> {
        Ok(self.unary(OpKind::Exp, self.tensor.exp()?))
    }

    pub fn sin(&self) -> Result<Value> {
        Ok(self.unary(OpKind::Sin, self.tensor.sin()?))
    }

    pub fn cos(&self) -> Result<Value> {
        Ok(self.unary(OpKind::Cos, self.tensor.cos()?))
    }

    pub fn sqrt(&self) -> Result<Value> {
        Ok(self.unary(OpKind::Sqrt, self.tensor.sqrt()?))
    }

    pub fn add_scalar(&self, scalar: f64) -> Result<Value> {
        Ok(self.scalar_op(OpKind::AddScalar, scalar, self.tensor.affine(1.0, scalar)?))
    }

    pub fn mul_scalar(&self, scalar: f64) -> Result<Value> {
        Ok(self.scalar_op(OpKind::MulScalar, scalar, self.tensor.affine(scalar, 0.0)?))
    }

    pub fn greater_equal_scalar(&self, scalar: f64) -> Result<Value> {
        Ok(self.scalar_op(OpKind::GreaterEqualScalar, scalar, self.tensor.ge(scalar)?))
    }

    pub fn less_than_scalar(&self, scalar: f64) -> Result<Value> {
        Ok(self.scalar_op(OpKind::LessThanScalar, scalar, self.tensor.lt(scalar)?))
    }

    pub fn sum_all(&self) -> Result<Value> {
        Ok(self.unary(OpKind::SumAll, self.tensor.sum_all()?))
    }

    pub fn sum_dim(&self, dim: usize) -> Result<Value> {
        let out = Value::new(self.tensor.sum(dim)?);
        let mut op = Op::simple(OpKind::SumDim, vec![self.id], out.id);
        op.dim = Some(dim);
        trace::record(op, &[(self.id, &self.tensor)]);
        Ok(out)
    }

    /// In-place accumulate; the value keeps its identity.
    pub fn add_assign_(&mut self, rhs: &Value) -> Result<()> {
        self.tensor = self.tensor.broadcast_add(&rhs.tensor)?;
        let op = Op::simple(OpKind::AddAssign, vec![self.id, rhs.id], self.id);
        trace::record(op, &[(self.id, &self.tensor), (rhs.id, &rhs.tensor)]);
        Ok(())
    }

    /// In-place scale; the value keeps its identity.
    pub fn mul_assign_(&mut self, rhs: &Value) -> Result<()> {
        self.tensor = self.tensor.broadcast_mul(&rhs.tensor)?;
        let op = Op::simple(OpKind::MulAssign, vec![self.id, rhs.id], self.id);
        trace::record(op, &[(self.id, &self.tensor), (rhs.id, &rhs.tensor)]);
        Ok(())
    }
}

impl From<Tensor> for Value {
    fn from(tensor: Tensor) -> Self {
        Value::new(tensor)
    }
}
