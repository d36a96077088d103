//! Reference block-sparse attention path.
//!
//! An eager, CPU-portable scaled-dot-product attention that consumes a
//! [`BlockMask`] at element granularity. It stands in for the tiled kernel
//! during testing: the kernel walks the ordered block lists, this path
//! expands them back to a dense mask and lets candle do the rest. Inputs
//! `q`, `k`, `v` share the `[batch, heads, seq_len, head_dim]` layout;
//! reductions run in `f32` and the output matches the input dtype.
//!
//! Query rows with no visible keys produce zero output rows rather than NaN.

use candle_core::{DType, Shape, Tensor};
use candle_nn::ops::softmax_last_dim;

use crate::block_mask::BlockMask;
use crate::builder::block_grid_to_element_mask;
use crate::error::{shape_err, MaskError, Result};
use crate::predicate::{index_grid, ScoreMod};

/// Compute attention with an optional score rewrite and block mask.
///
/// `scale` defaults to `1/sqrt(head_dim)`. With no mask every position is
/// visible, matching [`BlockMask::default_full`].
pub fn block_sparse_attention(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    score_mod: Option<&ScoreMod>,
    block_mask: Option<&BlockMask>,
    scale: Option<f64>,
) -> Result<Tensor> {
    let (batch, heads, q_len, head_dim) = q
        .dims4()
        .map_err(|_| shape_err("q must have shape [batch, heads, seq_len, head_dim]"))?;
    let (kb, kh, kv_len, kd) = k
        .dims4()
        .map_err(|_| shape_err("k must have shape [batch, heads, seq_len, head_dim]"))?;
    let (vb, vh, vk, v_dim) = v
        .dims4()
        .map_err(|_| shape_err("v must have shape [batch, heads, seq_len, head_dim]"))?;

    if kb != batch || kh != heads || kd != head_dim {
        return Err(shape_err(format!(
            "k shape mismatch: expected [{}, {}, ?, {}], got [{}, {}, {}, {}]",
            batch, heads, head_dim, kb, kh, kv_len, kd
        )));
    }
    if vb != batch || vh != heads || vk != kv_len {
        return Err(shape_err(format!(
            "v shape mismatch: expected [{}, {}, {}, ?], got [{}, {}, {}, {}]",
            batch, heads, kv_len, vb, vh, vk, v_dim
        )));
    }

    let device = q.device();
    if !device.same_device(k.device()) || !device.same_device(v.device()) {
        return Err(MaskError::DeviceMismatch(
            "q, k, v must reside on the same device".to_string(),
        ));
    }
    let dtype = q.dtype();
    if dtype != k.dtype() || dtype != v.dtype() {
        return Err(shape_err("q, k, v must share the same dtype"));
    }
    if !matches!(dtype, DType::F32 | DType::F16 | DType::BF16) {
        return Err(shape_err(format!(
            "unsupported attention dtype {:?}",
            dtype
        )));
    }

    let owned_default;
    let mask = match block_mask {
        Some(mask) => mask,
        None => {
            owned_default = BlockMask::default_full(q_len, kv_len, device)?;
            &owned_default
        }
    };
    mask.validate_device(device)?;

    let grid = mask.to_dense()?;
    if grid.rank() != 4 {
        return Err(shape_err(format!(
            "block mask grid must have 4 dimensions, got {:?}",
            grid.dims()
        )));
    }
    let (gb, gh, _, _) = grid.dims4()?;
    if (gb != 1 && gb != batch) || (gh != 1 && gh != heads) {
        return Err(shape_err(format!(
            "block mask batch/head dims {:?} do not broadcast to [{}, {}]",
            grid.dims(),
            batch,
            heads
        )));
    }
    let element_mask = block_grid_to_element_mask(&grid, mask.block_size(), q_len, kv_len)?
        .broadcast_as(Shape::from_dims(&[batch, heads, q_len, kv_len]))?
        .contiguous()?;

    let scale = scale.unwrap_or(1.0 / (head_dim as f64).sqrt());
    let merged = batch * heads;
    let q_work = q
        .to_dtype(DType::F32)?
        .reshape(Shape::from_dims(&[merged, q_len, head_dim]))?;
    let k_work = k
        .to_dtype(DType::F32)?
        .reshape(Shape::from_dims(&[merged, kv_len, head_dim]))?;
    let v_work = v
        .to_dtype(DType::F32)?
        .reshape(Shape::from_dims(&[merged, kv_len, v_dim]))?;

    let mut scores = q_work
        .matmul(&k_work.transpose(1, 2)?)?
        .affine(scale, 0.0)?
        .reshape(Shape::from_dims(&[batch, heads, q_len, kv_len]))?;

    if let Some(score_mod) = score_mod {
        let (bs, hs, qs, kvs) = index_grid(batch, heads, q_len, kv_len, device)?;
        scores = score_mod
            .call(&scores, &bs, &hs, &qs, &kvs)?
            .broadcast_as(Shape::from_dims(&[batch, heads, q_len, kv_len]))?
            .contiguous()?;
    }

    let neg_inf = Tensor::full(f32::NEG_INFINITY, scores.shape(), device)?;
    let masked = element_mask.where_cond(&scores, &neg_inf)?;

    let probs = softmax_last_dim(&masked.reshape(Shape::from_dims(&[merged, q_len, kv_len]))?)?
        .reshape(Shape::from_dims(&[batch, heads, q_len, kv_len]))?;

    // Fully-masked rows softmax to NaN; force them to contribute nothing.
    let visible_rows = element_mask.to_dtype(DType::F32)?.sum(3)?.gt(0f64)?;
    let probs = visible_rows
        .unsqueeze(3)?
        .broadcast_as(probs.shape())?
        .where_cond(&probs, &probs.zeros_like()?)?;

    let output = probs
        .reshape(Shape::from_dims(&[merged, q_len, kv_len]))?
        .matmul(&v_work)?
        .reshape(Shape::from_dims(&[batch, heads, q_len, v_dim]))?;
    Ok(output.to_dtype(dtype)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{create_block_mask, BlockMaskOptions};
    use crate::block_mask::BlockSize;
    use crate::predicate::{MaskMod, ScoreMod};
    use candle_core::{Device, Result as CandleResult};

    fn build_inputs(device: &Device) -> CandleResult<(Tensor, Tensor, Tensor)> {
        let data: Vec<f32> = (0..64).map(|i| (i as f32) * 0.01).collect();
        let q = Tensor::from_vec(data.clone(), (1, 2, 4, 8), device)?;
        let k = Tensor::from_vec(data.clone(), (1, 2, 4, 8), device)?;
        let v = Tensor::from_vec(data, (1, 2, 4, 8), device)?;
        Ok((q, k, v))
    }

    fn naive_masked_attention(
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: &[u8],
    ) -> CandleResult<Tensor> {
        let (batch, heads, q_len, head_dim) = q.dims4()?;
        let (_, _, k_len, _) = k.dims4()?;
        let q_vec = q.flatten_all()?.to_vec1::<f32>()?;
        let k_vec = k.flatten_all()?.to_vec1::<f32>()?;
        let v_vec = v.flatten_all()?.to_vec1::<f32>()?;
        let scale = 1.0 / (head_dim as f32).sqrt();
        let mut output = vec![0f32; batch * heads * q_len * head_dim];

        for b in 0..batch {
            for h in 0..heads {
                for qi in 0..q_len {
                    let mut row = vec![f32::NEG_INFINITY; k_len];
                    let mut max_val = f32::NEG_INFINITY;
                    for ki in 0..k_len {
                        let mi = ((b * heads + h) * q_len + qi) * k_len + ki;
                        if mask[mi] == 0 {
                            continue;
                        }
                        let mut dot = 0f32;
                        for d in 0..head_dim {
                            let qidx = ((b * heads + h) * q_len + qi) * head_dim + d;
                            let kidx = ((b * heads + h) * k_len + ki) * head_dim + d;
                            dot += q_vec[qidx] * k_vec[kidx];
                        }
                        row[ki] = dot * scale;
                        if row[ki] > max_val {
                            max_val = row[ki];
                        }
                    }
                    let mut denom = 0f32;
                    for val in row.iter_mut() {
                        if *val == f32::NEG_INFINITY {
                            *val = 0.0;
                        } else {
                            *val = (*val - max_val).exp();
                            denom += *val;
                        }
                    }
                    if denom == 0.0 {
                        continue;
                    }
                    for d in 0..head_dim {
                        let mut acc = 0f32;
                        for ki in 0..k_len {
                            let vidx = ((b * heads + h) * k_len + ki) * head_dim + d;
                            acc += row[ki] / denom * v_vec[vidx];
                        }
                        output[((b * heads + h) * q_len + qi) * head_dim + d] = acc;
                    }
                }
            }
        }
        Tensor::from_vec(output, (batch, heads, q_len, head_dim), q.device())
    }

    #[test]
    fn unmasked_reference_matches_naive() -> CandleResult<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device)?;
        let out = block_sparse_attention(&q, &k, &v, None, None, None).unwrap();
        let mask = vec![1u8; 2 * 4 * 4];
        let expected = naive_masked_attention(&q, &k, &v, &mask)?;
        let diff = out.sub(&expected)?.abs()?.flatten_all()?.to_vec1::<f32>()?;
        assert!(diff.iter().all(|&d| d < 1e-5));
        Ok(())
    }

    #[test]
    fn causal_block_mask_matches_dense_masking() -> CandleResult<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device)?;
        let causal = MaskMod::named("causal", |_b, _h, qi, kv| qi.broadcast_ge(kv));
        let block_mask = create_block_mask(
            &causal.clone().into(),
            1,
            2,
            4,
            4,
            &device,
            BlockMaskOptions::from(BlockSize::square(1)),
        )
        .unwrap();
        let out =
            block_sparse_attention(&q, &k, &v, None, Some(&block_mask), None).unwrap();

        let mut mask = vec![0u8; 2 * 4 * 4];
        for h in 0..2 {
            for qi in 0..4 {
                for ki in 0..=qi {
                    mask[(h * 4 + qi) * 4 + ki] = 1;
                }
            }
        }
        let expected = naive_masked_attention(&q, &k, &v, &mask)?;
        let diff = out.sub(&expected)?.abs()?.flatten_all()?.to_vec1::<f32>()?;
        assert!(diff.iter().all(|&d| d < 1e-5));
        Ok(())
    }

    #[test]
    fn score_mod_shifts_scores() -> CandleResult<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device)?;
        // A constant shift must cancel inside the softmax.
        let shift = ScoreMod::named("shift", |score, _b, _h, _q, _kv| score.affine(1.0, 5.0));
        let base = block_sparse_attention(&q, &k, &v, None, None, None).unwrap();
        let shifted =
            block_sparse_attention(&q, &k, &v, Some(&shift), None, None).unwrap();
        let diff = base
            .sub(&shifted)?
            .abs()?
            .flatten_all()?
            .to_vec1::<f32>()?;
        assert!(diff.iter().all(|&d| d < 1e-5));
        Ok(())
    }

    #[test]
    fn fully_masked_rows_produce_zeros() -> CandleResult<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device)?;
        // No query may see any key.
        let nothing = MaskMod::named("nothing", |_b, _h, qi, kv| {
            let lhs = qi.broadcast_add(kv)?;
            lhs.broadcast_lt(&lhs.zeros_like()?)
        });
        let block_mask = create_block_mask(
            &nothing.into(),
            1,
            2,
            4,
            4,
            &device,
            BlockMaskOptions::from(BlockSize::square(2)),
        )
        .unwrap();
        let out =
            block_sparse_attention(&q, &k, &v, None, Some(&block_mask), None).unwrap();
        let values = out.flatten_all()?.to_vec1::<f32>()?;
        assert!(values.iter().all(|&v| v == 0.0));
        Ok(())
    }

    #[test]
    fn mismatched_shapes_error() {
        let device = Device::Cpu;
        let q = Tensor::zeros((1, 2, 4, 8), DType::F32, &device).unwrap();
        let k = Tensor::zeros((1, 2, 5, 8), DType::F32, &device).unwrap();
        let v = Tensor::zeros((1, 2, 4, 8), DType::F32, &device).unwrap();
        let err = block_sparse_attention(&q, &k, &v, None, None, None).unwrap_err();
        assert!(err.to_string().contains("v shape mismatch"));
    }
}
