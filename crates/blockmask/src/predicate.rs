//! Mask and score predicates over broadcast index grids.
//!
//! A mask predicate answers "may query `q` attend to key `kv`?" for every
//! `(batch, head, q, kv)` coordinate; a score predicate rewrites an attention
//! score given the same coordinates. Instead of evaluating one scalar at a
//! time, predicates receive index tensors pre-shaped for broadcasting
//! (`b: [B,1,1,1]`, `h: [1,H,1,1]`, `q: [1,1,Q,1]`, `kv: [1,1,1,KV]`, dtype
//! `i64`) so a single tensor expression covers the whole grid. Tensors the
//! predicate closes over are untouched by the lifting and broadcast like any
//! other operand.
//!
//! The two arities are distinct types joined by [`ModFn`]; call sites state
//! which form they accept rather than inspecting the callable.

use std::sync::Arc;

use candle_core::{DType, Device, Shape, Tensor};

use crate::error::{MaskError, Result};

type MaskFnInner =
    dyn Fn(&Tensor, &Tensor, &Tensor, &Tensor) -> candle_core::Result<Tensor> + Send + Sync;
type ScoreFnInner = dyn Fn(&Tensor, &Tensor, &Tensor, &Tensor, &Tensor) -> candle_core::Result<Tensor>
    + Send
    + Sync;

/// Four-argument boolean predicate over `(b, h, q, kv)` index tensors.
#[derive(Clone)]
pub struct MaskMod {
    name: &'static str,
    f: Arc<MaskFnInner>,
}

impl MaskMod {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Tensor, &Tensor, &Tensor, &Tensor) -> candle_core::Result<Tensor>
            + Send
            + Sync
            + 'static,
    {
        Self::named("mask_mod", f)
    }

    /// Attach a name that survives into `Display` output of the masks built
    /// from this predicate.
    pub fn named<F>(name: &'static str, f: F) -> Self
    where
        F: Fn(&Tensor, &Tensor, &Tensor, &Tensor) -> candle_core::Result<Tensor>
            + Send
            + Sync
            + 'static,
    {
        Self { name, f: Arc::new(f) }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn call(&self, b: &Tensor, h: &Tensor, q: &Tensor, kv: &Tensor) -> Result<Tensor> {
        Ok((self.f)(b, h, q, kv)?)
    }
}

impl std::fmt::Debug for MaskMod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MaskMod({})", self.name)
    }
}

/// Five-argument score rewrite over `(score, b, h, q, kv)`.
#[derive(Clone)]
pub struct ScoreMod {
    name: &'static str,
    f: Arc<ScoreFnInner>,
}

impl ScoreMod {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Tensor, &Tensor, &Tensor, &Tensor, &Tensor) -> candle_core::Result<Tensor>
            + Send
            + Sync
            + 'static,
    {
        Self::named("score_mod", f)
    }

    pub fn named<F>(name: &'static str, f: F) -> Self
    where
        F: Fn(&Tensor, &Tensor, &Tensor, &Tensor, &Tensor) -> candle_core::Result<Tensor>
            + Send
            + Sync
            + 'static,
    {
        Self { name, f: Arc::new(f) }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn call(
        &self,
        score: &Tensor,
        b: &Tensor,
        h: &Tensor,
        q: &Tensor,
        kv: &Tensor,
    ) -> Result<Tensor> {
        Ok((self.f)(score, b, h, q, kv)?)
    }
}

impl std::fmt::Debug for ScoreMod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ScoreMod({})", self.name)
    }
}

/// Tagged union of the two predicate forms.
#[derive(Clone, Debug)]
pub enum ModFn {
    Mask(MaskMod),
    Score(ScoreMod),
}

impl ModFn {
    pub fn kind(&self) -> &'static str {
        match self {
            ModFn::Mask(_) => "mask (4-argument)",
            ModFn::Score(_) => "score (5-argument)",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ModFn::Mask(m) => m.name(),
            ModFn::Score(s) => s.name(),
        }
    }
}

impl From<MaskMod> for ModFn {
    fn from(m: MaskMod) -> Self {
        ModFn::Mask(m)
    }
}

impl From<ScoreMod> for ModFn {
    fn from(s: ScoreMod) -> Self {
        ModFn::Score(s)
    }
}

/// Predicate that allows every connection.
pub fn noop_mask() -> MaskMod {
    MaskMod::named("noop_mask", |b, _h, _q, _kv| {
        Tensor::ones((1, 1, 1, 1), DType::U8, b.device())
    })
}

/// Score predicate that leaves scores untouched.
pub fn identity_score() -> ScoreMod {
    ScoreMod::named("identity_score", |score, _b, _h, _q, _kv| Ok(score.clone()))
}

/// Union of the given mask predicates.
pub fn or_masks(mods: Vec<MaskMod>) -> MaskMod {
    MaskMod::named("or_masks", move |b, h, q, kv| {
        let mut out = Tensor::zeros((1, 1, 1, 1), DType::U8, b.device())?;
        for m in &mods {
            let part = (m.f)(b, h, q, kv)?;
            out = out.broadcast_maximum(&part)?;
        }
        Ok(out)
    })
}

/// Intersection of the given mask predicates.
pub fn and_masks(mods: Vec<MaskMod>) -> MaskMod {
    MaskMod::named("and_masks", move |b, h, q, kv| {
        let mut out = Tensor::ones((1, 1, 1, 1), DType::U8, b.device())?;
        for m in &mods {
            let part = (m.f)(b, h, q, kv)?;
            out = out.broadcast_minimum(&part)?;
        }
        Ok(out)
    })
}

/// Index tensors pre-shaped so that candle broadcasting closes the nested
/// per-axis mapping: each axis owns one non-unit dimension.
pub fn index_grid(
    b: usize,
    h: usize,
    q_len: usize,
    kv_len: usize,
    device: &Device,
) -> Result<(Tensor, Tensor, Tensor, Tensor)> {
    let bs = Tensor::arange(0i64, b as i64, device)?.reshape((b, 1, 1, 1))?;
    let hs = Tensor::arange(0i64, h as i64, device)?.reshape((1, h, 1, 1))?;
    let qs = Tensor::arange(0i64, q_len as i64, device)?.reshape((1, 1, q_len, 1))?;
    let kvs = Tensor::arange(0i64, kv_len as i64, device)?.reshape((1, 1, 1, kv_len))?;
    Ok((bs, hs, qs, kvs))
}

/// Materialize the dense `u8` mask of shape `[B, H, Q_LEN, KV_LEN]` for
/// either predicate form. Score predicates contribute `0` exactly where they
/// produce `-inf` and `1` elsewhere.
pub fn create_mask(
    mod_fn: &ModFn,
    b: usize,
    h: usize,
    q_len: usize,
    kv_len: usize,
    device: &Device,
) -> Result<Tensor> {
    if b == 0 || h == 0 || q_len == 0 || kv_len == 0 {
        return Err(MaskError::InvalidShape(format!(
            "create_mask requires nonzero dimensions, got B={} H={} Q_LEN={} KV_LEN={}",
            b, h, q_len, kv_len
        )));
    }
    let (bs, hs, qs, kvs) = index_grid(b, h, q_len, kv_len, device)?;
    let full = Shape::from_dims(&[b, h, q_len, kv_len]);
    match mod_fn {
        ModFn::Mask(m) => {
            let out = m.call(&bs, &hs, &qs, &kvs)?;
            let out = if out.dtype() == DType::U8 {
                out
            } else {
                out.to_dtype(DType::U8)?
            };
            Ok(out.broadcast_as(full)?.contiguous()?)
        }
        ModFn::Score(s) => {
            let scores = Tensor::zeros(full.clone(), DType::F32, device)?;
            let out = s.call(&scores, &bs, &hs, &qs, &kvs)?;
            let out = out.broadcast_as(full)?.to_dtype(DType::F32)?;
            Ok(out.ne(f32::NEG_INFINITY)?.contiguous()?)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn causal() -> MaskMod {
        MaskMod::named("causal", |_b, _h, q, kv| q.broadcast_ge(kv))
    }

    #[test]
    fn causal_mask_matches_reference() -> candle_core::Result<()> {
        let device = Device::Cpu;
        let mask = create_mask(&causal().into(), 1, 1, 3, 3, &device).unwrap();
        assert_eq!(mask.dims(), &[1, 1, 3, 3]);
        let values = mask.flatten_all()?.to_vec1::<u8>()?;
        assert_eq!(values, vec![1, 0, 0, 1, 1, 0, 1, 1, 1]);
        Ok(())
    }

    #[test]
    fn noop_mask_allows_everything() -> candle_core::Result<()> {
        let device = Device::Cpu;
        let mask = create_mask(&noop_mask().into(), 2, 2, 2, 2, &device).unwrap();
        let values = mask.flatten_all()?.to_vec1::<u8>()?;
        assert!(values.iter().all(|&v| v == 1));
        Ok(())
    }

    #[test]
    fn score_form_masks_neg_infinity() -> candle_core::Result<()> {
        let device = Device::Cpu;
        let score = ScoreMod::named("causal_bias", |score, _b, _h, q, kv| {
            let allowed = q.broadcast_ge(kv)?.broadcast_as(score.shape())?;
            let neg = Tensor::full(f32::NEG_INFINITY, score.shape(), score.device())?;
            allowed.where_cond(score, &neg)
        });
        let mask = create_mask(&score.into(), 1, 1, 2, 2, &device).unwrap();
        let values = mask.flatten_all()?.to_vec1::<u8>()?;
        assert_eq!(values, vec![1, 0, 1, 1]);
        Ok(())
    }

    #[test]
    fn combinators_compose() -> candle_core::Result<()> {
        let device = Device::Cpu;
        let window = MaskMod::named("window", |_b, _h, q, kv| {
            let diff = q.broadcast_sub(kv)?;
            let lower = diff.ge(0i64)?;
            let upper = diff.le(1i64)?;
            lower.broadcast_minimum(&upper)
        });
        let anded = and_masks(vec![causal(), window]);
        let mask = create_mask(&anded.into(), 1, 1, 4, 4, &device).unwrap();
        let values = mask.flatten_all()?.to_vec1::<u8>()?;
        #[rustfmt::skip]
        assert_eq!(values, vec![
            1, 0, 0, 0,
            1, 1, 0, 0,
            0, 1, 1, 0,
            0, 0, 1, 1,
        ]);
        Ok(())
    }

    #[test]
    fn or_masks_unions_coverage() -> candle_core::Result<()> {
        let device = Device::Cpu;
        let diagonal = MaskMod::named("diagonal", |_b, _h, q, kv| q.broadcast_eq(kv));
        let first_col = MaskMod::named("first_col", |_b, _h, _q, kv| {
            kv.broadcast_lt(&kv.ones_like()?)
        });
        let ored = or_masks(vec![diagonal, first_col]);
        let mask = create_mask(&ored.into(), 1, 1, 3, 3, &device).unwrap();
        let values = mask.flatten_all()?.to_vec1::<u8>()?;
        assert_eq!(values, vec![1, 0, 0, 1, 1, 0, 1, 0, 1]);
        Ok(())
    }

    #[test]
    fn closed_over_tensors_broadcast_unchanged() -> candle_core::Result<()> {
        let device = Device::Cpu;
        // Per-batch document boundary captured by the closure.
        let boundary = Tensor::from_vec(vec![1i64, 3], (2, 1, 1, 1), &device)?;
        let doc = MaskMod::named("doc_mask", move |_b, _h, _q, kv| {
            kv.broadcast_lt(&boundary)
        });
        let mask = create_mask(&doc.into(), 2, 1, 1, 4, &device).unwrap();
        let values = mask.flatten_all()?.to_vec1::<u8>()?;
        assert_eq!(values, vec![1, 0, 0, 0, 1, 1, 1, 0]);
        Ok(())
    }

    #[test]
    fn zero_dims_are_rejected() {
        let device = Device::Cpu;
        let err = create_mask(&noop_mask().into(), 0, 1, 4, 4, &device).unwrap_err();
        assert!(err.to_string().contains("nonzero"));
    }
}
