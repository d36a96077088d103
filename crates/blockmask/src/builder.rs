//! Construction of a [`BlockMask`] from a mask predicate.
//!
//! The element-level mask is materialized once over the padded
//! `[B, H, Q_LEN, KV_LEN]` grid, folded into per-block populations, and each
//! block is classified as empty, partial, or full. Partial and full blocks
//! are encoded separately so kernels can skip predicate re-evaluation on
//! blocks known to be fully visible.

use candle_core::{DType, Device, Shape, Tensor};
use serde::{Deserialize, Serialize};

use crate::block_mask::{BlockMask, BlockSize};
use crate::codec;
use crate::error::{MaskError, Result};
use crate::predicate::{create_mask, ModFn};

/// Knobs for [`create_block_mask`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BlockMaskOptions {
    pub block_size: BlockSize,
    /// Splitting fully-visible blocks out of the partial set is an
    /// optimization; disable to fold everything into the partial pair.
    pub separate_full_blocks: bool,
}

impl Default for BlockMaskOptions {
    fn default() -> Self {
        Self {
            block_size: BlockSize::default(),
            separate_full_blocks: true,
        }
    }
}

impl From<BlockSize> for BlockMaskOptions {
    fn from(block_size: BlockSize) -> Self {
        Self {
            block_size,
            ..Self::default()
        }
    }
}

fn round_up(x: usize, multiple: usize) -> usize {
    (x + multiple - 1) / multiple * multiple
}

/// Compile a mask predicate into a [`BlockMask`].
///
/// Sequence lengths are padded up to a whole number of tiles; a sequence
/// shorter than one tile uses its own length as the tile extent on that axis
/// so nothing is wasted on padding. Score predicates are not accepted here,
/// only [`create_mask`] evaluates those.
pub fn create_block_mask(
    mod_fn: &ModFn,
    b: usize,
    h: usize,
    q_len: usize,
    kv_len: usize,
    device: &Device,
    options: BlockMaskOptions,
) -> Result<BlockMask> {
    let mask_mod = match mod_fn {
        ModFn::Mask(m) => m,
        ModFn::Score(_) => {
            return Err(MaskError::InvalidPredicate(format!(
                "create_block_mask requires a mask (4-argument) predicate, got a {} predicate; \
                 score predicates only drive create_mask",
                mod_fn.kind()
            )))
        }
    };
    if q_len == 0 || kv_len == 0 {
        return Err(MaskError::InvalidShape(format!(
            "create_block_mask requires nonzero sequence lengths, got Q_LEN={} KV_LEN={}",
            q_len, kv_len
        )));
    }

    let q_block = if q_len < options.block_size.q {
        q_len
    } else {
        options.block_size.q
    };
    let kv_block = if kv_len < options.block_size.kv {
        kv_len
    } else {
        options.block_size.kv
    };
    let q_pad = round_up(q_len, q_block);
    let kv_pad = round_up(kv_len, kv_block);
    let q_tiles = q_pad / q_block;
    let kv_tiles = kv_pad / kv_block;

    let dense = create_mask(mod_fn, b, h, q_pad, kv_pad, device)?;

    // [B, H, Qn, Qb, KVn, KVb] -> [B, H, Qn, KVn, Qb, KVb], then count the
    // visible elements inside each tile.
    let blocked = dense
        .reshape(Shape::from_dims(&[b, h, q_tiles, q_block, kv_tiles, kv_block]))?
        .permute(vec![0usize, 1, 2, 4, 3, 5])?
        .contiguous()?;
    let sums = blocked.to_dtype(DType::F32)?.sum(5)?.sum(4)?;

    let full_population = (q_block * kv_block) as f32;
    let zero = sums.zeros_like()?;
    let full = Tensor::full(full_population, sums.shape(), device)?;
    let nonzero = sums.gt(&zero)?;
    let is_full = sums.eq(&full)?;

    let mask = if options.separate_full_blocks {
        let below_full = sums.lt(&full)?;
        let partial = nonzero.mul(&below_full)?;
        let (partial_counts, partial_indices) = codec::dense_to_ordered(&partial)?;
        let (full_counts, full_indices) = codec::dense_to_ordered(&is_full)?;
        BlockMask::from_kv_blocks(
            partial_counts,
            partial_indices,
            Some(full_counts),
            Some(full_indices),
            BlockSize::new(q_block, kv_block),
            Some(mask_mod.clone()),
        )?
    } else {
        let (counts, indices) = codec::dense_to_ordered(&nonzero)?;
        BlockMask::from_kv_blocks(
            counts,
            indices,
            None,
            None,
            BlockSize::new(q_block, kv_block),
            Some(mask_mod.clone()),
        )?
    };

    log::info!(
        "block mask built: predicate={} shape={:?} block_size={}x{} sparsity={:.2}%",
        mask_mod.name(),
        mask.shape(),
        q_block,
        kv_block,
        mask.sparsity().unwrap_or(f64::NAN)
    );
    Ok(mask)
}

/// Expand a block grid back to element granularity and crop the padding.
///
/// The inverse direction of the tiling performed by [`create_block_mask`];
/// used by the reference attention path and by consistency tests.
pub fn block_grid_to_element_mask(
    grid: &Tensor,
    block_size: BlockSize,
    q_len: usize,
    kv_len: usize,
) -> Result<Tensor> {
    let dims = grid.dims().to_vec();
    if dims.len() != 4 {
        return Err(MaskError::InvalidShape(format!(
            "expected a [B, H, Q_TILES, KV_TILES] block grid, got {:?}",
            dims
        )));
    }
    let (b, h, q_tiles, kv_tiles) = (dims[0], dims[1], dims[2], dims[3]);
    if q_tiles * block_size.q < q_len || kv_tiles * block_size.kv < kv_len {
        return Err(MaskError::InvalidShape(format!(
            "block grid {:?} with block size {}x{} cannot cover [{}, {}]",
            dims, block_size.q, block_size.kv, q_len, kv_len
        )));
    }
    let expanded = grid
        .unsqueeze(3)?
        .unsqueeze(5)?
        .broadcast_as(Shape::from_dims(&[
            b,
            h,
            q_tiles,
            block_size.q,
            kv_tiles,
            block_size.kv,
        ]))?
        .contiguous()?
        .reshape(Shape::from_dims(&[
            b,
            h,
            q_tiles * block_size.q,
            kv_tiles * block_size.kv,
        ]))?;
    Ok(expanded.narrow(2, 0, q_len)?.narrow(3, 0, kv_len)?)
}
