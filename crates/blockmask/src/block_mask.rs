//! The block-sparse mask aggregate handed to attention kernels.
//!
//! A `BlockMask` keeps the ordered encoding of the block grid in both
//! directions: KV-major (`kv_*`, rows are query tiles) for the forward
//! reduction and Q-major (`q_*`, rows are key/value tiles) for the backward
//! one. Only the KV-major side is ever supplied; the Q-major side is derived
//! through [`codec::transpose_ordered`] so the two views cannot drift apart.
//! The optional `full_*` pairs single out blocks with every element visible,
//! which kernels may process without consulting the predicate again.

use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::codec;
use crate::error::{shape_err, MaskError, Result};
use crate::predicate::MaskMod;

/// Default tile extent along both axes.
pub const DEFAULT_BLOCK_SIZE: usize = 128;

/// Tile extents: `q` rows by `kv` columns per block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSize {
    pub q: usize,
    pub kv: usize,
}

impl BlockSize {
    pub fn new(q: usize, kv: usize) -> Self {
        Self { q, kv }
    }

    pub fn square(n: usize) -> Self {
        Self { q: n, kv: n }
    }
}

impl Default for BlockSize {
    fn default() -> Self {
        Self::square(DEFAULT_BLOCK_SIZE)
    }
}

impl From<usize> for BlockSize {
    fn from(n: usize) -> Self {
        Self::square(n)
    }
}

/// Borrowed view of every tensor component, the kernel hand-off surface.
pub struct BlockMaskParts<'a> {
    pub kv_num_blocks: &'a Tensor,
    pub kv_indices: &'a Tensor,
    pub full_kv_num_blocks: Option<&'a Tensor>,
    pub full_kv_indices: Option<&'a Tensor>,
    pub q_num_blocks: &'a Tensor,
    pub q_indices: &'a Tensor,
    pub full_q_num_blocks: Option<&'a Tensor>,
    pub full_q_indices: Option<&'a Tensor>,
    pub block_size: BlockSize,
}

#[derive(Clone)]
pub struct BlockMask {
    kv_num_blocks: Tensor,
    kv_indices: Tensor,
    full_kv_num_blocks: Option<Tensor>,
    full_kv_indices: Option<Tensor>,
    q_num_blocks: Tensor,
    q_indices: Tensor,
    full_q_num_blocks: Option<Tensor>,
    full_q_indices: Option<Tensor>,
    block_size: BlockSize,
    mask_mod: Option<MaskMod>,
}

impl BlockMask {
    /// Build from the KV-major encoding; the Q-major side is derived here.
    ///
    /// `kv_indices` must have at least two dimensions (`[.., ROWS, COLS]`),
    /// and the `full_kv_*` pair must be supplied together or not at all.
    pub fn from_kv_blocks(
        kv_num_blocks: Tensor,
        kv_indices: Tensor,
        full_kv_num_blocks: Option<Tensor>,
        full_kv_indices: Option<Tensor>,
        block_size: BlockSize,
        mask_mod: Option<MaskMod>,
    ) -> Result<Self> {
        if kv_indices.rank() < 2 {
            return Err(shape_err(format!(
                "BlockMask needs kv_indices of at least 2 dimensions, got {:?}",
                kv_indices.dims()
            )));
        }
        if kv_num_blocks.dims() != &kv_indices.dims()[..kv_indices.rank() - 1] {
            return Err(shape_err(format!(
                "kv_num_blocks shape {:?} does not match kv_indices shape {:?}",
                kv_num_blocks.dims(),
                kv_indices.dims()
            )));
        }
        if full_kv_num_blocks.is_some() != full_kv_indices.is_some() {
            return Err(shape_err(
                "full_kv_num_blocks and full_kv_indices must be both provided or omitted"
                    .to_string(),
            ));
        }
        if block_size.q == 0 || block_size.kv == 0 {
            return Err(shape_err(format!(
                "block size must be nonzero, got {}x{}",
                block_size.q, block_size.kv
            )));
        }

        let (q_num_blocks, q_indices) = codec::transpose_ordered(&kv_num_blocks, &kv_indices)?;
        let (full_q_num_blocks, full_q_indices) =
            match (&full_kv_num_blocks, &full_kv_indices) {
                (Some(counts), Some(indices)) => {
                    let (c, i) = codec::transpose_ordered(counts, indices)?;
                    (Some(c), Some(i))
                }
                _ => (None, None),
            };

        log::debug!(
            "block mask assembled: grid={:?} block_size={}x{} full_blocks={}",
            kv_indices.dims(),
            block_size.q,
            block_size.kv,
            full_kv_num_blocks.is_some()
        );

        Ok(Self {
            kv_num_blocks,
            kv_indices,
            full_kv_num_blocks,
            full_kv_indices,
            q_num_blocks,
            q_indices,
            full_q_num_blocks,
            full_q_indices,
            block_size,
            mask_mod,
        })
    }

    /// The mask used when a caller supplies none: one oversized block
    /// covering the whole `[q_len, kv_len]` grid for a single batch/head.
    pub fn default_full(q_len: usize, kv_len: usize, device: &Device) -> Result<Self> {
        let kv_num_blocks = Tensor::ones((1, 1, 1), DType::U32, device)?;
        let kv_indices = Tensor::zeros((1, 1, 1, 1), DType::U32, device)?;
        Self::from_kv_blocks(
            kv_num_blocks,
            kv_indices,
            None,
            None,
            BlockSize::new(q_len.max(1), kv_len.max(1)),
            None,
        )
    }

    pub fn block_size(&self) -> BlockSize {
        self.block_size
    }

    pub fn mask_mod(&self) -> Option<&MaskMod> {
        self.mask_mod.as_ref()
    }

    pub fn parts(&self) -> BlockMaskParts<'_> {
        BlockMaskParts {
            kv_num_blocks: &self.kv_num_blocks,
            kv_indices: &self.kv_indices,
            full_kv_num_blocks: self.full_kv_num_blocks.as_ref(),
            full_kv_indices: self.full_kv_indices.as_ref(),
            q_num_blocks: &self.q_num_blocks,
            q_indices: &self.q_indices,
            full_q_num_blocks: self.full_q_num_blocks.as_ref(),
            full_q_indices: self.full_q_indices.as_ref(),
            block_size: self.block_size,
        }
    }

    /// Logical shape `[.., Q_LEN, KV_LEN]` in elements, padding included.
    pub fn shape(&self) -> Vec<usize> {
        let dims = self.kv_indices.dims();
        let mut shape = dims[..dims.len() - 2].to_vec();
        shape.push(dims[dims.len() - 2] * self.block_size.q);
        shape.push(dims[dims.len() - 1] * self.block_size.kv);
        shape
    }

    /// Element count of the logical mask, sparsity not accounted for.
    pub fn numel(&self) -> usize {
        self.shape().iter().product()
    }

    /// Percentage of the grid that is never computed. Every counted block is
    /// charged its full tile area, so a partial block counts as computed.
    pub fn sparsity(&self) -> Result<f64> {
        let mut computed = self
            .kv_num_blocks
            .to_dtype(DType::F32)?
            .sum_all()?
            .to_scalar::<f32>()? as f64;
        if let Some(full) = &self.full_kv_num_blocks {
            computed += full.to_dtype(DType::F32)?.sum_all()?.to_scalar::<f32>()? as f64;
        }
        let computed_size = computed * (self.block_size.q * self.block_size.kv) as f64;
        let dense_ratio = computed_size / self.numel() as f64;
        Ok(100.0 * (1.0 - dense_ratio))
    }

    /// Reconstruct the dense block grid (partial and full blocks combined).
    pub fn to_dense(&self) -> Result<Tensor> {
        let partial = codec::ordered_to_dense(&self.kv_num_blocks, &self.kv_indices)?;
        match (&self.full_kv_num_blocks, &self.full_kv_indices) {
            (Some(counts), Some(indices)) => {
                let full = codec::ordered_to_dense(counts, indices)?;
                Ok(partial.maximum(&full)?)
            }
            _ => Ok(partial),
        }
    }

    /// Move every component to `device`, returning a new mask.
    pub fn to_device(&self, device: &Device) -> Result<Self> {
        let move_opt = |t: &Option<Tensor>| -> Result<Option<Tensor>> {
            Ok(match t {
                Some(t) => Some(t.to_device(device)?),
                None => None,
            })
        };
        Ok(Self {
            kv_num_blocks: self.kv_num_blocks.to_device(device)?,
            kv_indices: self.kv_indices.to_device(device)?,
            full_kv_num_blocks: move_opt(&self.full_kv_num_blocks)?,
            full_kv_indices: move_opt(&self.full_kv_indices)?,
            q_num_blocks: self.q_num_blocks.to_device(device)?,
            q_indices: self.q_indices.to_device(device)?,
            full_q_num_blocks: move_opt(&self.full_q_num_blocks)?,
            full_q_indices: move_opt(&self.full_q_indices)?,
            block_size: self.block_size,
            mask_mod: self.mask_mod.clone(),
        })
    }

    /// Configuration check that every component lives on `device`.
    pub fn validate_device(&self, device: &Device) -> Result<()> {
        let check = |name: &str, t: &Tensor| -> Result<()> {
            if !device.same_device(t.device()) {
                return Err(MaskError::DeviceMismatch(format!(
                    "block mask component {} is on {:?}, expected {:?}",
                    name,
                    t.device().location(),
                    device.location()
                )));
            }
            Ok(())
        };
        check("kv_num_blocks", &self.kv_num_blocks)?;
        check("kv_indices", &self.kv_indices)?;
        check("q_num_blocks", &self.q_num_blocks)?;
        check("q_indices", &self.q_indices)?;
        if let Some(t) = &self.full_kv_num_blocks {
            check("full_kv_num_blocks", t)?;
        }
        if let Some(t) = &self.full_kv_indices {
            check("full_kv_indices", t)?;
        }
        if let Some(t) = &self.full_q_num_blocks {
            check("full_q_num_blocks", t)?;
        }
        if let Some(t) = &self.full_q_indices {
            check("full_q_indices", t)?;
        }
        Ok(())
    }

    /// Slice `len` entries starting at `start` along a leading batch/head
    /// axis or the query-tile axis.
    ///
    /// The sliced KV-major pair is re-encoded through the dense round trip to
    /// rebuild the Q-major side; the stored Q-major tensors are never sliced
    /// directly, because fixing a subset of query tiles changes which key
    /// tiles each of them can see. The key/value-tile axis cannot be sliced
    /// this way: `kv_indices` stores column positions as values, not by
    /// position.
    pub fn narrow(&self, dim: usize, start: usize, len: usize) -> Result<Self> {
        let rank = self.kv_indices.rank();
        if dim >= rank - 1 {
            return Err(shape_err(format!(
                "cannot narrow the key/value tile axis (dim {}) of a block mask with {} dimensions; \
                 slice batch/head axes or the query-tile axis instead",
                dim, rank
            )));
        }
        let narrow_opt = |t: &Option<Tensor>| -> Result<Option<Tensor>> {
            Ok(match t {
                Some(t) => Some(t.narrow(dim, start, len)?),
                None => None,
            })
        };
        Self::from_kv_blocks(
            self.kv_num_blocks.narrow(dim, start, len)?,
            self.kv_indices.narrow(dim, start, len)?,
            narrow_opt(&self.full_kv_num_blocks)?,
            narrow_opt(&self.full_kv_indices)?,
            self.block_size,
            self.mask_mod.clone(),
        )
    }

    /// Select single entries along leading batch/head axes, dropping those
    /// axes. At least the two tile axes must remain.
    pub fn index(&self, coords: &[usize]) -> Result<Self> {
        let rank = self.kv_indices.rank();
        if coords.len() > rank - 2 {
            return Err(shape_err(format!(
                "cannot index {} leading axes of a block mask with {} dimensions",
                coords.len(),
                rank
            )));
        }
        let select = |t: &Tensor| -> Result<Tensor> {
            let mut out = t.clone();
            for &c in coords {
                out = out.get(c)?;
            }
            Ok(out)
        };
        let select_opt = |t: &Option<Tensor>| -> Result<Option<Tensor>> {
            Ok(match t {
                Some(t) => Some(select(t)?),
                None => None,
            })
        };
        Self::from_kv_blocks(
            select(&self.kv_num_blocks)?,
            select(&self.kv_indices)?,
            select_opt(&self.full_kv_num_blocks)?,
            select_opt(&self.full_kv_indices)?,
            self.block_size,
            self.mask_mod.clone(),
        )
    }

    /// Text rendering of the block grid, sampled down to at most
    /// `max_rows x max_cols` cells and at most `limit` batch/head entries.
    /// Full sections print as `█`, empty as a space, mixed as `░`.
    pub fn to_string_grid(&self, max_rows: usize, max_cols: usize, limit: usize) -> Result<String> {
        let dense = self.to_dense()?;
        let dims = dense.dims().to_vec();
        let rows = dims[dims.len() - 2];
        let cols = dims[dims.len() - 1];
        let batch_dims = &dims[..dims.len() - 2];
        let batch: usize = batch_dims.iter().product();
        let flat = dense.flatten_all()?.to_vec1::<u8>()?;

        let cdiv = |a: usize, b: usize| (a + b - 1) / b;
        let row_step = cdiv(rows, max_rows.max(1)).max(1);
        let col_step = cdiv(cols, max_cols.max(1)).max(1);

        let mut out = Vec::new();
        for entry in 0..batch {
            if entry == limit {
                out.push("...".to_string());
                out.push(format!(
                    "to print more entries, raise the limit ({} total)",
                    batch
                ));
                break;
            }
            let mut coords = Vec::with_capacity(batch_dims.len());
            let mut rem = entry;
            for &d in batch_dims.iter().rev() {
                coords.push(rem % d);
                rem /= d;
            }
            coords.reverse();
            let mut vis = format!("{:?}\n", coords);
            let base = entry * rows * cols;
            let mut r = 0;
            while r < rows {
                let mut c = 0;
                while c < cols {
                    let mut sum = 0usize;
                    let mut n = 0usize;
                    for rr in r..(r + row_step).min(rows) {
                        for cc in c..(c + col_step).min(cols) {
                            sum += flat[base + rr * cols + cc] as usize;
                            n += 1;
                        }
                    }
                    let ch = if sum == n {
                        '█'
                    } else if sum == 0 {
                        ' '
                    } else {
                        '░'
                    };
                    vis.push(ch);
                    vis.push(ch);
                    c += col_step;
                }
                vis.push('\n');
                r += row_step;
            }
            out.push(vis);
        }
        Ok(out.join("\n"))
    }
}

impl std::fmt::Display for BlockMask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sparsity = self.sparsity().unwrap_or(f64::NAN);
        writeln!(
            f,
            "BlockMask(shape={:?}, sparsity={:.2}%,",
            self.shape(),
            sparsity
        )?;
        match self.to_string_grid(20, 20, 4) {
            Ok(grid) => write!(f, "{}", grid.trim_end())?,
            Err(_) => write!(f, "<grid unavailable>")?,
        }
        write!(f, "\n)")
    }
}

impl std::fmt::Debug for BlockMask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shape_or_none = |t: &Option<Tensor>| match t {
            Some(t) => format!("{:?}", t.dims()),
            None => "None".to_string(),
        };
        f.debug_struct("BlockMask")
            .field("kv_num_blocks", &self.kv_num_blocks.dims())
            .field("kv_indices", &self.kv_indices.dims())
            .field("full_kv_num_blocks", &shape_or_none(&self.full_kv_num_blocks))
            .field("full_kv_indices", &shape_or_none(&self.full_kv_indices))
            .field("q_num_blocks", &self.q_num_blocks.dims())
            .field("q_indices", &self.q_indices.dims())
            .field("full_q_num_blocks", &shape_or_none(&self.full_q_num_blocks))
            .field("full_q_indices", &shape_or_none(&self.full_q_indices))
            .field("block_size", &self.block_size)
            .field(
                "mask_mod",
                &self.mask_mod.as_ref().map(|m| m.name()).unwrap_or("None"),
            )
            .finish()
    }
}
