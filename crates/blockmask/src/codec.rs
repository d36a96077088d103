//! Conversion between dense boolean grids and the ordered block-sparse
//! encoding.
//!
//! The ordered encoding of a `[.., ROWS, COLS]` boolean grid is a pair of
//! `u32` tensors: `counts` of shape `[.., ROWS]` holding the number of set
//! columns per row, and `indices` of shape `[.., ROWS, COLS]` whose first
//! `counts[row]` entries are the set column positions in ascending order.
//! Entries past the count are unspecified and must never be interpreted.

use candle_core::{DType, Shape, Tensor};

use crate::error::{shape_err, Result};

/// Encode a dense boolean (`u8`) grid into its ordered representation.
///
/// Per row this is a stable sort of column indices on "is set", descending:
/// set columns come first, each class keeping its original relative order.
/// Stability is a contract, not an accident; consumers assume the valid
/// prefix of `indices[row]` is ascending.
pub fn dense_to_ordered(dense: &Tensor) -> Result<(Tensor, Tensor)> {
    let dims = dense.dims().to_vec();
    if dims.len() < 2 {
        return Err(shape_err(format!(
            "dense_to_ordered expects at least 2 dimensions, got {:?}",
            dims
        )));
    }
    let rows = dims[dims.len() - 2];
    let cols = dims[dims.len() - 1];
    let batch: usize = dims[..dims.len() - 2].iter().product();
    let device = dense.device();

    let flat = dense
        .to_dtype(DType::U8)?
        .flatten_all()?
        .to_vec1::<u8>()?;

    let mut counts = Vec::with_capacity(batch * rows);
    let mut indices = Vec::with_capacity(batch * rows * cols);
    for row in 0..batch * rows {
        let base = row * cols;
        let mut set = 0u32;
        for col in 0..cols {
            if flat[base + col] != 0 {
                indices.push(col as u32);
                set += 1;
            }
        }
        for col in 0..cols {
            if flat[base + col] == 0 {
                indices.push(col as u32);
            }
        }
        counts.push(set);
    }

    let counts_shape = Shape::from_dims(&dims[..dims.len() - 1]);
    let counts = Tensor::from_vec(counts, counts_shape, device)?;
    let indices = Tensor::from_vec(indices, Shape::from_dims(&dims), device)?;
    Ok((counts, indices))
}

/// Reconstruct the dense boolean grid from an ordered pair.
///
/// Writes go into a scratch row one column wider than the grid; every slot
/// past `counts[row]` is redirected to the sentinel column `COLS`, which is
/// then discarded. Garbage index values therefore cannot corrupt a real
/// column no matter what they contain.
pub fn ordered_to_dense(counts: &Tensor, indices: &Tensor) -> Result<Tensor> {
    let idx_dims = indices.dims().to_vec();
    if idx_dims.len() < 2 {
        return Err(shape_err(format!(
            "ordered_to_dense expects indices of at least 2 dimensions, got {:?}",
            idx_dims
        )));
    }
    let expected_counts = &idx_dims[..idx_dims.len() - 1];
    if counts.dims() != expected_counts {
        return Err(shape_err(format!(
            "counts shape {:?} does not match indices shape {:?}",
            counts.dims(),
            idx_dims
        )));
    }
    let rows = idx_dims[idx_dims.len() - 2];
    let cols = idx_dims[idx_dims.len() - 1];
    let batch: usize = idx_dims[..idx_dims.len() - 2].iter().product();
    let device = counts.device();

    let counts_flat = counts.to_dtype(DType::U32)?.flatten_all()?.to_vec1::<u32>()?;
    let indices_flat = indices.to_dtype(DType::U32)?.flatten_all()?.to_vec1::<u32>()?;

    let mut dense = Vec::with_capacity(batch * rows * cols);
    let mut scratch = vec![0u8; cols + 1];
    for row in 0..batch * rows {
        scratch.iter_mut().for_each(|v| *v = 0);
        let count = counts_flat[row] as usize;
        if count > cols {
            return Err(shape_err(format!(
                "row {} claims {} set columns but the grid only has {}",
                row, count, cols
            )));
        }
        let base = row * cols;
        for slot in 0..cols {
            let target = if slot < count {
                let col = indices_flat[base + slot] as usize;
                if col >= cols {
                    return Err(shape_err(format!(
                        "row {} slot {} holds column index {} out of range {}",
                        row, slot, col, cols
                    )));
                }
                col
            } else {
                cols
            };
            scratch[target] = 1;
        }
        dense.extend_from_slice(&scratch[..cols]);
    }

    Ok(Tensor::from_vec(dense, Shape::from_dims(&idx_dims), device)?)
}

/// Derive the transposed ordered pair (column-tiles become rows).
///
/// The round trip through the dense form is the only sanctioned derivation:
/// correctness follows from [`ordered_to_dense`] and [`dense_to_ordered`]
/// individually, with no sparse transpose to get wrong.
pub fn transpose_ordered(counts: &Tensor, indices: &Tensor) -> Result<(Tensor, Tensor)> {
    let dense = ordered_to_dense(counts, indices)?;
    let rank = dense.rank();
    let transposed = dense.transpose(rank - 2, rank - 1)?.contiguous()?;
    dense_to_ordered(&transposed)
}
