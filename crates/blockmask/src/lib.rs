//! Block-sparse attention mask construction.
//!
//! The crate compiles a per-element masking predicate into a [`BlockMask`]:
//! a compact, tile-granular description of which regions of the
//! `(query, key)` grid an attention kernel must compute. Construction runs
//! in three stages: the predicate is evaluated over broadcast index grids
//! ([`predicate`]), the dense result is folded into per-tile populations and
//! classified ([`builder`]), and each tile class is stored in the ordered
//! counts-plus-indices encoding ([`codec`]). A reference eager attention
//! path ([`reference`]) consumes the mask in place of a tiled kernel.
//!
//! All tensor work goes through candle; masks are `u8`, ordered encodings
//! are `u32`, and predicate index grids are `i64`.

pub mod block_mask;
pub mod builder;
pub mod codec;
pub mod error;
pub mod predicate;
pub mod reference;

pub use block_mask::{BlockMask, BlockMaskParts, BlockSize, DEFAULT_BLOCK_SIZE};
pub use builder::{block_grid_to_element_mask, create_block_mask, BlockMaskOptions};
pub use codec::{dense_to_ordered, ordered_to_dense, transpose_ordered};
pub use error::{MaskError, Result};
pub use predicate::{
    and_masks, create_mask, identity_score, index_grid, noop_mask, or_masks, MaskMod, ModFn,
    ScoreMod,
};
pub use reference::block_sparse_attention;
