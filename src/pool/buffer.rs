//! Per-layer KV cache buffers.
//!
//! One flat array per layer, shaped `[rows, 2 * num_kv_heads, head_dim]`.
//! Key head `h` of a row sits at `[row, h, :]`, value head `h` at
//! `[row, num_kv_heads + h, :]`. Buffers are sized once and never resized.

use super::PoolError;
use crate::config::Dtype;
use half::{bf16, f16};

/// Element type a KV cache can be stored in.
pub trait KvElement: Copy + Default + Send + Sync + 'static {
    const DTYPE: Dtype;

    fn to_f32(self) -> f32;
    fn from_f32(v: f32) -> Self;
}

impl KvElement for f32 {
    const DTYPE: Dtype = Dtype::F32;

    fn to_f32(self) -> f32 {
        self
    }

    fn from_f32(v: f32) -> Self {
        v
    }
}

impl KvElement for f16 {
    const DTYPE: Dtype = Dtype::F16;

    fn to_f32(self) -> f32 {
        f16::to_f32(self)
    }

    fn from_f32(v: f32) -> Self {
        f16::from_f32(v)
    }
}

impl KvElement for bf16 {
    const DTYPE: Dtype = Dtype::BF16;

    fn to_f32(self) -> f32 {
        bf16::to_f32(self)
    }

    fn from_f32(v: f32) -> Self {
        bf16::from_f32(v)
    }
}

/// The KV cache of a single transformer layer.
#[derive(Debug, Clone)]
pub struct LayerBuffer<T> {
    data: Vec<T>,
    rows: usize,
    num_kv_heads: usize,
    head_dim: usize,
}

impl<T: KvElement> LayerBuffer<T> {
    /// Zero-filled buffer of `rows` token rows.
    pub fn zeros(rows: usize, num_kv_heads: usize, head_dim: usize) -> Self {
        Self {
            data: vec![T::default(); rows * 2 * num_kv_heads * head_dim],
            rows,
            num_kv_heads,
            head_dim,
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn num_kv_heads(&self) -> usize {
        self.num_kv_heads
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    /// Elements per token row.
    pub fn row_elems(&self) -> usize {
        2 * self.num_kv_heads * self.head_dim
    }

    /// Raw storage, row-major.
    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    fn offset(&self, row: usize, head: usize) -> usize {
        (row * 2 * self.num_kv_heads + head) * self.head_dim
    }

    /// Key vector of `kv_head` at `row`. Panics if either is out of range.
    pub fn key(&self, row: usize, kv_head: usize) -> &[T] {
        debug_assert!(kv_head < self.num_kv_heads);
        let off = self.offset(row, kv_head);
        &self.data[off..off + self.head_dim]
    }

    /// Value vector of `kv_head` at `row`. Panics if either is out of range.
    pub fn value(&self, row: usize, kv_head: usize) -> &[T] {
        debug_assert!(kv_head < self.num_kv_heads);
        let off = self.offset(row, self.num_kv_heads + kv_head);
        &self.data[off..off + self.head_dim]
    }

    /// Store one token's keys and values, each `[num_kv_heads, head_dim]`.
    pub fn write_row(&mut self, row: usize, keys: &[f32], values: &[f32]) -> Result<(), PoolError> {
        if row >= self.rows {
            return Err(PoolError::InvalidRow {
                row,
                rows: self.rows,
            });
        }
        let head_elems = self.num_kv_heads * self.head_dim;
        if keys.len() != head_elems || values.len() != head_elems {
            return Err(PoolError::ShapeMismatch(format!(
                "row write expects {head_elems} keys and values, got {} and {}",
                keys.len(),
                values.len()
            )));
        }
        let start = row * self.row_elems();
        let (k_dst, v_dst) = self.data[start..start + 2 * head_elems].split_at_mut(head_elems);
        for (dst, &src) in k_dst.iter_mut().zip(keys) {
            *dst = T::from_f32(src);
        }
        for (dst, &src) in v_dst.iter_mut().zip(values) {
            *dst = T::from_f32(src);
        }
        Ok(())
    }

    /// Copy `count` whole rows starting at `src` to rows starting at `dst`.
    pub fn copy_rows(&mut self, src: usize, dst: usize, count: usize) -> Result<(), PoolError> {
        for row in [src + count, dst + count] {
            if row > self.rows {
                return Err(PoolError::InvalidRow {
                    row: row - 1,
                    rows: self.rows,
                });
            }
        }
        let elems = self.row_elems();
        self.data
            .copy_within(src * elems..(src + count) * elems, dst * elems);
        Ok(())
    }
}
