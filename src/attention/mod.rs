//! Partitioned decode attention ("flash decoding").
//!
//! Decode-time attention has one query per sequence and head but a KV history
//! that can be very long. The work is split in two stages:
//!
//! 1. **Map**: every `(batch, head, partition)` unit scans a fixed window of
//!    the sequence in 16-token chunks with an online softmax and emits a
//!    normalized partial output plus its log-sum-exp.
//! 2. **Reduce**: every `(batch, head)` folds its partials in partition order
//!    with the same online-softmax merge.
//!
//! The result equals single-pass softmax attention over the whole sequence.
//! Units within a stage are independent; stage 2 starts only after stage 1
//! has finished for the whole call. Dispatch is delegated to a
//! [`KernelProvider`].

pub mod kernels;

use crate::config::{ConfigError, CHUNK_SIZE};
use crate::planner::CacheGeometry;
use crate::pool::buffer::{KvElement, LayerBuffer};
use crate::pool::{PoolError, SlotPool};
use kernels::KernelProvider;
use thiserror::Error;

/// Errors from the decode-attention reducer.
#[derive(Debug, Error)]
pub enum AttentionError {
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("{num_q_heads} query heads cannot be grouped over {num_kv_heads} KV heads")]
    InvalidHeadGroup {
        num_q_heads: usize,
        num_kv_heads: usize,
    },

    #[error("sequence {batch} reads row {row} but the cache has {rows} rows")]
    RowOutOfRange { batch: usize, row: usize, rows: usize },

    #[error("KV cache error: {0}")]
    Pool(#[from] PoolError),
}

/// Where one sequence's tokens live in a layer buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvSpan {
    /// Tokens occupy rows `start_row..start_row + len`.
    Contiguous { start_row: usize, len: usize },
    /// Token `i` occupies row `rows[i]`.
    Indexed(Vec<usize>),
}

impl KvSpan {
    /// Span from raw start/length values as a batch descriptor carries them.
    ///
    /// A non-positive length or a negative start yields an empty span: a
    /// sequence that contributes nothing.
    pub fn from_raw(start_loc: i64, seq_len: i64) -> Self {
        match (usize::try_from(start_loc), usize::try_from(seq_len)) {
            (Ok(start_row), Ok(len)) if len > 0 => KvSpan::Contiguous { start_row, len },
            _ => KvSpan::Contiguous {
                start_row: 0,
                len: 0,
            },
        }
    }

    pub fn len(&self) -> usize {
        match self {
            KvSpan::Contiguous { len, .. } => *len,
            KvSpan::Indexed(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Buffer row of token `pos`. `pos` must be below `len()`.
    pub fn row(&self, pos: usize) -> usize {
        match self {
            KvSpan::Contiguous { start_row, .. } => start_row + pos,
            KvSpan::Indexed(rows) => rows[pos],
        }
    }

    /// Number of partitions this span splits into.
    pub fn num_partitions(&self, partition_size: usize) -> usize {
        num_partitions(self.len(), partition_size)
    }

    /// Highest row read, or `None` for an empty span. A contiguous span
    /// running past the address space reports `usize::MAX`.
    fn max_row(&self) -> Option<usize> {
        match self {
            KvSpan::Contiguous { len: 0, .. } => None,
            KvSpan::Contiguous { start_row, len } => Some(start_row.saturating_add(len - 1)),
            KvSpan::Indexed(rows) => rows.iter().copied().max(),
        }
    }
}

/// `ceil(seq_len / partition_size)`, or zero when either is zero.
pub fn num_partitions(seq_len: usize, partition_size: usize) -> usize {
    if partition_size == 0 {
        return 0;
    }
    seq_len.div_ceil(partition_size)
}

/// Stage-1 output: per `(batch, head, partition)` a normalized partial
/// output of `head_dim` values followed by its log-sum-exp.
#[derive(Debug, Clone)]
pub struct PartialResults {
    batch: usize,
    num_heads: usize,
    num_partitions: usize,
    head_dim: usize,
    /// Valid partitions per batch item.
    seq_partitions: Vec<usize>,
    /// `[batch, heads, partitions, head_dim + 1]`
    data: Vec<f32>,
}

impl PartialResults {
    pub fn batch(&self) -> usize {
        self.batch
    }

    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    /// Partitions allocated per `(batch, head)`, the maximum over the batch.
    pub fn num_partitions(&self) -> usize {
        self.num_partitions
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    fn unit(&self, b: usize, h: usize, p: usize) -> &[f32] {
        let unit_len = self.head_dim + 1;
        let idx = (b * self.num_heads + h) * self.num_partitions + p;
        &self.data[idx * unit_len..(idx + 1) * unit_len]
    }

    /// Partial output of one unit.
    pub fn value(&self, b: usize, h: usize, p: usize) -> &[f32] {
        &self.unit(b, h, p)[..self.head_dim]
    }

    /// Log-sum-exp of one unit; `-inf` when the partition holds no tokens.
    pub fn lse(&self, b: usize, h: usize, p: usize) -> f32 {
        self.unit(b, h, p)[self.head_dim]
    }
}

/// Two-stage partitioned decode attention over one layer's cache.
#[derive(Debug, Clone, Copy)]
pub struct DecodeAttention {
    partition_size: usize,
    scale: Option<f32>,
}

impl DecodeAttention {
    /// `partition_size` must be a positive multiple of [`CHUNK_SIZE`].
    pub fn new(partition_size: usize) -> Result<Self, ConfigError> {
        if partition_size == 0 || partition_size % CHUNK_SIZE != 0 {
            return Err(ConfigError::InvalidPartitionSize {
                partition_size,
                chunk_size: CHUNK_SIZE,
            });
        }
        Ok(Self {
            partition_size,
            scale: None,
        })
    }

    pub fn from_geometry(geometry: &CacheGeometry) -> Result<Self, ConfigError> {
        Self::new(geometry.partition_size)
    }

    /// Override the default `1 / sqrt(head_dim)` score scale.
    pub fn with_scale(mut self, scale: f32) -> Self {
        self.scale = Some(scale);
        self
    }

    pub fn partition_size(&self) -> usize {
        self.partition_size
    }

    pub fn scale_for(&self, head_dim: usize) -> f32 {
        self.scale
            .unwrap_or_else(|| 1.0 / (head_dim as f32).sqrt())
    }

    /// Attention output `[batch, num_q_heads, head_dim]` for queries `q`
    /// (same shape) against `spans`, one span per batch item.
    pub fn forward<T, K>(
        &self,
        kernels: &K,
        q: &[f32],
        num_q_heads: usize,
        layer: &LayerBuffer<T>,
        spans: &[KvSpan],
    ) -> Result<Vec<f32>, AttentionError>
    where
        T: KvElement,
        K: KernelProvider,
    {
        let partials = self.stage1(kernels, q, num_q_heads, layer, spans)?;
        Ok(self.stage2(kernels, &partials))
    }

    /// [`forward`](Self::forward) against layer `layer` of a slot pool.
    pub fn forward_layer<T, K>(
        &self,
        kernels: &K,
        q: &[f32],
        num_q_heads: usize,
        pool: &SlotPool<T>,
        layer: usize,
        spans: &[KvSpan],
    ) -> Result<Vec<f32>, AttentionError>
    where
        T: KvElement,
        K: KernelProvider,
    {
        let buffer = pool.layer(layer)?;
        self.forward(kernels, q, num_q_heads, buffer, spans)
    }

    /// Stage 1: partial attention for every `(batch, head, partition)`.
    pub fn stage1<T, K>(
        &self,
        kernels: &K,
        q: &[f32],
        num_q_heads: usize,
        layer: &LayerBuffer<T>,
        spans: &[KvSpan],
    ) -> Result<PartialResults, AttentionError>
    where
        T: KvElement,
        K: KernelProvider,
    {
        let group = check_inputs(q, num_q_heads, layer, spans)?;
        let head_dim = layer.head_dim();
        let partition_size = self.partition_size;
        let scale = self.scale_for(head_dim);

        let seq_partitions: Vec<usize> = spans
            .iter()
            .map(|s| s.num_partitions(partition_size))
            .collect();
        let num_parts = seq_partitions.iter().copied().max().unwrap_or(0);

        let mut data = vec![0.0; spans.len() * num_q_heads * num_parts * (head_dim + 1)];
        kernels.for_each_chunk(&mut data, head_dim + 1, |unit, out| {
            let p = unit % num_parts;
            let bh = unit / num_parts;
            let (b, h) = (bh / num_q_heads, bh % num_q_heads);
            let q_vec = &q[bh * head_dim..(bh + 1) * head_dim];
            partition_unit(
                q_vec,
                layer,
                &spans[b],
                h / group,
                p * partition_size,
                partition_size,
                scale,
                out,
            );
        });

        Ok(PartialResults {
            batch: spans.len(),
            num_heads: num_q_heads,
            num_partitions: num_parts,
            head_dim,
            seq_partitions,
            data,
        })
    }

    /// Stage 2: fold each `(batch, head)`'s partials in partition order.
    ///
    /// Sequences without tokens produce all-zero output.
    pub fn stage2<K: KernelProvider>(&self, kernels: &K, partials: &PartialResults) -> Vec<f32> {
        let num_heads = partials.num_heads;
        let head_dim = partials.head_dim;
        let mut out = vec![0.0; partials.batch * num_heads * head_dim];

        kernels.for_each_chunk(&mut out, head_dim, |unit, acc| {
            let (b, h) = (unit / num_heads, unit % num_heads);
            let mut m = f32::NEG_INFINITY;
            let mut d = 0.0f32;

            for p in 0..partials.seq_partitions[b] {
                let part_max = partials.lse(b, h, p);
                let m_new = part_max.max(m);
                let alpha = (m - m_new).exp();
                let weight = (part_max - m_new).exp();
                for (a, &v) in acc.iter_mut().zip(partials.value(b, h, p)) {
                    *a = alpha * *a + weight * v;
                }
                d = alpha * d + weight;
                m = m_new;
            }

            if d > 0.0 {
                acc.iter_mut().for_each(|a| *a /= d);
            }
        });
        out
    }
}

/// Online softmax over tokens `start..start + partition_size` of one span.
#[allow(clippy::too_many_arguments)]
fn partition_unit<T: KvElement>(
    q: &[f32],
    layer: &LayerBuffer<T>,
    span: &KvSpan,
    kv_head: usize,
    start: usize,
    partition_size: usize,
    scale: f32,
    out: &mut [f32],
) {
    let (acc, lse) = out.split_at_mut(q.len());
    acc.fill(0.0);

    let end = span.len().min(start + partition_size);
    if end <= start {
        lse[0] = f32::NEG_INFINITY;
        return;
    }

    let mut m = f32::NEG_INFINITY;
    let mut d = 0.0f32;
    let mut rows = [0usize; CHUNK_SIZE];
    let mut scores = [0.0f32; CHUNK_SIZE];

    for chunk_start in (start..end).step_by(CHUNK_SIZE) {
        let n = (end - chunk_start).min(CHUNK_SIZE);
        for (i, pos) in (chunk_start..chunk_start + n).enumerate() {
            rows[i] = span.row(pos);
            scores[i] = dot(q, layer.key(rows[i], kv_head)) * scale;
        }

        let chunk_max = scores[..n].iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let m_new = m.max(chunk_max);
        let alpha = (m - m_new).exp();

        acc.iter_mut().for_each(|a| *a *= alpha);
        let mut sum_p = 0.0f32;
        for (&row, &score) in rows[..n].iter().zip(&scores[..n]) {
            let p = (score - m_new).exp();
            sum_p += p;
            for (a, &v) in acc.iter_mut().zip(layer.value(row, kv_head)) {
                *a += p * v.to_f32();
            }
        }

        d = alpha * d + sum_p;
        m = m_new;
    }

    acc.iter_mut().for_each(|a| *a /= d);
    lse[0] = m + d.ln();
}

fn dot<T: KvElement>(q: &[f32], k: &[T]) -> f32 {
    q.iter().zip(k).map(|(&a, &b)| a * b.to_f32()).sum()
}

/// Validate shapes and return the query-per-KV head group ratio.
fn check_inputs<T: KvElement>(
    q: &[f32],
    num_q_heads: usize,
    layer: &LayerBuffer<T>,
    spans: &[KvSpan],
) -> Result<usize, AttentionError> {
    let num_kv_heads = layer.num_kv_heads();
    if num_q_heads == 0 || num_kv_heads == 0 || num_q_heads % num_kv_heads != 0 {
        return Err(AttentionError::InvalidHeadGroup {
            num_q_heads,
            num_kv_heads,
        });
    }

    let expected = spans.len() * num_q_heads * layer.head_dim();
    if q.len() != expected {
        return Err(AttentionError::ShapeMismatch(format!(
            "query has {} elements, expected {} sequences x {num_q_heads} heads x {} dims = {expected}",
            q.len(),
            spans.len(),
            layer.head_dim()
        )));
    }

    for (batch, span) in spans.iter().enumerate() {
        if let Some(row) = span.max_row() {
            if row >= layer.rows() {
                return Err(AttentionError::RowOutOfRange {
                    batch,
                    row,
                    rows: layer.rows(),
                });
            }
        }
    }

    Ok(num_q_heads / num_kv_heads)
}

/// Single-pass softmax attention over the full sequence, accumulated in f64.
///
/// Same inputs and output layout as [`DecodeAttention::forward`]; used to
/// check the partitioned reduction.
pub fn reference_attention<T: KvElement>(
    q: &[f32],
    num_q_heads: usize,
    layer: &LayerBuffer<T>,
    spans: &[KvSpan],
    scale: f32,
) -> Result<Vec<f32>, AttentionError> {
    let group = check_inputs(q, num_q_heads, layer, spans)?;
    let head_dim = layer.head_dim();
    let mut out = vec![0.0f32; q.len()];

    for (b, span) in spans.iter().enumerate() {
        for h in 0..num_q_heads {
            let bh = b * num_q_heads + h;
            let q_vec = &q[bh * head_dim..(bh + 1) * head_dim];
            let kv_head = h / group;

            let scores: Vec<f64> = (0..span.len())
                .map(|pos| {
                    let key = layer.key(span.row(pos), kv_head);
                    q_vec
                        .iter()
                        .zip(key)
                        .map(|(&a, &k)| a as f64 * k.to_f32() as f64)
                        .sum::<f64>()
                        * scale as f64
                })
                .collect();
            let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let weights: Vec<f64> = scores.iter().map(|s| (s - max).exp()).collect();
            let total: f64 = weights.iter().sum();

            let mut acc = vec![0.0f64; head_dim];
            for (pos, w) in weights.iter().enumerate() {
                for (a, &v) in acc.iter_mut().zip(layer.value(span.row(pos), kv_head)) {
                    *a += w * v.to_f32() as f64;
                }
            }
            if total > 0.0 {
                for (o, a) in out[bh * head_dim..(bh + 1) * head_dim].iter_mut().zip(&acc) {
                    *o = (a / total) as f32;
                }
            }
        }
    }
    Ok(out)
}
