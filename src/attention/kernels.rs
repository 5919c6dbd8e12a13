//! Compute kernel providers for the decode-attention reducer.
//!
//! The reducer fixes the numeric sequence of every work unit; a provider only
//! decides how units are dispatched. Each unit owns one disjoint chunk of the
//! output buffer, so providers need no synchronization beyond returning after
//! every unit has run.

use rayon::prelude::*;

/// Dispatches independent work units over disjoint output chunks.
pub trait KernelProvider {
    /// Call `f(unit_index, chunk)` once for every `chunk_len`-sized chunk of
    /// `data`. Returns after all units completed.
    fn for_each_chunk<F>(&self, data: &mut [f32], chunk_len: usize, f: F)
    where
        F: Fn(usize, &mut [f32]) + Send + Sync;
}

/// Runs units one after another on the calling thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialKernels;

impl KernelProvider for SerialKernels {
    fn for_each_chunk<F>(&self, data: &mut [f32], chunk_len: usize, f: F)
    where
        F: Fn(usize, &mut [f32]) + Send + Sync,
    {
        if chunk_len == 0 {
            return;
        }
        data.chunks_mut(chunk_len)
            .enumerate()
            .for_each(|(i, chunk)| f(i, chunk));
    }
}

/// Runs units data-parallel on the rayon thread pool.
#[derive(Debug, Clone, Copy, Default)]
pub struct RayonKernels;

impl KernelProvider for RayonKernels {
    fn for_each_chunk<F>(&self, data: &mut [f32], chunk_len: usize, f: F)
    where
        F: Fn(usize, &mut [f32]) + Send + Sync,
    {
        if chunk_len == 0 {
            return;
        }
        data.par_chunks_mut(chunk_len)
            .enumerate()
            .for_each(|(i, chunk)| f(i, chunk));
    }
}
