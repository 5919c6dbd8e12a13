//! CUDA driver profiler.
//!
//! Reads device-wide free/total memory around a caller-supplied representative
//! step. The step reports its own allocator's peak and current bytes; anything
//! the device shows in use beyond that is treated as externally allocated
//! (NCCL workspaces, cuBLAS handles, other processes).

use super::{MemoryProfiler, ProfileError};
use crate::planner::MemoryProfile;
use cudarc::driver::{result, CudaContext};
use std::sync::Arc;
use tracing::debug;

/// What the representative step observed from its own allocator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepUsage {
    /// High-water mark of the allocator during the step.
    pub peak_bytes: usize,
    /// Bytes the allocator still holds after the step.
    pub current_bytes: usize,
}

/// Profiles a CUDA device by running one representative step.
pub struct CudaMemoryProfiler<F> {
    ctx: Arc<CudaContext>,
    step: F,
}

impl<F> CudaMemoryProfiler<F>
where
    F: FnMut() -> Result<StepUsage, ProfileError>,
{
    /// Open device `ordinal` and profile it with `step`.
    pub fn new(ordinal: usize, step: F) -> Result<Self, ProfileError> {
        let ctx = CudaContext::new(ordinal)?;
        Ok(Self { ctx, step })
    }

    pub fn with_context(ctx: Arc<CudaContext>, step: F) -> Self {
        Self { ctx, step }
    }

    /// `(free, total)` bytes for the bound device.
    fn mem_get_info(&self) -> Result<(usize, usize), ProfileError> {
        self.ctx.bind_to_thread()?;
        Ok(result::mem_get_info()?)
    }
}

impl<F> MemoryProfiler for CudaMemoryProfiler<F>
where
    F: FnMut() -> Result<StepUsage, ProfileError>,
{
    fn profile(&mut self) -> Result<MemoryProfile, ProfileError> {
        let (free_pre, total) = self.mem_get_info()?;

        let usage = (self.step)()?;
        self.ctx.synchronize()?;

        let (free_post, total_post) = self.mem_get_info()?;
        let device_used = total_post.saturating_sub(free_post);
        debug!(
            free_pre,
            free_post,
            peak = usage.peak_bytes,
            allocator_current = usage.current_bytes,
            "profiled representative step"
        );

        Ok(MemoryProfile::from_usage(
            total,
            free_pre,
            usage.peak_bytes,
            device_used,
            usage.current_bytes,
        ))
    }
}
