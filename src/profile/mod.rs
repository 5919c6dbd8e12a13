//! Profiler hook: the measurement side of capacity planning.
//!
//! The planner needs one number it cannot compute itself: how much device
//! memory a representative inference step peaks at once weights and compiled
//! artifacts are resident. Implementations of [`MemoryProfiler`] own that
//! measurement. The CUDA driver implementation lives behind the `cuda` feature.

#[cfg(feature = "cuda")]
pub mod cuda;

use crate::config::ConfigError;
use crate::planner::MemoryProfile;
use thiserror::Error;

/// Errors from a profiler hook.
#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("representative step failed: {0}")]
    Step(String),

    #[cfg(feature = "cuda")]
    #[error("CUDA error: {0}")]
    Cuda(#[from] cudarc::driver::DriverError),
}

/// The contract between the capacity planner and whatever measures the
/// device.
///
/// `profile` must be called after model weights and ahead-of-time compiled
/// artifacts are resident, and must include at least one representative
/// inference step so the reported peak reflects steady-state usage.
pub trait MemoryProfiler {
    fn profile(&mut self) -> Result<MemoryProfile, ProfileError>;
}

/// Reports a fixed, externally measured profile.
#[derive(Debug, Clone, Copy)]
pub struct StaticProfiler {
    profile: MemoryProfile,
}

impl StaticProfiler {
    pub fn new(profile: MemoryProfile) -> Self {
        Self { profile }
    }
}

impl MemoryProfiler for StaticProfiler {
    fn profile(&mut self) -> Result<MemoryProfile, ProfileError> {
        Ok(self.profile)
    }
}

impl<F> MemoryProfiler for F
where
    F: FnMut() -> Result<MemoryProfile, ProfileError>,
{
    fn profile(&mut self) -> Result<MemoryProfile, ProfileError> {
        self()
    }
}
