//! Capacity planning: how many KV cache slots fit on the device.
//!
//! The planner never runs inference itself. It is handed a [`MemoryProfile`]
//! measured by a [`MemoryProfiler`] after weights and any ahead-of-time
//! compiled artifacts are resident, and turns the remaining budget into a
//! slot count for [`SlotPool`](crate::pool::SlotPool).

use crate::config::{CacheConfig, ConfigError, Dtype};
use crate::profile::{MemoryProfiler, ProfileError};
use tracing::{info, warn};

const GIB: f64 = (1u64 << 30) as f64;

/// Immutable shape of the KV cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheGeometry {
    pub num_layers: usize,
    /// Number of KV heads (for GQA, the smaller number).
    pub num_kv_heads: usize,
    pub head_dim: usize,
    pub dtype: Dtype,
    /// Tokens per decode-attention partition.
    pub partition_size: usize,
    /// Tokens per slot.
    pub slot_granularity: usize,
}

impl CacheGeometry {
    /// Build a geometry from model dimensions and a validated config.
    pub fn new(
        num_layers: usize,
        num_kv_heads: usize,
        head_dim: usize,
        config: &CacheConfig,
    ) -> Result<Self, ConfigError> {
        let dtype = config.validate()?;
        if num_layers == 0 || num_kv_heads == 0 || head_dim == 0 {
            return Err(ConfigError::InvalidGeometry(format!(
                "layers={num_layers} kv_heads={num_kv_heads} head_dim={head_dim} must all be non-zero"
            )));
        }
        Ok(Self {
            num_layers,
            num_kv_heads,
            head_dim,
            dtype,
            partition_size: config.partition_size,
            slot_granularity: config.slot_granularity,
        })
    }

    /// Bytes per cache element.
    pub fn element_width(&self) -> usize {
        self.dtype.element_width()
    }

    /// Elements in one token row of one layer: K and V for every KV head.
    pub fn row_elems(&self) -> usize {
        2 * self.num_kv_heads * self.head_dim
    }
}

/// Bytes of device memory one slot costs across all layers.
///
/// `2 * num_kv_heads * head_dim * element_width * num_layers`, times the
/// tokens held per slot. The 2 covers storing both K and V.
pub fn compute_block_size_bytes(geometry: &CacheGeometry) -> usize {
    let per_token_per_layer = geometry.row_elems() * geometry.element_width();
    per_token_per_layer * geometry.num_layers * geometry.slot_granularity
}

/// Device memory figures reported by the profiler hook, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryProfile {
    /// Total device memory.
    pub total_bytes: usize,
    /// Free device memory before the representative step ran.
    pub free_bytes_pre_profile: usize,
    /// Peak bytes held by the measured allocator during the step.
    pub peak_bytes: usize,
    /// Device memory in use that the measured allocator does not account for.
    pub external_bytes: usize,
}

impl MemoryProfile {
    /// Derive `external_bytes` from a post-step reading of the whole device
    /// (`device_used_bytes`) and of the measured allocator alone.
    pub fn from_usage(
        total_bytes: usize,
        free_bytes_pre_profile: usize,
        peak_bytes: usize,
        device_used_bytes: usize,
        allocator_used_bytes: usize,
    ) -> Self {
        Self {
            total_bytes,
            free_bytes_pre_profile,
            peak_bytes,
            external_bytes: device_used_bytes.saturating_sub(allocator_used_bytes),
        }
    }

    /// Peak usage with externally allocated memory folded in.
    pub fn adjusted_peak_bytes(&self) -> usize {
        self.peak_bytes.saturating_add(self.external_bytes)
    }

    /// Bytes left for the KV cache; negative when the step alone overshoots
    /// the budget.
    pub fn available_bytes(&self, utilization: f64) -> f64 {
        self.total_bytes as f64 * utilization - self.adjusted_peak_bytes() as f64
    }
}

/// Number of slots that fit in what the profile leaves over. Never negative.
pub fn compute_available_slots(
    profile: &MemoryProfile,
    utilization: f64,
    bytes_per_slot: usize,
) -> usize {
    if bytes_per_slot == 0 {
        return 0;
    }
    let available = profile.available_bytes(utilization);
    if available <= 0.0 {
        return 0;
    }
    (available / bytes_per_slot as f64).floor() as usize
}

/// Sizes the slot pool from a geometry and a utilization budget.
#[derive(Debug, Clone)]
pub struct CapacityPlanner {
    geometry: CacheGeometry,
    utilization: f64,
}

impl CapacityPlanner {
    pub fn new(geometry: CacheGeometry, config: &CacheConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            geometry,
            utilization: config.gpu_memory_utilization,
        })
    }

    pub fn geometry(&self) -> &CacheGeometry {
        &self.geometry
    }

    pub fn utilization(&self) -> f64 {
        self.utilization
    }

    pub fn block_size_bytes(&self) -> usize {
        compute_block_size_bytes(&self.geometry)
    }

    /// Slot count for an already-measured profile.
    pub fn available_slots(&self, profile: &MemoryProfile) -> usize {
        let bytes_per_slot = self.block_size_bytes();
        let slots = compute_available_slots(profile, self.utilization, bytes_per_slot);

        info!(
            total_gpu_memory_gib = profile.total_bytes as f64 / GIB,
            initial_memory_usage_gib =
                profile.total_bytes.saturating_sub(profile.free_bytes_pre_profile) as f64 / GIB,
            peak_memory_gib = profile.peak_bytes as f64 / GIB,
            external_memory_gib = profile.external_bytes as f64 / GIB,
            kv_cache_gib = profile.available_bytes(self.utilization) / GIB,
            gpu_memory_utilization = self.utilization,
            bytes_per_slot,
            slots,
            "memory profiling results"
        );
        if slots == 0 {
            warn!(
                peak_bytes = profile.adjusted_peak_bytes(),
                "no device memory left for KV cache slots"
            );
        }
        slots
    }

    /// Run the profiler hook, then size the pool from its measurement.
    ///
    /// Call only after every one-time device allocation is in place; the
    /// profile is a high-water mark, not current usage.
    pub fn plan<P: MemoryProfiler + ?Sized>(&self, profiler: &mut P) -> Result<usize, ProfileError> {
        let profile = profiler.profile()?;
        Ok(self.available_slots(&profile))
    }
}
