//! Cache configuration and numeric precision.
//!
//! Everything here is validated once at engine startup. A bad value is a
//! [`ConfigError`] and is never recovered from or silently defaulted.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Tokens scanned per inner step of decode-attention stage 1.
///
/// `partition_size` must be a multiple of this.
pub const CHUNK_SIZE: usize = 16;

/// Errors raised while validating cache configuration.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("unsupported KV cache dtype: {0:?}")]
    UnsupportedDtype(String),

    #[error("gpu_memory_utilization must be in (0, 1], got {0}")]
    InvalidUtilization(f64),

    #[error("partition_size {partition_size} must be a positive multiple of {chunk_size}")]
    InvalidPartitionSize {
        partition_size: usize,
        chunk_size: usize,
    },

    #[error("invalid cache geometry: {0}")]
    InvalidGeometry(String),
}

/// Numeric precision of the KV cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dtype {
    F32,
    F16,
    BF16,
}

impl Dtype {
    /// Bytes per cache element.
    pub fn element_width(self) -> usize {
        match self {
            Dtype::F32 => 4,
            Dtype::F16 | Dtype::BF16 => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Dtype::F32 => "float32",
            Dtype::F16 => "float16",
            Dtype::BF16 => "bfloat16",
        }
    }
}

impl FromStr for Dtype {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "float32" | "fp32" | "f32" => Ok(Dtype::F32),
            "float16" | "fp16" | "f16" | "half" => Ok(Dtype::F16),
            "bfloat16" | "bf16" | "bfp16" => Ok(Dtype::BF16),
            _ => Err(ConfigError::UnsupportedDtype(s.to_string())),
        }
    }
}

impl fmt::Display for Dtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tunables consumed by the capacity planner, the slot pool and the
/// decode-attention reducer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Fraction of total device memory the engine may use, in (0, 1].
    pub gpu_memory_utilization: f64,

    /// Tokens per decode-attention partition. Multiple of [`CHUNK_SIZE`].
    pub partition_size: usize,

    /// Tokens stored per slot.
    pub slot_granularity: usize,

    /// KV cache precision name, e.g. `"float16"` or `"bf16"`.
    pub dtype: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            gpu_memory_utilization: 0.9,
            partition_size: 128,
            slot_granularity: 1,
            dtype: "float16".to_string(),
        }
    }
}

impl CacheConfig {
    /// Check every field, returning the parsed dtype on success.
    pub fn validate(&self) -> Result<Dtype, ConfigError> {
        let f = self.gpu_memory_utilization;
        if !(f > 0.0 && f <= 1.0) {
            return Err(ConfigError::InvalidUtilization(f));
        }
        if self.partition_size == 0 || self.partition_size % CHUNK_SIZE != 0 {
            return Err(ConfigError::InvalidPartitionSize {
                partition_size: self.partition_size,
                chunk_size: CHUNK_SIZE,
            });
        }
        if self.slot_granularity == 0 {
            return Err(ConfigError::InvalidGeometry(
                "slot_granularity must be at least 1".to_string(),
            ));
        }
        self.dtype.parse()
    }
}
