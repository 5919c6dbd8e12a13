//! gpu-kvcache: KV cache memory management and decode attention.
//!
//! Sizes a KV cache from a device memory profile, hands out reference-counted
//! cache slots to concurrently running sequences, and computes decode-time
//! attention over a sequence's slots with partition-parallel flash decoding.

pub mod attention;
pub mod config;
pub mod planner;
pub mod pool;
pub mod profile;

pub use attention::kernels::{KernelProvider, RayonKernels, SerialKernels};
pub use attention::{AttentionError, DecodeAttention, KvSpan};
pub use config::{CacheConfig, ConfigError, Dtype};
pub use planner::{CacheGeometry, CapacityPlanner, MemoryProfile};
pub use pool::kv_cache::{SeqId, SequenceCache};
pub use pool::{PoolError, SharedSlotPool, SlotPool};
pub use profile::{MemoryProfiler, ProfileError};
