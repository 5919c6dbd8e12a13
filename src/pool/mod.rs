//! KV cache slot pool, the memory manager of gpu-kvcache.
//!
//! The pool pre-allocates one flat cache buffer per layer, sized for a fixed
//! number of slots, and keeps a reference count per slot. A slot is free
//! exactly when its count is zero. Sequences take slots either one-by-one
//! from anywhere (scattered) or as one address-contiguous run, share them by
//! bumping counts, and hand them back by dropping counts.
//!
//! The pool never writes vectors into the buffers itself. Callers do that
//! through [`SlotPool::layer_mut`] after allocating.

pub mod buffer;
pub mod kv_cache;

use crate::config::ConfigError;
use crate::planner::{compute_block_size_bytes, CacheGeometry};
use buffer::{KvElement, LayerBuffer};
use kv_cache::SeqId;
use parking_lot::{Mutex, RwLock};
use std::ops::Range;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors from the slot pool.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("out of KV cache slots ({requested} requested, {available} free, {total} total)")]
    Exhausted {
        requested: usize,
        available: usize,
        total: usize,
    },

    #[error("releasing slot {slot} {released} time(s) but it is only held {held} time(s)")]
    InvalidRelease {
        slot: usize,
        held: u32,
        released: u32,
    },

    #[error("slot {slot} out of range ({total} slots)")]
    InvalidSlot { slot: usize, total: usize },

    #[error("row {row} out of range ({rows} rows)")]
    InvalidRow { row: usize, rows: usize },

    #[error("layer {layer} out of range or buffers freed ({num_layers} layers)")]
    InvalidLayer { layer: usize, num_layers: usize },

    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("unknown sequence: {0:?}")]
    UnknownSequence(SeqId),

    #[error("sequence ids exhausted")]
    SequenceIdsExhausted,

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// An address-contiguous allocation `[start, end)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContiguousAlloc {
    /// The slot indices, `start..end` in order.
    pub slots: Vec<usize>,
    pub start: usize,
    pub end: usize,
}

/// Counters for a slot pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotPoolStats {
    pub total_slots: usize,
    pub held_slots: usize,
    pub free_slots: usize,
    pub bytes_per_slot: usize,
    pub total_allocations: usize,
    pub total_releases: usize,
    pub peak_held: usize,
}

/// Reference-counted KV cache slots plus the buffers they index.
///
/// Every operation is a whole-table mutation: it validates its input first
/// and only then touches the counts, so a failed call leaves the table as it
/// was. Wrap in [`SharedSlotPool`] to use from several threads.
pub struct SlotPool<T> {
    geometry: CacheGeometry,

    /// Reference count per slot; zero means free.
    ref_counts: Vec<u32>,

    /// Number of zero entries in `ref_counts`, kept in step with every
    /// mutation.
    free: usize,

    /// One buffer per layer. `None` after [`SlotPool::free_buffers`].
    buffers: Option<Vec<LayerBuffer<T>>>,

    total_allocations: usize,
    total_releases: usize,
    peak_held: usize,
}

impl<T: KvElement> SlotPool<T> {
    /// Create a pool of `total_slots` slots with zeroed buffers.
    pub fn new(geometry: CacheGeometry, total_slots: usize) -> Result<Self, PoolError> {
        if T::DTYPE != geometry.dtype {
            return Err(ConfigError::InvalidGeometry(format!(
                "buffer element type {} does not match configured dtype {}",
                T::DTYPE,
                geometry.dtype
            ))
            .into());
        }

        let rows = total_slots * geometry.slot_granularity;
        let buffers = (0..geometry.num_layers)
            .map(|_| LayerBuffer::zeros(rows, geometry.num_kv_heads, geometry.head_dim))
            .collect();

        info!(
            total_slots,
            num_layers = geometry.num_layers,
            rows_per_layer = rows,
            total_bytes = total_slots * compute_block_size_bytes(&geometry),
            dtype = %geometry.dtype,
            "allocated KV cache"
        );

        Ok(Self {
            geometry,
            ref_counts: vec![0; total_slots],
            free: total_slots,
            buffers: Some(buffers),
            total_allocations: 0,
            total_releases: 0,
            peak_held: 0,
        })
    }

    /// Take the first `need_size` free slots in ascending order.
    pub fn allocate_scattered(&mut self, need_size: usize) -> Result<Vec<usize>, PoolError> {
        if need_size > self.free {
            warn!(
                need_size,
                free = self.free,
                "not enough KV cache slots"
            );
            return Err(self.exhausted(need_size));
        }

        let slots: Vec<usize> = self.free_slots().take(need_size).collect();
        self.increment(&slots);
        self.total_allocations += 1;
        Ok(slots)
    }

    /// Take an address-contiguous run of `need_size` free slots.
    ///
    /// Scans the ascending free list `F` for the first offset `i` with
    /// `F[i + need_size] - F[i] == need_size`. A run therefore only qualifies
    /// when the slot right after it is free as well. Fails with
    /// [`PoolError::Exhausted`] under fragmentation even if enough slots are
    /// free in total.
    pub fn allocate_contiguous(&mut self, need_size: usize) -> Result<ContiguousAlloc, PoolError> {
        if need_size == 0 {
            self.total_allocations += 1;
            return Ok(ContiguousAlloc {
                slots: Vec::new(),
                start: 0,
                end: 0,
            });
        }
        if need_size > self.free {
            debug!(need_size, free = self.free, "not enough contiguous KV cache slots");
            return Err(self.exhausted(need_size));
        }

        let free: Vec<usize> = self.free_slots().collect();
        let window = (0..free.len().saturating_sub(need_size))
            .find(|&i| free[i + need_size] - free[i] == need_size);

        let Some(i) = window else {
            debug!(
                need_size,
                free = self.free,
                "no contiguous run of free KV cache slots"
            );
            return Err(self.exhausted(need_size));
        };

        let start = free[i];
        let end = start + need_size;
        let slots: Vec<usize> = (start..end).collect();
        self.increment(&slots);
        self.total_allocations += 1;
        Ok(ContiguousAlloc { slots, start, end })
    }

    /// Add one reference to every listed slot, free or held.
    ///
    /// A slot listed twice gains two references.
    pub fn add_ref(&mut self, slots: &[usize]) -> Result<(), PoolError> {
        self.check_range(slots)?;
        self.increment(slots);
        Ok(())
    }

    /// Drop one reference per occurrence of each listed slot.
    ///
    /// Fails with [`PoolError::InvalidRelease`] if any count would go below
    /// zero; nothing is released in that case.
    pub fn release_ref(&mut self, slots: &[usize]) -> Result<(), PoolError> {
        self.check_range(slots)?;

        let mut sorted = slots.to_vec();
        sorted.sort_unstable();
        let groups: Vec<(usize, u32)> = sorted
            .chunk_by(|a, b| a == b)
            .map(|run| (run[0], run.len() as u32))
            .collect();

        for &(slot, released) in &groups {
            let held = self.ref_counts[slot];
            if released > held {
                return Err(PoolError::InvalidRelease {
                    slot,
                    held,
                    released,
                });
            }
        }

        for (slot, released) in groups {
            let count = &mut self.ref_counts[slot];
            *count -= released;
            if *count == 0 {
                self.free += 1;
            }
        }
        self.total_releases += 1;
        self.debug_check_free();
        Ok(())
    }

    /// Reset every count to zero, whatever it was.
    pub fn release_all(&mut self) {
        self.ref_counts.fill(0);
        self.free = self.ref_counts.len();
        debug!(total_slots = self.free, "released all KV cache slots");
    }

    /// Number of free slots.
    pub fn free_count(&self) -> usize {
        self.free
    }

    /// Number of slots with a non-zero count.
    pub fn held_count(&self) -> usize {
        self.ref_counts.len() - self.free
    }

    pub fn total_slots(&self) -> usize {
        self.ref_counts.len()
    }

    /// Reference count of `slot`, or `None` if out of range.
    pub fn ref_count(&self, slot: usize) -> Option<u32> {
        self.ref_counts.get(slot).copied()
    }

    pub fn geometry(&self) -> &CacheGeometry {
        &self.geometry
    }

    /// Buffer rows covered by `slot`.
    pub fn slot_rows(&self, slot: usize) -> Range<usize> {
        let g = self.geometry.slot_granularity;
        slot * g..(slot + 1) * g
    }

    pub fn layer(&self, layer: usize) -> Result<&LayerBuffer<T>, PoolError> {
        select_layer(self.buffers.as_deref(), layer, self.geometry.num_layers)
    }

    pub fn layer_mut(&mut self, layer: usize) -> Result<&mut LayerBuffer<T>, PoolError> {
        let num_layers = self.geometry.num_layers;
        self.buffers
            .as_mut()
            .and_then(|b| b.get_mut(layer))
            .ok_or(PoolError::InvalidLayer { layer, num_layers })
    }

    /// Copy the rows of slot `src` into slot `dst` in every layer.
    pub fn copy_slot(&mut self, src: usize, dst: usize) -> Result<(), PoolError> {
        self.check_range(&[src, dst])?;
        copy_slot_rows(
            self.buffers.as_deref_mut(),
            &self.geometry,
            src,
            dst,
        )
    }

    /// Drop the cache buffers, keeping the slot table.
    pub fn free_buffers(&mut self) {
        self.buffers = None;
    }

    pub fn stats(&self) -> SlotPoolStats {
        SlotPoolStats {
            total_slots: self.total_slots(),
            held_slots: self.held_count(),
            free_slots: self.free,
            bytes_per_slot: compute_block_size_bytes(&self.geometry),
            total_allocations: self.total_allocations,
            total_releases: self.total_releases,
            peak_held: self.peak_held,
        }
    }

    fn free_slots(&self) -> impl Iterator<Item = usize> + '_ {
        self.ref_counts
            .iter()
            .enumerate()
            .filter(|(_, &count)| count == 0)
            .map(|(slot, _)| slot)
    }

    fn check_range(&self, slots: &[usize]) -> Result<(), PoolError> {
        let total = self.total_slots();
        match slots.iter().find(|&&slot| slot >= total) {
            Some(&slot) => Err(PoolError::InvalidSlot { slot, total }),
            None => Ok(()),
        }
    }

    /// Bump counts for in-range slots.
    fn increment(&mut self, slots: &[usize]) {
        for &slot in slots {
            let count = &mut self.ref_counts[slot];
            if *count == 0 {
                self.free -= 1;
            }
            *count += 1;
        }
        self.peak_held = self.peak_held.max(self.held_count());
        self.debug_check_free();
    }

    fn exhausted(&self, requested: usize) -> PoolError {
        PoolError::Exhausted {
            requested,
            available: self.free,
            total: self.total_slots(),
        }
    }

    fn debug_check_free(&self) {
        debug_assert_eq!(
            self.free,
            self.ref_counts.iter().filter(|&&c| c == 0).count()
        );
    }
}

fn select_layer<T>(
    buffers: Option<&[LayerBuffer<T>]>,
    layer: usize,
    num_layers: usize,
) -> Result<&LayerBuffer<T>, PoolError> {
    buffers
        .and_then(|b| b.get(layer))
        .ok_or(PoolError::InvalidLayer { layer, num_layers })
}

fn copy_slot_rows<T: KvElement>(
    buffers: Option<&mut [LayerBuffer<T>]>,
    geometry: &CacheGeometry,
    src: usize,
    dst: usize,
) -> Result<(), PoolError> {
    let buffers = buffers.ok_or(PoolError::InvalidLayer {
        layer: 0,
        num_layers: geometry.num_layers,
    })?;
    let g = geometry.slot_granularity;
    for buffer in buffers {
        buffer.copy_rows(src * g, dst * g, g)?;
    }
    Ok(())
}

/// A [`SlotPool`] shared across threads.
///
/// The slot table and the cache buffers sit behind separate locks. Table
/// operations take a short mutex and never wait on readers of the buffers, so
/// an attention pass running under [`SharedSlotPool::with_layer`] does not
/// stall allocation or release on other threads. Nothing blocks waiting for
/// capacity.
pub struct SharedSlotPool<T> {
    geometry: CacheGeometry,
    table: Arc<Mutex<SlotPool<T>>>,
    buffers: Arc<RwLock<Option<Vec<LayerBuffer<T>>>>>,
}

impl<T> Clone for SharedSlotPool<T> {
    fn clone(&self) -> Self {
        Self {
            geometry: self.geometry.clone(),
            table: Arc::clone(&self.table),
            buffers: Arc::clone(&self.buffers),
        }
    }
}

impl<T: KvElement> SharedSlotPool<T> {
    /// Share `pool`. Its buffers move out of the table into their own lock.
    pub fn new(mut pool: SlotPool<T>) -> Self {
        let buffers = pool.buffers.take();
        Self {
            geometry: pool.geometry.clone(),
            table: Arc::new(Mutex::new(pool)),
            buffers: Arc::new(RwLock::new(buffers)),
        }
    }

    pub fn allocate_scattered(&self, need_size: usize) -> Result<Vec<usize>, PoolError> {
        self.table.lock().allocate_scattered(need_size)
    }

    pub fn allocate_contiguous(&self, need_size: usize) -> Result<ContiguousAlloc, PoolError> {
        self.table.lock().allocate_contiguous(need_size)
    }

    pub fn add_ref(&self, slots: &[usize]) -> Result<(), PoolError> {
        self.table.lock().add_ref(slots)
    }

    pub fn release_ref(&self, slots: &[usize]) -> Result<(), PoolError> {
        self.table.lock().release_ref(slots)
    }

    pub fn release_all(&self) {
        self.table.lock().release_all()
    }

    pub fn free_count(&self) -> usize {
        self.table.lock().free_count()
    }

    pub fn stats(&self) -> SlotPoolStats {
        self.table.lock().stats()
    }

    /// Run `f` against the slot table. The table carries no buffers here;
    /// use [`with_layer`](Self::with_layer) for those.
    pub fn with_table<R>(&self, f: impl FnOnce(&SlotPool<T>) -> R) -> R {
        f(&*self.table.lock())
    }

    /// Run `f` with read access to one layer buffer, e.g. for an attention
    /// pass. Readers run concurrently with each other and with table
    /// operations.
    pub fn with_layer<R>(
        &self,
        layer: usize,
        f: impl FnOnce(&LayerBuffer<T>) -> R,
    ) -> Result<R, PoolError> {
        let buffers = self.buffers.read();
        let buffer = select_layer(buffers.as_deref(), layer, self.geometry.num_layers)?;
        Ok(f(buffer))
    }

    /// Run `f` with write access to one layer buffer, e.g. to store new rows.
    pub fn with_layer_mut<R>(
        &self,
        layer: usize,
        f: impl FnOnce(&mut LayerBuffer<T>) -> R,
    ) -> Result<R, PoolError> {
        let num_layers = self.geometry.num_layers;
        let mut buffers = self.buffers.write();
        let buffer = buffers
            .as_deref_mut()
            .and_then(|b| b.get_mut(layer))
            .ok_or(PoolError::InvalidLayer { layer, num_layers })?;
        Ok(f(buffer))
    }

    /// Copy the rows of slot `src` into slot `dst` in every layer.
    pub fn copy_slot(&self, src: usize, dst: usize) -> Result<(), PoolError> {
        self.table.lock().check_range(&[src, dst])?;
        copy_slot_rows(
            self.buffers.write().as_deref_mut(),
            &self.geometry,
            src,
            dst,
        )
    }

    /// Drop the cache buffers, keeping the slot table.
    pub fn free_buffers(&self) {
        *self.buffers.write() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use half::f16;
    use proptest::prelude::*;

    fn make_pool(total_slots: usize) -> SlotPool<f16> {
        let geometry = CacheGeometry::new(2, 2, 4, &CacheConfig::default()).unwrap();
        SlotPool::new(geometry, total_slots).expect("Failed to create pool")
    }

    #[test]
    fn buffers_match_geometry() {
        let pool = make_pool(8);
        assert_eq!(pool.total_slots(), 8);
        assert_eq!(pool.free_count(), 8);
        let layer = pool.layer(1).unwrap();
        assert_eq!(layer.rows(), 8);
        assert_eq!(layer.as_slice().len(), 8 * 2 * 2 * 4);
        assert!(matches!(pool.layer(2), Err(PoolError::InvalidLayer { layer: 2, .. })));
        assert_eq!(pool.stats().bytes_per_slot, 64);
    }

    #[test]
    fn dtype_must_match_element_type() {
        let geometry = CacheGeometry::new(1, 1, 4, &CacheConfig::default()).unwrap();
        let err = SlotPool::<f32>::new(geometry, 4).err().unwrap();
        assert!(matches!(err, PoolError::Config(ConfigError::InvalidGeometry(_))));
    }

    #[test]
    fn scattered_then_contiguous() {
        let mut pool = make_pool(8);

        let slots = pool.allocate_scattered(3).unwrap();
        assert_eq!(slots, vec![0, 1, 2]);
        assert_eq!(pool.free_count(), 5);

        let alloc = pool.allocate_contiguous(3).unwrap();
        assert_eq!(alloc.slots, vec![3, 4, 5]);
        assert_eq!((alloc.start, alloc.end), (3, 6));
        assert_eq!(pool.free_count(), 2);
        for slot in 0..6 {
            assert_eq!(pool.ref_count(slot), Some(1));
        }
    }

    #[test]
    fn scattered_fills_holes_in_order() {
        let mut pool = make_pool(8);
        let slots = pool.allocate_scattered(6).unwrap();
        pool.release_ref(&[1, 4]).unwrap();

        let refill = pool.allocate_scattered(3).unwrap();
        assert_eq!(refill, vec![1, 4, 6]);
        assert_eq!(slots.len(), 6);
    }

    #[test]
    fn exhaust_pool() {
        let mut pool = make_pool(4);
        pool.allocate_scattered(4).unwrap();
        assert_eq!(pool.free_count(), 0);

        let err = pool.allocate_scattered(1).unwrap_err();
        assert!(matches!(
            err,
            PoolError::Exhausted { requested: 1, available: 0, total: 4 }
        ));
        // Failure does not change the table
        assert_eq!(pool.free_count(), 0);
    }

    #[test]
    fn contiguous_fails_under_fragmentation() {
        let mut pool = make_pool(8);
        pool.allocate_scattered(8).unwrap();
        // Free every other slot: 4 free, none adjacent
        pool.release_ref(&[0, 2, 4, 6]).unwrap();
        assert_eq!(pool.free_count(), 4);

        let err = pool.allocate_contiguous(2).unwrap_err();
        assert!(matches!(err, PoolError::Exhausted { requested: 2, available: 4, .. }));
        assert_eq!(pool.free_count(), 4);

        // Scattered still works
        assert_eq!(pool.allocate_scattered(2).unwrap(), vec![0, 2]);
    }

    #[test]
    fn contiguous_skips_short_runs() {
        let mut pool = make_pool(10);
        pool.allocate_scattered(10).unwrap();
        // Free runs: [1, 2] and [5, 6, 7, 8, 9]
        pool.release_ref(&[1, 2, 5, 6, 7, 8, 9]).unwrap();

        let alloc = pool.allocate_contiguous(3).unwrap();
        assert_eq!((alloc.start, alloc.end), (5, 8));
        assert!(alloc.slots.iter().all(|&s| pool.ref_count(s) == Some(1)));
    }

    #[test]
    fn contiguous_needs_free_successor() {
        let mut pool = make_pool(8);
        pool.allocate_scattered(5).unwrap();
        // Free: [5, 6, 7]. The run sits at the end of the pool with nothing
        // after it.
        assert!(pool.allocate_contiguous(3).is_err());
        assert_eq!(pool.allocate_contiguous(2).unwrap().slots, vec![5, 6]);
    }

    #[test]
    fn zero_size_requests() {
        let mut pool = make_pool(2);
        assert!(pool.allocate_scattered(0).unwrap().is_empty());
        let alloc = pool.allocate_contiguous(0).unwrap();
        assert!(alloc.slots.is_empty());
        assert_eq!(pool.free_count(), 2);
        assert_eq!(pool.stats().total_allocations, 2);
    }

    #[test]
    fn release_then_double_release_fails() {
        let mut pool = make_pool(4);
        pool.add_ref(&[0, 1, 2, 3]).unwrap();
        assert_eq!(pool.free_count(), 0);

        pool.release_ref(&[0, 1, 2, 3]).unwrap();
        assert_eq!(pool.free_count(), 4);

        let err = pool.release_ref(&[0]).unwrap_err();
        assert!(matches!(
            err,
            PoolError::InvalidRelease { slot: 0, held: 0, released: 1 }
        ));
        assert_eq!(pool.ref_count(0), Some(0));
    }

    #[test]
    fn add_ref_shares_held_slots() {
        let mut pool = make_pool(4);
        let slots = pool.allocate_scattered(2).unwrap();
        assert_eq!(pool.free_count(), 2);

        // Prefix shared by a second sequence
        pool.add_ref(&slots).unwrap();
        assert_eq!(pool.free_count(), 2);
        assert_eq!(pool.ref_count(0), Some(2));

        pool.release_ref(&slots).unwrap();
        assert_eq!(pool.free_count(), 2);
        pool.release_ref(&slots).unwrap();
        assert_eq!(pool.free_count(), 4);
    }

    #[test]
    fn duplicate_indices_count_per_occurrence() {
        let mut pool = make_pool(4);
        pool.add_ref(&[1, 1, 1]).unwrap();
        assert_eq!(pool.ref_count(1), Some(3));
        assert_eq!(pool.free_count(), 3);

        pool.release_ref(&[1, 1]).unwrap();
        assert_eq!(pool.ref_count(1), Some(1));
        assert_eq!(pool.free_count(), 3);

        // Over-release is rejected as a whole
        let err = pool.release_ref(&[1, 1]).unwrap_err();
        assert!(matches!(err, PoolError::InvalidRelease { slot: 1, held: 1, released: 2 }));
        assert_eq!(pool.ref_count(1), Some(1));
    }

    #[test]
    fn failed_release_is_atomic() {
        let mut pool = make_pool(4);
        pool.add_ref(&[0, 1]).unwrap();
        assert!(pool.release_ref(&[0, 1, 2]).is_err());
        assert_eq!(pool.ref_count(0), Some(1));
        assert_eq!(pool.ref_count(1), Some(1));
        assert_eq!(pool.free_count(), 2);
    }

    #[test]
    fn out_of_range_slots() {
        let mut pool = make_pool(4);
        assert!(matches!(
            pool.add_ref(&[0, 4]),
            Err(PoolError::InvalidSlot { slot: 4, total: 4 })
        ));
        assert_eq!(pool.free_count(), 4);
        assert!(matches!(pool.release_ref(&[9]), Err(PoolError::InvalidSlot { .. })));
    }

    #[test]
    fn release_all_resets_everything() {
        let mut pool = make_pool(6);
        pool.allocate_scattered(3).unwrap();
        pool.add_ref(&[0, 0, 5]).unwrap();
        pool.release_all();
        assert_eq!(pool.free_count(), 6);
        assert!((0..6).all(|s| pool.ref_count(s) == Some(0)));
    }

    #[test]
    fn stats_track_peak() {
        let mut pool = make_pool(8);
        let a = pool.allocate_scattered(5).unwrap();
        pool.release_ref(&a).unwrap();
        pool.allocate_contiguous(2).unwrap();

        let stats = pool.stats();
        assert_eq!(stats.peak_held, 5);
        assert_eq!(stats.held_slots, 2);
        assert_eq!(stats.total_allocations, 2);
        assert_eq!(stats.total_releases, 1);
    }

    #[test]
    fn slot_rows_follow_granularity() {
        let config = CacheConfig {
            slot_granularity: 4,
            dtype: "f32".to_string(),
            ..Default::default()
        };
        let geometry = CacheGeometry::new(1, 1, 2, &config).unwrap();
        let pool = SlotPool::<f32>::new(geometry, 3).unwrap();
        assert_eq!(pool.layer(0).unwrap().rows(), 12);
        assert_eq!(pool.slot_rows(2), 8..12);
    }

    #[test]
    fn copy_slot_and_free_buffers() {
        let mut pool = make_pool(4);
        pool.layer_mut(0)
            .unwrap()
            .write_row(1, &[1.0; 8], &[2.0; 8])
            .unwrap();
        pool.copy_slot(1, 3).unwrap();
        assert_eq!(pool.layer(0).unwrap().value(3, 1)[0].to_f32(), 2.0);

        pool.free_buffers();
        assert!(pool.layer(0).is_err());
        // Slot table survives
        assert_eq!(pool.allocate_scattered(1).unwrap(), vec![0]);
    }

    #[test]
    fn shared_pool_across_threads() {
        let shared = SharedSlotPool::new(make_pool(64));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = shared.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        let slots = pool.allocate_scattered(4).unwrap();
                        pool.release_ref(&slots).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(shared.free_count(), 64);
        assert_eq!(shared.with_table(|p| p.held_count()), 0);
    }

    #[test]
    fn reading_a_layer_does_not_hold_the_table() {
        let shared = SharedSlotPool::new(make_pool(8));
        let slots = shared
            .with_layer(0, |layer| {
                assert_eq!(layer.rows(), 8);
                // Table operations proceed while the buffer is borrowed.
                let slots = shared.allocate_scattered(2).unwrap();
                shared.release_ref(&slots[..1]).unwrap();
                slots
            })
            .unwrap();
        assert_eq!(slots, vec![0, 1]);
        assert_eq!(shared.free_count(), 7);
        assert!(shared.with_table(|p| p.layer(0).is_err()));
    }

    #[test]
    fn shared_buffers_copy_and_free() {
        let shared = SharedSlotPool::new(make_pool(4));
        let keys = [1.0f32; 8];
        let values = [2.0f32; 8];
        shared
            .with_layer_mut(1, |layer| layer.write_row(0, &keys, &values))
            .unwrap()
            .unwrap();
        shared.copy_slot(0, 3).unwrap();
        let copied = shared.with_layer(1, |layer| layer.value(3, 1)[0]).unwrap();
        assert_eq!(copied, f16::from_f32(2.0));

        assert!(matches!(
            shared.copy_slot(0, 4),
            Err(PoolError::InvalidSlot { slot: 4, .. })
        ));
        shared.free_buffers();
        assert!(matches!(
            shared.with_layer(0, |_| ()),
            Err(PoolError::InvalidLayer { .. })
        ));
        assert_eq!(shared.allocate_scattered(1).unwrap(), vec![0]);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Scattered(usize),
        Contiguous(usize),
        AddRef(Vec<usize>),
        Release(Vec<usize>),
    }

    fn arb_op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0usize..6).prop_map(Op::Scattered),
            (0usize..6).prop_map(Op::Contiguous),
            prop::collection::vec(0usize..16, 0..4).prop_map(Op::AddRef),
            prop::collection::vec(0usize..16, 0..4).prop_map(Op::Release),
        ]
    }

    proptest! {
        #[test]
        fn free_count_matches_table(ops in prop::collection::vec(arb_op(), 1..40)) {
            let mut pool = make_pool(16);
            for op in ops {
                let before = pool.free_count();
                match op {
                    Op::Scattered(n) => {
                        if let Ok(slots) = pool.allocate_scattered(n) {
                            prop_assert_eq!(pool.free_count(), before - n);
                            prop_assert!(slots.iter().all(|&s| pool.ref_count(s) >= Some(1)));
                        }
                    }
                    Op::Contiguous(n) => {
                        let counts: Vec<_> = (0..16).map(|s| pool.ref_count(s)).collect();
                        if let Ok(alloc) = pool.allocate_contiguous(n) {
                            prop_assert_eq!(alloc.end - alloc.start, n);
                            for (i, &s) in alloc.slots.iter().enumerate() {
                                prop_assert_eq!(s, alloc.start + i);
                                prop_assert_eq!(counts[s], Some(0));
                            }
                            prop_assert_eq!(pool.free_count(), before - n);
                        }
                    }
                    Op::AddRef(slots) => {
                        pool.add_ref(&slots).unwrap();
                    }
                    Op::Release(slots) => {
                        let _ = pool.release_ref(&slots);
                    }
                }
                let zeros = (0..16).filter(|&s| pool.ref_count(s) == Some(0)).count();
                prop_assert_eq!(pool.free_count(), zeros);
            }
        }

        #[test]
        fn release_inverts_allocation(pre in 0usize..10, n in 0usize..6) {
            let mut pool = make_pool(16);
            pool.allocate_scattered(pre).unwrap();
            let before = pool.free_count();
            let slots = pool.allocate_scattered(n).unwrap();
            pool.release_ref(&slots).unwrap();
            prop_assert_eq!(pool.free_count(), before);
        }
    }
}
