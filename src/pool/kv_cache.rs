//! Per-sequence slot tables built on top of the slot pool.
//!
//! Each sequence owns an ordered list of slots. A prompt is placed in one
//! contiguous run when the pool can find one; decode steps grow the list one
//! slot at a time from wherever space is free. Forks share the parent's slots
//! by reference count. When a sequence finishes, its references return to
//! the pool.
//!
//! [`SequenceCache::span`] turns a slot list into the [`KvSpan`] the decode
//! attention reducer reads through.

use super::buffer::KvElement;
use super::{PoolError, SlotPool};
use crate::attention::KvSpan;
use crate::config::ConfigError;
use crate::planner::CacheGeometry;
use std::collections::HashMap;
use tracing::debug;

/// Identifies a sequence within the KV cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SeqId(pub u32);

#[derive(Debug, Clone)]
struct SequenceState {
    /// Slots holding this sequence's tokens, in token order.
    slots: Vec<usize>,
    /// Number of tokens currently stored.
    num_tokens: usize,
}

/// Slot tables for every live sequence.
///
/// Built for one pool geometry. Every call that takes a pool checks that the
/// pool groups tokens into slots the same way.
#[derive(Debug)]
pub struct SequenceCache {
    /// Tokens per slot, taken from the pool geometry.
    granularity: usize,
    sequences: HashMap<SeqId, SequenceState>,
    next_seq_id: u32,
}

impl SequenceCache {
    pub fn new(geometry: &CacheGeometry) -> Result<Self, ConfigError> {
        if geometry.slot_granularity == 0 {
            return Err(ConfigError::InvalidGeometry(
                "slot granularity must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            granularity: geometry.slot_granularity,
            sequences: HashMap::new(),
            next_seq_id: 0,
        })
    }

    /// A cache matching `pool`'s geometry.
    pub fn for_pool<T: KvElement>(pool: &SlotPool<T>) -> Result<Self, ConfigError> {
        Self::new(pool.geometry())
    }

    /// Register a sequence with room for `prompt_len` tokens.
    ///
    /// Tries a contiguous run first so the reducer can scan the prompt
    /// linearly; falls back to scattered slots when the pool is fragmented.
    pub fn add_sequence<T: KvElement>(
        &mut self,
        prompt_len: usize,
        pool: &mut SlotPool<T>,
    ) -> Result<SeqId, PoolError> {
        self.check_pool(pool)?;
        let need = self.slots_for_tokens(prompt_len);
        let slots = match pool.allocate_contiguous(need) {
            Ok(alloc) => alloc.slots,
            Err(PoolError::Exhausted { .. }) if pool.free_count() >= need => {
                debug!(need, "no contiguous run for prompt, using scattered slots");
                pool.allocate_scattered(need)?
            }
            Err(e) => return Err(e),
        };

        let state = SequenceState {
            slots,
            num_tokens: prompt_len,
        };
        self.insert(state, pool)
    }

    /// Remove a sequence, releasing its slot references.
    pub fn remove_sequence<T: KvElement>(
        &mut self,
        id: SeqId,
        pool: &mut SlotPool<T>,
    ) -> Result<(), PoolError> {
        self.check_pool(pool)?;
        let state = self
            .sequences
            .remove(&id)
            .ok_or(PoolError::UnknownSequence(id))?;

        pool.release_ref(&state.slots)
    }

    /// Record that `n` new tokens were added to a sequence, taking more slots
    /// when the current ones are full.
    pub fn append_tokens<T: KvElement>(
        &mut self,
        id: SeqId,
        n: usize,
        pool: &mut SlotPool<T>,
    ) -> Result<(), PoolError> {
        self.check_pool(pool)?;
        let granularity = self.granularity;
        let state = self.state_mut(id)?;
        let new_total = state.num_tokens + n;
        let slots_needed = new_total.div_ceil(granularity);

        if slots_needed > state.slots.len() {
            let extra = pool.allocate_scattered(slots_needed - state.slots.len())?;
            state.slots.extend(extra);
        }
        state.num_tokens = new_total;
        Ok(())
    }

    /// Branch a sequence. The child shares every full slot of the parent; a
    /// partly filled last slot is copied into a fresh slot so the two
    /// branches can keep appending independently.
    pub fn fork<T: KvElement>(
        &mut self,
        id: SeqId,
        pool: &mut SlotPool<T>,
    ) -> Result<SeqId, PoolError> {
        self.check_pool(pool)?;
        let parent = self.state(id)?.clone();
        let full = parent.num_tokens / self.granularity;
        let shared = &parent.slots[..full];

        let mut slots = shared.to_vec();
        if let Some(&partial) = parent.slots.get(full) {
            if parent.num_tokens % self.granularity != 0 {
                let fresh = pool.allocate_scattered(1)?;
                if let Err(e) = pool.copy_slot(partial, fresh[0]) {
                    pool.release_ref(&fresh)?;
                    return Err(e);
                }
                slots.extend(fresh);
            }
        }
        pool.add_ref(shared)?;

        let state = SequenceState {
            slots,
            num_tokens: parent.num_tokens,
        };
        self.insert(state, pool)
    }

    /// Number of tokens in a sequence.
    pub fn seq_len(&self, id: SeqId) -> Option<usize> {
        self.state(id).ok().map(|s| s.num_tokens)
    }

    /// Slots held by a sequence, in token order.
    pub fn slots(&self, id: SeqId) -> Option<&[usize]> {
        self.state(id).ok().map(|s| s.slots.as_slice())
    }

    /// Buffer row holding token `pos` of a sequence.
    pub fn token_row(&self, id: SeqId, pos: usize) -> Option<usize> {
        let state = self.state(id).ok()?;
        if pos >= state.num_tokens {
            return None;
        }
        let slot = state.slots[pos / self.granularity];
        Some(slot * self.granularity + pos % self.granularity)
    }

    /// How the reducer should address a sequence's tokens.
    pub fn span(&self, id: SeqId) -> Option<KvSpan> {
        let state = self.state(id).ok()?;
        let g = self.granularity;
        let contiguous = state.slots.windows(2).all(|w| w[1] == w[0] + 1);

        if contiguous {
            let start_row = state.slots.first().map_or(0, |&s| s * g);
            Some(KvSpan::Contiguous {
                start_row,
                len: state.num_tokens,
            })
        } else {
            let rows = (0..state.num_tokens)
                .map(|pos| state.slots[pos / g] * g + pos % g)
                .collect();
            Some(KvSpan::Indexed(rows))
        }
    }

    /// Spans for a decode batch, in batch order.
    pub fn build_spans(&self, seq_ids: &[SeqId]) -> Option<Vec<KvSpan>> {
        seq_ids.iter().map(|&id| self.span(id)).collect()
    }

    /// Slot references held across all sequences (shared slots count once
    /// per holder).
    pub fn total_slots_held(&self) -> usize {
        self.sequences.values().map(|s| s.slots.len()).sum()
    }

    /// Number of live sequences.
    pub fn num_sequences(&self) -> usize {
        self.sequences.len()
    }

    pub fn granularity(&self) -> usize {
        self.granularity
    }

    fn slots_for_tokens(&self, tokens: usize) -> usize {
        tokens.div_ceil(self.granularity)
    }

    fn check_pool<T: KvElement>(&self, pool: &SlotPool<T>) -> Result<(), PoolError> {
        let pool_granularity = pool.geometry().slot_granularity;
        if pool_granularity != self.granularity {
            return Err(ConfigError::InvalidGeometry(format!(
                "sequence cache groups {} tokens per slot but the pool groups {pool_granularity}",
                self.granularity
            ))
            .into());
        }
        Ok(())
    }

    /// Store `state` under a fresh id. If no id is left, the slots are handed
    /// back to the pool.
    fn insert<T: KvElement>(
        &mut self,
        state: SequenceState,
        pool: &mut SlotPool<T>,
    ) -> Result<SeqId, PoolError> {
        let Some(next) = self.next_seq_id.checked_add(1) else {
            pool.release_ref(&state.slots)?;
            return Err(PoolError::SequenceIdsExhausted);
        };
        let id = SeqId(self.next_seq_id);
        self.next_seq_id = next;
        self.sequences.insert(id, state);
        Ok(id)
    }

    fn state(&self, id: SeqId) -> Result<&SequenceState, PoolError> {
        self.sequences
            .get(&id)
            .ok_or(PoolError::UnknownSequence(id))
    }

    fn state_mut(&mut self, id: SeqId) -> Result<&mut SequenceState, PoolError> {
        self.sequences
            .get_mut(&id)
            .ok_or(PoolError::UnknownSequence(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;

    fn make_pool_and_cache(slots: usize, granularity: usize) -> (SlotPool<f32>, SequenceCache) {
        let config = CacheConfig {
            slot_granularity: granularity,
            dtype: "float32".to_string(),
            ..Default::default()
        };
        let geometry = CacheGeometry::new(1, 1, 2, &config).unwrap();
        let pool = SlotPool::new(geometry, slots).expect("Failed to create pool");
        let cache = SequenceCache::for_pool(&pool).unwrap();
        (pool, cache)
    }

    #[test]
    fn add_and_remove_sequence() {
        let (mut pool, mut cache) = make_pool_and_cache(16, 1);

        let seq = cache.add_sequence(5, &mut pool).unwrap();
        assert_eq!(cache.num_sequences(), 1);
        assert_eq!(cache.seq_len(seq), Some(5));
        assert_eq!(cache.slots(seq), Some([0, 1, 2, 3, 4].as_slice()));
        assert_eq!(pool.free_count(), 11);

        cache.remove_sequence(seq, &mut pool).unwrap();
        assert_eq!(cache.num_sequences(), 0);
        assert_eq!(pool.free_count(), 16);

        let err = cache.remove_sequence(seq, &mut pool).unwrap_err();
        assert!(matches!(err, PoolError::UnknownSequence(_)));
    }

    #[test]
    fn prompt_span_is_contiguous() {
        let (mut pool, mut cache) = make_pool_and_cache(16, 1);
        cache.add_sequence(2, &mut pool).unwrap();
        let seq = cache.add_sequence(4, &mut pool).unwrap();
        assert_eq!(
            cache.span(seq),
            Some(KvSpan::Contiguous { start_row: 2, len: 4 })
        );
    }

    #[test]
    fn decode_growth_after_neighbour_becomes_indexed() {
        let (mut pool, mut cache) = make_pool_and_cache(16, 1);
        let a = cache.add_sequence(3, &mut pool).unwrap(); // slots 0..3
        let b = cache.add_sequence(2, &mut pool).unwrap(); // slots 3..5

        cache.append_tokens(a, 1, &mut pool).unwrap(); // slot 5
        assert_eq!(cache.slots(a), Some([0, 1, 2, 5].as_slice()));
        assert_eq!(cache.span(a), Some(KvSpan::Indexed(vec![0, 1, 2, 5])));
        assert_eq!(cache.token_row(a, 3), Some(5));
        assert_eq!(cache.token_row(a, 4), None);

        let spans = cache.build_spans(&[a, b]).unwrap();
        assert_eq!(spans[1], KvSpan::Contiguous { start_row: 3, len: 2 });
    }

    #[test]
    fn fragmented_pool_falls_back_to_scattered() {
        let (mut pool, mut cache) = make_pool_and_cache(6, 1);
        pool.allocate_scattered(6).unwrap();
        pool.release_ref(&[0, 2, 4]).unwrap();

        let seq = cache.add_sequence(3, &mut pool).unwrap();
        assert_eq!(cache.slots(seq), Some([0, 2, 4].as_slice()));
        assert_eq!(pool.free_count(), 0);

        let err = cache.add_sequence(1, &mut pool).unwrap_err();
        assert!(matches!(err, PoolError::Exhausted { .. }));
    }

    #[test]
    fn granularity_groups_tokens() {
        let (mut pool, mut cache) = make_pool_and_cache(8, 4);
        let seq = cache.add_sequence(5, &mut pool).unwrap();
        // ceil(5 / 4) = 2 slots
        assert_eq!(cache.slots(seq), Some([0, 1].as_slice()));

        cache.append_tokens(seq, 3, &mut pool).unwrap(); // 8 tokens, still 2 slots
        assert_eq!(cache.slots(seq).unwrap().len(), 2);
        cache.append_tokens(seq, 1, &mut pool).unwrap(); // 9 tokens, 3 slots
        assert_eq!(cache.slots(seq).unwrap().len(), 3);
        assert_eq!(cache.token_row(seq, 8), Some(8));
        assert_eq!(
            cache.span(seq),
            Some(KvSpan::Contiguous { start_row: 0, len: 9 })
        );
    }

    #[test]
    fn fork_shares_prefix() {
        let (mut pool, mut cache) = make_pool_and_cache(16, 1);
        let parent = cache.add_sequence(4, &mut pool).unwrap();
        let child = cache.fork(parent, &mut pool).unwrap();

        assert_eq!(cache.slots(child), cache.slots(parent));
        assert_eq!(pool.free_count(), 12);
        assert_eq!(pool.ref_count(0), Some(2));

        cache.append_tokens(child, 1, &mut pool).unwrap();
        assert_eq!(cache.slots(child).unwrap()[4], 4);

        cache.remove_sequence(parent, &mut pool).unwrap();
        assert_eq!(pool.ref_count(0), Some(1));
        cache.remove_sequence(child, &mut pool).unwrap();
        assert_eq!(pool.free_count(), 16);
    }

    #[test]
    fn fork_copies_partial_slot() {
        let (mut pool, mut cache) = make_pool_and_cache(8, 4);
        let parent = cache.add_sequence(6, &mut pool).unwrap(); // slots [0, 1], slot 1 half full
        pool.layer_mut(0)
            .unwrap()
            .write_row(5, &[1.5, 2.5], &[3.5, 4.5])
            .unwrap();

        let child = cache.fork(parent, &mut pool).unwrap();
        assert_eq!(cache.slots(child), Some([0, 2].as_slice()));
        assert_eq!(pool.ref_count(0), Some(2));
        assert_eq!(pool.ref_count(1), Some(1));

        let row = cache.token_row(child, 5).unwrap();
        assert_eq!(row, 9);
        assert_eq!(pool.layer(0).unwrap().value(row, 0), &[3.5, 4.5]);
    }

    #[test]
    fn granularity_must_match_pool() {
        let (mut pool, _) = make_pool_and_cache(16, 1);
        let mut geometry = pool.geometry().clone();
        geometry.slot_granularity = 4;
        let mut cache = SequenceCache::new(&geometry).unwrap();

        let err = cache.add_sequence(6, &mut pool).unwrap_err();
        assert!(matches!(err, PoolError::Config(ConfigError::InvalidGeometry(_))));
        assert_eq!(pool.free_count(), 16);
        assert_eq!(cache.num_sequences(), 0);

        // A cache built from the pool agrees with it: six tokens take six
        // slots and the last row belongs to a held slot.
        let mut cache = SequenceCache::for_pool(&pool).unwrap();
        let seq = cache.add_sequence(6, &mut pool).unwrap();
        let row = cache.token_row(seq, 5).unwrap();
        assert_eq!(pool.ref_count(row), Some(1));
        pool.layer_mut(0).unwrap().write_row(row, &[5.0, 0.0], &[5.0, 0.0]).unwrap();

        let child = cache.fork(seq, &mut pool).unwrap();
        let child_row = cache.token_row(child, 5).unwrap();
        assert_eq!(pool.layer(0).unwrap().value(child_row, 0), &[5.0, 0.0]);
    }

    #[test]
    fn zero_granularity_is_rejected() {
        let (pool, _) = make_pool_and_cache(4, 1);
        let mut geometry = pool.geometry().clone();
        geometry.slot_granularity = 0;
        assert!(matches!(
            SequenceCache::new(&geometry),
            Err(ConfigError::InvalidGeometry(_))
        ));
    }

    #[test]
    fn removed_sequences_leave_no_entry() {
        let (mut pool, mut cache) = make_pool_and_cache(4, 1);
        for _ in 0..100 {
            let seq = cache.add_sequence(2, &mut pool).unwrap();
            cache.remove_sequence(seq, &mut pool).unwrap();
        }
        assert_eq!(cache.sequences.len(), 0);
        assert_eq!(pool.free_count(), 4);
    }

    #[test]
    fn exhausted_ids_return_slots() {
        let (mut pool, mut cache) = make_pool_and_cache(4, 1);
        let live = cache.add_sequence(1, &mut pool).unwrap();
        cache.next_seq_id = u32::MAX;

        let err = cache.add_sequence(2, &mut pool).unwrap_err();
        assert!(matches!(err, PoolError::SequenceIdsExhausted));
        assert_eq!(pool.free_count(), 3);
        assert_eq!(cache.seq_len(live), Some(1));
        assert_eq!(cache.num_sequences(), 1);
    }

    #[test]
    fn empty_prompt_has_empty_span() {
        let (mut pool, mut cache) = make_pool_and_cache(4, 1);
        let seq = cache.add_sequence(0, &mut pool).unwrap();
        assert_eq!(pool.free_count(), 4);
        let span = cache.span(seq).unwrap();
        assert!(span.is_empty());
        assert_eq!(cache.total_slots_held(), 0);
    }
}
