//! Global sequence reservation.

use crate::errors::StoreResult;
use crate::store::EventStore;
use crate::types::Sequence;
use std::collections::VecDeque;
use std::sync::Arc;

/// An ordered block of reserved sequence numbers, consumed exactly once.
///
/// Numbers are reserved in increasing order but may commit out of order when
/// the owning transactions commit out of order.
#[derive(Debug, Clone, Default)]
pub struct SequenceBlock {
    numbers: VecDeque<Sequence>,
}

impl SequenceBlock {
    /// Builds a block from already-reserved values, preserving their order.
    pub fn new(numbers: impl IntoIterator<Item = Sequence>) -> Self {
        Self {
            numbers: numbers.into_iter().collect(),
        }
    }

    /// Takes the next reserved number.
    pub fn pop(&mut self) -> Option<Sequence> {
        self.numbers.pop_front()
    }

    /// Remaining unconsumed numbers.
    pub fn len(&self) -> usize {
        self.numbers.len()
    }

    /// Whether every reserved number has been consumed.
    pub fn is_empty(&self) -> bool {
        self.numbers.is_empty()
    }
}

/// Reserves contiguous-by-reservation blocks of sequence numbers from the
/// backing store's monotonic counter, one round trip per block.
#[derive(Debug, Clone)]
pub struct SequenceAllocator<S> {
    store: Arc<S>,
}

impl<S: EventStore> SequenceAllocator<S> {
    /// Creates an allocator for the given store.
    pub const fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Reserves `count` sequence numbers.
    pub async fn reserve(&self, count: usize) -> StoreResult<SequenceBlock> {
        if count == 0 {
            return Ok(SequenceBlock::default());
        }
        self.store.reserve_sequences(count).await
    }
}
