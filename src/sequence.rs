//! Lock-light shared sample storage.
//!
//! Decoding runs on a worker thread while readers poll for progress, so
//! sample storage has to be readable mid-append without blocking the writer.
//! Samples live in a block of `AtomicU64` slots holding `f64` bit patterns.
//! The writer fills slots first and publishes the new length with a release
//! store afterwards; a reader that observes length `n` with an acquire load
//! is guaranteed slots `0..n` are fully written. Growth never mutates a
//! published block: the writer copies into a larger block and swaps it in,
//! bumping a generation counter so readers can tell a swap happened.

use std::sync::{
    atomic::{AtomicU64, AtomicUsize, Ordering},
    Arc, PoisonError, RwLock,
};

const INITIAL_CAPACITY: usize = 1024;

#[derive(Debug)]
struct Shared {
    /// Current storage block. Swapped wholesale on growth, never shrunk.
    block: RwLock<Arc<Vec<AtomicU64>>>,
    /// Number of published samples. Slots beyond it may hold garbage.
    len: AtomicUsize,
    /// Incremented on every block swap.
    generation: AtomicU64,
    /// Running aggregates as f64 bits; valid once `len > 0`.
    min: AtomicU64,
    max: AtomicU64,
}

fn new_block(capacity: usize) -> Arc<Vec<AtomicU64>> {
    Arc::new((0..capacity).map(|_| AtomicU64::new(0)).collect())
}

/// One channel's growable sample sequence.
///
/// Construction site; hand the [`SequenceWriter`] to the decoder and clone
/// [`SequenceReader`]s freely.
pub struct SampleSequence {
    shared: Arc<Shared>,
}

impl SampleSequence {
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_CAPACITY)
    }

    /// Pre-size for a known row count so decoding never reallocates.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                block: RwLock::new(new_block(capacity.max(1))),
                len: AtomicUsize::new(0),
                generation: AtomicU64::new(0),
                min: AtomicU64::new(f64::INFINITY.to_bits()),
                max: AtomicU64::new(f64::NEG_INFINITY.to_bits()),
            }),
        }
    }

    pub fn writer(&self) -> SequenceWriter {
        SequenceWriter {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn reader(&self) -> SequenceReader {
        SequenceReader {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Default for SampleSequence {
    fn default() -> Self {
        Self::new()
    }
}

/// Appending side; one per sequence.
pub struct SequenceWriter {
    shared: Arc<Shared>,
}

impl SequenceWriter {
    pub fn push(&mut self, value: f64) {
        let len = self.shared.len.load(Ordering::Relaxed);
        let block = self.read_block();
        let block = if len == block.len() {
            self.grow(&block, len)
        } else {
            block
        };

        // Slot first, then the release store that publishes it.
        block[len].store(value.to_bits(), Ordering::Relaxed);
        self.shared.len.store(len + 1, Ordering::Release);

        self.fold_min_max(value);
    }

    pub fn extend(&mut self, values: impl IntoIterator<Item = f64>) {
        for v in values {
            self.push(v);
        }
    }

    pub fn len(&self) -> usize {
        self.shared.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read_block(&self) -> Arc<Vec<AtomicU64>> {
        Arc::clone(
            &self
                .shared
                .block
                .read()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }

    fn grow(&self, old: &[AtomicU64], len: usize) -> Arc<Vec<AtomicU64>> {
        let bigger = new_block((old.len() * 2).max(1));
        for (dst, src) in bigger.iter().zip(&old[..len]) {
            dst.store(src.load(Ordering::Relaxed), Ordering::Relaxed);
        }
        let mut slot = self
            .shared
            .block
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *slot = Arc::clone(&bigger);
        self.shared.generation.fetch_add(1, Ordering::Release);
        bigger
    }

    fn fold_min_max(&self, value: f64) {
        if value.is_nan() {
            return;
        }
        // Single-writer, so plain load/store per aggregate is race-free.
        let min = f64::from_bits(self.shared.min.load(Ordering::Relaxed));
        if value < min {
            self.shared.min.store(value.to_bits(), Ordering::Relaxed);
        }
        let max = f64::from_bits(self.shared.max.load(Ordering::Relaxed));
        if value > max {
            self.shared.max.store(value.to_bits(), Ordering::Relaxed);
        }
    }
}

/// Reading side; clone freely across threads.
#[derive(Debug, Clone)]
pub struct SequenceReader {
    shared: Arc<Shared>,
}

impl SequenceReader {
    /// Samples published so far. Monotonically non-decreasing.
    pub fn len(&self) -> usize {
        self.shared.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sample `i`, or `None` past the published length.
    pub fn value_at(&self, i: usize) -> Option<f64> {
        if i >= self.len() {
            return None;
        }
        let block = self
            .shared
            .block
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        Some(f64::from_bits(block[i].load(Ordering::Relaxed)))
    }

    /// Snapshot of every published sample.
    pub fn values(&self) -> Vec<f64> {
        let len = self.len();
        let block = Arc::clone(
            &self
                .shared
                .block
                .read()
                .unwrap_or_else(PoisonError::into_inner),
        );
        block[..len]
            .iter()
            .map(|slot| f64::from_bits(slot.load(Ordering::Relaxed)))
            .collect()
    }

    /// Smallest non-NaN sample, `None` while empty.
    pub fn min(&self) -> Option<f64> {
        if self.is_empty() {
            return None;
        }
        Some(f64::from_bits(self.shared.min.load(Ordering::Relaxed)))
    }

    /// Largest non-NaN sample, `None` while empty.
    pub fn max(&self) -> Option<f64> {
        if self.is_empty() {
            return None;
        }
        Some(f64::from_bits(self.shared.max.load(Ordering::Relaxed)))
    }

    /// Changes whenever the storage block is swapped for a larger one.
    pub fn generation(&self) -> u64 {
        self.shared.generation.load(Ordering::Acquire)
    }
}
