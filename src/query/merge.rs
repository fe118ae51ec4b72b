//! K-way merge of per-series observation streams.
//!
//! Each selected series yields observations in phenomenon-time order; the
//! merge interleaves any number of such streams into one globally ordered
//! stream using a min-heap primed with one entry per source. Ties on
//! phenomenon time break deterministically by (stream id, foi id), then by
//! source position, so repeated queries return identical orderings.
//!
//! Sources are pulled lazily: each emitted entry refills the heap with at
//! most one element from the source it came from, so early termination
//! (limits, dropped iterators) never drains the underlying cursors.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::model::{ObsId, Observation};

/// A per-series stream of decoded observation entries.
pub type ObsEntryIter = Box<dyn Iterator<Item = Result<(ObsId, Observation)>> + Send>;

struct HeapEntry {
    phenomenon_time: DateTime<Utc>,
    stream_id: u64,
    foi_id: u64,
    source_index: usize,
    entry: (ObsId, Observation),
}

impl HeapEntry {
    fn order_key(&self) -> (DateTime<Utc>, u64, u64, usize) {
        (self.phenomenon_time, self.stream_id, self.foi_id, self.source_index)
    }
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.order_key() == other.order_key()
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed for min-heap behavior
        self.order_key().cmp(&other.order_key()).reverse()
    }
}

/// Merges per-series streams into one stream ordered by phenomenon time.
pub struct MergeIterator {
    sources: Vec<ObsEntryIter>,
    heap: BinaryHeap<HeapEntry>,
    pending_error: Option<Error>,
    done: bool,
}

impl MergeIterator {
    pub fn new(mut sources: Vec<ObsEntryIter>) -> Self {
        let mut heap = BinaryHeap::with_capacity(sources.len());
        let mut pending_error = None;

        // Prime the heap with the head of each source
        for (source_index, source) in sources.iter_mut().enumerate() {
            match source.next() {
                Some(Ok(entry)) => heap.push(Self::heap_entry(source_index, entry)),
                Some(Err(e)) => {
                    pending_error = Some(e);
                    break;
                }
                None => {}
            }
        }

        Self { sources, heap, pending_error, done: false }
    }

    fn heap_entry(source_index: usize, entry: (ObsId, Observation)) -> HeapEntry {
        HeapEntry {
            phenomenon_time: entry.1.phenomenon_time,
            stream_id: entry.1.stream_id,
            foi_id: entry.1.foi_id,
            source_index,
            entry,
        }
    }
}

impl Iterator for MergeIterator {
    type Item = Result<(ObsId, Observation)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if let Some(e) = self.pending_error.take() {
            self.done = true;
            self.heap.clear();
            return Some(Err(e));
        }
        let head = match self.heap.pop() {
            Some(head) => head,
            None => {
                self.done = true;
                return None;
            }
        };

        // Refill from the source the head came from
        match self.sources[head.source_index].next() {
            Some(Ok(entry)) => self.heap.push(Self::heap_entry(head.source_index, entry)),
            Some(Err(e)) => self.pending_error = Some(e),
            None => {}
        }

        Some(Ok(head.entry))
    }
}
