// ── Per-source reordering buffer ──
//
// Devices number their notifications 1, 2, 3, ... per subscription. Items
// are held until every lower number from the same source was released, or
// until the oldest held item has waited a full window. Releasing past a gap
// marks the item out-of-sequence; consumers treat that as "state unknown,
// reconcile everything" rather than trying to recover what was lost.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace};

use fleetsync_api::Notification;

/// Something that carries a per-source sequence number.
pub trait SequencedItem {
    fn source(&self) -> &str;
    fn sequence(&self) -> u64;
}

impl SequencedItem for Notification {
    fn source(&self) -> &str {
        &self.serial
    }

    fn sequence(&self) -> u64 {
        self.sequence
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sequencing {
    InSequence,
    /// One or more predecessors never arrived, or the source restarted its
    /// counter.
    OutOfSequence,
}

#[derive(Debug)]
pub struct Released<T> {
    pub item: T,
    pub sequencing: Sequencing,
}

impl<T> Released<T> {
    pub fn is_in_sequence(&self) -> bool {
        self.sequencing == Sequencing::InSequence
    }
}

#[derive(Debug)]
struct SourceBuffer<T> {
    expected: u64,
    pending: BTreeMap<u64, (T, Instant)>,
}

impl<T> SourceBuffer<T> {
    fn new() -> Self {
        Self {
            expected: 1,
            pending: BTreeMap::new(),
        }
    }

    fn oldest_arrival(&self) -> Option<Instant> {
        self.pending.values().map(|(_, at)| *at).min()
    }

    fn pop_ready(&mut self, now: Instant, window: Duration) -> Option<Released<T>> {
        let (&seq, _) = self.pending.first_key_value()?;
        let sequencing = if seq == self.expected {
            Sequencing::InSequence
        } else if seq < self.expected {
            // Counter went backwards: the source restarted.
            Sequencing::OutOfSequence
        } else if self
            .oldest_arrival()
            .is_some_and(|at| now.saturating_duration_since(at) >= window)
        {
            Sequencing::OutOfSequence
        } else {
            return None;
        };
        let (item, _) = self.pending.remove(&seq)?;
        self.expected = seq + 1;
        Some(Released { item, sequencing })
    }
}

/// Ordering buffer for items from many sources.
#[derive(Debug)]
pub struct ReorderableQueue<T> {
    window: Duration,
    sources: BTreeMap<String, SourceBuffer<T>>,
}

impl<T: SequencedItem> ReorderableQueue<T> {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            sources: BTreeMap::new(),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Buffer an item. A repeated sequence number from the same source keeps
    /// the first copy.
    pub fn push(&mut self, item: T, now: Instant) {
        let buffer = self
            .sources
            .entry(item.source().to_owned())
            .or_insert_with(SourceBuffer::new);
        let seq = item.sequence();
        if buffer.pending.contains_key(&seq) {
            trace!(source = item.source(), seq, "duplicate sequence number dropped");
            return;
        }
        buffer.pending.insert(seq, (item, now));
    }

    /// Release the next deliverable item, if any.
    pub fn pop_ready(&mut self, now: Instant) -> Option<Released<T>> {
        let window = self.window;
        for (source, buffer) in &mut self.sources {
            if let Some(released) = buffer.pop_ready(now, window) {
                if !released.is_in_sequence() {
                    debug!(
                        source = %source,
                        seq = released.item.sequence(),
                        "releasing notification out of sequence"
                    );
                }
                return Some(released);
            }
        }
        None
    }

    /// Forget everything about `source` and expect its counter to restart
    /// at 1. Called when a device is (re)subscribed.
    pub fn reset_source(&mut self, source: &str) {
        self.sources.remove(source);
    }

    /// Items are buffered but none can be released yet.
    pub fn has_hidden(&self, now: Instant) -> bool {
        let window = self.window;
        let mut any = false;
        for buffer in self.sources.values() {
            let Some((&seq, _)) = buffer.pending.first_key_value() else {
                continue;
            };
            if seq <= buffer.expected {
                return false;
            }
            if buffer
                .oldest_arrival()
                .is_some_and(|at| now.saturating_duration_since(at) >= window)
            {
                return false;
            }
            any = true;
        }
        any
    }

    pub fn len(&self) -> usize {
        self.sources.values().map(|b| b.pending.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.values().all(|b| b.pending.is_empty())
    }

    /// Remove and return every buffered item, in source then sequence order.
    pub fn drain(&mut self) -> Vec<T> {
        std::mem::take(&mut self.sources)
            .into_values()
            .flat_map(|b| b.pending.into_values().map(|(item, _)| item))
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[derive(Debug, PartialEq)]
    struct Item(&'static str, u64);

    impl SequencedItem for Item {
        fn source(&self) -> &str {
            self.0
        }
        fn sequence(&self) -> u64 {
            self.1
        }
    }

    fn drain_ready(q: &mut ReorderableQueue<Item>, now: Instant) -> Vec<(u64, Sequencing)> {
        std::iter::from_fn(|| q.pop_ready(now))
            .map(|r| (r.item.1, r.sequencing))
            .collect()
    }

    #[test]
    fn reorders_shuffled_arrivals() {
        let now = Instant::now();
        let mut q = ReorderableQueue::new(Duration::from_secs(10));
        q.push(Item("A1", 3), now);
        assert!(q.pop_ready(now).is_none());
        q.push(Item("A1", 1), now);
        q.push(Item("A1", 2), now);

        assert_eq!(
            drain_ready(&mut q, now),
            vec![
                (1, Sequencing::InSequence),
                (2, Sequencing::InSequence),
                (3, Sequencing::InSequence),
            ]
        );
        assert!(q.is_empty());
    }

    #[test]
    fn gap_is_released_out_of_sequence_after_window() {
        let start = Instant::now();
        let window = Duration::from_secs(10);
        let mut q = ReorderableQueue::new(window);
        q.push(Item("A1", 1), start);
        q.push(Item("A1", 3), start);

        assert_eq!(drain_ready(&mut q, start), vec![(1, Sequencing::InSequence)]);
        assert!(q.has_hidden(start + Duration::from_secs(9)));
        assert!(q.pop_ready(start + Duration::from_secs(9)).is_none());

        let later = start + window;
        assert!(!q.has_hidden(later));
        assert_eq!(drain_ready(&mut q, later), vec![(3, Sequencing::OutOfSequence)]);

        // The counter continues from the released item.
        q.push(Item("A1", 4), later);
        assert_eq!(drain_ready(&mut q, later), vec![(4, Sequencing::InSequence)]);
    }

    #[test]
    fn sources_are_independent() {
        let now = Instant::now();
        let mut q = ReorderableQueue::new(Duration::from_secs(10));
        q.push(Item("A1", 2), now);
        q.push(Item("B2", 1), now);

        assert_eq!(drain_ready(&mut q, now), vec![(1, Sequencing::InSequence)]);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn counter_restart_is_flagged() {
        let now = Instant::now();
        let mut q = ReorderableQueue::new(Duration::from_secs(10));
        q.push(Item("A1", 1), now);
        q.push(Item("A1", 2), now);
        drain_ready(&mut q, now);

        q.push(Item("A1", 1), now);
        assert_eq!(drain_ready(&mut q, now), vec![(1, Sequencing::OutOfSequence)]);
    }

    #[test]
    fn reset_source_restarts_at_one() {
        let now = Instant::now();
        let mut q = ReorderableQueue::new(Duration::from_secs(10));
        q.push(Item("A1", 1), now);
        q.push(Item("A1", 5), now);
        drain_ready(&mut q, now);

        q.reset_source("A1");
        assert!(q.is_empty());
        q.push(Item("A1", 1), now);
        assert_eq!(drain_ready(&mut q, now), vec![(1, Sequencing::InSequence)]);
    }

    #[test]
    fn duplicates_keep_first_copy() {
        let now = Instant::now();
        let mut q = ReorderableQueue::new(Duration::from_secs(10));
        q.push(Item("A1", 2), now);
        q.push(Item("A1", 2), now);
        assert_eq!(q.len(), 1);
        assert_eq!(q.drain(), vec![Item("A1", 2)]);
    }
}
