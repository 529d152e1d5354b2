//! Acknowledgement watermark
//!
//! Events are numbered as they enter the channel. Importers acknowledge
//! them out of order across partitions; the committed position only ever
//! moves to the position of the highest contiguously acknowledged event, so
//! persisting it never skips an event that has not been applied yet.

use std::collections::BTreeMap;

use crate::position::Position;

#[derive(Debug)]
struct Pending {
    position: Position,
    acked: bool,
}

/// Tracks in-flight events and the committed position
#[derive(Debug, Default)]
pub struct AckTracker {
    next_seq: u64,
    pending: BTreeMap<u64, Pending>,
    committed: Option<Position>,
    acked_data: u64,
}

impl AckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a previously persisted position
    pub fn with_committed(position: Option<Position>) -> Self {
        Self {
            committed: position,
            ..Self::default()
        }
    }

    /// Number an event entering the channel
    pub fn register(&mut self, position: Position) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending.insert(
            seq,
            Pending {
                position,
                acked: false,
            },
        );
        seq
    }

    /// Mark events as applied and advance the watermark
    pub fn ack(&mut self, seqs: &[u64], data_records: u64) {
        for seq in seqs {
            if let Some(pending) = self.pending.get_mut(seq) {
                pending.acked = true;
            }
        }
        self.acked_data += data_records;

        while let Some(entry) = self.pending.first_entry() {
            if !entry.get().acked {
                break;
            }
            let pending = entry.remove();
            self.committed = Some(pending.position);
        }
    }

    /// Position of the highest contiguously applied event
    pub fn committed(&self) -> Option<&Position> {
        self.committed.as_ref()
    }

    /// Applied row events since construction
    pub fn acked_data(&self) -> u64 {
        self.acked_data
    }

    /// Events registered but not yet committed
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::WalPosition;

    fn wal(lsn: u64) -> Position {
        Position::Wal(WalPosition(lsn))
    }

    #[test]
    fn test_watermark_waits_for_gaps() {
        let mut tracker = AckTracker::new();
        let a = tracker.register(wal(10));
        let b = tracker.register(wal(20));
        let c = tracker.register(wal(30));

        tracker.ack(&[b, c], 2);
        assert_eq!(tracker.committed(), None);
        assert_eq!(tracker.in_flight(), 3);

        tracker.ack(&[a], 1);
        assert_eq!(tracker.committed(), Some(&wal(30)));
        assert_eq!(tracker.in_flight(), 0);
        assert_eq!(tracker.acked_data(), 3);
    }

    #[test]
    fn test_resumed_tracker_keeps_start() {
        let mut tracker = AckTracker::with_committed(Some(wal(5)));
        let seq = tracker.register(wal(6));
        assert_eq!(tracker.committed(), Some(&wal(5)));
        tracker.ack(&[seq], 0);
        assert_eq!(tracker.committed(), Some(&wal(6)));
    }

    #[test]
    fn test_unknown_ack_ignored() {
        let mut tracker = AckTracker::new();
        tracker.ack(&[42], 0);
        assert_eq!(tracker.committed(), None);
    }
}
