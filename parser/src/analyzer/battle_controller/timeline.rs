//! The snapshot timeline: an ordered mapping from remaining-seconds tick
//! keys to sealed snapshots. Insertion order is chronological (remaining
//! time descends over a battle), and the last entry is the battle end.

use serde::{Deserialize, Serialize};

use super::model::Snapshot;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineEntry {
    /// Remaining battle time in whole seconds.
    pub remaining: i64,
    pub snapshot: Snapshot,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Timeline {
    entries: Vec<TimelineEntry>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seals a snapshot under a tick key. Two ticks rounding to the same
    /// remaining second keep the latest snapshot in place.
    pub fn push(&mut self, remaining: i64, snapshot: Snapshot) {
        if let Some(last) = self.entries.last_mut() {
            if last.remaining == remaining {
                last.snapshot = snapshot;
                return;
            }
        }
        self.entries.push(TimelineEntry {
            remaining,
            snapshot,
        });
    }

    pub fn iter(&self) -> impl Iterator<Item = &TimelineEntry> {
        self.entries.iter()
    }

    pub fn get(&self, index: usize) -> Option<&TimelineEntry> {
        self.entries.get(index)
    }

    pub fn first(&self) -> Option<&TimelineEntry> {
        self.entries.first()
    }

    pub fn last(&self) -> Option<&TimelineEntry> {
        self.entries.last()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insertion_order_is_chronological() {
        let mut timeline = Timeline::new();
        timeline.push(1200, Snapshot::default());
        timeline.push(1199, Snapshot::default());
        timeline.push(1198, Snapshot::default());

        let keys: Vec<i64> = timeline.iter().map(|e| e.remaining).collect();
        assert_eq!(keys, vec![1200, 1199, 1198]);
        assert_eq!(timeline.last().unwrap().remaining, 1198);
    }

    #[test]
    fn duplicate_key_keeps_latest() {
        let mut timeline = Timeline::new();
        let mut snap = Snapshot::default();
        snap.damage = 100;
        timeline.push(900, snap);

        let mut snap = Snapshot::default();
        snap.damage = 250;
        timeline.push(900, snap);

        assert_eq!(timeline.len(), 1);
        assert_eq!(timeline.first().unwrap().snapshot.damage, 250);
    }
}
