use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::stats::StatKind;

/// Latest fully-delivered interval end, per statistic kind.
///
/// Values only move forward. All kinds are registered at construction, before
/// any tick runs; afterwards each kind is advanced only by the task handling
/// that kind, so the tracker itself needs no interior locking.
#[derive(Debug, Clone)]
pub struct WatermarkTracker {
    marks: HashMap<StatKind, DateTime<Utc>>,
}

impl WatermarkTracker {
    /// Registers every kind with the same starting watermark.
    pub fn new(kinds: &[StatKind], initial: DateTime<Utc>) -> Self {
        let marks = kinds.iter().map(|kind| (*kind, initial)).collect();
        Self { marks }
    }

    /// Starts every kind at `now - 2 * period`, so the first tick picks up the
    /// interval that closed just before startup without replaying history.
    pub fn starting_at(kinds: &[StatKind], now: DateTime<Utc>, period: Duration) -> Self {
        let lookback = chrono::Duration::from_std(period * 2).unwrap_or(chrono::Duration::zero());
        Self::new(kinds, now - lookback)
    }

    /// Current watermark for `kind`, if it is tracked.
    pub fn get(&self, kind: StatKind) -> Option<DateTime<Utc>> {
        self.marks.get(&kind).copied()
    }

    /// Moves the watermark for `kind` to `to` if that is strictly later.
    ///
    /// Returns whether the watermark changed. Untracked kinds are ignored.
    pub fn advance(&mut self, kind: StatKind, to: DateTime<Utc>) -> bool {
        match self.marks.get_mut(&kind) {
            Some(current) if to > *current => {
                *current = to;
                true
            }
            _ => false,
        }
    }

    /// Tracked kinds, in stable order.
    pub fn kinds(&self) -> Vec<StatKind> {
        let mut kinds: Vec<StatKind> = self.marks.keys().copied().collect();
        kinds.sort();
        kinds
    }
}
