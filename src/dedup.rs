//! Selection of not-yet-delivered rows from a statistics snapshot.
//!
//! Views keep a rolling top-N per interval, so a row is new purely by
//! recency: only the newest interval in a snapshot is a candidate, and only
//! when it closes strictly after the kind's watermark.

use chrono::{DateTime, Utc};

use crate::stats::StatRow;

/// Rows that survived filtering, and the watermark they justify.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Selection {
    /// The newest interval's rows, in source order.
    pub rows: Vec<StatRow>,
    /// Interval end to advance the watermark to once `rows` are delivered.
    /// `None` exactly when `rows` is empty.
    pub advance_to: Option<DateTime<Utc>>,
}

impl Selection {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Keeps the leading run of rows sharing the newest interval end, provided
/// that interval end is after `watermark`.
///
/// `snapshot` must be sorted by interval end, newest first.
pub fn select_new(mut snapshot: Vec<StatRow>, watermark: DateTime<Utc>) -> Selection {
    let Some(batch_end) = snapshot.first().map(StatRow::interval_end) else {
        return Selection::default();
    };

    if batch_end <= watermark {
        return Selection::default();
    }

    let cut = snapshot
        .iter()
        .position(|row| row.interval_end() != batch_end)
        .unwrap_or(snapshot.len());
    snapshot.truncate(cut);

    Selection {
        rows: snapshot,
        advance_to: Some(batch_end),
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::stats::{LockStat, QueryStat};

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, minute, 0).unwrap()
    }

    fn query(minute: u32, fingerprint: i64) -> StatRow {
        StatRow::Query(QueryStat {
            interval_end: at(minute),
            text: format!("SELECT {fingerprint}"),
            text_truncated: false,
            text_fingerprint: fingerprint,
            execution_count: 1,
            avg_latency_seconds: 0.1,
            avg_rows: 1.0,
            avg_bytes: 8.0,
            avg_rows_scanned: 1.0,
            avg_cpu_seconds: 0.01,
        })
    }

    #[test]
    fn test_empty_snapshot() {
        let selection = select_new(Vec::new(), at(0));
        assert!(selection.is_empty());
        assert_eq!(selection.advance_to, None);
    }

    #[test]
    fn test_tie_break_stops_at_older_interval() {
        let snapshot = vec![
            query(10, 1),
            query(10, 2),
            query(10, 3),
            query(9, 4),
            query(9, 5),
        ];

        let selection = select_new(snapshot, at(9));

        let fingerprints: Vec<i64> = selection
            .rows
            .iter()
            .map(|row| match row {
                StatRow::Query(q) => q.text_fingerprint,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(fingerprints, vec![1, 2, 3]);
        assert_eq!(selection.advance_to, Some(at(10)));
    }

    #[test]
    fn test_batch_at_watermark_is_not_new() {
        let selection = select_new(vec![query(10, 1), query(9, 2)], at(10));
        assert!(selection.is_empty());
        assert_eq!(selection.advance_to, None);
    }

    #[test]
    fn test_batch_before_watermark_is_not_new() {
        let selection = select_new(vec![query(8, 1)], at(10));
        assert!(selection.is_empty());
    }

    #[test]
    fn test_only_newest_interval_is_selected_after_gap() {
        // Older intervals above the watermark are still left behind: only the
        // newest batch is ever delivered.
        let selection = select_new(vec![query(12, 1), query(11, 2), query(10, 3)], at(9));
        assert_eq!(selection.rows.len(), 1);
        assert_eq!(selection.advance_to, Some(at(12)));
    }

    #[test]
    fn test_whole_snapshot_in_one_interval() {
        let snapshot = vec![
            StatRow::Lock(LockStat {
                interval_end: at(5),
                row_range_start_key: b"a".to_vec(),
                lock_wait_seconds: 1.0,
                sample_lock_requests: Vec::new(),
            }),
            StatRow::Lock(LockStat {
                interval_end: at(5),
                row_range_start_key: b"b".to_vec(),
                lock_wait_seconds: 2.0,
                sample_lock_requests: Vec::new(),
            }),
        ];
        let selection = select_new(snapshot, at(4));
        assert_eq!(selection.rows.len(), 2);
        assert_eq!(selection.advance_to, Some(at(5)));
    }

    #[test]
    fn test_fresh_start_catches_previous_interval() {
        let now = at(30);
        let period = std::time::Duration::from_secs(60);
        let tracker = crate::watermark::WatermarkTracker::starting_at(
            &[crate::stats::StatKind::Query],
            now,
            period,
        );
        let watermark = tracker
            .get(crate::stats::StatKind::Query)
            .expect("query is tracked");

        let selection = select_new(vec![query(29, 1)], watermark);
        assert_eq!(selection.rows.len(), 1);
        assert_eq!(selection.advance_to, Some(at(29)));
    }
}
