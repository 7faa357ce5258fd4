//! Fixed-size crawl windows and the cursor that follows each unit of work.

use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};
use stockpipe_core::checkpoint::Checkpoint;

/// An inclusive date range; the last window is cut at `today`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub start: NaiveDate,
    pub end: NaiveDate,
    /// The window reaches today, so more bars may still arrive for it.
    pub open: bool,
}

impl Window {
    pub fn start_datetime(&self) -> NaiveDateTime {
        self.start.and_time(NaiveTime::MIN)
    }
}

/// Windows of `days` days from `start` up to and including `today`.
pub fn windows(start: NaiveDate, days: u32, today: NaiveDate) -> Vec<Window> {
    let step = Duration::days(i64::from(days.max(1)));
    let mut out = Vec::new();
    let mut cursor = start;
    while cursor <= today {
        let full_end = cursor + step - Duration::days(1);
        let end = full_end.min(today);
        out.push(Window {
            start: cursor,
            end,
            open: full_end >= today,
        });
        cursor += step;
    }
    out
}

/// Cursor to persist once `symbols[index]` of `window` is done.
///
/// Advances to the next symbol, then to the first symbol of the next window.
/// A finished open window keeps its own start so the next run crawls it again.
pub fn next_checkpoint(
    window: &Window,
    days: u32,
    symbols: &[String],
    index: usize,
) -> Option<Checkpoint> {
    if let Some(next) = symbols.get(index + 1) {
        return Some(Checkpoint::new(window.start_datetime(), next.as_str()));
    }
    let first = symbols.first()?;
    let start = if window.open {
        window.start
    } else {
        window.start + Duration::days(i64::from(days.max(1)))
    };
    Some(Checkpoint::new(start.and_time(NaiveTime::MIN), first.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn symbols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn last_window_is_cut_at_today() {
        let ws = windows(date(2024, 1, 1), 10, date(2024, 1, 25));
        assert_eq!(ws.len(), 3);
        assert_eq!(ws[0].end, date(2024, 1, 10));
        assert!(!ws[0].open);
        assert_eq!(ws[2].start, date(2024, 1, 21));
        assert_eq!(ws[2].end, date(2024, 1, 25));
        assert!(ws[2].open);
    }

    #[test]
    fn window_ending_today_is_open() {
        let ws = windows(date(2024, 1, 1), 10, date(2024, 1, 10));
        assert_eq!(ws.len(), 1);
        assert!(ws[0].open);
    }

    #[test]
    fn start_after_today_is_empty() {
        assert!(windows(date(2024, 2, 1), 30, date(2024, 1, 1)).is_empty());
    }

    #[test]
    fn cursor_moves_to_next_symbol() {
        let w = windows(date(2024, 1, 1), 10, date(2024, 3, 1))[0];
        let cp = next_checkpoint(&w, 10, &symbols(&["A", "B"]), 0).unwrap();
        assert_eq!(cp.symbol, "B");
        assert_eq!(cp.window_start.date(), date(2024, 1, 1));
    }

    #[test]
    fn cursor_wraps_to_next_window() {
        let w = windows(date(2024, 1, 1), 10, date(2024, 3, 1))[0];
        let cp = next_checkpoint(&w, 10, &symbols(&["A", "B"]), 1).unwrap();
        assert_eq!(cp.symbol, "A");
        assert_eq!(cp.window_start.date(), date(2024, 1, 11));
    }

    #[test]
    fn open_window_is_revisited() {
        let w = windows(date(2024, 1, 1), 10, date(2024, 1, 5))[0];
        let cp = next_checkpoint(&w, 10, &symbols(&["A", "B"]), 1).unwrap();
        assert_eq!(cp, Checkpoint::new(w.start_datetime(), "A"));
    }

    #[test]
    fn no_symbols_no_cursor() {
        let w = windows(date(2024, 1, 1), 10, date(2024, 1, 5))[0];
        assert!(next_checkpoint(&w, 10, &[], 0).is_none());
    }
}
