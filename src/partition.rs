//! Splitting of the backfill span into calendar-month windows.

use chrono::{Datelike, Duration, NaiveDate};
use std::fmt;

/// Inclusive date window; `start <= end` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateWindow {
    start: NaiveDate,
    end: NaiveDate,
}

impl DateWindow {
    /// Returns `None` when `start` is after `end`.
    pub fn new(start: NaiveDate, end: NaiveDate) -> Option<Self> {
        (start <= end).then_some(Self { start, end })
    }

    pub fn start(&self) -> NaiveDate {
        self.start
    }

    pub fn end(&self) -> NaiveDate {
        self.end
    }

    /// `(start, end)` as `YYYY-MM-DD` strings.
    pub fn iso(&self) -> (String, String) {
        (
            self.start().format("%Y-%m-%d").to_string(),
            self.end().format("%Y-%m-%d").to_string(),
        )
    }
}

impl fmt::Display for DateWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

/// Last day of the month containing `day`.
pub fn last_day_of_month(day: NaiveDate) -> NaiveDate {
    first_of_next_month(day).map_or(NaiveDate::MAX, |next| next - Duration::days(1))
}

/// `None` only past the end of chrono's date range.
fn first_of_next_month(day: NaiveDate) -> Option<NaiveDate> {
    let (year, month) = if day.month() == 12 {
        (day.year() + 1, 1)
    } else {
        (day.year(), day.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)
}

/// Last day to pull: the day before the oldest row already loaded.
pub fn pull_end_date(watermark: NaiveDate) -> NaiveDate {
    watermark - Duration::days(1)
}

/// Split `[start, end]` into month-aligned windows, oldest first.
///
/// The first window starts at `start`, the last ends at `end`; everything in
/// between covers whole months. Empty when `start > end`.
pub fn month_windows(start: NaiveDate, end: NaiveDate) -> Vec<DateWindow> {
    let mut windows = Vec::new();
    let mut begin = start;

    while begin <= end {
        let window_end = last_day_of_month(begin).min(end);
        windows.extend(DateWindow::new(begin, window_end));
        match first_of_next_month(begin) {
            Some(next) => begin = next,
            None => break,
        }
    }

    windows
}

/// Windows to pull for a table whose oldest row is `watermark`, newest first.
pub fn plan_windows(start: NaiveDate, watermark: NaiveDate) -> Vec<DateWindow> {
    let mut windows = month_windows(start, pull_end_date(watermark));
    windows.reverse();
    windows
}
