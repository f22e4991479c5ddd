use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone};

/// Half-open range of unix timestamps, `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: i64,
    pub end: i64,
}

impl TimeWindow {
    pub fn contains(&self, ts: i64) -> bool {
        ts >= self.start && ts < self.end
    }
}

/// First valid instant of `date` in `tz`. A midnight skipped by a DST jump
/// resolves to the first wall-clock time that exists after the gap.
fn start_of_day<Tz: TimeZone>(tz: &Tz, date: NaiveDate) -> i64 {
    let midnight = date.and_time(NaiveTime::MIN);
    let mut probe = midnight;
    // Gaps are at most a few hours; step in 15 minute increments.
    for _ in 0..=16 {
        if let Some(instant) = tz.from_local_datetime(&probe).earliest() {
            return instant.timestamp();
        }
        probe += Duration::minutes(15);
    }
    midnight.and_utc().timestamp()
}

fn first_of_next_month(date: NaiveDate) -> NaiveDate {
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(date)
}

/// Local calendar day containing `now`. Across a DST change the window is
/// 23 or 25 hours long.
pub fn day_of<Tz: TimeZone>(now: &DateTime<Tz>) -> TimeWindow {
    let tz = now.timezone();
    let today = now.date_naive();
    let tomorrow = today.succ_opt().unwrap_or(today);
    TimeWindow {
        start: start_of_day(&tz, today),
        end: start_of_day(&tz, tomorrow),
    }
}

/// Local calendar month containing `now`.
pub fn month_of<Tz: TimeZone>(now: &DateTime<Tz>) -> TimeWindow {
    let tz = now.timezone();
    let today = now.date_naive();
    let first = today.with_day(1).unwrap_or(today);
    TimeWindow {
        start: start_of_day(&tz, first),
        end: start_of_day(&tz, first_of_next_month(first)),
    }
}
