//! Occurrence generation: schedule rule + date range → concrete dates.
//!
//! [`occurrences`] returns a lazy iterator over an inclusive date range. The
//! iterator owns no state beyond its cursor, so calling [`occurrences`] again
//! (or cloning the iterator) restarts the sequence.
//!
//! # Week numbering
//!
//! "Every N weeks" counts Monday-based weeks from the fixed epoch week
//! starting Monday 1970-01-05. A date is eligible when its week number is a
//! multiple of N. Because the anchor is global, the same rule yields the same
//! dates no matter which range is asked for.

use chrono::{Datelike, Duration, NaiveDate, NaiveTime, Weekday};
use serde::Serialize;

use crate::recurrence::{hhmm, Pattern, Schedule, WeekOrdinal};

/// Week number of Monday 1970-01-05, counted from Monday 0001-01-01.
const EPOCH_WEEK: i64 = 102_738;

/// One generated `(date, start, end)` triple in local wall-clock time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ScheduledOccurrence {
    pub date: NaiveDate,
    #[serde(with = "hhmm")]
    pub start_time: NaiveTime,
    #[serde(with = "hhmm")]
    pub end_time: NaiveTime,
}

/// Lazy sequence of occurrences for one schedule.
#[derive(Debug, Clone)]
pub struct Occurrences<'a> {
    schedule: &'a Schedule,
    to: NaiveDate,
    cursor: Cursor,
}

#[derive(Debug, Clone)]
enum Cursor {
    Weekly {
        next: NaiveDate,
        step_days: i64,
    },
    Monthly {
        year: i32,
        month: u32,
        pending: std::vec::IntoIter<NaiveDate>,
    },
    Done,
}

/// Generate the occurrences of `schedule` with a date in `[from, to]`.
#[must_use]
pub fn occurrences(schedule: &Schedule, from: NaiveDate, to: NaiveDate) -> Occurrences<'_> {
    let cursor = if from > to {
        Cursor::Done
    } else {
        match &schedule.pattern {
            Pattern::Weekly {
                weekday,
                every_n_weeks,
            } => {
                let n = i64::from((*every_n_weeks).max(1));
                match first_aligned_weekday(from, *weekday, n) {
                    Some(next) => Cursor::Weekly {
                        next,
                        step_days: 7 * n,
                    },
                    None => Cursor::Done,
                }
            }
            Pattern::MonthlyNthWeekday { weekday, positions } => Cursor::Monthly {
                year: from.year(),
                month: from.month(),
                pending: month_dates(from.year(), from.month(), *weekday, positions, from, to)
                    .into_iter(),
            },
        }
    };
    Occurrences {
        schedule,
        to,
        cursor,
    }
}

/// Union of several schedules over `[from, to]`, sorted and de-duplicated.
#[must_use]
pub fn union(schedules: &[Schedule], from: NaiveDate, to: NaiveDate) -> Vec<ScheduledOccurrence> {
    let mut all: Vec<ScheduledOccurrence> = schedules
        .iter()
        .flat_map(|s| occurrences(s, from, to))
        .collect();
    all.sort();
    all.dedup();
    all
}

impl Iterator for Occurrences<'_> {
    type Item = ScheduledOccurrence;

    fn next(&mut self) -> Option<Self::Item> {
        let date = match &mut self.cursor {
            Cursor::Done => return None,
            Cursor::Weekly { next, step_days } => {
                if *next > self.to {
                    self.cursor = Cursor::Done;
                    return None;
                }
                let date = *next;
                match date.checked_add_signed(Duration::days(*step_days)) {
                    Some(following) => *next = following,
                    // Past the last representable date.
                    None => self.cursor = Cursor::Done,
                }
                date
            }
            Cursor::Monthly {
                year,
                month,
                pending,
            } => loop {
                if let Some(date) = pending.next() {
                    break date;
                }
                let (ny, nm) = next_month(*year, *month);
                let first = NaiveDate::from_ymd_opt(ny, nm, 1)?;
                if first > self.to {
                    self.cursor = Cursor::Done;
                    return None;
                }
                let Pattern::MonthlyNthWeekday { weekday, positions } = &self.schedule.pattern
                else {
                    self.cursor = Cursor::Done;
                    return None;
                };
                *year = ny;
                *month = nm;
                *pending = month_dates(ny, nm, *weekday, positions, first, self.to).into_iter();
            },
        };
        Some(ScheduledOccurrence {
            date,
            start_time: self.schedule.start_time,
            end_time: self.schedule.end_time,
        })
    }
}

/// Monday-based week number relative to the 1970-01-05 epoch.
fn week_number(date: NaiveDate) -> i64 {
    let monday_days =
        i64::from(date.num_days_from_ce()) - i64::from(date.weekday().num_days_from_monday());
    (monday_days - 1).div_euclid(7) - EPOCH_WEEK
}

/// First `weekday` on or after `from` that falls in a week divisible by `n`,
/// or `None` when that date is not representable.
fn first_aligned_weekday(from: NaiveDate, weekday: Weekday, n: i64) -> Option<NaiveDate> {
    let offset = (i64::from(weekday.num_days_from_monday())
        - i64::from(from.weekday().num_days_from_monday()))
    .rem_euclid(7);
    let candidate = from.checked_add_signed(Duration::days(offset))?;
    let skip_weeks = (n - week_number(candidate).rem_euclid(n)) % n;
    candidate.checked_add_signed(Duration::weeks(skip_weeks))
}

/// The requested ordinal weekdays of one month, restricted to `[from, to]`.
fn month_dates(
    year: i32,
    month: u32,
    weekday: Weekday,
    positions: &[WeekOrdinal],
    from: NaiveDate,
    to: NaiveDate,
) -> Vec<NaiveDate> {
    let mut dates: Vec<NaiveDate> = positions
        .iter()
        .filter_map(|p| nth_weekday_in_month(year, month, weekday, *p))
        .filter(|d| *d >= from && *d <= to)
        .collect();
    // Fourth and last coincide in four-week months.
    dates.sort();
    dates.dedup();
    dates
}

/// Find the Nth weekday in a month, or the last one for [`WeekOrdinal::Last`].
fn nth_weekday_in_month(
    year: i32,
    month: u32,
    weekday: Weekday,
    ordinal: WeekOrdinal,
) -> Option<NaiveDate> {
    let target = match ordinal {
        WeekOrdinal::Last => {
            let last = last_day_of_month(year, month)?;
            let diff = (i64::from(last.weekday().num_days_from_monday())
                - i64::from(weekday.num_days_from_monday()))
            .rem_euclid(7);
            last.checked_sub_signed(Duration::days(diff))?
        }
        nth => {
            let first = NaiveDate::from_ymd_opt(year, month, 1)?;
            let diff = (i64::from(weekday.num_days_from_monday())
                - i64::from(first.weekday().num_days_from_monday()))
            .rem_euclid(7);
            first
                .checked_add_signed(Duration::days(diff))?
                .checked_add_signed(Duration::weeks(nth.as_position() - 1))?
        }
    };
    (target.month() == month).then_some(target)
}

fn last_day_of_month(year: i32, month: u32) -> Option<NaiveDate> {
    if month == 12 {
        return NaiveDate::from_ymd_opt(year, 12, 31);
    }
    NaiveDate::from_ymd_opt(year, month + 1, 1)?.pred_opt()
}

fn next_month(year: i32, month: u32) -> (i32, u32) {
    if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    }
}
