/* Copyright 2023-2025 Bruce Merry
 *
 * This program is free software: you can redistribute it and/or modify it
 * under the terms of the GNU General Public License as published by the Free
 * Software Foundation, either version 3 of the License, or (at your option)
 * any later version.
 *
 * This program is distributed in the hope that it will be useful, but WITHOUT
 * ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
 * FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for
 * more details.
 *
 * You should have received a copy of the GNU General Public License along
 * with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! Weekly state-of-charge targets.
//!
//! Each weekday holds a list of `(time, soc)` points. Lookups resolve them
//! against a concrete date, walking across day boundaries for at most a
//! week before giving up and returning [`TargetPoint::SENTINEL`].

use chrono::naive::{NaiveDate, NaiveDateTime, NaiveTime};
use chrono::{Datelike, Days, Weekday};
use log::warn;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::ops::Bound;

/// Number of days searched (today included) before falling back to the sentinel
const SEARCH_DAYS: u64 = 7;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("invalid time of day {time:?} (expected HH:MM or HH:MM:SS)")]
    InvalidTime { time: String },
    #[error("time {time} appears more than once")]
    DuplicateTime { time: NaiveTime },
    #[error("soc {soc} at {time} is above 100%")]
    SocOutOfRange { time: NaiveTime, soc: u8 },
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ScheduleEntry {
    pub time: String,
    pub soc: u8, // %
}

impl ScheduleEntry {
    pub fn new(time: &str, soc: u8) -> Self {
        Self {
            time: time.to_owned(),
            soc,
        }
    }
}

/// A schedule entry resolved against a date.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TargetPoint {
    pub time: NaiveDateTime,
    pub soc: u8, // %
}

impl TargetPoint {
    /// Returned when no day in the search horizon has any entry.
    pub const SENTINEL: TargetPoint = TargetPoint {
        time: NaiveDateTime::MIN,
        soc: 10,
    };
}

/// Raw schedule for a week, as it appears in the configuration.
///
/// Entries are kept unparsed so that a hot-reloaded table with a bad entry
/// only affects the day it is on.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct WeeklySchedule {
    #[serde(default)]
    pub monday: Vec<ScheduleEntry>,
    #[serde(default)]
    pub tuesday: Vec<ScheduleEntry>,
    #[serde(default)]
    pub wednesday: Vec<ScheduleEntry>,
    #[serde(default)]
    pub thursday: Vec<ScheduleEntry>,
    #[serde(default)]
    pub friday: Vec<ScheduleEntry>,
    #[serde(default)]
    pub saturday: Vec<ScheduleEntry>,
    #[serde(default)]
    pub sunday: Vec<ScheduleEntry>,
}

type DayPoints = BTreeMap<NaiveTime, u8>;

/// Parse a time of day in `HH:MM` or `HH:MM:SS` form.
fn parse_time(raw: &str) -> Result<NaiveTime, ScheduleError> {
    NaiveTime::parse_from_str(raw, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M"))
        .map_err(|_| ScheduleError::InvalidTime {
            time: raw.to_owned(),
        })
}

/// Parse one day's entries into a time-ordered map.
pub fn parse_day(entries: &[ScheduleEntry]) -> Result<BTreeMap<NaiveTime, u8>, ScheduleError> {
    let mut points = DayPoints::new();
    for entry in entries {
        let time = parse_time(&entry.time)?;
        if entry.soc > 100 {
            return Err(ScheduleError::SocOutOfRange {
                time,
                soc: entry.soc,
            });
        }
        match points.entry(time) {
            Entry::Occupied(_) => return Err(ScheduleError::DuplicateTime { time }),
            Entry::Vacant(slot) => {
                slot.insert(entry.soc);
            }
        }
    }
    Ok(points)
}

impl WeeklySchedule {
    pub fn day(&self, weekday: Weekday) -> &[ScheduleEntry] {
        match weekday {
            Weekday::Mon => &self.monday,
            Weekday::Tue => &self.tuesday,
            Weekday::Wed => &self.wednesday,
            Weekday::Thu => &self.thursday,
            Weekday::Fri => &self.friday,
            Weekday::Sat => &self.saturday,
            Weekday::Sun => &self.sunday,
        }
    }

    /// Check that every day parses, returning the first offending day.
    pub fn validate(&self) -> Result<(), (Weekday, ScheduleError)> {
        let mut weekday = Weekday::Mon;
        for _ in 0..SEARCH_DAYS {
            parse_day(self.day(weekday)).map_err(|err| (weekday, err))?;
            weekday = weekday.succ();
        }
        Ok(())
    }

    /// Points for the day of `date`. A day that fails to parse is reported
    /// and treated as having no entries.
    fn points(&self, date: NaiveDate) -> DayPoints {
        let weekday = date.weekday();
        parse_day(self.day(weekday)).unwrap_or_else(|err| {
            warn!("Ignoring schedule for {weekday}: {err}");
            DayPoints::new()
        })
    }

    /// The earliest point strictly after `now`.
    ///
    /// Today's entries are only considered if they are later than the
    /// current time of day; on later days the first entry of the day is
    /// taken.
    pub fn next_target(&self, now: NaiveDateTime) -> TargetPoint {
        for (offset, date) in days_forward(now.date()) {
            let points = self.points(date);
            let found = if offset == 0 {
                points
                    .range((Bound::Excluded(now.time()), Bound::Unbounded))
                    .next()
            } else {
                points.first_key_value()
            };
            if let Some((&time, &soc)) = found {
                return TargetPoint {
                    time: date.and_time(time),
                    soc,
                };
            }
        }
        TargetPoint::SENTINEL
    }

    /// The latest point at or before `now`.
    pub fn prior_target(&self, now: NaiveDateTime) -> TargetPoint {
        for (offset, date) in days_backward(now.date()) {
            let points = self.points(date);
            let found = if offset == 0 {
                points.range(..=now.time()).next_back()
            } else {
                points.last_key_value()
            };
            if let Some((&time, &soc)) = found {
                return TargetPoint {
                    time: date.and_time(time),
                    soc,
                };
            }
        }
        TargetPoint::SENTINEL
    }
}

/// `start` and the following six days, paired with their offset.
fn days_forward(start: NaiveDate) -> impl Iterator<Item = (u64, NaiveDate)> {
    (0..SEARCH_DAYS).filter_map(move |n| start.checked_add_days(Days::new(n)).map(|d| (n, d)))
}

/// `start` and the preceding six days, paired with their offset.
fn days_backward(start: NaiveDate) -> impl Iterator<Item = (u64, NaiveDate)> {
    (0..SEARCH_DAYS).filter_map(move |n| start.checked_sub_days(Days::new(n)).map(|d| (n, d)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, 0)
            .unwrap()
    }

    // 2024-01-01 is a Monday
    fn monday_at(h: u32, min: u32) -> NaiveDateTime {
        at(2024, 1, 1, h, min)
    }

    fn workday_schedule() -> WeeklySchedule {
        WeeklySchedule {
            monday: vec![
                ScheduleEntry::new("18:00", 30),
                ScheduleEntry::new("07:00", 80),
            ],
            wednesday: vec![ScheduleEntry::new("06:30:15", 90)],
            ..Default::default()
        }
    }

    #[test]
    fn next_same_day() {
        let target = workday_schedule().next_target(monday_at(6, 0));
        assert_eq!(target.time, monday_at(7, 0));
        assert_eq!(target.soc, 80);
    }

    #[test]
    fn next_is_strictly_after() {
        let target = workday_schedule().next_target(monday_at(7, 0));
        assert_eq!(target.time, monday_at(18, 0));
        assert_eq!(target.soc, 30);
    }

    #[test]
    fn next_skips_empty_days() {
        let target = workday_schedule().next_target(monday_at(19, 0));
        assert_eq!(
            target.time,
            NaiveDate::from_ymd_opt(2024, 1, 3)
                .unwrap()
                .and_hms_opt(6, 30, 15)
                .unwrap()
        );
        assert_eq!(target.soc, 90);
    }

    #[test]
    fn next_wraps_around_the_week() {
        // Sunday evening: next entry is Monday morning, in the following week
        let target = workday_schedule().next_target(at(2024, 1, 7, 22, 0));
        assert_eq!(target.time, at(2024, 1, 8, 7, 0));
        assert_eq!(target.soc, 80);
    }

    #[test]
    fn next_takes_midnight_entry_on_later_day() {
        let schedule = WeeklySchedule {
            tuesday: vec![ScheduleEntry::new("00:00", 55)],
            ..Default::default()
        };
        let target = schedule.next_target(monday_at(12, 0));
        assert_eq!(target.time, at(2024, 1, 2, 0, 0));
    }

    #[test]
    fn prior_is_inclusive() {
        let target = workday_schedule().prior_target(monday_at(18, 0));
        assert_eq!(target.time, monday_at(18, 0));
        assert_eq!(target.soc, 30);
    }

    #[test]
    fn prior_same_day() {
        let target = workday_schedule().prior_target(monday_at(12, 0));
        assert_eq!(target.time, monday_at(7, 0));
        assert_eq!(target.soc, 80);
    }

    #[test]
    fn prior_takes_latest_of_previous_day() {
        // Tuesday morning: Monday's last entry applies
        let target = workday_schedule().prior_target(at(2024, 1, 2, 9, 0));
        assert_eq!(target.time, monday_at(18, 0));
        assert_eq!(target.soc, 30);
    }

    #[test]
    fn prior_wraps_around_the_week() {
        // Monday before the first entry: last Wednesday's entry
        let target = workday_schedule().prior_target(monday_at(5, 0));
        assert_eq!(
            target.time,
            NaiveDate::from_ymd_opt(2023, 12, 27)
                .unwrap()
                .and_hms_opt(6, 30, 15)
                .unwrap()
        );
    }

    #[test]
    fn results_bracket_now() {
        let schedule = workday_schedule();
        let mut now = monday_at(0, 0);
        for _ in 0..(7 * 24 * 4) {
            assert!(schedule.next_target(now).time > now);
            assert!(schedule.prior_target(now).time <= now);
            now += chrono::Duration::minutes(15);
        }
    }

    #[test]
    fn empty_schedule_gives_sentinel() {
        let schedule = WeeklySchedule::default();
        let next = schedule.next_target(monday_at(12, 0));
        let prior = schedule.prior_target(monday_at(12, 0));
        assert_eq!(next, TargetPoint::SENTINEL);
        assert_eq!(prior, TargetPoint::SENTINEL);
        assert_eq!(next.soc, 10);
        assert_eq!(next.time, NaiveDateTime::MIN);
    }

    #[test]
    fn malformed_day_is_skipped() {
        let schedule = WeeklySchedule {
            monday: vec![ScheduleEntry::new("25:99", 50)],
            tuesday: vec![ScheduleEntry::new("08:00", 70)],
            ..Default::default()
        };
        let target = schedule.next_target(monday_at(1, 0));
        assert_eq!(target.time, at(2024, 1, 2, 8, 0));
        assert_eq!(target.soc, 70);
    }

    #[test]
    fn parse_day_errors() {
        assert_eq!(
            parse_day(&[ScheduleEntry::new("noon", 50)]),
            Err(ScheduleError::InvalidTime {
                time: "noon".to_owned()
            })
        );
        let seven = NaiveTime::from_hms_opt(7, 0, 0).unwrap();
        assert_eq!(
            parse_day(&[
                ScheduleEntry::new("07:00", 50),
                ScheduleEntry::new("07:00:00", 60)
            ]),
            Err(ScheduleError::DuplicateTime { time: seven })
        );
        assert_eq!(
            parse_day(&[ScheduleEntry::new("07:00", 101)]),
            Err(ScheduleError::SocOutOfRange {
                time: seven,
                soc: 101
            })
        );
    }

    #[test]
    fn validate_reports_day() {
        let schedule = WeeklySchedule {
            friday: vec![ScheduleEntry::new("7", 50)],
            ..workday_schedule()
        };
        let (day, _) = schedule.validate().unwrap_err();
        assert_eq!(day, Weekday::Fri);
        assert!(workday_schedule().validate().is_ok());
    }
}
