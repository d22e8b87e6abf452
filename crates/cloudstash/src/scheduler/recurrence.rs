//! Next trigger computation for recurrence policies.
//!
//! Triggers are always strictly after `now`: a daily job configured for
//! 02:00 evaluated at exactly 02:00 next fires tomorrow.

use chrono::{
    DateTime, Datelike, Duration, FixedOffset, Local, NaiveDate, NaiveDateTime, Offset, TimeZone,
    Timelike, Utc,
};

use crate::model::Recurrence;

/// Days searched before giving up. Covers a week plus DST gaps.
const MAX_DAYS_AHEAD: i64 = 15;

/// Time zone recurrences are evaluated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScheduleZone {
    /// The host's local time zone.
    #[default]
    Local,
    Fixed(FixedOffset),
}

impl ScheduleZone {
    pub fn utc() -> Self {
        ScheduleZone::Fixed(Utc.fix())
    }

    pub fn next_trigger(&self, recurrence: &Recurrence, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            ScheduleZone::Local => {
                next_trigger(recurrence, &now.with_timezone(&Local)).map(|t| t.with_timezone(&Utc))
            }
            ScheduleZone::Fixed(offset) => {
                next_trigger(recurrence, &now.with_timezone(offset)).map(|t| t.with_timezone(&Utc))
            }
        }
    }
}

/// Soonest instant strictly after `now` satisfying `recurrence`, or `None`
/// if its fields are out of range.
pub fn next_trigger<Tz: TimeZone>(recurrence: &Recurrence, now: &DateTime<Tz>) -> Option<DateTime<Tz>> {
    recurrence.validate().ok()?;

    let tz = now.timezone();
    let local = now.naive_local();

    match *recurrence {
        Recurrence::Hourly => {
            let top = local.date().and_hms_opt(local.hour(), 0, 0)?;
            (1..=3)
                .filter_map(|h| resolve(&tz, top + Duration::hours(h)))
                .find(|t| t > now)
        }
        Recurrence::Daily { hour, minute } => {
            first_after(&tz, now, local.date(), hour, minute, |_| true)
        }
        Recurrence::Weekly {
            weekday,
            hour,
            minute,
        } => first_after(&tz, now, local.date(), hour, minute, |date| {
            date.weekday().num_days_from_sunday() == weekday
        }),
    }
}

fn first_after<Tz: TimeZone>(
    tz: &Tz,
    now: &DateTime<Tz>,
    start: NaiveDate,
    hour: u32,
    minute: u32,
    matches_day: impl Fn(NaiveDate) -> bool,
) -> Option<DateTime<Tz>> {
    (0..=MAX_DAYS_AHEAD)
        .map(|offset| start + Duration::days(offset))
        .filter(|date| matches_day(*date))
        .filter_map(|date| resolve(tz, date.and_hms_opt(hour, minute, 0)?))
        .find(|t| t > now)
}

/// Maps a wall-clock time to an instant. Ambiguous times (DST fall-back)
/// take the earlier instant; times inside a DST gap move past the gap.
fn resolve<Tz: TimeZone>(tz: &Tz, naive: NaiveDateTime) -> Option<DateTime<Tz>> {
    tz.from_local_datetime(&naive)
        .earliest()
        .or_else(|| tz.from_local_datetime(&(naive + Duration::hours(1))).earliest())
}
