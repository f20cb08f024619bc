//! Recurrence arithmetic.
//!
//! A [`Schedule`] is a closed set of variants describing when a task fires.
//! [`Schedule::next`] is a pure function from a reference instant to the next
//! fire instant, which keeps the recurrence decision deterministic and
//! replayable: the execution pipeline calls it at finalize time with the same
//! descriptor that was validated at ingress.

use chrono::{DateTime, Datelike, LocalResult, TimeDelta, TimeZone, Utc};
use chrono_tz::Tz;

use crate::error::ValidationError;

/// When a task fires.
///
/// Construction validates: an invalid cron expression, an out-of-range daily
/// time or a non-positive delay is rejected here, before anything persists.
#[derive(Clone, Debug, PartialEq)]
pub enum Schedule {
    /// Fires once at `fire_at`, then the schedule is exhausted.
    OneTime { fire_at: DateTime<Utc> },
    /// Fires per a cron expression evaluated in `zone`.
    Cron { expression: String, zone: Tz },
    /// Fires `delay` after the previous fire. The first fire is whatever
    /// execution time the task was inserted with.
    FixedDelay { delay: TimeDelta },
    /// Fires once a day at `hour:minute` local to `zone`.
    Daily { hour: u32, minute: u32, zone: Tz },
}

impl Schedule {
    pub fn one_time(fire_at: DateTime<Utc>) -> Self {
        Schedule::OneTime { fire_at }
    }

    /// Validates and normalizes a cron expression.
    ///
    /// Accepts the classic 5-field form (minute hour day-of-month month
    /// day-of-week) or the 6-field form with a trailing seconds field.
    pub fn cron(expression: &str, zone: Tz) -> Result<Self, ValidationError> {
        let normalized = normalize_cron(expression)?;
        // Parse both derived schedules up front so `next` never sees an
        // expression it cannot evaluate.
        cron_schedules(&normalized).map_err(|reason| ValidationError::InvalidCron {
            expression: expression.to_owned(),
            reason,
        })?;

        Ok(Schedule::Cron {
            expression: normalized,
            zone,
        })
    }

    pub fn fixed_delay(delay: TimeDelta) -> Result<Self, ValidationError> {
        if delay <= TimeDelta::zero() {
            return Err(ValidationError::NonPositiveDelay(delay.num_seconds()));
        }

        Ok(Schedule::FixedDelay { delay })
    }

    pub fn daily(hour: u32, minute: u32, zone: Tz) -> Result<Self, ValidationError> {
        if hour > 23 || minute > 59 {
            return Err(ValidationError::TimeOfDayOutOfRange { hour, minute });
        }

        Ok(Schedule::Daily { hour, minute, zone })
    }

    /// Whether the schedule produces more than one fire.
    pub fn is_recurring(&self) -> bool {
        !matches!(self, Schedule::OneTime { .. })
    }

    /// The next fire instant strictly after `after`, or `None` once the
    /// schedule is exhausted.
    pub fn next(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::OneTime { fire_at } => (after < *fire_at).then_some(*fire_at),
            Schedule::Cron { expression, zone } => next_cron(expression, *zone, after),
            Schedule::FixedDelay { delay } => after.checked_add_signed(*delay),
            Schedule::Daily { hour, minute, zone } => next_daily(after, *hour, *minute, *zone),
        }
    }
}

/// Rewrites an expression to the seconds-first 6-field form the `cron` crate
/// understands. The accepted field order is minute, hour, day-of-month,
/// month, day-of-week, with seconds as an optional sixth field at the end;
/// 6-field input therefore has its trailing seconds rotated to the front.
fn normalize_cron(expression: &str) -> Result<String, ValidationError> {
    let mut fields: Vec<&str> = expression.split_whitespace().collect();
    match fields.len() {
        5 => Ok(format!("0 {}", fields.join(" "))),
        6 => {
            fields.rotate_right(1);
            Ok(fields.join(" "))
        }
        n => Err(ValidationError::InvalidCron {
            expression: expression.to_owned(),
            reason: format!("expected 5 or 6 fields, got {n}"),
        }),
    }
}

fn is_restricted(field: &str) -> bool {
    field != "*" && field != "?"
}

/// Compiles a normalized 6-field expression into the schedules to evaluate.
///
/// Standard cron semantics OR the day-of-month and day-of-week fields when
/// both are restricted; the `cron` crate intersects them instead. When both
/// are restricted this compiles two expressions, each with one of the day
/// fields wildcarded, and the earliest fire across them wins.
fn cron_schedules(normalized: &str) -> Result<Vec<cron::Schedule>, String> {
    use std::str::FromStr;

    let fields: Vec<&str> = normalized.split_whitespace().collect();
    debug_assert_eq!(fields.len(), 6);

    let expressions = if is_restricted(fields[3]) && is_restricted(fields[5]) {
        let mut dom_only = fields.clone();
        dom_only[5] = "*";
        let mut dow_only = fields;
        dow_only[3] = "*";
        vec![dom_only.join(" "), dow_only.join(" ")]
    } else {
        vec![normalized.to_owned()]
    };

    expressions
        .iter()
        .map(|e| cron::Schedule::from_str(e).map_err(|err| err.to_string()))
        .collect()
}

fn next_cron(expression: &str, zone: Tz, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let schedules = cron_schedules(expression).ok()?;
    let local = after.with_timezone(&zone);

    schedules
        .iter()
        .filter_map(|schedule| schedule.after(&local).next())
        .map(|fire| fire.with_timezone(&Utc))
        .min()
}

fn next_daily(after: DateTime<Utc>, hour: u32, minute: u32, zone: Tz) -> Option<DateTime<Utc>> {
    let mut date = after.with_timezone(&zone).date_naive();

    // At most one extra iteration for the strict-inequality carry plus a
    // couple for days where the wall-clock time does not exist (DST gap).
    for _ in 0..4 {
        // On a fall-back day the wall-clock time maps to two instants; both
        // count, so `after` landing between them still fires the same day.
        let mapped =
            zone.with_ymd_and_hms(date.year(), date.month(), date.day(), hour, minute, 0);
        let candidates = match mapped {
            LocalResult::Single(local) => [Some(local), None],
            LocalResult::Ambiguous(first, second) => [Some(first), Some(second)],
            LocalResult::None => [None, None],
        };

        for fire in candidates.into_iter().flatten() {
            let fire = fire.with_timezone(&Utc);
            if fire > after {
                return Some(fire);
            }
        }

        date = date.succ_opt()?;
    }

    None
}

#[cfg(test)]
mod tests {
    use chrono_tz::Tz;

    use super::*;

    fn utc(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[test]
    fn one_time_fires_once() {
        let fire_at = utc("2024-06-01T12:00:00Z");
        let schedule = Schedule::one_time(fire_at);

        assert_eq!(schedule.next(utc("2024-06-01T11:59:59Z")), Some(fire_at));
        assert_eq!(schedule.next(fire_at), None);
        assert_eq!(schedule.next(utc("2024-06-02T00:00:00Z")), None);
        assert!(!schedule.is_recurring());
    }

    #[test]
    fn cron_daily_midnight() {
        let schedule = Schedule::cron("0 0 * * *", Tz::UTC).unwrap();

        let first = schedule.next(utc("2024-01-01T10:00:00Z")).unwrap();
        assert_eq!(first, utc("2024-01-02T00:00:00Z"));

        let second = schedule.next(first).unwrap();
        assert_eq!(second, utc("2024-01-03T00:00:00Z"));
    }

    #[test]
    fn cron_six_fields_take_seconds_last() {
        // minute=30, hour=9, seconds=0: a 09:30:00 daily fire, not a
        // sec=30/min=9 one.
        let schedule = Schedule::cron("30 9 * * * 0", Tz::UTC).unwrap();
        assert_eq!(
            schedule.next(utc("2024-01-01T00:00:00Z")),
            Some(utc("2024-01-01T09:30:00Z"))
        );
        assert_eq!(
            schedule.next(utc("2024-01-01T09:30:00Z")),
            Some(utc("2024-01-02T09:30:00Z"))
        );

        // The trailing seconds value is honored.
        let schedule = Schedule::cron("*/5 * * * * 30", Tz::UTC).unwrap();
        assert_eq!(
            schedule.next(utc("2024-01-01T00:00:00Z")),
            Some(utc("2024-01-01T00:00:30Z"))
        );
        assert_eq!(
            schedule.next(utc("2024-01-01T00:00:30Z")),
            Some(utc("2024-01-01T00:05:30Z"))
        );
    }

    #[test]
    fn cron_rejects_garbage() {
        assert!(Schedule::cron("not a cron", Tz::UTC).is_err());
        assert!(Schedule::cron("* * * *", Tz::UTC).is_err());
        assert!(Schedule::cron("0 0 * * * * 2024", Tz::UTC).is_err());
        assert!(Schedule::cron("61 * * * *", Tz::UTC).is_err());
    }

    #[test]
    fn cron_dom_dow_are_ored_when_both_restricted() {
        // The 13th of the month OR any Friday.
        let schedule = Schedule::cron("0 0 13 * FRI", Tz::UTC).unwrap();

        // 2024-09-02 is a Monday; the next Friday (the 6th) comes before the
        // 13th, so OR semantics must pick it. An AND reading would wait for
        // Friday the 13th.
        assert_eq!(
            schedule.next(utc("2024-09-02T12:00:00Z")),
            Some(utc("2024-09-06T00:00:00Z"))
        );

        // From the 6th the day-of-month leg wins: the 13th.
        assert_eq!(
            schedule.next(utc("2024-09-06T00:00:00Z")),
            Some(utc("2024-09-13T00:00:00Z"))
        );
    }

    #[test]
    fn cron_in_zone() {
        let schedule = Schedule::cron("0 9 * * *", Tz::America__New_York).unwrap();

        // 09:00 in New York during DST is 13:00 UTC.
        assert_eq!(
            schedule.next(utc("2024-07-01T00:00:00Z")),
            Some(utc("2024-07-01T13:00:00Z"))
        );
    }

    #[test]
    fn cron_over_leap_second_day() {
        // 2016-12-31 ended on a leap second; civil time arithmetic must give
        // the same next fire as any other day.
        let schedule = Schedule::cron("0 0 * * *", Tz::UTC).unwrap();
        assert_eq!(
            schedule.next(utc("2016-12-31T23:59:59Z")),
            Some(utc("2017-01-01T00:00:00Z"))
        );
    }

    #[test]
    fn fixed_delay_adds_delay() {
        let schedule = Schedule::fixed_delay(TimeDelta::seconds(90)).unwrap();

        assert_eq!(
            schedule.next(utc("2024-01-01T00:00:00Z")),
            Some(utc("2024-01-01T00:01:30Z"))
        );
    }

    #[test]
    fn fixed_delay_smallest_positive_value() {
        assert!(Schedule::fixed_delay(TimeDelta::milliseconds(1)).is_ok());
        assert!(Schedule::fixed_delay(TimeDelta::zero()).is_err());
        assert!(Schedule::fixed_delay(TimeDelta::seconds(-5)).is_err());
    }

    #[test]
    fn daily_is_strictly_after() {
        let schedule = Schedule::daily(0, 0, Tz::UTC).unwrap();

        // Exactly at 00:00 the answer is a full day later, not "now".
        assert_eq!(
            schedule.next(utc("2024-03-10T00:00:00Z")),
            Some(utc("2024-03-11T00:00:00Z"))
        );
        assert_eq!(
            schedule.next(utc("2024-03-09T23:59:59Z")),
            Some(utc("2024-03-10T00:00:00Z"))
        );
    }

    #[test]
    fn daily_respects_zone() {
        let schedule = Schedule::daily(9, 0, Tz::America__New_York).unwrap();

        // 2024-11-03 02:00 EDT falls back to EST; 09:00 local becomes 14:00 UTC.
        assert_eq!(
            schedule.next(utc("2024-11-03T12:00:00Z")),
            Some(utc("2024-11-03T14:00:00Z"))
        );
    }

    #[test]
    fn daily_fires_both_occurrences_of_an_ambiguous_time() {
        // 01:30 happens twice in New York on 2024-11-03 (fall back): once at
        // 05:30Z (EDT) and again at 06:30Z (EST).
        let schedule = Schedule::daily(1, 30, Tz::America__New_York).unwrap();

        assert_eq!(
            schedule.next(utc("2024-11-03T05:00:00Z")),
            Some(utc("2024-11-03T05:30:00Z"))
        );
        // Between the two occurrences the second one is still due that day.
        assert_eq!(
            schedule.next(utc("2024-11-03T05:45:00Z")),
            Some(utc("2024-11-03T06:30:00Z"))
        );
        assert_eq!(
            schedule.next(utc("2024-11-03T06:30:00Z")),
            Some(utc("2024-11-04T06:30:00Z"))
        );
    }

    #[test]
    fn daily_skips_nonexistent_local_time() {
        // 02:30 does not exist on 2024-03-10 in New York (spring forward).
        let schedule = Schedule::daily(2, 30, Tz::America__New_York).unwrap();

        let next = schedule.next(utc("2024-03-10T00:00:00Z")).unwrap();
        assert_eq!(next, utc("2024-03-11T06:30:00Z"));
    }

    #[test]
    fn daily_rejects_out_of_range() {
        assert!(Schedule::daily(24, 0, Tz::UTC).is_err());
        assert!(Schedule::daily(9, 60, Tz::UTC).is_err());
        assert!(Schedule::daily(23, 59, Tz::UTC).is_ok());
    }

    #[test]
    fn recurring_variants_are_strictly_monotonic() {
        let schedules = [
            Schedule::cron("*/15 * * * *", Tz::UTC).unwrap(),
            Schedule::fixed_delay(TimeDelta::seconds(1)).unwrap(),
            Schedule::daily(12, 30, Tz::Europe__Berlin).unwrap(),
        ];

        for schedule in schedules {
            let mut t = utc("2024-01-01T00:00:00Z");
            for _ in 0..50 {
                let next = schedule.next(t).unwrap();
                assert!(next > t, "{schedule:?} did not advance past {t}");
                t = next;
            }
        }
    }
}
