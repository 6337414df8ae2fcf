use anyhow::{bail, Context, Result};
use chrono::{Datelike, Duration, NaiveDateTime, NaiveTime, Weekday};

use crate::db::models::{ChangeKind, NotificationPolicyRow};

/// A check-in window never spans more than a day.
pub const MAX_GRACE_MINUTES: i64 = 24 * 60;

/// Expected daily check-in: the device is supposed to change state around
/// `expected` on each active weekday, give or take `grace_minutes`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    pub weekdays: Vec<Weekday>,
    pub expected: NaiveTime,
    pub grace_minutes: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationPolicy {
    pub enabled: bool,
    pub schedule: Option<Schedule>,
}

impl NotificationPolicy {
    pub fn from_row(row: &NotificationPolicyRow) -> Result<Self> {
        let schedule = match (&row.weekdays, &row.expected_time) {
            (Some(days), Some(time)) => Some(Schedule {
                weekdays: parse_weekdays(days)?,
                expected: parse_time(time)?,
                grace_minutes: row.grace_minutes.unwrap_or(0).clamp(0, MAX_GRACE_MINUTES),
            }),
            _ => None,
        };
        Ok(NotificationPolicy {
            enabled: row.enabled,
            schedule,
        })
    }

    /// Whether an event of `kind` seen at local time `now` should go out.
    pub fn should_notify(&self, kind: ChangeKind, now: NaiveDateTime) -> bool {
        if !self.enabled {
            return false;
        }
        let Some(schedule) = &self.schedule else {
            return true;
        };
        match kind {
            // Scheduled devices are expected to come and go.
            ChangeKind::ReachabilityChanged => false,
            ChangeKind::AddressChanged | ChangeKind::NewDevice => schedule.in_window(now),
        }
    }
}

impl Schedule {
    /// `[expected, expected + grace]` on an active weekday. A window that runs
    /// past midnight belongs to the day it started on.
    pub fn in_window(&self, now: NaiveDateTime) -> bool {
        let today = now.date();
        [today.pred_opt(), Some(today)]
            .into_iter()
            .flatten()
            .filter(|day| self.weekdays.contains(&day.weekday()))
            .any(|day| {
                let start = day.and_time(self.expected);
                Duration::try_minutes(self.grace_minutes)
                    .and_then(|grace| start.checked_add_signed(grace))
                    .is_some_and(|end| start <= now && now <= end)
            })
    }
}

pub fn parse_weekdays(value: &str) -> Result<Vec<Weekday>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(parse_weekday)
        .collect()
}

fn parse_weekday(value: &str) -> Result<Weekday> {
    let lower = value.to_ascii_lowercase();
    let day = match lower.get(..3).unwrap_or(lower.as_str()) {
        "mon" => Weekday::Mon,
        "tue" => Weekday::Tue,
        "wed" => Weekday::Wed,
        "thu" => Weekday::Thu,
        "fri" => Weekday::Fri,
        "sat" => Weekday::Sat,
        "sun" => Weekday::Sun,
        _ => bail!("unknown weekday {:?}", value),
    };
    Ok(day)
}

pub fn parse_time(value: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M")
        .with_context(|| format!("expected HH:MM, got {value:?}"))
}

pub fn format_weekday(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "mon",
        Weekday::Tue => "tue",
        Weekday::Wed => "wed",
        Weekday::Thu => "thu",
        Weekday::Fri => "fri",
        Weekday::Sat => "sat",
        Weekday::Sun => "sun",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn tuesday_at(h: u32, m: u32) -> NaiveDateTime {
        // 2026-03-03 is a Tuesday.
        NaiveDate::from_ymd_opt(2026, 3, 3).unwrap().and_hms_opt(h, m, 0).unwrap()
    }

    fn scheduled() -> NotificationPolicy {
        NotificationPolicy {
            enabled: true,
            schedule: Some(Schedule {
                weekdays: vec![Weekday::Tue],
                expected: NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
                grace_minutes: 30,
            }),
        }
    }

    #[test]
    fn address_change_inside_window_notifies() {
        assert!(scheduled().should_notify(ChangeKind::AddressChanged, tuesday_at(8, 15)));
        assert!(scheduled().should_notify(ChangeKind::AddressChanged, tuesday_at(8, 30)));
    }

    #[test]
    fn address_change_outside_window_is_silent() {
        assert!(!scheduled().should_notify(ChangeKind::AddressChanged, tuesday_at(14, 0)));
        assert!(!scheduled().should_notify(ChangeKind::AddressChanged, tuesday_at(7, 59)));
        // Wednesday, same time of day.
        let wednesday = tuesday_at(8, 15) + Duration::days(1);
        assert!(!scheduled().should_notify(ChangeKind::AddressChanged, wednesday));
    }

    #[test]
    fn scheduled_reachability_never_notifies() {
        assert!(!scheduled().should_notify(ChangeKind::ReachabilityChanged, tuesday_at(8, 15)));
    }

    #[test]
    fn continuous_mode_notifies_everything_unless_disabled() {
        let continuous = NotificationPolicy { enabled: true, schedule: None };
        assert!(continuous.should_notify(ChangeKind::ReachabilityChanged, tuesday_at(3, 0)));
        assert!(continuous.should_notify(ChangeKind::AddressChanged, tuesday_at(3, 0)));

        let disabled = NotificationPolicy { enabled: false, schedule: None };
        assert!(!disabled.should_notify(ChangeKind::NewDevice, tuesday_at(3, 0)));
        let mut disabled_scheduled = scheduled();
        disabled_scheduled.enabled = false;
        assert!(!disabled_scheduled.should_notify(ChangeKind::AddressChanged, tuesday_at(8, 15)));
    }

    #[test]
    fn window_past_midnight_counts_for_start_day() {
        let policy = NotificationPolicy {
            enabled: true,
            schedule: Some(Schedule {
                weekdays: vec![Weekday::Tue],
                expected: NaiveTime::from_hms_opt(23, 50, 0).unwrap(),
                grace_minutes: 30,
            }),
        };
        let just_after_midnight = tuesday_at(23, 50) + Duration::minutes(20);
        assert!(policy.should_notify(ChangeKind::AddressChanged, just_after_midnight));
    }

    #[test]
    fn rows_parse_into_policies() {
        let row = NotificationPolicyRow {
            device_id: "d".into(),
            enabled: true,
            weekdays: Some("Tue, thursday".into()),
            expected_time: Some("08:00".into()),
            grace_minutes: Some(30),
        };
        let policy = NotificationPolicy::from_row(&row).unwrap();
        let schedule = policy.schedule.unwrap();
        assert_eq!(schedule.weekdays, vec![Weekday::Tue, Weekday::Thu]);
        assert_eq!(schedule.expected, NaiveTime::from_hms_opt(8, 0, 0).unwrap());

        let bad = NotificationPolicyRow { weekdays: Some("someday".into()), ..row };
        assert!(NotificationPolicy::from_row(&bad).is_err());
    }

    #[test]
    fn oversized_grace_is_outside_every_window() {
        let mut policy = scheduled();
        if let Some(schedule) = policy.schedule.as_mut() {
            schedule.grace_minutes = i64::MAX / 2;
        }
        assert!(!policy.should_notify(ChangeKind::AddressChanged, tuesday_at(8, 15)));
    }

    #[test]
    fn stored_grace_is_clamped_to_a_day() {
        let row = NotificationPolicyRow {
            device_id: "d".into(),
            enabled: true,
            weekdays: Some("tue".into()),
            expected_time: Some("08:00".into()),
            grace_minutes: Some(100_000_000_000_000_000),
        };
        let policy = NotificationPolicy::from_row(&row).unwrap();
        assert_eq!(policy.schedule.as_ref().unwrap().grace_minutes, MAX_GRACE_MINUTES);
        assert!(policy.should_notify(ChangeKind::AddressChanged, tuesday_at(20, 0)));
    }
}
