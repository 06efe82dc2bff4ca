use chrono::{Datelike, Days, NaiveDate};

use crate::model::SchedulingPolicy;

use super::error::DateRejection;

fn add_days(date: NaiveDate, days: u32) -> NaiveDate {
    date.checked_add_days(Days::new(days as u64))
        .unwrap_or(NaiveDate::MAX)
}

/// Check a candidate departure date against a tour's scheduling policy.
///
/// Rules run in a fixed order and the first failure wins:
/// past date, lead time, advance window, closed weekday, blackout date, and
/// finally (for tours without custom dates) the scheduled departure list.
pub fn evaluate(
    policy: &SchedulingPolicy,
    date: NaiveDate,
    today: NaiveDate,
) -> Result<(), DateRejection> {
    if date < today {
        return Err(DateRejection::InPast { date });
    }

    let earliest = add_days(today, policy.min_days_before_start);
    if date < earliest {
        return Err(DateRejection::LeadTimeTooShort { date, earliest });
    }

    let latest = add_days(today, policy.max_days_advance);
    if date > latest {
        return Err(DateRejection::TooFarAhead { date, latest });
    }

    let weekday = date.weekday();
    if policy.closed_weekdays.contains(weekday) {
        return Err(DateRejection::ClosedWeekday { date, weekday });
    }

    if policy.blackout_dates.contains(&date) {
        return Err(DateRejection::BlackoutDate { date });
    }

    if !policy.allow_custom_date && !policy.departure_dates.contains(&date) {
        return Err(DateRejection::NotOffered { date });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::WeekdaySet;
    use chrono::Weekday;
    use std::collections::BTreeSet;

    // A Thursday.
    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2030, 1, 3).unwrap()
    }

    fn open_policy() -> SchedulingPolicy {
        SchedulingPolicy {
            allow_custom_date: true,
            departure_dates: BTreeSet::new(),
            fixed_departure_time: None,
            min_days_before_start: 0,
            max_days_advance: 365,
            closed_weekdays: WeekdaySet::default(),
            blackout_dates: BTreeSet::new(),
        }
    }

    fn days_from_today(n: u64) -> NaiveDate {
        today().checked_add_days(Days::new(n)).unwrap()
    }

    #[test]
    fn today_is_bookable_without_lead_time() {
        assert_eq!(evaluate(&open_policy(), today(), today()), Ok(()));
    }

    #[test]
    fn past_date_rejected() {
        let yesterday = NaiveDate::from_ymd_opt(2030, 1, 2).unwrap();
        assert_eq!(
            evaluate(&open_policy(), yesterday, today()),
            Err(DateRejection::InPast { date: yesterday })
        );
    }

    #[test]
    fn lead_time_boundary() {
        let mut policy = open_policy();
        policy.min_days_before_start = 3;
        assert!(matches!(
            evaluate(&policy, days_from_today(2), today()),
            Err(DateRejection::LeadTimeTooShort { .. })
        ));
        assert_eq!(evaluate(&policy, days_from_today(3), today()), Ok(()));
    }

    #[test]
    fn advance_window_boundary() {
        let mut policy = open_policy();
        policy.max_days_advance = 30;
        assert_eq!(evaluate(&policy, days_from_today(30), today()), Ok(()));
        assert_eq!(
            evaluate(&policy, days_from_today(31), today()),
            Err(DateRejection::TooFarAhead {
                date: days_from_today(31),
                latest: days_from_today(30),
            })
        );
    }

    #[test]
    fn closed_weekday_rejected() {
        let mut policy = open_policy();
        policy.closed_weekdays = [Weekday::Mon].into_iter().collect();
        // 2030-01-07 is a Monday
        let monday = NaiveDate::from_ymd_opt(2030, 1, 7).unwrap();
        assert_eq!(
            evaluate(&policy, monday, today()),
            Err(DateRejection::ClosedWeekday { date: monday, weekday: Weekday::Mon })
        );
        assert_eq!(evaluate(&policy, days_from_today(5), today()), Ok(()));
    }

    #[test]
    fn blackout_independent_of_weekday() {
        let mut policy = open_policy();
        let date = days_from_today(10);
        policy.blackout_dates.insert(date);
        assert_eq!(
            evaluate(&policy, date, today()),
            Err(DateRejection::BlackoutDate { date })
        );
        assert_eq!(evaluate(&policy, days_from_today(17), today()), Ok(()));
    }

    #[test]
    fn first_failing_rule_wins() {
        // Closed Monday that is also a blackout date and too soon.
        let monday = NaiveDate::from_ymd_opt(2030, 1, 7).unwrap();
        let mut policy = open_policy();
        policy.min_days_before_start = 7;
        policy.closed_weekdays = [Weekday::Mon].into_iter().collect();
        policy.blackout_dates.insert(monday);
        assert!(matches!(
            evaluate(&policy, monday, today()),
            Err(DateRejection::LeadTimeTooShort { .. })
        ));

        policy.min_days_before_start = 0;
        assert!(matches!(
            evaluate(&policy, monday, today()),
            Err(DateRejection::ClosedWeekday { .. })
        ));
    }

    #[test]
    fn scheduled_departures_only_when_custom_dates_disallowed() {
        let mut policy = open_policy();
        policy.allow_custom_date = false;
        policy.departure_dates.insert(days_from_today(14));
        assert_eq!(evaluate(&policy, days_from_today(14), today()), Ok(()));
        assert_eq!(
            evaluate(&policy, days_from_today(15), today()),
            Err(DateRejection::NotOffered { date: days_from_today(15) })
        );
    }

    #[test]
    fn huge_lead_time_does_not_overflow() {
        let mut policy = open_policy();
        policy.min_days_before_start = u32::MAX;
        assert!(matches!(
            evaluate(&policy, days_from_today(1), today()),
            Err(DateRejection::LeadTimeTooShort { .. })
        ));
    }
}
