use chrono::{Days, LocalResult, TimeZone};

use crate::model::{Ms, Recurrence, DAY_MS};

/// Shift a wall-clock instant by `days` calendar days, keeping the local
/// time-of-day fixed. A naive `t + days*86400s` drifts by an hour across a
/// DST transition; this decomposes into local date + time-of-day, adds the
/// days on the date, and recomposes through the timezone.
///
/// Ambiguous local times (fall-back hour) resolve to the earlier instant;
/// nonexistent local times (spring-forward gap) slide forward one hour.
pub fn add_days<Tz: TimeZone>(tz: &Tz, t: Ms, days: i32) -> Ms {
    let Some(dt) = tz.timestamp_millis_opt(t).earliest() else {
        return t + Ms::from(days) * DAY_MS;
    };
    let local = dt.naive_local();
    let shifted = if days >= 0 {
        local.checked_add_days(Days::new(days as u64))
    } else {
        local.checked_sub_days(Days::new(u64::from(days.unsigned_abs())))
    };
    let Some(shifted) = shifted else {
        return t + Ms::from(days) * DAY_MS;
    };
    match tz.from_local_datetime(&shifted) {
        LocalResult::Single(out) => out.timestamp_millis(),
        LocalResult::Ambiguous(early, _late) => early.timestamp_millis(),
        LocalResult::None => {
            // Landed inside a spring-forward gap.
            let bumped = shifted + chrono::Duration::hours(1);
            match tz.from_local_datetime(&bumped) {
                LocalResult::Single(out) => out.timestamp_millis(),
                LocalResult::Ambiguous(early, _) => early.timestamp_millis(),
                LocalResult::None => t + Ms::from(days) * DAY_MS,
            }
        }
    }
}

/// Advance a reservation window by exactly one recurrence period.
/// Non-recurring windows come back unchanged.
pub fn advance_window<Tz: TimeZone>(tz: &Tz, start: Ms, end: Ms, rec: Recurrence) -> (Ms, Ms) {
    match rec.period_days() {
        Some(days) => (add_days(tz, start, days), add_days(tz, end, days)),
        None => (start, end),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, FixedOffset, NaiveDate, NaiveDateTime, Offset, Timelike, Utc};

    /// US-Eastern rules, hardcoded so the DST tests are deterministic
    /// regardless of the host TZ database: EST (UTC-5) except between the
    /// second Sunday of March 02:00 local and the first Sunday of November
    /// 02:00 local, which runs EDT (UTC-4).
    #[derive(Clone, Copy, Debug)]
    struct Eastern;

    const EST: i32 = -5 * 3600;
    const EDT: i32 = -4 * 3600;

    fn nth_sunday(year: i32, month: u32, n: u32) -> NaiveDate {
        let first = NaiveDate::from_ymd_opt(year, month, 1).unwrap();
        let to_sunday = (7 - first.weekday().num_days_from_sunday()) % 7;
        first + chrono::Duration::days(i64::from(to_sunday) + i64::from(n - 1) * 7)
    }

    fn spring_forward_utc(year: i32) -> NaiveDateTime {
        // 02:00 EST == 07:00 UTC
        nth_sunday(year, 3, 2).and_hms_opt(7, 0, 0).unwrap()
    }

    fn fall_back_utc(year: i32) -> NaiveDateTime {
        // 02:00 EDT == 06:00 UTC
        nth_sunday(year, 11, 1).and_hms_opt(6, 0, 0).unwrap()
    }

    fn dst_active_utc(utc: &NaiveDateTime) -> bool {
        let y = utc.year();
        *utc >= spring_forward_utc(y) && *utc < fall_back_utc(y)
    }

    impl TimeZone for Eastern {
        type Offset = FixedOffset;

        fn from_offset(_offset: &FixedOffset) -> Self {
            Eastern
        }

        fn offset_from_local_date(&self, local: &NaiveDate) -> LocalResult<FixedOffset> {
            self.offset_from_local_datetime(&local.and_hms_opt(12, 0, 0).unwrap())
        }

        fn offset_from_local_datetime(&self, local: &NaiveDateTime) -> LocalResult<FixedOffset> {
            let est = FixedOffset::east_opt(EST).unwrap();
            let edt = FixedOffset::east_opt(EDT).unwrap();
            let y = local.year();
            let spring = nth_sunday(y, 3, 2);
            let fall = nth_sunday(y, 11, 1);

            if local.date() == spring && local.hour() == 2 {
                return LocalResult::None; // gap: 02:00–03:00 does not exist
            }
            if local.date() == fall && local.hour() == 1 {
                return LocalResult::Ambiguous(edt, est); // repeated hour
            }

            let after_spring = local.date() > spring
                || (local.date() == spring && local.hour() >= 3);
            let before_fall =
                local.date() < fall || (local.date() == fall && local.hour() < 2);
            if after_spring && before_fall {
                LocalResult::Single(edt)
            } else {
                LocalResult::Single(est)
            }
        }

        fn offset_from_utc_date(&self, utc: &NaiveDate) -> FixedOffset {
            self.offset_from_utc_datetime(&utc.and_hms_opt(12, 0, 0).unwrap())
        }

        fn offset_from_utc_datetime(&self, utc: &NaiveDateTime) -> FixedOffset {
            if dst_active_utc(utc) {
                FixedOffset::east_opt(EDT).unwrap()
            } else {
                FixedOffset::east_opt(EST).unwrap()
            }
        }
    }

    fn et_ms(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> Ms {
        Eastern
            .with_ymd_and_hms(y, mo, d, h, mi, 0)
            .earliest()
            .unwrap()
            .timestamp_millis()
    }

    #[test]
    fn add_days_plain_utc() {
        let t = Utc
            .with_ymd_and_hms(2026, 6, 1, 9, 30, 0)
            .unwrap()
            .timestamp_millis();
        assert_eq!(add_days(&Utc, t, 1), t + DAY_MS);
        assert_eq!(add_days(&Utc, t, 7), t + 7 * DAY_MS);
        assert_eq!(add_days(&Utc, t, 0), t);
    }

    #[test]
    fn add_days_across_spring_forward() {
        // 2026-03-08 is the second Sunday of March. A daily 09:00 window
        // advanced from Saturday to Sunday keeps 09:00 local, which is only
        // 23 hours of elapsed wall time.
        let sat = et_ms(2026, 3, 7, 9, 0);
        let sun = add_days(&Eastern, sat, 1);
        assert_eq!(sun, et_ms(2026, 3, 8, 9, 0));
        assert_eq!(sun - sat, DAY_MS - 3_600_000);
    }

    #[test]
    fn add_days_across_fall_back() {
        // 2026-11-01 is the first Sunday of November: 25 elapsed hours.
        let sat = et_ms(2026, 10, 31, 9, 0);
        let sun = add_days(&Eastern, sat, 1);
        assert_eq!(sun - sat, DAY_MS + 3_600_000);
    }

    #[test]
    fn add_days_into_gap_slides_forward() {
        // 02:30 local advanced onto the spring-forward day has no 02:30;
        // the window slides to 03:30.
        let before = et_ms(2026, 3, 7, 2, 30);
        let shifted = add_days(&Eastern, before, 1);
        let dt = Eastern.timestamp_millis_opt(shifted).earliest().unwrap();
        assert_eq!((dt.hour(), dt.minute()), (3, 30));
    }

    #[test]
    fn add_days_ambiguous_resolves_earliest() {
        let before = et_ms(2026, 10, 31, 1, 30);
        let shifted = add_days(&Eastern, before, 1);
        // Earliest of the two 01:30s is the EDT one.
        let expect = Eastern
            .from_local_datetime(
                &NaiveDate::from_ymd_opt(2026, 11, 1)
                    .unwrap()
                    .and_hms_opt(1, 30, 0)
                    .unwrap(),
            )
            .earliest()
            .unwrap();
        assert_eq!(shifted, expect.timestamp_millis());
    }

    #[test]
    fn advance_window_daily_and_weekly() {
        let start = et_ms(2026, 3, 7, 9, 0);
        let end = et_ms(2026, 3, 7, 10, 0);
        let (s1, e1) = advance_window(&Eastern, start, end, Recurrence::Daily);
        assert_eq!(s1, et_ms(2026, 3, 8, 9, 0));
        assert_eq!(e1 - s1, end - start);

        let (s7, e7) = advance_window(&Eastern, start, end, Recurrence::Weekly);
        assert_eq!(s7, et_ms(2026, 3, 14, 9, 0));
        assert_eq!(e7 - s7, end - start);

        assert_eq!(
            advance_window(&Eastern, start, end, Recurrence::None),
            (start, end)
        );
    }

    #[test]
    fn add_days_negative() {
        let t = Utc
            .with_ymd_and_hms(2026, 6, 10, 12, 0, 0)
            .unwrap()
            .timestamp_millis();
        assert_eq!(add_days(&Utc, t, -3), t - 3 * DAY_MS);
    }

    #[test]
    fn offset_impl_sanity() {
        // Noon in January is EST, noon in July is EDT.
        let jan = Eastern.with_ymd_and_hms(2026, 1, 15, 12, 0, 0).unwrap();
        let jul = Eastern.with_ymd_and_hms(2026, 7, 15, 12, 0, 0).unwrap();
        assert_eq!(jan.offset().fix().local_minus_utc(), EST);
        assert_eq!(jul.offset().fix().local_minus_utc(), EDT);
    }
}
