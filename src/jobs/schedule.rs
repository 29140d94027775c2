/// Fire-time computation in the configured timezone
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// At `minute` past every local hour
    Hourly { minute: u32 },
    /// Fixed spacing from the previous run
    Every(Duration),
    /// Once a day at a local wall-clock time
    Daily { time: NaiveTime },
    /// Once a month on a day (1..=28) at a local wall-clock time
    Monthly { day: u32, time: NaiveTime },
}

impl Schedule {
    /// First fire time strictly after `after`
    pub fn next_after(&self, after: DateTime<Utc>, tz: Tz) -> DateTime<Utc> {
        match *self {
            Schedule::Hourly { minute } => {
                let local = after.with_timezone(&tz);
                // Offsets such as +03:30 shift the hour boundary, so work from the local minute
                let into_hour = Duration::minutes(local.minute() as i64)
                    + Duration::seconds(local.second() as i64)
                    + Duration::nanoseconds(local.nanosecond() as i64);
                let candidate = after - into_hour + Duration::minutes(minute as i64);
                if candidate > after {
                    candidate
                } else {
                    candidate + Duration::hours(1)
                }
            }
            Schedule::Every(every) => after + every,
            Schedule::Daily { time } => {
                let today = after.with_timezone(&tz).date_naive();
                let candidate = localize(tz, today.and_time(time));
                if candidate > after {
                    candidate
                } else {
                    localize(tz, (today + Duration::days(1)).and_time(time))
                }
            }
            Schedule::Monthly { day, time } => {
                let local_date = after.with_timezone(&tz).date_naive();
                let (year, month) = (local_date.year(), local_date.month());
                let candidate = localize(tz, month_day(year, month, day).and_time(time));
                if candidate > after {
                    candidate
                } else {
                    let (year, month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
                    localize(tz, month_day(year, month, day).and_time(time))
                }
            }
        }
    }
}

fn month_day(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day.clamp(1, 28))
        .unwrap_or(NaiveDate::MIN)
}

/// Map a local wall-clock time to an instant
///
/// Ambiguous times take the earlier instant. Times inside a DST gap move
/// forward by an hour.
pub fn localize(tz: Tz, naive: NaiveDateTime) -> DateTime<Utc> {
    if let Some(at) = tz.from_local_datetime(&naive).earliest() {
        return at.with_timezone(&Utc);
    }
    match tz.from_local_datetime(&(naive + Duration::hours(1))).earliest() {
        Some(at) => at.with_timezone(&Utc),
        None => Utc.from_utc_datetime(&naive),
    }
}

/// Local midnight of the day containing `now`
pub fn start_of_local_day(now: DateTime<Utc>, tz: Tz) -> DateTime<Utc> {
    let date = now.with_timezone(&tz).date_naive();
    localize(tz, date.and_time(NaiveTime::MIN))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::Asia::Tehran;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    fn clock(s: &str) -> NaiveTime {
        NaiveTime::parse_from_str(s, "%H:%M").unwrap()
    }

    #[test]
    fn test_hourly_uses_local_minute() {
        // 13:30 in Tehran; next local xx:01 is 14:01, i.e. 10:31 UTC
        let next = Schedule::Hourly { minute: 1 }.next_after(utc(2025, 3, 10, 10, 0), Tehran);
        assert_eq!(next, utc(2025, 3, 10, 10, 31));

        let again = Schedule::Hourly { minute: 1 }.next_after(next, Tehran);
        assert_eq!(again, utc(2025, 3, 10, 11, 31));
    }

    #[test]
    fn test_hourly_in_utc() {
        let next = Schedule::Hourly { minute: 1 }.next_after(utc(2025, 3, 10, 10, 0), chrono_tz::UTC);
        assert_eq!(next, utc(2025, 3, 10, 10, 1));
    }

    #[test]
    fn test_every() {
        let schedule = Schedule::Every(Duration::hours(4));
        assert_eq!(
            schedule.next_after(utc(2025, 3, 10, 10, 0), Tehran),
            utc(2025, 3, 10, 14, 0)
        );
    }

    #[test]
    fn test_daily_today_then_tomorrow() {
        let schedule = Schedule::Daily { time: clock("23:59") };
        let first = schedule.next_after(utc(2025, 3, 10, 10, 0), Tehran);
        assert_eq!(first, utc(2025, 3, 10, 20, 29));

        let second = schedule.next_after(first, Tehran);
        assert_eq!(second, utc(2025, 3, 11, 20, 29));
    }

    #[test]
    fn test_monthly_rolls_over_year() {
        let schedule = Schedule::Monthly { day: 1, time: clock("04:00") };
        assert_eq!(
            schedule.next_after(utc(2025, 3, 10, 0, 0), Tehran),
            utc(2025, 4, 1, 0, 30)
        );
        assert_eq!(
            schedule.next_after(utc(2025, 12, 5, 0, 0), Tehran),
            utc(2026, 1, 1, 0, 30)
        );
    }

    #[test]
    fn test_start_of_local_day() {
        // 2025-03-10 01:00 UTC is 04:30 local, midnight local is 20:30 UTC the day before
        assert_eq!(
            start_of_local_day(utc(2025, 3, 10, 1, 0), Tehran),
            utc(2025, 3, 9, 20, 30)
        );
    }

    #[test]
    fn test_localize_skips_dst_gap() {
        let ny = chrono_tz::America::New_York;
        let gap = NaiveDate::from_ymd_opt(2025, 3, 9)
            .unwrap()
            .and_time(clock("02:30"));
        // 03:30 EDT
        assert_eq!(localize(ny, gap), utc(2025, 3, 9, 7, 30));
    }
}
