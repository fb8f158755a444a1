//! Next-run computation for schedule configs.

use chrono::{
    DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc,
};
use chrono_tz::Tz;

use crate::error::SchedulerError;
use crate::pipeline::{Frequency, ScheduleConfig};
use crate::scheduler::cron::CronExpression;

/// Longest DST gap we step across when a calendar boundary falls inside one.
const MAX_GAP_MINUTES: i64 = 180;

/// Parse an IANA zone name, falling back to UTC when none is given.
pub fn resolve_timezone(name: Option<&str>) -> Result<Tz, SchedulerError> {
    match name {
        None => Ok(Tz::UTC),
        Some(name) => name
            .parse::<Tz>()
            .map_err(|_| SchedulerError::InvalidTimezone {
                name: name.to_string(),
            }),
    }
}

/// Compute the next time a schedule should fire after `now`.
///
/// Calendar boundaries (hours, midnights, month starts) are taken in the
/// schedule's own timezone, else `default_timezone`, else UTC.
pub fn calculate_next_run(
    schedule: &ScheduleConfig,
    now: DateTime<Utc>,
    default_timezone: Option<&str>,
) -> Result<DateTime<Utc>, SchedulerError> {
    let tz = resolve_timezone(schedule.timezone.as_deref().or(default_timezone))?;
    let local = now.with_timezone(&tz).naive_local();

    let next = match schedule.frequency {
        Frequency::Once => return Ok(schedule.start_time.unwrap_or(now)),
        Frequency::Hourly => {
            // Step in UTC from the start of the current local hour so a repeated
            // or skipped wall-clock hour is neither lost nor doubled.
            let into_hour = Duration::minutes(i64::from(local.minute()))
                + Duration::seconds(i64::from(local.second()))
                + Duration::nanoseconds(i64::from(local.nanosecond()));
            let next = now - into_hour + Duration::hours(1);
            // Half-hour offset changes land mid-hour.
            let minute = next.with_timezone(&tz).minute();
            if minute == 0 {
                Some(next)
            } else {
                Some(next + Duration::minutes(i64::from(60 - minute)))
            }
        }
        Frequency::Daily => midnight(&tz, local.date().succ_opt()),
        Frequency::Weekly => midnight(&tz, local.date().checked_add_days(chrono::Days::new(7))),
        Frequency::Monthly => {
            let date = local.date();
            let first = if date.month() == 12 {
                NaiveDate::from_ymd_opt(date.year() + 1, 1, 1)
            } else {
                NaiveDate::from_ymd_opt(date.year(), date.month() + 1, 1)
            };
            midnight(&tz, first)
        }
        Frequency::Cron => {
            let expression = schedule
                .cron_expression
                .as_deref()
                .ok_or(SchedulerError::MissingCronExpression)?;
            let cron = CronExpression::parse(expression)?;
            return next_cron_run(&cron, &tz, now);
        }
    };

    next.ok_or_else(|| SchedulerError::NoUpcomingRun {
        expression: schedule.frequency.to_string(),
    })
}

/// The first cron match strictly after `now`, evaluated in `tz`.
///
/// Matches that fall in a DST gap are skipped. Ambiguous local times fire at
/// their earliest instant.
pub fn next_cron_run(
    cron: &CronExpression,
    tz: &Tz,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>, SchedulerError> {
    let no_run = || SchedulerError::NoUpcomingRun {
        expression: cron.source().to_string(),
    };
    let local = now.with_timezone(tz).naive_local();
    let mut start = local
        .date()
        .and_hms_opt(local.hour(), local.minute(), 0)
        .ok_or_else(no_run)?
        + Duration::minutes(1);

    loop {
        let candidate = cron.next_from(start).ok_or_else(no_run)?;
        match tz.from_local_datetime(&candidate) {
            LocalResult::Single(at) if at.with_timezone(&Utc) > now => {
                return Ok(at.with_timezone(&Utc));
            }
            LocalResult::Ambiguous(first, _) if first.with_timezone(&Utc) > now => {
                return Ok(first.with_timezone(&Utc));
            }
            _ => start = candidate + Duration::minutes(1),
        }
    }
}

fn earliest(tz: &Tz, local: NaiveDateTime) -> Option<DateTime<Utc>> {
    tz.from_local_datetime(&local)
        .earliest()
        .map(|at| at.with_timezone(&Utc))
}

/// Local midnight of `date`, or the first valid minute after it when midnight
/// falls in a DST gap.
fn midnight(tz: &Tz, date: Option<NaiveDate>) -> Option<DateTime<Utc>> {
    let start = date?.and_hms_opt(0, 0, 0)?;
    (0..=MAX_GAP_MINUTES).find_map(|offset| earliest(tz, start + Duration::minutes(offset)))
}
