//! Schedule evaluation: when does a [`ScheduleSpec`] fire next.
//!
//! Cron expressions use the standard five fields (minute, hour,
//! day-of-month, month, day-of-week) evaluated in UTC. Parsing is delegated
//! to the `cron` crate, which wants a leading seconds field and numbers
//! weekdays 1-7 from Sunday, so expressions are rewritten before parsing.
//!
//! When both day-of-month and day-of-week are restricted, a day matches if
//! either field matches. A field starting with `*` counts as unrestricted.

use std::collections::BTreeSet;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use cron::Schedule;

use agentcron_types::ScheduleSpec;

use crate::error::{CronError, Result};

/// Next instant strictly after `after` at which `spec` fires.
///
/// `Once` schedules whose instant is not after `after` yield `None`.
pub fn next_trigger(spec: &ScheduleSpec, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
    match spec {
        ScheduleSpec::Interval { minutes } => {
            check_interval(*minutes)?;
            Ok(Some(after + Duration::minutes(i64::from(*minutes))))
        }
        ScheduleSpec::Cron { expression } => Ok(parse_cron(expression)?.next_after(after)),
        ScheduleSpec::Once { execute_at } => Ok((*execute_at > after).then_some(*execute_at)),
    }
}

/// Reject schedules that can never be evaluated.
pub fn validate(spec: &ScheduleSpec) -> Result<()> {
    match spec {
        ScheduleSpec::Interval { minutes } => check_interval(*minutes),
        ScheduleSpec::Cron { expression } => parse_cron(expression).map(|_| ()),
        ScheduleSpec::Once { .. } => Ok(()),
    }
}

/// `nextRunAt` for a task that has just been created or enabled.
///
/// An elapsed `Once` still returns its instant so it fires on the next tick.
pub fn initial_next_run(spec: &ScheduleSpec, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
    match spec {
        ScheduleSpec::Once { execute_at } => Ok(Some(*execute_at)),
        _ => next_trigger(spec, now),
    }
}

/// The next `count` trigger instants after `after`.
pub fn upcoming(
    spec: &ScheduleSpec,
    after: DateTime<Utc>,
    count: usize,
) -> Result<Vec<DateTime<Utc>>> {
    let mut times = Vec::new();
    let mut cursor = after;
    while times.len() < count {
        match next_trigger(spec, cursor)? {
            Some(next) => {
                times.push(next);
                cursor = next;
            }
            None => break,
        }
    }
    Ok(times)
}

fn check_interval(minutes: u32) -> Result<()> {
    if minutes == 0 {
        return Err(CronError::InvalidSchedule(
            "interval must be at least 1 minute".to_string(),
        ));
    }
    Ok(())
}

/// A parsed cron expression. Two schedules are kept when day-of-month and
/// day-of-week are both restricted, one per field.
struct CronTimes {
    schedules: Vec<Schedule>,
}

impl CronTimes {
    fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedules
            .iter()
            .filter_map(|schedule| schedule.after(&after).next())
            .min()
    }
}

fn parse_cron(expression: &str) -> Result<CronTimes> {
    let invalid = |e: &dyn std::fmt::Display| {
        CronError::InvalidSchedule(format!("cron expression '{expression}': {e}"))
    };

    let fields: Vec<&str> = expression.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(CronError::InvalidSchedule(format!(
            "cron expression '{expression}' must have 5 fields, found {}",
            fields.len()
        )));
    }
    let [minute, hour, dom, month, dow] = [fields[0], fields[1], fields[2], fields[3], fields[4]];
    let dow_translated = translate_day_of_week(dow).map_err(|e| invalid(&e))?;

    let dom_restricted = !dom.starts_with('*') && dom != "?";
    let dow_restricted = !dow.starts_with('*') && dow != "?" && dow_translated != "*";

    let day_pairs: Vec<(&str, &str)> = if dom_restricted && dow_restricted {
        vec![(dom, "*"), ("*", dow_translated.as_str())]
    } else {
        vec![(dom, dow_translated.as_str())]
    };

    let schedules = day_pairs
        .into_iter()
        .map(|(dom, dow)| {
            Schedule::from_str(&format!("0 {minute} {hour} {dom} {month} {dow}"))
                .map_err(|e| invalid(&e))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(CronTimes { schedules })
}

const DAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// Rewrite a standard day-of-week field (0-7, Sunday as 0 or 7, names) as
/// an explicit list in the `cron` crate's 1-7 numbering.
fn translate_day_of_week(field: &str) -> std::result::Result<String, String> {
    if field == "*" || field == "?" {
        return Ok(field.to_string());
    }

    let mut days = BTreeSet::new();
    for item in field.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => {
                let step: u8 = step
                    .parse()
                    .map_err(|_| format!("invalid day-of-week step '{step}'"))?;
                if step == 0 {
                    return Err("day-of-week step must be positive".to_string());
                }
                (range, Some(step))
            }
            None => (item, None),
        };

        let (lo, hi) = if range == "*" {
            (0, 6)
        } else if let Some((lo, hi)) = range.split_once('-') {
            (parse_day(lo)?, parse_day(hi)?)
        } else {
            let day = parse_day(range)?;
            if step.is_some() { (day, 6) } else { (day, day) }
        };
        if lo > hi {
            return Err(format!("day-of-week range '{range}' is reversed"));
        }

        for day in (lo..=hi).step_by(usize::from(step.unwrap_or(1))) {
            days.insert(day % 7);
        }
    }

    if days.len() == 7 {
        return Ok("*".to_string());
    }
    Ok(days
        .iter()
        .map(|d| (d + 1).to_string())
        .collect::<Vec<_>>()
        .join(","))
}

fn parse_day(token: &str) -> std::result::Result<u8, String> {
    if let Ok(n) = token.parse::<u8>() {
        if n <= 7 {
            return Ok(n);
        }
        return Err(format!("day-of-week {n} out of range 0-7"));
    }
    DAY_NAMES
        .iter()
        .position(|name| name.eq_ignore_ascii_case(token))
        .map(|i| i as u8)
        .ok_or_else(|| format!("unknown day-of-week '{token}'"))
}
