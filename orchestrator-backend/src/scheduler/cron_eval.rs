//! Cron expression evaluation.
//!
//! Jobs are written in the classic 5-field crontab grammar
//! (`minute hour day-of-month month day-of-week`). The `cron` crate expects a
//! leading seconds field and numbers weekdays from 1 = Sunday, so expressions
//! are normalized before they are handed to it: a zero seconds field is
//! prepended and the weekday field is rewritten with day names.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use std::str::FromStr;

use crate::error::{OrchestratorError, Result};

const WEEKDAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// A parsed, timezone-bound schedule
#[derive(Debug, Clone)]
pub struct CronSchedule {
    /// Crontab fires when *either* day-of-month or day-of-week matches if both
    /// are restricted. The `cron` crate intersects them, so that case is split
    /// into two schedules and the earlier fire time wins.
    schedules: Vec<Schedule>,
    tz: Tz,
}

impl CronSchedule {
    pub fn parse(expression: &str, timezone: &str) -> Result<Self> {
        let tz = parse_timezone(timezone)?;
        let fields = split_fields(expression)?;
        let [minute, hour, dom, month, dow] = fields;

        // Restriction is judged on the fields as written: `0-6` covers every
        // weekday but still counts as restricted
        let dom_restricted = is_restricted(&dom);
        let dow_restricted = is_restricted(&dow);
        let dow = normalize_weekdays(&dow)?;

        let mut specs = Vec::with_capacity(2);
        if dom_restricted && dow_restricted {
            specs.push(format!("0 {} {} {} {} *", minute, hour, dom, month));
            specs.push(format!("0 {} {} * {} {}", minute, hour, month, dow));
        } else {
            specs.push(format!("0 {} {} {} {} {}", minute, hour, dom, month, dow));
        }

        let schedules = specs
            .iter()
            .map(|spec| {
                Schedule::from_str(spec).map_err(|e| {
                    OrchestratorError::InvalidScheduleExpression(format!("'{}': {}", expression, e))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { schedules, tz })
    }

    /// First fire time strictly after `after`
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let local = after.with_timezone(&self.tz);
        self.schedules
            .iter()
            .filter_map(|s| s.after(&local).next())
            .map(|dt| dt.with_timezone(&Utc))
            .min()
    }
}

/// Next fire time of `expression` in `timezone`, strictly after `after`
pub fn next_fire_time(expression: &str, timezone: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
    CronSchedule::parse(expression, timezone)?
        .next_after(after)
        .ok_or_else(|| {
            OrchestratorError::InvalidScheduleExpression(format!("'{}' never fires", expression))
        })
}

/// Check an expression and timezone at the API boundary
pub fn validate(expression: &str, timezone: &str) -> Result<()> {
    next_fire_time(expression, timezone, Utc::now()).map(|_| ())
}

pub fn parse_timezone(timezone: &str) -> Result<Tz> {
    let name = timezone.trim();
    if name.is_empty() {
        return Ok(chrono_tz::UTC);
    }
    name.parse::<Tz>().map_err(|_| {
        OrchestratorError::InvalidScheduleExpression(format!("unknown timezone '{}'", timezone))
    })
}

/// A day field is unrestricted when it starts with `*` (or is `?`)
fn is_restricted(field: &str) -> bool {
    !(field.starts_with('*') || field == "?")
}

fn expand_macro(expression: &str) -> Option<&'static str> {
    match expression.to_ascii_lowercase().as_str() {
        "@yearly" | "@annually" => Some("0 0 1 1 *"),
        "@monthly" => Some("0 0 1 * *"),
        "@weekly" => Some("0 0 * * 0"),
        "@daily" | "@midnight" => Some("0 0 * * *"),
        "@hourly" => Some("0 * * * *"),
        _ => None,
    }
}

fn split_fields(expression: &str) -> Result<[String; 5]> {
    let trimmed = expression.trim();
    let expanded = match expand_macro(trimmed) {
        Some(fields) => fields,
        None => trimmed,
    };
    let parts: Vec<String> = expanded.split_whitespace().map(str::to_string).collect();
    parts.try_into().map_err(|parts: Vec<String>| {
        OrchestratorError::InvalidScheduleExpression(format!(
            "'{}' has {} fields, expected 5 (minute hour day month weekday)",
            expression,
            parts.len()
        ))
    })
}

/// Weekday token as a crontab number (0..=7, both ends Sunday)
fn parse_weekday(token: &str, expression: &str) -> Result<usize> {
    let upper = token.trim().to_ascii_uppercase();
    if let Some(idx) = WEEKDAY_NAMES.iter().position(|n| *n == upper) {
        return Ok(idx);
    }
    match upper.parse::<usize>() {
        Ok(n) if n <= 7 => Ok(n),
        _ => Err(OrchestratorError::InvalidScheduleExpression(format!(
            "invalid weekday '{}' in '{}'",
            token, expression
        ))),
    }
}

/// Rewrite a crontab weekday field (0/7 = Sunday) as an explicit list of names
fn normalize_weekdays(field: &str) -> Result<String> {
    if field == "*" || field == "?" {
        return Ok(field.to_string());
    }

    let mut days = [false; 7];
    for item in field.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => {
                let step = step.parse::<usize>().ok().filter(|s| *s > 0).ok_or_else(|| {
                    OrchestratorError::InvalidScheduleExpression(format!(
                        "invalid weekday step in '{}'",
                        field
                    ))
                })?;
                (range, step)
            }
            None => (item, 1),
        };

        let (start, end) = if range == "*" {
            (0, 6)
        } else if let Some((a, b)) = range.split_once('-') {
            let start = parse_weekday(a, field)?;
            // Sunday closes a range as 7: 5-7 and FRI-SUN are FRI,SAT,SUN
            let end = match parse_weekday(b, field)? {
                0 if start > 0 => 7,
                n => n,
            };
            if end < start {
                return Err(OrchestratorError::InvalidScheduleExpression(format!(
                    "descending weekday range '{}'",
                    range
                )));
            }
            (start, end)
        } else {
            let day = parse_weekday(range, field)?;
            // A single value with a step (e.g. `1/2`) runs to the end of the week
            if step > 1 { (day, 6) } else { (day, day) }
        };

        let mut d = start;
        while d <= end {
            days[d % 7] = true;
            d += step;
        }
    }

    if days.iter().all(|d| *d) {
        return Ok("*".to_string());
    }
    Ok(days
        .iter()
        .enumerate()
        .filter(|(_, on)| **on)
        .map(|(i, _)| WEEKDAY_NAMES[i])
        .collect::<Vec<_>>()
        .join(","))
}

/// Best-effort human readable form of a 5-field expression
pub fn describe(expression: &str) -> String {
    let Ok(fields) = split_fields(expression) else {
        return expression.to_string();
    };
    let [minute, hour, dom, month, dow] = fields.map(|f| f.to_ascii_uppercase());
    let every_day = dom == "*" && month == "*";
    let num = |s: &str| s.parse::<u32>().ok();

    if every_day && dow == "*" {
        match (minute.as_str(), hour.as_str()) {
            ("*", "*") => return "Every minute".to_string(),
            (m, "*") if m.starts_with("*/") => {
                return format!("Every {} minutes", &m[2..]);
            }
            (m, "*") if num(m).is_some() => {
                return format!("Every hour at minute {}", m);
            }
            (m, h) if h.starts_with("*/") && num(m) == Some(0) => {
                return format!("Every {} hours", &h[2..]);
            }
            _ => {}
        }
    }

    let (Some(m), Some(h)) = (num(&minute), num(&hour)) else {
        return expression.to_string();
    };
    let at = format!("{:02}:{:02}", h, m);

    if every_day && dow == "*" {
        return format!("Every day at {}", at);
    }
    if every_day {
        let days = match dow.as_str() {
            "1-5" | "MON-FRI" => "weekday".to_string(),
            "0,6" | "6,0" | "SAT,SUN" | "SUN,SAT" => "weekend day".to_string(),
            other => match normalize_weekdays(other) {
                Ok(list) => list
                    .split(',')
                    .map(day_name)
                    .collect::<Vec<_>>()
                    .join(", "),
                Err(_) => return expression.to_string(),
            },
        };
        return format!("Every {} at {}", days, at);
    }
    if month == "*" && dow == "*" {
        if let Some(day) = num(&dom) {
            return format!("Monthly on day {} at {}", day, at);
        }
    }
    expression.to_string()
}

fn day_name(short: &str) -> &'static str {
    match short {
        "SUN" => "Sunday",
        "MON" => "Monday",
        "TUE" => "Tuesday",
        "WED" => "Wednesday",
        "THU" => "Thursday",
        "FRI" => "Friday",
        "SAT" => "Saturday",
        _ => "day",
    }
}
