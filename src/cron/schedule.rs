use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// When a job fires: a one-shot instant, a fixed interval, or a five-field
/// crontab expression (min hour dom month dow, UTC, minute resolution).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ScheduleSpec {
    #[serde(rename = "at")]
    At { at: String },
    #[serde(rename = "every")]
    Every {
        #[serde(rename = "everyMs")]
        every_ms: u64,
    },
    #[serde(rename = "cron")]
    Cron { expr: String },
}

/// Resolve the "JSON object or bare cron string" input form. A JSON object
/// with a `kind` wins; everything else (including invalid JSON) is treated
/// as a crontab expression.
pub fn parse_schedule(input: &str) -> ScheduleSpec {
    if let Ok(value) = serde_json::from_str::<Value>(input) {
        if value.get("kind").is_some() {
            if let Ok(spec) = serde_json::from_value::<ScheduleSpec>(value) {
                return spec;
            }
        }
    }
    ScheduleSpec::Cron {
        expr: input.trim().to_string(),
    }
}

pub fn parse_schedule_value(value: &Value) -> Option<ScheduleSpec> {
    match value {
        Value::String(s) => Some(parse_schedule(s)),
        Value::Object(_) => serde_json::from_value(value.clone()).ok(),
        _ => None,
    }
}

/// Next due time in epoch seconds, or 0 on error.
///
/// - `every`: `last == 0` means "due now"; otherwise `last + everyMs/1000`.
///   A zero interval is an error.
/// - `at`: the parsed instant; unparseable input is an error.
/// - `cron`: the next minute after `last` (or now when `last == 0`) whose
///   fields all match; invalid expressions are an error.
pub fn next_run(schedule: &ScheduleSpec, last_epoch_secs: u64) -> u64 {
    match schedule {
        ScheduleSpec::Every { every_ms } => {
            if *every_ms == 0 {
                return 0;
            }
            if last_epoch_secs == 0 {
                crate::util::now_ts_secs()
            } else {
                last_epoch_secs + every_ms / 1000
            }
        }
        ScheduleSpec::At { at } => parse_iso_epoch(at).unwrap_or(0),
        ScheduleSpec::Cron { expr } => {
            let after = if last_epoch_secs == 0 {
                crate::util::now_ts_secs()
            } else {
                last_epoch_secs
            };
            let Some(after_dt) = Utc.timestamp_opt(after as i64, 0).single() else {
                return 0;
            };
            cron_next(expr, &after_dt)
                .map(|dt| dt.timestamp() as u64)
                .unwrap_or(0)
        }
    }
}

fn parse_iso_epoch(input: &str) -> Option<u64> {
    if input.trim().is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        let ts = dt.timestamp();
        return (ts >= 0).then_some(ts as u64);
    }
    // Naive timestamps are read as UTC.
    if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(input, "%Y-%m-%dT%H:%M:%S") {
        let ts = naive.and_utc().timestamp();
        return (ts >= 0).then_some(ts as u64);
    }
    None
}

/// Parse a cron field and check if a value matches.
fn cron_field_matches(field: &str, value: u32) -> bool {
    if field == "*" {
        return true;
    }
    // Handle */N (every N)
    if let Some(step) = field.strip_prefix("*/") {
        if let Ok(n) = step.parse::<u32>() {
            return n > 0 && value % n == 0;
        }
        return false;
    }
    // Handle comma-separated values
    for part in field.split(',') {
        // Handle range N-M
        if let Some((start_s, end_s)) = part.split_once('-') {
            if let (Ok(start), Ok(end)) = (start_s.parse::<u32>(), end_s.parse::<u32>()) {
                if value >= start && value <= end {
                    return true;
                }
            }
        } else if let Ok(n) = part.parse::<u32>() {
            if value == n {
                return true;
            }
        }
    }
    false
}

fn is_valid_field(field: &str) -> bool {
    if field == "*" {
        return true;
    }
    if let Some(step) = field.strip_prefix("*/") {
        return step.parse::<u32>().map(|n| n > 0).unwrap_or(false);
    }
    field.split(',').all(|part| {
        if let Some((a, b)) = part.split_once('-') {
            a.parse::<u32>().is_ok() && b.parse::<u32>().is_ok()
        } else {
            part.parse::<u32>().is_ok()
        }
    })
}

/// Check if a UTC datetime matches a 5-field cron expression.
pub fn cron_matches(expr: &str, dt: &DateTime<Utc>) -> bool {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
        return false;
    }
    cron_field_matches(fields[0], dt.minute())
        && cron_field_matches(fields[1], dt.hour())
        && cron_field_matches(fields[2], dt.day())
        && cron_field_matches(fields[3], dt.month())
        && cron_field_matches(fields[4], dt.weekday().num_days_from_sunday())
}

/// Compute the next occurrence strictly after `after`. Walks minute by
/// minute, bounded at one year.
pub fn cron_next(expr: &str, after: &DateTime<Utc>) -> Option<DateTime<Utc>> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 || !fields.iter().all(|f| is_valid_field(f)) {
        return None;
    }

    let mut candidate = (*after + chrono::Duration::seconds(60 - after.second() as i64))
        .with_second(0)
        .unwrap_or(*after)
        .with_nanosecond(0)
        .unwrap_or(*after);

    let max_checks = 366 * 24 * 60; // one year of minutes
    for _ in 0..max_checks {
        if cron_matches(expr, &candidate) {
            return Some(candidate);
        }
        candidate += chrono::Duration::minutes(1);
    }
    None
}
