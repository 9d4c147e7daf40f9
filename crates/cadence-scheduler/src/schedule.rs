//! Standard 5-field cron expressions evaluated in UTC.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;

use crate::error::{Result, SchedulerError};

/// A parsed `minute hour day-of-month month day-of-week` expression.
///
/// Day-of-week numbers use the standard 0-7 convention (0 and 7 are
/// Sunday). The `cron` crate wants a leading seconds field and numbers
/// days 1-7 from Sunday, so the expression is rewritten before parsing;
/// the original text is kept for display and persistence.
///
/// When both day fields are restricted a day matches if either field does,
/// as in crontab. The `cron` crate requires both, so that case is split
/// into one schedule per day field and the earlier occurrence wins.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expression: String,
    inner: Schedule,
    by_weekday: Option<Schedule>,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(invalid(
                expression,
                format!("expected 5 fields, found {}", fields.len()),
            ));
        }
        let (minute, hour, day_of_month, month) = (fields[0], fields[1], fields[2], fields[3]);

        let day_of_week =
            translate_day_of_week(fields[4]).map_err(|reason| invalid(expression, reason))?;
        let build = |dom: &str, dow: &str| {
            Schedule::from_str(&format!("0 {minute} {hour} {dom} {month} {dow}"))
                .map_err(|e| invalid(expression, e.to_string()))
        };

        let (inner, by_weekday) = if is_restricted(day_of_month) && is_restricted(&day_of_week) {
            (build(day_of_month, "*")?, Some(build("*", &day_of_week)?))
        } else {
            (build(day_of_month, &day_of_week)?, None)
        };

        Ok(Self {
            expression: expression.to_string(),
            inner,
            by_weekday,
        })
    }

    /// First occurrence strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let next = self.inner.after(&after).next();
        let Some(by_weekday) = &self.by_weekday else {
            return next;
        };
        match (next, by_weekday.after(&after).next()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

impl FromStr for CronSchedule {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}

fn invalid(expression: &str, reason: impl Into<String>) -> SchedulerError {
    SchedulerError::InvalidSchedule {
        expression: expression.to_string(),
        reason: reason.into(),
    }
}

/// Rewrite numeric day-of-week tokens from 0-7 (Sunday = 0 or 7) to the
/// 1-7 (Sunday = 1) numbering the `cron` crate expects. Names and `*`
/// pass through unchanged.
fn translate_day_of_week(field: &str) -> std::result::Result<String, String> {
    let mut parts = Vec::new();

    for item in field.split(',') {
        let (base, step) = match item.split_once('/') {
            Some((base, step)) => (base, Some(step)),
            None => (item, None),
        };

        let base = match base.split_once('-') {
            None if base == "*" || base == "?" => base.to_string(),
            None => map_day(base)?,
            // 5-7 wraps past Saturday in the target numbering: Fri-Sat plus Sun.
            Some((start, "7")) if is_weekday_number(start) => {
                if step.is_some() {
                    return Err(format!("unsupported day-of-week range with step: {item}"));
                }
                let start = map_day(start)?;
                parts.push(if start == "7" { start } else { format!("{start}-7") });
                parts.push("1".to_string());
                continue;
            }
            Some(("0", "7")) => "1-7".to_string(),
            Some((start, end)) => format!("{}-{}", map_day(start)?, map_day(end)?),
        };

        parts.push(match step {
            Some(step) => format!("{base}/{step}"),
            None => base,
        });
    }

    Ok(parts.join(","))
}

/// Crontab treats any day field starting with `*` as unrestricted.
fn is_restricted(field: &str) -> bool {
    !field.starts_with('*') && field != "?"
}

fn is_weekday_number(token: &str) -> bool {
    matches!(token, "1" | "2" | "3" | "4" | "5" | "6")
}

fn map_day(token: &str) -> std::result::Result<String, String> {
    if token.is_empty() {
        return Err("empty day-of-week token".to_string());
    }
    if !token.bytes().all(|b| b.is_ascii_digit()) {
        return Ok(token.to_string());
    }
    match token.parse::<u8>() {
        Ok(n) if n <= 7 => Ok(((n % 7) + 1).to_string()),
        _ => Err(format!("day-of-week out of range: {token}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn every_minute_fires_at_start_of_next_minute() {
        let schedule = CronSchedule::parse("* * * * *").unwrap();
        let next = schedule.next_after(at(2026, 10, 16, 12, 0, 30)).unwrap();
        assert_eq!(next, at(2026, 10, 16, 12, 1, 0));
    }

    #[test]
    fn occurrence_is_strictly_after_the_instant() {
        let schedule = CronSchedule::parse("* * * * *").unwrap();
        let next = schedule.next_after(at(2026, 10, 16, 12, 1, 0)).unwrap();
        assert_eq!(next, at(2026, 10, 16, 12, 2, 0));
    }

    #[test]
    fn daily_rolls_over_to_tomorrow() {
        let schedule = CronSchedule::parse("0 3 * * *").unwrap();
        let next = schedule.next_after(at(2026, 10, 16, 12, 0, 0)).unwrap();
        assert_eq!(next, at(2026, 10, 17, 3, 0, 0));
    }

    #[test]
    fn day_of_week_uses_sunday_zero() {
        // 2026-10-16 is a Friday.
        let from = at(2026, 10, 16, 12, 0, 0);

        let monday = CronSchedule::parse("0 9 * * 1").unwrap();
        assert_eq!(monday.next_after(from).unwrap(), at(2026, 10, 19, 9, 0, 0));

        let sunday = CronSchedule::parse("0 9 * * 0").unwrap();
        assert_eq!(sunday.next_after(from).unwrap(), at(2026, 10, 18, 9, 0, 0));

        let sunday_seven = CronSchedule::parse("0 9 * * 7").unwrap();
        assert_eq!(sunday_seven.next_after(from).unwrap(), at(2026, 10, 18, 9, 0, 0));
    }

    #[test]
    fn day_of_week_ranges_and_names() {
        let from = at(2026, 10, 16, 12, 0, 0);

        let weekend = CronSchedule::parse("0 9 * * 6-7").unwrap();
        assert_eq!(weekend.next_after(from).unwrap(), at(2026, 10, 17, 9, 0, 0));

        let weekdays = CronSchedule::parse("0 9 * * MON-FRI").unwrap();
        assert_eq!(weekdays.next_after(from).unwrap(), at(2026, 10, 19, 9, 0, 0));

        let numeric_weekdays = CronSchedule::parse("0 9 * * 1-5").unwrap();
        assert_eq!(
            numeric_weekdays.next_after(from).unwrap(),
            at(2026, 10, 19, 9, 0, 0)
        );
    }

    #[test]
    fn restricted_day_fields_match_either_day() {
        let from = at(2026, 10, 16, 12, 0, 0);

        // First of the month or any Monday: Monday the 19th comes first.
        let schedule = CronSchedule::parse("0 9 1 * 1").unwrap();
        assert_eq!(schedule.next_after(from).unwrap(), at(2026, 10, 19, 9, 0, 0));
        assert_eq!(
            schedule.next_after(at(2026, 10, 26, 9, 0, 0)).unwrap(),
            at(2026, 11, 1, 9, 0, 0)
        );

        // The 17th (a Saturday) comes before Sunday the 18th.
        let schedule = CronSchedule::parse("30 6 17 * 0").unwrap();
        assert_eq!(schedule.next_after(from).unwrap(), at(2026, 10, 17, 6, 30, 0));
    }

    #[test]
    fn wildcard_day_field_keeps_the_other_restriction() {
        let from = at(2026, 10, 16, 12, 0, 0);
        let schedule = CronSchedule::parse("0 9 1 * *").unwrap();
        assert_eq!(schedule.next_after(from).unwrap(), at(2026, 11, 1, 9, 0, 0));
    }

    #[test]
    fn keeps_original_expression() {
        let schedule: CronSchedule = "*/15 * * * 1-5".parse().unwrap();
        assert_eq!(schedule.to_string(), "*/15 * * * 1-5");
    }

    #[test]
    fn rejects_malformed_expressions() {
        for bad in ["", "* * * *", "0 0 0 * * *", "61 * * * *", "* * * * 8", "not a cron"] {
            let err = CronSchedule::parse(bad).unwrap_err();
            assert!(
                matches!(err, SchedulerError::InvalidSchedule { .. }),
                "expected InvalidSchedule for {bad:?}"
            );
        }
    }
}
