//! Schedule evaluation for SCHEDULED requests.
//!
//! Requests carry either a 5-field CRON expression or a quartz expression
//! (seconds first, optional year, `?` placeholders). Both are normalized to
//! the 6/7-field format of the `cron` crate, whose day-of-week numbering is
//! quartz-style (1 = Sunday).

use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;

use fleet_state::{Request, ScheduleType, ValidationError};

/// Translate an expression of the given type into `cron` crate syntax.
pub fn normalize(expression: &str, schedule_type: ScheduleType) -> Result<String, String> {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    match schedule_type {
        ScheduleType::Cron => {
            if fields.len() != 5 {
                return Err(format!(
                    "expected 5 fields (minute hour day month weekday), got {}",
                    fields.len()
                ));
            }
            let day_of_week = convert_day_of_week(fields[4])?;
            Ok(format!(
                "0 {} {} {} {} {}",
                fields[0],
                fields[1],
                any_placeholder(fields[2]),
                fields[3],
                day_of_week
            ))
        }
        ScheduleType::Quartz => {
            if !(6..=7).contains(&fields.len()) {
                return Err(format!("expected 6 or 7 fields, got {}", fields.len()));
            }
            Ok(fields
                .iter()
                .map(|f| any_placeholder(f))
                .collect::<Vec<_>>()
                .join(" "))
        }
    }
}

fn any_placeholder(field: &str) -> &str {
    if field == "?" { "*" } else { field }
}

/// Shift CRON weekdays (0-7, Sunday = 0 or 7) to quartz weekdays (1-7, Sunday = 1).
fn convert_day_of_week(field: &str) -> Result<String, String> {
    let field = any_placeholder(field);
    let mut parts = Vec::new();
    for item in field.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => (range, Some(step)),
            None => (item, None),
        };
        let converted = match range.split_once('-') {
            Some((start, end)) => match (start.parse::<u32>(), end.parse::<u32>()) {
                (Ok(0), Ok(7)) => "1-7".to_string(),
                // `5-7` ends on Sunday, which wraps to the front of the week.
                (Ok(s @ 1..=6), Ok(7)) => format!("{}-7,1", s + 1),
                _ => format!("{}-{}", shift_day(start)?, shift_day(end)?),
            },
            None if range == "*" => range.to_string(),
            None => shift_day(range)?.to_string(),
        };
        match step {
            Some(step) => parts.push(format!("{converted}/{step}")),
            None => parts.push(converted),
        }
    }
    Ok(parts.join(","))
}

fn shift_day(day: &str) -> Result<String, String> {
    match day.parse::<u32>() {
        Ok(n @ 0..=6) => Ok((n + 1).to_string()),
        Ok(7) => Ok("1".to_string()),
        Ok(n) => Err(format!("day of week {n} is out of range 0-7")),
        // Named days (MON, TUE, ...) mean the same thing in both dialects.
        Err(_) => Ok(day.to_string()),
    }
}

/// Parse the request's effective schedule.
///
/// Returns `Ok(None)` for requests without a schedule.
pub fn parse_schedule(request: &Request) -> Result<Option<Schedule>, ValidationError> {
    let Some((expression, schedule_type)) = request.effective_schedule() else {
        return Ok(None);
    };
    let invalid = |reason: String| ValidationError::InvalidSchedule {
        id: request.id().to_string(),
        schedule: expression.to_string(),
        reason,
    };
    let normalized = normalize(expression, schedule_type).map_err(invalid)?;
    let schedule = Schedule::from_str(&normalized).map_err(|e| invalid(e.to_string()))?;
    Ok(Some(schedule))
}

/// Structural validation plus schedule parseability.
pub fn validate_request(request: &Request) -> Result<(), ValidationError> {
    request.validate()?;
    let schedule = parse_schedule(request)?;
    if let (Some(schedule), Some((expression, _))) = (schedule, request.effective_schedule()) {
        if schedule.upcoming(Utc).next().is_none() {
            return Err(ValidationError::InvalidSchedule {
                id: request.id().to_string(),
                schedule: expression.to_string(),
                reason: "schedule never fires".to_string(),
            });
        }
    }
    Ok(())
}

/// First fire time strictly after `now` (Unix millis).
///
/// `None` when the request has no valid schedule or it has no future fires.
pub fn next_fire(request: &Request, now: u64) -> Option<u64> {
    let schedule = parse_schedule(request).ok().flatten()?;
    let now = DateTime::<Utc>::from_timestamp_millis(now as i64)?;
    schedule
        .after(&now)
        .next()
        .map(|fire| fire.timestamp_millis() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, TimeZone, Weekday};
    use fleet_state::RequestType;

    fn scheduled(expression: &str) -> Request {
        Request::builder("job")
            .request_type(RequestType::Scheduled)
            .schedule(expression)
            .build()
    }

    fn millis(dt: DateTime<Utc>) -> u64 {
        dt.timestamp_millis() as u64
    }

    #[test]
    fn cron_gets_seconds_field_and_quartz_weekdays() {
        assert_eq!(normalize("*/5 * * * *", ScheduleType::Cron).unwrap(), "0 */5 * * * *");
        assert_eq!(normalize("0 9 * * 1-5", ScheduleType::Cron).unwrap(), "0 0 9 * * 2-6");
        assert_eq!(normalize("0 9 * * 0,7", ScheduleType::Cron).unwrap(), "0 0 9 * * 1,1");
        assert_eq!(normalize("0 9 * * 5-7", ScheduleType::Cron).unwrap(), "0 0 9 * * 6-7,1");
        assert_eq!(normalize("0 9 ? * MON", ScheduleType::Cron).unwrap(), "0 0 9 * * MON");
    }

    #[test]
    fn quartz_passes_through() {
        assert_eq!(
            normalize("0 30 2 ? * *", ScheduleType::Quartz).unwrap(),
            "0 30 2 * * *"
        );
        assert!(normalize("* * *", ScheduleType::Quartz).is_err());
        assert!(normalize("0 0 0 * * *", ScheduleType::Cron).is_err());
        assert!(normalize("0 0 * * 9", ScheduleType::Cron).is_err());
    }

    #[test]
    fn next_fire_is_strictly_after_now() {
        let request = scheduled("0 * * * *");
        let on_the_hour = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap();

        let next = next_fire(&request, millis(on_the_hour)).unwrap();

        assert_eq!(next, millis(Utc.with_ymd_and_hms(2026, 3, 1, 11, 0, 0).unwrap()));
    }

    #[test]
    fn sunday_means_sunday() {
        let request = scheduled("0 12 * * 0");
        // 2026-03-02 is a Monday.
        let monday = Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap();

        let next = next_fire(&request, millis(monday)).unwrap();
        let fire = DateTime::<Utc>::from_timestamp_millis(next as i64).unwrap();

        assert_eq!(fire.weekday(), Weekday::Sun);
    }

    #[test]
    fn quartz_override_wins() {
        let request = Request::builder("job")
            .request_type(RequestType::Scheduled)
            .schedule("0 * * * *")
            .quartz_schedule("0 0 6 * * ?")
            .build();
        let start = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap();

        let next = next_fire(&request, millis(start)).unwrap();

        assert_eq!(next, millis(Utc.with_ymd_and_hms(2026, 3, 2, 6, 0, 0).unwrap()));
    }

    #[test]
    fn validation_rejects_garbage() {
        assert!(validate_request(&scheduled("*/5 * * * *")).is_ok());
        assert!(matches!(
            validate_request(&scheduled("not a schedule at all")),
            Err(ValidationError::InvalidSchedule { .. })
        ));
        let service = Request::builder("web").request_type(RequestType::Service).build();
        assert!(validate_request(&service).is_ok());
        assert_eq!(next_fire(&service, 0), None);
    }
}
