//! Concurrency and rate admission checks.
//!
//! Counts are always derived by scanning an action's log list; there is no
//! separate counter to drift out of step with the log. Callers run these
//! under the log store's index lock (see `LogStore::with_action_logs`).

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tracing::warn;

use crate::domain::RateSpec;

use super::log_store::{lock, SharedLogEntry};

/// Window used when a rate duration cannot be parsed. It is negative, so
/// no entry can fall inside it and the rule never blocks.
pub fn malformed_duration_window() -> Duration {
    Duration::minutes(-1)
}

/// Reasons a request is refused before it runs
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionViolation {
    #[error(
        "Blocked from executing. This would mean this action is running {running} times concurrently, but this action has maxConcurrent set to {max_concurrent}."
    )]
    Concurrency {
        running: usize,
        max_concurrent: usize,
    },

    #[error(
        "Blocked from executing. This action has run {executions} out of {limit} allowed times in the last {duration}."
    )]
    Rate {
        executions: i64,
        limit: i64,
        duration: String,
    },
}

/// Number of entries that have not finished yet
pub fn concurrent_count(entries: &[SharedLogEntry]) -> usize {
    entries
        .iter()
        .filter(|e| !lock(e).execution_finished)
        .count()
}

/// Check the concurrency ceiling.
///
/// The current request's entry is already registered and counts itself,
/// hence the comparison against `max_concurrent + 1`.
pub fn check_concurrency(
    entries: &[SharedLogEntry],
    max_concurrent: usize,
) -> Result<(), AdmissionViolation> {
    let running = concurrent_count(entries);

    if running >= max_concurrent.saturating_add(1) {
        return Err(AdmissionViolation::Concurrency {
            running,
            max_concurrent,
        });
    }

    Ok(())
}

/// Executions inside the trailing window, excluding the current request.
///
/// Blocked entries never ran and are not counted. The result starts at -1
/// because the current request's own entry is always in the list.
pub fn executions_in_window(entries: &[SharedLogEntry], window: Duration, now: DateTime<Utc>) -> i64 {
    let then = now - window;

    let counted = entries
        .iter()
        .filter(|e| {
            let entry = lock(e);
            entry.datetime_started > then && !entry.blocked
        })
        .count() as i64;

    counted - 1
}

/// Window for a rate rule, falling back to `malformed_duration_window`
pub fn rate_window(rate: &RateSpec) -> Duration {
    match parse_duration(&rate.duration) {
        Some(window) => window,
        None => {
            warn!(duration = %rate.duration, "Could not parse duration");
            malformed_duration_window()
        }
    }
}

/// Check rate rules in declaration order; the first violated rule wins
pub fn check_rate(
    entries: &[SharedLogEntry],
    rates: &[RateSpec],
    now: DateTime<Utc>,
) -> Result<(), AdmissionViolation> {
    for rate in rates {
        let executions = executions_in_window(entries, rate_window(rate), now);

        if executions >= rate.limit {
            return Err(AdmissionViolation::Rate {
                executions,
                limit: rate.limit,
                duration: rate.duration.clone(),
            });
        }
    }

    Ok(())
}

/// Parse a duration such as `300ms`, `30s`, `5m`, `1h30m` or `1.5h`.
///
/// Accepts an optional sign, decimal fractions, and the units `ns`, `us`
/// (`µs`), `ms`, `s`, `m` and `h`. A bare `0` is allowed; any other number
/// needs a unit.
pub fn parse_duration(input: &str) -> Option<Duration> {
    let mut rest = input.trim();

    let negative = match rest.as_bytes().first() {
        Some(b'-') => {
            rest = &rest[1..];
            true
        }
        Some(b'+') => {
            rest = &rest[1..];
            false
        }
        Some(_) => false,
        None => return None,
    };

    if rest == "0" {
        return Some(Duration::zero());
    }

    if rest.is_empty() {
        return None;
    }

    let mut total_nanos = 0f64;

    while !rest.is_empty() {
        let number_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());

        if number_end == 0 {
            return None;
        }

        let number: f64 = rest[..number_end].parse().ok()?;
        rest = &rest[number_end..];

        let unit_end = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());

        let nanos_per_unit = match &rest[..unit_end] {
            "ns" => 1.0,
            "us" | "µs" | "μs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            _ => return None,
        };

        total_nanos += number * nanos_per_unit;
        rest = &rest[unit_end..];
    }

    if !total_nanos.is_finite() || total_nanos > i64::MAX as f64 {
        return None;
    }

    let nanos = total_nanos as i64;
    Some(Duration::nanoseconds(if negative { -nanos } else { nanos }))
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::domain::InternalLogEntry;

    fn entry(started_secs_ago: i64, finished: bool, blocked: bool) -> SharedLogEntry {
        let mut e = InternalLogEntry::new("t");
        e.datetime_started = Utc::now() - Duration::seconds(started_secs_ago);
        e.execution_finished = finished;
        e.blocked = blocked;
        Arc::new(Mutex::new(e))
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("30s"), Some(Duration::seconds(30)));
        assert_eq!(parse_duration("5m"), Some(Duration::minutes(5)));
        assert_eq!(parse_duration("1h30m"), Some(Duration::minutes(90)));
        assert_eq!(parse_duration("1.5h"), Some(Duration::minutes(90)));
        assert_eq!(parse_duration("250ms"), Some(Duration::milliseconds(250)));
        assert_eq!(parse_duration("-2s"), Some(Duration::seconds(-2)));
        assert_eq!(parse_duration("0"), Some(Duration::zero()));
    }

    #[test]
    fn test_parse_duration_rejects_malformed() {
        assert_eq!(parse_duration(""), None);
        assert_eq!(parse_duration("10"), None);
        assert_eq!(parse_duration("five minutes"), None);
        assert_eq!(parse_duration("5d"), None);
        assert_eq!(parse_duration("m"), None);
    }

    #[test]
    fn test_concurrency_counts_self() {
        // Only the current request: allowed with max 1
        let entries = vec![entry(0, false, false)];
        assert!(check_concurrency(&entries, 1).is_ok());

        // One other unfinished run plus self: blocked with max 1
        let entries = vec![entry(5, false, false), entry(0, false, false)];
        assert_eq!(
            check_concurrency(&entries, 1),
            Err(AdmissionViolation::Concurrency {
                running: 2,
                max_concurrent: 1
            })
        );

        // Finished runs don't count
        let entries = vec![entry(5, true, false), entry(0, false, false)];
        assert!(check_concurrency(&entries, 1).is_ok());
    }

    #[test]
    fn test_unbounded_concurrency_does_not_overflow() {
        let entries = vec![entry(10, false, false), entry(5, false, false), entry(0, false, false)];

        assert!(check_concurrency(&entries, usize::MAX).is_ok());
    }

    #[test]
    fn test_rate_excludes_self_and_blocked() {
        let rates = vec![RateSpec::new(2, "1m")];

        let entries = vec![entry(10, true, false), entry(0, false, false)];
        assert!(check_rate(&entries, &rates, Utc::now()).is_ok());

        let entries = vec![
            entry(20, true, false),
            entry(10, true, false),
            entry(0, false, false),
        ];
        assert!(matches!(
            check_rate(&entries, &rates, Utc::now()),
            Err(AdmissionViolation::Rate { executions: 2, limit: 2, .. })
        ));

        let entries = vec![
            entry(20, true, true),
            entry(10, true, false),
            entry(0, false, false),
        ];
        assert!(check_rate(&entries, &rates, Utc::now()).is_ok());
    }

    #[test]
    fn test_rate_ignores_entries_outside_window() {
        let rates = vec![RateSpec::new(1, "30s")];
        let entries = vec![entry(120, true, false), entry(0, false, false)];

        assert!(check_rate(&entries, &rates, Utc::now()).is_ok());
    }

    #[test]
    fn test_malformed_duration_never_blocks() {
        let rates = vec![RateSpec::new(0, "soon")];
        let entries = vec![entry(1, true, false), entry(0, false, false)];

        assert_eq!(rate_window(&rates[0]), malformed_duration_window());
        assert!(check_rate(&entries, &rates, Utc::now()).is_ok());
    }

    #[test]
    fn test_first_violated_rule_wins() {
        let rates = vec![RateSpec::new(5, "1h"), RateSpec::new(1, "1m"), RateSpec::new(0, "1h")];
        let entries = vec![entry(10, true, false), entry(0, false, false)];

        match check_rate(&entries, &rates, Utc::now()) {
            Err(AdmissionViolation::Rate { limit, duration, .. }) => {
                assert_eq!(limit, 1);
                assert_eq!(duration, "1m");
            }
            other => panic!("Expected rate violation, got {:?}", other),
        }
    }
}
