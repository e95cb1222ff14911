use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer};

use crate::error::ChronError;

/// Job names are dash-separated alphanumeric segments, e.g. `backup` or `Do-It-Now`.
static NAME_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new("^[a-zA-Z0-9]+(-[a-zA-Z0-9]+)*$").expect("name pattern"));

/// Check that `name` is a well-formed job name.
pub fn validate_name(name: &str) -> Result<(), ChronError> {
    if NAME_PATTERN.is_match(name) {
        Ok(())
    } else {
        Err(ChronError::InvalidName(name.to_string()))
    }
}

/// The two modes a job can run in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    /// Always-on process, restarted after exit while `keep_alive` holds.
    Startup,
    /// Shell command fired at each matching cron instant.
    Scheduled,
}

impl JobKind {
    /// Lowercase label used by the control plane.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Startup => "startup",
            JobKind::Scheduled => "scheduled",
        }
    }
}

/// Options accepted when registering a startup job.
#[derive(Debug, Clone, Copy)]
pub struct StartupOptions {
    /// Restart the command 5 seconds after it exits.
    pub keep_alive: bool,
}

impl Default for StartupOptions {
    fn default() -> Self {
        Self { keep_alive: true }
    }
}

/// Options accepted when registering a scheduled job.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScheduledOptions {
    /// Permit a firing to start while a previous run is still in flight.
    pub allow_concurrent_runs: bool,
    /// How many missed firings to make up at registration time.
    pub make_up_missed_runs: MakeUpRuns,
}

/// Missed-run catch-up budget: a bounded count or every missed firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MakeUpRuns {
    /// At most this many missed runs are made up.
    Count(u32),
    /// Every missed firing since the last recorded run is made up.
    All,
}

impl Default for MakeUpRuns {
    fn default() -> Self {
        MakeUpRuns::Count(0)
    }
}

impl<'de> Deserialize<'de> for MakeUpRuns {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct MakeUpVisitor;

        impl<'de> Visitor<'de> for MakeUpVisitor {
            type Value = MakeUpRuns;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a non-negative integer or the string \"all\"")
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
                u32::try_from(v)
                    .map(MakeUpRuns::Count)
                    .map_err(|_| E::invalid_value(de::Unexpected::Signed(v), &self))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
                u32::try_from(v)
                    .map(MakeUpRuns::Count)
                    .map_err(|_| E::invalid_value(de::Unexpected::Unsigned(v), &self))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                if v == "all" {
                    Ok(MakeUpRuns::All)
                } else {
                    Err(E::invalid_value(de::Unexpected::Str(v), &self))
                }
            }
        }

        deserializer.deserialize_any(MakeUpVisitor)
    }
}

/// A parsed five-field cron schedule.
///
/// Firings are minute-aligned: the underlying engine wants a seconds field,
/// so `0` is prepended before parsing.
#[derive(Debug, Clone)]
pub struct JobSchedule {
    schedule: Schedule,
    expression: String,
}

impl JobSchedule {
    /// Parse a standard five-field cron expression.
    pub fn parse(expression: &str) -> Result<Self, ChronError> {
        if expression.split_whitespace().count() != 5 {
            return Err(ChronError::InvalidCron {
                expression: expression.to_string(),
                reason: "expected 5 fields (minute hour day-of-month month day-of-week)"
                    .to_string(),
            });
        }
        let schedule =
            Schedule::from_str(&format!("0 {expression}")).map_err(|e| ChronError::InvalidCron {
                expression: expression.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            schedule,
            expression: expression.to_string(),
        })
    }

    /// The expression as given.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// The next firing instant strictly after `t`.
    pub fn next_after(&self, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&t).next()
    }

    /// Firing instants strictly after `t`, in order.
    pub fn occurrences_from(&self, t: DateTime<Utc>) -> impl Iterator<Item = DateTime<Utc>> + '_ {
        self.schedule.after(&t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Timelike};

    #[test]
    fn accepts_well_formed_names() {
        for name in ["a", "job-1", "Do-It-Now", "x0-y1-z2"] {
            assert!(validate_name(name).is_ok(), "{name} should be accepted");
        }
    }

    #[test]
    fn rejects_malformed_names() {
        for name in ["", "Ab_c", "a--b", "-a", "a-", "a b", "jöb"] {
            assert!(
                matches!(validate_name(name), Err(ChronError::InvalidName(_))),
                "{name:?} should be rejected"
            );
        }
    }

    #[test]
    fn parses_five_field_expressions() {
        let schedule = JobSchedule::parse("*/5 * * * *").unwrap();
        assert_eq!(schedule.expression(), "*/5 * * * *");
    }

    #[test]
    fn rejects_wrong_field_counts() {
        for expr in ["* * * *", "0 * * * * *", "", "* * * * * * *"] {
            assert!(
                matches!(
                    JobSchedule::parse(expr),
                    Err(ChronError::InvalidCron { .. })
                ),
                "{expr:?} should be rejected"
            );
        }
    }

    #[test]
    fn rejects_garbage_expressions() {
        assert!(matches!(
            JobSchedule::parse("a b c d e"),
            Err(ChronError::InvalidCron { .. })
        ));
    }

    #[test]
    fn firings_are_minute_aligned_and_strictly_after() {
        let schedule = JobSchedule::parse("* * * * *").unwrap();
        let now = Utc::now();
        let next = schedule.next_after(now).unwrap();
        assert!(next > now);
        assert_eq!(next.second(), 0);
        assert!(next - now <= Duration::seconds(60));
    }

    #[test]
    fn occurrences_enumerate_in_order() {
        let schedule = JobSchedule::parse("* * * * *").unwrap();
        let now = Utc::now();
        let firings: Vec<_> = schedule.occurrences_from(now).take(3).collect();
        assert_eq!(firings.len(), 3);
        assert!(firings.windows(2).all(|w| w[1] - w[0] == Duration::seconds(60)));
    }
}
