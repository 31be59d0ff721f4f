//! Schedule definitions and occurrence computation.
//!
//! All schedules are evaluated in UTC.

use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ScheduleError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Schedule {
  /// Every `interval_seconds`, aligned to `anchor_date`.
  Interval {
    interval_seconds: u64,
    anchor_date: DateTime<Utc>,
  },
  /// A 5-field (minute precision) or 6-field (second precision) cron expression.
  Cron { cron: String },
}

impl Schedule {
  pub fn interval(interval_seconds: u64, anchor_date: DateTime<Utc>) -> Self {
    Schedule::Interval {
      interval_seconds,
      anchor_date,
    }
  }

  pub fn cron(expression: impl Into<String>) -> Self {
    Schedule::Cron {
      cron: expression.into(),
    }
  }

  /// Up to `n` occurrences at or after `start`, stopping before `end` if given.
  pub fn occurrences(
    &self,
    start: DateTime<Utc>,
    end: Option<DateTime<Utc>>,
    n: usize,
  ) -> Result<Vec<DateTime<Utc>>, ScheduleError> {
    let within = |at: &DateTime<Utc>| end.is_none_or(|end| *at <= end);

    match self {
      Schedule::Interval {
        interval_seconds,
        anchor_date,
      } => {
        let step = interval_step(*interval_seconds)?;
        let step_seconds = step.num_seconds();
        // The k-th occurrence, or `None` past the representable range.
        let nth = |k: i64| {
          k.checked_mul(step_seconds)
            .and_then(Duration::try_seconds)
            .and_then(|delta| anchor_date.checked_add_signed(delta))
        };

        let offset = (start - *anchor_date).num_seconds();
        let mut k = offset.div_euclid(step_seconds);
        // Anything unrepresentable here lies before `start`.
        if nth(k).is_none_or(|at| at < start) {
          k += 1;
        }

        let mut dates = Vec::with_capacity(n.min(1024));
        let mut next = nth(k);
        while let Some(at) = next {
          if dates.len() >= n || !within(&at) {
            break;
          }
          dates.push(at);
          next = at.checked_add_signed(step);
        }
        Ok(dates)
      }
      Schedule::Cron { cron } => {
        let parsed = parse_cron(cron)?;
        // `after` is exclusive; step back so a boundary `start` is included.
        let from = start - Duration::milliseconds(1);
        Ok(parsed.after(&from).take(n).take_while(|at| within(at)).collect())
      }
    }
  }

  /// Check the definition without computing dates.
  pub fn validate(&self) -> Result<(), ScheduleError> {
    match self {
      Schedule::Interval {
        interval_seconds, ..
      } => interval_step(*interval_seconds).map(|_| ()),
      Schedule::Cron { cron } => parse_cron(cron).map(|_| ()),
    }
  }
}

/// Zero and intervals too long for a [`Duration`] are rejected.
fn interval_step(interval_seconds: u64) -> Result<Duration, ScheduleError> {
  i64::try_from(interval_seconds)
    .ok()
    .filter(|seconds| *seconds > 0)
    .and_then(Duration::try_seconds)
    .ok_or(ScheduleError::InvalidInterval)
}

fn parse_cron(expression: &str) -> Result<cron::Schedule, ScheduleError> {
  let fields = expression.split_whitespace().count();
  let normalized = if fields == 5 {
    format!("0 {}", expression.trim())
  } else {
    expression.trim().to_string()
  };
  cron::Schedule::from_str(&normalized).map_err(|e| ScheduleError::InvalidCron {
    expression: expression.to_string(),
    message: e.to_string(),
  })
}
