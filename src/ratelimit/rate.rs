//! Allowed consumption rates and their time units.

use std::collections::HashSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::{duration_to_ticks, Ticks};
use crate::error::{FloodgateError, Result};

/// Time unit a rate is expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RateUnit {
    PerSecond,
    PerMinute,
    PerHour,
    PerDay,
    /// A window defined by a [`LimitPeriod`].
    PerCustomPeriod,
}

impl RateUnit {
    /// Fixed length of the unit, `None` for custom periods.
    pub fn fixed_duration(&self) -> Option<Duration> {
        match self {
            RateUnit::PerSecond => Some(Duration::from_secs(1)),
            RateUnit::PerMinute => Some(Duration::from_secs(60)),
            RateUnit::PerHour => Some(Duration::from_secs(3600)),
            RateUnit::PerDay => Some(Duration::from_secs(86400)),
            RateUnit::PerCustomPeriod => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RateUnit::PerSecond => "PerSecond",
            RateUnit::PerMinute => "PerMinute",
            RateUnit::PerHour => "PerHour",
            RateUnit::PerDay => "PerDay",
            RateUnit::PerCustomPeriod => "PerCustomPeriod",
        }
    }
}

impl fmt::Display for RateUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RateUnit {
    type Err = FloodgateError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "persecond" | "second" => Ok(RateUnit::PerSecond),
            "perminute" | "minute" => Ok(RateUnit::PerMinute),
            "perhour" | "hour" => Ok(RateUnit::PerHour),
            "perday" | "day" => Ok(RateUnit::PerDay),
            "percustomperiod" => Ok(RateUnit::PerCustomPeriod),
            other => Err(FloodgateError::Config(format!("unknown rate unit '{}'", other))),
        }
    }
}

/// A custom limiting window anchored at an absolute start time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitPeriod {
    /// Absolute start of the first window
    pub start_utc: DateTime<Utc>,
    /// Length of each window
    #[serde(with = "duration_secs")]
    pub duration: Duration,
    /// Whether the window repeats back-to-back after the first one
    #[serde(default)]
    pub repeating: bool,
}

impl LimitPeriod {
    pub fn new(start_utc: DateTime<Utc>, duration: Duration, repeating: bool) -> Result<Self> {
        if duration_to_ticks(duration) <= 0 {
            return Err(FloodgateError::InvalidPolicy(
                "limit period duration must be at least one millisecond".to_string(),
            ));
        }
        Ok(Self {
            start_utc,
            duration,
            repeating,
        })
    }

    /// The `[from, to)` window containing `now`, if any.
    ///
    /// A non-repeating period only ever has its first window. A repeating one
    /// has a window for every instant at or after `start_utc`.
    pub fn window_at(&self, now: Ticks) -> Option<(Ticks, Ticks)> {
        let start = self.start_utc.timestamp_millis();
        let length = duration_to_ticks(self.duration);
        if now < start || length <= 0 {
            return None;
        }
        if self.repeating {
            let k = (now - start) / length;
            let from = start + k * length;
            Some((from, from + length))
        } else if now < start + length {
            Some((start, start + length))
        } else {
            None
        }
    }
}

impl fmt::Display for LimitPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}+{}s{}",
            self.start_utc.format("%Y%m%dT%H%M%SZ"),
            self.duration.as_secs(),
            if self.repeating { "/repeat" } else { "" }
        )
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

/// One bound applied by a policy: `limit` calls per `unit`.
///
/// Two rates are equal when they render the same way, so `10 per minute with
/// burst 20` and `10 per minute with burst 5` are the same rate for lookups.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllowedConsumptionRate {
    limit: i64,
    unit: RateUnit,
    #[serde(default)]
    period: Option<LimitPeriod>,
    /// Token-bucket capacity; 0 means "use `limit`"
    #[serde(default)]
    max_burst: i64,
    #[serde(default = "default_cost")]
    cost_per_call: i64,
    #[serde(default)]
    whitelisted_request_keys: HashSet<String>,
}

fn default_cost() -> i64 {
    1
}

impl AllowedConsumptionRate {
    /// Create a rate with a fixed unit.
    pub fn new(limit: i64, unit: RateUnit) -> Result<Self> {
        if unit == RateUnit::PerCustomPeriod {
            return Err(FloodgateError::InvalidPolicy(
                "PerCustomPeriod rates require a limit period".to_string(),
            ));
        }
        Self::build(limit, unit, None)
    }

    /// Create a rate that applies only inside a custom period.
    pub fn per_period(limit: i64, period: LimitPeriod) -> Result<Self> {
        Self::build(limit, RateUnit::PerCustomPeriod, Some(period))
    }

    fn build(limit: i64, unit: RateUnit, period: Option<LimitPeriod>) -> Result<Self> {
        if limit <= 0 {
            return Err(FloodgateError::InvalidPolicy(format!(
                "limit must be positive, got {}",
                limit
            )));
        }
        Ok(Self {
            limit,
            unit,
            period,
            max_burst: 0,
            cost_per_call: 1,
            whitelisted_request_keys: HashSet::new(),
        })
    }

    pub fn with_max_burst(mut self, max_burst: i64) -> Self {
        self.max_burst = max_burst.max(0);
        self
    }

    pub fn with_cost_per_call(mut self, cost: i64) -> Result<Self> {
        if cost < 1 {
            return Err(FloodgateError::InvalidPolicy(format!(
                "cost per call must be at least 1, got {}",
                cost
            )));
        }
        self.cost_per_call = cost;
        Ok(self)
    }

    pub fn with_whitelisted_request_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.whitelisted_request_keys = keys
            .into_iter()
            .map(Into::into)
            .collect();
        self
    }

    /// Check invariants on a deserialized rate.
    pub fn validate(&self) -> Result<()> {
        if self.limit <= 0 {
            return Err(FloodgateError::InvalidPolicy(format!(
                "limit must be positive, got {}",
                self.limit
            )));
        }
        if self.cost_per_call < 1 {
            return Err(FloodgateError::InvalidPolicy(format!(
                "cost per call must be at least 1, got {}",
                self.cost_per_call
            )));
        }
        if self.max_burst < 0 {
            return Err(FloodgateError::InvalidPolicy(format!(
                "max burst must not be negative, got {}",
                self.max_burst
            )));
        }
        if let Some(period) = &self.period {
            LimitPeriod::new(period.start_utc, period.duration, period.repeating)?;
        }
        match (self.unit, &self.period) {
            (RateUnit::PerCustomPeriod, None) => Err(FloodgateError::InvalidPolicy(
                "PerCustomPeriod rates require a limit period".to_string(),
            )),
            (unit, Some(_)) if unit != RateUnit::PerCustomPeriod => {
                Err(FloodgateError::InvalidPolicy(format!(
                    "a limit period is only valid with PerCustomPeriod, not {}",
                    unit
                )))
            }
            _ => Ok(()),
        }
    }

    pub fn limit(&self) -> i64 {
        self.limit
    }

    pub fn unit(&self) -> RateUnit {
        self.unit
    }

    pub fn period(&self) -> Option<&LimitPeriod> {
        self.period.as_ref()
    }

    pub fn max_burst(&self) -> i64 {
        self.max_burst
    }

    pub fn cost_per_call(&self) -> i64 {
        self.cost_per_call
    }

    /// Number of units a window may hold before the rate is violated.
    pub fn capacity(&self) -> i64 {
        if self.max_burst != 0 {
            self.max_burst
        } else {
            self.limit
        }
    }

    /// Length of one window of this rate.
    pub fn unit_duration(&self) -> Duration {
        match (self.unit.fixed_duration(), &self.period) {
            (Some(d), _) => d,
            (None, Some(period)) => period.duration,
            (None, None) => Duration::ZERO,
        }
    }

    /// Whether `request_key` is exempt from this rate (case-insensitive).
    pub fn is_whitelisted(&self, request_key: &str) -> bool {
        self.whitelisted_request_keys
            .iter()
            .any(|k| k.eq_ignore_ascii_case(request_key))
    }
}

impl fmt::Display for AllowedConsumptionRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.period {
            Some(period) => write!(f, "{} calls PerCustomPeriod {}", self.limit, period),
            None => write!(f, "{} calls {}", self.limit, self.unit),
        }
    }
}

impl PartialEq for AllowedConsumptionRate {
    fn eq(&self, other: &Self) -> bool {
        self.to_string() == other.to_string()
    }
}

impl Eq for AllowedConsumptionRate {}

impl Hash for AllowedConsumptionRate {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.to_string().hash(state);
    }
}
