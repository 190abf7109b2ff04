//! Pass/fail thresholds evaluated when the load test completes.
//!
//! A threshold is written `metric:aggregation<operator><value>`, for example:
//!  - `http_req_failed:rate<0.5`: fewer than half of all requests failed;
//!  - `http_req_duration:p(95)<3000`: 95% of all requests completed in under 3 seconds;
//!  - `http_req_duration:avg<200`;
//!  - `checks:rate>0.99`: more than 99% of all checks passed.
//!
//! Supported metrics and aggregations:
//!
//! | Metric | Aggregations |
//! |---|---|
//! | `http_req_failed` | `rate` |
//! | `http_req_duration` | `p(N)`, `avg`, `min`, `max`, `med` |
//! | `checks` | `rate` |
//!
//! Every request counts, setup requests included.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::metrics::LoadTestMetrics;
use crate::LoadTestError;

lazy_static! {
    static ref THRESHOLD: Regex = Regex::new(
        r"^\s*(?P<metric>[a-z_]+)\s*:\s*(?P<aggregation>rate|avg|min|max|med|p\(\s*(?P<percent>\d+(\.\d+)?)\s*\))\s*(?P<operator><=|>=|==|<|>)\s*(?P<value>-?\d+(\.\d+)?)\s*$"
    )
    .expect("failed to compile threshold regex");
}

/// The thresholds applied when none are configured.
pub const DEFAULT_THRESHOLDS: [&str; 2] = [
    "http_req_failed:rate<0.5",
    "http_req_duration:p(95)<3000",
];

/// Metrics a threshold can be applied to.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ThresholdMetric {
    /// Fraction of requests that failed (no response, or a status outside 200-399).
    HttpReqFailed,
    /// Request response times, in milliseconds.
    HttpReqDuration,
    /// Fraction of checks that passed.
    Checks,
}
impl FromStr for ThresholdMetric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http_req_failed" => Ok(ThresholdMetric::HttpReqFailed),
            "http_req_duration" => Ok(ThresholdMetric::HttpReqDuration),
            "checks" => Ok(ThresholdMetric::Checks),
            _ => Err(format!(
                "unknown metric {}, expected: http_req_failed, http_req_duration, or checks",
                s
            )),
        }
    }
}

/// How the metric is reduced to a single value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Aggregation {
    Rate,
    Percentile(f32),
    Average,
    Minimum,
    Maximum,
    Median,
}

/// How the aggregated value is compared against the threshold value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Operator {
    Less,
    LessOrEqual,
    Greater,
    GreaterOrEqual,
    Equal,
}
impl Operator {
    fn compare(&self, observed: f64, value: f64) -> bool {
        match self {
            Operator::Less => observed < value,
            Operator::LessOrEqual => observed <= value,
            Operator::Greater => observed > value,
            Operator::GreaterOrEqual => observed >= value,
            Operator::Equal => (observed - value).abs() < f64::EPSILON,
        }
    }
}

/// A parsed threshold expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Threshold {
    /// The expression as it was configured.
    pub expression: String,
    pub metric: ThresholdMetric,
    pub aggregation: Aggregation,
    pub operator: Operator,
    pub value: f64,
}
impl Threshold {
    /// The thresholds applied when none are configured.
    pub fn defaults() -> Vec<Threshold> {
        DEFAULT_THRESHOLDS
            .iter()
            .filter_map(|t| Threshold::from_str(t).ok())
            .collect()
    }

    /// Reduce the metric to the value compared against this threshold.
    pub fn observe(&self, metrics: &LoadTestMetrics) -> f64 {
        match (self.metric, self.aggregation) {
            (ThresholdMetric::HttpReqFailed, _) => metrics.http_req_failed_rate(),
            (ThresholdMetric::Checks, _) => metrics.checks_rate(),
            (ThresholdMetric::HttpReqDuration, Aggregation::Percentile(percent)) => {
                metrics.response_time_percentile(percent / 100.0) as f64
            }
            (ThresholdMetric::HttpReqDuration, Aggregation::Median) => {
                metrics.response_time_percentile(0.5) as f64
            }
            (ThresholdMetric::HttpReqDuration, Aggregation::Average) => {
                metrics.average_response_time()
            }
            (ThresholdMetric::HttpReqDuration, Aggregation::Minimum) => {
                metrics.min_response_time() as f64
            }
            (ThresholdMetric::HttpReqDuration, Aggregation::Maximum) => {
                metrics.max_response_time() as f64
            }
            // Rejected when parsing.
            (ThresholdMetric::HttpReqDuration, Aggregation::Rate) => 0.0,
        }
    }

    /// Evaluate this threshold against the aggregated metrics.
    pub fn evaluate(&self, metrics: &LoadTestMetrics) -> ThresholdResult {
        let observed = self.observe(metrics);
        let passed = self.operator.compare(observed, self.value);
        if passed {
            debug!("threshold {} passed: {}", self.expression, observed);
        } else {
            warn!("threshold {} crossed: {}", self.expression, observed);
        }
        ThresholdResult {
            threshold: self.expression.to_string(),
            observed,
            passed,
        }
    }
}
impl FromStr for Threshold {
    type Err = LoadTestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |detail: String| LoadTestError::InvalidThreshold {
            threshold: s.to_string(),
            detail,
        };

        let captures = THRESHOLD.captures(s).ok_or_else(|| {
            invalid("expected metric:aggregation<value, for example http_req_failed:rate<0.5".to_string())
        })?;

        let metric = ThresholdMetric::from_str(&captures["metric"]).map_err(invalid)?;

        let aggregation = match &captures["aggregation"] {
            "rate" => Aggregation::Rate,
            "avg" => Aggregation::Average,
            "min" => Aggregation::Minimum,
            "max" => Aggregation::Maximum,
            "med" => Aggregation::Median,
            _ => {
                let percent = captures
                    .name("percent")
                    .and_then(|p| f32::from_str(p.as_str()).ok())
                    .ok_or_else(|| invalid("invalid percentile".to_string()))?;
                if percent <= 0.0 || percent > 100.0 {
                    return Err(invalid(
                        "percentile must be greater than 0 and at most 100".to_string(),
                    ));
                }
                Aggregation::Percentile(percent)
            }
        };

        // Rates are fractions, durations are in milliseconds.
        match (metric, aggregation) {
            (ThresholdMetric::HttpReqDuration, Aggregation::Rate) => {
                return Err(invalid(
                    "http_req_duration supports p(N), avg, min, max and med".to_string(),
                ));
            }
            (ThresholdMetric::HttpReqFailed, Aggregation::Rate)
            | (ThresholdMetric::Checks, Aggregation::Rate)
            | (ThresholdMetric::HttpReqDuration, _) => (),
            (_, _) => {
                return Err(invalid(format!(
                    "{} only supports rate",
                    &captures["metric"]
                )));
            }
        }

        let operator = match &captures["operator"] {
            "<" => Operator::Less,
            "<=" => Operator::LessOrEqual,
            ">" => Operator::Greater,
            ">=" => Operator::GreaterOrEqual,
            _ => Operator::Equal,
        };

        let value = f64::from_str(&captures["value"])
            .map_err(|e| invalid(format!("invalid value: {}", e)))?;

        Ok(Threshold {
            expression: s.trim().to_string(),
            metric,
            aggregation,
            operator,
            value,
        })
    }
}
impl fmt::Display for Threshold {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.expression)
    }
}

/// The outcome of evaluating one threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdResult {
    /// The threshold expression.
    pub threshold: String,
    /// The aggregated value the threshold was compared against.
    pub observed: f64,
    pub passed: bool,
}
