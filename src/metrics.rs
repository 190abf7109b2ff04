//! Metrics collected and aggregated during the load test.
//!
//! Every request, check and completed iteration is sent as a [`LoadTestMetric`] through
//! an [`unbounded Flume channel`](https://docs.rs/flume/*/flume/fn.unbounded.html) to a
//! single aggregation task, so virtual users spend all their time generating load.
//!
//! When [`LoadTest::execute()`](../struct.LoadTest.html#method.execute) completes it
//! returns a [`LoadTestMetrics`] object. When viewed with [`std::fmt::Display`] the
//! aggregated requests, response times, status codes, checks, iterations, errors and
//! thresholds are displayed in tables.

use chrono::prelude::*;
use http::StatusCode;
use itertools::Itertools;
use num_format::{Locale, ToFormattedString};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crate::executor::ExecutorSummary;
use crate::threshold::{Threshold, ThresholdResult};
use crate::util;

/// Used to send metrics from virtual users to the aggregation task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LoadTestMetric {
    Request(RequestMetric),
    Check(CheckMetric),
    Iteration(IterationMetric),
}

/// One request made during the load test.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestMetric {
    /// How many milliseconds the load test had been running when this request was made.
    pub elapsed: u64,
    /// The HTTP method, for example `POST`.
    pub method: String,
    /// The name requests are aggregated by, for example `POST /api/v1/auth/login`.
    pub name: String,
    /// The full url that was requested.
    pub url: String,
    /// The status code returned by the server, or `0` if no response was received.
    pub status_code: u16,
    /// How many milliseconds the request took.
    pub response_time: u64,
    /// Whether a 2xx or 3xx status code was returned.
    pub success: bool,
    /// Why the request failed, empty if it succeeded.
    pub error: String,
    /// Which virtual user made the request, `0` during setup.
    pub user: usize,
}
impl RequestMetric {
    /// Requests without a response, or with a status code outside 200-399, failed.
    pub fn is_success(status_code: u16, error: Option<&String>) -> bool {
        error.is_none() && (200..400).contains(&status_code)
    }
}

/// One named check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckMetric {
    pub name: String,
    pub passed: bool,
}

/// One iteration that ran to completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationMetric {
    /// Which virtual user ran the iteration.
    pub user: usize,
    /// The virtual user's iteration counter.
    pub iteration: usize,
    /// How many milliseconds the iteration took.
    pub run_time: u64,
    pub success: bool,
    /// Why the iteration failed, if it failed.
    pub error: Option<String>,
}

/// Metrics collected about a method-name pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestMetricAggregate {
    /// The request name, for example: `POST /api/v1/flash-sale/purchase`.
    pub name: String,
    pub method: String,
    /// Per-response-time counters, tracking how often requests completed in exactly
    /// this many milliseconds. Response times are not rounded, so percentiles
    /// compared against thresholds are exact.
    pub response_times: BTreeMap<usize, usize>,
    /// The shortest response time seen so far.
    pub min_response_time: usize,
    /// The longest response time seen so far.
    pub max_response_time: usize,
    /// Total combined response times seen so far.
    pub total_response_time: usize,
    /// Total number of response times seen so far.
    pub response_time_counter: usize,
    /// Per-status-code counters.
    pub status_code_counts: HashMap<u16, usize>,
    pub success_count: usize,
    pub fail_count: usize,
}
impl RequestMetricAggregate {
    /// Create a new RequestMetricAggregate object.
    pub(crate) fn new(name: &str, method: &str) -> Self {
        trace!("new request {} {}", method, name);
        RequestMetricAggregate {
            name: name.to_string(),
            method: method.to_string(),
            response_times: BTreeMap::new(),
            min_response_time: 0,
            max_response_time: 0,
            total_response_time: 0,
            response_time_counter: 0,
            status_code_counts: HashMap::new(),
            success_count: 0,
            fail_count: 0,
        }
    }

    /// Track the time it took for a request to complete.
    pub(crate) fn set_response_time(&mut self, response_time: u64) {
        let response_time = response_time as usize;

        // Update minimum if this one is fastest yet. A 0 ms response is a real minimum.
        if self.response_time_counter == 0 || response_time < self.min_response_time {
            self.min_response_time = response_time;
        }

        // Update maximum if this one is slowest yet.
        if response_time > self.max_response_time {
            self.max_response_time = response_time;
        }

        self.total_response_time += response_time;
        self.response_time_counter += 1;
        *self.response_times.entry(response_time).or_insert(0) += 1;
    }

    /// Increment counter for status code, creating new counter if first time seeing status code.
    pub(crate) fn set_status_code(&mut self, status_code: u16) {
        *self.status_code_counts.entry(status_code).or_insert(0) += 1;
    }

    /// Record one request.
    pub(crate) fn record(&mut self, request: &RequestMetric) {
        self.set_response_time(request.response_time);
        self.set_status_code(request.status_code);
        if request.success {
            self.success_count += 1;
        } else {
            self.fail_count += 1;
        }
    }
}

/// Pass and fail counters of a named check.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckMetricAggregate {
    pub name: String,
    pub pass_count: usize,
    pub fail_count: usize,
}

/// Iteration counters, the scheduling counters are filled in from the executor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IterationMetrics {
    /// Iterations the executor started.
    pub started: usize,
    /// Iterations that ran to completion and succeeded.
    pub completed: usize,
    /// Iterations that ran to completion and failed, or panicked.
    pub failed: usize,
    /// Arrivals that found no free virtual user.
    pub dropped: usize,
    /// Iterations still running when the graceful stop expired.
    pub interrupted: usize,
    /// How many virtual users were allocated.
    pub vus_allocated: usize,
    /// Per-run-time counters, in milliseconds.
    pub times: BTreeMap<usize, usize>,
    pub min_time: usize,
    pub max_time: usize,
    pub total_time: usize,
    pub counter: usize,
}
impl IterationMetrics {
    pub(crate) fn record(&mut self, iteration: &IterationMetric) {
        let run_time = iteration.run_time as usize;
        if self.counter == 0 || run_time < self.min_time {
            self.min_time = run_time;
        }
        self.max_time = update_max_time(self.max_time, run_time);
        self.total_time += run_time;
        self.counter += 1;
        *self.times.entry(run_time).or_insert(0) += 1;
    }
}

/// A unique error seen during the load test, and how often it happened.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMetric {
    /// The method and name of the failed request, or `iteration`.
    pub name: String,
    pub error: String,
    pub occurrences: usize,
}

/// All metrics aggregated during the load test.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoadTestMetrics {
    /// When the load test started.
    pub started: Option<DateTime<Local>>,
    /// How many seconds the load test ran.
    pub duration: usize,
    /// Requests aggregated by method and name.
    pub requests: HashMap<String, RequestMetricAggregate>,
    /// Checks aggregated by name.
    pub checks: HashMap<String, CheckMetricAggregate>,
    pub iterations: IterationMetrics,
    /// Unique errors, keyed by name and error.
    pub errors: BTreeMap<String, ErrorMetric>,
    /// Results of evaluating the configured thresholds.
    pub thresholds: Vec<ThresholdResult>,
}
impl LoadTestMetrics {
    /// Aggregate one metric.
    pub(crate) fn record(&mut self, metric: LoadTestMetric) {
        match metric {
            LoadTestMetric::Request(request) => {
                let key = format!("{} {}", request.method, request.name);
                if !request.success {
                    self.record_error(&key, &request.error);
                }
                self.requests
                    .entry(key)
                    .or_insert_with(|| RequestMetricAggregate::new(&request.name, &request.method))
                    .record(&request);
            }
            LoadTestMetric::Check(check) => {
                let aggregate = self
                    .checks
                    .entry(check.name.to_string())
                    .or_insert_with(|| CheckMetricAggregate {
                        name: check.name.to_string(),
                        ..Default::default()
                    });
                if check.passed {
                    aggregate.pass_count += 1;
                } else {
                    aggregate.fail_count += 1;
                }
            }
            LoadTestMetric::Iteration(iteration) => {
                self.iterations.record(&iteration);
                if let Some(error) = iteration.error.as_ref() {
                    self.record_error("iteration", error);
                }
            }
        }
    }

    fn record_error(&mut self, name: &str, error: &str) {
        let key = format!("{}: {}", name, error);
        self.errors
            .entry(key)
            .or_insert_with(|| ErrorMetric {
                name: name.to_string(),
                error: error.to_string(),
                occurrences: 0,
            })
            .occurrences += 1;
    }

    /// Copy the executor's scheduling counters.
    pub(crate) fn set_executor_summary(&mut self, summary: &ExecutorSummary) {
        self.iterations.started = summary.started;
        self.iterations.completed = summary.completed;
        self.iterations.failed = summary.failed;
        self.iterations.dropped = summary.dropped;
        self.iterations.interrupted = summary.interrupted;
        self.iterations.vus_allocated = summary.vus_allocated;
    }

    /// Total requests made, setup included.
    pub fn total_requests(&self) -> usize {
        self.requests
            .values()
            .map(|r| r.success_count + r.fail_count)
            .sum()
    }

    /// Fraction of all requests that failed, `0.0` if no requests were made.
    pub fn http_req_failed_rate(&self) -> f64 {
        let total = self.total_requests();
        if total == 0 {
            return 0.0;
        }
        let failed: usize = self.requests.values().map(|r| r.fail_count).sum();
        failed as f64 / total as f64
    }

    /// Fraction of all checks that passed, `0.0` if no checks ran.
    pub fn checks_rate(&self) -> f64 {
        let passed: usize = self.checks.values().map(|c| c.pass_count).sum();
        let failed: usize = self.checks.values().map(|c| c.fail_count).sum();
        if passed + failed == 0 {
            return 0.0;
        }
        passed as f64 / (passed + failed) as f64
    }

    /// Response times of all requests merged together.
    fn aggregate_response_times(&self) -> BTreeMap<usize, usize> {
        self.requests
            .values()
            .fold(BTreeMap::new(), |global, request| {
                merge_times(global, &request.response_times)
            })
    }

    /// The response time the given fraction of all requests completed within.
    pub fn response_time_percentile(&self, percent: f32) -> usize {
        calculate_response_time_percentile(
            &self.aggregate_response_times(),
            self.total_requests(),
            percent,
        )
    }

    /// Average response time of all requests.
    pub fn average_response_time(&self) -> f64 {
        let counter: usize = self.requests.values().map(|r| r.response_time_counter).sum();
        if counter == 0 {
            return 0.0;
        }
        let total: usize = self.requests.values().map(|r| r.total_response_time).sum();
        total as f64 / counter as f64
    }

    /// Fastest response time of all requests.
    pub fn min_response_time(&self) -> usize {
        self.requests
            .values()
            .filter(|r| r.response_time_counter > 0)
            .map(|r| r.min_response_time)
            .min()
            .unwrap_or(0)
    }

    /// Slowest response time of all requests.
    pub fn max_response_time(&self) -> usize {
        self.requests
            .values()
            .fold(0, |max, r| update_max_time(max, r.max_response_time))
    }

    /// Evaluate thresholds against the aggregated metrics, replacing any previous results.
    pub fn evaluate_thresholds(&mut self, thresholds: &[Threshold]) {
        let results = thresholds.iter().map(|t| t.evaluate(self)).collect();
        self.thresholds = results;
    }

    /// Returns `false` if any evaluated threshold was crossed.
    pub fn thresholds_passed(&self) -> bool {
        self.thresholds.iter().all(|t| t.passed)
    }

    /// Display the metrics tables on standard out.
    pub fn print(&self) {
        if !self.requests.is_empty() || self.iterations.started > 0 {
            println!("{}", self);
        }
    }

    pub(crate) fn fmt_overview(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            fmt,
            "\n === OVERVIEW ===\n ------------------------------------------------------------------------------"
        )?;
        if let Some(started) = self.started {
            writeln!(fmt, " Started:          {}", started.format("%y-%m-%d %H:%M:%S"))?;
        }
        writeln!(
            fmt,
            " Duration:         {} seconds",
            format_number(self.duration)
        )?;
        writeln!(
            fmt,
            " Virtual users:    {} allocated",
            format_number(self.iterations.vus_allocated)
        )?;
        Ok(())
    }

    pub(crate) fn fmt_requests(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        // If there's nothing to display, exit immediately.
        if self.requests.is_empty() {
            return Ok(());
        }

        writeln!(
            fmt,
            "\n === PER REQUEST METRICS ===\n ------------------------------------------------------------------------------"
        )?;
        writeln!(
            fmt,
            " {:<24} | {:>13} | {:>14} | {:>8} | {:>7}",
            "Name", "# reqs", "# fails", "req/s", "fail/s"
        )?;
        writeln!(
            fmt,
            " ------------------------------------------------------------------------------"
        )?;
        let mut aggregate_fail_count = 0;
        let mut aggregate_total_count = 0;
        for (request_key, request) in self.requests.iter().sorted_by(|a, b| a.0.cmp(b.0)) {
            let total_count = request.success_count + request.fail_count;
            self.fmt_request_row(fmt, request_key, total_count, request.fail_count)?;
            aggregate_total_count += total_count;
            aggregate_fail_count += request.fail_count;
        }
        if self.requests.len() > 1 {
            writeln!(
                fmt,
                " -------------------------+---------------+----------------+----------+--------"
            )?;
            self.fmt_request_row(
                fmt,
                "Aggregated",
                aggregate_total_count,
                aggregate_fail_count,
            )?;
        }
        Ok(())
    }

    fn fmt_request_row(
        &self,
        fmt: &mut fmt::Formatter<'_>,
        name: &str,
        total_count: usize,
        fail_count: usize,
    ) -> fmt::Result {
        let fail_percent = if fail_count > 0 {
            fail_count as f32 / total_count as f32 * 100.0
        } else {
            0.0
        };
        let (reqs, fails) = per_second_calculations(self.duration, total_count, fail_count);
        // Compress 100.0 and 0.0 to 100 and 0 respectively to save width.
        let fails_column = if fail_percent as usize == 100 || fail_percent as usize == 0 {
            format!("{} ({}%)", format_number(fail_count), fail_percent as usize)
        } else {
            format!("{} ({:.1}%)", format_number(fail_count), fail_percent)
        };
        writeln!(
            fmt,
            " {:<24} | {:>13} | {:>14} | {:>8.reqs_p$} | {:>7.fails_p$}",
            util::truncate_string(name, 24),
            format_number(total_count),
            fails_column,
            reqs,
            fails,
            reqs_p = determine_precision(reqs),
            fails_p = determine_precision(fails),
        )
    }

    pub(crate) fn fmt_response_times(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        // If there's nothing to display, exit immediately.
        if self.requests.is_empty() {
            return Ok(());
        }

        writeln!(
            fmt,
            " ------------------------------------------------------------------------------"
        )?;
        writeln!(
            fmt,
            " {:<24} | {:>11} | {:>10} | {:>10} | {:>11}",
            "Name", "Avg (ms)", "Min", "Max", "Median"
        )?;
        writeln!(
            fmt,
            " ------------------------------------------------------------------------------"
        )?;
        for (request_key, request) in self.requests.iter().sorted_by(|a, b| a.0.cmp(b.0)) {
            let average = match request.response_time_counter {
                0 => 0.0,
                _ => request.total_response_time as f32 / request.response_time_counter as f32,
            };
            writeln!(
                fmt,
                " {:<24} | {:>11.avg_precision$} | {:>10} | {:>10} | {:>11}",
                util::truncate_string(request_key, 24),
                average,
                format_number(request.min_response_time),
                format_number(request.max_response_time),
                format_number(calculate_response_time_percentile(
                    &request.response_times,
                    request.response_time_counter,
                    0.5
                )),
                avg_precision = determine_precision(average),
            )?;
        }
        if self.requests.len() > 1 {
            let average = self.average_response_time() as f32;
            writeln!(
                fmt,
                " -------------------------+-------------+------------+-------------+-----------"
            )?;
            writeln!(
                fmt,
                " {:<24} | {:>11.avg_precision$} | {:>10} | {:>10} | {:>11}",
                "Aggregated",
                average,
                format_number(self.min_response_time()),
                format_number(self.max_response_time()),
                format_number(self.response_time_percentile(0.5)),
                avg_precision = determine_precision(average),
            )?;
        }
        Ok(())
    }

    pub(crate) fn fmt_percentiles(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        // If there's nothing to display, exit immediately.
        if self.requests.is_empty() {
            return Ok(());
        }

        writeln!(
            fmt,
            "\n === RESPONSE TIME PERCENTILES (ms) ===\n ------------------------------------------------------------------------------"
        )?;
        writeln!(
            fmt,
            " {:<24} | {:>8} | {:>8} | {:>8} | {:>8} | {:>8}",
            "Name", "50%", "90%", "95%", "99%", "100%"
        )?;
        writeln!(
            fmt,
            " ------------------------------------------------------------------------------"
        )?;
        let percentiles = [0.5, 0.9, 0.95, 0.99, 1.0];
        for (request_key, request) in self.requests.iter().sorted_by(|a, b| a.0.cmp(b.0)) {
            let values: Vec<String> = percentiles
                .iter()
                .map(|p| {
                    format_number(calculate_response_time_percentile(
                        &request.response_times,
                        request.response_time_counter,
                        *p,
                    ))
                })
                .collect();
            writeln!(
                fmt,
                " {:<24} | {:>8} | {:>8} | {:>8} | {:>8} | {:>8}",
                util::truncate_string(request_key, 24),
                values[0],
                values[1],
                values[2],
                values[3],
                values[4],
            )?;
        }
        if self.requests.len() > 1 {
            let values: Vec<String> = percentiles
                .iter()
                .map(|p| format_number(self.response_time_percentile(*p)))
                .collect();
            writeln!(
                fmt,
                " -------------------------+----------+----------+----------+----------+---------"
            )?;
            writeln!(
                fmt,
                " {:<24} | {:>8} | {:>8} | {:>8} | {:>8} | {:>8}",
                "Aggregated", values[0], values[1], values[2], values[3], values[4],
            )?;
        }
        Ok(())
    }

    pub(crate) fn fmt_status_codes(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        // If there's nothing to display, exit immediately.
        if self.requests.is_empty() {
            return Ok(());
        }

        writeln!(
            fmt,
            "\n === STATUS CODES ===\n ------------------------------------------------------------------------------"
        )?;
        writeln!(fmt, " {:<24} | {:>51} ", "Name", "Status codes")?;
        writeln!(
            fmt,
            " ------------------------------------------------------------------------------"
        )?;
        let mut aggregated_status_code_counts: HashMap<u16, usize> = HashMap::new();
        for (request_key, request) in self.requests.iter().sorted_by(|a, b| a.0.cmp(b.0)) {
            let codes = prepare_status_codes(
                &request.status_code_counts,
                &mut Some(&mut aggregated_status_code_counts),
            );
            writeln!(
                fmt,
                " {:<24} | {:>51}",
                util::truncate_string(request_key, 24),
                codes,
            )?;
        }
        if self.requests.len() > 1 {
            writeln!(
                fmt,
                " -------------------------+----------------------------------------------------"
            )?;
            let codes = prepare_status_codes(&aggregated_status_code_counts, &mut None);
            writeln!(fmt, " {:<24} | {:>51} ", "Aggregated", codes)?;
        }
        Ok(())
    }

    pub(crate) fn fmt_checks(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        // If there's nothing to display, exit immediately.
        if self.checks.is_empty() {
            return Ok(());
        }

        writeln!(
            fmt,
            "\n === CHECKS ===\n ------------------------------------------------------------------------------"
        )?;
        writeln!(
            fmt,
            " {:<24} | {:>13} | {:>14} | {:>19}",
            "Name", "# passes", "# fails", "pass rate"
        )?;
        writeln!(
            fmt,
            " ------------------------------------------------------------------------------"
        )?;
        for (name, check) in self.checks.iter().sorted_by(|a, b| a.0.cmp(b.0)) {
            let total = check.pass_count + check.fail_count;
            let rate = if total > 0 {
                check.pass_count as f32 / total as f32 * 100.0
            } else {
                0.0
            };
            writeln!(
                fmt,
                " {:<24} | {:>13} | {:>14} | {:>18.1}%",
                util::truncate_string(name, 24),
                format_number(check.pass_count),
                format_number(check.fail_count),
                rate,
            )?;
        }
        Ok(())
    }

    pub(crate) fn fmt_iterations(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        // If there's nothing to display, exit immediately.
        if self.iterations.started == 0 {
            return Ok(());
        }

        let iterations = &self.iterations;
        writeln!(
            fmt,
            "\n === ITERATIONS ===\n ------------------------------------------------------------------------------"
        )?;
        writeln!(
            fmt,
            " {:<11} | {:>11} | {:>9} | {:>9} | {:>9} | {:>13}",
            "# started", "# completed", "# failed", "# dropped", "# interr.", "iter/s"
        )?;
        writeln!(
            fmt,
            " ------------------------------------------------------------------------------"
        )?;
        let (per_second, _) = per_second_calculations(self.duration, iterations.started, 0);
        writeln!(
            fmt,
            " {:<11} | {:>11} | {:>9} | {:>9} | {:>9} | {:>13.p$}",
            format_number(iterations.started),
            format_number(iterations.completed),
            format_number(iterations.failed),
            format_number(iterations.dropped),
            format_number(iterations.interrupted),
            per_second,
            p = determine_precision(per_second),
        )?;
        if iterations.counter > 0 {
            let average = iterations.total_time as f32 / iterations.counter as f32;
            writeln!(
                fmt,
                " ------------------------------------------------------------------------------"
            )?;
            writeln!(
                fmt,
                " {:<24} | {:>11} | {:>10} | {:>10} | {:>11}",
                "Iteration duration", "Avg (ms)", "Min", "Max", "Median"
            )?;
            writeln!(
                fmt,
                " {:<24} | {:>11.avg_precision$} | {:>10} | {:>10} | {:>11}",
                "",
                average,
                format_number(iterations.min_time),
                format_number(iterations.max_time),
                format_number(calculate_response_time_percentile(
                    &iterations.times,
                    iterations.counter,
                    0.5
                )),
                avg_precision = determine_precision(average),
            )?;
        }
        Ok(())
    }

    pub(crate) fn fmt_errors(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        // If there's nothing to display, exit immediately.
        if self.errors.is_empty() {
            return Ok(());
        }

        writeln!(
            fmt,
            "\n === ERRORS ===\n ------------------------------------------------------------------------------"
        )?;
        writeln!(fmt, " {:<11} | Error", "Count")?;
        writeln!(
            fmt,
            " ------------------------------------------------------------------------------"
        )?;
        for error in self
            .errors
            .values()
            .sorted_by(|a, b| b.occurrences.cmp(&a.occurrences))
        {
            writeln!(
                fmt,
                " {:<12} {}: {}",
                format_number(error.occurrences),
                error.name,
                util::truncate_string(&error.error, 120),
            )?;
        }
        Ok(())
    }

    pub(crate) fn fmt_thresholds(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        // If there's nothing to display, exit immediately.
        if self.thresholds.is_empty() {
            return Ok(());
        }

        writeln!(
            fmt,
            "\n === THRESHOLDS ===\n ------------------------------------------------------------------------------"
        )?;
        writeln!(
            fmt,
            " {:<40} | {:>18} | {:>14}",
            "Threshold", "Observed", "Result"
        )?;
        writeln!(
            fmt,
            " ------------------------------------------------------------------------------"
        )?;
        for result in &self.thresholds {
            writeln!(
                fmt,
                " {:<40} | {:>18.3} | {:>14}",
                util::truncate_string(&result.threshold, 40),
                result.observed,
                if result.passed { "passed" } else { "CROSSED" },
            )?;
        }
        Ok(())
    }
}

/// Implement format trait to allow displaying metrics.
impl fmt::Display for LoadTestMetrics {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        self.fmt_overview(fmt)?;
        self.fmt_requests(fmt)?;
        self.fmt_response_times(fmt)?;
        self.fmt_percentiles(fmt)?;
        self.fmt_status_codes(fmt)?;
        self.fmt_checks(fmt)?;
        self.fmt_iterations(fmt)?;
        self.fmt_errors(fmt)?;
        self.fmt_thresholds(fmt)
    }
}

/// Aggregation task, receives metrics until every sender has been dropped.
pub(crate) async fn metrics_main(receiver: flume::Receiver<LoadTestMetric>) -> LoadTestMetrics {
    let mut metrics = LoadTestMetrics::default();
    while let Ok(metric) = receiver.recv_async().await {
        metrics.record(metric);
    }
    debug!(
        "aggregated {} requests and {} iterations",
        metrics.total_requests(),
        metrics.iterations.counter
    );
    metrics
}

/// Helper to calculate requests and fails per seconds.
pub(crate) fn per_second_calculations(duration: usize, total: usize, fail: usize) -> (f32, f32) {
    if duration == 0 {
        (0.0, 0.0)
    } else {
        (
            total as f32 / duration as f32,
            fail as f32 / duration as f32,
        )
    }
}

fn determine_precision(value: f32) -> usize {
    if value < 1000.0 {
        2
    } else {
        0
    }
}

/// Format large number in locale appropriate style.
pub(crate) fn format_number(number: usize) -> String {
    (number).to_formatted_string(&Locale::en)
}

/// A helper function that merges together times.
pub(crate) fn merge_times(
    mut global_response_times: BTreeMap<usize, usize>,
    local_response_times: &BTreeMap<usize, usize>,
) -> BTreeMap<usize, usize> {
    for (response_time, count) in local_response_times {
        *global_response_times.entry(*response_time).or_insert(0) += count;
    }
    global_response_times
}

/// A helper function to update the global maximum time based on local time.
pub(crate) fn update_max_time(mut global_max: usize, max: usize) -> usize {
    if global_max < max {
        global_max = max;
    }
    global_max
}

/// Get the response time that a certain fraction of the requests finished within.
pub(crate) fn calculate_response_time_percentile(
    response_times: &BTreeMap<usize, usize>,
    total_requests: usize,
    percent: f32,
) -> usize {
    let percentile_request = (total_requests as f32 * percent).round() as usize;
    debug!(
        "percentile: {}, request {} of total {}",
        percent, percentile_request, total_requests
    );

    let mut total_count: usize = 0;

    for (value, counter) in response_times {
        total_count += counter;
        if total_count >= percentile_request {
            return *value;
        }
    }
    0
}

/// Helper to count and aggregate seen status codes.
fn prepare_status_codes(
    status_code_counts: &HashMap<u16, usize>,
    aggregate_counts: &mut Option<&mut HashMap<u16, usize>>,
) -> String {
    let mut codes: String = "".to_string();
    for (status_code, count) in status_code_counts.iter().sorted() {
        if codes.is_empty() {
            codes = format!("{} [{}]", format_number(*count), status_code_label(*status_code));
        } else {
            codes = format!(
                "{}, {} [{}]",
                codes.clone(),
                format_number(*count),
                status_code_label(*status_code)
            );
        }
        if let Some(aggregate_status_code_counts) = aggregate_counts.as_mut() {
            *aggregate_status_code_counts.entry(*status_code).or_insert(0) += count;
        }
    }
    codes
}

/// Status codes are displayed as numbers, `0` means the request got no response.
fn status_code_label(status_code: u16) -> String {
    match StatusCode::from_u16(status_code) {
        Ok(code) => code.as_u16().to_string(),
        Err(_) => "no response".to_string(),
    }
}
