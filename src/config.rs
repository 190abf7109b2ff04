//! Functions and structures related to configuring the load test.
//!
//! The load test can be configured at run time by passing in the options and flags
//! defined by the [`LoadTestConfiguration`] structure, or with the following
//! environment variables:
//!
//! | Variable | Default | Effect |
//! |---|---|---|
//! | `BASE_URL` | `http://localhost:8080` | target service root |
//! | `PASSWORD` | `1234aabb` | shared password for all synthetic test users |
//! | `RATE` | `500` | target arrivals per second |
//! | `DURATION` | `30s` | total run duration |
//!
//! Command line options take precedence over environment variables, which take
//! precedence over built-in defaults.

use gumdrop::Options;
use serde::{Deserialize, Serialize};
use simplelog::*;
use std::path::PathBuf;
use std::str::FromStr;
use std::{fmt, time};

use crate::logger::LogFormat;
use crate::threshold::Threshold;
use crate::util;
use crate::LoadTestError;

/// Default target service root.
pub const DEFAULT_BASE_URL: &str = "http://localhost:8080";
/// Default password shared by every synthetic test user.
pub const DEFAULT_PASSWORD: &str = "1234aabb";
/// Default number of iterations started per time unit.
pub const DEFAULT_RATE: usize = 500;
/// Default load test duration.
pub const DEFAULT_DURATION: &str = "30s";
/// Default period the rate applies to.
pub const DEFAULT_TIME_UNIT: &str = "1s";
/// How many virtual users may be allocated beyond the pre-allocated pool.
pub const DEFAULT_EXTRA_VUS: usize = 200;
/// Default number of synthetic users logged in during setup.
pub const DEFAULT_USERS: usize = 500;
/// Default number of requests a batch runs in parallel.
pub const DEFAULT_BATCH: usize = 20;
/// Default time in-flight iterations get to finish once the load test ends.
pub const DEFAULT_GRACEFUL_STOP: &str = "30s";
/// Default per-request timeout, in seconds.
pub const DEFAULT_TIMEOUT: &str = "60";

/// Runtime options available when launching the load test.
///
/// Leverages [`gumdrop`](https://docs.rs/gumdrop/) to derive help from the below
/// structure, displayed by passing a `-h` flag.
#[derive(Options, Debug, Clone, Default, Serialize, Deserialize)]
#[options(
    help = r#"Constant-arrival-rate load test for a flash-sale purchase API.

Options can also be set with the BASE_URL, PASSWORD, RATE and DURATION
environment variables. The following runtime options are available:"#
)]
pub struct LoadTestConfiguration {
    /// Displays this help
    #[options(short = "h")]
    pub help: bool,
    /// Prints version information
    // Add a blank line after this option
    #[options(short = "V", help = "Prints version information\n")]
    pub version: bool,

    /// Defines the service to load test (default: http://localhost:8080)
    #[options(short = "H", meta = "URL")]
    pub base_url: String,
    /// Sets the password of all test users (default: 1234aabb)
    #[options(short = "p", meta = "PASSWORD")]
    pub password: String,
    /// Sets how many test users log in during setup (default: 500)
    #[options(short = "u", meta = "USERS")]
    pub users: Option<usize>,
    /// Sets how many login requests run in parallel (default: 20)
    // Add a blank line and then an 'Executor:' header after this option
    #[options(
        no_short,
        meta = "VALUE",
        help = "Sets how many login requests run in parallel (default: 20)\n\nExecutor:"
    )]
    pub batch: Option<usize>,

    /// Sets iterations started per time unit (default: 500)
    #[options(short = "r", meta = "RATE")]
    pub rate: Option<usize>,
    /// Stops load test after (500ms, 30s, 20m, 3h, 1h30m, etc)
    #[options(short = "t", meta = "TIME")]
    pub duration: String,
    /// Sets the period the rate applies to (default: 1s)
    #[options(no_short, meta = "TIME")]
    pub time_unit: String,
    /// Sets virtual users allocated before starting (default: rate)
    #[options(no_short, meta = "VUS")]
    pub pre_allocated_vus: Option<usize>,
    /// Sets the maximum virtual users (default: rate + 200)
    #[options(no_short, meta = "VUS")]
    pub max_vus: Option<usize>,
    /// Stops load test after starting this many iterations
    #[options(no_short, meta = "VALUE")]
    pub iterations: Option<usize>,
    /// Sets how long in-flight iterations may finish (default: 30s)
    #[options(no_short, meta = "TIME")]
    pub graceful_stop: String,
    /// Sets per-request timeout, in seconds (default: 60)
    // Add a blank line and then a 'Metrics:' header after this option
    #[options(
        no_short,
        meta = "VALUE",
        help = "Sets per-request timeout, in seconds (default: 60)\n\nMetrics:"
    )]
    pub timeout: Option<String>,

    /// Replaces default thresholds (http_req_duration:p(95)<3000)
    #[options(no_short, meta = "THRESHOLD")]
    pub threshold: Vec<String>,
    /// Doesn't evaluate thresholds
    #[options(no_short)]
    pub no_thresholds: bool,
    /// Doesn't display metrics at end of load test
    #[options(no_short)]
    pub no_print_metrics: bool,
    /// Sets request log file name
    #[options(short = "R", meta = "NAME")]
    pub request_log: String,
    /// Sets request log format (csv, json, raw)
    // Add a blank line and then a 'Logging:' header after this option
    #[options(
        no_short,
        meta = "FORMAT",
        help = "Sets request log format (csv, json, raw)\n\nLogging:"
    )]
    pub request_format: Option<LogFormat>,

    /// Enables log file and sets name
    #[options(short = "G", meta = "NAME")]
    pub log_file: String,
    /// Increases log file level (-g, -gg, etc)
    #[options(short = "g", count)]
    pub log_level: u8,
    /// Decreases verbosity (-q, -qq, etc)
    #[options(count, short = "q")]
    pub quiet: u8,
    /// Increases verbosity (-v, -vv, etc)
    #[options(count, short = "v")]
    pub verbose: u8,
}

/// Used internally to configure [`LoadTestConfiguration`] values based on precedence rules.
#[derive(Debug, Clone)]
pub(crate) struct ConfigValue<'a, T> {
    /// The optional value to set.
    pub(crate) value: Option<T>,
    /// Filter using this value if true.
    pub(crate) filter: bool,
    /// An optional INFO level log message.
    pub(crate) message: &'a str,
}

pub(crate) trait Configure<T> {
    /// Pick the first unfiltered [`ConfigValue`].
    fn get_value(&self, values: Vec<ConfigValue<T>>) -> Option<T>;
}

impl<T: fmt::Display> Configure<T> for LoadTestConfiguration {
    fn get_value(&self, values: Vec<ConfigValue<T>>) -> Option<T> {
        for value in values {
            if let Some(v) = value.value {
                if value.filter {
                    continue;
                } else {
                    if !value.message.is_empty() {
                        info!("{} = {}", value.message, v)
                    }
                    return Some(v);
                }
            }
        }
        None
    }
}

/// Read an environment variable, treating an empty value as unset.
fn env_string(name: &str) -> Option<String> {
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => Some(value.trim().to_string()),
        _ => None,
    }
}

/// Read an integer environment variable.
fn env_usize(name: &str) -> Result<Option<usize>, LoadTestError> {
    match env_string(name) {
        Some(value) => match usize::from_str(&value) {
            Ok(v) => Ok(Some(v)),
            Err(e) => Err(LoadTestError::InvalidOption {
                option: name.to_string(),
                value,
                detail: format!("environment variable must be an integer: {}", e),
            }),
        },
        None => Ok(None),
    }
}

impl LoadTestConfiguration {
    /// Merge command line options, environment variables and defaults.
    ///
    /// Also initializes the logger, so it must only be invoked one time.
    pub(crate) fn configure(&mut self) -> Result<(), LoadTestError> {
        // Logging is configured first so the rest of the configuration is logged.
        self.initialize_logger();

        let env_base_url = env_string("BASE_URL");
        let env_password = env_string("PASSWORD");
        let env_rate = env_usize("RATE")?;
        let env_duration = env_string("DURATION");

        // Configure `base_url`.
        self.base_url = self
            .get_value(vec![
                // Use --base-url if set.
                ConfigValue {
                    value: Some(self.base_url.to_string()),
                    filter: self.base_url.is_empty(),
                    message: "base_url",
                },
                // Otherwise use BASE_URL if set.
                ConfigValue {
                    value: env_base_url.clone(),
                    filter: env_base_url.is_none(),
                    message: "base_url",
                },
                // Otherwise use the default.
                ConfigValue {
                    value: Some(DEFAULT_BASE_URL.to_string()),
                    filter: false,
                    message: "base_url",
                },
            ])
            .unwrap_or_default();

        // Configure `password`, it's never logged.
        self.password = self
            .get_value(vec![
                ConfigValue {
                    value: Some(self.password.to_string()),
                    filter: self.password.is_empty(),
                    message: "",
                },
                ConfigValue {
                    value: env_password.clone(),
                    filter: env_password.is_none(),
                    message: "",
                },
                ConfigValue {
                    value: Some(DEFAULT_PASSWORD.to_string()),
                    filter: false,
                    message: "",
                },
            ])
            .unwrap_or_default();

        // Configure `rate`.
        self.rate = self.get_value(vec![
            // Use --rate if set.
            ConfigValue {
                value: self.rate,
                filter: self.rate.is_none(),
                message: "rate",
            },
            // Otherwise use RATE if set.
            ConfigValue {
                value: env_rate,
                filter: env_rate.is_none(),
                message: "rate",
            },
            // Otherwise use the default.
            ConfigValue {
                value: Some(DEFAULT_RATE),
                filter: false,
                message: "rate",
            },
        ]);

        // Configure `duration`.
        self.duration = self
            .get_value(vec![
                ConfigValue {
                    value: Some(self.duration.to_string()),
                    filter: self.duration.is_empty(),
                    message: "duration",
                },
                ConfigValue {
                    value: env_duration.clone(),
                    filter: env_duration.is_none(),
                    message: "duration",
                },
                ConfigValue {
                    value: Some(DEFAULT_DURATION.to_string()),
                    filter: false,
                    message: "duration",
                },
            ])
            .unwrap_or_default();

        // Configure `time_unit`.
        if self.time_unit.is_empty() {
            self.time_unit = DEFAULT_TIME_UNIT.to_string();
        }

        // The virtual user pool follows the rate unless set explicitly.
        let rate = self.rate.unwrap_or(DEFAULT_RATE);
        self.pre_allocated_vus = self.get_value(vec![
            ConfigValue {
                value: self.pre_allocated_vus,
                filter: self.pre_allocated_vus.is_none(),
                message: "pre_allocated_vus",
            },
            ConfigValue {
                value: Some(rate),
                filter: false,
                message: "pre_allocated_vus",
            },
        ]);
        self.max_vus = self.get_value(vec![
            ConfigValue {
                value: self.max_vus,
                filter: self.max_vus.is_none(),
                message: "max_vus",
            },
            ConfigValue {
                value: Some(rate + DEFAULT_EXTRA_VUS),
                filter: false,
                message: "max_vus",
            },
        ]);

        if self.users.is_none() {
            self.users = Some(DEFAULT_USERS);
        }
        if self.batch.is_none() {
            self.batch = Some(DEFAULT_BATCH);
        }
        if self.graceful_stop.is_empty() {
            self.graceful_stop = DEFAULT_GRACEFUL_STOP.to_string();
        }
        if self.timeout.is_none() {
            self.timeout = Some(DEFAULT_TIMEOUT.to_string());
        }
        if let Some(iterations) = self.iterations {
            info!("iterations = {}", iterations);
        }

        Ok(())
    }

    /// Validate configured [`LoadTestConfiguration`] values.
    pub(crate) fn validate(&self) -> Result<(), LoadTestError> {
        // Can't set both --verbose and --quiet.
        if self.verbose > 0 && self.quiet > 0 {
            return Err(LoadTestError::InvalidOption {
                option: "`configuration.verbose`".to_string(),
                value: self.verbose.to_string(),
                detail: "`configuration.verbose` can not be set with `configuration.quiet`."
                    .to_string(),
            });
        }

        util::is_valid_host(&self.base_url)?;

        if self.rate() == 0 {
            return Err(LoadTestError::InvalidOption {
                option: "`configuration.rate`".to_string(),
                value: "0".to_string(),
                detail: "`configuration.rate` must be set to at least 1.".to_string(),
            });
        }

        match util::parse_timespan(&self.duration) {
            Some(run_time) if !run_time.is_zero() => (),
            _ => {
                return Err(LoadTestError::InvalidOption {
                    option: "`configuration.duration`".to_string(),
                    value: self.duration.to_string(),
                    detail: "`configuration.duration` must be a time span greater than 0, such as 30s, 1m30s or 500ms."
                        .to_string(),
                });
            }
        }

        match util::parse_timespan(&self.time_unit) {
            Some(rate_period) if !rate_period.is_zero() => (),
            _ => {
                return Err(LoadTestError::InvalidOption {
                    option: "`configuration.time_unit`".to_string(),
                    value: self.time_unit.to_string(),
                    detail: "`configuration.time_unit` must be a time span greater than 0, such as 1s or 1m."
                        .to_string(),
                });
            }
        }

        if util::parse_timespan(&self.graceful_stop).is_none() {
            return Err(LoadTestError::InvalidOption {
                option: "`configuration.graceful_stop`".to_string(),
                value: self.graceful_stop.to_string(),
                detail: "`configuration.graceful_stop` must be a time span, such as 30s.".to_string(),
            });
        }

        if self.users() == 0 {
            return Err(LoadTestError::InvalidOption {
                option: "`configuration.users`".to_string(),
                value: "0".to_string(),
                detail: "`configuration.users` must be set to at least 1.".to_string(),
            });
        }

        if self.batch() == 0 {
            return Err(LoadTestError::InvalidOption {
                option: "`configuration.batch`".to_string(),
                value: "0".to_string(),
                detail: "`configuration.batch` must be set to at least 1.".to_string(),
            });
        }

        if self.pre_allocated_vus() == 0 {
            return Err(LoadTestError::InvalidOption {
                option: "`configuration.pre_allocated_vus`".to_string(),
                value: "0".to_string(),
                detail: "`configuration.pre_allocated_vus` must be set to at least 1."
                    .to_string(),
            });
        }

        if self.max_vus() < self.pre_allocated_vus() {
            return Err(LoadTestError::InvalidOption {
                option: "`configuration.max_vus`".to_string(),
                value: self.max_vus().to_string(),
                detail: "`configuration.max_vus` can not be less than `configuration.pre_allocated_vus`."
                    .to_string(),
            });
        }

        if let Some(iterations) = self.iterations {
            if iterations == 0 {
                return Err(LoadTestError::InvalidOption {
                    option: "`configuration.iterations`".to_string(),
                    value: "0".to_string(),
                    detail: "`configuration.iterations` must be set to at least 1.".to_string(),
                });
            }
        }

        // If set, timeout must be greater than zero.
        if let Some(timeout) = self.timeout.as_ref() {
            match util::get_float_from_string(Some(timeout.to_string())) {
                Some(t) if t > 0.0 && time::Duration::try_from_secs_f32(t).is_ok() => (),
                _ => {
                    return Err(LoadTestError::InvalidOption {
                        option: "`configuration.timeout`".to_string(),
                        value: timeout.to_string(),
                        detail: "`configuration.timeout` must be a finite number of seconds greater than 0."
                            .to_string(),
                    });
                }
            }
        }

        Ok(())
    }

    /// Iterations started per time unit.
    pub fn rate(&self) -> usize {
        self.rate.unwrap_or(DEFAULT_RATE)
    }

    /// How long iterations are started for.
    pub fn run_time(&self) -> time::Duration {
        util::parse_timespan(&self.duration).unwrap_or_default()
    }

    /// The period `rate` applies to.
    pub fn rate_period(&self) -> time::Duration {
        util::parse_timespan(&self.time_unit).unwrap_or_default()
    }

    /// How long in-flight iterations may run once the load test ends.
    pub fn graceful_stop_time(&self) -> time::Duration {
        util::parse_timespan(&self.graceful_stop).unwrap_or_default()
    }

    /// Virtual users allocated before the first iteration starts.
    pub fn pre_allocated_vus(&self) -> usize {
        self.pre_allocated_vus.unwrap_or_else(|| self.rate())
    }

    /// The ceiling of the virtual user pool.
    pub fn max_vus(&self) -> usize {
        self.max_vus
            .unwrap_or_else(|| self.rate() + DEFAULT_EXTRA_VUS)
    }

    /// How many synthetic users log in during setup.
    pub fn users(&self) -> usize {
        self.users.unwrap_or(DEFAULT_USERS)
    }

    /// How many requests of a batch run in parallel.
    pub fn batch(&self) -> usize {
        self.batch.unwrap_or(DEFAULT_BATCH)
    }

    /// Per-request timeout.
    pub fn request_timeout(&self) -> time::Duration {
        util::get_float_from_string(self.timeout.clone())
            .and_then(|seconds| time::Duration::try_from_secs_f32(seconds).ok())
            .unwrap_or_else(|| time::Duration::from_secs(60))
    }

    /// Format of the optional request log.
    pub fn request_format(&self) -> LogFormat {
        self.request_format.clone().unwrap_or(LogFormat::Json)
    }

    /// Parse configured thresholds, or return the defaults if none are configured.
    pub fn thresholds(&self) -> Result<Vec<Threshold>, LoadTestError> {
        if self.threshold.is_empty() {
            Ok(Threshold::defaults())
        } else {
            self.threshold
                .iter()
                .map(|t| Threshold::from_str(t))
                .collect()
        }
    }

    /// Initialize the logger which writes to standard out and optionally to a log file.
    pub(crate) fn initialize_logger(&self) {
        // Configure console output level.
        let debug_level = match self.verbose {
            0 => match self.quiet {
                0 => LevelFilter::Info,
                _ => LevelFilter::Warn,
            },
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        // Configure log file level.
        let log_level = match self.log_level {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        // Open the log file if configured.
        let log_file: Option<PathBuf> = if !self.log_file.is_empty() {
            Some(PathBuf::from(&self.log_file))
        // Otherwise disable the log.
        } else {
            None
        };

        let mut loggers: Vec<Box<dyn SharedLogger>> =
            vec![SimpleLogger::new(debug_level, Config::default())];
        if let Some(log_to_file) = log_file.as_ref() {
            match std::fs::File::create(log_to_file) {
                Ok(file) => loggers.push(WriteLogger::new(log_level, Config::default(), file)),
                Err(e) => eprintln!("failed to create log file {}: {}", log_to_file.display(), e),
            }
        }

        match CombinedLogger::init(loggers) {
            Ok(_) => (),
            Err(e) => {
                info!("failed to initialize CombinedLogger: {}", e);
            }
        }
        if let Some(log_to_file) = log_file {
            info!("Writing to log file: {}", log_to_file.display());
        }

        info!("Output verbosity level: {}", debug_level);
        info!("Logfile verbosity level: {}", log_level);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serial_test::serial;

    fn clear_environment() {
        for name in &["BASE_URL", "PASSWORD", "RATE", "DURATION"] {
            std::env::remove_var(name);
        }
    }

    #[test]
    #[serial]
    fn defaults() {
        clear_environment();
        let mut configuration = LoadTestConfiguration::parse_args_default(&[] as &[&str])
            .expect("failed to parse empty options");
        configuration.configure().unwrap();
        configuration.validate().unwrap();

        assert_eq!(configuration.base_url, DEFAULT_BASE_URL);
        assert_eq!(configuration.password, DEFAULT_PASSWORD);
        assert_eq!(configuration.rate(), 500);
        assert_eq!(configuration.run_time(), time::Duration::from_secs(30));
        assert_eq!(configuration.rate_period(), time::Duration::from_secs(1));
        assert_eq!(configuration.pre_allocated_vus(), 500);
        assert_eq!(configuration.max_vus(), 700);
        assert_eq!(configuration.users(), 500);
        assert_eq!(configuration.batch(), 20);
        assert_eq!(
            configuration.graceful_stop_time(),
            time::Duration::from_secs(30)
        );
        assert_eq!(configuration.thresholds().unwrap().len(), 2);
    }

    #[test]
    #[serial]
    fn environment_overrides_defaults() {
        clear_environment();
        std::env::set_var("BASE_URL", "http://shop.example.com");
        std::env::set_var("PASSWORD", "secret");
        std::env::set_var("RATE", "50");
        std::env::set_var("DURATION", "1m30s");

        let mut configuration = LoadTestConfiguration::parse_args_default(&[] as &[&str])
            .expect("failed to parse empty options");
        configuration.configure().unwrap();
        clear_environment();

        assert_eq!(configuration.base_url, "http://shop.example.com");
        assert_eq!(configuration.password, "secret");
        assert_eq!(configuration.rate(), 50);
        assert_eq!(configuration.run_time(), time::Duration::from_secs(90));
        // The virtual user pool follows the rate.
        assert_eq!(configuration.pre_allocated_vus(), 50);
        assert_eq!(configuration.max_vus(), 250);
    }

    #[test]
    #[serial]
    fn options_override_environment() {
        clear_environment();
        std::env::set_var("BASE_URL", "http://shop.example.com");
        std::env::set_var("RATE", "50");

        let mut configuration = LoadTestConfiguration::parse_args_default(&[
            "--base-url",
            "http://127.0.0.1:9000",
            "--rate",
            "10",
            "--max-vus",
            "15",
        ])
        .expect("failed to parse options");
        configuration.configure().unwrap();
        clear_environment();

        assert_eq!(configuration.base_url, "http://127.0.0.1:9000");
        assert_eq!(configuration.rate(), 10);
        assert_eq!(configuration.pre_allocated_vus(), 10);
        assert_eq!(configuration.max_vus(), 15);
    }

    #[test]
    #[serial]
    fn millisecond_duration() {
        clear_environment();
        std::env::set_var("DURATION", "500ms");
        let mut configuration = LoadTestConfiguration::parse_args_default(&[] as &[&str])
            .expect("failed to parse empty options");
        configuration.configure().unwrap();
        clear_environment();

        configuration.validate().unwrap();
        assert_eq!(configuration.run_time(), time::Duration::from_millis(500));
    }

    #[test]
    #[serial]
    fn invalid_environment() {
        clear_environment();
        std::env::set_var("RATE", "fast");
        let mut configuration = LoadTestConfiguration::parse_args_default(&[] as &[&str])
            .expect("failed to parse empty options");
        let result = configuration.configure();
        clear_environment();
        assert!(result.is_err());
    }

    #[test]
    #[serial]
    fn validation() {
        clear_environment();
        let invalid: Vec<Vec<&str>> = vec![
            vec!["--rate", "0"],
            vec!["--duration", "0"],
            vec!["--duration", "soon"],
            vec!["--users", "0"],
            vec!["--batch", "0"],
            vec!["--base-url", "localhost/"],
            vec!["--pre-allocated-vus", "10", "--max-vus", "5"],
            vec!["--iterations", "0"],
            vec!["--timeout", "0"],
            vec!["--timeout", "inf"],
            vec!["--timeout", "1e30"],
            vec!["--duration", "2d"],
            vec!["--time-unit", "0s"],
            vec!["--graceful-stop", "later"],
            vec!["-v", "-q"],
        ];
        for options in invalid {
            let mut configuration = LoadTestConfiguration::parse_args_default(&options)
                .expect("failed to parse options");
            configuration.configure().unwrap();
            assert!(
                configuration.validate().is_err(),
                "{:?} should be invalid",
                options
            );
        }
    }

    #[test]
    #[serial]
    fn custom_thresholds() {
        clear_environment();
        let mut configuration = LoadTestConfiguration::parse_args_default(&[
            "--threshold",
            "http_req_duration:p(99)<500",
            "--threshold",
            "checks:rate>0.9",
            "--threshold",
            "http_req_failed:rate<0.01",
        ])
        .expect("failed to parse options");
        configuration.configure().unwrap();
        assert_eq!(configuration.thresholds().unwrap().len(), 3);

        let configuration =
            LoadTestConfiguration::parse_args_default(&["--threshold", "latency<3"])
                .expect("failed to parse options");
        assert!(configuration.thresholds().is_err());
    }
}
