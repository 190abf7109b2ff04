//! # Flash Sale Load Test
//!
//! A constant-arrival-rate load test for a flash-sale purchase API.
//!
//! The load test runs in two stages:
//!  - **setup** runs one time: it fetches the active flash-sale items, then logs in a
//!    pool of synthetic users (`test1@testmail.com` ... `test500@testmail.com`) and keeps
//!    the bearer token of every successful login;
//!  - **iterations** are then started at a constant rate (500 per second by default) for
//!    the configured duration: each iteration buys a random flash-sale product with a
//!    random token, checks that the purchase returned `200`, and logs failures plus a
//!    sample of successes.
//!
//! When the load test completes, aggregated metrics are displayed and the configured
//! thresholds are evaluated. By default the load test fails if more than half of all
//! requests failed, or if the 95th percentile response time reached 3 seconds.
//!
//! ## Running the load test
//!
//! ```bash
//! $ BASE_URL=http://10.21.32.33:8080 RATE=200 DURATION=1m cargo run --release
//! ```
//!
//! All environment variables can also be set with command line options, which take
//! precedence. Run with `-h` for a complete list.
//!
//! ## Using the library
//!
//! The flash-sale logic only depends on the small engine exposed by this crate: the
//! [`Scenario`](./scenario/trait.Scenario.html) trait registers the setup and iteration
//! callbacks, the [`HttpClient`](./client/trait.HttpClient.html) trait provides single
//! and batched requests, and [`VirtualUser::check`](./scenario/struct.VirtualUser.html#method.check)
//! records named checks.
//!
//! ```rust,no_run
//! use flash_sale_loadtest::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), LoadTestError> {
//!     let load_test = LoadTest::initialize()?;
//!     let scenario = FlashSaleScenario::new(load_test.configuration());
//!     let metrics = load_test.execute(scenario).await?;
//!     assert!(metrics.thresholds_passed());
//!     Ok(())
//! }
//! ```

#[macro_use]
extern crate log;

pub mod client;
pub mod config;
pub mod executor;
pub mod flash_sale;
pub mod logger;
pub mod metrics;
pub mod prelude;
pub mod scenario;
pub mod threshold;
pub mod util;

use chrono::prelude::*;
use gumdrop::Options;
use lazy_static::lazy_static;
use std::sync::{Arc, RwLock};
use std::{fmt, io, time};

use crate::client::{HttpClient, LoadTestClient};
use crate::config::LoadTestConfiguration;
use crate::executor::ConstantArrivalRate;
use crate::metrics::LoadTestMetrics;
use crate::scenario::Scenario;
use crate::threshold::Threshold;

lazy_static! {
    /// Flipped to `true` by the ctrl-c handler.
    static ref CANCELED: Arc<RwLock<bool>> = Arc::new(RwLock::new(false));
}

/// An enumeration of all errors a [`LoadTest`](./struct.LoadTest.html) can return.
#[derive(Debug)]
pub enum LoadTestError {
    /// Wraps a [`std::io::Error`](https://doc.rust-lang.org/std/io/struct.Error.html).
    Io(io::Error),
    /// Wraps a [`reqwest::Error`](https://docs.rs/reqwest/*/reqwest/struct.Error.html).
    Reqwest(reqwest::Error),
    /// Wraps a ['tokio::task::JoinError'](https://tokio-rs.github.io/tokio/doc/tokio/task/struct.JoinError.html).
    TokioJoin(tokio::task::JoinError),
    /// Wraps a [`serde_json::Error`](https://docs.rs/serde_json/*/serde_json/struct.Error.html).
    Json(serde_json::Error),
    /// Failed to parse the base url.
    InvalidHost {
        /// The invalid base url that caused this error.
        host: String,
        /// An optional explanation of the error.
        detail: String,
        /// Wraps a [`url::ParseError`](https://docs.rs/url/*/url/enum.ParseError.html).
        parse_error: url::ParseError,
    },
    /// Invalid option or value specified, may only be invalid in context.
    InvalidOption {
        /// The invalid option that caused this error, may be only invalid in context.
        option: String,
        /// The invalid value that caused this error, may be only invalid in context.
        value: String,
        /// An optional explanation of the error.
        detail: String,
    },
    /// A threshold expression could not be parsed.
    InvalidThreshold {
        /// The threshold expression that failed to parse.
        threshold: String,
        /// An optional explanation of the error.
        detail: String,
    },
    /// The server returned a response that setup could not make sense of.
    InvalidResponse {
        /// The url that was requested.
        url: String,
        /// An optional explanation of the error.
        detail: String,
    },
    /// Setup found no active flash-sale items.
    NoFlashSaleItems,
    /// Setup was unable to log in a single user.
    NoTokens {
        /// How many logins were attempted.
        attempted: usize,
    },
}
/// Implement a helper to provide a text description of all possible types of errors.
impl LoadTestError {
    fn describe(&self) -> &str {
        match *self {
            LoadTestError::Io(_) => "io::Error",
            LoadTestError::Reqwest(_) => "reqwest::Error",
            LoadTestError::TokioJoin(_) => "tokio::task::JoinError",
            LoadTestError::Json(_) => "serde_json::Error",
            LoadTestError::InvalidHost { .. } => "failed to parse base url",
            LoadTestError::InvalidOption { .. } => "invalid option or value specified",
            LoadTestError::InvalidThreshold { .. } => "invalid threshold specified",
            LoadTestError::InvalidResponse { .. } => "invalid response",
            LoadTestError::NoFlashSaleItems => "No items found or no flash safe active",
            LoadTestError::NoTokens { .. } => "Cannot get any jwt!",
        }
    }
}

/// Implement format trait to allow displaying errors.
impl fmt::Display for LoadTestError {
    // Implement display of error with `{}` marker.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            LoadTestError::Io(ref source) => {
                write!(f, "LoadTestError: {} ({})", self.describe(), source)
            }
            LoadTestError::Reqwest(ref source) => {
                write!(f, "LoadTestError: {} ({})", self.describe(), source)
            }
            LoadTestError::TokioJoin(ref source) => {
                write!(f, "LoadTestError: {} ({})", self.describe(), source)
            }
            LoadTestError::Json(ref source) => {
                write!(f, "LoadTestError: {} ({})", self.describe(), source)
            }
            LoadTestError::InvalidHost {
                ref host,
                ref parse_error,
                ..
            } => write!(
                f,
                "LoadTestError: {} {} ({})",
                self.describe(),
                host,
                parse_error
            ),
            LoadTestError::InvalidOption {
                ref option,
                ref value,
                ref detail,
            } => write!(
                f,
                "LoadTestError: {} {}={} ({})",
                self.describe(),
                option,
                value,
                detail
            ),
            LoadTestError::InvalidThreshold {
                ref threshold,
                ref detail,
            } => write!(
                f,
                "LoadTestError: {} {} ({})",
                self.describe(),
                threshold,
                detail
            ),
            LoadTestError::InvalidResponse {
                ref url,
                ref detail,
            } => write!(
                f,
                "LoadTestError: {} from {} ({})",
                self.describe(),
                url,
                detail
            ),
            LoadTestError::NoTokens { attempted } => write!(
                f,
                "LoadTestError: {} ({} logins attempted)",
                self.describe(),
                attempted
            ),
            _ => write!(f, "LoadTestError: {}", self.describe()),
        }
    }
}

// Define the lower level source of this error, if any.
impl std::error::Error for LoadTestError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match *self {
            LoadTestError::Io(ref source) => Some(source),
            LoadTestError::Reqwest(ref source) => Some(source),
            LoadTestError::TokioJoin(ref source) => Some(source),
            LoadTestError::Json(ref source) => Some(source),
            LoadTestError::InvalidHost {
                ref parse_error, ..
            } => Some(parse_error),
            _ => None,
        }
    }
}

/// Auto-convert Reqwest errors.
impl From<reqwest::Error> for LoadTestError {
    fn from(err: reqwest::Error) -> LoadTestError {
        LoadTestError::Reqwest(err)
    }
}

/// Auto-convert IO errors.
impl From<io::Error> for LoadTestError {
    fn from(err: io::Error) -> LoadTestError {
        LoadTestError::Io(err)
    }
}

/// Auto-convert TokioJoin errors.
impl From<tokio::task::JoinError> for LoadTestError {
    fn from(err: tokio::task::JoinError) -> LoadTestError {
        LoadTestError::TokioJoin(err)
    }
}

/// Auto-convert serde_json errors.
impl From<serde_json::Error> for LoadTestError {
    fn from(err: serde_json::Error) -> LoadTestError {
        LoadTestError::Json(err)
    }
}

/// A fully configured load test, ready to execute a [`Scenario`](./scenario/trait.Scenario.html).
pub struct LoadTest {
    /// Run-time configuration, with command line, environment and defaults merged.
    configuration: LoadTestConfiguration,
    /// Thresholds evaluated after the load test completes.
    thresholds: Vec<Threshold>,
}
impl LoadTest {
    /// Load configuration from the command line and the environment.
    ///
    /// Exits the process after displaying help if `-h` is passed, or after displaying
    /// the version if `-V` is passed.
    pub fn initialize() -> Result<LoadTest, LoadTestError> {
        let configuration = LoadTestConfiguration::parse_args_default_or_exit();
        if configuration.version {
            println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
            std::process::exit(0);
        }
        LoadTest::initialize_with_config(configuration)
    }

    /// Initialize a load test with an already parsed configuration.
    ///
    /// Environment variables and built-in defaults fill in anything the
    /// configuration leaves unset.
    pub fn initialize_with_config(
        mut configuration: LoadTestConfiguration,
    ) -> Result<LoadTest, LoadTestError> {
        configuration.configure()?;
        configuration.validate()?;
        let thresholds = configuration.thresholds()?;
        Ok(LoadTest {
            configuration,
            thresholds,
        })
    }

    /// The merged run-time configuration.
    pub fn configuration(&self) -> &LoadTestConfiguration {
        &self.configuration
    }

    /// Run setup one time, then start iterations at a constant rate until the
    /// configured duration expires.
    ///
    /// A setup failure aborts the load test before any iteration starts. Iteration
    /// failures never abort the load test, they are recorded in the returned
    /// [`LoadTestMetrics`](./metrics/struct.LoadTestMetrics.html).
    pub async fn execute<S: Scenario>(self, scenario: S) -> Result<LoadTestMetrics, LoadTestError> {
        util::setup_ctrlc_handler();

        // Optionally launch the request logger.
        let (logger_handle, logger_tx) = if !self.configuration.request_log.is_empty() {
            let (tx, rx) = flume::unbounded();
            let handle = tokio::spawn(logger::logger_main(
                self.configuration.request_log.clone(),
                self.configuration.request_format(),
                rx,
            ));
            (Some(handle), Some(tx))
        } else {
            (None, None)
        };

        // Launch the metrics aggregator, it exits once every sender has been dropped.
        let (metrics_tx, metrics_rx) = flume::unbounded();
        let metrics_handle = tokio::spawn(metrics::metrics_main(metrics_rx));

        let client: Arc<dyn HttpClient> = Arc::new(
            LoadTestClient::new(&self.configuration)?
                .set_metrics(metrics_tx.clone())
                .set_logger(logger_tx.clone()),
        );

        let started = Local::now();
        let timer = time::Instant::now();
        info!("[setup] {}: initializing test data...", scenario.name());
        let setup = scenario.setup(client.as_ref()).await;

        let summary = match setup {
            Ok(context) => {
                let executor = ConstantArrivalRate::from_configuration(&self.configuration);
                Ok(executor
                    .run(
                        Arc::new(scenario),
                        Arc::new(context),
                        client.clone(),
                        Some(metrics_tx.clone()),
                    )
                    .await)
            }
            Err(e) => {
                error!("[setup] {}", e);
                Err(e)
            }
        };

        // Close the metrics channel and wait for all metrics to be aggregated.
        drop(client);
        drop(metrics_tx);
        let mut load_test_metrics = metrics_handle.await?;

        // Tell the logger thread to flush and exit.
        if let Some(tx) = logger_tx {
            let _ = tx.send(None);
        }
        if let Some(handle) = logger_handle {
            handle.await??;
        }

        // A failed setup aborts the load test without generating load.
        let summary = summary?;

        load_test_metrics.started = Some(started);
        load_test_metrics.duration = timer.elapsed().as_secs() as usize;
        load_test_metrics.set_executor_summary(&summary);

        if !self.configuration.no_thresholds {
            load_test_metrics.evaluate_thresholds(&self.thresholds);
        }

        if !self.configuration.no_print_metrics {
            load_test_metrics.print();
        }

        Ok(load_test_metrics)
    }
}
