//! Everything needed to run the flash-sale load test, or to write another scenario.
//!
//! ```rust
//! use flash_sale_loadtest::prelude::*;
//! ```

pub use crate::client::{HttpClient, HttpRequest, HttpResponse, LoadTestClient};
pub use crate::config::LoadTestConfiguration;
pub use crate::executor::{ConstantArrivalRate, ExecutorSummary};
pub use crate::flash_sale::{FlashSaleScenario, TestContext};
pub use crate::metrics::LoadTestMetrics;
pub use crate::scenario::{IterationError, IterationResult, Scenario, VirtualUser};
pub use crate::threshold::{Threshold, ThresholdResult};
pub use crate::{LoadTest, LoadTestError};
