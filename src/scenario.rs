//! Scenarios and the virtual users that run them.
//!
//! A [`Scenario`] has two stages:
//!  - [`Scenario::setup`] runs one time before any load is generated, and returns a
//!    context shared read-only by every iteration;
//!  - [`Scenario::iteration`] is invoked once for every scheduled arrival, by whichever
//!    [`VirtualUser`] is free.

use async_trait::async_trait;
use std::sync::Arc;
use std::{fmt, time};

use crate::client::{HttpClient, HttpRequest, HttpResponse};
use crate::metrics::{CheckMetric, IterationMetric, LoadTestMetric};
use crate::LoadTestError;

/// Why an iteration failed.
///
/// Failed iterations are counted, they never stop the load test.
#[derive(Debug)]
pub enum IterationError {
    /// A request could not be completed.
    Request {
        /// The url that was requested.
        url: String,
        detail: String,
    },
    /// The server returned something the iteration could not use.
    InvalidResponse {
        /// The url that was requested.
        url: String,
        detail: String,
    },
}
impl fmt::Display for IterationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            IterationError::Request { url, detail } => {
                write!(f, "request to {} failed ({})", url, detail)
            }
            IterationError::InvalidResponse { url, detail } => {
                write!(f, "invalid response from {} ({})", url, detail)
            }
        }
    }
}
impl std::error::Error for IterationError {}

pub type IterationResult = Result<(), IterationError>;

/// The callbacks the executor drives.
#[async_trait]
pub trait Scenario: Send + Sync + 'static {
    /// Read-only data prepared by setup and shared by all iterations.
    type Context: Send + Sync + 'static;

    fn name(&self) -> &str;

    /// Runs one time before any iteration. An error aborts the load test.
    async fn setup(&self, client: &dyn HttpClient) -> Result<Self::Context, LoadTestError>;

    /// Runs once per scheduled arrival.
    async fn iteration(&self, context: &Self::Context, user: &VirtualUser) -> IterationResult;
}

/// A virtual user, reused across many iterations.
#[derive(Clone)]
pub struct VirtualUser {
    /// Starts at 1.
    pub id: usize,
    /// How many iterations this virtual user has run, starting at 0.
    pub iteration: usize,
    client: Arc<dyn HttpClient>,
    metrics: Option<flume::Sender<LoadTestMetric>>,
}
impl fmt::Debug for VirtualUser {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("VirtualUser")
            .field("id", &self.id)
            .field("iteration", &self.iteration)
            .finish()
    }
}
impl VirtualUser {
    pub fn new(
        id: usize,
        client: Arc<dyn HttpClient>,
        metrics: Option<flume::Sender<LoadTestMetric>>,
    ) -> Self {
        VirtualUser {
            id,
            iteration: 0,
            client,
            metrics,
        }
    }

    /// Send a request on behalf of this virtual user.
    pub async fn send(&self, request: HttpRequest) -> HttpResponse {
        self.client.send(request.set_user(self.id)).await
    }

    /// Record a named check, returning whether it passed.
    pub fn check(&self, name: &str, passed: bool) -> bool {
        self.send_metric(LoadTestMetric::Check(CheckMetric {
            name: name.to_string(),
            passed,
        }));
        passed
    }

    /// Record the outcome of an iteration, then advance the iteration counter.
    pub(crate) fn finish_iteration(&mut self, started: time::Instant, error: Option<String>) {
        self.send_metric(LoadTestMetric::Iteration(IterationMetric {
            user: self.id,
            iteration: self.iteration,
            run_time: started.elapsed().as_millis() as u64,
            success: error.is_none(),
            error,
        }));
        self.iteration += 1;
    }

    fn send_metric(&self, metric: LoadTestMetric) {
        if let Some(metrics) = self.metrics.as_ref() {
            if let Err(e) = metrics.send(metric) {
                debug!("[VU {}] failed to send metric: {}", self.id, e);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct NoClient;

    #[async_trait]
    impl HttpClient for NoClient {
        async fn send(&self, request: HttpRequest) -> HttpResponse {
            HttpResponse {
                url: request.url,
                status: 200,
                body: request.user.to_string(),
                ..Default::default()
            }
        }
    }

    #[tokio::test]
    async fn virtual_user() {
        let (tx, rx) = flume::unbounded();
        let mut user = VirtualUser::new(7, Arc::new(NoClient), Some(tx));

        // Requests are sent on behalf of the virtual user.
        let response = user.send(HttpRequest::get("http://localhost/")).await;
        assert_eq!(response.body, "7");

        assert!(user.check("status is 200", true));
        assert!(!user.check("status is 200", false));

        assert_eq!(user.iteration, 0);
        user.finish_iteration(time::Instant::now(), None);
        user.finish_iteration(time::Instant::now(), Some("sold out".to_string()));
        assert_eq!(user.iteration, 2);

        let metrics: Vec<LoadTestMetric> = rx.drain().collect();
        assert_eq!(metrics.len(), 4);
        match &metrics[3] {
            LoadTestMetric::Iteration(iteration) => {
                assert_eq!(iteration.user, 7);
                assert_eq!(iteration.iteration, 1);
                assert!(!iteration.success);
            }
            other => panic!("unexpected metric: {:?}", other),
        }
    }

    #[test]
    fn iteration_error() {
        let error = IterationError::InvalidResponse {
            url: "http://localhost/".to_string(),
            detail: "not json".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "invalid response from http://localhost/ (not json)"
        );
    }
}
