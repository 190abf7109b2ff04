//! HTTP requests, responses and the client used to send them.
//!
//! The flash-sale logic only talks to the [`HttpClient`] trait, which sends one request
//! or a batch of requests. [`LoadTestClient`] implements it with
//! [`reqwest`](https://docs.rs/reqwest/), recording a
//! [`RequestMetric`](../metrics/struct.RequestMetric.html) for every request it sends.
//!
//! Transport failures never surface as errors: the returned [`HttpResponse`] has a
//! status of `0` and the failure is described in [`HttpResponse::error`].

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use http::header::{AUTHORIZATION, CONTENT_TYPE};
use http::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::time;
use url::Url;

use crate::config::{LoadTestConfiguration, DEFAULT_BATCH};
use crate::metrics::{LoadTestMetric, RequestMetric};
use crate::LoadTestError;

static APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// A request to send.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    /// The fully qualified url.
    pub url: String,
    /// Requests are aggregated by method and name, the name defaults to the url path.
    pub name: String,
    pub body: Option<String>,
    pub headers: Vec<(String, String)>,
    /// The virtual user sending this request, `0` during setup.
    pub(crate) user: usize,
}
impl HttpRequest {
    pub fn new(method: Method, url: &str) -> Self {
        let name = match Url::parse(url) {
            Ok(parsed) => parsed.path().to_string(),
            Err(_) => url.to_string(),
        };
        HttpRequest {
            method,
            url: url.to_string(),
            name,
            body: None,
            headers: Vec::new(),
            user: 0,
        }
    }

    pub fn get(url: &str) -> Self {
        HttpRequest::new(Method::GET, url)
    }

    pub fn post(url: &str) -> Self {
        HttpRequest::new(Method::POST, url)
    }

    /// Send a JSON body, also sets `Content-Type: application/json`.
    pub fn set_json<T: Serialize + ?Sized>(mut self, body: &T) -> Result<Self, serde_json::Error> {
        self.body = Some(serde_json::to_string(body)?);
        Ok(self)
    }

    pub fn set_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// Authenticate with a bearer token.
    pub fn bearer(self, token: &str) -> Self {
        self.set_header(AUTHORIZATION.as_str(), &format!("Bearer {}", token))
    }

    pub(crate) fn set_user(mut self, user: usize) -> Self {
        self.user = user;
        self
    }

    fn has_header(&self, name: &str) -> bool {
        self.headers.iter().any(|(n, _)| n.eq_ignore_ascii_case(name))
    }
}

/// The response to a request.
#[derive(Debug, Clone, Default)]
pub struct HttpResponse {
    /// The url that was requested.
    pub url: String,
    /// The status code, `0` if no response was received.
    pub status: u16,
    pub body: String,
    /// Set if the request could not be sent or the body could not be read.
    pub error: Option<String>,
    /// How many milliseconds the request took.
    pub response_time: u64,
}
impl HttpResponse {
    /// Deserialize the body.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.body)
    }

    /// Extract a value from a JSON body with a dot-separated path, for example
    /// `data.token`. Array elements are selected by index, for example `data.0`.
    ///
    /// Returns `None` if the body isn't JSON or the path doesn't exist.
    pub fn json_path(&self, path: &str) -> Option<Value> {
        let mut value: Value = self.json().ok()?;
        for segment in path.split('.').filter(|s| !s.is_empty()) {
            value = match value {
                Value::Object(mut map) => map.remove(segment)?,
                Value::Array(mut array) => {
                    let index: usize = segment.parse().ok()?;
                    if index < array.len() {
                        array.swap_remove(index)
                    } else {
                        return None;
                    }
                }
                _ => return None,
            };
        }
        Some(value)
    }

    /// A response was received with a 2xx or 3xx status code.
    pub fn is_success(&self) -> bool {
        RequestMetric::is_success(self.status, self.error.as_ref())
    }
}

/// Sends requests on behalf of setup and virtual users.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Send one request.
    async fn send(&self, request: HttpRequest) -> HttpResponse;

    /// Send many requests in parallel, returning once all of them completed.
    ///
    /// Responses are returned in request order.
    async fn batch(&self, requests: Vec<HttpRequest>) -> Vec<HttpResponse> {
        stream::iter(requests)
            .map(|request| self.send(request))
            .buffered(DEFAULT_BATCH)
            .collect()
            .await
    }
}

/// A reqwest-backed [`HttpClient`].
pub struct LoadTestClient {
    client: reqwest::Client,
    /// Maximum requests of a batch in flight at the same time.
    batch: usize,
    /// Request times are relative to when the client was created.
    started: time::Instant,
    metrics: Option<flume::Sender<LoadTestMetric>>,
    logger: Option<flume::Sender<Option<RequestMetric>>>,
}
impl LoadTestClient {
    pub fn new(configuration: &LoadTestConfiguration) -> Result<Self, LoadTestError> {
        let client = reqwest::Client::builder()
            .user_agent(APP_USER_AGENT)
            .timeout(configuration.request_timeout())
            .build()?;
        Ok(LoadTestClient {
            client,
            batch: configuration.batch(),
            started: time::Instant::now(),
            metrics: None,
            logger: None,
        })
    }

    /// Send a [`RequestMetric`] for every request to the metrics aggregator.
    pub fn set_metrics(mut self, metrics: flume::Sender<LoadTestMetric>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Send a [`RequestMetric`] for every request to the request logger.
    pub fn set_logger(mut self, logger: Option<flume::Sender<Option<RequestMetric>>>) -> Self {
        self.logger = logger;
        self
    }

    fn record(&self, request: &HttpRequest, response: &HttpResponse, elapsed: u64) {
        // Failures without a transport error are described by the status code.
        let error = match response.error.as_ref() {
            Some(e) => e.to_string(),
            None if !response.is_success() => match StatusCode::from_u16(response.status) {
                Ok(status) => status.to_string(),
                Err(_) => response.status.to_string(),
            },
            None => "".to_string(),
        };
        let metric = RequestMetric {
            elapsed,
            method: request.method.to_string(),
            name: request.name.to_string(),
            url: request.url.to_string(),
            status_code: response.status,
            response_time: response.response_time,
            success: response.is_success(),
            error,
            user: request.user,
        };
        if let Some(logger) = self.logger.as_ref() {
            if let Err(e) = logger.send(Some(metric.clone())) {
                debug!("failed to send request to logger: {}", e);
            }
        }
        if let Some(metrics) = self.metrics.as_ref() {
            if let Err(e) = metrics.send(LoadTestMetric::Request(metric)) {
                debug!("failed to send request metric: {}", e);
            }
        }
    }
}

#[async_trait]
impl HttpClient for LoadTestClient {
    async fn send(&self, request: HttpRequest) -> HttpResponse {
        let elapsed = self.started.elapsed().as_millis() as u64;

        let mut request_builder = self.client.request(request.method.clone(), &request.url);
        for (name, value) in &request.headers {
            request_builder = request_builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body.as_ref() {
            if !request.has_header(CONTENT_TYPE.as_str()) {
                request_builder = request_builder.header(CONTENT_TYPE, "application/json");
            }
            request_builder = request_builder.body(body.to_string());
        }

        let started = time::Instant::now();
        let mut response = HttpResponse {
            url: request.url.to_string(),
            ..Default::default()
        };
        match request_builder.send().await {
            Ok(r) => {
                response.status = r.status().as_u16();
                match r.text().await {
                    Ok(body) => response.body = body,
                    Err(e) => {
                        warn!("{}: failed to read response body: {}", request.url, e);
                        response.error = Some(e.to_string());
                    }
                }
            }
            Err(e) => {
                debug!("{} {}: {}", request.method, request.url, e);
                response.status = e.status().map(|s| s.as_u16()).unwrap_or(0);
                response.error = Some(e.to_string());
            }
        }
        response.response_time = started.elapsed().as_millis() as u64;

        self.record(&request, &response, elapsed);
        response
    }

    async fn batch(&self, requests: Vec<HttpRequest>) -> Vec<HttpResponse> {
        debug!(
            "sending batch of {} requests, {} at a time",
            requests.len(),
            self.batch
        );
        stream::iter(requests)
            .map(|request| self.send(request))
            .buffered(self.batch)
            .collect()
            .await
    }
}
