use async_trait::async_trait;
use gumdrop::Options;
use httpmock::MockServer;
use std::sync::Mutex;

use flash_sale_loadtest::prelude::*;

/// Not all functions are used by all tests, so we enable allow(dead_code) to avoid
/// compiler warnings during testing.

/// The following options are configured by default, if not set to a custom value:
///  --base-url <mock-server>
///  --rate 10
///  --duration 1
///  --users 5
///  --graceful-stop 5
///  --no-print-metrics
#[allow(dead_code)]
pub fn build_configuration(server: &MockServer, custom: Vec<&str>) -> LoadTestConfiguration {
    // Start with an empty configuration.
    let mut configuration: Vec<&str> = vec![];
    // Declare server_url here no matter what, so its lifetime is sufficient when needed.
    let server_url = server.base_url();

    // Merge in all custom options first.
    configuration.extend_from_slice(&custom);

    // Default to using mock server if not otherwise configured.
    if !configuration.contains(&"--base-url") {
        configuration.extend_from_slice(&["--base-url", &server_url]);
    }

    // Default to starting 10 iterations per second if not otherwise configured.
    if !configuration.contains(&"--rate") {
        configuration.extend_from_slice(&["--rate", "10"]);
    }

    // Default to running for 1 second if not otherwise configured.
    if !configuration.contains(&"--duration") {
        configuration.extend_from_slice(&["--duration", "1"]);
    }

    // Default to logging in 5 users if not otherwise configured.
    if !configuration.contains(&"--users") {
        configuration.extend_from_slice(&["--users", "5"]);
    }

    if !configuration.contains(&"--graceful-stop") {
        configuration.extend_from_slice(&["--graceful-stop", "5"]);
    }

    configuration.push("--no-print-metrics");

    // Parse these options to generate a LoadTestConfiguration.
    LoadTestConfiguration::parse_args_default(&configuration)
        .expect("failed to parse options and generate a configuration")
}

/// Run the flash-sale scenario against the configuration.
#[allow(dead_code)]
pub async fn run_load_test(
    configuration: LoadTestConfiguration,
) -> Result<LoadTestMetrics, LoadTestError> {
    let load_test = LoadTest::initialize_with_config(configuration)?;
    let scenario = FlashSaleScenario::new(load_test.configuration());
    load_test.execute(scenario).await
}

/// An [`HttpClient`] that answers every request with a closure and remembers every
/// request it was sent.
#[allow(dead_code)]
pub struct ScriptedClient<F>
where
    F: Fn(&HttpRequest) -> HttpResponse + Send + Sync,
{
    respond: F,
    pub requests: Mutex<Vec<HttpRequest>>,
}

#[allow(dead_code)]
impl<F> ScriptedClient<F>
where
    F: Fn(&HttpRequest) -> HttpResponse + Send + Sync,
{
    pub fn new(respond: F) -> Self {
        ScriptedClient {
            respond,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Requests sent to urls ending with the path.
    pub fn requests_to(&self, path: &str) -> Vec<HttpRequest> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.url.ends_with(path))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl<F> HttpClient for ScriptedClient<F>
where
    F: Fn(&HttpRequest) -> HttpResponse + Send + Sync,
{
    async fn send(&self, request: HttpRequest) -> HttpResponse {
        let response = (self.respond)(&request);
        self.requests.lock().unwrap().push(request);
        response
    }
}

/// Build a response.
#[allow(dead_code)]
pub fn response(status: u16, body: &str) -> HttpResponse {
    HttpResponse {
        status,
        body: body.to_string(),
        ..Default::default()
    }
}

/// Helper to count the number of lines in a test artifact.
#[allow(dead_code)]
pub fn file_length(file_name: &str) -> usize {
    match std::fs::read_to_string(file_name) {
        Ok(contents) => contents.lines().count(),
        Err(_) => 0,
    }
}
