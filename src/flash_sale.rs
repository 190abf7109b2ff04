//! The flash-sale purchase scenario.
//!
//! Setup fetches the active flash-sale items and logs in the pool of synthetic users
//! `test1@testmail.com` .. `test{users}@testmail.com`. Every iteration then buys a
//! random item with a random token:
//!
//! ```text
//! GET  /api/v1/flash-sale/items     -> {"data":[{"flashSaleProductId":"P1"}, ...]}
//! POST /api/v1/auth/login           {"identifier":"test1@testmail.com","password":"..."}
//!                                   -> {"data":{"token":"..."}}
//! POST /api/v1/flash-sale/purchase  {"flashSaleProductId":"P1"}, Authorization: Bearer ...
//!                                   -> {"data":{"orderNo":"..."}}
//! ```
//!
//! Token and item are picked independently, so a user may be asked to buy any item.

use async_trait::async_trait;
use rand::seq::IndexedRandom;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::client::{HttpClient, HttpRequest, HttpResponse};
use crate::config::LoadTestConfiguration;
use crate::scenario::{IterationError, IterationResult, Scenario, VirtualUser};
use crate::util;
use crate::LoadTestError;

pub const ITEMS_PATH: &str = "/api/v1/flash-sale/items";
pub const LOGIN_PATH: &str = "/api/v1/auth/login";
pub const PURCHASE_PATH: &str = "/api/v1/flash-sale/purchase";

/// Name of the check recorded for every purchase.
pub const PURCHASE_CHECK: &str = "status is 200";

/// Successful purchases are logged once every this many iterations of a virtual user.
pub const SAMPLE_EVERY: usize = 100;

/// An active flash-sale item, other fields are ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlashSaleItem {
    pub flash_sale_product_id: String,
}

#[derive(Debug, Deserialize)]
struct ItemsResponse {
    data: Option<Vec<FlashSaleItem>>,
}

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    identifier: String,
    password: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PurchaseRequest<'a> {
    flash_sale_product_id: &'a str,
}

/// Prepared by setup, shared read-only by every iteration.
#[derive(Debug, Clone, Default)]
pub struct TestContext {
    pub product_ids: Vec<String>,
    pub tokens: Vec<String>,
}

/// Buys random flash-sale items as random users.
#[derive(Debug, Clone)]
pub struct FlashSaleScenario {
    base_url: String,
    password: String,
    /// How many synthetic users log in during setup.
    users: usize,
}
impl FlashSaleScenario {
    pub fn new(configuration: &LoadTestConfiguration) -> Self {
        FlashSaleScenario {
            base_url: configuration.base_url.to_string(),
            password: configuration.password.to_string(),
            users: configuration.users(),
        }
    }

    fn url(&self, path: &str) -> String {
        util::build_url(&self.base_url, path)
    }

    /// One login request for each synthetic user.
    fn login_requests(&self) -> Result<Vec<HttpRequest>, LoadTestError> {
        let url = self.url(LOGIN_PATH);
        (1..=self.users)
            .map(|i| -> Result<HttpRequest, LoadTestError> {
                let body = LoginRequest {
                    identifier: format!("test{}@testmail.com", i),
                    password: &self.password,
                };
                Ok(HttpRequest::post(&url).set_json(&body)?)
            })
            .collect()
    }
}

/// Extract product ids from the items response, preserving order.
pub fn extract_product_ids(response: &HttpResponse) -> Result<Vec<String>, LoadTestError> {
    let items: ItemsResponse =
        response
            .json()
            .map_err(|e| LoadTestError::InvalidResponse {
                url: response.url.to_string(),
                detail: format!("status {}: {}", response.status, e),
            })?;
    match items.data {
        Some(items) if !items.is_empty() => Ok(items
            .into_iter()
            .map(|item| item.flash_sale_product_id)
            .collect()),
        _ => Err(LoadTestError::NoFlashSaleItems),
    }
}

/// Collect the token of every successful login, in user order.
///
/// Only a `200` response with a string `data.token` counts as a successful login.
pub fn collect_tokens(responses: &[HttpResponse]) -> Vec<String> {
    let mut tokens = Vec::with_capacity(responses.len());
    for (index, response) in responses.iter().enumerate() {
        if response.status != 200 {
            warn!(
                "[setup] Login failed for user test{}: {}",
                index + 1,
                response.status
            );
            continue;
        }
        match response.json_path("data.token") {
            Some(Value::String(token)) => tokens.push(token),
            _ => warn!(
                "[setup] Login failed for user test{}: {} without data.token",
                index + 1,
                response.status
            ),
        }
    }
    tokens
}

/// Failed purchases are always logged, successful ones once every [`SAMPLE_EVERY`]
/// iterations of a virtual user.
pub fn should_log(passed: bool, iteration: usize) -> bool {
    !passed || iteration % SAMPLE_EVERY == 0
}

/// The line logged for a purchase.
pub fn purchase_log_line(
    user: usize,
    product_id: &str,
    passed: bool,
    response: &HttpResponse,
) -> String {
    if passed {
        // A body that isn't JSON, or has no order number, logs `null`.
        let order_no = match response.json_path("data.orderNo") {
            Some(Value::String(order_no)) => order_no,
            Some(Value::Null) | None => "null".to_string(),
            Some(other) => other.to_string(),
        };
        format!(
            "[VU {}] fspId={} status={} orderNo={}",
            user, product_id, response.status, order_no
        )
    } else {
        format!(
            "[VU {}] fspId={} status={} body={}",
            user, product_id, response.status, response.body
        )
    }
}

#[async_trait]
impl Scenario for FlashSaleScenario {
    type Context = TestContext;

    fn name(&self) -> &str {
        "flash sale purchase"
    }

    async fn setup(&self, client: &dyn HttpClient) -> Result<TestContext, LoadTestError> {
        info!("[setup] Loading flash sale items...");
        let response = client.send(HttpRequest::get(&self.url(ITEMS_PATH))).await;
        if let Some(error) = response.error.as_ref() {
            return Err(LoadTestError::InvalidResponse {
                url: response.url.to_string(),
                detail: error.to_string(),
            });
        }
        let product_ids = extract_product_ids(&response)?;
        info!(
            "[setup] Loaded {} FlashSaleProductIds: {}",
            product_ids.len(),
            product_ids.join(", ")
        );

        info!("[setup] Logging in {} users...", self.users);
        let responses = client.batch(self.login_requests()?).await;
        let tokens = collect_tokens(&responses);
        if tokens.is_empty() {
            return Err(LoadTestError::NoTokens {
                attempted: responses.len(),
            });
        }
        info!(
            "[setup] Completed! Preparing {} Tokens & {} Items.",
            tokens.len(),
            product_ids.len()
        );

        Ok(TestContext {
            product_ids,
            tokens,
        })
    }

    async fn iteration(&self, context: &TestContext, user: &VirtualUser) -> IterationResult {
        // The thread-local rng must not be held across an await.
        let (token, product_id) = {
            let mut rng = rand::rng();
            match (
                context.tokens.choose(&mut rng),
                context.product_ids.choose(&mut rng),
            ) {
                (Some(token), Some(product_id)) => (token.to_string(), product_id.to_string()),
                _ => {
                    return Err(IterationError::InvalidResponse {
                        url: self.url(PURCHASE_PATH),
                        detail: "no tokens or product ids to purchase with".to_string(),
                    })
                }
            }
        };

        let body = PurchaseRequest {
            flash_sale_product_id: &product_id,
        };
        let request = HttpRequest::post(&self.url(PURCHASE_PATH))
            .set_json(&body)
            .map_err(|e| IterationError::Request {
                url: self.url(PURCHASE_PATH),
                detail: e.to_string(),
            })?
            .bearer(&token);
        let response = user.send(request).await;

        let passed = user.check(PURCHASE_CHECK, response.status == 200);
        if should_log(passed, user.iteration) {
            let line = purchase_log_line(user.id, &product_id, passed, &response);
            if passed {
                info!("{}", line);
            } else {
                warn!("{}", line);
            }
        }

        match response.error {
            Some(detail) => Err(IterationError::Request {
                url: response.url,
                detail,
            }),
            None => Ok(()),
        }
    }
}
