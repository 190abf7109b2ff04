use serde_json::{json, Value};
use std::sync::Arc;

mod common;

use common::{response, ScriptedClient};
use flash_sale_loadtest::metrics::LoadTestMetric;
use flash_sale_loadtest::prelude::*;

const ITEMS_PATH: &str = "/api/v1/flash-sale/items";
const LOGIN_PATH: &str = "/api/v1/auth/login";
const PURCHASE_PATH: &str = "/api/v1/flash-sale/purchase";

fn scenario(users: usize) -> FlashSaleScenario {
    let configuration = LoadTestConfiguration {
        base_url: "http://localhost:8080".to_string(),
        password: "1234aabb".to_string(),
        users: Some(users),
        ..Default::default()
    };
    FlashSaleScenario::new(&configuration)
}

/// The user number of a login request, for example `7` for `test7@testmail.com`.
fn login_user(request: &HttpRequest) -> usize {
    let body: Value = serde_json::from_str(request.body.as_deref().unwrap_or("{}")).unwrap();
    body["identifier"]
        .as_str()
        .unwrap()
        .trim_start_matches("test")
        .trim_end_matches("@testmail.com")
        .parse()
        .unwrap()
}

fn bearer(request: &HttpRequest) -> String {
    request
        .headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("authorization"))
        .map(|(_, value)| value.trim_start_matches("Bearer ").to_string())
        .unwrap()
}

fn purchased(request: &HttpRequest) -> String {
    let body: Value = serde_json::from_str(request.body.as_deref().unwrap()).unwrap();
    body["flashSaleProductId"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn setup_one_item_all_logins() {
    let client = ScriptedClient::new(|request| {
        if request.url.ends_with(ITEMS_PATH) {
            response(200, r#"{"data":[{"flashSaleProductId":"P1"}]}"#)
        } else {
            let token = format!("jwt-{}", login_user(request));
            response(200, &json!({"data": {"token": token}}).to_string())
        }
    });

    let context = scenario(500).setup(&client).await.unwrap();
    assert_eq!(context.product_ids, vec!["P1"]);
    assert_eq!(context.tokens.len(), 500);
    // Tokens are collected in user order.
    assert_eq!(context.tokens[0], "jwt-1");
    assert_eq!(context.tokens[499], "jwt-500");

    let logins = client.requests_to(LOGIN_PATH);
    assert_eq!(logins.len(), 500);
    let mut users: Vec<usize> = logins.iter().map(login_user).collect();
    users.sort_unstable();
    assert_eq!(users, (1..=500).collect::<Vec<usize>>());
    for login in &logins {
        let body: Value = serde_json::from_str(login.body.as_deref().unwrap()).unwrap();
        assert_eq!(body["password"], "1234aabb");
    }
}

#[tokio::test]
async fn setup_without_items() {
    let client = ScriptedClient::new(|_| response(200, r#"{"data":[]}"#));
    match scenario(500).setup(&client).await {
        Err(LoadTestError::NoFlashSaleItems) => (),
        other => panic!("unexpected setup result: {:?}", other.map(|_| ())),
    }
    // Setup aborted before logging in.
    assert!(client.requests_to(LOGIN_PATH).is_empty());

    let client = ScriptedClient::new(|_| response(200, r#"{"data":null}"#));
    assert!(scenario(500).setup(&client).await.is_err());
}

#[tokio::test]
async fn setup_items_not_json() {
    let client = ScriptedClient::new(|_| response(500, "Internal Server Error"));
    match scenario(5).setup(&client).await {
        Err(LoadTestError::InvalidResponse { .. }) => (),
        other => panic!("unexpected setup result: {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn setup_some_logins_fail() {
    let client = ScriptedClient::new(|request| {
        if request.url.ends_with(ITEMS_PATH) {
            return response(
                200,
                r#"{"data":[{"flashSaleProductId":"P1"},{"flashSaleProductId":"P2"}]}"#,
            );
        }
        // Every 50th user fails to log in.
        let user = login_user(request);
        if user % 50 == 0 {
            response(500, "Internal Server Error")
        } else {
            response(200, &json!({"data": {"token": format!("jwt-{}", user)}}).to_string())
        }
    });

    let context = scenario(500).setup(&client).await.unwrap();
    assert_eq!(context.product_ids, vec!["P1", "P2"]);
    assert_eq!(context.tokens.len(), 490);
    assert!(!context.tokens.contains(&"jwt-50".to_string()));
}

#[tokio::test]
async fn setup_no_logins() {
    let client = ScriptedClient::new(|request| {
        if request.url.ends_with(ITEMS_PATH) {
            response(200, r#"{"data":[{"flashSaleProductId":"P1"}]}"#)
        } else {
            response(401, r#"{"error":"invalid credentials"}"#)
        }
    });
    match scenario(20).setup(&client).await {
        Err(e @ LoadTestError::NoTokens { .. }) => {
            assert_eq!(
                e.to_string(),
                "LoadTestError: Cannot get any jwt! (20 logins attempted)"
            );
        }
        other => panic!("unexpected setup result: {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn iterations_pick_from_context() {
    let client = Arc::new(ScriptedClient::new(|_| {
        response(200, r#"{"data":{"orderNo":"ORD-1"}}"#)
    }));
    let (tx, rx) = flume::unbounded();
    let user = VirtualUser::new(1, client.clone(), Some(tx));
    let context = TestContext {
        product_ids: vec!["P1".to_string(), "P2".to_string(), "P3".to_string()],
        tokens: vec!["t1".to_string(), "t2".to_string()],
    };

    let scenario = scenario(2);
    for _ in 0..50 {
        scenario.iteration(&context, &user).await.unwrap();
    }

    let purchases = client.requests_to(PURCHASE_PATH);
    assert_eq!(purchases.len(), 50);
    for purchase in &purchases {
        assert!(context.product_ids.contains(&purchased(purchase)));
        assert!(context.tokens.contains(&bearer(purchase)));
    }

    let checks: Vec<bool> = rx
        .drain()
        .filter_map(|m| match m {
            LoadTestMetric::Check(check) => Some(check.passed),
            _ => None,
        })
        .collect();
    assert_eq!(checks.len(), 50);
    assert!(checks.iter().all(|passed| *passed));
}

#[tokio::test]
async fn iteration_sold_out() {
    let client = Arc::new(ScriptedClient::new(|_| {
        response(503, r#"{"error":"sold out"}"#)
    }));
    let (tx, rx) = flume::unbounded();
    let user = VirtualUser::new(4, client.clone(), Some(tx));
    let context = TestContext {
        product_ids: vec!["P1".to_string()],
        tokens: vec!["t1".to_string()],
    };

    // A failed check doesn't fail the iteration.
    scenario(1).iteration(&context, &user).await.unwrap();

    // No retry.
    let purchases = client.requests_to(PURCHASE_PATH);
    assert_eq!(purchases.len(), 1);
    assert_eq!(purchased(&purchases[0]), "P1");
    assert_eq!(bearer(&purchases[0]), "t1");

    let metrics: Vec<LoadTestMetric> = rx.drain().collect();
    assert_eq!(metrics.len(), 1);
    match &metrics[0] {
        LoadTestMetric::Check(check) => {
            assert_eq!(check.name, "status is 200");
            assert!(!check.passed);
        }
        other => panic!("unexpected metric: {:?}", other),
    }
}

#[tokio::test]
async fn iteration_transport_failure() {
    let client = Arc::new(ScriptedClient::new(|request| HttpResponse {
        url: request.url.to_string(),
        status: 0,
        error: Some("connection refused".to_string()),
        ..Default::default()
    }));
    let user = VirtualUser::new(1, client, None);
    let context = TestContext {
        product_ids: vec!["P1".to_string()],
        tokens: vec!["t1".to_string()],
    };
    match scenario(1).iteration(&context, &user).await {
        Err(IterationError::Request { detail, .. }) => assert_eq!(detail, "connection refused"),
        other => panic!("unexpected iteration result: {:?}", other),
    }
}
