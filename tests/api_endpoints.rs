//! Integration tests for the CashHandle API
//!
//! Each test drives the router through axum-test with an in-memory database and
//! the development identity provider, logging users in through the real callback.

use axum::http::{header, HeaderName, HeaderValue, StatusCode};
use axum_test::{TestResponse, TestServer};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use cashhandle::api::{build_api_router, AppState};
use cashhandle::bsv::BsvWallet;
use cashhandle::config::Config;
use cashhandle::handcash::{DevIdentityProvider, IdentityProvider};
use cashhandle::persistence::Database;
use cashhandle::session::SESSION_COOKIE;

struct Harness {
    server: TestServer,
    identity: Arc<DevIdentityProvider>,
    state: Arc<AppState>,
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.session.secret = "integration-test-session-secret".to_string();
    config.divvy.batch_size = 2;
    config.divvy.batch_delay = Duration::ZERO;
    config
}

fn harness_with(config: Config) -> Harness {
    let db = Arc::new(Database::open_in_memory().expect("Failed to open database"));
    let identity = Arc::new(DevIdentityProvider::new());
    let provider: Arc<dyn IdentityProvider> = identity.clone();
    let wallet = Arc::new(BsvWallet::from_config(&config.bsv));

    let state = Arc::new(AppState::new(&config, db, provider, wallet).expect("Failed to build state"));
    let server = TestServer::new(build_api_router(state.clone())).expect("Failed to create test server");
    Harness {
        server,
        identity,
        state,
    }
}

fn harness() -> Harness {
    harness_with(test_config())
}

fn cookie(value: &str) -> HeaderValue {
    HeaderValue::from_str(value).unwrap()
}

/// Log in through the callback and return the `Cookie` header value.
async fn login(server: &TestServer, handle: &str) -> String {
    let response = server
        .get(&format!("/api/auth/handcash/callback?authToken=dev:{}", handle))
        .await;
    assert_eq!(response.status_code(), StatusCode::TEMPORARY_REDIRECT);
    assert_eq!(location(&response), "/dashboard");

    let set_cookie = response
        .headers()
        .get(header::SET_COOKIE)
        .expect("session cookie")
        .to_str()
        .unwrap()
        .to_string();
    assert!(set_cookie.contains("HttpOnly"));
    set_cookie.split(';').next().unwrap().to_string()
}

fn location(response: &TestResponse) -> String {
    response
        .headers()
        .get(header::LOCATION)
        .expect("redirect location")
        .to_str()
        .unwrap()
        .to_string()
}

async fn create_token(server: &TestServer, session: &str, handle: &str) -> Value {
    let response = server
        .post("/api/tokens/create")
        .add_header(header::COOKIE, cookie(session))
        .json(&json!({ "handcashHandle": handle }))
        .await;
    assert_eq!(response.status_code(), 200, "{}", response.text());
    response.json()
}

#[tokio::test]
async fn test_health_and_stats() {
    let h = harness();

    let response = h.server.get("/api/health").await;
    assert_eq!(response.status_code(), 200);
    let json: Value = response.json();
    assert_eq!(json["status"], "healthy");
    assert!(json["timestamp"].is_string());

    let response = h.server.get("/api/stats").await;
    assert_eq!(response.status_code(), 200);
    let json: Value = response.json();
    assert!(json["totalRequests"].as_u64().unwrap() >= 1);
    assert_eq!(json["tokensCreated"], 0);
    assert!(json["uptimeSeconds"].is_number());
}

#[tokio::test]
async fn test_login_flow() {
    let h = harness();

    let response = h.server.get("/api/auth/handcash/login").await;
    assert_eq!(response.status_code(), StatusCode::TEMPORARY_REDIRECT);
    assert!(location(&response).starts_with("/api/auth/handcash/callback?authToken=mock-token"));

    let response = h.server.get("/api/auth/handcash/callback").await;
    assert_eq!(location(&response), "/?error=no-auth-token");

    let response = h
        .server
        .get("/api/auth/handcash/callback?authToken=garbage")
        .await;
    assert_eq!(location(&response), "/?error=auth-failed");

    let response = h.server.get("/api/auth/user").await;
    assert_eq!(response.status_code(), 401);
    let json: Value = response.json();
    assert_eq!(json["error"], "Not authenticated");

    let session = login(&h.server, "@alice").await;
    let response = h
        .server
        .get("/api/auth/user")
        .add_header(header::COOKIE, cookie(&session))
        .await;
    assert_eq!(response.status_code(), 200);
    let json: Value = response.json();
    assert_eq!(json["handcashHandle"], "@alice");
    assert!(json["id"].is_string());
    assert!(json["createdAt"].is_string());
    assert!(json.get("authToken").is_none());

    // A forged cookie is ignored.
    let forged = format!("{}0", session);
    let response = h
        .server
        .get("/api/auth/user")
        .add_header(header::COOKIE, cookie(&forged))
        .await;
    assert_eq!(response.status_code(), 401);

    let response = h
        .server
        .get("/api/wallet/balance")
        .add_header(header::COOKIE, cookie(&session))
        .await;
    assert_eq!(response.status_code(), 200);
    let json: Value = response.json();
    assert_eq!(json["currencyCode"], "USD");

    let response = h.server.post("/api/auth/logout").await;
    assert_eq!(response.status_code(), 200);
    let cleared = response.headers().get(header::SET_COOKIE).unwrap();
    assert!(cleared.to_str().unwrap().contains("Max-Age=0"));
}

#[tokio::test]
async fn test_token_creation_and_lookup() {
    let h = harness();
    let alice = login(&h.server, "@alice").await;

    let response = h
        .server
        .post("/api/tokens/create")
        .json(&json!({ "handcashHandle": "@alice" }))
        .await;
    assert_eq!(response.status_code(), 401);

    let response = h
        .server
        .post("/api/tokens/create")
        .add_header(header::COOKIE, cookie(&alice))
        .json(&json!({}))
        .await;
    assert_eq!(response.status_code(), 400);
    let json: Value = response.json();
    assert_eq!(json["error"], "HandCash handle is required");

    let response = h
        .server
        .post("/api/tokens/create")
        .add_header(header::COOKIE, cookie(&alice))
        .json(&json!({ "handcashHandle": "@bob" }))
        .await;
    assert_eq!(response.status_code(), 403);

    let token = create_token(&h.server, &alice, "@alice").await;
    assert_eq!(token["symbol"], "$alice");
    assert_eq!(token["totalSupply"], "1000000000");
    assert_eq!(token["holders"], 1);
    assert_eq!(token["price"].as_f64().unwrap(), 0.000001);
    assert!((token["marketCap"].as_f64().unwrap() - 1000.0).abs() < 1e-6);

    let response = h
        .server
        .post("/api/tokens/create")
        .add_header(header::COOKIE, cookie(&alice))
        .json(&json!({ "handcashHandle": "@alice" }))
        .await;
    assert_eq!(response.status_code(), 409);
    let json: Value = response.json();
    assert_eq!(json["error"], "Token already exists for this handle");

    let response = h.server.get("/api/tokens/user/%40alice").await;
    assert_eq!(response.status_code(), 200);
    let json: Value = response.json();
    assert_eq!(json["id"], token["id"]);
    assert_eq!(json["owner"]["handcashHandle"], "@alice");
    assert_eq!(json["description"], "Token representing @alice HandCash handle");
    assert_eq!(json["tokenType"], "STANDARD");

    let response = h.server.get("/api/tokens/user/%40nobody").await;
    assert_eq!(response.status_code(), 404);

    let response = h.server.get("/api/tokens/rankings").await;
    assert_eq!(response.status_code(), 200);
    let json: Value = response.json();
    assert_eq!(json.as_array().unwrap().len(), 1);
    assert_eq!(json[0]["volume24h"], 0);

    let response = h.server.get("/api/stats").await;
    let json: Value = response.json();
    assert_eq!(json["tokensCreated"], 1);
}

#[tokio::test]
async fn test_ordinal_token_records_mint() {
    let h = harness();
    let bob = login(&h.server, "@bob").await;

    let response = h
        .server
        .post("/api/tokens/create")
        .add_header(header::COOKIE, cookie(&bob))
        .json(&json!({ "handcashHandle": "@bob", "tokenType": "ordinal" }))
        .await;
    assert_eq!(response.status_code(), 200);
    let json: Value = response.json();
    assert_eq!(json["tokenType"], "ORDINAL");
    let inscription = json["inscriptionId"].as_str().unwrap();
    assert!(inscription.starts_with("ord_"));

    let token_id = json["id"].as_str().unwrap();
    let records = h.state.db.chain_transactions_for_token(token_id).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].tx_id, format!("mint_{}", inscription));

    // Ordinal transfers to an address go through the chain wallet.
    let response = h
        .server
        .post("/api/tokens/transfer")
        .add_header(header::COOKIE, cookie(&bob))
        .json(&json!({ "tokenId": token_id, "amount": "1000", "toAddress": "1BitcoinEaterAddressDontSendf59kuE" }))
        .await;
    assert_eq!(response.status_code(), 200);
    let json: Value = response.json();
    assert_eq!(json["transferTxId"].as_str().unwrap().len(), 64);
    assert_eq!(json["amount"], "1000");
}

#[tokio::test]
async fn test_transfer_and_marketplace() {
    let h = harness();
    let alice = login(&h.server, "@alice").await;
    let bob = login(&h.server, "@bob").await;
    let carol = login(&h.server, "@carol").await;
    let token = create_token(&h.server, &alice, "@alice").await;
    let token_id = token["id"].as_str().unwrap();

    let response = h
        .server
        .post("/api/tokens/transfer")
        .add_header(header::COOKIE, cookie(&alice))
        .json(&json!({ "tokenId": token_id, "amount": 300000 }))
        .await;
    assert_eq!(response.status_code(), 400);
    let json: Value = response.json();
    assert_eq!(json["error"], "tokenId, amount, and a recipient are required");

    let response = h
        .server
        .post("/api/tokens/transfer")
        .add_header(header::COOKIE, cookie(&alice))
        .json(&json!({ "tokenId": token_id, "amount": 1, "toHandle": "@alice" }))
        .await;
    assert_eq!(response.status_code(), 400);

    let response = h
        .server
        .post("/api/tokens/transfer")
        .add_header(header::COOKIE, cookie(&alice))
        .json(&json!({ "tokenId": token_id, "amount": 5, "toHandle": "@ghost" }))
        .await;
    assert_eq!(response.status_code(), 404);

    let response = h
        .server
        .post("/api/tokens/transfer")
        .add_header(header::COOKIE, cookie(&alice))
        .json(&json!({ "tokenId": token_id, "amount": "300000", "toHandle": "@bob" }))
        .await;
    assert_eq!(response.status_code(), 200, "{}", response.text());
    let json: Value = response.json();
    assert_eq!(json["success"], true);
    assert_eq!(json["tokenSymbol"], "$alice");
    assert!(json["transferTxId"].is_null());

    let response = h.server.get("/api/tokens/user/%40alice").await;
    let json: Value = response.json();
    assert_eq!(json["holders"], 2);

    // Below the tranche.
    let response = h
        .server
        .post("/api/marketplace/orders")
        .add_header(header::COOKIE, cookie(&bob))
        .json(&json!({ "tokenSymbol": "$alice", "amount": 199999, "pricePerToken": 0.00001 }))
        .await;
    assert_eq!(response.status_code(), 400);
    let json: Value = response.json();
    assert_eq!(json["error"], "Minimum sell amount is 200,000 tokens");

    // More than bob holds.
    let response = h
        .server
        .post("/api/marketplace/orders")
        .add_header(header::COOKIE, cookie(&bob))
        .json(&json!({ "tokenSymbol": "$alice", "amount": 400000, "pricePerToken": 0.00001 }))
        .await;
    assert_eq!(response.status_code(), 400);
    let json: Value = response.json();
    assert_eq!(json["error"], "Insufficient token balance");

    let response = h
        .server
        .post("/api/marketplace/orders")
        .add_header(header::COOKIE, cookie(&bob))
        .json(&json!({ "tokenSymbol": "$alice", "amount": 250000, "pricePerToken": 0.00002 }))
        .await;
    assert_eq!(response.status_code(), 200, "{}", response.text());
    let order: Value = response.json();
    assert_eq!(order["status"], "ACTIVE");
    assert_eq!(order["totalValue"], 5);
    assert_eq!(order["seller"]["handcashHandle"], "@bob");
    assert_eq!(order["token"]["symbol"], "$alice");
    let order_id = order["id"].as_str().unwrap();

    // Listed tokens are no longer transferable.
    let response = h
        .server
        .post("/api/tokens/transfer")
        .add_header(header::COOKIE, cookie(&bob))
        .json(&json!({ "tokenId": token_id, "amount": 100000, "toHandle": "@carol" }))
        .await;
    assert_eq!(response.status_code(), 400);

    let response = h.server.get("/api/marketplace/orders").await;
    let json: Value = response.json();
    assert_eq!(json.as_array().unwrap().len(), 1);

    let buy_path = format!("/api/marketplace/orders/{}/buy", order_id);
    let response = h
        .server
        .post(&buy_path)
        .add_header(header::COOKIE, cookie(&bob))
        .await;
    assert_eq!(response.status_code(), 400);
    let json: Value = response.json();
    assert_eq!(json["error"], "Cannot buy your own tokens");

    let response = h
        .server
        .post(&buy_path)
        .add_header(header::COOKIE, cookie(&carol))
        .await;
    assert_eq!(response.status_code(), 200);
    let json: Value = response.json();
    assert_eq!(json["message"], "Purchase completed successfully");
    assert_eq!(json["orderId"], order_id);

    let response = h
        .server
        .post(&buy_path)
        .add_header(header::COOKIE, cookie(&carol))
        .await;
    assert_eq!(response.status_code(), 400);
    let json: Value = response.json();
    assert_eq!(json["error"], "Sell order is no longer active");

    let response = h
        .server
        .post("/api/marketplace/orders/missing/buy")
        .add_header(header::COOKIE, cookie(&carol))
        .await;
    assert_eq!(response.status_code(), 404);

    // The fill now prices the token.
    let response = h.server.get("/api/tokens/rankings").await;
    let json: Value = response.json();
    assert_eq!(json[0]["price"].as_f64().unwrap(), 0.00002);
    assert_eq!(json[0]["volume24h"], 5);
    assert_eq!(json[0]["holders"], 3);

    let response = h.server.get("/api/marketplace/orders").await;
    let json: Value = response.json();
    assert!(json.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_cancel_order() {
    let h = harness();
    let alice = login(&h.server, "@alice").await;
    let bob = login(&h.server, "@bob").await;
    create_token(&h.server, &alice, "@alice").await;

    let response = h
        .server
        .post("/api/marketplace/orders")
        .add_header(header::COOKIE, cookie(&alice))
        .json(&json!({ "tokenSymbol": "$alice", "amount": "200000", "pricePerToken": 0.001 }))
        .await;
    assert_eq!(response.status_code(), 200);
    let order: Value = response.json();
    let path = format!("/api/marketplace/orders/{}", order["id"].as_str().unwrap());

    let response = h
        .server
        .delete(&path)
        .add_header(header::COOKIE, cookie(&bob))
        .await;
    assert_eq!(response.status_code(), 403);

    let response = h
        .server
        .delete(&path)
        .add_header(header::COOKIE, cookie(&alice))
        .await;
    assert_eq!(response.status_code(), 200);
    let json: Value = response.json();
    assert_eq!(json["status"], "CANCELLED");

    let response = h
        .server
        .delete(&path)
        .add_header(header::COOKIE, cookie(&alice))
        .await;
    assert_eq!(response.status_code(), 400);
}

#[tokio::test]
async fn test_divvy_payment_and_distribution() {
    let h = harness();
    let alice = login(&h.server, "@alice").await;
    let bob = login(&h.server, "@bob").await;
    login(&h.server, "@carol").await;
    let token = create_token(&h.server, &alice, "@alice").await;
    let token_id = token["id"].as_str().unwrap();

    for (handle, amount) in [("@bob", 50_000u64), ("@carol", 250_000)] {
        let response = h
            .server
            .post("/api/tokens/transfer")
            .add_header(header::COOKIE, cookie(&alice))
            .json(&json!({ "tokenId": token_id, "amount": amount, "toHandle": handle }))
            .await;
        assert_eq!(response.status_code(), 200);
    }

    let response = h
        .server
        .post("/api/divvy/payments")
        .json(&json!({ "handcashHandle": "@alice", "amount": 1_000_000 }))
        .await;
    assert_eq!(response.status_code(), 400);
    let json: Value = response.json();
    assert_eq!(
        json["error"],
        "Missing required fields: handcashHandle, amount, currency, txId"
    );

    let response = h
        .server
        .post("/api/divvy/payments")
        .json(&json!({ "handcashHandle": "@nobody", "amount": 10, "currency": "BSV", "txId": "tx-0" }))
        .await;
    assert_eq!(response.status_code(), 404);

    let payment = json!({ "handcashHandle": "@alice", "amount": 1_000_000, "currency": "BSV", "txId": "tx-1" });
    let response = h.server.post("/api/divvy/payments").json(&payment).await;
    assert_eq!(response.status_code(), 200, "{}", response.text());
    let json: Value = response.json();
    assert_eq!(json["message"], "Payment processed successfully");
    // Bob's 50,000 tokens are under the threshold.
    assert_eq!(json["eligibleHolders"], 2);
    assert_eq!(json["totalDistributed"], 999_700 + 250);
    assert_eq!(json["remainingAmount"], 50);
    let payment_id = json["dividendPaymentId"].as_str().unwrap().to_string();

    let response = h.server.post("/api/divvy/payments").json(&payment).await;
    assert_eq!(response.status_code(), 409);

    let response = h.server.get("/api/divvy/distribute").await;
    let json: Value = response.json();
    assert_eq!(json["count"], 2);
    assert_eq!(json["pendingDistributions"].as_array().unwrap().len(), 2);
    assert_eq!(json["pendingDistributions"][0]["payment"]["id"], payment_id.as_str());

    let response = h
        .server
        .post("/api/divvy/distribute")
        .json(&json!({}))
        .await;
    assert_eq!(response.status_code(), 400);

    let response = h
        .server
        .post("/api/divvy/distribute")
        .json(&json!({ "paymentId": "missing" }))
        .await;
    assert_eq!(response.status_code(), 404);

    let response = h
        .server
        .post("/api/divvy/distribute")
        .json(&json!({ "paymentId": payment_id }))
        .await;
    assert_eq!(response.status_code(), 401);

    // A correctly signed session for a user that no longer exists.
    let stale = format!("{}={}", SESSION_COOKIE, h.state.sessions.sign("deleted-user"));
    let response = h
        .server
        .post("/api/divvy/distribute")
        .add_header(header::COOKIE, cookie(&stale))
        .json(&json!({ "paymentId": payment_id }))
        .await;
    assert_eq!(response.status_code(), 404);
    let json: Value = response.json();
    assert_eq!(json["error"], "User not found");

    let response = h
        .server
        .post("/api/divvy/distribute")
        .add_header(header::COOKIE, cookie(&bob))
        .json(&json!({ "paymentId": payment_id }))
        .await;
    assert_eq!(response.status_code(), 403);

    h.identity.fail_payments_to("@carol");
    let response = h
        .server
        .post("/api/divvy/distribute")
        .add_header(header::COOKIE, cookie(&alice))
        .json(&json!({ "paymentId": payment_id }))
        .await;
    assert_eq!(response.status_code(), 200, "{}", response.text());
    let json: Value = response.json();
    assert_eq!(json["message"], "Batch distribution completed");
    assert_eq!(json["processed"], 2);
    assert_eq!(json["successful"], 1);
    assert_eq!(json["failed"], 1);

    let paid = h.identity.payments();
    assert_eq!(paid.len(), 1);
    assert_eq!(paid[0].destination, "@alice");
    assert_eq!(paid[0].amount, 999_700);

    let response = h.server.get("/api/divvy/stats").await;
    let json: Value = response.json();
    assert_eq!(json["totalDividendsPaid"], 1_000_000);
    assert_eq!(json["activeTokens"], 1);
    assert_eq!(json["pendingDistributions"], 0);
    assert_eq!(json["totalHolders"], 3);

    let response = h.server.get("/api/divvy/payments").await;
    let json: Value = response.json();
    assert_eq!(json.as_array().unwrap().len(), 1);
    assert_eq!(json[0]["token"]["symbol"], "$alice");
    assert_eq!(json[0]["distributions"].as_array().unwrap().len(), 2);

    let response = h.server.get("/api/divvy/rankings").await;
    let json: Value = response.json();
    assert_eq!(json[0]["totalDividendsPaid"], 1_000_000);
    assert_eq!(json[0]["dividendPayments"], 1);

    // Earnings by session and by bearer token.
    let response = h
        .server
        .get("/api/divvy/earnings")
        .add_header(header::COOKIE, cookie(&alice))
        .await;
    let json: Value = response.json();
    assert_eq!(json["totalReceived"], 999_700);
    assert_eq!(json["totalTokens"], 1);

    let response = h
        .server
        .get("/api/divvy/earnings")
        .add_header(header::AUTHORIZATION, HeaderValue::from_static("Bearer dev:@carol"))
        .await;
    assert_eq!(response.status_code(), 200);
    let json: Value = response.json();
    assert_eq!(json["earnings"][0]["holdingAmount"], 250_000);
    assert_eq!(json["earnings"][0]["receivedEarnings"], 0);
    assert_eq!(json["earnings"][0]["pendingEarnings"], 0);

    let response = h.server.get("/api/divvy/earnings").await;
    assert_eq!(response.status_code(), 401);
}

#[tokio::test]
async fn test_amounts_beyond_integer_range_are_rejected() {
    let h = harness();
    let alice = login(&h.server, "@alice").await;
    create_token(&h.server, &alice, "@alice").await;

    let too_large = i64::MAX as u64 + 1;
    for tx_id in ["tx-huge-1", "tx-huge-2"] {
        let response = h
            .server
            .post("/api/divvy/payments")
            .json(&json!({ "handcashHandle": "@alice", "amount": too_large, "currency": "BSV", "txId": tx_id }))
            .await;
        assert_eq!(response.status_code(), 400);
        let json: Value = response.json();
        assert_eq!(json["error"], "Payment amount is too large");
    }

    let response = h
        .server
        .post("/api/marketplace/orders")
        .add_header(header::COOKIE, cookie(&alice))
        .json(&json!({ "tokenSymbol": "$alice", "amount": 1_000_000_000u64, "pricePerToken": 5e13 }))
        .await;
    assert_eq!(response.status_code(), 400);
    let json: Value = response.json();
    assert_eq!(json["error"], "Order value is too large");

    assert_eq!(h.server.get("/api/divvy/stats").await.status_code(), 200);
    assert_eq!(h.server.get("/api/divvy/rankings").await.status_code(), 200);
    assert_eq!(h.server.get("/api/tokens/rankings").await.status_code(), 200);
}

#[tokio::test]
async fn test_webhook_requires_secret() {
    let mut config = test_config();
    config.divvy.webhook_secret = Some("hook-secret".to_string());
    let h = harness_with(config);
    let secret_header = HeaderName::from_static("x-divvy-webhook-secret");
    let body = json!({ "handcashHandle": "@alice", "amount": 500, "currency": "BSV", "txId": "hook-1" });

    let response = h.server.post("/api/divvy/webhook").json(&body).await;
    assert_eq!(response.status_code(), 401);

    let response = h
        .server
        .post("/api/divvy/webhook")
        .add_header(secret_header.clone(), HeaderValue::from_static("wrong"))
        .json(&body)
        .await;
    assert_eq!(response.status_code(), 401);

    let response = h
        .server
        .post("/api/divvy/webhook")
        .add_header(secret_header.clone(), HeaderValue::from_static("hook-secret"))
        .json(&json!({ "handcashHandle": "@alice" }))
        .await;
    assert_eq!(response.status_code(), 400);

    let response = h
        .server
        .post("/api/divvy/webhook")
        .add_header(secret_header, HeaderValue::from_static("hook-secret"))
        .json(&body)
        .await;
    assert_eq!(response.status_code(), 202);
    let json: Value = response.json();
    assert_eq!(json["txId"], "hook-1");
    assert_eq!(h.state.webhook_queue.len(), 1);
}
