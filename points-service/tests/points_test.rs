mod common;

use axum::http::StatusCode;
use chrono::{Duration, Utc};
use common::{TestApp, TestClient, TestMember};
use serde_json::json;

fn bearer(token: &str) -> String {
    format!("Bearer {}", token)
}

async fn open_request(app: &TestApp, client: &TestClient, member: &TestMember, amount: &str) -> (String, String) {
    let res = app
        .post_json(
            "/points/redemption-request",
            json!({
                "client_id": client.client_id,
                "client_secret": client.secret,
                "member_id": member.member_id,
                "amount": amount,
                "description": "Lunch voucher",
            }),
            &[],
        )
        .await;
    assert_eq!(res.status, StatusCode::CREATED, "{}", res.body);
    (
        res.body["data"]["requestId"].as_str().unwrap().to_string(),
        res.body["data"]["otp"].as_str().unwrap().to_string(),
    )
}

async fn approve(app: &TestApp, member: &TestMember, request_id: &str, otp: &str) -> common::TestResponse {
    app.post_json(
        "/points/redemption/approve",
        json!({ "request_id": request_id, "otp": otp }),
        &[("x-session-id", member.session_id.as_str())],
    )
    .await
}

#[tokio::test]
async fn health_reports_service_identity() {
    let app = TestApp::spawn().await;

    let res = app.get("/health", &[]).await;

    assert_eq!(res.status, StatusCode::OK);
    assert_eq!(res.body["data"]["status"], "healthy");
    assert_eq!(res.body["data"]["service"], "points-service");
}

#[tokio::test]
async fn metrics_are_exposed_in_text_format() {
    let app = TestApp::spawn().await;
    app.get("/health", &[]).await;

    let res = app
        .send(
            axum::http::Request::builder()
                .uri("/metrics")
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await;

    assert_eq!(res.status, StatusCode::OK);
    assert!(res
        .headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .starts_with("text/plain"));
}

#[tokio::test]
async fn responses_carry_request_id_and_security_headers() {
    let app = TestApp::spawn().await;

    let res = app.get("/health", &[("x-request-id", "req-123")]).await;

    assert_eq!(
        res.headers.get("x-request-id").and_then(|v| v.to_str().ok()),
        Some("req-123")
    );
    assert!(res.headers.get("x-content-type-options").is_some());
}

#[tokio::test]
async fn instant_redeem_debits_the_balance() {
    let app = TestApp::spawn().await;
    let client = app.register_client().await;
    let member = app.register_member("jane@example.com").await;

    let res = app.credit(&client, member.member_id, "200").await;
    assert_eq!(res.status, StatusCode::OK, "{}", res.body);
    assert_eq!(res.body["data"]["newBalance"], "200");

    let (access, _) = app
        .issue_tokens(&client, &member, "points:redeem balance:read")
        .await;
    let res = app
        .post_json(
            "/points/redeem",
            json!({ "amount": "50", "description": "Large latte" }),
            &[("authorization", bearer(&access).as_str())],
        )
        .await;

    assert_eq!(res.status, StatusCode::OK, "{}", res.body);
    let data = &res.body["data"];
    assert_eq!(data["success"], true);
    assert_eq!(data["newBalance"], "150");
    assert_eq!(data["redeemedAmount"], "50");
    assert_eq!(data["client"], "Coffee Partner");
    assert_eq!(app.balance(&member).await, "150");

    let res = app
        .get("/points/transactions", &[("x-session-id", member.session_id.as_str())])
        .await;
    assert_eq!(res.status, StatusCode::OK);
    let entries = res.body["data"].as_array().unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0]["direction"], "debit");
    assert_eq!(entries[0]["method"], "redeem");
    assert_eq!(entries[0]["amount"], "50");
    assert!(entries[0]["status"].is_null());
    assert_eq!(entries[1]["direction"], "credit");
    assert_eq!(entries[1]["reason"], "purchase");
}

#[tokio::test]
async fn redeem_requires_the_spend_scope() {
    let app = TestApp::spawn().await;
    let client = app.register_client().await;
    let member = app.register_member("jane@example.com").await;
    app.credit(&client, member.member_id, "200").await;

    let (access, _) = app.issue_tokens(&client, &member, "profile balance:read").await;
    let res = app
        .post_json(
            "/points/redeem",
            json!({ "amount": "50" }),
            &[("authorization", bearer(&access).as_str())],
        )
        .await;

    assert_eq!(res.status, StatusCode::FORBIDDEN);
    assert_eq!(res.body["error"]["code"], "INSUFFICIENT_SCOPE");
    assert_eq!(res.body["error"]["statusCode"], 403);
    assert_eq!(app.balance(&member).await, "200");
}

#[tokio::test]
async fn redeem_with_persistent_scope_spends_points() {
    let app = TestApp::spawn().await;
    let client = app.register_client().await;
    let member = app.register_member("jane@example.com").await;
    app.credit(&client, member.member_id, "80").await;

    let (access, _) = app
        .issue_tokens(&client, &member, "points:redeem:persistent")
        .await;
    let res = app
        .post_json(
            "/points/redeem",
            json!({ "amount": "30.50" }),
            &[("authorization", bearer(&access).as_str())],
        )
        .await;

    assert_eq!(res.status, StatusCode::OK, "{}", res.body);
    assert_eq!(app.balance(&member).await, "49.5");
}

#[tokio::test]
async fn redeem_rejects_bad_tokens_and_amounts() {
    let app = TestApp::spawn().await;
    let client = app.register_client().await;
    let member = app.register_member("jane@example.com").await;
    app.credit(&client, member.member_id, "100").await;

    let res = app
        .post_json("/points/redeem", json!({ "amount": "10" }), &[])
        .await;
    assert_eq!(res.status, StatusCode::UNAUTHORIZED);
    assert_eq!(res.body["error"]["code"], "UNAUTHORIZED");

    let res = app
        .post_json(
            "/points/redeem",
            json!({ "amount": "10" }),
            &[("authorization", "Bearer forged")],
        )
        .await;
    assert_eq!(res.status, StatusCode::UNAUTHORIZED);
    assert_eq!(res.body["error"]["code"], "INVALID_TOKEN");

    let (access, _) = app.issue_tokens(&client, &member, "points:redeem").await;
    for amount in ["0", "-5", "1.234"] {
        let res = app
            .post_json(
                "/points/redeem",
                json!({ "amount": amount }),
                &[("authorization", bearer(&access).as_str())],
            )
            .await;
        assert_eq!(res.status, StatusCode::BAD_REQUEST, "amount {}", amount);
        assert_eq!(res.body["error"]["code"], "INVALID_AMOUNT");
    }

    let res = app
        .post_json(
            "/points/redeem",
            json!({ "amount": "101" }),
            &[("authorization", bearer(&access).as_str())],
        )
        .await;
    assert_eq!(res.status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(res.body["error"]["code"], "INSUFFICIENT_BALANCE");
    assert_eq!(app.balance(&member).await, "100");
}

#[tokio::test]
async fn credit_requires_client_authentication() {
    let app = TestApp::spawn().await;
    let client = app.register_client().await;
    let member = app.register_member("jane@example.com").await;

    let res = app
        .post_json(
            "/points/credit",
            json!({
                "client_id": client.client_id,
                "client_secret": "wrong",
                "member_id": member.member_id,
                "amount": "500",
            }),
            &[],
        )
        .await;
    assert_eq!(res.status, StatusCode::UNAUTHORIZED);
    assert_eq!(res.body["error"]["code"], "INVALID_CREDENTIALS");

    let res = app.credit(&client, uuid::Uuid::new_v4(), "10").await;
    assert_eq!(res.status, StatusCode::NOT_FOUND);
    assert_eq!(app.balance(&member).await, "0");
}

#[tokio::test]
async fn otp_redemption_approves_exactly_once() {
    let app = TestApp::spawn().await;
    let client = app.register_client().await;
    let member = app.register_member("jane@example.com").await;
    app.credit(&client, member.member_id, "150").await;

    let (request_id, otp) = open_request(&app, &client, &member, "100").await;
    assert_eq!(otp.len(), 6);
    assert_eq!(app.delivery.delivered.lock().unwrap().len(), 1);
    // nothing moves until approval
    assert_eq!(app.balance(&member).await, "150");

    let res = app
        .get(
            "/points/redemption/pending",
            &[("x-session-id", member.session_id.as_str())],
        )
        .await;
    let pending = res.body["data"].as_array().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0]["requestId"], request_id.as_str());
    assert_eq!(pending[0]["amount"], "100");

    let res = approve(&app, &member, &request_id, &otp).await;
    assert_eq!(res.status, StatusCode::OK, "{}", res.body);
    assert_eq!(res.body["data"]["status"], "approved");
    assert_eq!(res.body["data"]["newBalance"], "50");
    assert_eq!(app.balance(&member).await, "50");

    let res = approve(&app, &member, &request_id, &otp).await;
    assert_eq!(res.status, StatusCode::CONFLICT);
    assert_eq!(res.body["error"]["code"], "ALREADY_PROCESSED");
    assert_eq!(app.balance(&member).await, "50");
}

#[tokio::test]
async fn otp_request_checks_balance_up_front() {
    let app = TestApp::spawn().await;
    let client = app.register_client().await;
    let member = app.register_member("jane@example.com").await;
    app.credit(&client, member.member_id, "50").await;

    let res = app
        .post_json(
            "/points/redemption-request",
            json!({
                "client_id": client.client_id,
                "client_secret": client.secret,
                "member_id": member.member_id,
                "amount": "100",
            }),
            &[],
        )
        .await;

    assert_eq!(res.status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(res.body["error"]["code"], "INSUFFICIENT_BALANCE");
    assert!(app.delivery.delivered.lock().unwrap().is_empty());
}

#[tokio::test]
async fn wrong_otp_and_wrong_member_are_refused() {
    let app = TestApp::spawn().await;
    let client = app.register_client().await;
    let member = app.register_member("jane@example.com").await;
    let intruder = app.register_member("mallory@example.com").await;
    app.credit(&client, member.member_id, "150").await;

    let (request_id, otp) = open_request(&app, &client, &member, "100").await;
    let wrong = if otp == "000000" { "111111" } else { "000000" };

    let res = approve(&app, &member, &request_id, wrong).await;
    assert_eq!(res.status, StatusCode::BAD_REQUEST);
    assert_eq!(res.body["error"]["code"], "INVALID_OTP");

    let res = approve(&app, &intruder, &request_id, &otp).await;
    assert_eq!(res.status, StatusCode::FORBIDDEN);

    let res = approve(&app, &member, &uuid::Uuid::new_v4().to_string(), &otp).await;
    assert_eq!(res.status, StatusCode::NOT_FOUND);

    // the right code still works afterwards
    let res = approve(&app, &member, &request_id, &otp).await;
    assert_eq!(res.status, StatusCode::OK, "{}", res.body);
}

#[tokio::test]
async fn approval_rechecks_balance_at_settlement() {
    let app = TestApp::spawn().await;
    let client = app.register_client().await;
    let member = app.register_member("jane@example.com").await;
    app.credit(&client, member.member_id, "150").await;

    let (request_id, otp) = open_request(&app, &client, &member, "100").await;

    let (access, _) = app.issue_tokens(&client, &member, "points:redeem").await;
    let res = app
        .post_json(
            "/points/redeem",
            json!({ "amount": "100" }),
            &[("authorization", bearer(&access).as_str())],
        )
        .await;
    assert_eq!(res.status, StatusCode::OK);

    let res = approve(&app, &member, &request_id, &otp).await;
    assert_eq!(res.status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(res.body["error"]["code"], "INSUFFICIENT_BALANCE");
    assert_eq!(app.balance(&member).await, "50");

    let res = approve(&app, &member, &request_id, &otp).await;
    assert_eq!(res.status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn rejected_request_cannot_be_approved() {
    let app = TestApp::spawn().await;
    let client = app.register_client().await;
    let member = app.register_member("jane@example.com").await;
    app.credit(&client, member.member_id, "150").await;

    let (request_id, otp) = open_request(&app, &client, &member, "100").await;

    let res = app
        .post_json(
            "/points/redemption/reject",
            json!({ "request_id": request_id }),
            &[("x-session-id", member.session_id.as_str())],
        )
        .await;
    assert_eq!(res.status, StatusCode::OK, "{}", res.body);
    assert_eq!(res.body["data"]["status"], "rejected");

    let res = approve(&app, &member, &request_id, &otp).await;
    assert_eq!(res.status, StatusCode::CONFLICT);
    assert_eq!(res.body["error"]["code"], "ALREADY_PROCESSED");
    assert_eq!(app.balance(&member).await, "150");
}

#[tokio::test]
async fn swept_request_reports_already_processed() {
    let app = TestApp::spawn().await;
    let client = app.register_client().await;
    let member = app.register_member("jane@example.com").await;
    app.credit(&client, member.member_id, "150").await;

    let (request_id, otp) = open_request(&app, &client, &member, "100").await;

    let swept = app
        .state
        .ledger
        .expire_pending_requests(Utc::now() + Duration::minutes(11))
        .await
        .unwrap();
    assert_eq!(swept, 1);

    let res = approve(&app, &member, &request_id, &otp).await;
    assert_eq!(res.status, StatusCode::CONFLICT);
    assert_eq!(res.body["error"]["code"], "ALREADY_PROCESSED");

    let res = app
        .get(
            "/points/redemption/pending",
            &[("x-session-id", member.session_id.as_str())],
        )
        .await;
    assert_eq!(res.body["data"].as_array().map(Vec::len), Some(0));
    assert_eq!(app.balance(&member).await, "150");
}

#[tokio::test]
async fn reconcile_matches_balance_to_entries() {
    let app = TestApp::spawn().await;
    let client = app.register_client().await;
    let member = app.register_member("jane@example.com").await;
    app.credit(&client, member.member_id, "200").await;

    let (request_id, otp) = open_request(&app, &client, &member, "75.5").await;
    approve(&app, &member, &request_id, &otp).await;
    // a pending request is not counted
    open_request(&app, &client, &member, "20").await;

    let res = app
        .get("/points/reconcile", &[("x-session-id", member.session_id.as_str())])
        .await;

    assert_eq!(res.status, StatusCode::OK);
    let data = &res.body["data"];
    assert_eq!(data["balance"], "124.5");
    assert_eq!(data["credits"], "200");
    assert_eq!(data["debits"], "75.5");
    assert_eq!(data["consistent"], true);
}

#[tokio::test]
async fn member_endpoints_require_a_session() {
    let app = TestApp::spawn().await;

    for uri in [
        "/points/balance",
        "/points/transactions",
        "/points/redemption/pending",
        "/points/reconcile",
    ] {
        let res = app.get(uri, &[]).await;
        assert_eq!(res.status, StatusCode::UNAUTHORIZED, "{}", uri);
        assert_eq!(res.body["error"]["statusCode"], 401);
    }
}

#[tokio::test]
async fn logout_ends_the_session() {
    let app = TestApp::spawn().await;
    let member = app.register_member("jane@example.com").await;

    let res = app
        .post_json("/auth/logout", json!({}), &[("x-session-id", member.session_id.as_str())])
        .await;
    assert_eq!(res.status, StatusCode::OK);

    let res = app
        .get("/points/balance", &[("x-session-id", member.session_id.as_str())])
        .await;
    assert_eq!(res.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn duplicate_registration_and_bad_password_are_refused() {
    let app = TestApp::spawn().await;
    app.register_member("jane@example.com").await;

    let res = app
        .post_json(
            "/auth/register",
            json!({ "email": "JANE@example.com", "password": "another-password" }),
            &[],
        )
        .await;
    assert_eq!(res.status, StatusCode::CONFLICT);

    let res = app
        .post_json(
            "/auth/login",
            json!({ "email": "jane@example.com", "password": "wrong-password" }),
            &[],
        )
        .await;
    assert_eq!(res.status, StatusCode::UNAUTHORIZED);

    let res = app
        .post_json(
            "/auth/register",
            json!({ "email": "not-an-email", "password": "short" }),
            &[],
        )
        .await;
    assert_eq!(res.status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(res.body["error"]["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn openapi_document_describes_error_bodies() {
    let app = TestApp::spawn().await;
    let res = app.get("/.well-known/openapi.json", &[]).await;
    assert_eq!(res.status, StatusCode::OK);

    let redeem = &res.body["paths"]["/points/redeem"]["post"]["responses"]["422"];
    assert_eq!(
        redeem["content"]["application/json"]["schema"]["$ref"],
        "#/components/schemas/ErrorResponse"
    );
    let token = &res.body["paths"]["/oauth/token"]["post"]["responses"]["400"];
    assert_eq!(
        token["content"]["application/json"]["schema"]["$ref"],
        "#/components/schemas/OAuthErrorResponse"
    );
}
