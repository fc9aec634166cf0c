//! Grant and ledger behaviour over PostgreSQL.
//!
//! Run with: TEST_DATABASE_URL=postgres://... cargo test -p points-service --test database_test -- --ignored

mod common;

use axum::http::StatusCode;
use common::{TestApp, TestMember};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

const RACERS: usize = 8;

async fn fresh_member(app: &TestApp) -> TestMember {
    app.register_member(&format!("{}@example.com", Uuid::new_v4()))
        .await
}

async fn open_request(app: &TestApp, client: &common::TestClient, member: &TestMember, amount: &str) -> (String, String) {
    let res = app
        .post_json(
            "/points/redemption-request",
            json!({
                "client_id": client.client_id,
                "client_secret": client.secret,
                "member_id": member.member_id,
                "amount": amount,
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

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore] // Requires database
async fn code_is_consumed_once_under_concurrent_exchange() {
    let app = Arc::new(TestApp::spawn_postgres().await);
    let client = app.register_client().await;
    let member = fresh_member(&app).await;
    let code = app.authorize_code(&client, &member, "profile").await;

    let mut handles = Vec::with_capacity(RACERS);
    for _ in 0..RACERS {
        let app = app.clone();
        let client = client.clone();
        let code = code.clone();
        handles.push(tokio::spawn(async move { app.exchange(&client, &code).await }));
    }

    let mut issued = 0;
    for handle in handles {
        let res = handle.await.unwrap();
        match res.status {
            StatusCode::OK => issued += 1,
            StatusCode::BAD_REQUEST => assert_eq!(res.body["error"], "invalid_grant"),
            other => panic!("unexpected status {}: {}", other, res.body),
        }
    }
    assert_eq!(issued, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore] // Requires database
async fn refresh_token_rotates_once_under_concurrency() {
    let app = Arc::new(TestApp::spawn_postgres().await);
    let client = app.register_client().await;
    let member = fresh_member(&app).await;
    let (_, refresh) = app.issue_tokens(&client, &member, "profile").await;

    let mut handles = Vec::with_capacity(RACERS);
    for _ in 0..RACERS {
        let app = app.clone();
        let auth = client.basic_auth();
        let refresh = refresh.clone();
        handles.push(tokio::spawn(async move {
            app.post_form(
                "/oauth/token",
                &[("grant_type", "refresh_token"), ("refresh_token", refresh.as_str())],
                &[("authorization", auth.as_str())],
            )
            .await
        }));
    }

    let mut rotated = 0;
    for handle in handles {
        let res = handle.await.unwrap();
        if res.status == StatusCode::OK {
            rotated += 1;
        } else {
            assert_eq!(res.body["error"], "invalid_grant", "{}", res.body);
        }
    }
    assert_eq!(rotated, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore] // Requires database
async fn row_lock_serializes_concurrent_debits() {
    let app = Arc::new(TestApp::spawn_postgres().await);
    let client = app.register_client().await;
    let member = fresh_member(&app).await;
    app.credit(&client, member.member_id, "200").await;
    let (access, _) = app.issue_tokens(&client, &member, "points:redeem").await;
    let bearer = format!("Bearer {}", access);

    let mut handles = Vec::with_capacity(RACERS);
    for _ in 0..RACERS {
        let app = app.clone();
        let bearer = bearer.clone();
        handles.push(tokio::spawn(async move {
            app.post_json(
                "/points/redeem",
                json!({ "amount": "30" }),
                &[("authorization", bearer.as_str())],
            )
            .await
        }));
    }

    let mut applied = 0;
    for handle in handles {
        let res = handle.await.unwrap();
        match res.status {
            StatusCode::OK => applied += 1,
            StatusCode::UNPROCESSABLE_ENTITY => {
                assert_eq!(res.body["error"]["code"], "INSUFFICIENT_BALANCE")
            }
            other => panic!("unexpected status {}: {}", other, res.body),
        }
    }
    assert_eq!(applied, 6);
    assert_eq!(app.balance(&member).await, "20");
    assert_eq!(app.reconcile(&member).await["consistent"], true);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore] // Requires database
async fn approval_and_rejection_race_settles_once() {
    let app = Arc::new(TestApp::spawn_postgres().await);
    let client = app.register_client().await;
    let member = fresh_member(&app).await;
    app.credit(&client, member.member_id, "100").await;
    let (request_id, otp) = open_request(&app, &client, &member, "60").await;

    let mut handles = Vec::with_capacity(RACERS);
    for i in 0..RACERS {
        let app = app.clone();
        let session = member.session_id.clone();
        let (uri, body) = if i % 2 == 0 {
            ("/points/redemption/approve", json!({ "request_id": request_id, "otp": otp }))
        } else {
            ("/points/redemption/reject", json!({ "request_id": request_id }))
        };
        handles.push(tokio::spawn(async move {
            let res = app
                .post_json(uri, body, &[("x-session-id", session.as_str())])
                .await;
            (uri, res)
        }));
    }

    let mut winners = Vec::new();
    for handle in handles {
        let (uri, res) = handle.await.unwrap();
        match res.status {
            StatusCode::OK => winners.push(uri),
            StatusCode::CONFLICT => assert_eq!(res.body["error"]["code"], "ALREADY_PROCESSED"),
            other => panic!("unexpected status {}: {}", other, res.body),
        }
    }
    assert_eq!(winners.len(), 1);

    let expected = if winners[0] == "/points/redemption/approve" { "40" } else { "100" };
    assert_eq!(app.balance(&member).await, expected);
    assert_eq!(app.reconcile(&member).await["consistent"], true);
}

#[tokio::test]
#[ignore] // Requires database
async fn reconcile_totals_count_applied_entries_only() {
    let app = TestApp::spawn_postgres().await;
    let client = app.register_client().await;
    let member = fresh_member(&app).await;

    // NUMERIC(20, 2) hands back "200.00"; responses stay canonical
    let res = app.credit(&client, member.member_id, "200.00").await;
    assert_eq!(res.body["data"]["newBalance"], "200");

    let (access, _) = app.issue_tokens(&client, &member, "points:redeem").await;
    let res = app
        .post_json(
            "/points/redeem",
            json!({ "amount": "50.25" }),
            &[("authorization", format!("Bearer {}", access).as_str())],
        )
        .await;
    assert_eq!(res.status, StatusCode::OK);
    assert_eq!(res.body["data"]["newBalance"], "149.75");

    let (approved, otp) = open_request(&app, &client, &member, "30").await;
    let res = app
        .post_json(
            "/points/redemption/approve",
            json!({ "request_id": approved, "otp": otp }),
            &[("x-session-id", member.session_id.as_str())],
        )
        .await;
    assert_eq!(res.status, StatusCode::OK);

    let (rejected, _) = open_request(&app, &client, &member, "10").await;
    let res = app
        .post_json(
            "/points/redemption/reject",
            json!({ "request_id": rejected }),
            &[("x-session-id", member.session_id.as_str())],
        )
        .await;
    assert_eq!(res.status, StatusCode::OK);

    // still pending, so not counted
    open_request(&app, &client, &member, "5").await;

    let totals = app.reconcile(&member).await;
    assert_eq!(totals["balance"], "119.75");
    assert_eq!(totals["credits"], "200");
    assert_eq!(totals["debits"], "80.25");
    assert_eq!(totals["consistent"], true);
}

#[tokio::test]
#[ignore] // Requires database
async fn deactivated_member_cannot_settle_open_request() {
    let app = TestApp::spawn_postgres().await;
    let client = app.register_client().await;
    let member = fresh_member(&app).await;
    app.credit(&client, member.member_id, "100").await;
    let (request_id, otp) = open_request(&app, &client, &member, "40").await;

    assert!(app
        .state
        .store
        .set_member_active(member.member_id, false)
        .await
        .unwrap());

    let res = app
        .post_json(
            "/points/redemption/approve",
            json!({ "request_id": request_id, "otp": otp }),
            &[("x-session-id", member.session_id.as_str())],
        )
        .await;
    assert_eq!(res.status, StatusCode::FORBIDDEN);
    assert_eq!(res.body["error"]["code"], "FORBIDDEN");
    assert_eq!(app.balance(&member).await, "100");

    // the refused settlement rolled back; the request is still open
    let res = app
        .get(
            "/points/redemption/pending",
            &[("x-session-id", member.session_id.as_str())],
        )
        .await;
    assert_eq!(res.body["data"].as_array().map(Vec::len), Some(1));
}
