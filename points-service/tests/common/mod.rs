//! Test helpers for points-service integration tests.
//!
//! Builds the full router over the in-memory store and drives it with
//! `tower::ServiceExt::oneshot`.

#![allow(dead_code)]

use axum::{
    body::Body,
    http::{header, HeaderMap, Request, StatusCode},
    Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use points_service::{
    build_router,
    config::{PointsConfig, StoreBackend},
    models::{GrantKind, Scope, ScopeSet},
    services::{Database, MemoryStore, MockOtpDelivery, Store},
    AppState,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tower::ServiceExt;
use uuid::Uuid;

pub const REDIRECT_URI: &str = "https://partner.example/callback";
pub const PASSWORD: &str = "correct-horse-battery";

pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Value,
}

impl TestResponse {
    /// Query parameters of the `Location` header.
    pub fn location_params(&self) -> HashMap<String, String> {
        let location = self.location();
        let query = location.split_once('?').map(|(_, q)| q).unwrap_or("");
        serde_urlencoded::from_str(query).expect("location query")
    }

    pub fn location(&self) -> String {
        self.headers
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .expect("location header")
            .to_string()
    }
}

#[derive(Clone)]
pub struct TestClient {
    pub client_id: String,
    pub secret: String,
}

impl TestClient {
    pub fn basic_auth(&self) -> String {
        format!(
            "Basic {}",
            STANDARD.encode(format!("{}:{}", self.client_id, self.secret))
        )
    }
}

#[derive(Clone)]
pub struct TestMember {
    pub member_id: Uuid,
    pub email: String,
    pub session_id: String,
}

pub struct TestApp {
    pub state: AppState,
    pub router: Router,
    pub delivery: Arc<MockOtpDelivery>,
}

impl TestApp {
    pub async fn spawn() -> Self {
        Self::spawn_with(PointsConfig::development()).await
    }

    pub async fn spawn_with(config: PointsConfig) -> Self {
        Self::spawn_on(config, Arc::new(MemoryStore::new())).await
    }

    /// Same router over PostgreSQL. Needs `TEST_DATABASE_URL`.
    pub async fn spawn_postgres() -> Self {
        let database_url = std::env::var("TEST_DATABASE_URL")
            .expect("TEST_DATABASE_URL must be set to run database tests");
        let db = Database::new(&database_url, 16, 1)
            .await
            .expect("Failed to connect to test database");
        db.run_migrations().await.expect("Failed to run migrations");

        let mut config = PointsConfig::development();
        config.store.backend = StoreBackend::Postgres;
        config.store.database_url = database_url;
        Self::spawn_on(config, Arc::new(db)).await
    }

    async fn spawn_on(config: PointsConfig, store: Arc<dyn Store>) -> Self {
        let delivery = Arc::new(MockOtpDelivery::default());
        let state = AppState::new(config, store, delivery.clone());
        let router = build_router(state.clone())
            .await
            .expect("Failed to build router");
        TestApp {
            state,
            router,
            delivery,
        }
    }

    pub async fn send(&self, request: Request<Body>) -> TestResponse {
        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("response");
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        TestResponse {
            status,
            headers,
            body,
        }
    }

    pub async fn get(&self, uri: &str, headers: &[(&str, &str)]) -> TestResponse {
        let mut builder = Request::builder().method("GET").uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        self.send(builder.body(Body::empty()).expect("request")).await
    }

    pub async fn post_json(&self, uri: &str, body: Value, headers: &[(&str, &str)]) -> TestResponse {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        self.send(builder.body(Body::from(body.to_string())).expect("request"))
            .await
    }

    pub async fn post_form(&self, uri: &str, form: &[(&str, &str)], headers: &[(&str, &str)]) -> TestResponse {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let body = serde_urlencoded::to_string(form).expect("form");
        self.send(builder.body(Body::from(body)).expect("request")).await
    }

    /// Provision a partner client allowed every scope and both grant kinds.
    pub async fn register_client(&self) -> TestClient {
        self.register_client_with(
            ScopeSet::new([
                Scope::Profile,
                Scope::BalanceRead,
                Scope::PointsRedeem,
                Scope::PointsRedeemPersistent,
            ]),
            vec![GrantKind::AuthorizationCode, GrantKind::RefreshToken],
        )
        .await
    }

    pub async fn register_client_with(
        &self,
        scopes: ScopeSet,
        grant_kinds: Vec<GrantKind>,
    ) -> TestClient {
        let (client, secret) = self
            .state
            .grants
            .register_client(
                "Coffee Partner",
                vec![REDIRECT_URI.to_string()],
                scopes,
                grant_kinds,
            )
            .await
            .expect("register client");
        TestClient {
            client_id: client.client_id,
            secret,
        }
    }

    /// Register through the API and log in.
    pub async fn register_member(&self, email: &str) -> TestMember {
        let res = self
            .post_json(
                "/auth/register",
                serde_json::json!({ "email": email, "password": PASSWORD, "display_name": "Jane" }),
                &[],
            )
            .await;
        assert_eq!(res.status, StatusCode::CREATED, "register: {}", res.body);
        let member_id: Uuid = res.body["data"]["memberId"]
            .as_str()
            .and_then(|s| s.parse().ok())
            .expect("member id");

        let res = self
            .post_json(
                "/auth/login",
                serde_json::json!({ "email": email, "password": PASSWORD }),
                &[],
            )
            .await;
        assert_eq!(res.status, StatusCode::OK, "login: {}", res.body);
        let session_id = res.body["data"]["sessionId"]
            .as_str()
            .expect("session id")
            .to_string();

        TestMember {
            member_id,
            email: email.to_string(),
            session_id,
        }
    }

    pub async fn credit(&self, client: &TestClient, member_id: Uuid, amount: &str) -> TestResponse {
        self.post_json(
            "/points/credit",
            serde_json::json!({
                "client_id": client.client_id,
                "client_secret": client.secret,
                "member_id": member_id,
                "amount": amount,
                "reason": "purchase",
            }),
            &[],
        )
        .await
    }

    /// Walk authorize, consent and return the issued code.
    pub async fn authorize_code(&self, client: &TestClient, member: &TestMember, scope: &str) -> String {
        let uri = format!(
            "/oauth/authorize?response_type=code&client_id={}&redirect_uri={}&scope={}&state=xyz",
            client.client_id,
            urlencoding::encode(REDIRECT_URI),
            urlencoding::encode(scope),
        );
        let res = self.get(&uri, &[("x-session-id", member.session_id.as_str())]).await;
        assert_eq!(res.status, StatusCode::SEE_OTHER, "authorize: {}", res.body);
        let request_id = res.location_params()["request_id"].clone();

        let res = self
            .post_form(
                "/oauth/consent",
                &[("request_id", request_id.as_str()), ("approve", "true")],
                &[("x-session-id", member.session_id.as_str())],
            )
            .await;
        assert_eq!(res.status, StatusCode::SEE_OTHER, "consent: {}", res.body);
        let params = res.location_params();
        assert_eq!(params["state"], "xyz");
        params["code"].clone()
    }

    pub async fn exchange(&self, client: &TestClient, code: &str) -> TestResponse {
        self.post_form(
            "/oauth/token",
            &[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", REDIRECT_URI),
            ],
            &[("authorization", client.basic_auth().as_str())],
        )
        .await
    }

    /// Full flow down to an access/refresh pair.
    pub async fn issue_tokens(&self, client: &TestClient, member: &TestMember, scope: &str) -> (String, String) {
        let code = self.authorize_code(client, member, scope).await;
        let res = self.exchange(client, &code).await;
        assert_eq!(res.status, StatusCode::OK, "token: {}", res.body);
        (
            res.body["access_token"].as_str().expect("access token").to_string(),
            res.body["refresh_token"].as_str().expect("refresh token").to_string(),
        )
    }

    pub async fn reconcile(&self, member: &TestMember) -> Value {
        let res = self
            .get("/points/reconcile", &[("x-session-id", member.session_id.as_str())])
            .await;
        assert_eq!(res.status, StatusCode::OK, "reconcile: {}", res.body);
        res.body["data"].clone()
    }

    pub async fn balance(&self, member: &TestMember) -> String {
        let res = self
            .get("/points/balance", &[("x-session-id", member.session_id.as_str())])
            .await;
        assert_eq!(res.status, StatusCode::OK, "balance: {}", res.body);
        res.body["data"]["balance"].as_str().expect("balance").to_string()
    }
}
