pub mod config;
pub mod dtos;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod utils;

use axum::{
    extract::State,
    http::{header, HeaderName, HeaderValue, Method, Request},
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use service_core::error::AppError;
use service_core::middleware::{
    rate_limit::{create_ip_rate_limiter, ip_rate_limit_middleware, IpRateLimiter},
    security_headers::security_headers_middleware,
    tracing::{request_id_middleware, REQUEST_ID_HEADER},
};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use utoipa::{
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
    Modify, OpenApi,
};

use crate::config::PointsConfig;
use crate::dtos::Envelope;
use crate::middleware::{metrics::metrics_middleware, SESSION_HEADER};
use crate::services::{
    GrantEngine, LedgerService, OtpDelivery, RetryConfig, SessionRegistry, Store,
};

#[derive(OpenApi)]
#[openapi(
    paths(
        health_check,
        handlers::session::register,
        handlers::session::login,
        handlers::session::logout,
        handlers::oauth::authorize,
        handlers::oauth::consent_view,
        handlers::oauth::consent_decide,
        handlers::oauth::token,
        handlers::oauth::userinfo,
        handlers::oauth::revoke,
        handlers::points::redeem,
        handlers::points::request_redemption,
        handlers::points::approve_redemption,
        handlers::points::reject_redemption,
        handlers::points::credit,
        handlers::points::balance,
        handlers::points::transactions,
        handlers::points::pending_redemptions,
        handlers::points::reconcile,
    ),
    components(
        schemas(
            dtos::ErrorResponse,
            dtos::ErrorDetail,
            dtos::OAuthErrorResponse,
            dtos::session::RegisterRequest,
            dtos::session::RegisterResponse,
            dtos::session::LoginRequest,
            dtos::session::LoginResponse,
            dtos::session::MessageResponse,
            dtos::oauth::ConsentView,
            dtos::oauth::ScopeView,
            dtos::oauth::ConsentDecision,
            dtos::oauth::TokenRequest,
            dtos::oauth::TokenResponse,
            dtos::oauth::RevokeRequest,
            dtos::oauth::UserInfoResponse,
            dtos::points::RedeemRequest,
            dtos::points::RedeemResponse,
            dtos::points::RedemptionRequestBody,
            dtos::points::RedemptionRequestResponse,
            dtos::points::ApproveRedemptionRequest,
            dtos::points::RejectRedemptionRequest,
            dtos::points::RedemptionDecisionResponse,
            dtos::points::CreditRequest,
            dtos::points::CreditResponse,
            dtos::points::BalanceResponse,
            dtos::points::TransactionView,
            dtos::points::PendingRedemptionView,
            dtos::points::ReconciliationResponse,
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "Session", description = "Member registration and login"),
        (name = "OAuth", description = "Authorization-code grant for partner clients"),
        (name = "Points", description = "Balance, redemptions and credits"),
        (name = "Observability", description = "Service health and monitoring"),
    )
)]
pub struct ApiDoc;

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                SecurityScheme::Http(HttpBuilder::new().scheme(HttpAuthScheme::Bearer).build()),
            );
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: PointsConfig,
    pub store: Arc<dyn Store>,
    pub grants: Arc<GrantEngine>,
    pub ledger: Arc<LedgerService>,
    pub sessions: Arc<SessionRegistry>,
    pub login_rate_limiter: IpRateLimiter,
    pub token_rate_limiter: IpRateLimiter,
    pub approve_rate_limiter: IpRateLimiter,
    pub ip_rate_limiter: IpRateLimiter,
}

impl AppState {
    /// Wire the engines over a store backend.
    pub fn new(
        config: PointsConfig,
        store: Arc<dyn Store>,
        delivery: Arc<dyn OtpDelivery>,
    ) -> Self {
        let grants = Arc::new(GrantEngine::new(store.clone(), config.token_policy()));
        let ledger = Arc::new(LedgerService::new(
            store.clone(),
            grants.clone(),
            delivery,
            config.otp_ttl(),
            RetryConfig::default(),
        ));
        let sessions = Arc::new(SessionRegistry::new(
            config.session_ttl(),
            config.consent_ttl(),
        ));

        let limits = &config.rate_limit;
        let login_rate_limiter =
            create_ip_rate_limiter(limits.login_attempts, limits.login_window_seconds);
        let token_rate_limiter =
            create_ip_rate_limiter(limits.token_attempts, limits.token_window_seconds);
        let approve_rate_limiter =
            create_ip_rate_limiter(limits.approve_attempts, limits.approve_window_seconds);
        let ip_rate_limiter =
            create_ip_rate_limiter(limits.global_ip_limit, limits.global_ip_window_seconds);

        Self {
            config,
            store,
            grants,
            ledger,
            sessions,
            login_rate_limiter,
            token_rate_limiter,
            approve_rate_limiter,
            ip_rate_limiter,
        }
    }
}

pub async fn build_router(state: AppState) -> Result<Router, AppError> {
    let login_route = Router::new()
        .route("/auth/login", post(handlers::session::login))
        .layer(from_fn_with_state(
            state.login_rate_limiter.clone(),
            ip_rate_limit_middleware,
        ));

    let token_routes = Router::new()
        .route("/oauth/token", post(handlers::oauth::token))
        .route("/oauth/revoke", post(handlers::oauth::revoke))
        .layer(from_fn_with_state(
            state.token_rate_limiter.clone(),
            ip_rate_limit_middleware,
        ));

    // OTP guessing is bounded per caller
    let approve_route = Router::new()
        .route(
            "/points/redemption/approve",
            post(handlers::points::approve_redemption),
        )
        .layer(from_fn_with_state(
            state.approve_rate_limiter.clone(),
            ip_rate_limit_middleware,
        ));

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(handlers::metrics::metrics))
        .route(
            "/.well-known/openapi.json",
            get(|| async { Json(ApiDoc::openapi()) }),
        )
        // Session
        .route("/auth/register", post(handlers::session::register))
        .route("/auth/logout", post(handlers::session::logout))
        .merge(login_route)
        // OAuth
        .route("/oauth/authorize", get(handlers::oauth::authorize))
        .route(
            "/oauth/consent",
            get(handlers::oauth::consent_view).post(handlers::oauth::consent_decide),
        )
        .route("/oauth/userinfo", get(handlers::oauth::userinfo))
        .merge(token_routes)
        // Points
        .route("/points/redeem", post(handlers::points::redeem))
        .route(
            "/points/redemption-request",
            post(handlers::points::request_redemption),
        )
        .route(
            "/points/redemption/reject",
            post(handlers::points::reject_redemption),
        )
        .route(
            "/points/redemption/pending",
            get(handlers::points::pending_redemptions),
        )
        .route("/points/credit", post(handlers::points::credit))
        .route("/points/balance", get(handlers::points::balance))
        .route("/points/transactions", get(handlers::points::transactions))
        .route("/points/reconcile", get(handlers::points::reconcile))
        .merge(approve_route)
        .with_state(state.clone())
        // Global IP rate limiting
        .layer(from_fn_with_state(
            state.ip_rate_limiter.clone(),
            ip_rate_limit_middleware,
        ))
        .layer(from_fn(metrics_middleware))
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &Request<_>| {
                let request_id = request
                    .headers()
                    .get(REQUEST_ID_HEADER)
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("-");

                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    path = %request.uri().path(),
                    version = ?request.version(),
                )
            }),
        )
        .layer(from_fn(request_id_middleware))
        .layer(from_fn(security_headers_middleware))
        .layer(cors_layer(&state.config));

    Ok(app)
}

fn cors_layer(config: &PointsConfig) -> CorsLayer {
    let origins = config
        .security
        .allowed_origins
        .iter()
        // credentialed CORS cannot use a wildcard origin
        .filter(|o| o.as_str() != "*")
        .filter_map(|o| match o.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::error!("Invalid CORS origin '{}': {}. Skipping.", o, e);
                None
            }
        })
        .collect::<Vec<HeaderValue>>();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_credentials(true)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            HeaderName::from_static(SESSION_HEADER),
            HeaderName::from_static(REQUEST_ID_HEADER),
        ])
}

/// Move lapsed redemption requests to `expired` and drop stale sessions on a
/// fixed interval. Runs until the task is aborted.
pub fn spawn_expiry_sweeper(state: AppState, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            let now = Utc::now();
            if let Err(e) = state.ledger.expire_pending_requests(now).await {
                tracing::error!(error = %e, "Expiry sweep failed");
            }
            let purged = state.sessions.purge_expired(now);
            if purged > 0 {
                tracing::debug!(purged = purged, "Purged expired sessions");
            }
        }
    })
}

/// Service health check
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is healthy"),
        (status = 503, description = "Store is unreachable", body = dtos::ErrorResponse)
    ),
    tag = "Observability"
)]
pub async fn health_check(
    State(state): State<AppState>,
) -> Result<Envelope<serde_json::Value>, AppError> {
    state.store.health_check().await.map_err(|e| {
        tracing::error!(error = %e, "Store health check failed");
        AppError::ServiceUnavailable
    })?;

    Ok(Envelope::new(serde_json::json!({
        "status": "healthy",
        "service": state.config.service_name,
        "version": state.config.service_version,
    })))
}
