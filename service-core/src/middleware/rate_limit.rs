use crate::error::AppError;
use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::Response,
};
use governor::{
    Quota, RateLimiter,
    clock::{Clock, DefaultClock},
    state::keyed::DashMapStateStore,
};
use std::{
    net::{IpAddr, SocketAddr},
    num::NonZeroU32,
    sync::Arc,
    time::Duration,
};

/// Rate limiter keyed by caller IP address
pub type IpRateLimiter = Arc<RateLimiter<IpAddr, DashMapStateStore<IpAddr>, DefaultClock>>;

/// Create a keyed rate limiter allowing `attempts` per `window_seconds` per IP.
pub fn create_ip_rate_limiter(attempts: u32, window_seconds: u64) -> IpRateLimiter {
    let attempts = NonZeroU32::new(attempts.max(1)).unwrap_or(NonZeroU32::MIN);
    let period = Duration::from_millis((window_seconds.max(1) * 1000) / attempts.get() as u64);
    let quota = Quota::with_period(period)
        .unwrap_or_else(|| Quota::per_second(attempts))
        .allow_burst(attempts);

    Arc::new(RateLimiter::dashmap(quota))
}

/// Resolve the caller address: first `x-forwarded-for` hop, then the socket peer.
pub fn client_ip(request: &Request) -> Option<IpAddr> {
    request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.split(',').next())
        .and_then(|s| s.trim().parse::<IpAddr>().ok())
        .or_else(|| {
            request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip())
        })
}

/// Middleware for IP-based rate limiting
pub async fn ip_rate_limit_middleware(
    State(limiter): State<IpRateLimiter>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    match client_ip(&request) {
        Some(ip) => match limiter.check_key(&ip) {
            Ok(_) => Ok(next.run(request).await),
            Err(negative) => {
                let wait_time = negative.wait_time_from(DefaultClock::default().now());
                tracing::warn!(ip = %ip, "Rate limit exceeded");
                Err(AppError::TooManyRequests(
                    "Too many requests from this IP. Please try again later.".to_string(),
                    Some(wait_time.as_secs().max(1)),
                ))
            }
        },
        None => {
            tracing::warn!("Could not determine IP for rate limiting");
            Ok(next.run(request).await)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Router, body::Body, http::StatusCode, middleware::from_fn_with_state, routing::get};
    use tower::ServiceExt;

    fn app(limiter: IpRateLimiter) -> Router {
        Router::new()
            .route("/", get(|| async { "ok" }))
            .layer(from_fn_with_state(limiter, ip_rate_limit_middleware))
    }

    fn request_from(ip: &str) -> Request {
        Request::builder()
            .uri("/")
            .header("x-forwarded-for", ip)
            .body(Body::empty())
            .expect("request")
    }

    #[tokio::test]
    async fn blocks_after_burst_is_spent() {
        let app = app(create_ip_rate_limiter(2, 60));

        for _ in 0..2 {
            let res = app.clone().oneshot(request_from("10.0.0.1")).await.expect("response");
            assert_eq!(res.status(), StatusCode::OK);
        }

        let res = app.clone().oneshot(request_from("10.0.0.1")).await.expect("response");
        assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);

        // Other callers keep their own budget.
        let res = app.oneshot(request_from("10.0.0.2")).await.expect("response");
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_caller_is_let_through() {
        let app = app(create_ip_rate_limiter(1, 60));
        for _ in 0..3 {
            let res = app
                .clone()
                .oneshot(Request::builder().uri("/").body(Body::empty()).expect("request"))
                .await
                .expect("response");
            assert_eq!(res.status(), StatusCode::OK);
        }
    }
}
