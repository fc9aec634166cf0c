use axum::{
    extract::{MatchedPath, Request},
    middleware::Next,
    response::Response,
};
use std::time::Instant;

use crate::services::metrics::{HTTP_REQUESTS_TOTAL, HTTP_REQUEST_DURATION};

/// Count and time every request. The route label is the matched template so
/// that ids in paths do not explode cardinality.
pub async fn metrics_middleware(req: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().to_string();
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());

    let response = next.run(req).await;

    let status = response.status().as_u16().to_string();
    HTTP_REQUESTS_TOTAL
        .with_label_values(&[&method, &route, &status])
        .inc();
    HTTP_REQUEST_DURATION
        .with_label_values(&[&method, &route])
        .observe(start.elapsed().as_secs_f64());

    response
}
