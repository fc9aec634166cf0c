//! HTTP handlers for points-service.

pub mod metrics;
pub mod oauth;
pub mod points;
pub mod session;
