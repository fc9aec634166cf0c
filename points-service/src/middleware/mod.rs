pub mod auth;
pub mod metrics;

pub use auth::{
    bearer_token, BearerAuth, OptionalSession, SessionMember, SESSION_COOKIE, SESSION_HEADER,
};
