//! Services layer for points-service.
//!
//! The grant engine and the ledger sit on top of a [`Store`]; the Postgres
//! and in-memory backends implement the same atomic operations.

mod database;
mod delivery;
pub mod error;
mod grant;
pub mod ledger;
mod memory;
pub mod metrics;
pub mod retry;
mod session;
mod store;

pub use database::Database;
pub use delivery::{EmailOtpDelivery, LogOtpDelivery, MockOtpDelivery, OtpDelivery, OtpNotice};
pub use error::{CredentialKind, OAuthError, ServiceError};
pub use grant::{GrantEngine, TokenPolicy};
pub use ledger::{GatedDebitRequest, LedgerService, Mutation, Reconciliation};
pub use memory::MemoryStore;
pub use retry::RetryConfig;
pub use session::SessionRegistry;
pub use store::{Settlement, Store};
