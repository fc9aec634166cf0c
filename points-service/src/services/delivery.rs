use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lettre::{
    message::{header::ContentType, Mailbox},
    transport::smtp::authentication::Credentials,
    Message, SmtpTransport, Transport,
};
use rust_decimal::Decimal;
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

use super::ServiceError;
use crate::config::SmtpConfig;

/// One-time code handed to the member out of band.
#[derive(Debug, Clone)]
pub struct OtpNotice {
    pub member_id: Uuid,
    pub email: String,
    pub request_id: Uuid,
    pub client_name: String,
    pub amount: Decimal,
    pub otp: String,
    pub expires_at: DateTime<Utc>,
}

/// Channel that gets a redemption OTP to the member in production posture.
#[async_trait]
pub trait OtpDelivery: Send + Sync {
    async fn deliver(&self, notice: &OtpNotice) -> Result<(), ServiceError>;
}

/// Records the hand-off in the structured log without the code itself.
/// Development only; the member never sees the code this way.
#[derive(Clone, Default)]
pub struct LogOtpDelivery;

#[async_trait]
impl OtpDelivery for LogOtpDelivery {
    async fn deliver(&self, notice: &OtpNotice) -> Result<(), ServiceError> {
        tracing::info!(
            member_id = %notice.member_id,
            request_id = %notice.request_id,
            client = %notice.client_name,
            amount = %notice.amount,
            expires_at = %notice.expires_at,
            "Redemption OTP issued"
        );
        Ok(())
    }
}

/// Mails the code to the member's registered address over SMTP.
#[derive(Clone)]
pub struct EmailOtpDelivery {
    mailer: SmtpTransport,
    from: Mailbox,
}

impl EmailOtpDelivery {
    pub fn new(config: &SmtpConfig) -> Result<Self, ServiceError> {
        let from: Mailbox = config
            .from_address
            .parse()
            .map_err(|e: lettre::address::AddressError| {
                ServiceError::Internal(anyhow::anyhow!("SMTP_FROM is not a valid address: {}", e))
            })?;

        let builder = if config.starttls {
            SmtpTransport::starttls_relay(&config.host)
        } else {
            SmtpTransport::relay(&config.host)
        }
        .map_err(|e| ServiceError::Internal(anyhow::anyhow!("SMTP relay setup failed: {}", e)))?;

        let mailer = builder
            .port(config.port)
            .credentials(Credentials::new(
                config.username.clone(),
                config.password.clone(),
            ))
            .timeout(Some(Duration::from_secs(10)))
            .build();

        tracing::info!(host = %config.host, port = config.port, "OTP email delivery initialized");

        Ok(Self { mailer, from })
    }

    fn compose(&self, notice: &OtpNotice) -> Result<Message, ServiceError> {
        let to: Mailbox = notice
            .email
            .parse()
            .map_err(|e: lettre::address::AddressError| ServiceError::Delivery(e.to_string()))?;

        let body = format!(
            "{client} asked to redeem {amount} points from your account.\n\n\
             Your approval code is {otp}. It expires at {expires} UTC.\n\n\
             If you did not start this redemption, reject it from your account page.",
            client = notice.client_name,
            amount = notice.amount.normalize(),
            otp = notice.otp,
            expires = notice.expires_at.format("%Y-%m-%d %H:%M"),
        );

        Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject("Your points redemption code")
            .header(ContentType::TEXT_PLAIN)
            .body(body)
            .map_err(|e| ServiceError::Delivery(e.to_string()))
    }
}

#[async_trait]
impl OtpDelivery for EmailOtpDelivery {
    async fn deliver(&self, notice: &OtpNotice) -> Result<(), ServiceError> {
        let message = self.compose(notice)?;

        // SMTP transport blocks; keep it off the async workers
        let mailer = self.mailer.clone();
        let result = tokio::task::spawn_blocking(move || mailer.send(&message))
            .await
            .map_err(|e| ServiceError::Internal(e.into()))?;

        match result {
            Ok(_) => {
                tracing::info!(
                    member_id = %notice.member_id,
                    request_id = %notice.request_id,
                    "Redemption OTP emailed"
                );
                Ok(())
            }
            Err(e) => {
                tracing::error!(
                    error = %e,
                    member_id = %notice.member_id,
                    request_id = %notice.request_id,
                    "Failed to email redemption OTP"
                );
                Err(ServiceError::Delivery(e.to_string()))
            }
        }
    }
}

/// Captures notices for assertions in tests.
#[derive(Default)]
pub struct MockOtpDelivery {
    pub delivered: Mutex<Vec<OtpNotice>>,
}

impl MockOtpDelivery {
    pub fn last_otp(&self) -> Option<String> {
        self.delivered
            .lock()
            .ok()
            .and_then(|notices| notices.last().map(|n| n.otp.clone()))
    }
}

#[async_trait]
impl OtpDelivery for MockOtpDelivery {
    async fn deliver(&self, notice: &OtpNotice) -> Result<(), ServiceError> {
        self.delivered
            .lock()
            .map_err(|e| ServiceError::Internal(anyhow::anyhow!("Mock delivery mutex poisoned: {}", e)))?
            .push(notice.clone());
        Ok(())
    }
}
