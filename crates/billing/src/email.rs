//! Billing notification mail
//!
//! Sends through an HTTP mail API. Delivery is always a secondary concern:
//! callers log failures and carry on. Transport errors and 5xx are retried
//! with linear backoff; any other status fails immediately.

use std::time::Duration;

use serde::Serialize;
use tokio_retry::RetryIf;

use crate::error::{BillingError, BillingResult};

#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub api_url: String,
    pub api_key: String,
    pub from_address: String,
    pub from_name: String,
    /// Per-request timeout
    pub timeout: Duration,
    /// Delay before the first retry; each later retry waits one more step
    pub retry_step: Duration,
    pub max_attempts: usize,
}

impl EmailConfig {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

    pub fn new(
        api_url: impl Into<String>,
        api_key: impl Into<String>,
        from: impl Into<String>,
    ) -> Self {
        Self {
            api_url: api_url.into(),
            api_key: api_key.into(),
            from_address: from.into(),
            from_name: "Billing".to_string(),
            timeout: Self::DEFAULT_TIMEOUT,
            retry_step: Duration::from_secs(1),
            max_attempts: 3,
        }
    }

    /// `None` unless `MAIL_API_URL`, `MAIL_API_KEY` and `MAIL_FROM` are all set
    pub fn from_env() -> Option<Self> {
        let api_url = std::env::var("MAIL_API_URL").ok().filter(|v| !v.is_empty())?;
        let api_key = std::env::var("MAIL_API_KEY").ok().filter(|v| !v.is_empty())?;
        let from = std::env::var("MAIL_FROM").ok().filter(|v| !v.is_empty())?;

        let mut config = Self::new(api_url, api_key, from);
        if let Ok(name) = std::env::var("MAIL_FROM_NAME") {
            config.from_name = name;
        }
        if let Some(secs) = std::env::var("MAIL_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
        {
            config.timeout = Duration::from_secs(secs);
        }
        Some(config)
    }

    fn backoff(&self) -> impl Iterator<Item = Duration> {
        let step = self.retry_step;
        (1..self.max_attempts.max(1) as u32).map(move |n| step * n)
    }
}

#[derive(Serialize)]
struct Address<'a> {
    email: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
}

#[derive(Serialize)]
struct Message<'a> {
    from: Address<'a>,
    to: [Address<'a>; 1],
    subject: &'a str,
    text: &'a str,
}

enum SendFailure {
    Retryable(String),
    Fatal(String),
}

impl SendFailure {
    fn message(self) -> String {
        match self {
            SendFailure::Retryable(m) | SendFailure::Fatal(m) => m,
        }
    }
}

#[derive(Clone)]
pub struct BillingEmailService {
    config: Option<EmailConfig>,
    http: reqwest::Client,
}

impl BillingEmailService {
    pub fn new(config: Option<EmailConfig>) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    pub fn from_env() -> Self {
        let config = EmailConfig::from_env();
        if config.is_none() {
            tracing::info!("Mail API not configured, billing notifications disabled");
        }
        Self::new(config)
    }

    pub fn disabled() -> Self {
        Self::new(None)
    }

    pub fn is_enabled(&self) -> bool {
        self.config.is_some()
    }

    /// Send a plain-text message. A no-op when mail is not configured.
    pub async fn send(&self, to: &str, subject: &str, text: &str) -> BillingResult<()> {
        let Some(config) = &self.config else {
            tracing::debug!(subject = %subject, "Mail disabled, skipping notification");
            return Ok(());
        };

        let message = Message {
            from: Address {
                email: &config.from_address,
                name: Some(&config.from_name),
            },
            to: [Address {
                email: to,
                name: None,
            }],
            subject,
            text,
        };

        let result = RetryIf::spawn(
            config.backoff(),
            || self.attempt(config, &message),
            |failure: &SendFailure| {
                let retry = matches!(failure, SendFailure::Retryable(_));
                if retry {
                    tracing::warn!(subject = %subject, "Mail delivery failed, retrying");
                }
                retry
            },
        )
        .await;

        match result {
            Ok(()) => {
                tracing::info!(subject = %subject, "Sent billing notification");
                Ok(())
            }
            Err(failure) => Err(BillingError::Email(failure.message())),
        }
    }

    async fn attempt(
        &self,
        config: &EmailConfig,
        message: &Message<'_>,
    ) -> Result<(), SendFailure> {
        let response = self
            .http
            .post(&config.api_url)
            .bearer_auth(&config.api_key)
            .timeout(config.timeout)
            .json(message)
            .send()
            .await
            .map_err(|e| SendFailure::Retryable(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let detail = format!("mail API returned {status}");
        if status.is_server_error() {
            Err(SendFailure::Retryable(detail))
        } else {
            Err(SendFailure::Fatal(detail))
        }
    }

    pub async fn send_subscription_activated(
        &self,
        to: &str,
        tenant_name: &str,
        plan_name: &str,
    ) -> BillingResult<()> {
        self.send(
            to,
            &format!("Your {plan_name} subscription is active"),
            &format!(
                "Hi {tenant_name},\n\nYour subscription to the {plan_name} plan is now active. \
                 Your new limits apply immediately."
            ),
        )
        .await
    }

    pub async fn send_subscription_past_due(
        &self,
        to: &str,
        tenant_name: &str,
    ) -> BillingResult<()> {
        self.send(
            to,
            "Action needed: your subscription payment is past due",
            &format!(
                "Hi {tenant_name},\n\nWe could not collect the latest payment for your \
                 subscription. Please update your payment method to keep your plan."
            ),
        )
        .await
    }

    pub async fn send_subscription_canceled(
        &self,
        to: &str,
        tenant_name: &str,
    ) -> BillingResult<()> {
        self.send(
            to,
            "Your subscription has been canceled",
            &format!(
                "Hi {tenant_name},\n\nYour subscription has ended and your workspace is back \
                 on the free plan."
            ),
        )
        .await
    }

    pub async fn send_payment_receipt(
        &self,
        to: &str,
        tenant_name: &str,
        amount: &str,
    ) -> BillingResult<()> {
        self.send(
            to,
            "Payment received",
            &format!("Hi {tenant_name},\n\nWe received your payment of {amount}. Thank you!"),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(url: String) -> EmailConfig {
        EmailConfig {
            retry_step: Duration::from_millis(5),
            ..EmailConfig::new(url, "key_test", "billing@example.test")
        }
    }

    #[tokio::test]
    async fn disabled_service_is_a_no_op() {
        let email = BillingEmailService::disabled();
        assert!(!email.is_enabled());
        assert!(email.send("a@b.test", "hi", "body").await.is_ok());
    }

    #[tokio::test]
    async fn delivers_with_bearer_auth() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/send")
            .match_header("authorization", "Bearer key_test")
            .with_status(202)
            .expect(1)
            .create_async()
            .await;

        let email = BillingEmailService::new(Some(config(format!("{}/send", server.url()))));
        email
            .send_payment_receipt("owner@acme.test", "Acme", "IDR 150000.00")
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn server_errors_are_retried_up_to_the_attempt_limit() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/send")
            .with_status(503)
            .expect(3)
            .create_async()
            .await;

        let email = BillingEmailService::new(Some(config(format!("{}/send", server.url()))));
        let err = email.send("a@b.test", "hi", "body").await.unwrap_err();
        assert!(matches!(err, BillingError::Email(_)));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn rate_limited_requests_are_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/send")
            .with_status(429)
            .expect(1)
            .create_async()
            .await;

        let email = BillingEmailService::new(Some(config(format!("{}/send", server.url()))));
        let err = email.send("a@b.test", "hi", "body").await.unwrap_err();
        assert!(matches!(err, BillingError::Email(_)));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/send")
            .with_status(400)
            .expect(1)
            .create_async()
            .await;

        let email = BillingEmailService::new(Some(config(format!("{}/send", server.url()))));
        assert!(email.send("a@b.test", "hi", "body").await.is_err());
        mock.assert_async().await;
    }

    #[test]
    fn backoff_is_linear() {
        let delays: Vec<_> = EmailConfig::new("u", "k", "f").backoff().collect();
        assert_eq!(delays, vec![Duration::from_secs(1), Duration::from_secs(2)]);
    }
}
