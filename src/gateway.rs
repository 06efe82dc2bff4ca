//! Payment gateway collaborator. Checkout sessions and refunds are delegated;
//! the engine only records their outcomes.

use async_trait::async_trait;
use thiserror::Error;
use ulid::Ulid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutRequest {
    pub booking_id: Ulid,
    /// Minor currency units.
    pub amount: u64,
    pub description: String,
    pub customer_email: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutSession {
    pub url: String,
    /// Opaque gateway reference; echoed back on payment confirmation.
    pub reference: String,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("gateway unavailable: {0}")]
    Unavailable(String),
    #[error("gateway rejected request: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_checkout(&self, request: &CheckoutRequest) -> Result<CheckoutSession, GatewayError>;

    /// Must be idempotent per `booking_id`; callers retry until it succeeds.
    async fn refund(
        &self,
        booking_id: Ulid,
        amount: u64,
        payment_ref: Option<&str>,
    ) -> Result<(), GatewayError>;
}

/// Hands out links to an externally hosted checkout page. It cannot move
/// money back, so refunds stay pending until an admin records them.
#[derive(Debug, Clone)]
pub struct HostedCheckout {
    base_url: String,
}

impl HostedCheckout {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl PaymentGateway for HostedCheckout {
    async fn create_checkout(&self, request: &CheckoutRequest) -> Result<CheckoutSession, GatewayError> {
        if request.amount == 0 {
            return Err(GatewayError::Rejected("nothing to pay".into()));
        }
        let reference = format!("chk_{}", request.booking_id);
        Ok(CheckoutSession {
            url: format!(
                "{}/{}?amount={}",
                self.base_url, request.booking_id, request.amount
            ),
            reference,
        })
    }

    async fn refund(
        &self,
        booking_id: Ulid,
        amount: u64,
        payment_ref: Option<&str>,
    ) -> Result<(), GatewayError> {
        tracing::info!(%booking_id, amount, payment_ref, "refund awaits operator settlement");
        Err(GatewayError::Unavailable("refunds are settled by an operator".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hosted_checkout_builds_link() {
        let gw = HostedCheckout::new("https://pay.example.com/checkout/");
        let booking_id = Ulid::new();
        let session = gw
            .create_checkout(&CheckoutRequest {
                booking_id,
                amount: 12_500,
                description: "Old town walk".into(),
                customer_email: "a@example.com".into(),
            })
            .await
            .unwrap();
        assert_eq!(
            session.url,
            format!("https://pay.example.com/checkout/{booking_id}?amount=12500")
        );
        assert_eq!(session.reference, format!("chk_{booking_id}"));
    }

    #[tokio::test]
    async fn refunds_are_left_to_an_operator() {
        let gw = HostedCheckout::new("https://pay.example.com");
        let result = gw.refund(Ulid::new(), 4_000, Some("chk_1")).await;
        assert!(matches!(result, Err(GatewayError::Unavailable(_))));
    }

    #[tokio::test]
    async fn zero_amount_rejected() {
        let gw = HostedCheckout::new("https://pay.example.com");
        let result = gw
            .create_checkout(&CheckoutRequest {
                booking_id: Ulid::new(),
                amount: 0,
                description: String::new(),
                customer_email: String::new(),
            })
            .await;
        assert!(matches!(result, Err(GatewayError::Rejected(_))));
    }
}
