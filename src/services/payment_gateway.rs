//! Boundary to the external payment processor.
//!
//! The core only relies on two things: a payment session can be opened for a
//! reserved booking, and callbacks can be authenticated. Everything else about
//! the processor stays behind [`PaymentGateway`].

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::config::GatewayConfig;
use crate::error::BookingError;
use crate::models::Money;
use crate::services::signature;

#[derive(thiserror::Error, Debug)]
pub enum GatewayError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Gateway API error: {status} - {message}")]
    ApiError { status: StatusCode, message: String },

    #[error("Payment rejected by gateway: {0}")]
    Rejected(String),

    #[error("Invalid gateway configuration: {0}")]
    InvalidConfig(String),
}

impl From<GatewayError> for BookingError {
    fn from(e: GatewayError) -> Self {
        BookingError::Gateway(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentOutcome {
    Success,
    Failure,
}

impl PaymentOutcome {
    /// Processor status strings: only `"success"` counts as paid.
    pub fn from_status(status: &str) -> Self {
        if status.eq_ignore_ascii_case("success") {
            PaymentOutcome::Success
        } else {
            PaymentOutcome::Failure
        }
    }
}

#[derive(Debug, Clone)]
pub struct PaymentRequest {
    pub booking_id: Uuid,
    pub consumer_id: Uuid,
    pub external_ref: String,
    pub amount: Money,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentSession {
    pub external_ref: String,
    pub payment_url: String,
    pub simulated: bool,
}

/// Form body posted by the processor to the callback URL
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentCallback {
    #[serde(rename = "merchant_oid")]
    pub external_ref: String,
    pub status: String,
    /// Amount charged, in minor units
    pub total_amount: i64,
    #[serde(default)]
    pub hash: String,
}

impl PaymentCallback {
    pub fn outcome(&self) -> PaymentOutcome {
        PaymentOutcome::from_status(&self.status)
    }

    pub fn amount(&self) -> Money {
        Money::from_minor(self.total_amount)
    }

    fn signed_payload(&self, salt: &str) -> String {
        format!(
            "{}{}{}{}",
            self.external_ref, salt, self.status, self.total_amount
        )
    }
}

/// Merchant order reference: alphanumeric, unique per payment attempt.
pub fn merchant_order_ref(booking_id: Uuid) -> String {
    let nonce = Uuid::new_v4().simple().to_string();
    format!("{}{}", booking_id.simple(), &nonce[..8])
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn initiate_payment(&self, request: &PaymentRequest) -> Result<PaymentSession, GatewayError>;

    /// Authenticates a callback before it is allowed to move booking state.
    fn verify_callback(&self, callback: &PaymentCallback) -> bool;
}

/// Gateway used when no processor is configured. Accepts every callback.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimulatedGateway;

#[async_trait]
impl PaymentGateway for SimulatedGateway {
    async fn initiate_payment(&self, request: &PaymentRequest) -> Result<PaymentSession, GatewayError> {
        tracing::info!(
            booking_id = %request.booking_id,
            external_ref = %request.external_ref,
            amount = %request.amount,
            "Simulated payment session opened"
        );

        Ok(PaymentSession {
            external_ref: request.external_ref.clone(),
            payment_url: format!("/api/payments/simulate/{}", request.external_ref),
            simulated: true,
        })
    }

    fn verify_callback(&self, _callback: &PaymentCallback) -> bool {
        true
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    status: String,
    token: Option<String>,
    reason: Option<String>,
}

/// Hosted checkout processor: a token is requested server-side and the consumer
/// is sent to the processor's payment page; the result arrives as a signed callback.
#[derive(Clone)]
pub struct HostedCheckoutGateway {
    client: Client,
    api_url: Url,
    merchant_id: String,
    merchant_key: Secret<String>,
    merchant_salt: Secret<String>,
    test_mode: bool,
}

impl HostedCheckoutGateway {
    pub fn new(config: &GatewayConfig) -> Result<Self, GatewayError> {
        let mut api_url = Url::parse(&config.api_url)
            .map_err(|e| GatewayError::InvalidConfig(format!("gateway_api_url: {}", e)))?;

        // Url::join drops the last path segment unless it ends with a slash
        if !api_url.path().ends_with('/') {
            let path = format!("{}/", api_url.path());
            api_url.set_path(&path);
        }

        Ok(Self {
            client: Client::new(),
            api_url,
            merchant_id: config.merchant_id.clone(),
            merchant_key: config.merchant_key.clone(),
            merchant_salt: config.merchant_salt.clone(),
            test_mode: config.test_mode,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, GatewayError> {
        self.api_url
            .join(path)
            .map_err(|e| GatewayError::InvalidConfig(e.to_string()))
    }

    fn request_token(&self, request: &PaymentRequest) -> String {
        let payload = format!(
            "{}{}{}{}{}",
            self.merchant_id,
            request.external_ref,
            request.amount.minor(),
            u8::from(self.test_mode),
            self.merchant_salt.expose_secret()
        );
        signature::sign(&payload, self.merchant_key.expose_secret().as_bytes())
    }
}

#[async_trait]
impl PaymentGateway for HostedCheckoutGateway {
    #[tracing::instrument(skip(self, request), fields(booking_id = %request.booking_id, external_ref = %request.external_ref))]
    async fn initiate_payment(&self, request: &PaymentRequest) -> Result<PaymentSession, GatewayError> {
        let url = self.endpoint("get-token")?;
        let amount = request.amount.minor().to_string();
        let test_mode = u8::from(self.test_mode).to_string();
        let consumer = request.consumer_id.to_string();
        let token = self.request_token(request);

        let form = [
            ("merchant_id", self.merchant_id.as_str()),
            ("merchant_oid", request.external_ref.as_str()),
            ("payment_amount", amount.as_str()),
            ("user_id", consumer.as_str()),
            ("description", request.description.as_str()),
            ("test_mode", test_mode.as_str()),
            ("merchant_token", token.as_str()),
        ];

        let response = self.client.post(url).form(&form).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            tracing::error!(status = %status, error = %error_text, "Payment token request failed");
            return Err(GatewayError::ApiError {
                status,
                message: error_text,
            });
        }

        let body: TokenResponse = response.json().await.map_err(|e| GatewayError::ApiError {
            status: StatusCode::BAD_GATEWAY,
            message: format!("Failed to parse token response: {}", e),
        })?;

        let token = match (body.status.as_str(), body.token) {
            ("success", Some(token)) => token,
            _ => {
                let reason = body.reason.unwrap_or_else(|| "no reason given".to_string());
                tracing::warn!(%reason, "Gateway refused to open a payment session");
                return Err(GatewayError::Rejected(reason));
            }
        };

        let payment_url = self.endpoint(&format!("guard/{}", token))?;

        tracing::info!("Payment session opened");

        Ok(PaymentSession {
            external_ref: request.external_ref.clone(),
            payment_url: payment_url.to_string(),
            simulated: false,
        })
    }

    fn verify_callback(&self, callback: &PaymentCallback) -> bool {
        let payload = callback.signed_payload(self.merchant_salt.expose_secret());
        signature::verify(
            &payload,
            &callback.hash,
            self.merchant_key.expose_secret().as_bytes(),
        )
    }
}
