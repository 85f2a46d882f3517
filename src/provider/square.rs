// Token-based provider (Square-style): the client exchanges card details for
// a one-time source token, the server submits it, and a webhook signed over
// the notification URL plus body is the authoritative confirmation.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use hmac::{Hmac, Mac};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{debug, info, instrument};

use crate::provider::errors::{ProviderApiError, ProviderErrorKind, WebhookError};

const PRODUCTION_API_BASE: &str = "https://connect.squareup.com";
const SANDBOX_API_BASE: &str = "https://connect.squareupsandbox.com";

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Money {
    pub amount: i64,
    pub currency: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SquarePayment {
    pub id: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    pub amount_money: Money,
    /// Carries the encoded purchase metadata; set at payment creation and
    /// echoed back on every webhook.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference_id: Option<String>,
}

/// Webhook event envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SquareEvent {
    pub event_id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: SquareEventData,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SquareEventData {
    pub object: SquareEventObject,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SquareEventObject {
    pub payment: SquarePayment,
}

#[derive(Debug, Serialize)]
struct CreatePaymentRequest<'a> {
    source_id: &'a str,
    idempotency_key: &'a str,
    amount_money: Money,
    location_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reference_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    buyer_email_address: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct CreatePaymentResponse {
    payment: SquarePayment,
}

// Error envelope: { "errors": [{ "category", "code", "detail" }] }
#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    errors: Vec<ErrorBody>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    category: String,
    #[serde(default)]
    code: String,
    #[serde(default)]
    detail: Option<String>,
}

#[derive(Clone)]
pub struct SquareClient {
    http: Client,
    access_token: String,
    location_id: String,
    base_url: &'static str,
}

impl SquareClient {
    pub fn new(http: Client, access_token: String, location_id: String, sandbox: bool) -> Self {
        Self {
            http,
            access_token,
            location_id,
            base_url: if sandbox {
                SANDBOX_API_BASE
            } else {
                PRODUCTION_API_BASE
            },
        }
    }

    fn map_error(status: StatusCode, body: &str) -> ProviderApiError {
        if let Ok(env) = serde_json::from_str::<ErrorEnvelope>(body) {
            if let Some(first) = env.errors.into_iter().next() {
                let kind = if first.category == "PAYMENT_METHOD_ERROR" {
                    ProviderErrorKind::CardDeclined
                } else {
                    ProviderErrorKind::from(first.code.as_str())
                };
                return ProviderApiError::Api {
                    kind,
                    message: first.detail,
                    code: Some(first.code),
                    status: Some(status.as_u16()),
                };
            }
        }
        if status.is_server_error() {
            ProviderApiError::Transient(format!("status={}", status.as_u16()))
        } else {
            ProviderApiError::Http(format!("status={} body={}", status.as_u16(), body))
        }
    }

    // POST /v2/payments
    #[instrument(skip(self, source_id, reference_id), fields(method = "POST", path = "/v2/payments"))]
    pub async fn create_payment(
        &self,
        source_id: &str,
        idempotency_key: &str,
        amount_cents: i64,
        reference_id: Option<&str>,
        buyer_email: Option<&str>,
    ) -> Result<SquarePayment, ProviderApiError> {
        if amount_cents <= 0 {
            return Err(ProviderApiError::Precondition(
                "amount must be positive cents",
            ));
        }

        let body = CreatePaymentRequest {
            source_id,
            idempotency_key,
            amount_money: Money {
                amount: amount_cents,
                currency: "USD".to_string(),
            },
            location_id: &self.location_id,
            reference_id,
            buyer_email_address: buyer_email,
        };

        info!(
            target: "square",
            amount_cents = amount_cents,
            idempotency_key = %idempotency_key,
            "creating payment"
        );

        let url = format!("{}/v2/payments", self.base_url);
        let resp = self
            .http
            .post(url)
            .bearer_auth(&self.access_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderApiError::Http(e.to_string()))?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| ProviderApiError::Decode(e.to_string()))?;
        if status.is_success() {
            let parsed: CreatePaymentResponse = serde_json::from_str(&text)
                .map_err(|e| ProviderApiError::Decode(e.to_string()))?;
            Ok(parsed.payment)
        } else {
            Err(Self::map_error(status, &text))
        }
    }
}

/// Verify the vendor signature: base64(HMAC-SHA256(key, notification_url + body))
/// in the `x-square-hmacsha256-signature` header. Constant-time comparison.
pub fn verify_signature(
    payload: &[u8],
    headers: &http::HeaderMap,
    signature_key: &str,
    notification_url: &str,
) -> Result<(), WebhookError> {
    if signature_key.is_empty() {
        return Err(WebhookError::MissingSecret);
    }

    let provided = headers
        .get("x-square-hmacsha256-signature")
        .ok_or(WebhookError::MissingSignature)?
        .to_str()
        .map_err(|e| WebhookError::InvalidSignature(format!("invalid header encoding: {}", e)))?;

    let mut mac = HmacSha256::new_from_slice(signature_key.as_bytes())
        .map_err(|e| WebhookError::InvalidSignature(format!("hmac init error: {}", e)))?;
    mac.update(notification_url.as_bytes());
    mac.update(payload);
    let expected = STANDARD.encode(mac.finalize().into_bytes());

    let valid = expected.as_bytes().len() == provided.as_bytes().len()
        && expected
            .as_bytes()
            .iter()
            .zip(provided.as_bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0;
    if !valid {
        return Err(WebhookError::InvalidSignature(
            "signature mismatch".to_string(),
        ));
    }

    debug!("webhook signature verified");
    Ok(())
}
