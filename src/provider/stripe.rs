// Intent-based provider (Stripe-style): payment intents created server-side,
// settled client-side, confirmed by signed webhook.

use hmac::{Hmac, Mac};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use std::future::Future;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, instrument, warn};

use crate::provider::errors::{is_transient, ProviderApiError, ProviderErrorKind, WebhookError};

const STRIPE_API_BASE: &str = "https://api.stripe.com";

type HmacSha256 = Hmac<Sha256>;

/// Payment intent shape, as returned by the REST API and carried inside
/// webhook events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StripePaymentIntent {
    pub id: String,
    pub status: String,
    pub amount: i64,
    pub currency: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Webhook event envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StripeEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: StripeEventData,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StripeEventData {
    pub object: serde_json::Value,
}

// REST error envelope: { error: { type, code, message } }
#[derive(Debug, Clone, Deserialize)]
struct StripeErrorEnvelope {
    error: StripeErrorBody,
}

#[derive(Debug, Clone, Deserialize)]
struct StripeErrorBody {
    #[serde(rename = "type")]
    type_: String,
    code: Option<String>,
    message: Option<String>,
}

#[derive(Clone)]
pub struct StripeClient {
    http: Client,
    secret_key: String,
    max_retries: u32,
    base_delay_ms: u64,
    max_delay_ms: u64,
}

impl StripeClient {
    pub fn new(http: Client, secret_key: String) -> Self {
        Self {
            http,
            secret_key,
            max_retries: 3,
            base_delay_ms: 100,
            max_delay_ms: 2_000,
        }
    }

    fn map_error(status: StatusCode, body: &str) -> ProviderApiError {
        if let Ok(env) = serde_json::from_str::<StripeErrorEnvelope>(body) {
            ProviderApiError::Api {
                kind: ProviderErrorKind::from(env.error.type_.as_str()),
                message: env.error.message,
                code: env.error.code,
                status: Some(status.as_u16()),
            }
        } else {
            ProviderApiError::Http(format!("status={} body={}", status.as_u16(), body))
        }
    }

    async fn with_retries<F, Fut, T>(&self, desc: &str, mut op: F) -> Result<T, ProviderApiError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderApiError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    let (http_status, kind) = match &e {
                        ProviderApiError::Api { status, kind, .. } => (*status, Some(*kind)),
                        ProviderApiError::Http(_) | ProviderApiError::Transient(_) => {
                            (Some(503), None)
                        }
                        _ => (None, None),
                    };
                    if !is_transient(http_status, kind) || attempt >= self.max_retries {
                        return Err(e);
                    }

                    // Exponential backoff with full jitter.
                    let exp = self.base_delay_ms.saturating_mul(1u64 << attempt.min(20));
                    let cap = exp.min(self.max_delay_ms.max(self.base_delay_ms));
                    let mut rng = SmallRng::from_entropy();
                    let delay_ms = if cap > self.base_delay_ms {
                        rng.gen_range(self.base_delay_ms..=cap)
                    } else {
                        self.base_delay_ms
                    };

                    warn!(
                        target: "stripe",
                        desc = %desc,
                        attempt = attempt + 1,
                        http_status = ?http_status,
                        next_delay_ms = delay_ms,
                        "retrying transient provider error"
                    );
                    tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
                    attempt += 1;
                }
            }
        }
    }

    // POST /v1/payment_intents (application/x-www-form-urlencoded)
    #[instrument(skip(self, metadata), fields(method = "POST", path = "/v1/payment_intents"))]
    pub async fn create_payment_intent(
        &self,
        amount_cents: i64,
        receipt_email: Option<&str>,
        metadata: &HashMap<String, String>,
    ) -> Result<StripePaymentIntent, ProviderApiError> {
        if amount_cents <= 0 {
            return Err(ProviderApiError::Precondition(
                "amount must be positive cents",
            ));
        }

        let mut form: Vec<(String, String)> = vec![
            ("amount".into(), amount_cents.to_string()),
            ("currency".into(), "usd".into()),
            ("automatic_payment_methods[enabled]".into(), "true".into()),
        ];
        if let Some(email) = receipt_email {
            form.push(("receipt_email".into(), email.to_string()));
        }
        for (k, v) in metadata {
            form.push((format!("metadata[{}]", k), v.clone()));
        }

        info!(
            target: "stripe",
            amount_cents = amount_cents,
            "creating payment intent"
        );

        let req_builder = || {
            let url = format!("{}/v1/payment_intents", STRIPE_API_BASE);
            let req = self.http.post(url).form(&form).bearer_auth(&self.secret_key);
            async move {
                let resp = req
                    .send()
                    .await
                    .map_err(|e| ProviderApiError::Http(e.to_string()))?;
                let status = resp.status();
                let text = resp
                    .text()
                    .await
                    .map_err(|e| ProviderApiError::Decode(e.to_string()))?;
                if status.is_success() {
                    serde_json::from_str::<StripePaymentIntent>(&text)
                        .map_err(|e| ProviderApiError::Decode(e.to_string()))
                } else {
                    Err(Self::map_error(status, &text))
                }
            }
        };
        self.with_retries("create_payment_intent", req_builder).await
    }
}

/// Verify the webhook signature header: `t=<unix>,v1=<hex hmac>[,v1=...]`,
/// HMAC-SHA256 over `"{t}.{payload}"`. Constant-time comparison.
pub fn verify_signature(
    payload: &[u8],
    headers: &http::HeaderMap,
    webhook_secret: &str,
    tolerance_seconds: i64,
) -> Result<(), WebhookError> {
    if webhook_secret.is_empty() {
        return Err(WebhookError::MissingSecret);
    }

    let signature_header = headers
        .get("stripe-signature")
        .ok_or(WebhookError::MissingSignature)?
        .to_str()
        .map_err(|e| WebhookError::InvalidSignature(format!("invalid header encoding: {}", e)))?;

    let mut timestamp: Option<i64> = None;
    let mut signatures: Vec<&str> = Vec::new();
    for part in signature_header.split(',') {
        let kv: Vec<&str> = part.splitn(2, '=').collect();
        if kv.len() != 2 {
            continue;
        }
        match kv[0] {
            "t" => timestamp = kv[1].parse().ok(),
            "v1" => signatures.push(kv[1]),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        WebhookError::InvalidSignature("missing timestamp in signature header".to_string())
    })?;
    if signatures.is_empty() {
        return Err(WebhookError::InvalidSignature(
            "no v1 signature found".to_string(),
        ));
    }

    let current_time = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| WebhookError::InvalidSignature(format!("system time error: {}", e)))?
        .as_secs() as i64;
    let time_diff = (current_time - timestamp).abs();
    if time_diff > tolerance_seconds {
        return Err(WebhookError::TimestampTolerance(format!(
            "timestamp {} differs from current time {} by {}s (tolerance {})",
            timestamp, current_time, time_diff, tolerance_seconds
        )));
    }

    let signed_payload = format!("{}.{}", timestamp, String::from_utf8_lossy(payload));
    let mut mac = HmacSha256::new_from_slice(webhook_secret.as_bytes())
        .map_err(|e| WebhookError::InvalidSignature(format!("hmac init error: {}", e)))?;
    mac.update(signed_payload.as_bytes());
    let expected = hex::encode(mac.finalize().into_bytes());

    let valid = signatures.iter().any(|sig| {
        expected.as_bytes().len() == sig.as_bytes().len()
            && expected
                .as_bytes()
                .iter()
                .zip(sig.as_bytes())
                .fold(0u8, |acc, (a, b)| acc | (a ^ b))
                == 0
    });
    if !valid {
        return Err(WebhookError::InvalidSignature(
            "signature mismatch".to_string(),
        ));
    }

    debug!(timestamp, time_diff, "webhook signature verified");
    Ok(())
}
