// Payment provider gateway: one contract over three backends, selected per
// request from the live configuration. Dispatch is a closed enum; handler
// code never inspects provider strings.

pub mod errors;
pub mod simulation;
pub mod square;
pub mod stripe;

use reqwest::Client;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, warn};

use crate::purchase::metadata::PaymentMetadata;
use crate::settings::{ActiveProvider, ProviderConfigStore};
use errors::ProviderApiError;
use simulation::SimulationGateway;
use square::SquareClient;
use stripe::StripeClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleStatus {
    Succeeded,
    Pending,
    Failed,
}

/// Normalized settlement result across backends.
#[derive(Debug, Clone)]
pub struct PaymentResult {
    pub status: SettleStatus,
    pub payment_id: String,
    pub order_id: Option<String>,
}

/// Handle returned from intent creation; `client_secret` is only present for
/// the intent-based backend, where the client completes payment itself.
#[derive(Debug, Clone)]
pub struct IntentHandle {
    pub provider: &'static str,
    pub client_secret: Option<String>,
    pub payment_id: Option<String>,
}

pub enum Gateway {
    Stripe(StripeClient),
    Square(SquareClient),
    Simulation(SimulationGateway),
}

impl Gateway {
    pub fn name(&self) -> &'static str {
        match self {
            Gateway::Stripe(_) => "stripe",
            Gateway::Square(_) => "square",
            Gateway::Simulation(_) => "simulation",
        }
    }

    /// True when `settle` can be called server-side with a source token.
    pub fn settles_server_side(&self) -> bool {
        !matches!(self, Gateway::Stripe(_))
    }

    pub async fn create_intent(
        &self,
        amount_cents: i64,
        meta: &PaymentMetadata,
        donor_email: Option<&str>,
    ) -> Result<IntentHandle, ProviderApiError> {
        match self {
            Gateway::Stripe(client) => {
                let intent = client
                    .create_payment_intent(amount_cents, donor_email, &meta.to_map())
                    .await?;
                Ok(IntentHandle {
                    provider: "stripe",
                    client_secret: intent.client_secret,
                    payment_id: Some(intent.id),
                })
            }
            // Token-based flow needs no server call before tokenization.
            Gateway::Square(_) => Ok(IntentHandle {
                provider: "square",
                client_secret: None,
                payment_id: None,
            }),
            Gateway::Simulation(sim) => Ok(sim.create_intent(amount_cents)),
        }
    }

    pub async fn settle(
        &self,
        source_token: &str,
        idempotency_key: &str,
        amount_cents: i64,
        meta: &PaymentMetadata,
    ) -> Result<PaymentResult, ProviderApiError> {
        match self {
            Gateway::Stripe(_) => Err(ProviderApiError::Precondition(
                "intent-based provider settles client-side",
            )),
            Gateway::Square(client) => {
                let reference = meta
                    .encode()
                    .map_err(|e| ProviderApiError::Decode(e.to_string()))?;
                let payment = client
                    .create_payment(
                        source_token,
                        idempotency_key,
                        amount_cents,
                        Some(&reference),
                        meta.donor_email.as_deref(),
                    )
                    .await?;
                Ok(PaymentResult {
                    status: settle_status(&payment.status),
                    payment_id: payment.id,
                    order_id: payment.order_id,
                })
            }
            Gateway::Simulation(sim) => Ok(sim.settle(amount_cents)),
        }
    }
}

/// Map the token-based provider's payment status strings.
pub fn settle_status(status: &str) -> SettleStatus {
    match status {
        "COMPLETED" => SettleStatus::Succeeded,
        "APPROVED" | "PENDING" => SettleStatus::Pending,
        _ => SettleStatus::Failed,
    }
}

/// Resolves the gateway for each request from the live provider settings.
/// Missing or blank credentials silently substitute the simulation backend;
/// the purchase flow must never hard-fail on configuration.
///
/// HTTP clients are cached per timeout value, so a `replace()` that changes a
/// provider's timeout takes effect on the next request like a credential
/// change does.
#[derive(Clone)]
pub struct GatewaySelector {
    default_http: Client,
    clients: Arc<RwLock<HashMap<u64, Client>>>,
    config: Arc<ProviderConfigStore>,
}

impl GatewaySelector {
    pub fn new(config: Arc<ProviderConfigStore>) -> Result<Self, ProviderApiError> {
        let default_http = Client::builder()
            .use_rustls_tls()
            .timeout(Duration::from_millis(15_000))
            .build()
            .map_err(|e| ProviderApiError::Http(e.to_string()))?;
        Ok(Self {
            default_http,
            clients: Arc::new(RwLock::new(HashMap::new())),
            config,
        })
    }

    fn client_for(&self, timeout_ms: u64) -> Client {
        let timeout_ms = timeout_ms.max(1_000);
        if let Some(client) = self
            .clients
            .read()
            .ok()
            .and_then(|m| m.get(&timeout_ms).cloned())
        {
            return client;
        }
        match Client::builder()
            .use_rustls_tls()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
        {
            Ok(client) => {
                if let Ok(mut map) = self.clients.write() {
                    map.insert(timeout_ms, client.clone());
                }
                client
            }
            Err(e) => {
                warn!(error = %e, timeout_ms, "client build failed; using default client");
                self.default_http.clone()
            }
        }
    }

    pub fn gateway(&self) -> Gateway {
        let cfg = self.config.current();
        match cfg.active {
            ActiveProvider::Stripe if cfg.stripe.is_configured() => Gateway::Stripe(
                StripeClient::new(self.client_for(cfg.stripe.timeout_ms), cfg.stripe.secret_key),
            ),
            ActiveProvider::Square if cfg.square.is_configured() => {
                Gateway::Square(SquareClient::new(
                    self.client_for(cfg.square.timeout_ms),
                    cfg.square.access_token,
                    cfg.square.location_id,
                    cfg.square.sandbox,
                ))
            }
            ActiveProvider::Simulation => Gateway::Simulation(SimulationGateway),
            misconfigured => {
                debug!(
                    active = ?misconfigured,
                    "active provider lacks credentials; using simulation"
                );
                Gateway::Simulation(SimulationGateway)
            }
        }
    }

    #[cfg(test)]
    fn cached_client_count(&self) -> usize {
        self.clients.read().map(|m| m.len()).unwrap_or(0)
    }
}
