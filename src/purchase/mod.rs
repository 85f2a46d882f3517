//! Purchase orchestration: turns provider results and webhook events into
//! consistent inventory and ledger updates, exactly once.

pub mod metadata;

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::grid;
use crate::ledger::milestone_crossed;
use crate::notify::{dispatch_post_donation, AuditLog, DonationNotice, NotificationSink};
use crate::provider::errors::{ProviderApiError, WebhookError};
use crate::provider::{square, stripe, GatewaySelector, SettleStatus};
use crate::settings::ProviderConfigStore;
use crate::store::{
    new_id, Campaign, CancelReport, DonorInfo, LedgerDelta, ReconcileOutcome, Square, Store,
    StoreError,
};
use metadata::PaymentMetadata;

#[derive(Debug, Error)]
pub enum PurchaseError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("payment declined: {0}")]
    Declined(String),
    #[error("payment provider not configured: {0}")]
    ProviderNotConfigured(String),
    #[error("payment provider unavailable: {0}")]
    ProviderTransient(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for PurchaseError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::AlreadyPurchased(id) => {
                PurchaseError::Conflict(format!("square already sold: {}", id))
            }
            StoreError::MixedCampaigns => {
                PurchaseError::Conflict("squares belong to more than one campaign".to_string())
            }
            StoreError::SquareNotFound(id) => {
                PurchaseError::Validation(format!("unknown square: {}", id))
            }
            StoreError::EmptyBatch => {
                PurchaseError::Validation("at least one square id is required".to_string())
            }
            StoreError::Grid(g) => PurchaseError::Validation(g.to_string()),
            other => PurchaseError::Internal(other.to_string()),
        }
    }
}

fn map_provider_err(e: ProviderApiError) -> PurchaseError {
    if e.is_decline() {
        return PurchaseError::Declined(e.to_string());
    }
    match e {
        ProviderApiError::Transient(msg) | ProviderApiError::Http(msg) => {
            PurchaseError::ProviderTransient(msg)
        }
        other => PurchaseError::Internal(other.to_string()),
    }
}

#[derive(Debug, Clone)]
pub struct IntentOutcome {
    pub provider: &'static str,
    pub client_secret: Option<String>,
    pub amount_cents: i64,
    pub square_ids: Vec<String>,
    pub campaign_id: String,
}

#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    pub provider: &'static str,
    pub payment_id: String,
    pub status: SettleStatus,
    pub squares_processed: usize,
    pub total_cents: i64,
}

/// How a verified webhook was handled. Anything short of a signature or
/// parse failure is acknowledged so the processor stops redelivering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookAck {
    Processed,
    Ignored,
}

pub struct Orchestrator {
    store: Store,
    selector: GatewaySelector,
    config: Arc<ProviderConfigStore>,
    notifier: Arc<dyn NotificationSink>,
    audit: Arc<dyn AuditLog>,
}

impl Orchestrator {
    pub fn new(
        store: Store,
        config: Arc<ProviderConfigStore>,
        notifier: Arc<dyn NotificationSink>,
        audit: Arc<dyn AuditLog>,
    ) -> Result<Self, PurchaseError> {
        let selector = GatewaySelector::new(Arc::clone(&config))
            .map_err(|e| PurchaseError::Internal(e.to_string()))?;
        Ok(Self {
            store,
            selector,
            config,
            notifier,
            audit,
        })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    // ---- campaign setup ----

    pub fn create_campaign(
        &self,
        name: &str,
        goal_cents: i64,
        rows: u16,
        cols: u16,
        min_value_cents: i64,
        max_value_cents: i64,
    ) -> Result<(Campaign, Vec<Square>), PurchaseError> {
        if name.trim().is_empty() {
            return Err(PurchaseError::Validation("name is required".into()));
        }
        if goal_cents <= 0 || rows == 0 || cols == 0 {
            return Err(PurchaseError::Validation(
                "goal, rows and cols must be positive".into(),
            ));
        }
        let count = rows as usize * cols as usize;
        let values = grid::generate_values(count, min_value_cents, max_value_cents, goal_cents)
            .map_err(|e| PurchaseError::Validation(e.to_string()))?;

        let campaign = Campaign {
            id: new_id("camp"),
            name: name.trim().to_string(),
            goal_cents,
            total_raised_cents: 0,
            active: true,
            rows,
            cols,
            min_value_cents,
            max_value_cents,
        };
        let squares: Vec<Square> = values
            .into_iter()
            .enumerate()
            .map(|(i, value_cents)| Square {
                id: new_id("sq"),
                campaign_id: campaign.id.clone(),
                x: (i % cols as usize) as u16,
                y: (i / cols as usize) as u16,
                value_cents,
                purchased: false,
                donor_name: None,
                is_anonymous: false,
            })
            .collect();
        self.store.create_campaign(&campaign, &squares)?;
        info!(campaign_id = %campaign.id, squares = squares.len(), "campaign created");
        Ok((campaign, squares))
    }

    pub fn campaign_with_squares(
        &self,
        campaign_id: &str,
    ) -> Result<(Campaign, Vec<Square>), PurchaseError> {
        let campaign = self
            .store
            .campaign(campaign_id)?
            .ok_or_else(|| PurchaseError::Validation(format!("unknown campaign: {}", campaign_id)))?;
        let squares = self.store.squares_for_campaign(campaign_id)?;
        Ok((campaign, squares))
    }

    pub fn rerandomize(&self, campaign_id: &str) -> Result<usize, PurchaseError> {
        match self.store.rerandomize(campaign_id) {
            Ok(n) => Ok(n),
            Err(StoreError::CampaignNotFound(id)) => {
                Err(PurchaseError::Validation(format!("unknown campaign: {}", id)))
            }
            Err(e) => Err(e.into()),
        }
    }

    // ---- purchase flow ----

    #[instrument(skip(self))]
    pub async fn create_intent(
        &self,
        square_ids: &[String],
        donor_email: Option<&str>,
    ) -> Result<IntentOutcome, PurchaseError> {
        let batch = self.store.load_available_batch(square_ids)?;
        // The loaded batch is deduplicated; use its ids from here on so the
        // payment metadata never carries a square twice.
        let square_ids: Vec<String> = batch.iter().map(|s| s.id.clone()).collect();
        let campaign_id = batch[0].campaign_id.clone();
        let amount_cents: i64 = batch.iter().map(|s| s.value_cents).sum();

        let mut meta = PaymentMetadata::new(campaign_id.clone(), square_ids.clone());
        meta.donor_email = donor_email.map(str::to_string);

        let gateway = self.selector.gateway();
        let handle = gateway
            .create_intent(amount_cents, &meta, donor_email)
            .await
            .map_err(map_provider_err)?;

        info!(
            provider = handle.provider,
            campaign_id = %campaign_id,
            payment_id = ?handle.payment_id,
            amount_cents,
            squares = square_ids.len(),
            "payment intent created"
        );
        Ok(IntentOutcome {
            provider: handle.provider,
            client_secret: handle.client_secret,
            amount_cents,
            square_ids,
            campaign_id,
        })
    }

    #[instrument(skip(self, source_token, donor))]
    pub async fn process(
        &self,
        square_ids: &[String],
        source_token: &str,
        donor: DonorInfo,
    ) -> Result<ProcessOutcome, PurchaseError> {
        if source_token.is_empty() {
            return Err(PurchaseError::Validation("sourceId is required".into()));
        }
        let batch = self.store.load_available_batch(square_ids)?;
        let square_ids: Vec<String> = batch.iter().map(|s| s.id.clone()).collect();
        let campaign_id = batch[0].campaign_id.clone();
        let amount_cents: i64 = batch.iter().map(|s| s.value_cents).sum();

        let gateway = self.selector.gateway();
        if !gateway.settles_server_side() {
            return Err(PurchaseError::ProviderNotConfigured(format!(
                "active provider '{}' settles client-side; configure a token-based provider \
                 or use the intent flow",
                gateway.name()
            )));
        }

        let mut meta = PaymentMetadata::new(campaign_id.clone(), square_ids.clone());
        meta.donor_name = donor.name.clone();
        meta.donor_email = donor.email.clone();
        meta.is_anonymous = donor.is_anonymous;

        let idempotency_key = new_id("idem");
        let now = now_unix();
        let provider = gateway.name();

        let result = match gateway
            .settle(source_token, &idempotency_key, amount_cents, &meta)
            .await
        {
            Ok(r) => r,
            Err(e) => {
                if e.is_decline() {
                    let _ = self.store.record_failed_attempt(
                        &square_ids,
                        &donor,
                        provider,
                        &idempotency_key,
                        now,
                    );
                    self.audit_failed(provider, &idempotency_key, &square_ids, &e.to_string());
                }
                return Err(map_provider_err(e));
            }
        };

        match result.status {
            SettleStatus::Succeeded => {
                let delta = self.store.settle_purchase(
                    &square_ids,
                    &donor,
                    provider,
                    &result.payment_id,
                    result.order_id.as_deref(),
                    now,
                )?;
                self.announce(
                    provider,
                    &result.payment_id,
                    square_ids.to_vec(),
                    amount_cents,
                    donor,
                    &delta,
                );
                Ok(ProcessOutcome {
                    provider,
                    payment_id: result.payment_id,
                    status: SettleStatus::Succeeded,
                    squares_processed: square_ids.len(),
                    total_cents: amount_cents,
                })
            }
            SettleStatus::Pending => {
                // Webhook is authoritative; squares stay available for now.
                self.store.record_pending(
                    &square_ids,
                    &donor,
                    provider,
                    &result.payment_id,
                    result.order_id.as_deref(),
                    now,
                )?;
                info!(
                    provider,
                    payment_id = %result.payment_id,
                    "settlement pending; awaiting webhook confirmation"
                );
                Ok(ProcessOutcome {
                    provider,
                    payment_id: result.payment_id,
                    status: SettleStatus::Pending,
                    squares_processed: 0,
                    total_cents: amount_cents,
                })
            }
            SettleStatus::Failed => {
                let _ = self.store.record_failed_attempt(
                    &square_ids,
                    &donor,
                    provider,
                    &result.payment_id,
                    now,
                );
                self.audit_failed(provider, &result.payment_id, &square_ids, "payment failed");
                Err(PurchaseError::Declined(
                    "the payment was not completed".into(),
                ))
            }
        }
    }

    /// Best-effort compensating action for abandoned client-side flows.
    #[instrument(skip(self))]
    pub fn cancel(&self, square_ids: &[String], payment_id: Option<&str>) -> CancelReport {
        match self.store.cancel_squares(square_ids, payment_id, now_unix()) {
            Ok(report) => {
                info!(
                    donations_cancelled = report.donations_cancelled,
                    squares_released = report.squares_released,
                    "cancel cleanup finished"
                );
                report
            }
            Err(e) => {
                error!(error = %e, "cancel cleanup failed");
                CancelReport::default()
            }
        }
    }

    // ---- webhook reconciliation ----

    /// Intent-based provider webhook. Signature failures reject before any
    /// state is touched; everything after verification is acknowledged.
    #[instrument(skip(self, payload, headers))]
    pub async fn handle_stripe_webhook(
        &self,
        payload: &[u8],
        headers: &http::HeaderMap,
    ) -> Result<WebhookAck, WebhookError> {
        let cfg = self.config.current().stripe;
        stripe::verify_signature(
            payload,
            headers,
            &cfg.webhook_secret,
            cfg.webhook_tolerance_seconds,
        )?;

        let event: stripe::StripeEvent = serde_json::from_slice(payload)
            .map_err(|e| WebhookError::MalformedPayload(format!("JSON parse error: {}", e)))?;

        match event.event_type.as_str() {
            "payment_intent.succeeded" => {
                let intent: stripe::StripePaymentIntent =
                    serde_json::from_value(event.data.object.clone()).map_err(|e| {
                        WebhookError::MalformedPayload(format!("bad payment intent: {}", e))
                    })?;
                let meta = match PaymentMetadata::from_map(&intent.metadata) {
                    Ok(m) => m,
                    Err(e) => {
                        debug!(payment_id = %intent.id, error = %e, "intent carries no usable metadata");
                        return Ok(WebhookAck::Ignored);
                    }
                };
                self.reconcile_success("stripe", &intent.id, None, &meta).await;
                Ok(WebhookAck::Processed)
            }
            "payment_intent.payment_failed" => {
                let intent: stripe::StripePaymentIntent =
                    serde_json::from_value(event.data.object.clone()).map_err(|e| {
                        WebhookError::MalformedPayload(format!("bad payment intent: {}", e))
                    })?;
                self.handle_failed_payment("stripe", &intent.id);
                Ok(WebhookAck::Processed)
            }
            other => {
                debug!(event_type = %other, "ignoring unsupported event type");
                Ok(WebhookAck::Ignored)
            }
        }
    }

    /// Token-based provider webhook, signed over the notification URL + body.
    #[instrument(skip(self, payload, headers))]
    pub async fn handle_square_webhook(
        &self,
        payload: &[u8],
        headers: &http::HeaderMap,
    ) -> Result<WebhookAck, WebhookError> {
        let cfg = self.config.current().square;
        square::verify_signature(
            payload,
            headers,
            &cfg.webhook_signature_key,
            &cfg.notification_url,
        )?;

        let event: square::SquareEvent = serde_json::from_slice(payload)
            .map_err(|e| WebhookError::MalformedPayload(format!("JSON parse error: {}", e)))?;
        let payment = &event.data.object.payment;

        match event.event_type.as_str() {
            "payment.completed" | "payment.updated" => {
                if payment.status != "COMPLETED" {
                    if matches!(payment.status.as_str(), "FAILED" | "CANCELED") {
                        self.handle_failed_payment("square", &payment.id);
                        return Ok(WebhookAck::Processed);
                    }
                    debug!(payment_id = %payment.id, status = %payment.status, "non-terminal payment update");
                    return Ok(WebhookAck::Ignored);
                }
                let meta = match payment
                    .reference_id
                    .as_deref()
                    .ok_or(metadata::MetadataError::MissingField("reference_id"))
                    .and_then(PaymentMetadata::decode)
                {
                    Ok(m) => m,
                    Err(e) => {
                        debug!(payment_id = %payment.id, error = %e, "payment carries no usable metadata");
                        return Ok(WebhookAck::Ignored);
                    }
                };
                self.reconcile_success("square", &payment.id, payment.order_id.as_deref(), &meta)
                    .await;
                Ok(WebhookAck::Processed)
            }
            "payment.failed" => {
                self.handle_failed_payment("square", &payment.id);
                Ok(WebhookAck::Processed)
            }
            other => {
                debug!(event_type = %other, "ignoring unsupported event type");
                Ok(WebhookAck::Ignored)
            }
        }
    }

    /// Shared success reconciliation. Internal failures are logged and
    /// swallowed: once the signature checked out, the processor gets its ack
    /// and operators get the log line.
    async fn reconcile_success(
        &self,
        provider: &'static str,
        payment_id: &str,
        order_id: Option<&str>,
        meta: &PaymentMetadata,
    ) {
        let donor = DonorInfo {
            name: meta.donor_name.clone(),
            email: meta.donor_email.clone(),
            is_anonymous: meta.is_anonymous,
        };
        match self.store.reconcile_succeeded(
            provider,
            payment_id,
            order_id,
            &meta.square_ids,
            &donor,
            now_unix(),
        ) {
            Ok(ReconcileOutcome::Applied {
                delta,
                amount_cents,
            }) => {
                info!(
                    provider,
                    payment_id = %payment_id,
                    amount_cents,
                    new_total = delta.new_total_cents,
                    "webhook reconciled"
                );
                self.announce(
                    provider,
                    payment_id,
                    meta.square_ids.clone(),
                    amount_cents,
                    donor,
                    &delta,
                );
            }
            Ok(ReconcileOutcome::DuplicateDelivery) => {
                debug!(provider, payment_id = %payment_id, "duplicate webhook delivery");
            }
            Ok(ReconcileOutcome::SquareMissing) => {
                debug!(provider, payment_id = %payment_id, "webhook referenced unknown square");
            }
            Ok(ReconcileOutcome::NormalizedOnly) => {
                debug!(
                    provider,
                    payment_id = %payment_id,
                    "squares already settled; donation rows normalized"
                );
            }
            Err(e) => {
                // Acked anyway; retrying the delivery would not fix this.
                error!(provider, payment_id = %payment_id, error = %e, "reconciliation failed");
            }
        }
    }

    fn handle_failed_payment(&self, provider: &'static str, payment_id: &str) {
        match self.store.mark_payment_failed(provider, payment_id, now_unix()) {
            Ok(updated) => {
                if updated > 0 {
                    warn!(provider, payment_id = %payment_id, updated, "payment failed; pending donations marked");
                    self.audit_failed(provider, payment_id, &[], "provider reported failure");
                } else {
                    debug!(provider, payment_id = %payment_id, "failure event with nothing pending");
                }
            }
            Err(e) => error!(provider, payment_id = %payment_id, error = %e, "failed to record payment failure"),
        }
    }

    /// Milestone check plus fire-and-forget notification and audit.
    fn announce(
        &self,
        provider: &str,
        payment_id: &str,
        square_ids: Vec<String>,
        amount_cents: i64,
        donor: DonorInfo,
        delta: &LedgerDelta,
    ) {
        let milestone = milestone_crossed(
            delta.previous_total_cents,
            delta.new_total_cents,
            delta.goal_cents,
        );
        if let Some(m) = milestone {
            info!(campaign_id = %delta.campaign_id, milestone = ?m, "milestone crossed");
        }
        dispatch_post_donation(
            Arc::clone(&self.notifier),
            Arc::clone(&self.audit),
            DonationNotice {
                campaign_id: delta.campaign_id.clone(),
                square_ids,
                amount_cents,
                donor,
                provider: provider.to_string(),
                payment_id: payment_id.to_string(),
                previous_total_cents: delta.previous_total_cents,
                milestone,
            },
        );
    }

    fn audit_failed(&self, provider: &str, payment_id: &str, square_ids: &[String], reason: &str) {
        let audit = Arc::clone(&self.audit);
        let provider = provider.to_string();
        let payment_id = payment_id.to_string();
        let square_ids = square_ids.to_vec();
        let reason = reason.to_string();
        tokio::spawn(async move {
            if let Err(e) = audit
                .donation_failed(&provider, &payment_id, &square_ids, &reason)
                .await
            {
                error!(payment_id = %payment_id, error = %e, "audit log failed");
            }
        });
    }
}

pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::Milestone;
    use crate::notify::LogSink;
    use crate::settings::{ActiveProvider, ProviderSettings};
    use async_trait::async_trait;
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use hmac::{Hmac, Mac};
    use sha2::Sha256;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct RecordingSink(Mutex<Vec<DonationNotice>>);

    #[async_trait]
    impl NotificationSink for RecordingSink {
        async fn post_donation(&self, notice: &DonationNotice) -> anyhow::Result<()> {
            self.0.lock().unwrap().push(notice.clone());
            Ok(())
        }
    }

    fn build(
        settings: ProviderSettings,
        sink: Arc<dyn NotificationSink>,
    ) -> (Orchestrator, Arc<ProviderConfigStore>, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path().join("test.redb")).unwrap();
        let config = Arc::new(ProviderConfigStore::new(settings));
        let orchestrator =
            Orchestrator::new(store, Arc::clone(&config), sink, Arc::new(LogSink)).unwrap();
        (orchestrator, config, dir)
    }

    fn seed(orch: &Orchestrator, goal: i64, values: &[i64]) -> (String, Vec<String>) {
        let campaign = Campaign {
            id: "c1".to_string(),
            name: "Drive".into(),
            goal_cents: goal,
            total_raised_cents: 0,
            active: true,
            rows: 1,
            cols: values.len() as u16,
            min_value_cents: 100,
            max_value_cents: 100_000,
        };
        let squares: Vec<Square> = values
            .iter()
            .enumerate()
            .map(|(i, &v)| Square {
                id: format!("s{}", i + 1),
                campaign_id: "c1".into(),
                x: i as u16,
                y: 0,
                value_cents: v,
                purchased: false,
                donor_name: None,
                is_anonymous: false,
            })
            .collect();
        orch.store().create_campaign(&campaign, &squares).unwrap();
        ("c1".into(), squares.into_iter().map(|s| s.id).collect())
    }

    fn donor() -> DonorInfo {
        DonorInfo {
            name: Some("Ada".into()),
            email: Some("ada@example.com".into()),
            is_anonymous: false,
        }
    }

    #[tokio::test]
    async fn intent_with_no_provider_falls_back_to_simulation() {
        let mut settings = ProviderSettings::default();
        settings.active = ActiveProvider::Stripe; // configured active, no credentials
        let (orch, _config, _dir) = build(settings, Arc::new(LogSink));
        let (_, ids) = seed(&orch, 10_000, &[500, 1_000]);

        let outcome = orch.create_intent(&ids, None).await.unwrap();
        assert_eq!(outcome.provider, "simulation");
        assert_eq!(outcome.amount_cents, 1_500);
        assert_eq!(crate::ledger::format_cents(outcome.amount_cents), "15.00");
        assert_eq!(outcome.square_ids, ids);
    }

    #[tokio::test]
    async fn intent_rejects_sold_and_unknown_squares() {
        let (orch, _config, _dir) = build(ProviderSettings::default(), Arc::new(LogSink));
        let (_, ids) = seed(&orch, 10_000, &[500]);
        orch.process(&ids, "tok_1", donor()).await.unwrap();

        let err = orch.create_intent(&ids, None).await.unwrap_err();
        assert!(matches!(err, PurchaseError::Conflict(_)));

        let err = orch
            .create_intent(&["nope".to_string()], None)
            .await
            .unwrap_err();
        assert!(matches!(err, PurchaseError::Validation(_)));
    }

    #[tokio::test]
    async fn process_settles_batch_and_second_attempt_conflicts() {
        let (orch, _config, _dir) = build(ProviderSettings::default(), Arc::new(LogSink));
        let (_, ids) = seed(&orch, 10_000, &[500, 1_000]);

        let outcome = orch.process(&ids, "tok_1", donor()).await.unwrap();
        assert_eq!(outcome.status, SettleStatus::Succeeded);
        assert_eq!(outcome.squares_processed, 2);
        assert_eq!(outcome.total_cents, 1_500);

        let err = orch.process(&ids, "tok_2", donor()).await.unwrap_err();
        assert!(matches!(err, PurchaseError::Conflict(_)));
        assert_eq!(
            orch.store().campaign("c1").unwrap().unwrap().total_raised_cents,
            1_500
        );
    }

    #[tokio::test]
    async fn repeated_square_id_in_request_counts_once() {
        let (orch, _config, _dir) = build(ProviderSettings::default(), Arc::new(LogSink));
        let (_, ids) = seed(&orch, 10_000, &[500]);
        let doubled = vec![ids[0].clone(), ids[0].clone()];

        let intent = orch.create_intent(&doubled, None).await.unwrap();
        assert_eq!(intent.amount_cents, 500);
        assert_eq!(intent.square_ids, vec![ids[0].clone()]);

        let outcome = orch.process(&doubled, "tok_1", donor()).await.unwrap();
        assert_eq!(outcome.squares_processed, 1);
        assert_eq!(outcome.total_cents, 500);
        assert_eq!(
            orch.store().campaign("c1").unwrap().unwrap().total_raised_cents,
            500
        );
    }

    fn stripe_signed_headers(payload: &[u8], secret: &str) -> http::HeaderMap {
        let ts = now_unix();
        let signed = format!("{}.{}", ts, String::from_utf8_lossy(payload));
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(signed.as_bytes());
        let sig = hex::encode(mac.finalize().into_bytes());
        let mut headers = http::HeaderMap::new();
        headers.insert(
            "stripe-signature",
            format!("t={},v1={}", ts, sig).parse().unwrap(),
        );
        headers
    }

    #[tokio::test]
    async fn stripe_webhook_replay_is_idempotent() {
        let mut settings = ProviderSettings::default();
        settings.stripe.webhook_secret = "whsec_test".into();
        let (orch, _config, _dir) = build(settings, Arc::new(LogSink));
        let (_, _ids) = seed(&orch, 10_000, &[500, 1_000]);

        let payload = br#"{"id":"evt_1","type":"payment_intent.succeeded","data":{"object":{
            "id":"pi_1","status":"succeeded","amount":1500,"currency":"usd",
            "metadata":{"campaign_id":"c1","square_ids":"s1,s2","donor_name":"Ada"}}}}"#;
        let headers = stripe_signed_headers(payload, "whsec_test");

        for _ in 0..3 {
            let ack = orch.handle_stripe_webhook(payload, &headers).await.unwrap();
            assert_eq!(ack, WebhookAck::Processed);
        }
        assert_eq!(
            orch.store().campaign("c1").unwrap().unwrap().total_raised_cents,
            1_500
        );
        let sq = orch.store().square("s1").unwrap().unwrap();
        assert!(sq.purchased);
        assert_eq!(sq.donor_name.as_deref(), Some("Ada"));
    }

    #[tokio::test]
    async fn stripe_webhook_rejects_bad_signature_without_mutation() {
        let mut settings = ProviderSettings::default();
        settings.stripe.webhook_secret = "whsec_test".into();
        let (orch, _config, _dir) = build(settings, Arc::new(LogSink));
        seed(&orch, 10_000, &[500]);

        let payload = br#"{"id":"evt_1","type":"payment_intent.succeeded","data":{"object":{
            "id":"pi_1","status":"succeeded","amount":500,"currency":"usd",
            "metadata":{"campaign_id":"c1","square_ids":"s1"}}}}"#;
        let headers = stripe_signed_headers(payload, "whsec_wrong");

        let err = orch.handle_stripe_webhook(payload, &headers).await.unwrap_err();
        assert_eq!(err.status_code(), 401);
        assert!(!orch.store().square("s1").unwrap().unwrap().purchased);
    }

    #[tokio::test]
    async fn stripe_webhook_unknown_square_is_acked() {
        let mut settings = ProviderSettings::default();
        settings.stripe.webhook_secret = "whsec_test".into();
        let (orch, _config, _dir) = build(settings, Arc::new(LogSink));
        seed(&orch, 10_000, &[500]);

        let payload = br#"{"id":"evt_1","type":"payment_intent.succeeded","data":{"object":{
            "id":"pi_1","status":"succeeded","amount":500,"currency":"usd",
            "metadata":{"campaign_id":"c1","square_ids":"ghost"}}}}"#;
        let headers = stripe_signed_headers(payload, "whsec_test");
        let ack = orch.handle_stripe_webhook(payload, &headers).await.unwrap();
        assert_eq!(ack, WebhookAck::Processed);
    }

    fn square_signed_headers(payload: &[u8], key: &str, url: &str) -> http::HeaderMap {
        let mut mac = Hmac::<Sha256>::new_from_slice(key.as_bytes()).unwrap();
        mac.update(url.as_bytes());
        mac.update(payload);
        let sig = STANDARD.encode(mac.finalize().into_bytes());
        let mut headers = http::HeaderMap::new();
        headers.insert("x-square-hmacsha256-signature", sig.parse().unwrap());
        headers
    }

    #[tokio::test]
    async fn square_webhook_confirms_pending_payment_once() {
        let url = "https://donate.example.org/webhooks/square";
        let mut settings = ProviderSettings::default();
        settings.square.webhook_signature_key = "sig_key".into();
        settings.square.notification_url = url.into();
        let (orch, _config, _dir) = build(settings, Arc::new(LogSink));
        let (_, ids) = seed(&orch, 10_000, &[500]);

        orch.store()
            .record_pending(&ids, &donor(), "square", "pmt_1", None, now_unix())
            .unwrap();

        let reference = PaymentMetadata::new("c1".into(), vec!["s1".into()])
            .encode()
            .unwrap();
        let payload = serde_json::to_vec(&serde_json::json!({
            "event_id": "e1",
            "type": "payment.completed",
            "data": { "object": { "payment": {
                "id": "pmt_1", "status": "COMPLETED", "order_id": "ord_1",
                "amount_money": {"amount": 500, "currency": "USD"},
                "reference_id": reference
            }}}
        }))
        .unwrap();
        let headers = square_signed_headers(&payload, "sig_key", url);

        for _ in 0..2 {
            let ack = orch.handle_square_webhook(&payload, &headers).await.unwrap();
            assert_eq!(ack, WebhookAck::Processed);
        }
        assert_eq!(
            orch.store().campaign("c1").unwrap().unwrap().total_raised_cents,
            500
        );
        assert!(orch.store().square("s1").unwrap().unwrap().purchased);
    }

    #[tokio::test]
    async fn square_failed_event_marks_pending_rows() {
        let url = "https://donate.example.org/webhooks/square";
        let mut settings = ProviderSettings::default();
        settings.square.webhook_signature_key = "sig_key".into();
        settings.square.notification_url = url.into();
        let (orch, _config, _dir) = build(settings, Arc::new(LogSink));
        let (_, ids) = seed(&orch, 10_000, &[500]);
        orch.store()
            .record_pending(&ids, &donor(), "square", "pmt_1", None, now_unix())
            .unwrap();

        let payload = serde_json::to_vec(&serde_json::json!({
            "event_id": "e2",
            "type": "payment.failed",
            "data": { "object": { "payment": {
                "id": "pmt_1", "status": "FAILED",
                "amount_money": {"amount": 500, "currency": "USD"}
            }}}
        }))
        .unwrap();
        let headers = square_signed_headers(&payload, "sig_key", url);
        orch.handle_square_webhook(&payload, &headers).await.unwrap();

        let donations = orch.store().donations_for_payment("square", "pmt_1").unwrap();
        assert_eq!(donations[0].status, crate::store::DonationStatus::Failed);
        assert!(!orch.store().square("s1").unwrap().unwrap().purchased);
    }

    #[tokio::test]
    async fn milestone_fires_once_and_reaches_notifier() {
        let sink = Arc::new(RecordingSink(Mutex::new(Vec::new())));
        let (orch, _config, _dir) = build(
            ProviderSettings::default(),
            Arc::clone(&sink) as Arc<dyn NotificationSink>,
        );
        // Goal $100; $45 then $10 then $5.
        let (_, ids) = seed(&orch, 10_000, &[4_500, 1_000, 500]);

        orch.process(&ids[..1].to_vec(), "tok_1", donor()).await.unwrap();
        orch.process(&ids[1..2].to_vec(), "tok_2", donor()).await.unwrap();
        orch.process(&ids[2..].to_vec(), "tok_3", donor()).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        // Dispatch is fire-and-forget, so match notices by content.
        let notices = sink.0.lock().unwrap();
        assert_eq!(notices.len(), 3);
        let fired: Vec<_> = notices.iter().filter_map(|n| n.milestone).collect();
        assert_eq!(fired, vec![Milestone::HalfGoal]);
        let half = notices.iter().find(|n| n.milestone.is_some()).unwrap();
        assert_eq!(half.previous_total_cents, 4_500);
    }

    #[tokio::test]
    async fn cancel_is_best_effort_and_releases_pending_squares() {
        let (orch, _config, _dir) = build(ProviderSettings::default(), Arc::new(LogSink));
        let (_, ids) = seed(&orch, 10_000, &[500, 700]);
        orch.store()
            .record_pending(&ids[..1].to_vec(), &donor(), "square", "pmt_1", None, now_unix())
            .unwrap();

        let report = orch.cancel(&ids[..1].to_vec(), Some("pmt_1"));
        assert_eq!(report.donations_cancelled, 1);

        // Cancelling unknown squares still reports success.
        let report = orch.cancel(&["ghost".to_string()], None);
        assert_eq!(report.squares_released, 0);
    }

    #[tokio::test]
    async fn campaign_creation_validates_feasibility() {
        let (orch, _config, _dir) = build(ProviderSettings::default(), Arc::new(LogSink));
        let err = orch
            .create_campaign("Drive", 1_000, 10, 10, 500, 900)
            .unwrap_err();
        assert!(matches!(err, PurchaseError::Validation(_)));

        let (campaign, squares) = orch
            .create_campaign("Drive", 100_000, 5, 4, 100, 50_000)
            .unwrap();
        assert_eq!(squares.len(), 20);
        assert_eq!(squares.iter().map(|s| s.value_cents).sum::<i64>(), 100_000);
        assert_eq!(campaign.goal_cents, 100_000);
    }
}
