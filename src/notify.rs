// External collaborator seams: post-donation notifications and the audit
// log. Both are best-effort; reconciliation never waits on them and never
// fails because of them.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, info};

use crate::ledger::Milestone;
use crate::store::DonorInfo;

#[derive(Debug, Clone)]
pub struct DonationNotice {
    pub campaign_id: String,
    pub square_ids: Vec<String>,
    pub amount_cents: i64,
    pub donor: DonorInfo,
    pub provider: String,
    pub payment_id: String,
    pub previous_total_cents: i64,
    pub milestone: Option<Milestone>,
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn post_donation(&self, notice: &DonationNotice) -> anyhow::Result<()>;
}

#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn donation_completed(&self, notice: &DonationNotice) -> anyhow::Result<()>;
    async fn donation_failed(
        &self,
        provider: &str,
        payment_id: &str,
        square_ids: &[String],
        reason: &str,
    ) -> anyhow::Result<()>;
}

/// Default sink: structured log lines. The real email dispatcher and audit
/// store plug in behind the same traits.
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn post_donation(&self, notice: &DonationNotice) -> anyhow::Result<()> {
        info!(
            campaign_id = %notice.campaign_id,
            payment_id = %notice.payment_id,
            amount_cents = notice.amount_cents,
            milestone = ?notice.milestone,
            squares = notice.square_ids.len(),
            "donation notification"
        );
        Ok(())
    }
}

#[async_trait]
impl AuditLog for LogSink {
    async fn donation_completed(&self, notice: &DonationNotice) -> anyhow::Result<()> {
        info!(
            campaign_id = %notice.campaign_id,
            provider = %notice.provider,
            payment_id = %notice.payment_id,
            amount_cents = notice.amount_cents,
            "audit: donation completed"
        );
        Ok(())
    }

    async fn donation_failed(
        &self,
        provider: &str,
        payment_id: &str,
        square_ids: &[String],
        reason: &str,
    ) -> anyhow::Result<()> {
        info!(
            provider = %provider,
            payment_id = %payment_id,
            squares = square_ids.len(),
            reason = %reason,
            "audit: donation failed"
        );
        Ok(())
    }
}

/// Fire and forget: spawn the dispatch, log failures, return immediately.
pub fn dispatch_post_donation(
    sink: Arc<dyn NotificationSink>,
    audit: Arc<dyn AuditLog>,
    notice: DonationNotice,
) {
    tokio::spawn(async move {
        if let Err(e) = sink.post_donation(&notice).await {
            error!(payment_id = %notice.payment_id, error = %e, "notification dispatch failed");
        }
        if let Err(e) = audit.donation_completed(&notice).await {
            error!(payment_id = %notice.payment_id, error = %e, "audit log failed");
        }
    });
}
