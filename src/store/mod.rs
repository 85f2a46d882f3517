//! redb-backed persistence for campaigns, squares and donations.
//!
//! Every multi-row purchase mutation runs in a single write transaction.
//! redb serializes writers, so the `purchased == false` checks inside a
//! transaction double as the conditional-update guard against double sales,
//! and the read-modify-write on `total_raised_cents` cannot lose updates.

use rand::distributions::Alphanumeric;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use crate::grid::{self, GridError};

/// Key: campaign id. Value: serialized Campaign JSON.
const CAMPAIGNS: TableDefinition<&str, &[u8]> = TableDefinition::new("campaigns");
/// Key: square id. Value: serialized Square JSON.
const SQUARES: TableDefinition<&str, &[u8]> = TableDefinition::new("squares");
/// Key: "{provider}/{payment_id}/{square_id}". Value: serialized Donation JSON.
/// The key itself enforces the at-most-one-succeeded-per-triple invariant.
const DONATIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("donations");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("campaign not found: {0}")]
    CampaignNotFound(String),
    #[error("square not found: {0}")]
    SquareNotFound(String),
    #[error("square already purchased: {0}")]
    AlreadyPurchased(String),
    #[error("squares belong to more than one campaign")]
    MixedCampaigns,
    #[error("no squares requested")]
    EmptyBatch,
    #[error(transparent)]
    Grid(#[from] GridError),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("database error: {0}")]
    Db(#[from] redb::Error),
}

impl From<redb::DatabaseError> for StoreError {
    fn from(e: redb::DatabaseError) -> Self {
        StoreError::Db(e.into())
    }
}
impl From<redb::TransactionError> for StoreError {
    fn from(e: redb::TransactionError) -> Self {
        StoreError::Db(e.into())
    }
}
impl From<redb::TableError> for StoreError {
    fn from(e: redb::TableError) -> Self {
        StoreError::Db(e.into())
    }
}
impl From<redb::StorageError> for StoreError {
    fn from(e: redb::StorageError) -> Self {
        StoreError::Db(e.into())
    }
}
impl From<redb::CommitError> for StoreError {
    fn from(e: redb::CommitError) -> Self {
        StoreError::Db(e.into())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: String,
    pub name: String,
    pub goal_cents: i64,
    pub total_raised_cents: i64,
    pub active: bool,
    pub rows: u16,
    pub cols: u16,
    pub min_value_cents: i64,
    pub max_value_cents: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Square {
    pub id: String,
    pub campaign_id: String,
    pub x: u16,
    pub y: u16,
    pub value_cents: i64,
    pub purchased: bool,
    #[serde(default)]
    pub donor_name: Option<String>,
    #[serde(default)]
    pub is_anonymous: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DonationStatus {
    Pending,
    Succeeded,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Donation {
    pub campaign_id: String,
    pub square_id: String,
    pub provider: String,
    pub provider_payment_id: String,
    #[serde(default)]
    pub provider_order_id: Option<String>,
    pub amount_cents: i64,
    #[serde(default)]
    pub donor_name: Option<String>,
    #[serde(default)]
    pub donor_email: Option<String>,
    #[serde(default)]
    pub is_anonymous: bool,
    pub status: DonationStatus,
    pub created_at: i64,
    #[serde(default)]
    pub completed_at: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct DonorInfo {
    pub name: Option<String>,
    pub email: Option<String>,
    pub is_anonymous: bool,
}

/// Result of a ledger increment, for milestone detection.
#[derive(Debug, Clone)]
pub struct LedgerDelta {
    pub campaign_id: String,
    pub previous_total_cents: i64,
    pub new_total_cents: i64,
    pub goal_cents: i64,
}

#[derive(Debug)]
pub enum ReconcileOutcome {
    /// Squares flipped and the ledger incremented by their combined value.
    Applied {
        delta: LedgerDelta,
        amount_cents: i64,
    },
    /// A succeeded donation already exists for this payment; nothing to do.
    DuplicateDelivery,
    /// The payment metadata referenced a square we do not know.
    SquareMissing,
    /// Squares were already sold (synchronous path won); donation rows
    /// normalized to succeeded, ledger untouched.
    NormalizedOnly,
}

#[derive(Debug, Default)]
pub struct CancelReport {
    pub donations_cancelled: usize,
    pub squares_released: usize,
}

pub fn new_id(prefix: &str) -> String {
    let mut rng = SmallRng::from_entropy();
    let suffix: String = (&mut rng)
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect();
    format!("{}_{}", prefix, suffix)
}

fn donation_key(provider: &str, payment_id: &str, square_id: &str) -> String {
    format!("{}/{}/{}", provider, payment_id, square_id)
}

/// Collapse repeated ids, keeping first-seen order. A repeated id in a batch
/// would otherwise pass the per-id availability check twice and count the
/// square's value twice into the ledger while its donation key collapses to
/// one row.
fn dedup_ids(square_ids: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(square_ids.len());
    for id in square_ids {
        if !out.contains(id) {
            out.push(id.clone());
        }
    }
    out
}

#[derive(Clone)]
pub struct Store {
    db: Arc<Database>,
}

impl Store {
    /// Create or open the database and make sure all tables exist.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        if let Some(parent) = path.as_ref().parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let db = Database::create(path)?;
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(CAMPAIGNS)?;
            let _ = write_txn.open_table(SQUARES)?;
            let _ = write_txn.open_table(DONATIONS)?;
        }
        write_txn.commit()?;
        tracing::info!("store initialized");
        Ok(Self { db: Arc::new(db) })
    }

    pub fn create_campaign(
        &self,
        campaign: &Campaign,
        squares: &[Square],
    ) -> Result<(), StoreError> {
        let write_txn = self.db.begin_write()?;
        {
            let mut campaigns = write_txn.open_table(CAMPAIGNS)?;
            campaigns.insert(campaign.id.as_str(), serde_json::to_vec(campaign)?.as_slice())?;
            let mut table = write_txn.open_table(SQUARES)?;
            for sq in squares {
                table.insert(sq.id.as_str(), serde_json::to_vec(sq)?.as_slice())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn campaign(&self, id: &str) -> Result<Option<Campaign>, StoreError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(CAMPAIGNS)?;
        match table.get(id)? {
            Some(v) => Ok(Some(serde_json::from_slice(v.value())?)),
            None => Ok(None),
        }
    }

    pub fn square(&self, id: &str) -> Result<Option<Square>, StoreError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SQUARES)?;
        match table.get(id)? {
            Some(v) => Ok(Some(serde_json::from_slice(v.value())?)),
            None => Ok(None),
        }
    }

    pub fn squares_for_campaign(&self, campaign_id: &str) -> Result<Vec<Square>, StoreError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SQUARES)?;
        let mut out = Vec::new();
        for entry in table.iter()? {
            let (_, v) = entry?;
            let sq: Square = serde_json::from_slice(v.value())?;
            if sq.campaign_id == campaign_id {
                out.push(sq);
            }
        }
        out.sort_by_key(|s| (s.y, s.x));
        Ok(out)
    }

    /// Load a purchase batch: every square must exist, none may be purchased,
    /// and all must belong to one campaign.
    pub fn load_available_batch(&self, square_ids: &[String]) -> Result<Vec<Square>, StoreError> {
        let square_ids = dedup_ids(square_ids);
        if square_ids.is_empty() {
            return Err(StoreError::EmptyBatch);
        }
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SQUARES)?;
        let mut squares = Vec::with_capacity(square_ids.len());
        for id in &square_ids {
            let sq: Square = match table.get(id.as_str())? {
                Some(v) => serde_json::from_slice(v.value())?,
                None => return Err(StoreError::SquareNotFound(id.clone())),
            };
            if sq.purchased {
                return Err(StoreError::AlreadyPurchased(id.clone()));
            }
            squares.push(sq);
        }
        let campaign_id = &squares[0].campaign_id;
        if squares.iter().any(|s| &s.campaign_id != campaign_id) {
            return Err(StoreError::MixedCampaigns);
        }
        Ok(squares)
    }

    pub fn donations_for_payment(
        &self,
        provider: &str,
        payment_id: &str,
    ) -> Result<Vec<Donation>, StoreError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(DONATIONS)?;
        let prefix = format!("{}/{}/", provider, payment_id);
        let mut out = Vec::new();
        for entry in table.range(prefix.as_str()..)? {
            let (k, v) = entry?;
            if !k.value().starts_with(prefix.as_str()) {
                break;
            }
            out.push(serde_json::from_slice(v.value())?);
        }
        Ok(out)
    }

    /// Synchronous settlement: flip all squares, insert succeeded donation
    /// rows sharing the provider payment id, and increment the campaign total,
    /// all in one transaction. Fails without mutation if any square is gone or
    /// already sold.
    pub fn settle_purchase(
        &self,
        square_ids: &[String],
        donor: &DonorInfo,
        provider: &str,
        payment_id: &str,
        order_id: Option<&str>,
        now: i64,
    ) -> Result<LedgerDelta, StoreError> {
        let square_ids = dedup_ids(square_ids);
        if square_ids.is_empty() {
            return Err(StoreError::EmptyBatch);
        }
        let write_txn = self.db.begin_write()?;
        let delta;
        {
            let mut squares_table = write_txn.open_table(SQUARES)?;
            let mut donations = write_txn.open_table(DONATIONS)?;
            let mut campaigns = write_txn.open_table(CAMPAIGNS)?;

            let mut batch = Vec::with_capacity(square_ids.len());
            for id in &square_ids {
                let sq: Square = match squares_table.get(id.as_str())? {
                    Some(v) => serde_json::from_slice(v.value())?,
                    None => return Err(StoreError::SquareNotFound(id.clone())),
                };
                if sq.purchased {
                    // Conditional-update guard: the loser of a race lands here.
                    return Err(StoreError::AlreadyPurchased(id.clone()));
                }
                batch.push(sq);
            }
            let campaign_id = batch[0].campaign_id.clone();
            if batch.iter().any(|s| s.campaign_id != campaign_id) {
                return Err(StoreError::MixedCampaigns);
            }

            let amount: i64 = batch.iter().map(|s| s.value_cents).sum();
            for sq in batch.iter_mut() {
                sq.purchased = true;
                sq.donor_name = donor.name.clone();
                sq.is_anonymous = donor.is_anonymous;
                squares_table.insert(sq.id.as_str(), serde_json::to_vec(sq)?.as_slice())?;

                let donation = Donation {
                    campaign_id: campaign_id.clone(),
                    square_id: sq.id.clone(),
                    provider: provider.to_string(),
                    provider_payment_id: payment_id.to_string(),
                    provider_order_id: order_id.map(str::to_string),
                    amount_cents: sq.value_cents,
                    donor_name: donor.name.clone(),
                    donor_email: donor.email.clone(),
                    is_anonymous: donor.is_anonymous,
                    status: DonationStatus::Succeeded,
                    created_at: now,
                    completed_at: Some(now),
                };
                donations.insert(
                    donation_key(provider, payment_id, &sq.id).as_str(),
                    serde_json::to_vec(&donation)?.as_slice(),
                )?;
            }

            let mut campaign: Campaign = match campaigns.get(campaign_id.as_str())? {
                Some(v) => serde_json::from_slice(v.value())?,
                None => return Err(StoreError::CampaignNotFound(campaign_id)),
            };
            let previous = campaign.total_raised_cents;
            campaign.total_raised_cents += amount;
            campaigns.insert(campaign.id.as_str(), serde_json::to_vec(&campaign)?.as_slice())?;
            delta = LedgerDelta {
                campaign_id: campaign.id,
                previous_total_cents: previous,
                new_total_cents: previous + amount,
                goal_cents: campaign.goal_cents,
            };
        }
        write_txn.commit()?;
        Ok(delta)
    }

    /// Non-terminal settlement result: record pending donation rows only.
    /// Squares stay available until the confirming webhook arrives.
    pub fn record_pending(
        &self,
        square_ids: &[String],
        donor: &DonorInfo,
        provider: &str,
        payment_id: &str,
        order_id: Option<&str>,
        now: i64,
    ) -> Result<(), StoreError> {
        self.record_attempt(square_ids, donor, provider, payment_id, order_id, DonationStatus::Pending, now)
    }

    /// Declined settlement: keep a failed row per square for the audit trail.
    pub fn record_failed_attempt(
        &self,
        square_ids: &[String],
        donor: &DonorInfo,
        provider: &str,
        payment_id: &str,
        now: i64,
    ) -> Result<(), StoreError> {
        self.record_attempt(square_ids, donor, provider, payment_id, None, DonationStatus::Failed, now)
    }

    fn record_attempt(
        &self,
        square_ids: &[String],
        donor: &DonorInfo,
        provider: &str,
        payment_id: &str,
        order_id: Option<&str>,
        status: DonationStatus,
        now: i64,
    ) -> Result<(), StoreError> {
        let square_ids = dedup_ids(square_ids);
        let write_txn = self.db.begin_write()?;
        {
            let squares_table = write_txn.open_table(SQUARES)?;
            let mut donations = write_txn.open_table(DONATIONS)?;
            for id in &square_ids {
                let sq: Square = match squares_table.get(id.as_str())? {
                    Some(v) => serde_json::from_slice(v.value())?,
                    None => return Err(StoreError::SquareNotFound(id.clone())),
                };
                let completed_at = match status {
                    DonationStatus::Pending => None,
                    _ => Some(now),
                };
                let donation = Donation {
                    campaign_id: sq.campaign_id.clone(),
                    square_id: sq.id.clone(),
                    provider: provider.to_string(),
                    provider_payment_id: payment_id.to_string(),
                    provider_order_id: order_id.map(str::to_string),
                    amount_cents: sq.value_cents,
                    donor_name: donor.name.clone(),
                    donor_email: donor.email.clone(),
                    is_anonymous: donor.is_anonymous,
                    status,
                    created_at: now,
                    completed_at,
                };
                donations.insert(
                    donation_key(provider, payment_id, id).as_str(),
                    serde_json::to_vec(&donation)?.as_slice(),
                )?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Webhook reconciliation for a succeeded payment. Safe to run any number
    /// of times and in any order relative to the synchronous path.
    pub fn reconcile_succeeded(
        &self,
        provider: &str,
        payment_id: &str,
        order_id: Option<&str>,
        square_ids: &[String],
        donor: &DonorInfo,
        now: i64,
    ) -> Result<ReconcileOutcome, StoreError> {
        let square_ids = dedup_ids(square_ids);
        if square_ids.is_empty() {
            return Ok(ReconcileOutcome::SquareMissing);
        }
        let write_txn = self.db.begin_write()?;
        let outcome;
        {
            let mut squares_table = write_txn.open_table(SQUARES)?;
            let mut donations = write_txn.open_table(DONATIONS)?;
            let mut campaigns = write_txn.open_table(CAMPAIGNS)?;

            // Idempotency guard against at-least-once delivery.
            let prefix = format!("{}/{}/", provider, payment_id);
            let mut already_succeeded = false;
            for entry in donations.range(prefix.as_str()..)? {
                let (k, v) = entry?;
                if !k.value().starts_with(prefix.as_str()) {
                    break;
                }
                let existing: Donation = serde_json::from_slice(v.value())?;
                if existing.status == DonationStatus::Succeeded {
                    already_succeeded = true;
                    break;
                }
            }
            if already_succeeded {
                return Ok(ReconcileOutcome::DuplicateDelivery);
            }

            let mut batch = Vec::with_capacity(square_ids.len());
            for id in &square_ids {
                match squares_table.get(id.as_str())? {
                    Some(v) => batch.push(serde_json::from_slice::<Square>(v.value())?),
                    None => return Ok(ReconcileOutcome::SquareMissing),
                }
            }
            let campaign_id = batch[0].campaign_id.clone();

            let mut applied_cents: i64 = 0;
            for sq in batch.iter_mut() {
                let newly_flipped = !sq.purchased;
                if newly_flipped {
                    sq.purchased = true;
                    sq.donor_name = donor.name.clone();
                    sq.is_anonymous = donor.is_anonymous;
                    squares_table.insert(sq.id.as_str(), serde_json::to_vec(sq)?.as_slice())?;
                    applied_cents += sq.value_cents;
                }
                let key = donation_key(provider, payment_id, &sq.id);
                let existing = match donations.get(key.as_str())? {
                    Some(v) => Some(serde_json::from_slice::<Donation>(v.value())?),
                    None => None,
                };
                // Normalization touches pending or absent rows. Failed and
                // cancelled are terminal and stay put, except when the flip
                // was applied here: the ledger increment needs a succeeded
                // row backing it, and a provider success confirmation
                // supersedes an out-of-order failure record for the payment.
                if !newly_flipped {
                    if let Some(d) = &existing {
                        if matches!(d.status, DonationStatus::Failed | DonationStatus::Cancelled) {
                            continue;
                        }
                    }
                }
                let mut donation = match existing {
                    Some(d) => d,
                    None => Donation {
                        campaign_id: sq.campaign_id.clone(),
                        square_id: sq.id.clone(),
                        provider: provider.to_string(),
                        provider_payment_id: payment_id.to_string(),
                        provider_order_id: order_id.map(str::to_string),
                        amount_cents: sq.value_cents,
                        donor_name: donor.name.clone(),
                        donor_email: donor.email.clone(),
                        is_anonymous: donor.is_anonymous,
                        status: DonationStatus::Pending,
                        created_at: now,
                        completed_at: None,
                    },
                };
                donation.status = DonationStatus::Succeeded;
                donation.completed_at = Some(now);
                if let Some(oid) = order_id {
                    donation.provider_order_id = Some(oid.to_string());
                }
                donations.insert(key.as_str(), serde_json::to_vec(&donation)?.as_slice())?;
            }

            if applied_cents > 0 {
                let mut campaign: Campaign = match campaigns.get(campaign_id.as_str())? {
                    Some(v) => serde_json::from_slice(v.value())?,
                    None => return Err(StoreError::CampaignNotFound(campaign_id)),
                };
                let previous = campaign.total_raised_cents;
                campaign.total_raised_cents += applied_cents;
                campaigns
                    .insert(campaign.id.as_str(), serde_json::to_vec(&campaign)?.as_slice())?;
                outcome = ReconcileOutcome::Applied {
                    delta: LedgerDelta {
                        campaign_id: campaign.id,
                        previous_total_cents: previous,
                        new_total_cents: previous + applied_cents,
                        goal_cents: campaign.goal_cents,
                    },
                    amount_cents: applied_cents,
                };
            } else {
                outcome = ReconcileOutcome::NormalizedOnly;
            }
        }
        write_txn.commit()?;
        Ok(outcome)
    }

    /// Failed-payment webhook: move any pending rows for the payment to
    /// failed. Terminal rows and the ledger are never touched.
    pub fn mark_payment_failed(
        &self,
        provider: &str,
        payment_id: &str,
        now: i64,
    ) -> Result<usize, StoreError> {
        let write_txn = self.db.begin_write()?;
        let mut updated = 0;
        {
            let mut donations = write_txn.open_table(DONATIONS)?;
            let prefix = format!("{}/{}/", provider, payment_id);
            let mut to_fail = Vec::new();
            for entry in donations.range(prefix.as_str()..)? {
                let (k, v) = entry?;
                if !k.value().starts_with(prefix.as_str()) {
                    break;
                }
                let donation: Donation = serde_json::from_slice(v.value())?;
                if donation.status == DonationStatus::Pending {
                    to_fail.push((k.value().to_string(), donation));
                }
            }
            for (key, mut donation) in to_fail {
                donation.status = DonationStatus::Failed;
                donation.completed_at = Some(now);
                donations.insert(key.as_str(), serde_json::to_vec(&donation)?.as_slice())?;
                updated += 1;
            }
        }
        write_txn.commit()?;
        Ok(updated)
    }

    /// Compensating action for abandoned client-side flows: cancel pending
    /// donations and release squares that have no succeeded donation backing
    /// their purchased flag.
    pub fn cancel_squares(
        &self,
        square_ids: &[String],
        payment_id: Option<&str>,
        now: i64,
    ) -> Result<CancelReport, StoreError> {
        let write_txn = self.db.begin_write()?;
        let mut report = CancelReport::default();
        {
            let mut squares_table = write_txn.open_table(SQUARES)?;
            let mut donations = write_txn.open_table(DONATIONS)?;

            // Collect first; we cannot mutate while iterating.
            let mut pending_keys = Vec::new();
            let mut succeeded_square_ids = Vec::new();
            for entry in donations.iter()? {
                let (k, v) = entry?;
                let donation: Donation = serde_json::from_slice(v.value())?;
                match donation.status {
                    DonationStatus::Pending => {
                        // With a payment id the scope is that payment alone;
                        // other payments' pending rows on the same squares
                        // keep their own lifecycle. The square-id match is
                        // the fallback for callers that only know the grid.
                        let matches = match payment_id {
                            Some(pid) => donation.provider_payment_id == pid,
                            None => square_ids.contains(&donation.square_id),
                        };
                        if matches {
                            pending_keys.push((k.value().to_string(), donation));
                        }
                    }
                    DonationStatus::Succeeded => {
                        succeeded_square_ids.push(donation.square_id);
                    }
                    _ => {}
                }
            }

            for (key, mut donation) in pending_keys {
                donation.status = DonationStatus::Cancelled;
                donation.completed_at = Some(now);
                donations.insert(key.as_str(), serde_json::to_vec(&donation)?.as_slice())?;
                report.donations_cancelled += 1;
            }

            for id in square_ids {
                let sq: Option<Square> = match squares_table.get(id.as_str())? {
                    Some(v) => Some(serde_json::from_slice(v.value())?),
                    None => None,
                };
                let Some(mut sq) = sq else { continue };
                if sq.purchased && !succeeded_square_ids.contains(id) {
                    sq.purchased = false;
                    sq.donor_name = None;
                    sq.is_anonymous = false;
                    squares_table.insert(sq.id.as_str(), serde_json::to_vec(&sq)?.as_slice())?;
                    report.squares_released += 1;
                }
            }
        }
        write_txn.commit()?;
        Ok(report)
    }

    /// Regenerate values for unsold squares so the whole grid again sums to
    /// the campaign goal. Purchased squares are immutable inputs: their values
    /// are subtracted from the target and never rewritten.
    pub fn rerandomize(&self, campaign_id: &str) -> Result<usize, StoreError> {
        let write_txn = self.db.begin_write()?;
        let updated;
        {
            let campaigns = write_txn.open_table(CAMPAIGNS)?;
            let campaign: Campaign = match campaigns.get(campaign_id)? {
                Some(v) => serde_json::from_slice(v.value())?,
                None => return Err(StoreError::CampaignNotFound(campaign_id.to_string())),
            };
            drop(campaigns);

            let mut squares_table = write_txn.open_table(SQUARES)?;
            let mut unpurchased = Vec::new();
            let mut purchased_cents: i64 = 0;
            for entry in squares_table.iter()? {
                let (_, v) = entry?;
                let sq: Square = serde_json::from_slice(v.value())?;
                if sq.campaign_id != campaign_id {
                    continue;
                }
                if sq.purchased {
                    purchased_cents += sq.value_cents;
                } else {
                    unpurchased.push(sq);
                }
            }

            let remaining_target = campaign.goal_cents - purchased_cents;
            let values = grid::generate_values(
                unpurchased.len(),
                campaign.min_value_cents,
                campaign.max_value_cents,
                remaining_target,
            )?;
            for (sq, value) in unpurchased.iter_mut().zip(values) {
                sq.value_cents = value;
                squares_table.insert(sq.id.as_str(), serde_json::to_vec(sq)?.as_slice())?;
            }
            updated = unpurchased.len();
        }
        write_txn.commit()?;
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_store() -> (Store, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path().join("test.redb")).unwrap();
        (store, dir)
    }

    fn seed_campaign(store: &Store, id: &str, goal: i64, values: &[i64]) -> Vec<String> {
        let campaign = Campaign {
            id: id.to_string(),
            name: "Test Drive".into(),
            goal_cents: goal,
            total_raised_cents: 0,
            active: true,
            rows: 1,
            cols: values.len() as u16,
            min_value_cents: 100,
            max_value_cents: 10_000,
        };
        let squares: Vec<Square> = values
            .iter()
            .enumerate()
            .map(|(i, &v)| Square {
                id: format!("{}-sq{}", id, i),
                campaign_id: id.to_string(),
                x: i as u16,
                y: 0,
                value_cents: v,
                purchased: false,
                donor_name: None,
                is_anonymous: false,
            })
            .collect();
        store.create_campaign(&campaign, &squares).unwrap();
        squares.into_iter().map(|s| s.id).collect()
    }

    fn donor(name: &str) -> DonorInfo {
        DonorInfo {
            name: Some(name.to_string()),
            email: Some(format!("{}@example.com", name)),
            is_anonymous: false,
        }
    }

    #[test]
    fn settle_flips_batch_and_increments_total() {
        let (store, _dir) = open_store();
        let ids = seed_campaign(&store, "c1", 10_000, &[500, 1_000]);

        let delta = store
            .settle_purchase(&ids, &donor("ada"), "square", "pay_1", Some("ord_1"), 100)
            .unwrap();
        assert_eq!(delta.previous_total_cents, 0);
        assert_eq!(delta.new_total_cents, 1_500);

        for id in &ids {
            let sq = store.square(id).unwrap().unwrap();
            assert!(sq.purchased);
            assert_eq!(sq.donor_name.as_deref(), Some("ada"));
        }
        let donations = store.donations_for_payment("square", "pay_1").unwrap();
        assert_eq!(donations.len(), 2);
        assert!(donations.iter().all(|d| d.status == DonationStatus::Succeeded));
    }

    #[test]
    fn second_purchase_of_same_square_conflicts_without_mutation() {
        let (store, _dir) = open_store();
        let ids = seed_campaign(&store, "c1", 10_000, &[500]);

        store
            .settle_purchase(&ids, &donor("ada"), "square", "pay_1", None, 100)
            .unwrap();
        let err = store
            .settle_purchase(&ids, &donor("bob"), "square", "pay_2", None, 101)
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyPurchased(_)));

        // Winner's donor fields survive; loser left no donation rows.
        let sq = store.square(&ids[0]).unwrap().unwrap();
        assert_eq!(sq.donor_name.as_deref(), Some("ada"));
        assert!(store.donations_for_payment("square", "pay_2").unwrap().is_empty());
        assert_eq!(store.campaign("c1").unwrap().unwrap().total_raised_cents, 500);
    }

    #[test]
    fn batch_is_all_or_nothing() {
        let (store, _dir) = open_store();
        let mut ids = seed_campaign(&store, "c1", 10_000, &[500, 1_000]);
        // Sell the second square first, then try the full batch.
        store
            .settle_purchase(&ids[1..].to_vec(), &donor("ada"), "square", "pay_1", None, 100)
            .unwrap();
        let err = store
            .settle_purchase(&ids, &donor("bob"), "square", "pay_2", None, 101)
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyPurchased(_)));

        // First square untouched by the failed batch.
        let sq = store.square(&ids.remove(0)).unwrap().unwrap();
        assert!(!sq.purchased);
        assert_eq!(store.campaign("c1").unwrap().unwrap().total_raised_cents, 1_000);
    }

    #[test]
    fn mixed_campaign_batch_is_rejected() {
        let (store, _dir) = open_store();
        let mut ids = seed_campaign(&store, "c1", 10_000, &[500]);
        ids.extend(seed_campaign(&store, "c2", 10_000, &[700]));
        let err = store
            .settle_purchase(&ids, &donor("ada"), "square", "pay_1", None, 100)
            .unwrap_err();
        assert!(matches!(err, StoreError::MixedCampaigns));
    }

    #[test]
    fn webhook_replay_increments_exactly_once() {
        let (store, _dir) = open_store();
        let ids = seed_campaign(&store, "c1", 10_000, &[500, 1_000]);

        let first = store
            .reconcile_succeeded("stripe", "pi_1", None, &ids, &donor("ada"), 100)
            .unwrap();
        assert!(matches!(first, ReconcileOutcome::Applied { amount_cents: 1_500, .. }));

        for _ in 0..3 {
            let replay = store
                .reconcile_succeeded("stripe", "pi_1", None, &ids, &donor("ada"), 101)
                .unwrap();
            assert!(matches!(replay, ReconcileOutcome::DuplicateDelivery));
        }
        assert_eq!(store.campaign("c1").unwrap().unwrap().total_raised_cents, 1_500);
    }

    #[test]
    fn webhook_after_synchronous_settlement_normalizes_without_increment() {
        let (store, _dir) = open_store();
        let ids = seed_campaign(&store, "c1", 10_000, &[500]);
        store
            .settle_purchase(&ids, &donor("ada"), "square", "pay_a", None, 100)
            .unwrap();

        // A late webhook for a different payment that references the same
        // square must not flip anything or touch the ledger.
        let outcome = store
            .reconcile_succeeded("square", "pay_b", None, &ids, &donor("ada"), 101)
            .unwrap();
        assert!(matches!(outcome, ReconcileOutcome::NormalizedOnly));
        assert_eq!(store.campaign("c1").unwrap().unwrap().total_raised_cents, 500);

        let late = store.donations_for_payment("square", "pay_b").unwrap();
        assert_eq!(late.len(), 1);
        assert_eq!(late[0].status, DonationStatus::Succeeded);
    }

    #[test]
    fn pending_then_webhook_settles_once() {
        let (store, _dir) = open_store();
        let ids = seed_campaign(&store, "c1", 10_000, &[500]);
        store
            .record_pending(&ids, &donor("ada"), "square", "pay_1", None, 100)
            .unwrap();
        assert!(!store.square(&ids[0]).unwrap().unwrap().purchased);

        let outcome = store
            .reconcile_succeeded("square", "pay_1", Some("ord_1"), &ids, &donor("ada"), 101)
            .unwrap();
        assert!(matches!(outcome, ReconcileOutcome::Applied { amount_cents: 500, .. }));
        let donations = store.donations_for_payment("square", "pay_1").unwrap();
        assert_eq!(donations[0].status, DonationStatus::Succeeded);
        assert_eq!(donations[0].provider_order_id.as_deref(), Some("ord_1"));
    }

    #[test]
    fn unknown_square_is_a_noop() {
        let (store, _dir) = open_store();
        seed_campaign(&store, "c1", 10_000, &[500]);
        let outcome = store
            .reconcile_succeeded("stripe", "pi_1", None, &["ghost".to_string()], &donor("ada"), 100)
            .unwrap();
        assert!(matches!(outcome, ReconcileOutcome::SquareMissing));
        assert_eq!(store.campaign("c1").unwrap().unwrap().total_raised_cents, 0);
    }

    #[test]
    fn failed_webhook_only_touches_pending_rows() {
        let (store, _dir) = open_store();
        let ids = seed_campaign(&store, "c1", 10_000, &[500, 700]);
        store
            .record_pending(&ids[..1].to_vec(), &donor("ada"), "square", "pay_1", None, 100)
            .unwrap();
        store
            .settle_purchase(&ids[1..].to_vec(), &donor("bob"), "square", "pay_2", None, 100)
            .unwrap();

        assert_eq!(store.mark_payment_failed("square", "pay_1", 101).unwrap(), 1);
        assert_eq!(store.mark_payment_failed("square", "pay_2", 101).unwrap(), 0);

        let failed = store.donations_for_payment("square", "pay_1").unwrap();
        assert_eq!(failed[0].status, DonationStatus::Failed);
        assert_eq!(store.campaign("c1").unwrap().unwrap().total_raised_cents, 700);
    }

    #[test]
    fn cancel_releases_only_this_payments_squares() {
        let (store, _dir) = open_store();
        let ids = seed_campaign(&store, "c1", 10_000, &[500, 700]);
        // Square 0: sold for real. Square 1: pending, then abandoned.
        store
            .settle_purchase(&ids[..1].to_vec(), &donor("ada"), "square", "pay_a", None, 100)
            .unwrap();
        store
            .record_pending(&ids[1..].to_vec(), &donor("bob"), "square", "pay_b", None, 100)
            .unwrap();

        let report = store
            .cancel_squares(&ids[1..].to_vec(), Some("pay_b"), 101)
            .unwrap();
        assert_eq!(report.donations_cancelled, 1);
        assert_eq!(report.squares_released, 0); // pending never flipped it

        let cancelled = store.donations_for_payment("square", "pay_b").unwrap();
        assert_eq!(cancelled[0].status, DonationStatus::Cancelled);
        // The real sale is untouched.
        assert!(store.square(&ids[0]).unwrap().unwrap().purchased);
    }

    #[test]
    fn cancel_reverts_orphaned_purchased_flag() {
        let (store, _dir) = open_store();
        let ids = seed_campaign(&store, "c1", 10_000, &[500]);
        // Flip the square without any succeeded donation behind it.
        let sq = store.square(&ids[0]).unwrap().unwrap();
        let orphan = Square {
            purchased: true,
            donor_name: Some("ghost".into()),
            ..sq
        };
        store.create_campaign(
            &store.campaign("c1").unwrap().unwrap(),
            std::slice::from_ref(&orphan),
        )
        .unwrap();

        let report = store.cancel_squares(&ids, None, 101).unwrap();
        assert_eq!(report.squares_released, 1);
        let sq = store.square(&ids[0]).unwrap().unwrap();
        assert!(!sq.purchased);
        assert!(sq.donor_name.is_none());
    }

    #[test]
    fn rerandomize_preserves_purchased_values_and_target_sum() {
        let (store, _dir) = open_store();
        let ids = seed_campaign(&store, "c1", 10_000, &[2_000, 3_000, 2_500, 2_500]);
        store
            .settle_purchase(&ids[..1].to_vec(), &donor("ada"), "square", "pay_1", None, 100)
            .unwrap();

        let updated = store.rerandomize("c1").unwrap();
        assert_eq!(updated, 3);

        let squares = store.squares_for_campaign("c1").unwrap();
        let purchased: Vec<_> = squares.iter().filter(|s| s.purchased).collect();
        assert_eq!(purchased.len(), 1);
        assert_eq!(purchased[0].value_cents, 2_000);

        let total: i64 = squares.iter().map(|s| s.value_cents).sum();
        assert_eq!(total, 10_000);
        assert!(squares
            .iter()
            .filter(|s| !s.purchased)
            .all(|s| (100..=10_000).contains(&s.value_cents)));
    }

    #[test]
    fn repeated_ids_in_batch_settle_once() {
        let (store, _dir) = open_store();
        let ids = seed_campaign(&store, "c1", 10_000, &[500]);
        let doubled = vec![ids[0].clone(), ids[0].clone()];

        assert_eq!(store.load_available_batch(&doubled).unwrap().len(), 1);

        let delta = store
            .settle_purchase(&doubled, &donor("ada"), "square", "pay_1", None, 100)
            .unwrap();
        assert_eq!(delta.new_total_cents, 500);

        let donations = store.donations_for_payment("square", "pay_1").unwrap();
        let succeeded_sum: i64 = donations
            .iter()
            .filter(|d| d.status == DonationStatus::Succeeded)
            .map(|d| d.amount_cents)
            .sum();
        assert_eq!(donations.len(), 1);
        assert_eq!(
            store.campaign("c1").unwrap().unwrap().total_raised_cents,
            succeeded_sum
        );
    }

    #[test]
    fn repeated_ids_in_webhook_metadata_apply_once() {
        let (store, _dir) = open_store();
        let ids = seed_campaign(&store, "c1", 10_000, &[500]);
        let doubled = vec![ids[0].clone(), ids[0].clone()];

        let outcome = store
            .reconcile_succeeded("stripe", "pi_1", None, &doubled, &donor("ada"), 100)
            .unwrap();
        assert!(matches!(outcome, ReconcileOutcome::Applied { amount_cents: 500, .. }));
        assert_eq!(store.campaign("c1").unwrap().unwrap().total_raised_cents, 500);
        assert_eq!(store.donations_for_payment("stripe", "pi_1").unwrap().len(), 1);
    }

    #[test]
    fn cancel_with_payment_id_scopes_to_that_payment() {
        let (store, _dir) = open_store();
        let ids = seed_campaign(&store, "c1", 10_000, &[500]);
        // Two pending payments racing for the same square.
        store
            .record_pending(&ids, &donor("ada"), "square", "pay_a", None, 100)
            .unwrap();
        store
            .record_pending(&ids, &donor("bob"), "square", "pay_b", None, 100)
            .unwrap();

        let report = store.cancel_squares(&ids, Some("pay_b"), 101).unwrap();
        assert_eq!(report.donations_cancelled, 1);

        let a = store.donations_for_payment("square", "pay_a").unwrap();
        assert_eq!(a[0].status, DonationStatus::Pending);
        let b = store.donations_for_payment("square", "pay_b").unwrap();
        assert_eq!(b[0].status, DonationStatus::Cancelled);
    }

    #[test]
    fn failure_then_success_out_of_order_settles_once() {
        let (store, _dir) = open_store();
        let ids = seed_campaign(&store, "c1", 10_000, &[500]);
        store
            .record_pending(&ids, &donor("ada"), "square", "pay_1", None, 100)
            .unwrap();
        assert_eq!(store.mark_payment_failed("square", "pay_1", 101).unwrap(), 1);

        // The success confirmation lands after the failure event.
        let outcome = store
            .reconcile_succeeded("square", "pay_1", None, &ids, &donor("ada"), 102)
            .unwrap();
        assert!(matches!(outcome, ReconcileOutcome::Applied { amount_cents: 500, .. }));
        let donations = store.donations_for_payment("square", "pay_1").unwrap();
        assert_eq!(donations[0].status, DonationStatus::Succeeded);
        assert_eq!(store.campaign("c1").unwrap().unwrap().total_raised_cents, 500);
    }

    #[test]
    fn cancelled_row_stays_cancelled_when_square_already_sold() {
        let (store, _dir) = open_store();
        let ids = seed_campaign(&store, "c1", 10_000, &[500]);
        store
            .record_pending(&ids, &donor("bob"), "square", "pay_b", None, 100)
            .unwrap();
        store.cancel_squares(&ids, Some("pay_b"), 101).unwrap();
        store
            .settle_purchase(&ids, &donor("ada"), "square", "pay_a", None, 102)
            .unwrap();

        // A late success for the cancelled payment cannot resurrect its row
        // once the square was sold to someone else.
        let outcome = store
            .reconcile_succeeded("square", "pay_b", None, &ids, &donor("bob"), 103)
            .unwrap();
        assert!(matches!(outcome, ReconcileOutcome::NormalizedOnly));
        let b = store.donations_for_payment("square", "pay_b").unwrap();
        assert_eq!(b[0].status, DonationStatus::Cancelled);
        assert_eq!(store.campaign("c1").unwrap().unwrap().total_raised_cents, 500);
    }
}
