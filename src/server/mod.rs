// HTTP surface: purchase endpoints, provider webhooks, campaign setup.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::ledger::format_cents;
use crate::provider::SettleStatus;
use crate::purchase::{Orchestrator, PurchaseError};
use crate::store::{Campaign, DonorInfo, Square};

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/purchase/intent", post(create_intent))
        .route("/api/purchase/process", post(process_purchase))
        .route("/api/purchase/cancel", post(cancel_purchase))
        .route("/webhooks/stripe", post(stripe_webhook))
        .route("/webhooks/square", post(square_webhook))
        .route("/api/campaigns", post(create_campaign))
        .route("/api/campaigns/:id", get(get_campaign))
        .route("/api/campaigns/:id/rerandomize", post(rerandomize_campaign))
        .route("/health", get(health_check))
        .with_state(state)
}

pub async fn run_server(
    port: u16,
    orchestrator: Arc<Orchestrator>,
    shutdown_grace: Duration,
) -> anyhow::Result<()> {
    let app = router(AppState { orchestrator });
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let (signal_tx, signal_rx) = tokio::sync::oneshot::channel::<()>();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received; draining in-flight requests");
        let _ = signal_tx.send(());
    });

    tokio::select! {
        res = server => res?,
        _ = async {
            let _ = signal_rx.await;
            tokio::time::sleep(shutdown_grace).await;
        } => {
            warn!(grace = ?shutdown_grace, "drain grace period elapsed; exiting");
        }
    }
    Ok(())
}

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

// ---- request / response shapes ----

// Both endpoints accept a single squareId or a squareIds batch.
fn merge_square_ids(single: Option<String>, mut batch: Vec<String>) -> Vec<String> {
    if let Some(id) = single {
        if !batch.contains(&id) {
            batch.insert(0, id);
        }
    }
    batch
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IntentRequest {
    square_id: Option<String>,
    #[serde(default)]
    square_ids: Vec<String>,
    donor_email: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct IntentResponse {
    provider: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_secret: Option<String>,
    amount: String,
    square_ids: Vec<String>,
    campaign_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProcessRequest {
    square_id: Option<String>,
    #[serde(default)]
    square_ids: Vec<String>,
    source_id: String,
    donor_name: Option<String>,
    donor_email: Option<String>,
    #[serde(default)]
    is_anonymous: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProcessResponse {
    success: bool,
    provider: String,
    payment_id: String,
    status: String,
    squares_processed: usize,
    total_amount: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CancelRequest {
    #[serde(default)]
    square_ids: Vec<String>,
    payment_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CancelResponse {
    success: bool,
    donations_cancelled: usize,
    squares_released: usize,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateCampaignRequest {
    name: String,
    goal_cents: i64,
    rows: u16,
    cols: u16,
    min_value_cents: i64,
    max_value_cents: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CampaignResponse {
    id: String,
    name: String,
    goal: String,
    total_raised: String,
    active: bool,
    rows: u16,
    cols: u16,
    squares: Vec<SquareView>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SquareView {
    id: String,
    x: u16,
    y: u16,
    value: String,
    purchased: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    donor_name: Option<String>,
}

impl CampaignResponse {
    fn from_parts(campaign: Campaign, squares: Vec<Square>) -> Self {
        Self {
            id: campaign.id,
            name: campaign.name,
            goal: format_cents(campaign.goal_cents),
            total_raised: format_cents(campaign.total_raised_cents),
            active: campaign.active,
            rows: campaign.rows,
            cols: campaign.cols,
            squares: squares
                .into_iter()
                .map(|s| SquareView {
                    id: s.id,
                    x: s.x,
                    y: s.y,
                    value: format_cents(s.value_cents),
                    purchased: s.purchased,
                    // Anonymous donors stay anonymous in the public grid.
                    donor_name: if s.is_anonymous { None } else { s.donor_name },
                })
                .collect(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    success: bool,
    error: String,
}

fn error_response(e: PurchaseError) -> (StatusCode, Json<ErrorBody>) {
    let status = match &e {
        PurchaseError::Validation(_) | PurchaseError::ProviderNotConfigured(_) => {
            StatusCode::BAD_REQUEST
        }
        PurchaseError::Conflict(_) => StatusCode::CONFLICT,
        PurchaseError::Declined(_) => StatusCode::PAYMENT_REQUIRED,
        PurchaseError::ProviderTransient(_) => StatusCode::BAD_GATEWAY,
        PurchaseError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        error!(error = %e, "purchase request failed");
    }
    (
        status,
        Json(ErrorBody {
            success: false,
            error: e.to_string(),
        }),
    )
}

fn status_label(status: SettleStatus) -> &'static str {
    match status {
        SettleStatus::Succeeded => "succeeded",
        SettleStatus::Pending => "pending",
        SettleStatus::Failed => "failed",
    }
}

// ---- handlers ----

async fn create_intent(
    State(state): State<AppState>,
    Json(req): Json<IntentRequest>,
) -> impl IntoResponse {
    let square_ids = merge_square_ids(req.square_id, req.square_ids);
    match state
        .orchestrator
        .create_intent(&square_ids, req.donor_email.as_deref())
        .await
    {
        Ok(outcome) => (
            StatusCode::OK,
            Json(IntentResponse {
                provider: outcome.provider.to_string(),
                client_secret: outcome.client_secret,
                amount: format_cents(outcome.amount_cents),
                square_ids: outcome.square_ids,
                campaign_id: outcome.campaign_id,
            }),
        )
            .into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn process_purchase(
    State(state): State<AppState>,
    Json(req): Json<ProcessRequest>,
) -> impl IntoResponse {
    let square_ids = merge_square_ids(req.square_id, req.square_ids);
    let donor = DonorInfo {
        name: req.donor_name,
        email: req.donor_email,
        is_anonymous: req.is_anonymous,
    };
    match state
        .orchestrator
        .process(&square_ids, &req.source_id, donor)
        .await
    {
        Ok(outcome) => (
            StatusCode::OK,
            Json(ProcessResponse {
                success: true,
                provider: outcome.provider.to_string(),
                payment_id: outcome.payment_id,
                status: status_label(outcome.status).to_string(),
                squares_processed: outcome.squares_processed,
                total_amount: format_cents(outcome.total_cents),
            }),
        )
            .into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn cancel_purchase(
    State(state): State<AppState>,
    Json(req): Json<CancelRequest>,
) -> impl IntoResponse {
    let report = state
        .orchestrator
        .cancel(&req.square_ids, req.payment_id.as_deref());
    (
        StatusCode::OK,
        Json(CancelResponse {
            success: true,
            donations_cancelled: report.donations_cancelled,
            squares_released: report.squares_released,
        }),
    )
}

async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    match state.orchestrator.handle_stripe_webhook(&body, &headers).await {
        Ok(_) => (StatusCode::OK, "OK".to_string()),
        Err(e) => {
            error!("Webhook processing failed: {}", e);
            (
                StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                e.to_string(),
            )
        }
    }
}

async fn square_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    match state.orchestrator.handle_square_webhook(&body, &headers).await {
        Ok(_) => (StatusCode::OK, "OK".to_string()),
        Err(e) => {
            error!("Webhook processing failed: {}", e);
            (
                StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                e.to_string(),
            )
        }
    }
}

async fn create_campaign(
    State(state): State<AppState>,
    Json(req): Json<CreateCampaignRequest>,
) -> impl IntoResponse {
    match state.orchestrator.create_campaign(
        &req.name,
        req.goal_cents,
        req.rows,
        req.cols,
        req.min_value_cents,
        req.max_value_cents,
    ) {
        Ok((campaign, squares)) => (
            StatusCode::CREATED,
            Json(CampaignResponse::from_parts(campaign, squares)),
        )
            .into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn get_campaign(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.orchestrator.campaign_with_squares(&id) {
        Ok((campaign, squares)) => (
            StatusCode::OK,
            Json(CampaignResponse::from_parts(campaign, squares)),
        )
            .into_response(),
        Err(PurchaseError::Validation(msg)) => (
            StatusCode::NOT_FOUND,
            Json(ErrorBody {
                success: false,
                error: msg,
            }),
        )
            .into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn rerandomize_campaign(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.orchestrator.rerandomize(&id) {
        Ok(updated) => (
            StatusCode::OK,
            Json(serde_json::json!({ "success": true, "squaresUpdated": updated })),
        )
            .into_response(),
        Err(e) => error_response(e).into_response(),
    }
}
