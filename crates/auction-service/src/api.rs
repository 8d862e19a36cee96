//! HTTP API for submitters, operators and monitoring.

use alloy::primitives::{Address, Signature};
use auction_config::ApiConfig;
use auction_core::{AuctionEngine, AuctionError, BatchSummary};
use auction_settlement::{SettlementError, SettlementReport};
use auction_types::{
	Ciphertext, DecryptedIntent, FailureReason, Intent, IntentState, IntentStatus, Side,
	TransactionHash,
};
use axum::{
	extract::{Path, Query, State},
	http::{header, StatusCode},
	response::{IntoResponse, Json, Response},
	routing::{get, post},
	Router,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, instrument, warn};

/// API server exposing the auction engine.
pub struct ApiServer {
	host: String,
	port: u16,
	engine: Arc<AuctionEngine>,
}

impl ApiServer {
	pub fn new(config: &ApiConfig, engine: Arc<AuctionEngine>) -> Self {
		Self {
			host: config.host.clone(),
			port: config.port,
			engine,
		}
	}

	pub fn router(engine: Arc<AuctionEngine>) -> Router {
		Router::new()
			.route("/health", get(health_check))
			.route("/metrics", get(get_metrics))
			// Submission and read boundaries
			.route("/intents", post(submit_intent).get(list_intents))
			.route("/intents/sealed", post(submit_sealed))
			.route("/intents/{id}", get(get_intent))
			// Batches and the operator boundary
			.route("/batches", get(list_batches))
			.route("/batches/close", post(close_batch))
			.route("/batches/settle", post(settle_batch))
			.with_state(AppState { engine })
			.layer(TraceLayer::new_for_http())
			.layer(CorsLayer::permissive())
	}

	#[instrument(skip_all, fields(host = %self.host, port = self.port))]
	pub async fn run<F>(self, shutdown: F) -> anyhow::Result<()>
	where
		F: Future<Output = ()> + Send + 'static,
	{
		let app = Self::router(self.engine);
		let listener = tokio::net::TcpListener::bind((self.host.as_str(), self.port)).await?;

		info!("API server listening on {}:{}", self.host, self.port);

		axum::serve(listener, app)
			.with_graceful_shutdown(shutdown)
			.await?;

		Ok(())
	}
}

#[derive(Clone)]
struct AppState {
	engine: Arc<AuctionEngine>,
}

/// Message an operator signs to authorize settling `(market, epoch)`.
pub fn settle_message(market: &str, epoch: u64) -> String {
	format!("settle:{}:{}", market, epoch)
}

/// Message an operator signs to authorize closing `(market, epoch)`.
pub fn close_message(market: &str, epoch: u64) -> String {
	format!("close:{}:{}", market, epoch)
}

struct ApiError(AuctionError);

impl From<AuctionError> for ApiError {
	fn from(e: AuctionError) -> Self {
		ApiError(e)
	}
}

impl IntoResponse for ApiError {
	fn into_response(self) -> Response {
		let error = self.0;
		let status = match &error {
			AuctionError::Batch(e) if e.is_empty_batch() => {
				return (
					StatusCode::OK,
					Json(serde_json::json!({ "notice": error.to_string() })),
				)
					.into_response();
			}
			AuctionError::InvalidInput(_) => StatusCode::BAD_REQUEST,
			AuctionError::NotFound(_) | AuctionError::Settlement(SettlementError::NotFound(_)) => {
				StatusCode::NOT_FOUND
			}
			AuctionError::Unauthorized(_) => StatusCode::FORBIDDEN,
			AuctionError::Settlement(SettlementError::AlreadyInFlight(_)) => {
				return (
					StatusCode::CONFLICT,
					Json(serde_json::json!({ "notice": "settlement already pending" })),
				)
					.into_response();
			}
			AuctionError::Settlement(SettlementError::AwaitingConfirmation { .. }) => {
				StatusCode::ACCEPTED
			}
			AuctionError::Settlement(SettlementError::AlreadySettled { .. }) => {
				StatusCode::CONFLICT
			}
			AuctionError::Settlement(SettlementError::Reverted { .. })
			| AuctionError::Settlement(SettlementError::Delivery(_))
			| AuctionError::Delivery(_)
			| AuctionError::Timelock(_)
			| AuctionError::Scanner(_) => StatusCode::BAD_GATEWAY,
			_ => StatusCode::INTERNAL_SERVER_ERROR,
		};
		if status.is_server_error() {
			warn!(error = %error, "request failed");
		}
		(status, Json(serde_json::json!({ "error": error.to_string() }))).into_response()
	}
}

/// Intent as shown to its owner. `decrypted` stays null while sealed.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct IntentView {
	id: String,
	owner: String,
	target_block: u64,
	status: IntentStatus,
	ciphertext: Ciphertext,
	submission_tx: Option<TransactionHash>,
	decrypted: Option<DecryptedIntent>,
	inclusion_block: Option<u64>,
	settlement_price: Option<Decimal>,
	failure: Option<FailureReason>,
}

impl From<Intent> for IntentView {
	fn from(intent: Intent) -> Self {
		let failure = match &intent.state {
			IntentState::Failed { reason } => Some(reason.clone()),
			_ => None,
		};
		Self {
			status: intent.status(),
			decrypted: intent.state.decrypted().cloned(),
			inclusion_block: intent.state.inclusion_block(),
			settlement_price: intent.state.settlement_price(),
			failure,
			id: intent.id,
			owner: intent.owner,
			target_block: intent.target_block,
			ciphertext: intent.ciphertext,
			submission_tx: intent.submission_tx,
		}
	}
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitIntentRequest {
	owner: String,
	target_block: u64,
	market: String,
	side: Side,
	amount: Decimal,
	slippage_bps: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitSealedRequest {
	owner: String,
	target_block: u64,
	ciphertext: Ciphertext,
	submission_tx: Option<TransactionHash>,
}

#[derive(Debug, Deserialize)]
struct OwnerQuery {
	owner: Option<String>,
}

/// Operator request for `(market, epoch)`. `signature` is a 65-byte hex
/// signature over [`close_message`] or [`settle_message`].
#[derive(Debug, Deserialize)]
struct OperatorRequest {
	market: String,
	epoch: u64,
	signature: String,
}

async fn health_check(State(state): State<AppState>) -> Response {
	match state.engine.current_block().await {
		Ok(height) => Json(serde_json::json!({
			"status": "ok",
			"auction": state.engine.config().auction.id,
			"chainHead": height,
		}))
		.into_response(),
		Err(e) => (
			StatusCode::SERVICE_UNAVAILABLE,
			Json(serde_json::json!({ "status": "unavailable", "error": e.to_string() })),
		)
			.into_response(),
	}
}

/// Prometheus-format metrics
async fn get_metrics(State(state): State<AppState>) -> impl IntoResponse {
	(
		[(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
		state.engine.metrics().render(),
	)
}

async fn submit_intent(
	State(state): State<AppState>,
	Json(request): Json<SubmitIntentRequest>,
) -> Result<(StatusCode, Json<IntentView>), ApiError> {
	let decrypted = DecryptedIntent {
		market: request.market,
		side: request.side,
		amount: request.amount,
		slippage_bps: request.slippage_bps,
	};
	let intent = state
		.engine
		.submit_intent(&request.owner, request.target_block, decrypted)
		.await?;
	Ok((StatusCode::CREATED, Json(intent.into())))
}

async fn submit_sealed(
	State(state): State<AppState>,
	Json(request): Json<SubmitSealedRequest>,
) -> Result<(StatusCode, Json<IntentView>), ApiError> {
	let intent = state
		.engine
		.submit_sealed(
			&request.owner,
			request.target_block,
			request.ciphertext,
			request.submission_tx,
		)
		.await?;
	Ok((StatusCode::CREATED, Json(intent.into())))
}

async fn list_intents(
	State(state): State<AppState>,
	Query(query): Query<OwnerQuery>,
) -> Result<Json<Vec<IntentView>>, ApiError> {
	let intents = state.engine.list_intents(query.owner.as_deref()).await?;
	Ok(Json(intents.into_iter().map(IntentView::from).collect()))
}

async fn get_intent(
	State(state): State<AppState>,
	Path(id): Path<String>,
) -> Result<Json<IntentView>, ApiError> {
	Ok(Json(state.engine.get_intent(&id).await?.into()))
}

async fn list_batches(State(state): State<AppState>) -> Result<Json<Vec<BatchSummary>>, ApiError> {
	let mut batches = state.engine.list_batches().await?;
	batches.sort_by(|a, b| {
		a.key
			.epoch
			.cmp(&b.key.epoch)
			.then_with(|| a.key.market.cmp(&b.key.market))
	});
	Ok(Json(batches.iter().map(BatchSummary::from).collect()))
}

async fn close_batch(
	State(state): State<AppState>,
	Json(request): Json<OperatorRequest>,
) -> Result<Json<BatchSummary>, ApiError> {
	let message = close_message(&request.market, request.epoch);
	let caller = recover_caller(&message, &request.signature)?;
	let batch = state
		.engine
		.close_batch(caller, &request.market, request.epoch)
		.await?;
	Ok(Json(BatchSummary::from(&batch)))
}

async fn settle_batch(
	State(state): State<AppState>,
	Json(request): Json<OperatorRequest>,
) -> Result<Json<SettlementReport>, ApiError> {
	let message = settle_message(&request.market, request.epoch);
	let caller = recover_caller(&message, &request.signature)?;
	let report = state
		.engine
		.settle(caller, &request.market, request.epoch)
		.await?;
	Ok(Json(report))
}

/// EIP-191 signer of `message`.
fn recover_caller(message: &str, signature: &str) -> Result<Address, AuctionError> {
	let bytes = hex::decode(signature.trim().trim_start_matches("0x"))
		.map_err(|e| AuctionError::InvalidInput(format!("signature is not hex: {}", e)))?;
	let signature = Signature::try_from(bytes.as_slice())
		.map_err(|e| AuctionError::InvalidInput(format!("invalid signature: {}", e)))?;
	signature
		.recover_address_from_msg(message)
		.map_err(|e| AuctionError::InvalidInput(format!("cannot recover signer: {}", e)))
}
