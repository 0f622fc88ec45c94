//! API route handlers

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

use super::SharedState;
use crate::error::NodeError;
use crate::operation::{OperationId, OperationKind, OperationResult};
use crate::pipeline::{self, AskRequest, AssetRequest, FetchRequest};

/// Error body returned with every non-2xx response.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: u16,
    pub message: String,
}

type ApiError = (StatusCode, Json<ErrorBody>);

fn api_error(err: NodeError) -> ApiError {
    let status = match &err {
        NodeError::InvalidOperationId(_) | NodeError::Validation(_) => StatusCode::BAD_REQUEST,
        NodeError::OperationNotFound(_) => StatusCode::NOT_FOUND,
        _ => {
            warn!(error = %err, "API request failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (
        status,
        Json(ErrorBody {
            code: status.as_u16(),
            message: err.to_string(),
        }),
    )
}

fn started(id: OperationId) -> (StatusCode, Json<Value>) {
    (StatusCode::ACCEPTED, Json(json!({ "operationId": id })))
}

/// Health check endpoint
pub async fn health() -> impl IntoResponse {
    "OK"
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InfoResponse {
    pub peer_id: String,
    pub blockchains: Vec<String>,
    pub version: String,
}

/// GET /info
pub async fn info(State(ctx): State<SharedState>) -> Json<InfoResponse> {
    Json(InfoResponse {
        peer_id: ctx.peer_id().to_string(),
        blockchains: ctx.blockchain.implementation_names(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// POST /publish
pub async fn publish(
    State(ctx): State<SharedState>,
    Json(req): Json<AssetRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    pipeline::start_publish(&ctx, req).map(started).map_err(api_error)
}

/// POST /update
pub async fn update(
    State(ctx): State<SharedState>,
    Json(req): Json<AssetRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    pipeline::start_update(&ctx, req).map(started).map_err(api_error)
}

/// POST /local-store
pub async fn local_store(
    State(ctx): State<SharedState>,
    Json(req): Json<AssetRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    pipeline::start_local_store(&ctx, req).map(started).map_err(api_error)
}

/// POST /get
pub async fn get(
    State(ctx): State<SharedState>,
    Json(req): Json<FetchRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    pipeline::start_get(&ctx, req).map(started).map_err(api_error)
}

/// POST /ask
pub async fn ask(
    State(ctx): State<SharedState>,
    Json(req): Json<AskRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    pipeline::start_ask(&ctx, req).map(started).map_err(api_error)
}

/// GET /operations/:kind/:operation_id
pub async fn operation_result(
    State(ctx): State<SharedState>,
    Path((kind, operation_id)): Path<(String, String)>,
) -> Result<Json<OperationResult>, ApiError> {
    let kind: OperationKind = kind.parse().map_err(api_error)?;
    ctx.operations
        .get_result(kind, &operation_id)
        .map(Json)
        .map_err(api_error)
}

#[derive(Deserialize)]
pub struct FinalityQuery {
    pub ual: String,
}

/// GET /finality?ual=
pub async fn finality(
    State(ctx): State<SharedState>,
    Query(query): Query<FinalityQuery>,
) -> Result<Json<Value>, ApiError> {
    let count = ctx.finality.count_for_ual(&query.ual).map_err(api_error)?;
    Ok(Json(json!({ "ual": query.ual, "finality": count })))
}
