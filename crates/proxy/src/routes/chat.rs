//! Chat route handler.
//!
//! Runs the request pipeline: validate, forward, parse. Any stage failure
//! short-circuits into an [`AppError`](crate::error::AppError) response.

use axum::{Extension, Json, body::Bytes, extract::State};
use tracing::{info, instrument};

use storechat_core::{ChatResponse, RequestId};

use crate::error::Result;
use crate::pipeline::{forward_to_webhook, parse_response, validate_request};
use crate::state::AppState;

/// Handle `POST /api/chat`.
#[instrument(skip(state, body), fields(request_id = %request_id))]
pub async fn chat(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    body: Bytes,
) -> Result<Json<ChatResponse>> {
    let request = validate_request(&body)?;

    let raw = forward_to_webhook(
        state.http(),
        &state.config().webhook,
        &request,
        request_id.as_str(),
    )
    .await?;

    let response = parse_response(&raw)?;
    info!(
        kind = ?request.kind,
        event_type = %response.event_type,
        cards = response.cards.len(),
        "Chat turn completed"
    );

    Ok(Json(response))
}
