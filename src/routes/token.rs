//! Token issuance endpoint, mounted only when `server.expose_new_token` is set.

use std::sync::Arc;

use axum::{extract::State, Json};
use tracing::info;

use crate::auth::TokenSigner;
use crate::protocol::NewTokenResponse;
use crate::tunnel::gateway::ApiError;

/// `POST /api/new-token`: mint a token for a brand-new client identity.
pub async fn new_token(
    State(signer): State<Arc<TokenSigner>>,
) -> Result<Json<NewTokenResponse>, ApiError> {
    let token = signer
        .issue()
        .map_err(|e| ApiError::Internal(format!("issue token: {e}")))?;
    info!("Issued a new client token");
    Ok(Json(NewTokenResponse { token }))
}
