use crate::{
    config::AuthorityAppState,
    handlers::{client_ip::ClientIp, error::ApiError},
    identity::UnitType,
};
use super::models::CertResp;

use axum::{
    body::Bytes,
    extract::{Path, State},
    Json,
};
use tracing::info;

pub async fn cert_request_handler(
    State(state): State<AuthorityAppState>,
    Path(unit_type): Path<String>,
    ClientIp(public_ip): ClientIp,
    body: Bytes,
) -> Result<Json<CertResp>, ApiError> {
    let unit_type = UnitType::enrollable(&unit_type)?;

    // keygen + signing is CPU bound, keep it off the reactor
    let authority = state.authority.clone();
    let peer = public_ip.clone();
    let issued = tokio::task::spawn_blocking(move || authority.issue(unit_type, &peer, &body))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))??;

    info!(unit = %unit_type, %public_ip, "certificate issued");
    Ok(Json(issued))
}
