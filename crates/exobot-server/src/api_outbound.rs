//! `POST /outbound/call`: places a call through Exotel.

use crate::api::ApiError;
use crate::config::OutboundConfig;
use crate::AppState;
use axum::extract::{rejection::JsonRejection, Extension, Json};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Request body for an outbound call.
#[derive(Debug, Deserialize)]
pub struct OutboundCallRequest {
    /// Number to call, in E.164 format (e.g. `+919876543210`).
    pub customer_number: String,
    /// Passed to the voice app as Exotel's `CustomField`.
    #[serde(default)]
    pub custom_field: Option<String>,
}

/// Response body for an initiated call.
#[derive(Debug, Serialize, Deserialize)]
pub struct OutboundCallResponse {
    pub status: String,
    pub message: String,
    pub customer_number: String,
    pub custom_field: Option<String>,
    pub flow_type: String,
    /// Exotel's response.
    pub result: Value,
}

/// Checks a customer number against the outbound policy.
pub fn validate_customer_number(number: &str, policy: &OutboundConfig) -> Result<(), ApiError> {
    if number.is_empty() {
        return Err(ApiError::BadRequest(
            "customer_number must not be empty".to_string(),
        ));
    }
    if policy.require_e164 && !number.starts_with('+') {
        return Err(ApiError::BadRequest(
            "Phone number must be in E.164 format (starting with +)".to_string(),
        ));
    }
    if !policy.allowed_country_codes.is_empty()
        && !policy
            .allowed_country_codes
            .iter()
            .any(|code| number.starts_with(code.as_str()))
    {
        return Err(ApiError::BadRequest(format!(
            "Phone number must start with one of: {}",
            policy.allowed_country_codes.join(", ")
        )));
    }
    Ok(())
}

/// Handler for `POST /outbound/call`.
pub async fn outbound_call_handler(
    Extension(state): Extension<Arc<AppState>>,
    payload: Result<Json<OutboundCallRequest>, JsonRejection>,
) -> Result<Json<OutboundCallResponse>, ApiError> {
    let Json(payload) = payload?;
    let customer_number = payload.customer_number.trim().to_string();
    validate_customer_number(&customer_number, &state.outbound)?;

    let custom_field = payload
        .custom_field
        .filter(|f| !f.is_empty())
        .or_else(|| state.outbound.default_custom_field.clone());

    let result = state
        .exotel
        .connect_call(&customer_number, custom_field.as_deref())
        .await
        .map_err(|e| {
            tracing::error!(customer_number = %customer_number, "failed to make outbound call: {}", e);
            ApiError::InternalServerError(e.to_string())
        })?;

    Ok(Json(OutboundCallResponse {
        status: "success".to_string(),
        message: "Outbound call initiated using existing call flow".to_string(),
        customer_number,
        custom_field,
        flow_type: "existing_voice_app".to_string(),
        result,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enforces_e164_and_country_codes() {
        let policy = OutboundConfig::default();
        assert!(validate_customer_number("+919876543210", &policy).is_ok());
        assert!(matches!(
            validate_customer_number("919876543210", &policy),
            Err(ApiError::BadRequest(msg)) if msg.contains("E.164")
        ));
        assert!(matches!(
            validate_customer_number("+14155550100", &policy),
            Err(ApiError::BadRequest(msg)) if msg.contains("+91")
        ));
        assert!(validate_customer_number("", &policy).is_err());
    }

    #[test]
    fn empty_allow_list_accepts_any_country() {
        let policy = OutboundConfig {
            allowed_country_codes: Vec::new(),
            require_e164: false,
            ..Default::default()
        };
        assert!(validate_customer_number("+14155550100", &policy).is_ok());
        assert!(validate_customer_number("09876543210", &policy).is_ok());
    }
}
