//! Exotel REST client for outbound calls.
//!
//! An outbound call is placed with `Calls/connect.json`: Exotel rings the
//! customer and, once they answer, connects them to the account's existing
//! voice app (`EXOTEL_APP_ID`). That app's Voicebot applet then opens the
//! media websocket to this server, so outbound calls take the same path as
//! inbound ones.

use crate::config::{Credentials, OutboundConfig};
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ExotelError {
    #[error("missing Exotel credentials: {0}")]
    MissingCredentials(String),

    #[error("Exotel request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Exotel API error {status}: {body}")]
    Status { status: u16, body: String },
}

/// Client for one Exotel account.
#[derive(Clone)]
pub struct ExotelClient {
    client: reqwest::Client,
    api_base: String,
    api_key: String,
    api_token: String,
    account_sid: String,
    caller_id: String,
    app_id: String,
    time_limit_secs: u64,
    ring_timeout_secs: u64,
}

impl std::fmt::Debug for ExotelClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExotelClient")
            .field("api_base", &self.api_base)
            .field("account_sid", &self.account_sid)
            .field("caller_id", &self.caller_id)
            .field("app_id", &self.app_id)
            .finish_non_exhaustive()
    }
}

impl ExotelClient {
    pub fn new(credentials: &Credentials, outbound: &OutboundConfig) -> Result<Self, ExotelError> {
        let required = [
            ("EXOTEL_API_KEY", &credentials.exotel_api_key),
            ("EXOTEL_API_TOKEN", &credentials.exotel_api_token),
            ("EXOTEL_ACCOUNT_SID", &credentials.exotel_account_sid),
            ("EXOTEL_CALLER_ID", &credentials.exotel_caller_id),
            ("EXOTEL_APP_ID", &credentials.exotel_app_id),
        ];
        let missing: Vec<&str> = required
            .iter()
            .filter(|(_, value)| value.is_empty())
            .map(|(name, _)| *name)
            .collect();
        if !missing.is_empty() {
            return Err(ExotelError::MissingCredentials(missing.join(", ")));
        }

        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            api_base: outbound.api_base(),
            api_key: credentials.exotel_api_key.clone(),
            api_token: credentials.exotel_api_token.clone(),
            account_sid: credentials.exotel_account_sid.clone(),
            caller_id: credentials.exotel_caller_id.clone(),
            app_id: credentials.exotel_app_id.clone(),
            time_limit_secs: outbound.call_time_limit_secs,
            ring_timeout_secs: outbound.ring_timeout_secs,
        })
    }

    /// `Calls/connect.json` endpoint for the account.
    pub fn connect_url(&self) -> String {
        format!(
            "{}/v1/Accounts/{}/Calls/connect.json",
            self.api_base, self.account_sid
        )
    }

    /// ExoML URL of the account's voice app.
    pub fn voice_app_url(&self) -> String {
        format!(
            "http://my.exotel.com/{}/exoml/start_voice/{}",
            self.account_sid, self.app_id
        )
    }

    /// Rings `customer_number` and connects the call to the voice app.
    ///
    /// Returns Exotel's JSON response, or a small JSON object describing the
    /// response when Exotel does not answer with JSON.
    pub async fn connect_call(
        &self,
        customer_number: &str,
        custom_field: Option<&str>,
    ) -> Result<Value, ExotelError> {
        let time_limit = self.time_limit_secs.to_string();
        let ring_timeout = self.ring_timeout_secs.to_string();
        let voice_app = self.voice_app_url();

        let mut form: Vec<(&str, &str)> = vec![
            ("From", customer_number),
            ("CallerId", self.caller_id.as_str()),
            ("Url", voice_app.as_str()),
            ("CallType", "trans"),
            ("TimeLimit", time_limit.as_str()),
            ("TimeOut", ring_timeout.as_str()),
        ];
        if let Some(field) = custom_field.filter(|f| !f.is_empty()) {
            form.push(("CustomField", field));
        }

        tracing::info!(
            customer_number = %customer_number,
            app_id = %self.app_id,
            "placing outbound call"
        );

        let response = self
            .client
            .post(self.connect_url())
            .basic_auth(&self.api_key, Some(&self.api_token))
            .form(&form)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            tracing::error!(status = status.as_u16(), body = %body, "Exotel rejected outbound call");
            return Err(ExotelError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let result = parse_connect_response(&body);
        if let Some(sid) = result.pointer("/Call/Sid").and_then(Value::as_str) {
            tracing::info!(call_sid = %sid, "outbound call initiated");
        }
        Ok(result)
    }
}

fn parse_connect_response(body: &str) -> Value {
    if body.trim().is_empty() {
        return json!({"success": true, "message": "Call initiated"});
    }
    serde_json::from_str(body).unwrap_or_else(|_| json!({"success": true, "response": body}))
}
