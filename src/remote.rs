//! Supabase REST/RPC client.
//!
//! Used when check-in scans are forwarded to a hosted Supabase project
//! instead of the local database: the edge function calls the
//! `toggle_client_checkin_status` Postgres function with the service-role
//! key and relays its JSON result.

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::error::{DeskError, DeskResult};

/// Default timeout for RPC requests.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// Timeout used for the lightweight reachability check.
const CONNECTIVITY_TIMEOUT: Duration = Duration::from_secs(5);

const TOGGLE_RPC: &str = "toggle_client_checkin_status";

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise a Supabase project URL:
/// - ensure a scheme is present (https, or http for localhost)
/// - strip trailing slashes
/// - strip a trailing `/rest/v1` segment
pub fn normalize_supabase_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }
    if let Some(stripped) = url.strip_suffix("/rest/v1") {
        url = stripped.to_string();
    }
    while url.ends_with('/') {
        url.pop();
    }

    url
}

// ---------------------------------------------------------------------------
// Response shapes
// ---------------------------------------------------------------------------

/// JSON returned by `toggle_client_checkin_status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcToggleResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ConnectivityResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Convert a `reqwest::Error` into a user-friendly message.
fn friendly_error(url: &str, err: &reqwest::Error) -> String {
    if err.is_connect() {
        return format!("Cannot reach Supabase at {url}");
    }
    if err.is_timeout() {
        return format!("Connection to {url} timed out");
    }
    if err.is_builder() {
        return format!("Invalid Supabase URL: {url}");
    }
    format!("Network error communicating with {url}: {err}")
}

/// Convert an HTTP status code into a user-friendly message.
fn status_error(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "Supabase key is invalid or expired".to_string(),
        403 => "Supabase key is not allowed to call this function".to_string(),
        404 => "Supabase function not found".to_string(),
        s if s >= 500 => format!("Supabase server error (HTTP {s})"),
        s => format!("Unexpected response from Supabase (HTTP {s})"),
    }
}

/// Turn an RPC HTTP response into a result. PostgREST errors carry a
/// `message` field; a `success: false` body mentioning an invalid barcode
/// is a lookup miss rather than a remote failure.
pub fn interpret_rpc_response(status: StatusCode, body: &str) -> DeskResult<RpcToggleResponse> {
    if !status.is_success() {
        let detail = serde_json::from_str::<Value>(body).ok().and_then(|json| {
            json.get("message")
                .or_else(|| json.get("error"))
                .and_then(Value::as_str)
                .map(String::from)
        });
        let message = match detail {
            Some(m) => format!("{m} (HTTP {})", status.as_u16()),
            None => status_error(status),
        };
        return Err(DeskError::remote(message));
    }

    let parsed: RpcToggleResponse = serde_json::from_str(body)
        .map_err(|e| DeskError::remote(format!("Invalid JSON from Supabase: {e}")))?;

    if parsed.success {
        return Ok(parsed);
    }
    let message = parsed
        .error
        .clone()
        .unwrap_or_else(|| "Check-in failed".to_string());
    if message.to_lowercase().contains("invalid barcode") || message.contains("not found") {
        Err(DeskError::not_found(message))
    } else {
        Err(DeskError::remote(message))
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct SupabaseClient {
    base_url: String,
    api_key: Zeroizing<String>,
    http: Client,
}

impl SupabaseClient {
    pub fn new(url: &str, api_key: &str) -> DeskResult<Self> {
        let base_url = normalize_supabase_url(url);
        if api_key.trim().is_empty() {
            return Err(DeskError::validation("Supabase key is required"));
        }
        let http = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| DeskError::remote(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            base_url,
            api_key: Zeroizing::new(api_key.trim().to_string()),
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn rpc_url(&self, function: &str) -> String {
        format!("{}/rest/v1/rpc/{function}", self.base_url)
    }

    /// Call `toggle_client_checkin_status(p_barcode, p_scanned_by_user_id)`.
    pub async fn toggle_checkin(
        &self,
        barcode: &str,
        scanned_by: Option<&str>,
    ) -> DeskResult<RpcToggleResponse> {
        let url = self.rpc_url(TOGGLE_RPC);
        let body = serde_json::json!({
            "p_barcode": barcode.trim(),
            "p_scanned_by_user_id": scanned_by,
        });

        let resp = self
            .http
            .post(&url)
            .header("apikey", self.api_key.as_str())
            .bearer_auth(self.api_key.as_str())
            .json(&body)
            .send()
            .await
            .map_err(|e| DeskError::remote(friendly_error(&self.base_url, &e)))?;

        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        let result = interpret_rpc_response(status, &text);
        match &result {
            Ok(r) => info!(action = r.action.as_deref().unwrap_or("-"), "Remote check-in toggled"),
            Err(e) => warn!(error = %e, http_status = status.as_u16(), "Remote check-in failed"),
        }
        result
    }

    /// Hit the REST root to report reachability and latency.
    pub async fn test_connectivity(&self) -> ConnectivityResult {
        let start = Instant::now();
        let resp = self
            .http
            .get(format!("{}/rest/v1/", self.base_url))
            .header("apikey", self.api_key.as_str())
            .timeout(CONNECTIVITY_TIMEOUT)
            .send()
            .await;

        match resp {
            Err(e) => ConnectivityResult {
                success: false,
                latency_ms: None,
                error: Some(friendly_error(&self.base_url, &e)),
            },
            Ok(r) => {
                let latency = start.elapsed().as_millis() as u64;
                if r.status().is_success() {
                    ConnectivityResult {
                        success: true,
                        latency_ms: Some(latency),
                        error: None,
                    }
                } else {
                    ConnectivityResult {
                        success: false,
                        latency_ms: Some(latency),
                        error: Some(status_error(r.status())),
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for SupabaseClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SupabaseClient")
            .field("base_url", &self.base_url)
            .field("api_key", &"***")
            .finish()
    }
}
