//! GENA HTTP client for event subscriptions.

use regex::Regex;
use reqwest::{Client, Method};
use std::sync::OnceLock;

use super::{UpnpError, UpnpResult};

/// Response from a successful SUBSCRIBE.
#[derive(Debug, Clone)]
pub struct SubscribeResponse {
    pub sid: String,
    /// Negotiated timeout; None when the device sent no usable TIMEOUT header
    pub timeout_secs: Option<u64>,
}

#[derive(Clone)]
pub struct GenaClient {
    client: Client,
}

impl GenaClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Sends a fresh SUBSCRIBE. Renewal is done the same way once an entry expires.
    pub async fn subscribe(
        &self,
        event_url: &str,
        callback_url: &str,
        timeout_secs: u64,
    ) -> UpnpResult<SubscribeResponse> {
        let method = Method::from_bytes(b"SUBSCRIBE")
            .map_err(|e| UpnpError::Parse(e.to_string()))?;

        let response = self
            .client
            .request(method, event_url)
            .header("CALLBACK", format!("<{}>", callback_url))
            .header("NT", "upnp:event")
            .header("TIMEOUT", format!("Second-{}", timeout_secs))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(UpnpError::Status(response.status().as_u16()));
        }

        let sid = response
            .headers()
            .get("SID")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or(UpnpError::MissingHeader("SID"))?;

        let timeout_secs = response
            .headers()
            .get("TIMEOUT")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_timeout);

        Ok(SubscribeResponse { sid, timeout_secs })
    }
}

/// Parses `Second-N` (case-insensitive). `infinite` and garbage yield None.
pub fn parse_timeout(header: &str) -> Option<u64> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)Second-([0-9]+)").ok())
        .as_ref()?
        .captures(header)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Callback URL a device should NOTIFY for `udn`.
pub fn callback_url(callback_address: &str, udn: &str) -> String {
    format!(
        "http://{}/{}",
        callback_address,
        udn.strip_prefix("uuid:").unwrap_or(udn)
    )
}
