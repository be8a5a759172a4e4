//! WHIP/WHEP HTTP signaling
//!
//! A thin transport shim: it posts the SDP offer, hands back status, body
//! and `Location`, and issues the teardown DELETE. Status codes are not
//! interpreted here; retry policy lives in the negotiator.

use super::WhxpError;
use async_trait::async_trait;
use log::debug;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, LOCATION};
use reqwest::Url;
use std::time::Duration;

pub const SDP_CONTENT_TYPE: &str = "application/sdp";

/// Raw answer to an offer POST
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalingResponse {
    pub status: u16,
    pub body: String,
    pub location: Option<String>,
}

/// Signaling transport used by the negotiator and teardown
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// POST `sdp` to `endpoint` with bearer authorization
    async fn post_offer(&self, endpoint: &str, token: &str, sdp: &str) -> Result<SignalingResponse, WhxpError>;

    /// DELETE the session resource, returning the HTTP status
    async fn delete_session(&self, resource_location: &str) -> Result<u16, WhxpError>;
}

/// Resolve a `Location` header value against the endpoint it came from
pub fn resolve_location(endpoint: &str, location: &str) -> Result<String, WhxpError> {
    let base = Url::parse(endpoint)
        .map_err(|e| WhxpError::InvalidConfig(format!("Invalid endpoint URL {}: {}", endpoint, e)))?;
    let url = base
        .join(location)
        .map_err(|e| WhxpError::Teardown(format!("Invalid session location {}: {}", location, e)))?;
    Ok(url.to_string())
}

/// `Authorization` header value; an empty token still yields the header
pub fn bearer(token: &str) -> String {
    format!("Bearer {}", token)
}

/// reqwest-backed signaling transport
#[derive(Debug, Clone)]
pub struct HttpSignaling {
    client: reqwest::Client,
}

impl HttpSignaling {
    /// Create a transport whose requests time out after `request_timeout`
    pub fn new(request_timeout: Duration) -> Result<Self, WhxpError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| WhxpError::InvalidConfig(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl SignalingTransport for HttpSignaling {
    async fn post_offer(&self, endpoint: &str, token: &str, sdp: &str) -> Result<SignalingResponse, WhxpError> {
        let response = self
            .client
            .post(endpoint)
            .header(CONTENT_TYPE, SDP_CONTENT_TYPE)
            .header(AUTHORIZATION, bearer(token))
            .body(sdp.to_string())
            .send()
            .await
            .map_err(|e| WhxpError::TransientSignaling(format!("POST {} failed: {}", endpoint, e)))?;

        let status = response.status().as_u16();
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response
            .text()
            .await
            .map_err(|e| WhxpError::TransientSignaling(format!("Failed to read response from {}: {}", endpoint, e)))?;

        debug!("POST {} -> {} (location: {:?})", endpoint, status, location);
        Ok(SignalingResponse { status, body, location })
    }

    async fn delete_session(&self, resource_location: &str) -> Result<u16, WhxpError> {
        let response = self
            .client
            .delete(resource_location)
            .send()
            .await
            .map_err(|e| WhxpError::Teardown(format!("DELETE {} failed: {}", resource_location, e)))?;
        let status = response.status().as_u16();
        debug!("DELETE {} -> {}", resource_location, status);
        Ok(status)
    }
}
