//! Durable HTTP request/response payloads and the asynchronous 202-polling pattern.

use std::collections::BTreeMap;

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::errors::OrchestrationError;

/// Token acquisition hint passed through to the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagedIdentityTokenSource {
    pub resource: String,
    #[serde(default = "managed_identity_kind")]
    pub kind: String,
}

fn managed_identity_kind() -> String {
    "AzureManagedIdentity".to_string()
}

impl ManagedIdentityTokenSource {
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            kind: managed_identity_kind(),
        }
    }
}

/// An HTTP request issued durably by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DurableHttpRequest {
    pub method: String,
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_source: Option<ManagedIdentityTokenSource>,
    /// Follow `202 Accepted` + `Location` responses until a final response arrives.
    #[serde(default = "async_pattern_default")]
    pub asynchronous_pattern_enabled: bool,
}

fn async_pattern_default() -> bool {
    true
}

impl DurableHttpRequest {
    pub fn new(method: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            uri: uri.into(),
            content: None,
            headers: BTreeMap::new(),
            token_source: None,
            asynchronous_pattern_enabled: true,
        }
    }

    pub fn get(uri: impl Into<String>) -> Self {
        Self::new("GET", uri)
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_token_source(mut self, source: ManagedIdentityTokenSource) -> Self {
        self.token_source = Some(source);
        self
    }

    pub fn with_async_pattern(mut self, enabled: bool) -> Self {
        self.asynchronous_pattern_enabled = enabled;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), OrchestrationError> {
        crate::actions::require_name("HTTP method", &self.method)?;
        crate::actions::require_name("HTTP uri", &self.uri)?;
        Ok(())
    }

    /// Follow-up poll for a `202 Accepted` response: a GET against `location`
    /// that keeps the caller's headers and token source.
    pub(crate) fn poll_request(&self, location: &str) -> Self {
        Self {
            method: "GET".to_string(),
            uri: location.to_string(),
            content: None,
            headers: self.headers.clone(),
            token_source: self.token_source.clone(),
            asynchronous_pattern_enabled: self.asynchronous_pattern_enabled,
        }
    }
}

/// Response produced by the host for a durable HTTP call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DurableHttpResponse {
    pub status_code: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl DurableHttpResponse {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Location to poll next, when the response asks the caller to come back later.
    pub fn poll_location(&self) -> Option<&str> {
        if self.status_code == 202 {
            self.header("Location")
        } else {
            None
        }
    }

    /// Delay before the next poll: `Retry-After` in whole seconds, or `default`
    /// when the header is missing, negative, or out of range.
    pub fn retry_after(&self, default: Duration) -> Duration {
        self.header("Retry-After")
            .and_then(|v| v.trim().parse::<i64>().ok())
            .filter(|secs| *secs >= 0)
            .and_then(Duration::try_seconds)
            .unwrap_or(default)
    }
}
