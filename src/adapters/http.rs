use std::{sync::Arc, time::Duration};

use error_stack::{Report, ResultExt};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde_json::json;
use tracing::{debug, instrument, warn};

use super::config::ProviderConfig;
use super::rate_limiter::RateLimiter;
use crate::ports::{ProviderError, ProviderResult, RawPayload};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Maps a failed HTTP status to an error class. Success statuses yield `None`.
pub fn classify_status(status: StatusCode) -> Option<ProviderError> {
    if status.is_success() {
        return None;
    }
    Some(match status {
        StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ProviderError::Unauthorized,
        StatusCode::NOT_FOUND | StatusCode::GONE => ProviderError::NotFound,
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => ProviderError::Timeout,
        s if s.is_server_error() => ProviderError::TransportError,
        _ => ProviderError::Malformed,
    })
}

pub fn classify_reqwest_error(error: &reqwest::Error) -> ProviderError {
    if error.is_timeout() {
        ProviderError::Timeout
    } else if let Some(status) = error.status() {
        classify_status(status).unwrap_or(ProviderError::TransportError)
    } else if error.is_decode() {
        ProviderError::Malformed
    } else {
        ProviderError::TransportError
    }
}

/// Maps a JSON-RPC error object (`{"code": .., "message": ..}`) to an error class.
pub fn classify_rpc_error(code: i64, message: &str) -> ProviderError {
    let message = message.to_lowercase();
    match code {
        429 | -32005 => ProviderError::RateLimited,
        401 | 403 => ProviderError::Unauthorized,
        -32600 | -32601 | -32602 | -32700 => ProviderError::Malformed,
        // Solana: block not available, slot skipped, missing in long-term storage
        -32004 | -32007 | -32009 | -32011 => ProviderError::NotFound,
        _ if message.contains("rate limit") || message.contains("too many requests") => {
            ProviderError::RateLimited
        }
        _ if message.contains("timeout") || message.contains("timed out") => {
            ProviderError::Timeout
        }
        _ if message.contains("not found") => ProviderError::NotFound,
        _ => ProviderError::TransportError,
    }
}

/// Classifies the `error` member of a JSON-RPC envelope, if any.
pub fn classify_rpc_payload(payload: &RawPayload) -> Option<ProviderError> {
    let error = payload.get("error")?;
    if error.is_null() {
        return None;
    }
    let code = error.get("code").and_then(|c| c.as_i64()).unwrap_or_default();
    let message = error
        .get("message")
        .and_then(|m| m.as_str())
        .unwrap_or_default();
    Some(classify_rpc_error(code, message))
}

/// HTTP access shared by every provider client: one pooled `reqwest` client with a bounded
/// timeout, pacing through the client's own [`RateLimiter`], and classification of every failure.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    provider: String,
    base_url: String,
    client: Client,
    limiter: Arc<RateLimiter>,
}

impl HttpTransport {
    pub fn new(
        provider: &str,
        base_url: &str,
        timeout: Duration,
        limiter: RateLimiter,
    ) -> ProviderResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .change_context(ProviderError::TransportError)
            .attach_printable("Failed to build HTTP client")
            .attach_printable_lazy(|| format!("Provider: {provider}"))?;
        Ok(Self {
            provider: provider.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            limiter: Arc::new(limiter),
        })
    }

    pub fn from_config(provider: &str, config: &ProviderConfig) -> ProviderResult<Self> {
        let limiter = RateLimiter::new(
            config.requests_per_second,
            Duration::from_secs(config.rate_limit_penalty_secs),
        );
        Self::new(
            provider,
            &config.endpoint,
            Duration::from_secs(config.timeout_secs),
            limiter,
        )
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn url(&self, path: &str) -> String {
        if path.is_empty() {
            return self.base_url.clone();
        }
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    pub async fn get_json(&self, path: &str) -> ProviderResult<RawPayload> {
        let url = self.url(path);
        self.send(self.client.get(&url), &url).await
    }

    pub async fn get_json_with(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> ProviderResult<RawPayload> {
        let url = self.url(path);
        self.send(self.client.get(&url).query(query), &url).await
    }

    pub async fn post_json(&self, path: &str, body: &RawPayload) -> ProviderResult<RawPayload> {
        let url = self.url(path);
        self.send(self.client.post(&url).json(body), &url).await
    }

    /// Sends one JSON-RPC 2.0 call and returns the whole envelope. The `error` member is left for
    /// the client's `classify_error`.
    pub async fn json_rpc(&self, method: &str, params: RawPayload) -> ProviderResult<RawPayload> {
        let payload = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });
        self.post_json("", &payload)
            .await
            .attach_printable_lazy(|| format!("RPC method: {method}"))
    }

    /// Sends a JSON-RPC batch and returns the envelopes in call order, whatever order the
    /// provider answered in.
    pub async fn json_rpc_batch(
        &self,
        calls: &[(&str, RawPayload)],
    ) -> ProviderResult<Vec<RawPayload>> {
        if calls.is_empty() {
            return Ok(Vec::new());
        }
        let payload: Vec<RawPayload> = calls
            .iter()
            .enumerate()
            .map(|(id, (method, params))| {
                json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params})
            })
            .collect();
        let response = self.post_json("", &RawPayload::Array(payload)).await?;
        let RawPayload::Array(envelopes) = response else {
            return Err(Report::new(ProviderError::Malformed)
                .attach_printable("Batch response is not an array")
                .attach_printable(format!("Provider: {}", self.provider)));
        };
        let mut ordered: Vec<Option<RawPayload>> = vec![None; calls.len()];
        for envelope in envelopes {
            let id = envelope
                .get("id")
                .and_then(|id| id.as_u64())
                .and_then(|id| usize::try_from(id).ok())
                .filter(|id| *id < calls.len())
                .ok_or_else(|| {
                    Report::new(ProviderError::Malformed)
                        .attach_printable(format!("Batch envelope with unknown id: {envelope}"))
                })?;
            ordered[id] = Some(envelope);
        }
        ordered
            .into_iter()
            .enumerate()
            .map(|(id, envelope)| {
                envelope.ok_or_else(|| {
                    Report::new(ProviderError::Malformed)
                        .attach_printable(format!("Batch response is missing id {id}"))
                })
            })
            .collect()
    }

    #[instrument(skip(self, request), fields(provider = %self.provider))]
    async fn send(&self, request: RequestBuilder, url: &str) -> ProviderResult<RawPayload> {
        self.limiter.acquire().await?;
        debug!("Sending request");

        let response = request.send().await.map_err(|e| {
            let class = classify_reqwest_error(&e);
            Report::new(e)
                .change_context(class)
                .attach_printable("Failed to send request")
                .attach_printable(format!("URL: {url}"))
        })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| {
                let class = classify_reqwest_error(&e);
                Report::new(e).change_context(class)
            })
            .attach_printable("Failed to read response body")
            .attach_printable_lazy(|| format!("URL: {url}"))?;

        if let Some(class) = classify_status(status) {
            if class == ProviderError::RateLimited {
                warn!("Provider answered 429, backing off");
                self.limiter.penalize().await;
            }
            return Err(Report::new(class)
                .attach_printable(format!("HTTP error {status}"))
                .attach_printable(format!("URL: {url}"))
                .attach_printable(format!("Response: {}", truncate(&body))));
        }

        serde_json::from_str(&body)
            .change_context(ProviderError::Malformed)
            .attach_printable("Failed to parse response as json")
            .attach_printable_lazy(|| format!("URL: {url}"))
            .attach_printable_lazy(|| format!("Response: {}", truncate(&body)))
    }
}

fn truncate(body: &str) -> &str {
    const MAX: usize = 512;
    if body.len() <= MAX {
        return body;
    }
    let mut end = MAX;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_status() {
        assert_eq!(classify_status(StatusCode::OK), None);
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            Some(ProviderError::RateLimited)
        );
        assert_eq!(
            classify_status(StatusCode::FORBIDDEN),
            Some(ProviderError::Unauthorized)
        );
        assert_eq!(classify_status(StatusCode::NOT_FOUND), Some(ProviderError::NotFound));
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            Some(ProviderError::TransportError)
        );
        assert_eq!(
            classify_status(StatusCode::GATEWAY_TIMEOUT),
            Some(ProviderError::Timeout)
        );
        assert_eq!(classify_status(StatusCode::BAD_REQUEST), Some(ProviderError::Malformed));
    }

    #[test]
    fn test_classify_rpc_payload() {
        let limited = json!({"jsonrpc": "2.0", "id": 1, "error": {"code": 429, "message": "Too many requests"}});
        assert_eq!(classify_rpc_payload(&limited), Some(ProviderError::RateLimited));

        let skipped = json!({"error": {"code": -32007, "message": "Slot 5 was skipped"}});
        assert_eq!(classify_rpc_payload(&skipped), Some(ProviderError::NotFound));

        let server = json!({"error": {"code": -32000, "message": "node is behind"}});
        assert_eq!(classify_rpc_payload(&server), Some(ProviderError::TransportError));

        assert_eq!(classify_rpc_payload(&json!({"result": 1})), None);
        assert_eq!(classify_rpc_payload(&json!({"result": 1, "error": null})), None);
    }

    #[test]
    fn test_url_joining() {
        let transport = HttpTransport::new(
            "test",
            "https://api.example/v1/",
            DEFAULT_TIMEOUT,
            RateLimiter::unlimited(),
        )
        .unwrap();
        assert_eq!(transport.url("/accounts/x"), "https://api.example/v1/accounts/x");
        assert_eq!(transport.url(""), "https://api.example/v1");
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let body = "é".repeat(600);
        let cut = truncate(&body);
        assert!(cut.len() <= 512);
        assert!(body.starts_with(cut));
    }
}
