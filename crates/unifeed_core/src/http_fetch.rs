/*
 * SPDX-FileCopyrightText: 2026 Unifeed Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::errors::TransportError;
use async_trait::async_trait;
use bytes::Bytes;
use rand::{thread_rng, Rng};
use reqwest::StatusCode;
use std::time::Duration;

/// One outbound HTTP exchange, as seen by protocol plugins.
///
/// Plugins never manage sockets or clients; they describe the request and the
/// service-owned transport executes it.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn post(url: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            method: "POST".to_string(),
            url: url.into(),
            headers: Vec::new(),
            body: Some(body),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: u16,
    pub body: Bytes,
    /// Provider-specified backoff, when the response carried a Retry-After.
    pub retry_after: Option<Duration>,
}

impl FetchResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// The fetch capability handed to protocol plugins.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn fetch(&self, req: FetchRequest) -> Result<FetchResponse, TransportError>;
}

/// reqwest-backed transport with bounded retry on 429/5xx and connect errors.
pub struct ReqwestTransport {
    client: reqwest::Client,
    attempts: u32,
}

impl ReqwestTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            attempts: 3,
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.clamp(1, 5);
        self
    }

    fn build(&self, req: &FetchRequest) -> Result<reqwest::RequestBuilder, TransportError> {
        let method = reqwest::Method::from_bytes(req.method.as_bytes())
            .map_err(|e| TransportError::Other(format!("bad method {}: {e}", req.method)))?;
        let mut builder = self.client.request(method, &req.url);
        for (name, value) in &req.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &req.body {
            builder = builder.body(body.clone());
        }
        Ok(builder)
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn fetch(&self, req: FetchRequest) -> Result<FetchResponse, TransportError> {
        let max_attempts = self.attempts.clamp(1, 5);
        let mut backoff = Duration::from_millis(200);
        for attempt in 0..max_attempts {
            let builder = self.build(&req)?;
            match builder.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if should_retry_status(status) && attempt + 1 < max_attempts {
                        sleep_with_jitter(backoff).await;
                        backoff = backoff.saturating_mul(2).min(Duration::from_secs(5));
                        continue;
                    }
                    let retry_after = parse_retry_after(resp.headers());
                    let body = resp.bytes().await.map_err(TransportError::from)?;
                    return Ok(FetchResponse {
                        status: status.as_u16(),
                        body,
                        retry_after,
                    });
                }
                Err(e) => {
                    if attempt + 1 >= max_attempts {
                        return Err(e.into());
                    }
                    sleep_with_jitter(backoff).await;
                    backoff = backoff.saturating_mul(2).min(Duration::from_secs(5));
                }
            }
        }
        unreachable!("retry loop should return or error");
    }
}

fn should_retry_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    let raw = headers.get(reqwest::header::RETRY_AFTER)?.to_str().ok()?;
    let secs = raw.trim().parse::<u64>().ok()?;
    Some(Duration::from_secs(secs))
}

async fn sleep_with_jitter(base: Duration) {
    let jitter_ms: u64 = thread_rng().gen_range(0..=200);
    tokio::time::sleep(base + Duration::from_millis(jitter_ms)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_builder_helpers() {
        let req = FetchRequest::get("http://example.invalid/feed")
            .header("Accept", "application/json");
        assert_eq!(req.method, "GET");
        assert!(req.body.is_none());
        assert_eq!(req.headers.len(), 1);

        let req = FetchRequest::post("http://example.invalid/send", b"hi".to_vec());
        assert_eq!(req.method, "POST");
        assert_eq!(req.body.as_deref(), Some(&b"hi"[..]));
    }

    #[test]
    fn success_range() {
        let ok = FetchResponse {
            status: 204,
            body: Bytes::new(),
            retry_after: None,
        };
        assert!(ok.is_success());
        let nope = FetchResponse {
            status: 404,
            body: Bytes::new(),
            retry_after: None,
        };
        assert!(!nope.is_success());
    }
}
