//! Outbound transport to external generators.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::{GeneratorAuth, GeneratorSettings};
use crate::store::DocumentKind;

/// Payload sent to the external generator. `context` carries the external
/// correlation ids of sibling documents; upstream documents that were never
/// generated (or not yet correlated) are passed as null — generators are
/// expected to tolerate partial context.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationRequest {
    pub idea_id: i64,
    pub kind: DocumentKind,
    pub instructions: String,
    pub context: BTreeMap<String, Option<String>>,
}

/// Synchronous acknowledgement from a generator invocation. The body is
/// opaque; the correlation id is extracted heuristically (see `extract`).
#[derive(Debug, Clone)]
pub struct GeneratorAck {
    pub body: String,
}

/// Transport seam for generator invocation. The HTTP implementation is the
/// production path; tests substitute in-memory transports.
#[async_trait]
pub trait GeneratorTransport: Send + Sync {
    async fn invoke(&self, request: &GenerationRequest) -> Result<GeneratorAck>;
}

/// Cached credential with an explicit expiry, injected where a token is
/// needed instead of living as module-level mutable state.
#[derive(Debug, Default)]
pub struct TokenCache {
    cached: Option<(String, DateTime<Utc>)>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached token when still valid at `now`, otherwise call
    /// `refresh` and cache its result.
    pub fn get_or_refresh<F>(&mut self, now: DateTime<Utc>, refresh: F) -> Result<String>
    where
        F: FnOnce() -> Result<(String, DateTime<Utc>)>,
    {
        if let Some((token, expires_at)) = &self.cached {
            if now < *expires_at {
                return Ok(token.clone());
            }
        }
        let (token, expires_at) = refresh()?;
        self.cached = Some((token.clone(), expires_at));
        Ok(token)
    }
}

/// HTTP generator client: POST with Basic or Bearer credentials, bounded by
/// a request timeout so a slow generator cannot wedge dispatch.
pub struct HttpGenerator {
    client: reqwest::Client,
    endpoint: String,
    auth: GeneratorAuth,
    token_cache: std::sync::Mutex<TokenCache>,
    token_ttl: Duration,
}

impl HttpGenerator {
    pub fn new(settings: &GeneratorSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()
            .context("Failed to build generator HTTP client")?;
        Ok(Self {
            client,
            endpoint: settings.endpoint.clone(),
            auth: settings.auth.clone(),
            token_cache: std::sync::Mutex::new(TokenCache::new()),
            token_ttl: Duration::from_secs(settings.token_ttl_secs),
        })
    }

    fn bearer_token(&self, configured: &str) -> Result<String> {
        let mut cache = self
            .token_cache
            .lock()
            .map_err(|_| anyhow::anyhow!("Token cache lock poisoned"))?;
        let ttl = chrono::Duration::from_std(self.token_ttl).unwrap_or(chrono::Duration::hours(1));
        cache.get_or_refresh(Utc::now(), || {
            // Static tokens are re-read on expiry; the refresh seam is where
            // a short-lived-credential provider would plug in.
            Ok((configured.to_string(), Utc::now() + ttl))
        })
    }
}

#[async_trait]
impl GeneratorTransport for HttpGenerator {
    async fn invoke(&self, request: &GenerationRequest) -> Result<GeneratorAck> {
        let mut req = self.client.post(&self.endpoint).json(request);
        req = match &self.auth {
            GeneratorAuth::None => req,
            GeneratorAuth::Basic { username, password } => {
                req.basic_auth(username, Some(password))
            }
            GeneratorAuth::Bearer { token } => req.bearer_auth(self.bearer_token(token)?),
        };

        let resp = req
            .send()
            .await
            .context("Generator invocation failed to send")?;
        let status = resp.status();
        let body = resp
            .text()
            .await
            .context("Failed to read generator response body")?;

        if !status.is_success() {
            anyhow::bail!("Generator returned {}: {}", status, truncate(&body, 200));
        }
        Ok(GeneratorAck { body })
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
