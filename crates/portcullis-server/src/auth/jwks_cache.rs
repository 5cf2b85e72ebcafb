//! Process-local cache of remote JWKS documents.
//!
//! Entries are keyed by JWKS URI and expire after a fixed TTL. Each worker
//! keeps its own copy; a stale or duplicated entry only costs a refetch.

use dashmap::DashMap;
use jsonwebtoken::jwk::JwkSet;
use reqwest::Client;
use std::time::{Duration, Instant};
use tracing::debug;

use super::AuthError;

pub const DEFAULT_JWKS_TTL: Duration = Duration::from_secs(600);

pub struct JwksCache {
    entries: DashMap<String, (Instant, JwkSet)>,
    ttl: Duration,
}

impl Default for JwksCache {
    fn default() -> Self {
        Self::new(DEFAULT_JWKS_TTL)
    }
}

impl JwksCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Cached key set for `uri`, fetched when missing or expired.
    pub async fn get(&self, client: &Client, uri: &str) -> Result<JwkSet, AuthError> {
        if let Some(entry) = self.entries.get(uri) {
            let (fetched_at, jwks) = entry.value();
            if fetched_at.elapsed() < self.ttl {
                return Ok(jwks.clone());
            }
        }

        let jwks = fetch_jwks(client, uri).await?;
        debug!(uri, keys = jwks.keys.len(), "Fetched remote JWKS");
        self.entries
            .insert(uri.to_string(), (Instant::now(), jwks.clone()));
        Ok(jwks)
    }

    /// Drops the entry for `uri` so the next lookup refetches.
    pub fn invalidate(&self, uri: &str) {
        self.entries.remove(uri);
    }
}

async fn fetch_jwks(client: &Client, jwks_uri: &str) -> Result<JwkSet, AuthError> {
    let res = client.get(jwks_uri).send().await?;

    if !res.status().is_success() {
        let status = res.status();
        let body = res.text().await.unwrap_or_default();
        return Err(AuthError::upstream(
            "server_error",
            format!("jwks endpoint {}: {}", status, body),
        ));
    }

    res.json::<JwkSet>()
        .await
        .map_err(|e| AuthError::upstream("server_error", format!("Invalid JWKS payload: {}", e)))
}
