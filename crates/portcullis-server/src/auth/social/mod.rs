//! Federated social login.
//!
//! The adapter sends the browser to the provider, exchanges the code that
//! comes back and normalizes the provider profile into a `SocialProfile`.
//! All outbound calls share one HTTP client with the configured timeout.
//! Provider failures surface as `AuthError::Upstream`, which the callback
//! relays to the client.

pub mod oauth2;
pub mod oidc;
pub mod providers;
pub mod state;

use dashmap::DashMap;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{info, instrument};

use super::jwks_cache::JwksCache;
use super::AuthError;
use oidc::ProviderMetadata;
pub use providers::{ClientAuth, Protocol, ProviderCatalog, ProviderSettings, SocialProvider};
pub use state::SocialState;

/// A provider profile in the shape the identity model stores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocialProfile {
    pub subject: String,
    pub issuer: Option<String>,
    pub email: Option<String>,
    pub email_verified: Option<bool>,
    pub name: Option<String>,
    pub nickname: Option<String>,
    pub picture: Option<String>,
    /// The provider document as received; kept as the identity's
    /// `profileData`.
    pub raw: Value,
}

pub struct SocialLoginAdapter {
    client: Client,
    catalog: ProviderCatalog,
    jwks_cache: JwksCache,
    metadata: DashMap<String, ProviderMetadata>,
    callback_url: String,
}

impl SocialLoginAdapter {
    pub fn new(
        providers: Vec<ProviderSettings>,
        callback_url: &str,
        timeout: Duration,
    ) -> Result<Self, AuthError> {
        let catalog = ProviderCatalog::new(providers)?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AuthError::Internal(format!("Failed to build HTTP client: {}", e)))?;

        if !catalog.is_empty() {
            info!(strategies = ?catalog.strategies(), "Social providers configured");
        }

        Ok(Self {
            client,
            catalog,
            jwks_cache: JwksCache::default(),
            metadata: DashMap::new(),
            callback_url: callback_url.to_string(),
        })
    }

    pub fn has_provider(&self, strategy: &str) -> bool {
        self.catalog.get(strategy).is_some()
    }

    fn provider(&self, strategy: &str) -> Result<&SocialProvider, AuthError> {
        self.catalog
            .get(strategy)
            .ok_or_else(|| AuthError::Authentication("Connection not found".to_string()))
    }

    /// Discovery document for an OIDC provider, fetched once per process.
    async fn metadata(&self, provider: &SocialProvider) -> Result<ProviderMetadata, AuthError> {
        if let Some(cached) = self.metadata.get(&provider.strategy) {
            return Ok(cached.clone());
        }
        let issuer = provider.issuer.as_deref().unwrap_or_default();
        let metadata = oidc::discover(&self.client, issuer).await?;
        self.metadata
            .insert(provider.strategy.clone(), metadata.clone());
        Ok(metadata)
    }

    /// Where to send the browser for `strategy`.
    #[instrument(skip(self, state), fields(connection = %state.connection))]
    pub async fn authorization_url(
        &self,
        strategy: &str,
        state: &SocialState,
    ) -> Result<String, AuthError> {
        let provider = self.provider(strategy)?;
        let endpoint = match (&provider.authorization_endpoint, provider.protocol) {
            (Some(endpoint), _) => endpoint.clone(),
            (None, Protocol::Oidc) => self.metadata(provider).await?.authorization_endpoint,
            (None, Protocol::OAuth2) => {
                return Err(AuthError::Internal(format!(
                    "social provider '{}' has no authorization endpoint",
                    provider.strategy
                )))
            }
        };

        let mut url = url::Url::parse(&endpoint).map_err(|e| {
            AuthError::Internal(format!("Invalid authorization endpoint {}: {}", endpoint, e))
        })?;
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &provider.client_id)
            .append_pair("redirect_uri", &self.callback_url)
            .append_pair("scope", &provider.scope())
            .append_pair("state", &state.encode()?);
        Ok(url.to_string())
    }

    /// Exchanges the callback `code` for the provider profile.
    #[instrument(skip(self, code))]
    pub async fn complete(&self, strategy: &str, code: &str) -> Result<SocialProfile, AuthError> {
        let provider = self.provider(strategy)?;

        if provider.protocol == Protocol::Oidc {
            let metadata = self.metadata(provider).await?;
            let token_endpoint = provider
                .token_endpoint
                .as_deref()
                .unwrap_or(&metadata.token_endpoint);
            let tokens = oauth2::exchange_code(
                &self.client,
                provider,
                token_endpoint,
                code,
                &self.callback_url,
            )
            .await?;
            return oidc::profile_from_tokens(
                &self.client,
                &self.jwks_cache,
                provider,
                &metadata,
                &tokens,
            )
            .await;
        }

        // Presence of both endpoints is checked when the catalog is built.
        let token_endpoint = provider.token_endpoint.as_deref().unwrap_or_default();
        let userinfo_endpoint = provider.userinfo_endpoint.as_deref().unwrap_or_default();
        let tokens =
            oauth2::exchange_code(&self.client, provider, token_endpoint, code, &self.callback_url)
                .await?;
        let raw = oauth2::fetch_profile(&self.client, userinfo_endpoint, &tokens.access_token).await?;
        oauth2::normalize_profile(provider, provider.issuer.clone(), raw)
    }
}
