//! The `/authorize` decision state machine.
//!
//! A validated request ends in exactly one of:
//! - a redirect to the universal login page, backed by a stored login session
//! - a redirect to a federated provider when `connection` names one
//! - a completed response when a login ticket or a live SSO session satisfies it
//! - a `login_required` response for `prompt=none` without a usable session
//!
//! The other entry points (`/callback`, universal login, magic links) finish
//! through the same completion path so that every login resolves the
//! canonical user, records the login and opens a session.

use chrono::Utc;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use super::credentials::Credential;
use super::identity::{IdentityResolver, ResolvedUser};
use super::session::{cookie_name, SessionManager};
use super::social::{SocialLoginAdapter, SocialState};
use super::ticket::TicketExchange;
use super::tokens::{MintRequest, TokenMinter};
use super::{random_token, AuthError};
use crate::model::{
    normalize_email, Application, AuthParams, AuthorizationCode, ConnectionStrategy,
    LoginSession, Session, Tenant, User, AUTHORIZATION_CODE_TTL_MINUTES, DATABASE_CONNECTION,
};
use crate::store::Storage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseType {
    Code,
    Token,
    IdToken,
    TokenIdToken,
}

impl ResponseType {
    /// Parses a space-separated `response_type`; absent means `code`.
    pub fn parse(value: Option<&str>) -> Result<Self, AuthError> {
        let mut parts: Vec<&str> = value.unwrap_or("code").split_whitespace().collect();
        parts.sort_unstable();
        match parts.as_slice() {
            ["code"] => Ok(ResponseType::Code),
            ["token"] => Ok(ResponseType::Token),
            ["id_token"] => Ok(ResponseType::IdToken),
            ["id_token", "token"] => Ok(ResponseType::TokenIdToken),
            _ => Err(AuthError::Validation(format!(
                "Unsupported response_type: {}",
                value.unwrap_or_default()
            ))),
        }
    }

    fn includes_access_token(self) -> bool {
        matches!(self, ResponseType::Token | ResponseType::TokenIdToken)
    }

    fn includes_id_token(self) -> bool {
        matches!(self, ResponseType::IdToken | ResponseType::TokenIdToken)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseMode {
    Query,
    Fragment,
    FormPost,
    WebMessage,
}

impl ResponseMode {
    /// Parses `response_mode`. Tokens are never put in a query string.
    pub fn parse(value: Option<&str>, response_type: ResponseType) -> Result<Self, AuthError> {
        let mode = match value {
            None | Some("") => {
                if response_type == ResponseType::Code {
                    ResponseMode::Query
                } else {
                    ResponseMode::Fragment
                }
            }
            Some("query") => ResponseMode::Query,
            Some("fragment") => ResponseMode::Fragment,
            Some("form_post") => ResponseMode::FormPost,
            Some("web_message") => ResponseMode::WebMessage,
            Some(other) => {
                return Err(AuthError::Validation(format!(
                    "Unsupported response_mode: {}",
                    other
                )))
            }
        };
        if mode == ResponseMode::Query && response_type != ResponseType::Code {
            return Err(AuthError::Validation(
                "response_mode=query is not allowed for token responses".to_string(),
            ));
        }
        Ok(mode)
    }
}

/// Query or form parameters of `/authorize`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthorizeRequest {
    pub client_id: Option<String>,
    pub redirect_uri: Option<String>,
    pub response_type: Option<String>,
    pub response_mode: Option<String>,
    pub scope: Option<String>,
    pub state: Option<String>,
    pub nonce: Option<String>,
    pub audience: Option<String>,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
    pub prompt: Option<String>,
    pub login_hint: Option<String>,
    pub ui_locales: Option<String>,
    pub connection: Option<String>,
    pub login_ticket: Option<String>,
}

impl AuthorizeRequest {
    fn auth_params(&self, client_id: &str) -> AuthParams {
        AuthParams {
            client_id: client_id.to_string(),
            redirect_uri: self.redirect_uri.clone(),
            response_type: self.response_type.clone(),
            response_mode: self.response_mode.clone(),
            scope: self.scope.clone(),
            state: self.state.clone(),
            nonce: self.nonce.clone(),
            audience: self.audience.clone(),
            code_challenge: self.code_challenge.clone(),
            code_challenge_method: self.code_challenge_method.clone(),
            prompt: self.prompt.clone(),
            login_hint: self.login_hint.clone(),
            ui_locales: self.ui_locales.clone(),
        }
    }
}

/// Fills unset fields of `primary` from `fallback`.
pub fn merge_params(primary: AuthParams, fallback: AuthParams) -> AuthParams {
    AuthParams {
        client_id: primary.client_id,
        redirect_uri: primary.redirect_uri.or(fallback.redirect_uri),
        response_type: primary.response_type.or(fallback.response_type),
        response_mode: primary.response_mode.or(fallback.response_mode),
        scope: primary.scope.or(fallback.scope),
        state: primary.state.or(fallback.state),
        nonce: primary.nonce.or(fallback.nonce),
        audience: primary.audience.or(fallback.audience),
        code_challenge: primary.code_challenge.or(fallback.code_challenge),
        code_challenge_method: primary.code_challenge_method.or(fallback.code_challenge_method),
        prompt: primary.prompt.or(fallback.prompt),
        login_hint: primary.login_hint.or(fallback.login_hint),
        ui_locales: primary.ui_locales.or(fallback.ui_locales),
    }
}

/// What is sent back to the client's `redirect_uri`.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthResponse {
    pub redirect_uri: String,
    pub mode: ResponseMode,
    pub fields: Map<String, Value>,
}

impl AuthResponse {
    fn new(redirect_uri: &str, mode: ResponseMode, state: Option<&str>) -> Self {
        let mut fields = Map::new();
        if let Some(state) = state {
            fields.insert("state".into(), Value::String(state.to_string()));
        }
        Self {
            redirect_uri: redirect_uri.to_string(),
            mode,
            fields,
        }
    }

    pub fn error(
        redirect_uri: &str,
        mode: ResponseMode,
        state: Option<&str>,
        error: &str,
        description: &str,
    ) -> Self {
        let mut response = Self::new(redirect_uri, mode, state);
        response
            .fields
            .insert("error".into(), Value::String(error.to_string()));
        response.fields.insert(
            "error_description".into(),
            Value::String(description.to_string()),
        );
        response
    }

    pub fn login_required(redirect_uri: &str, mode: ResponseMode, state: Option<&str>) -> Self {
        Self::error(redirect_uri, mode, state, "login_required", "Login required")
    }

    fn insert(&mut self, key: &str, value: impl Into<Value>) {
        self.fields.insert(key.to_string(), value.into());
    }

    pub fn is_error(&self) -> bool {
        self.fields.contains_key("error")
    }

    /// Fields as string pairs for query, fragment and form encoding.
    pub fn pairs(&self) -> Vec<(String, String)> {
        self.fields
            .iter()
            .map(|(k, v)| {
                let value = match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (k.clone(), value)
            })
            .collect()
    }
}

/// A finished flow: the client response plus the cookie token of a newly
/// opened session.
#[derive(Debug, Clone)]
pub struct Completion {
    pub tenant_id: String,
    pub response: AuthResponse,
    pub session_token: Option<String>,
}

#[derive(Debug, Clone)]
pub enum AuthorizeOutcome {
    LoginPage { url: String },
    ConfirmAccount { url: String },
    FederatedRedirect { url: String },
    Complete(Completion),
    LoginRequired(AuthResponse),
}

/// A request whose client, tenant and response parameters have been checked.
struct Validated {
    application: Application,
    tenant: Tenant,
    params: AuthParams,
    redirect_uri: String,
    response_type: ResponseType,
    mode: ResponseMode,
}

pub struct Authorizer {
    store: Arc<dyn Storage>,
    tickets: Arc<TicketExchange>,
    identity: Arc<IdentityResolver>,
    sessions: Arc<SessionManager>,
    minter: Arc<TokenMinter>,
    social: Arc<SocialLoginAdapter>,
}

impl Authorizer {
    pub fn new(
        store: Arc<dyn Storage>,
        tickets: Arc<TicketExchange>,
        identity: Arc<IdentityResolver>,
        sessions: Arc<SessionManager>,
        minter: Arc<TokenMinter>,
        social: Arc<SocialLoginAdapter>,
    ) -> Self {
        Self {
            store,
            tickets,
            identity,
            sessions,
            minter,
            social,
        }
    }

    fn page_url(&self, path: &str, login_session_id: &str) -> String {
        format!(
            "{}{}?state={}",
            self.minter.issuer(),
            path,
            urlencoding::encode(login_session_id)
        )
    }

    /// Application and tenant for `client_id`.
    pub async fn load_client(&self, client_id: &str) -> Result<(Application, Tenant), AuthError> {
        if client_id.trim().is_empty() {
            return Err(AuthError::Validation(
                "Missing required parameter: client_id".to_string(),
            ));
        }
        let application = self
            .store
            .get_application(client_id)
            .await?
            .ok_or_else(|| AuthError::Validation(format!("Unknown client: {}", client_id)))?;
        let tenant = self
            .store
            .get_tenant(&application.tenant_id)
            .await?
            .ok_or_else(|| {
                AuthError::NotFound(format!("Tenant not found: {}", application.tenant_id))
            })?;
        Ok((application, tenant))
    }

    /// Checks redirect and response parameters against the application.
    fn validate_params(
        application: Application,
        tenant: Tenant,
        params: AuthParams,
        origin: Option<&str>,
    ) -> Result<Validated, AuthError> {
        let redirect_uri = params
            .redirect_uri
            .clone()
            .filter(|r| !r.is_empty())
            .ok_or_else(|| {
                AuthError::Validation("Missing required parameter: redirect_uri".to_string())
            })?;
        if !application.allows_callback(&redirect_uri) {
            warn!(client_id = %application.id, "redirect_uri not in allowed callbacks");
            return Err(AuthError::Validation(format!(
                "Callback URL mismatch: {}",
                redirect_uri
            )));
        }

        let response_type = ResponseType::parse(params.response_type.as_deref())?;
        let mode = ResponseMode::parse(params.response_mode.as_deref(), response_type)?;

        if let Some(origin) = origin {
            if mode == ResponseMode::WebMessage && !application.allows_origin(origin) {
                return Err(AuthError::Authorization(format!(
                    "Origin {} not allowed",
                    origin
                )));
            }
        }

        Ok(Validated {
            application,
            tenant,
            params,
            redirect_uri,
            response_type,
            mode,
        })
    }

    async fn validate_request(
        &self,
        request: &AuthorizeRequest,
        origin: Option<&str>,
        tenant_header: Option<&str>,
    ) -> Result<Validated, AuthError> {
        let client_id = request.client_id.clone().unwrap_or_default();
        let (application, tenant) = self.load_client(&client_id).await?;

        if let Some(header) = tenant_header {
            if header != tenant.id {
                return Err(AuthError::Authorization(format!(
                    "Client {} does not belong to tenant {}",
                    client_id, header
                )));
            }
        }

        Self::validate_params(application, tenant, request.auth_params(&client_id), origin)
    }

    /// Runs `/authorize`. `session_token` looks up a cookie by name.
    #[instrument(skip_all, fields(client_id = request.client_id.as_deref().unwrap_or_default()))]
    pub async fn authorize(
        &self,
        request: &AuthorizeRequest,
        session_token: impl FnOnce(&str) -> Option<String>,
        origin: Option<&str>,
        tenant_header: Option<&str>,
    ) -> Result<AuthorizeOutcome, AuthError> {
        let mut validated = self
            .validate_request(request, origin, tenant_header)
            .await?;

        if let Some(login_ticket) = request.login_ticket.as_deref() {
            let ticket = self
                .tickets
                .redeem(&validated.tenant.id, &validated.application.id, login_ticket)
                .await?;
            let user = self
                .store
                .get_user(&validated.tenant.id, &ticket.user_id)
                .await?
                .ok_or_else(|| AuthError::Authentication("Invalid login ticket".to_string()))?;
            validated.params = merge_params(validated.params, ticket.auth_params);
            let completion = self.open_session_and_respond(&validated, &user).await?;
            return Ok(AuthorizeOutcome::Complete(completion));
        }

        if let Some(connection) = request.connection.as_deref() {
            if let Some(url) = self.federated_redirect(&validated, connection).await? {
                return Ok(AuthorizeOutcome::FederatedRedirect { url });
            }
        }

        let prompt = validated.params.prompt.clone().unwrap_or_default();
        let prompt_none = prompt == "none";

        if prompt != "login" {
            let token = session_token(&cookie_name(&validated.tenant.id));
            if let Some(token) = token {
                if let Some(session) = self.sessions.load_valid(&validated.tenant.id, &token).await? {
                    let resolved = self
                        .identity
                        .resolve_by_id(&validated.tenant.id, &session.user_id)
                        .await?;

                    if let Some(hint) = validated.params.login_hint.as_deref() {
                        if resolved.user.email.as_deref() != Some(normalize_email(hint).as_str()) {
                            debug!(session_id = %session.id, "login_hint does not match session user");
                            if prompt_none {
                                return Ok(AuthorizeOutcome::LoginRequired(
                                    self.login_required(&validated),
                                ));
                            }
                            let login = self.start_login_session(&validated).await?;
                            return Ok(AuthorizeOutcome::ConfirmAccount {
                                url: self.page_url("u/check-account", &login.id),
                            });
                        }
                    }

                    let session = self.sessions.touch(&session).await?;
                    let response = self.respond(&validated, &resolved, &session).await?;
                    info!(session_id = %session.id, "Authorized from existing session");
                    return Ok(AuthorizeOutcome::Complete(Completion {
                        tenant_id: validated.tenant.id.clone(),
                        response,
                        session_token: None,
                    }));
                }
            }
        }

        if prompt_none {
            return Ok(AuthorizeOutcome::LoginRequired(
                self.login_required(&validated),
            ));
        }

        let login = self.start_login_session(&validated).await?;
        Ok(AuthorizeOutcome::LoginPage {
            url: self.page_url("u/login", &login.id),
        })
    }

    fn login_required(&self, validated: &Validated) -> AuthResponse {
        AuthResponse::login_required(
            &validated.redirect_uri,
            validated.mode,
            validated.params.state.as_deref(),
        )
    }

    async fn start_login_session(&self, validated: &Validated) -> Result<LoginSession, AuthError> {
        let login = LoginSession::new(&validated.tenant.id, validated.params.clone());
        self.store.insert_login_session(&login).await?;
        debug!(login_session_id = %login.id, "Started universal login");
        Ok(login)
    }

    /// Provider URL for a social `connection`; `None` for database and
    /// passwordless connections, which use the login page.
    async fn federated_redirect(
        &self,
        validated: &Validated,
        connection: &str,
    ) -> Result<Option<String>, AuthError> {
        let not_found = || AuthError::Authentication("Connection not found".to_string());
        if connection == DATABASE_CONNECTION {
            return Ok(None);
        }
        let record = self
            .store
            .get_connection(&validated.tenant.id, connection)
            .await?
            .ok_or_else(not_found)?;

        match record.strategy {
            ConnectionStrategy::Social(provider) => {
                if !self.social.has_provider(&provider) {
                    return Err(not_found());
                }
                let state = SocialState {
                    auth_params: validated.params.clone(),
                    connection: record.name,
                };
                let url = self.social.authorization_url(&provider, &state).await?;
                Ok(Some(url))
            }
            ConnectionStrategy::Database | ConnectionStrategy::Passwordless => Ok(None),
        }
    }

    /// Builds the client response for `resolved` under `session`.
    async fn respond(
        &self,
        validated: &Validated,
        resolved: &ResolvedUser,
        session: &Session,
    ) -> Result<AuthResponse, AuthError> {
        let params = &validated.params;
        let mut response = AuthResponse::new(
            &validated.redirect_uri,
            validated.mode,
            params.state.as_deref(),
        );

        if validated.response_type == ResponseType::Code {
            let now = Utc::now();
            let code = AuthorizationCode {
                code: random_token(32),
                tenant_id: validated.tenant.id.clone(),
                client_id: validated.application.id.clone(),
                user_id: resolved.user.id.clone(),
                auth_params: params.clone(),
                session_id: Some(session.id.clone()),
                created_at: now,
                expires_at: now + chrono::Duration::minutes(AUTHORIZATION_CODE_TTL_MINUTES),
                used_at: None,
            };
            self.store.insert_code(&code).await?;
            response.insert("code", code.code);
            return Ok(response);
        }

        let tokens = self
            .minter
            .issue(MintRequest {
                tenant: &validated.tenant,
                client_id: &validated.application.id,
                user: Some(&resolved.user),
                params,
                session_id: Some(&session.id),
                include_access_token: validated.response_type.includes_access_token(),
                include_id_token: validated.response_type.includes_id_token(),
            })
            .await?;

        if validated.response_type.includes_access_token() {
            response.insert("access_token", tokens.access_token);
        }
        if let Some(id_token) = tokens.id_token {
            response.insert("id_token", id_token);
        }
        if let Some(scope) = tokens.scope {
            response.insert("scope", scope);
        }
        response.insert("token_type", tokens.token_type);
        response.insert("expires_in", tokens.expires_in);
        Ok(response)
    }

    /// Resolves `user`, records the login, opens a session and responds.
    async fn open_session_and_respond(
        &self,
        validated: &Validated,
        user: &User,
    ) -> Result<Completion, AuthError> {
        let resolved = self.identity.resolve_primary(user).await?;
        let now = Utc::now();
        self.store
            .record_login(&validated.tenant.id, &resolved.user.id, now)
            .await?;

        let (session, token) = self
            .sessions
            .create(
                &validated.tenant.id,
                &validated.application.id,
                &resolved.user.id,
            )
            .await?;
        let response = self.respond(validated, &resolved, &session).await?;
        info!(user_id = %resolved.user.id, session_id = %session.id, "Login completed");

        Ok(Completion {
            tenant_id: validated.tenant.id.clone(),
            response,
            session_token: Some(token),
        })
    }

    /// Finishes a login for `user` with the stored or linked flow `params`.
    pub async fn complete_login(&self, params: AuthParams, user: &User) -> Result<Completion, AuthError> {
        let (application, tenant) = self.load_client(&params.client_id).await?;
        if user.tenant_id != tenant.id {
            return Err(AuthError::Authorization(
                "User does not belong to the client's tenant".to_string(),
            ));
        }
        let validated = Self::validate_params(application, tenant, params, None)?;
        self.open_session_and_respond(&validated, user).await
    }

    /// Resumes a federated login at `/callback`.
    ///
    /// Provider failures are sent back to the client's `redirect_uri`.
    #[instrument(skip_all, fields(connection = %state.connection))]
    pub async fn complete_social(
        &self,
        state: SocialState,
        code: Option<&str>,
        provider_error: Option<(&str, &str)>,
    ) -> Result<Completion, AuthError> {
        let (application, tenant) = self.load_client(&state.auth_params.client_id).await?;
        let validated = Self::validate_params(application, tenant, state.auth_params, None)?;

        let not_found = || AuthError::Authentication("Connection not found".to_string());
        let record = self
            .store
            .get_connection(&validated.tenant.id, &state.connection)
            .await?
            .ok_or_else(not_found)?;
        let provider = match record.strategy {
            ConnectionStrategy::Social(provider) if self.social.has_provider(&provider) => provider,
            _ => return Err(not_found()),
        };

        let upstream_error = |error: &str, description: &str| Completion {
            tenant_id: validated.tenant.id.clone(),
            response: AuthResponse::error(
                &validated.redirect_uri,
                validated.mode,
                validated.params.state.as_deref(),
                error,
                description,
            ),
            session_token: None,
        };

        if let Some((error, description)) = provider_error {
            warn!(%provider, error, "Provider returned an error");
            return Ok(upstream_error(error, description));
        }
        let code = code
            .filter(|c| !c.is_empty())
            .ok_or_else(|| AuthError::Validation("Missing required parameter: code".to_string()))?;

        let profile = match self.social.complete(&provider, code).await {
            Ok(profile) => profile,
            Err(AuthError::Upstream { error, description }) => {
                warn!(%provider, %error, "Federated login failed upstream");
                return Ok(upstream_error(&error, &description));
            }
            Err(e) => return Err(e),
        };

        let user = self
            .identity
            .resolve_or_create_social(&validated.tenant.id, &record.name, &profile)
            .await?;
        self.open_session_and_respond(&validated, &user).await
    }

    /// An unexpired universal-login session.
    pub async fn login_session(&self, login_session_id: &str) -> Result<LoginSession, AuthError> {
        match self.store.get_login_session(login_session_id).await? {
            Some(login) if login.expires_at > Utc::now() => Ok(login),
            _ => Err(AuthError::Validation(
                "Login session not found or expired".to_string(),
            )),
        }
    }

    /// Password submission from the universal login page.
    #[instrument(skip(self, username, password))]
    pub async fn login_with_password(
        &self,
        login_session_id: &str,
        username: &str,
        password: &str,
    ) -> Result<Completion, AuthError> {
        let login = self.login_session(login_session_id).await?;
        let credential = Credential::Password {
            username: username.to_string(),
            realm: DATABASE_CONNECTION.to_string(),
            password: password.to_string(),
        };
        let verified = self
            .tickets
            .verifier()
            .verify(&login.tenant_id, &credential)
            .await?;
        self.complete_login(login.auth_params, &verified.user).await
    }

    /// Email of the user behind the current session, for the "continue as"
    /// step.
    pub async fn session_email(
        &self,
        login_session_id: &str,
        session_token: impl FnOnce(&str) -> Option<String>,
    ) -> Result<Option<String>, AuthError> {
        let login = self.login_session(login_session_id).await?;
        let Some(token) = session_token(&cookie_name(&login.tenant_id)) else {
            return Ok(None);
        };
        let Some(session) = self.sessions.load_valid(&login.tenant_id, &token).await? else {
            return Ok(None);
        };
        let resolved = self
            .identity
            .resolve_by_id(&login.tenant_id, &session.user_id)
            .await?;
        Ok(resolved.user.email)
    }

    /// "Continue as" on the account check page: completes with the existing
    /// session, or falls back to the login page when it is gone.
    pub async fn continue_session(
        &self,
        login_session_id: &str,
        session_token: impl FnOnce(&str) -> Option<String>,
    ) -> Result<AuthorizeOutcome, AuthError> {
        let login = self.login_session(login_session_id).await?;
        let (application, tenant) = self.load_client(&login.client_id).await?;
        let validated = Self::validate_params(application, tenant, login.auth_params, None)?;

        let session = match session_token(&cookie_name(&validated.tenant.id)) {
            Some(token) => self.sessions.load_valid(&validated.tenant.id, &token).await?,
            None => None,
        };
        let Some(session) = session else {
            return Ok(AuthorizeOutcome::LoginPage {
                url: self.page_url("u/login", &login.id),
            });
        };

        let session = self.sessions.touch(&session).await?;
        let resolved = self
            .identity
            .resolve_by_id(&validated.tenant.id, &session.user_id)
            .await?;
        let response = self.respond(&validated, &resolved, &session).await?;
        Ok(AuthorizeOutcome::Complete(Completion {
            tenant_id: validated.tenant.id,
            response,
            session_token: None,
        }))
    }

    /// Login page URL for an existing login session.
    pub fn login_page_url(&self, login_session_id: &str) -> String {
        self.page_url("u/login", login_session_id)
    }
}
