use crate::auth::{
    AuthError, Authorizer, EmailSender, IdentityResolver, KeyManager, PasswordlessService,
    SessionManager, SignupService, SocialLoginAdapter, TicketExchange, TokenGrants, TokenMinter,
};
use crate::config::ServerConfig;
use crate::db::SqlStore;
use anyhow::Result;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::{
    compression::CompressionLayer,
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{error, info, warn, Level};

pub mod response;
mod routes;

const SERVICE_NAME: &str = "portcullis-server";

/// Shared state of every route: configuration, storage and the
/// authentication services built on top of it.
pub struct AuthState {
    pub config: ServerConfig,
    pub store: Arc<SqlStore>,
    pub keys: Arc<KeyManager>,
    pub minter: Arc<TokenMinter>,
    pub sessions: Arc<SessionManager>,
    pub identity: Arc<IdentityResolver>,
    pub tickets: Arc<TicketExchange>,
    pub authorizer: Authorizer,
    pub passwordless: PasswordlessService,
    pub signup: SignupService,
    pub grants: TokenGrants,
}

impl AuthState {
    pub fn new(
        config: ServerConfig,
        store: Arc<SqlStore>,
        email: Arc<dyn EmailSender>,
    ) -> Result<Self, AuthError> {
        let keys = Arc::new(KeyManager::new(
            store.clone(),
            config.key_retention,
            config.jwks_cache_horizon,
        ));
        let minter = Arc::new(TokenMinter::new(
            keys.clone(),
            &config.issuer,
            &config.default_audience,
        ));
        let sessions = Arc::new(SessionManager::new(
            store.clone(),
            config.session_hash_key.as_ref().map(|k| k.as_bytes()),
        ));
        let identity = Arc::new(IdentityResolver::new(store.clone()));
        let tickets = Arc::new(TicketExchange::new(store.clone()));
        let social = Arc::new(SocialLoginAdapter::new(
            config.social_providers.clone(),
            &config.url("callback"),
            config.http_timeout,
        )?);

        let authorizer = Authorizer::new(
            store.clone(),
            tickets.clone(),
            identity.clone(),
            sessions.clone(),
            minter.clone(),
            social,
        );
        let passwordless = PasswordlessService::new(store.clone(), email.clone(), &config.issuer);
        let signup = SignupService::new(
            store.clone(),
            email,
            minter.clone(),
            IdentityResolver::new(store.clone()),
        );
        let grants = TokenGrants::new(store.clone(), identity.clone(), minter.clone());

        Ok(Self {
            config,
            store,
            keys,
            minter,
            sessions,
            identity,
            tickets,
            authorizer,
            passwordless,
            signup,
            grants,
        })
    }

    /// Makes sure a signing key exists before the first request.
    pub async fn initialize(&self) -> Result<(), AuthError> {
        let cert = self.keys.ensure_active().await?;
        info!(kid = %cert.kid, "Active signing certificate");
        Ok(())
    }
}

/// Serve HTTP until SIGTERM or Ctrl-C.
pub async fn start(state: Arc<AuthState>) -> Result<()> {
    let stop_token = CancellationToken::new();
    tokio::spawn(watch_shutdown_signals(stop_token.clone()));

    if let Some(interval) = state.config.key_rotation_interval {
        tokio::spawn(rotate_keys_periodically(
            state.keys.clone(),
            interval,
            stop_token.clone(),
        ));
    }

    let listener = tokio::net::TcpListener::bind(state.config.bind_addr).await?;
    let addr = listener.local_addr()?;
    let app = create_router(state);
    info!("Starting Axum HTTP server on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            stop_token.cancelled().await;
            info!("HTTP server received shutdown signal, draining connections");
        })
        .await?;

    Ok(())
}

async fn watch_shutdown_signals(stop_token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!(signal = "SIGINT", "Shutdown requested"),
        _ = terminate => info!(signal = "SIGTERM", "Shutdown requested"),
    }
    stop_token.cancel();
}

async fn rotate_keys_periodically(
    keys: Arc<KeyManager>,
    interval: std::time::Duration,
    stop_token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = stop_token.cancelled() => break,
            _ = ticker.tick() => match keys.rotate_if_due().await {
                Ok(Some(cert)) => info!(kid = %cert.kid, "Scheduled key rotation"),
                Ok(None) => {}
                Err(e) => warn!("Scheduled key rotation failed: {}", e),
            },
        }
    }
}

/// Configure CORS layer.
///
/// An explicit origin list allows credentials so that cross-origin
/// `/co/authenticate` calls can carry cookies. Without one, CORS is
/// permissive (development).
fn configure_cors(origins: &[String]) -> CorsLayer {
    use axum::http::{header, HeaderValue, Method};
    use tower_http::cors::AllowOrigin;

    let allowed: Vec<HeaderValue> = origins.iter().filter_map(|o| o.parse().ok()).collect();
    if allowed.is_empty() {
        if !origins.is_empty() {
            warn!("PORTCULLIS_CORS_ORIGINS set but no valid origins parsed, falling back to permissive CORS");
        }
        return CorsLayer::permissive();
    }

    info!(origins = ?allowed, "Configured CORS with explicit allowed origins");
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            header::HeaderName::from_static("tenant-id"),
        ])
        .allow_credentials(true)
}

/// Create the Axum router with all routes and middleware
pub fn create_router(state: Arc<AuthState>) -> Router {
    let cors = configure_cors(&state.config.cors_origins);

    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(health_handler))
        .route("/ready", get(readiness_handler))
        .route("/readyz", get(readiness_handler))
        .with_state(state.clone())
        .merge(routes::authorize::router(state.clone()))
        .merge(routes::co::router(state.clone()))
        .merge(routes::token::router(state.clone()))
        .merge(routes::callback::router(state.clone()))
        .merge(routes::well_known::router(state.clone()))
        .merge(routes::passwordless::router(state.clone()))
        .merge(routes::dbconnections::router(state.clone()))
        .merge(routes::logout::router(state.clone()))
        .merge(routes::userinfo::router(state.clone()))
        .merge(routes::universal::router(state))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(CompressionLayer::new())
        .layer(cors)
}

/// Liveness: the database answers.
async fn health_handler(State(state): State<Arc<AuthState>>) -> impl IntoResponse {
    match state.store.database().health_check().await {
        Ok(true) => (
            StatusCode::OK,
            Json(json!({
                "status": "healthy",
                "service": SERVICE_NAME,
                "version": env!("CARGO_PKG_VERSION"),
            })),
        ),
        Ok(false) => {
            warn!("Health check: database unhealthy");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "service": SERVICE_NAME,
                    "version": env!("CARGO_PKG_VERSION"),
                    "error": "database unhealthy"
                })),
            )
        }
        Err(e) => {
            warn!("Health check failed: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "service": SERVICE_NAME,
                    "version": env!("CARGO_PKG_VERSION"),
                    "error": format!("database error: {}", e)
                })),
            )
        }
    }
}

/// Readiness is stricter than liveness: a signing key must also be active.
async fn readiness_handler(State(state): State<Arc<AuthState>>) -> impl IntoResponse {
    let database_ready = matches!(state.store.database().health_check().await, Ok(true));
    let signing_ready = state.keys.active().await.is_ok();

    if database_ready && signing_ready {
        (
            StatusCode::OK,
            Json(json!({
                "status": "ready",
                "service": SERVICE_NAME,
                "version": env!("CARGO_PKG_VERSION"),
                "database": "ready",
                "signing_key": "ready"
            })),
        )
    } else {
        warn!(database_ready, signing_ready, "Readiness check failed");
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "not_ready",
                "service": SERVICE_NAME,
                "version": env!("CARGO_PKG_VERSION"),
                "database": if database_ready { "ready" } else { "not_ready" },
                "signing_key": if signing_ready { "ready" } else { "missing" }
            })),
        )
    }
}
