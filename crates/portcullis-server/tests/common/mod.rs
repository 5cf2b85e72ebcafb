//! Test utilities for end-to-end flows.
//!
//! Builds a router over an in-memory store seeded with two tenants and
//! drives it with `tower::ServiceExt::oneshot`.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, Response, StatusCode};
use axum::Router;
use chrono::Utc;
use http_body_util::BodyExt;
use tower::ServiceExt;

use portcullis_server::auth::password::hash_password;
use portcullis_server::auth::MemoryEmailSender;
use portcullis_server::db::{in_memory_store, SqlStore};
use portcullis_server::model::{
    Application, Connection, ConnectionStrategy, Tenant, User, DATABASE_CONNECTION,
    DATABASE_PROVIDER, EMAIL_CONNECTION,
};
use portcullis_server::server::create_router;
use portcullis_server::store::{DirectoryStore, UserStore};
use portcullis_server::{AuthState, ServerConfig};

pub const ISSUER: &str = "https://id.example.com/";
pub const CALLBACK: &str = "https://app.example.com/callback";
pub const PASSWORD: &str = "correct horse";

/// Initialize test logging once.
pub fn init_test() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("portcullis_server=debug")
            .with_test_writer()
            .try_init();
    });
}

pub struct TestServer {
    pub state: Arc<AuthState>,
    pub store: Arc<SqlStore>,
    pub mailer: Arc<MemoryEmailSender>,
    pub router: Router,
}

async fn seed_tenant(store: &SqlStore, tenant: &str) {
    store
        .insert_tenant(&Tenant {
            id: tenant.to_string(),
            name: tenant.to_string(),
            audience: None,
            created_at: Utc::now(),
        })
        .await
        .unwrap();
    store
        .insert_application(&Application {
            id: format!("{}-app", tenant),
            tenant_id: tenant.to_string(),
            name: format!("{} app", tenant),
            client_secret: Some("secret".to_string()),
            callbacks: vec![CALLBACK.to_string()],
            allowed_logout_urls: vec!["https://app.example.com/".to_string()],
            web_origins: vec!["https://app.example.com".to_string()],
            created_at: Utc::now(),
        })
        .await
        .unwrap();
    store
        .insert_connection(&Connection {
            id: format!("{}-db", tenant),
            tenant_id: tenant.to_string(),
            name: DATABASE_CONNECTION.to_string(),
            strategy: ConnectionStrategy::Database,
        })
        .await
        .unwrap();
    store
        .insert_connection(&Connection {
            id: format!("{}-email", tenant),
            tenant_id: tenant.to_string(),
            name: EMAIL_CONNECTION.to_string(),
            strategy: ConnectionStrategy::Passwordless,
        })
        .await
        .unwrap();
}

impl TestServer {
    /// Tenants `acme` and `globex`, each with client `<tenant>-app`.
    pub async fn start(name: &str) -> Self {
        init_test();

        let store = Arc::new(in_memory_store(name).await.unwrap());
        seed_tenant(&store, "acme").await;
        seed_tenant(&store, "globex").await;

        let config = ServerConfig {
            issuer: ISSUER.to_string(),
            ..Default::default()
        };
        let mailer = Arc::new(MemoryEmailSender::new());
        let state = AuthState::new(config, store.clone(), mailer.clone()).unwrap();
        state.initialize().await.unwrap();
        let state = Arc::new(state);

        Self {
            router: create_router(state.clone()),
            state,
            store,
            mailer,
        }
    }

    /// Inserts a database user with [`PASSWORD`].
    pub async fn add_password_user(&self, tenant: &str, email: &str) -> User {
        let mut user = User::new(tenant, DATABASE_PROVIDER, DATABASE_CONNECTION, false);
        user.email = Some(email.to_string());
        user.email_verified = true;
        user.password_hash = Some(hash_password(PASSWORD).unwrap());
        self.store.insert_user(&user).await.unwrap();
        user
    }

    pub async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.router.clone().oneshot(request).await.unwrap()
    }

    /// `/co/authenticate` with a password; returns the login ticket.
    pub async fn password_ticket(&self, client_id: &str, username: &str) -> String {
        let response = self
            .send(json_post(
                "/co/authenticate",
                serde_json::json!({
                    "client_id": client_id,
                    "username": username,
                    "credential_type": "http://auth0.com/oauth/grant-type/password-realm",
                    "realm": DATABASE_CONNECTION,
                    "password": PASSWORD
                }),
            ))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        body_json(response).await["login_ticket"]
            .as_str()
            .unwrap()
            .to_string()
    }

    /// Redeems `ticket` at `/authorize` for an implicit-flow response.
    pub async fn authorize_with_ticket(&self, client_id: &str, ticket: &str) -> Response<Body> {
        self.send(get(&format!(
            "/authorize?client_id={}&redirect_uri={}&response_type=token%20id_token\
             &scope=openid%20email%20profile&nonce=n1&state=s1&login_ticket={}",
            client_id,
            urlencoding::encode(CALLBACK),
            ticket
        )))
        .await
    }

    /// Silent `/authorize` carrying `cookie`.
    pub async fn silent_authorize(&self, client_id: &str, cookie: Option<&str>) -> Response<Body> {
        let mut request = Request::builder().uri(format!(
            "/authorize?client_id={}&redirect_uri={}&response_type=token%20id_token\
             &scope=openid&nonce=n2&state=s2&prompt=none",
            client_id,
            urlencoding::encode(CALLBACK)
        ));
        if let Some(cookie) = cookie {
            request = request.header(header::COOKIE, cookie);
        }
        self.send(request.body(Body::empty()).unwrap()).await
    }
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

pub fn json_post(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

pub fn location(response: &Response<Body>) -> String {
    assert_eq!(response.status(), StatusCode::FOUND);
    response.headers()[header::LOCATION]
        .to_str()
        .unwrap()
        .to_string()
}

/// `name=value` of the first `Set-Cookie` header.
pub fn set_cookie(response: &Response<Body>) -> Option<String> {
    response
        .headers()
        .get(header::SET_COOKIE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .map(str::to_string)
}

/// Parameters from the fragment or query of a redirect.
pub fn redirect_params(location: &str) -> HashMap<String, String> {
    let url = url::Url::parse(location).unwrap();
    let raw = url.fragment().or(url.query()).unwrap_or_default().to_string();
    url::form_urlencoded::parse(raw.as_bytes())
        .into_owned()
        .collect()
}
