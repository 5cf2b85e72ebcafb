//! Passwordless email login: one-time codes and magic links.

use chrono::{Duration, Utc};
use rand::Rng;
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, instrument};

use super::credentials::{Credential, CredentialVerifier, Verified};
use super::email::{EmailKind, EmailMessage, EmailSender};
use super::AuthError;
use crate::model::{
    normalize_email, Application, AuthParams, OtpCode, OtpDelivery, TICKET_TTL_MINUTES,
};
use crate::store::Storage;

fn generate_code() -> String {
    format!("{:06}", rand::rng().random_range(0..1_000_000u32))
}

/// Non-empty request parameters as query pairs, `client_id` excluded.
pub fn auth_params_pairs(params: &AuthParams) -> Vec<(String, String)> {
    match serde_json::to_value(params) {
        Ok(Value::Object(map)) => map
            .into_iter()
            .filter(|(k, _)| k != "client_id")
            .filter_map(|(k, v)| match v {
                Value::String(s) if !s.is_empty() => Some((k, s)),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

pub struct PasswordlessService {
    store: Arc<dyn Storage>,
    email: Arc<dyn EmailSender>,
    verifier: CredentialVerifier,
    issuer: String,
}

impl PasswordlessService {
    pub fn new(store: Arc<dyn Storage>, email: Arc<dyn EmailSender>, issuer: &str) -> Self {
        Self {
            verifier: CredentialVerifier::new(store.clone()),
            store,
            email,
            issuer: issuer.to_string(),
        }
    }

    fn magic_link(&self, email: &str, code: &str, params: &AuthParams) -> Result<String, AuthError> {
        let base = format!("{}passwordless/verify_redirect", self.issuer);
        let mut url = url::Url::parse(&base)
            .map_err(|e| AuthError::Internal(format!("Invalid issuer URL: {}", e)))?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("verification_code", code)
                .append_pair("email", email)
                .append_pair("client_id", &params.client_id);
            for (key, value) in auth_params_pairs(params) {
                query.append_pair(&key, &value);
            }
        }
        Ok(url.to_string())
    }

    /// Stores a new one-time code for `email` and sends it.
    #[instrument(skip(self, application, email, auth_params), fields(tenant_id = %application.tenant_id, client_id = %application.id))]
    pub async fn start(
        &self,
        application: &Application,
        email: &str,
        send: OtpDelivery,
        mut auth_params: AuthParams,
    ) -> Result<(), AuthError> {
        let email = normalize_email(email);
        if email.is_empty() || !email.contains('@') {
            return Err(AuthError::Validation("Invalid email address".to_string()));
        }
        auth_params.client_id = application.id.clone();

        let now = Utc::now();
        let otp = OtpCode {
            id: uuid::Uuid::new_v4().simple().to_string(),
            tenant_id: application.tenant_id.clone(),
            client_id: application.id.clone(),
            email: email.clone(),
            code: generate_code(),
            send,
            auth_params,
            created_at: now,
            expires_at: now + Duration::minutes(TICKET_TTL_MINUTES),
            used_at: None,
        };
        self.store.insert_otp(&otp).await?;

        let link = match send {
            OtpDelivery::Link => Some(self.magic_link(&email, &otp.code, &otp.auth_params)?),
            OtpDelivery::Code => None,
        };
        self.email
            .send(EmailMessage {
                tenant_id: application.tenant_id.clone(),
                to: email,
                kind: EmailKind::Passwordless {
                    code: otp.code,
                    link,
                },
            })
            .await?;

        info!(send = send.as_str(), "Passwordless flow started");
        Ok(())
    }

    /// Checks a code from a magic link.
    pub async fn verify(
        &self,
        tenant_id: &str,
        email: &str,
        code: &str,
    ) -> Result<Verified, AuthError> {
        self.verifier
            .verify(
                tenant_id,
                &Credential::Otp {
                    username: email.to_string(),
                    otp: code.to_string(),
                },
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::email::MemoryEmailSender;
    use crate::db::in_memory_store;

    fn app() -> Application {
        Application {
            id: "app".to_string(),
            tenant_id: "acme".to_string(),
            name: "App".to_string(),
            client_secret: None,
            callbacks: vec!["https://app.example.com/cb".to_string()],
            allowed_logout_urls: vec![],
            web_origins: vec![],
            created_at: Utc::now(),
        }
    }

    async fn service() -> (Arc<MemoryEmailSender>, PasswordlessService) {
        let store = Arc::new(in_memory_store("passwordless").await.unwrap());
        let mailer = Arc::new(MemoryEmailSender::new());
        let service = PasswordlessService::new(store, mailer.clone(), "https://id.example.com/");
        (mailer, service)
    }

    #[tokio::test]
    async fn code_is_sent_to_normalized_address_and_verifies() {
        let (mailer, service) = service().await;
        service
            .start(&app(), "New@Example.com", OtpDelivery::Code, AuthParams::default())
            .await
            .unwrap();

        let code = mailer.last_code_for("new@example.com").await.unwrap();
        assert_eq!(code.len(), 6);
        assert!(code.chars().all(|c| c.is_ascii_digit()));

        let verified = service.verify("acme", "new@example.com", &code).await.unwrap();
        assert_eq!(verified.user.email.as_deref(), Some("new@example.com"));
        assert_eq!(verified.auth_params.unwrap().client_id, "app");
    }

    #[tokio::test]
    async fn link_carries_code_and_auth_params() {
        let (mailer, service) = service().await;
        let params = AuthParams {
            redirect_uri: Some("https://app.example.com/cb".to_string()),
            response_type: Some("code".to_string()),
            state: Some("s1".to_string()),
            ..Default::default()
        };
        service
            .start(&app(), "a@example.com", OtpDelivery::Link, params)
            .await
            .unwrap();

        let message = mailer.last_to("a@example.com").await.unwrap();
        let EmailKind::Passwordless { code, link } = message.kind else {
            panic!("expected passwordless email");
        };
        let link = link.unwrap();
        assert!(link.starts_with("https://id.example.com/passwordless/verify_redirect?"));
        assert!(link.contains(&format!("verification_code={}", code)));
        assert!(link.contains("client_id=app"));
        assert!(link.contains("state=s1"));
        assert!(link.contains("redirect_uri=https%3A%2F%2Fapp.example.com%2Fcb"));
    }

    #[tokio::test]
    async fn invalid_email_is_rejected() {
        let (_, service) = service().await;
        let err = service
            .start(&app(), "   ", OtpDelivery::Code, AuthParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Validation(_)));
    }
}
