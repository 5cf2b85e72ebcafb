//! Login tickets: the single-use bridge from a verified credential to token
//! issuance at `/authorize?login_ticket=`.

use chrono::{Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use super::credentials::{Credential, CredentialVerifier};
use super::{random_token, AuthError};
use crate::model::{AuthParams, Application, Ticket, User, TICKET_TTL_MINUTES};
use crate::store::Storage;

/// Response body of a successful `/co/authenticate`.
#[derive(Debug, Clone, Serialize)]
pub struct IssuedTicket {
    pub login_ticket: String,
    pub co_verifier: String,
    pub co_id: String,
}

pub struct TicketExchange {
    store: Arc<dyn Storage>,
    verifier: CredentialVerifier,
}

impl TicketExchange {
    pub fn new(store: Arc<dyn Storage>) -> Self {
        Self {
            verifier: CredentialVerifier::new(store.clone()),
            store,
        }
    }

    pub fn verifier(&self) -> &CredentialVerifier {
        &self.verifier
    }

    /// Verifies `credential` for `application` and issues a ticket.
    #[instrument(skip(self, application, credential), fields(tenant_id = %application.tenant_id, client_id = %application.id))]
    pub async fn authenticate(
        &self,
        application: &Application,
        credential: &Credential,
    ) -> Result<IssuedTicket, AuthError> {
        let verified = self
            .verifier
            .verify(&application.tenant_id, credential)
            .await?;

        let auth_params = verified.auth_params.unwrap_or_else(|| AuthParams {
            client_id: application.id.clone(),
            ..Default::default()
        });
        let ticket = self
            .issue(application, &verified.user, auth_params)
            .await?;

        Ok(IssuedTicket {
            login_ticket: ticket.id,
            co_verifier: random_token(24),
            co_id: random_token(9),
        })
    }

    /// Stores a fresh ticket for `user`.
    pub async fn issue(
        &self,
        application: &Application,
        user: &User,
        auth_params: AuthParams,
    ) -> Result<Ticket, AuthError> {
        let now = Utc::now();
        let ticket = Ticket {
            id: random_token(24),
            tenant_id: application.tenant_id.clone(),
            client_id: application.id.clone(),
            email: user.email.clone().unwrap_or_default(),
            user_id: user.id.clone(),
            auth_params,
            created_at: now,
            expires_at: now + Duration::minutes(TICKET_TTL_MINUTES),
            used_at: None,
        };
        self.store.insert_ticket(&ticket).await?;
        info!(user_id = %user.id, "Issued login ticket");
        Ok(ticket)
    }

    /// Redeems a ticket once, for the client it was issued to. Unknown,
    /// used, expired and foreign tickets fail alike and leave the ticket as
    /// it was.
    #[instrument(skip(self, ticket_id))]
    pub async fn redeem(
        &self,
        tenant_id: &str,
        client_id: &str,
        ticket_id: &str,
    ) -> Result<Ticket, AuthError> {
        match self
            .store
            .redeem_ticket(tenant_id, client_id, ticket_id, Utc::now())
            .await?
        {
            Some(ticket) => Ok(ticket),
            None => {
                warn!("Rejected login ticket: unknown, used, expired or another client's");
                Err(AuthError::Authentication(
                    "Invalid or expired login ticket".to_string(),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::password::hash_password;
    use crate::auth::WRONG_PASSWORD;
    use crate::db::in_memory_store;
    use crate::model::{DATABASE_CONNECTION, DATABASE_PROVIDER};
    use crate::store::UserStore;

    fn app() -> Application {
        Application {
            id: "app".to_string(),
            tenant_id: "acme".to_string(),
            name: "App".to_string(),
            client_secret: None,
            callbacks: vec![],
            allowed_logout_urls: vec![],
            web_origins: vec![],
            created_at: Utc::now(),
        }
    }

    async fn exchange() -> TicketExchange {
        let store = Arc::new(in_memory_store("tickets").await.unwrap());
        let mut user = User::new("acme", DATABASE_PROVIDER, DATABASE_CONNECTION, false);
        user.email = Some("john@example.com".to_string());
        user.password_hash = Some(hash_password("correct horse").unwrap());
        store.insert_user(&user).await.unwrap();
        TicketExchange::new(store)
    }

    fn credential(password: &str) -> Credential {
        Credential::Password {
            username: "john@example.com".to_string(),
            realm: DATABASE_CONNECTION.to_string(),
            password: password.to_string(),
        }
    }

    #[tokio::test]
    async fn ticket_redeems_exactly_once() {
        let exchange = exchange().await;
        let issued = exchange
            .authenticate(&app(), &credential("correct horse"))
            .await
            .unwrap();

        let ticket = exchange.redeem("acme", "app", &issued.login_ticket).await.unwrap();
        assert_eq!(ticket.auth_params.client_id, "app");
        assert_eq!(ticket.email, "john@example.com");

        let err = exchange
            .redeem("acme", "app", &issued.login_ticket)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Authentication(_)));
    }

    #[tokio::test]
    async fn wrong_password_issues_no_ticket() {
        let exchange = exchange().await;
        let err = exchange
            .authenticate(&app(), &credential("wrong"))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), WRONG_PASSWORD);
    }

    #[tokio::test]
    async fn ticket_is_bound_to_tenant() {
        let exchange = exchange().await;
        let issued = exchange
            .authenticate(&app(), &credential("correct horse"))
            .await
            .unwrap();
        assert!(exchange.redeem("globex", "app", &issued.login_ticket).await.is_err());
        assert!(exchange.redeem("acme", "app", &issued.login_ticket).await.is_ok());
    }

    #[tokio::test]
    async fn other_client_cannot_spend_ticket() {
        let exchange = exchange().await;
        let issued = exchange
            .authenticate(&app(), &credential("correct horse"))
            .await
            .unwrap();
        assert!(exchange
            .redeem("acme", "other-app", &issued.login_ticket)
            .await
            .is_err());
        assert!(exchange.redeem("acme", "app", &issued.login_ticket).await.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_redemptions_succeed_once() {
        let exchange = Arc::new(exchange().await);
        let issued = exchange
            .authenticate(&app(), &credential("correct horse"))
            .await
            .unwrap();

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let exchange = exchange.clone();
                let ticket = issued.login_ticket.clone();
                tokio::spawn(async move { exchange.redeem("acme", "app", &ticket).await })
            })
            .collect();
        let mut redeemed = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                redeemed += 1;
            }
        }
        assert_eq!(redeemed, 1);
    }
}
