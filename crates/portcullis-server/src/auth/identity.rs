//! Identity resolution and account linking.
//!
//! A user row with `linked_to` set is a secondary identity. Tokens are always
//! issued for the root of the link chain, and the root's identity list is
//! `[self, ...secondaries in creation order]`.
//!
//! The store does not enforce acyclic links, so chain walking is bounded by
//! `MAX_LINK_DEPTH`. A self-reference, a missing target or an over-deep chain
//! is logged as an anomaly and the looked-up user is treated as primary.

use chrono::Utc;
use std::sync::Arc;
use tracing::{error, info, instrument};

use super::social::SocialProfile;
use super::AuthError;
use crate::model::{normalize_email, Identity, User};
use crate::store::UserStore;

pub const MAX_LINK_DEPTH: usize = 2;

/// A canonical user with its identity list.
#[derive(Debug, Clone)]
pub struct ResolvedUser {
    pub user: User,
    pub identities: Vec<Identity>,
}

fn identity_of(user: &User, profile_data: Option<serde_json::Value>) -> Identity {
    Identity {
        connection: user.connection.clone(),
        provider: user.provider.clone(),
        user_id: user.local_id().to_string(),
        is_social: user.is_social,
        profile_data,
    }
}

pub struct IdentityResolver {
    store: Arc<dyn UserStore>,
}

impl IdentityResolver {
    pub fn new(store: Arc<dyn UserStore>) -> Self {
        Self { store }
    }

    /// Follows `linked_to` to the root user.
    async fn walk_to_root(&self, user: &User) -> Result<User, AuthError> {
        let mut current = user.clone();
        for _ in 0..MAX_LINK_DEPTH {
            let Some(target_id) = current.linked_to.clone() else {
                return Ok(current);
            };
            if target_id == current.id {
                error!(
                    tenant_id = %user.tenant_id,
                    user_id = %user.id,
                    "Link anomaly: user is linked to itself"
                );
                return Ok(user.clone());
            }
            match self.store.get_user(&user.tenant_id, &target_id).await? {
                Some(target) => current = target,
                None => {
                    error!(
                        tenant_id = %user.tenant_id,
                        user_id = %user.id,
                        target_id = %target_id,
                        "Link anomaly: linked_to target does not exist"
                    );
                    return Ok(user.clone());
                }
            }
        }

        if current.linked_to.is_some() {
            error!(
                tenant_id = %user.tenant_id,
                user_id = %user.id,
                max_depth = MAX_LINK_DEPTH,
                "Link anomaly: chain exceeds maximum depth"
            );
            return Ok(user.clone());
        }
        Ok(current)
    }

    #[instrument(skip(self, user), fields(tenant_id = %user.tenant_id, user_id = %user.id))]
    pub async fn resolve_primary(&self, user: &User) -> Result<ResolvedUser, AuthError> {
        let root = self.walk_to_root(user).await?;

        let mut identities = vec![identity_of(&root, None)];
        if root.linked_to.is_none() {
            for secondary in self
                .store
                .list_linked_users(&root.tenant_id, &root.id)
                .await?
            {
                identities.push(identity_of(&secondary, Some(secondary.profile_snapshot())));
            }
        }

        Ok(ResolvedUser {
            user: root,
            identities,
        })
    }

    /// Loads a user by id and resolves it.
    pub async fn resolve_by_id(
        &self,
        tenant_id: &str,
        user_id: &str,
    ) -> Result<ResolvedUser, AuthError> {
        let user = self
            .store
            .get_user(tenant_id, user_id)
            .await?
            .ok_or_else(|| AuthError::NotFound(format!("User not found: {}", user_id)))?;
        self.resolve_primary(&user).await
    }

    /// Makes `secondary_id` a secondary identity of `primary_id`.
    ///
    /// Linking an already-linked pair again succeeds. A secondary that is
    /// linked elsewhere, a primary that is itself secondary, or a secondary
    /// that has its own secondaries is rejected.
    #[instrument(skip(self))]
    pub async fn link(
        &self,
        tenant_id: &str,
        primary_id: &str,
        secondary_id: &str,
    ) -> Result<(), AuthError> {
        if primary_id == secondary_id {
            return Err(AuthError::Validation(
                "Cannot link a user to itself".to_string(),
            ));
        }

        let primary = self
            .store
            .get_user(tenant_id, primary_id)
            .await?
            .ok_or_else(|| AuthError::NotFound(format!("User not found: {}", primary_id)))?;
        let secondary = self
            .store
            .get_user(tenant_id, secondary_id)
            .await?
            .ok_or_else(|| AuthError::NotFound(format!("User not found: {}", secondary_id)))?;

        if !primary.is_primary() {
            return Err(AuthError::Conflict(format!(
                "User {} is already linked to another account",
                primary_id
            )));
        }
        match secondary.linked_to.as_deref() {
            Some(existing) if existing == primary_id => return Ok(()),
            Some(_) => {
                return Err(AuthError::Conflict(format!(
                    "User {} is already linked to another account",
                    secondary_id
                )))
            }
            None => {}
        }
        if !self
            .store
            .list_linked_users(tenant_id, secondary_id)
            .await?
            .is_empty()
        {
            return Err(AuthError::Conflict(format!(
                "User {} has linked accounts of its own",
                secondary_id
            )));
        }

        if !self
            .store
            .link_user(tenant_id, secondary_id, primary_id)
            .await?
        {
            return Err(AuthError::Conflict(format!(
                "User {} was linked concurrently",
                secondary_id
            )));
        }

        info!("Linked accounts");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn unlink(
        &self,
        tenant_id: &str,
        primary_id: &str,
        secondary_id: &str,
    ) -> Result<(), AuthError> {
        if self
            .store
            .unlink_user(tenant_id, secondary_id, primary_id)
            .await?
        {
            info!("Unlinked accounts");
            Ok(())
        } else {
            Err(AuthError::NotFound(format!(
                "User {} is not linked to {}",
                secondary_id, primary_id
            )))
        }
    }

    /// Finds or creates the user for a federated login through
    /// `connection`. Existing users get their profile refreshed; their links
    /// are untouched.
    #[instrument(skip(self, profile))]
    pub async fn resolve_or_create_social(
        &self,
        tenant_id: &str,
        connection: &str,
        profile: &SocialProfile,
    ) -> Result<User, AuthError> {
        if profile.subject.trim().is_empty() {
            return Err(AuthError::Validation(
                "missing provider subject claim".to_string(),
            ));
        }

        let user_id = format!("{}|{}", connection, profile.subject);
        let email = profile.email.as_deref().map(normalize_email);

        if let Some(mut existing) = self.store.get_user(tenant_id, &user_id).await? {
            existing.email = email.or(existing.email);
            existing.email_verified = profile.email_verified.unwrap_or(existing.email_verified);
            existing.name = profile.name.clone().or(existing.name);
            existing.nickname = profile.nickname.clone().or(existing.nickname);
            existing.picture = profile.picture.clone().or(existing.picture);
            existing.profile_data = Some(profile.raw.clone());
            existing.updated_at = Utc::now();
            self.store.update_profile(&existing).await?;
            return Ok(existing);
        }

        let mut user = User::with_id(tenant_id, &user_id, connection, connection, true);
        user.email = email;
        user.email_verified = profile.email_verified.unwrap_or(false);
        user.name = profile.name.clone();
        user.nickname = profile.nickname.clone();
        user.picture = profile.picture.clone();
        user.profile_data = Some(profile.raw.clone());
        self.store.insert_user(&user).await?;
        info!(user_id = %user.id, "Created social user");
        Ok(user)
    }
}
