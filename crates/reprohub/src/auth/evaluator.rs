//! Admin flag derivation from organization membership.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::try_join_all;
use tracing::{debug, info};

use super::error::AuthError;
use super::{AccessToken, AuthResult, Authorizer, MembershipProvider};
use crate::session::UserIdentity;

/// Grants admin when the user belongs to ANY organization in the allow-list.
pub struct OrgMembershipAuthorizer {
    provider: Arc<dyn MembershipProvider>,
    organizations: Vec<String>,
}

impl OrgMembershipAuthorizer {
    /// The allow-list is fixed for the lifetime of the authorizer.
    pub fn new(provider: Arc<dyn MembershipProvider>, organizations: Vec<String>) -> Self {
        let mut organizations: Vec<String> = organizations
            .into_iter()
            .map(|org| org.trim().to_string())
            .filter(|org| !org.is_empty())
            .collect();
        organizations.sort();
        organizations.dedup();

        Self {
            provider,
            organizations,
        }
    }

    pub fn organizations(&self) -> &[String] {
        &self.organizations
    }
}

#[async_trait]
impl Authorizer for OrgMembershipAuthorizer {
    async fn authorize(
        &self,
        identity: &UserIdentity,
        token: &AccessToken,
    ) -> Result<AuthResult, AuthError> {
        if self.organizations.is_empty() {
            debug!("No admin organizations configured; {} is not admin", identity.login);
            return Ok(AuthResult { is_admin: false });
        }

        // All queries must answer before admission; the first error aborts.
        let checks = self
            .organizations
            .iter()
            .map(|org| self.provider.is_member(org, &identity.login, token));
        let memberships = try_join_all(checks).await?;

        let is_admin = memberships.into_iter().any(|member| member);
        info!("Authorized {} (admin: {})", identity.login, is_admin);
        Ok(AuthResult { is_admin })
    }
}
