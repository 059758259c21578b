//! Organization-membership authorization.
//!
//! The admin flag is derived fresh on every session start from the user's
//! membership in a configured allow-list of organizations.

mod error;
mod evaluator;
mod github;

pub use error::AuthError;
pub use evaluator::OrgMembershipAuthorizer;
pub use github::GitHubMembershipClient;

use async_trait::async_trait;

use crate::session::UserIdentity;

/// Access token from the identity-provider login handshake.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken(String);

impl AccessToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AccessToken(****)")
    }
}

/// Outcome of a successful authorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub struct AuthResult {
    pub is_admin: bool,
}

/// Answers "is this user a member of this organization".
#[async_trait]
pub trait MembershipProvider: Send + Sync {
    async fn is_member(
        &self,
        org: &str,
        username: &str,
        token: &AccessToken,
    ) -> Result<bool, AuthError>;
}

/// Decides what privileges a user gets for a new session.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(
        &self,
        identity: &UserIdentity,
        token: &AccessToken,
    ) -> Result<AuthResult, AuthError>;
}
