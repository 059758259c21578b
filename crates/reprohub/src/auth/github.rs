//! GitHub organization membership client.

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url, redirect};
use tracing::debug;

use super::error::AuthError;
use super::{AccessToken, MembershipProvider};
use crate::config::AuthConfig;

/// Queries `GET /orgs/{org}/members/{username}` with the user's own token.
#[derive(Debug, Clone)]
pub struct GitHubMembershipClient {
    client: Client,
    api_url: Url,
}

impl GitHubMembershipClient {
    pub fn new(config: &AuthConfig) -> Result<Self, AuthError> {
        let api_url =
            Url::parse(&config.api_url).map_err(|e| AuthError::InvalidUrl(e.to_string()))?;
        if api_url.cannot_be_a_base() {
            return Err(AuthError::InvalidUrl(config.api_url.clone()));
        }

        // A 302 from this endpoint means "requester is not an org member";
        // following it would turn that answer into a different request.
        let client = Client::builder()
            .timeout(config.request_timeout())
            .user_agent(config.user_agent.clone())
            .redirect(redirect::Policy::none())
            .build()?;

        Ok(Self { client, api_url })
    }

    fn membership_url(&self, org: &str, username: &str) -> Result<Url, AuthError> {
        let mut url = self.api_url.clone();
        url.path_segments_mut()
            .map_err(|_| AuthError::InvalidUrl(self.api_url.to_string()))?
            .pop_if_empty()
            .extend(["orgs", org, "members", username]);
        Ok(url)
    }
}

#[async_trait]
impl MembershipProvider for GitHubMembershipClient {
    async fn is_member(
        &self,
        org: &str,
        username: &str,
        token: &AccessToken,
    ) -> Result<bool, AuthError> {
        let url = self.membership_url(org, username)?;
        let response = self
            .client
            .get(url)
            .header("Authorization", format!("Bearer {}", token.expose()))
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
            .send()
            .await?;

        let status = response.status();
        debug!("Membership of {} in {}: HTTP {}", username, org, status);

        match status {
            StatusCode::NO_CONTENT => Ok(true),
            StatusCode::NOT_FOUND | StatusCode::FOUND => Ok(false),
            StatusCode::UNAUTHORIZED => Err(AuthError::InvalidCredential),
            StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS
                if status == StatusCode::TOO_MANY_REQUESTS
                    || header_value(&response, "x-ratelimit-remaining").as_deref()
                        == Some("0") =>
            {
                Err(AuthError::RateLimited {
                    org: org.to_string(),
                    reset_at: header_value(&response, "x-ratelimit-reset")
                        .and_then(|v| v.parse().ok()),
                })
            }
            _ => {
                let body = response.text().await.unwrap_or_default();
                Err(AuthError::UnexpectedStatus {
                    org: org.to_string(),
                    status: status.as_u16(),
                    message: body.trim().chars().take(200).collect(),
                })
            }
        }
    }
}

fn header_value(response: &reqwest::Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}
