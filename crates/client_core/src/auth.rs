use anyhow::{anyhow, Context, Result};
use reqwest::{Client, StatusCode};
use tracing::info;

const AUTH_CHECK_PATH: &str = "/users/auth/check";

/// Confirms with the server that a stored token is still valid before the
/// event channel is opened with it.
pub struct AuthGate {
    http: Client,
    server_url: String,
}

impl AuthGate {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            server_url: server_url.into(),
        }
    }

    pub async fn verify(&self, token: &str) -> Result<()> {
        let url = format!(
            "{}{AUTH_CHECK_PATH}",
            self.server_url.trim_end_matches('/')
        );
        let response = self
            .http
            .get(&url)
            .bearer_auth(token)
            .send()
            .await
            .with_context(|| format!("failed to reach auth check: {url}"))?;

        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(anyhow!("session expired or invalid; sign in again"))
            }
            _ => {
                response.error_for_status()?;
                info!("auth: session token accepted");
                Ok(())
            }
        }
    }
}
