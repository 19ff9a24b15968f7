//! OAuth client-credentials authentication for the Dataverse API.
//!
//! The tenant is not configured explicitly: an unauthenticated probe to
//! the API URL returns a `WWW-Authenticate` challenge whose
//! `authorization_uri` embeds the tenant GUID. The token is then
//! obtained with a client-credentials grant against the Microsoft
//! identity platform v2 endpoint.

use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use tracing::{debug, info};

use crate::config::Config;
use crate::error::SyncError;

const TENANT_PATTERN: &str = r#"(?i)authorization_uri="[^"]*?/([0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12})/oauth2"#;

#[derive(Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
}

/// Handles tenant discovery and token acquisition.
pub struct DataverseAuth {
    config: Config,
    http: reqwest::Client,
    tenant_id: Option<String>,
}

impl DataverseAuth {
    pub fn new(config: Config) -> Result<Self, SyncError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| SyncError::Auth(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            config,
            http,
            tenant_id: None,
        })
    }

    /// The tenant GUID, once discovered.
    pub fn tenant_id(&self) -> Option<&str> {
        self.tenant_id.as_deref()
    }

    /// Discover the tenant GUID from the `WWW-Authenticate` challenge
    /// returned by an unauthenticated request to the API URL.
    pub async fn discover_tenant_id(&mut self) -> Result<String, SyncError> {
        if let Some(tenant) = &self.tenant_id {
            return Ok(tenant.clone());
        }

        debug!(url = %self.config.api_url, "probing API for WWW-Authenticate challenge");
        let response = self
            .http
            .get(&self.config.api_url)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| SyncError::Auth(format!("failed to discover tenant ID: {e}")))?;

        let www_auth = response
            .headers()
            .get(reqwest::header::WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");

        if www_auth.is_empty() {
            return Err(SyncError::Auth(
                "no WWW-Authenticate header found in response".to_string(),
            ));
        }

        let pattern = Regex::new(TENANT_PATTERN)
            .map_err(|e| SyncError::Auth(format!("invalid tenant pattern: {e}")))?;
        let tenant = pattern
            .captures(www_auth)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| {
                SyncError::Auth(format!(
                    "could not extract tenant ID from WWW-Authenticate header: {www_auth}"
                ))
            })?;

        info!(tenant = %tenant, "discovered tenant ID");
        self.tenant_id = Some(tenant.clone());
        Ok(tenant)
    }

    /// Obtain an access token via the client-credentials grant.
    pub async fn authenticate(&mut self) -> Result<String, SyncError> {
        let tenant = self.discover_tenant_id().await?;
        let token_url = format!("https://login.microsoftonline.com/{tenant}/oauth2/v2.0/token");

        let params = [
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
            ("scope", self.config.scope.as_str()),
            ("grant_type", "client_credentials"),
        ];

        let response = self
            .http
            .post(&token_url)
            .form(&params)
            .send()
            .await
            .map_err(|e| SyncError::Auth(format!("token request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::Auth(format!(
                "token exchange failed with status {status}: {body}"
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| SyncError::Auth(format!("invalid token response: {e}")))?;

        token.access_token.ok_or_else(|| {
            SyncError::Auth("no access_token in authentication response".to_string())
        })
    }
}
