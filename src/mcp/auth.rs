//! Optional bearer-token validation for the MCP HTTP transport
//!
//! Keys are discovered from the configured authorization server's metadata
//! document and cached; tokens are RS256-validated and checked against the
//! required scopes. When the transport runs without a validator it is
//! unauthenticated and meant for trusted local use only.

use crate::config::OAuthConfig;
use crate::error::{AppError, McpError, Result};
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde_json::Value;
use std::sync::RwLock;
use tracing::{debug, warn};

pub struct OAuthValidator {
    authorization_server_url: String,
    required_scopes: Vec<String>,
    http: reqwest::Client,
    jwks: RwLock<Option<JwkSet>>,
}

impl OAuthValidator {
    pub fn from_config(config: &OAuthConfig) -> Option<Self> {
        let url = config.authorization_server_url.clone()?;
        Some(Self {
            authorization_server_url: url,
            required_scopes: config.required_scopes.clone(),
            http: reqwest::Client::new(),
            jwks: RwLock::new(None),
        })
    }

    /// Discover the JWKS endpoint and cache the key set. Called at startup
    /// and whenever validation misses a key id.
    pub async fn refresh(&self) -> Result<()> {
        let metadata_url = format!(
            "{}/.well-known/oauth-authorization-server",
            self.authorization_server_url.trim_end_matches('/')
        );
        let metadata: Value = self
            .http
            .get(&metadata_url)
            .send()
            .await?
            .error_for_status()
            .map_err(AppError::Http)?
            .json()
            .await?;

        let jwks_uri = metadata
            .get("jwks_uri")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::Config("authorization server metadata lacks jwks_uri".into()))?;

        let key_set: JwkSet = self
            .http
            .get(jwks_uri)
            .send()
            .await?
            .error_for_status()
            .map_err(AppError::Http)?
            .json()
            .await?;

        debug!(keys = key_set.keys.len(), "JWKS refreshed");
        *self.jwks.write().expect("jwks lock poisoned") = Some(key_set);
        Ok(())
    }

    /// Validate a bearer token. A token naming a key id that is not in the
    /// cached set triggers one key-set refresh before the final verdict, so
    /// a key rotation at the authorization server does not lock clients out.
    pub async fn validate(&self, token: &str) -> Result<()> {
        let kid = token_key_id(token)?;
        if !self.knows_key(&kid) {
            if let Err(e) = self.refresh().await {
                warn!(error = %e, "JWKS refresh on unknown key id failed");
            }
        }
        self.validate_cached(token)
    }

    fn knows_key(&self, kid: &str) -> bool {
        self.jwks
            .read()
            .expect("jwks lock poisoned")
            .as_ref()
            .is_some_and(|key_set| key_set.find(kid).is_some())
    }

    /// Validate a bearer token against the cached key set only.
    pub fn validate_cached(&self, token: &str) -> Result<()> {
        let kid = token_key_id(token)?;

        let jwks = self.jwks.read().expect("jwks lock poisoned");
        let key_set = jwks
            .as_ref()
            .ok_or_else(|| AppError::Mcp(McpError::Unauthorized("no keys available".into())))?;
        let jwk = key_set
            .find(&kid)
            .ok_or_else(|| AppError::Mcp(McpError::Unauthorized(format!("unknown key id {kid}"))))?;

        let decoding_key = DecodingKey::from_jwk(jwk)
            .map_err(|e| AppError::Mcp(McpError::Unauthorized(e.to_string())))?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.validate_aud = false;

        let token_data = decode::<Value>(token, &decoding_key, &validation)
            .map_err(|e| AppError::Mcp(McpError::Unauthorized(e.to_string())))?;

        if !scopes_satisfied(&token_data.claims, &self.required_scopes) {
            warn!("Token rejected: missing required scope");
            return Err(AppError::Mcp(McpError::Unauthorized(
                "missing required scope".into(),
            )));
        }

        Ok(())
    }
}

/// Key id named by a token's header.
fn token_key_id(token: &str) -> Result<String> {
    let header = decode_header(token)
        .map_err(|e| AppError::Mcp(McpError::Unauthorized(e.to_string())))?;
    header
        .kid
        .ok_or_else(|| AppError::Mcp(McpError::Unauthorized("token has no key id".into())))
}

/// Accept either a space-delimited `scope` string or an `scp` array.
fn scopes_satisfied(claims: &Value, required: &[String]) -> bool {
    if required.is_empty() {
        return true;
    }

    let granted: Vec<String> = match (claims.get("scope"), claims.get("scp")) {
        (Some(Value::String(scope)), _) => {
            scope.split_whitespace().map(str::to_string).collect()
        }
        (_, Some(Value::Array(items))) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    };

    required.iter().all(|scope| granted.contains(scope))
}
