//! Impersonation tokens
//!
//! A JWT asserting the identity of the user being deleted, so downstream
//! services apply that user's own authorization rules. Signed RS256 when a
//! private key is configured, otherwise sent as an unsigned assertion
//! (`header.payload.`) for services that only read the claims.

use std::path::Path;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{Duration, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use tracing::info;

use um_config::CleanupConfig;

use crate::error::{IdentityError, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealmAccess {
    pub roles: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImpersonationClaims {
    pub iss: String,
    pub sub: String,
    pub exp: i64,
    pub realm_access: RealmAccess,
}

/// Credential for one orchestration run. Never persisted.
#[derive(Clone)]
pub struct ImpersonationToken {
    bearer_value: String,
    subject_user_id: String,
}

impl std::fmt::Debug for ImpersonationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImpersonationToken")
            .field("subject_user_id", &self.subject_user_id)
            .finish_non_exhaustive()
    }
}

impl ImpersonationToken {
    /// Raw JWT
    pub fn bearer_value(&self) -> &str {
        &self.bearer_value
    }

    pub fn subject_user_id(&self) -> &str {
        &self.subject_user_id
    }

    pub fn authorization_header(&self) -> String {
        format!("Bearer {}", self.bearer_value)
    }

    /// Read the claims back without verifying the signature.
    pub fn claims(&self) -> Result<ImpersonationClaims> {
        let payload = self
            .bearer_value
            .split('.')
            .nth(1)
            .ok_or_else(|| IdentityError::Signing("token has no payload segment".to_string()))?;
        let bytes = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|e| IdentityError::Signing(e.to_string()))?;
        serde_json::from_slice(&bytes).map_err(|e| IdentityError::Signing(e.to_string()))
    }
}

pub struct TokenMinter {
    issuer: String,
    lifetime: Duration,
    signing_key: Option<EncodingKey>,
}

impl TokenMinter {
    pub fn unsigned(issuer: impl Into<String>, lifetime: Duration) -> Self {
        Self {
            issuer: issuer.into(),
            lifetime,
            signing_key: None,
        }
    }

    pub fn with_rsa_pem(issuer: impl Into<String>, lifetime: Duration, pem: &[u8]) -> Result<Self> {
        let key = EncodingKey::from_rsa_pem(pem)
            .map_err(|e| IdentityError::Signing(format!("Invalid RSA private key: {}", e)))?;
        Ok(Self {
            issuer: issuer.into(),
            lifetime,
            signing_key: Some(key),
        })
    }

    pub fn from_config(config: &CleanupConfig) -> Result<Self> {
        let lifetime = Duration::seconds(config.token_lifetime_secs);
        let key_path = config.signing_key_path.trim();
        if key_path.is_empty() {
            info!(issuer = %config.token_issuer, "Impersonation tokens are unsigned");
            return Ok(Self::unsigned(config.token_issuer.clone(), lifetime));
        }

        let pem = std::fs::read(Path::new(key_path)).map_err(|source| {
            IdentityError::SigningKey {
                path: key_path.to_string(),
                source,
            }
        })?;
        info!(issuer = %config.token_issuer, "Impersonation tokens are signed with RS256");
        Self::with_rsa_pem(config.token_issuer.clone(), lifetime, &pem)
    }

    pub fn is_signed(&self) -> bool {
        self.signing_key.is_some()
    }

    /// Mint a token whose subject is `user_id`, with an empty role set.
    pub fn mint(&self, user_id: &str) -> Result<ImpersonationToken> {
        let claims = ImpersonationClaims {
            iss: self.issuer.clone(),
            sub: user_id.to_string(),
            exp: (Utc::now() + self.lifetime).timestamp(),
            realm_access: RealmAccess::default(),
        };
        let header = Header::new(Algorithm::RS256);

        let bearer_value = match &self.signing_key {
            Some(key) => encode(&header, &claims, key)
                .map_err(|e| IdentityError::Signing(format!("Failed to encode JWT: {}", e)))?,
            None => {
                let header = serde_json::to_vec(&header)
                    .map_err(|e| IdentityError::Signing(e.to_string()))?;
                let payload = serde_json::to_vec(&claims)
                    .map_err(|e| IdentityError::Signing(e.to_string()))?;
                format!(
                    "{}.{}.",
                    URL_SAFE_NO_PAD.encode(header),
                    URL_SAFE_NO_PAD.encode(payload)
                )
            }
        };

        Ok(ImpersonationToken {
            bearer_value,
            subject_user_id: user_id.to_string(),
        })
    }
}
