//! Token issuance and validation.
//!
//! Credentials are `header.claims.signature`, each segment URL-safe
//! base64 without padding. The signature is HMAC-SHA256 over the first
//! two segments. The algorithm is pinned to HS256: a header claiming
//! anything else is rejected before any cryptographic work.

use super::{constant_time_eq, AuthContext, Permissions, MIN_SIGNING_KEY_LENGTH};
use crate::error::{FabricError, Result};
use crate::stats::FabricStats;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

const PINNED_ALGORITHM: &str = "HS256";

/// Token header; only one algorithm is ever accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Header {
    alg: String,
    typ: String,
}

/// Claims carried by a credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Issuer.
    pub iss: String,
    /// Subject, the agent identity.
    pub sub: String,
    /// Audience.
    pub aud: String,
    /// Issued-at, seconds since the epoch.
    pub iat: i64,
    /// Not valid before.
    pub nbf: i64,
    /// Expiry.
    pub exp: i64,
    /// Unique token ID.
    pub jti: String,
    /// Role label.
    pub role: String,
    /// Permission bitmask.
    pub permissions: Permissions,
}

/// Configuration for the token service.
#[derive(Debug, Clone)]
pub struct TokenConfig {
    /// HMAC signing key, at least [`MIN_SIGNING_KEY_LENGTH`] bytes.
    pub signing_key: Vec<u8>,
    pub issuer: String,
    pub audience: String,
    /// Lifetime of issued tokens.
    pub validity: Duration,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            signing_key: Vec::new(),
            issuer: "meshfabric".to_string(),
            audience: "fabric-agents".to_string(),
            validity: Duration::from_secs(3600),
        }
    }
}

/// Issues and validates agent credentials.
pub struct TokenService {
    config: TokenConfig,
    stats: Option<Arc<FabricStats>>,
}

impl TokenService {
    pub fn new(config: TokenConfig) -> Result<Self> {
        if config.signing_key.len() < MIN_SIGNING_KEY_LENGTH {
            return Err(FabricError::InvalidConfig {
                field: "signing_key".to_string(),
                reason: format!(
                    "must be at least {MIN_SIGNING_KEY_LENGTH} bytes, got {}",
                    config.signing_key.len()
                ),
            });
        }
        Ok(Self {
            config,
            stats: None,
        })
    }

    /// Attach fabric counters; issuance is counted once attached.
    pub fn with_stats(mut self, stats: Arc<FabricStats>) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Issue a signed credential with the configured default validity.
    pub fn issue(
        &self,
        subject: &str,
        role: &str,
        permissions: Permissions,
    ) -> Result<String> {
        self.issue_with_validity(subject, role, permissions, self.config.validity)
    }

    /// Issue a signed credential with an explicit validity window.
    pub fn issue_with_validity(
        &self,
        subject: &str,
        role: &str,
        permissions: Permissions,
        validity: Duration,
    ) -> Result<String> {
        if subject.is_empty() {
            return Err(FabricError::InvalidArgument(
                "subject must not be empty".to_string(),
            ));
        }
        if role.is_empty() {
            return Err(FabricError::InvalidArgument(
                "role must not be empty".to_string(),
            ));
        }

        let now = Utc::now();
        let claims = Claims {
            iss: self.config.issuer.clone(),
            sub: subject.to_string(),
            aud: self.config.audience.clone(),
            iat: now.timestamp(),
            nbf: now.timestamp(),
            exp: now.timestamp() + validity.as_secs() as i64,
            jti: Uuid::new_v4().to_string(),
            role: role.to_string(),
            permissions,
        };
        self.issue_with_claims(&claims)
    }

    fn issue_with_claims(&self, claims: &Claims) -> Result<String> {
        let header = Header {
            alg: PINNED_ALGORITHM.to_string(),
            typ: "JWT".to_string(),
        };

        let header_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header)?);
        let claims_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims)?);
        let signing_input = format!("{header_b64}.{claims_b64}");

        let signature = self.sign(signing_input.as_bytes())?;
        let signature_b64 = URL_SAFE_NO_PAD.encode(signature);

        if let Some(stats) = &self.stats {
            stats.record_token_issued();
        }
        debug!(subject = %claims.sub, jti = %claims.jti, "Issued credential");
        Ok(format!("{signing_input}.{signature_b64}"))
    }

    /// Validate a credential and return the authenticated context.
    ///
    /// Order matters: structural checks and the algorithm pin come
    /// first, then the signature, and only a correctly signed token has
    /// its time window examined.
    pub fn validate(&self, token: &str) -> Result<AuthContext> {
        let mut parts = token.split('.');
        let (header_b64, claims_b64, signature_b64) =
            match (parts.next(), parts.next(), parts.next(), parts.next()) {
                (Some(h), Some(c), Some(s), None) => (h, c, s),
                _ => {
                    return Err(FabricError::InvalidToken(
                        "expected three dot-separated segments".to_string(),
                    ))
                }
            };

        let header_bytes = URL_SAFE_NO_PAD
            .decode(header_b64)
            .map_err(|_| FabricError::InvalidToken("undecodable header".to_string()))?;
        let header: Header = serde_json::from_slice(&header_bytes)
            .map_err(|_| FabricError::InvalidToken("malformed header".to_string()))?;

        // Algorithm confusion: the header never chooses the algorithm.
        if header.alg != PINNED_ALGORITHM {
            return Err(FabricError::InvalidToken(format!(
                "algorithm {} not accepted",
                header.alg
            )));
        }

        let signing_input = format!("{header_b64}.{claims_b64}");
        let expected = self.sign(signing_input.as_bytes())?;
        let presented = URL_SAFE_NO_PAD
            .decode(signature_b64)
            .map_err(|_| FabricError::InvalidToken("undecodable signature".to_string()))?;

        if !constant_time_eq(&expected, &presented) {
            return Err(FabricError::InvalidToken("signature mismatch".to_string()));
        }

        let claims_bytes = URL_SAFE_NO_PAD
            .decode(claims_b64)
            .map_err(|_| FabricError::InvalidToken("undecodable claims".to_string()))?;
        let claims: Claims = serde_json::from_slice(&claims_bytes)
            .map_err(|_| FabricError::InvalidToken("malformed claims".to_string()))?;

        if claims.iss != self.config.issuer {
            return Err(FabricError::InvalidToken("unknown issuer".to_string()));
        }
        if claims.aud != self.config.audience {
            return Err(FabricError::InvalidToken("wrong audience".to_string()));
        }

        let now = Utc::now().timestamp();
        if now < claims.nbf {
            return Err(FabricError::NotYetValid);
        }
        if now >= claims.exp {
            return Err(FabricError::ExpiredToken);
        }

        let expires_at = timestamp_to_datetime(claims.exp)?;

        Ok(AuthContext {
            subject: claims.sub,
            role: claims.role,
            permissions: claims.permissions,
            token_id: claims.jti,
            expires_at,
        })
    }

    fn sign(&self, input: &[u8]) -> Result<Vec<u8>> {
        let mut mac = HmacSha256::new_from_slice(&self.config.signing_key)
            .map_err(|_| FabricError::Internal("HMAC key rejected".to_string()))?;
        mac.update(input);
        Ok(mac.finalize().into_bytes().to_vec())
    }
}

fn timestamp_to_datetime(ts: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_opt(ts, 0)
        .single()
        .ok_or_else(|| FabricError::InvalidToken("timestamp out of range".to_string()))
}
