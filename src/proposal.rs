//! Proposal handler (C9): mints and verifies signed, stateless proposal tokens
//! carrying everything an approver needs — there is no server-side proposal store.

use crate::error::BrokerError;
use crate::principal::JitGroupId;
use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertyValue {
    pub name: String,
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposalClaims {
    pub iss: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
    pub jti: String,
    pub group: JitGroupId,
    pub user: String,
    pub recipients: Vec<String>,
    pub joining_user_input: Vec<PropertyValue>,
    /// Duration resolved from the `ExpiryConstraint` at proposal time (seconds).
    /// The approval path grants this exact duration rather than re-deriving it,
    /// so a policy edit between proposal and approval can't change the grant.
    pub duration_secs: i64,
}

#[derive(Debug, Clone)]
pub struct Proposal {
    pub id: String,
    pub group: JitGroupId,
    pub proposing_user: String,
    pub recipients: Vec<String>,
    pub expiry: DateTime<Utc>,
    pub joining_user_input: Vec<PropertyValue>,
    pub duration: chrono::Duration,
}

/// Signs and verifies proposal tokens. HS256 here; an asymmetric signer can
/// implement the same surface without changing callers.
pub struct ProposalHandler {
    service_identity: String,
    signing_secret: String,
    ttl: chrono::Duration,
}

impl ProposalHandler {
    pub fn new(service_identity: impl Into<String>, signing_secret: impl Into<String>, ttl: chrono::Duration) -> Self {
        ProposalHandler { service_identity: service_identity.into(), signing_secret: signing_secret.into(), ttl }
    }

    /// Mints a signed, URL-embeddable token for the given join intent and
    /// recipient set. `exp` is bounded by the configured proposal lifetime.
    pub fn propose(
        &self,
        group: JitGroupId,
        proposing_user: &str,
        recipients: Vec<String>,
        joining_user_input: Vec<PropertyValue>,
        duration: chrono::Duration,
    ) -> Result<(String, Proposal), BrokerError> {
        let now = Utc::now();
        let exp = now + self.ttl;
        let id = hex::encode(rand::random::<[u8; 16]>());

        let claims = ProposalClaims {
            iss: self.service_identity.clone(),
            aud: self.service_identity.clone(),
            iat: now.timestamp(),
            exp: exp.timestamp(),
            jti: id.clone(),
            group: group.clone(),
            user: proposing_user.to_string(),
            recipients: recipients.clone(),
            joining_user_input: joining_user_input.clone(),
            duration_secs: duration.num_seconds(),
        };

        let header = Header::new(Algorithm::HS256);
        let token = encode(&header, &claims, &EncodingKey::from_secret(self.signing_secret.as_bytes()))
            .map_err(|e| BrokerError::External(format!("failed to sign proposal token: {e}")))?;

        let proposal = Proposal {
            id,
            group,
            proposing_user: proposing_user.to_string(),
            recipients,
            expiry: exp,
            joining_user_input,
            duration,
        };

        Ok((obfuscate(&token), proposal))
    }

    /// Verifies signature, issuer/audience equality with the configured service
    /// identity, algorithm, and expiry. Any failure is a generic denial — no
    /// partial information about *why* leaks to the caller.
    pub fn accept(&self, obfuscated_token: &str) -> Result<Proposal, BrokerError> {
        let token = deobfuscate(obfuscated_token)
            .ok_or_else(|| BrokerError::AccessDenied("invalid proposal token".into()))?;

        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_audience(&[&self.service_identity]);
        validation.set_issuer(&[&self.service_identity]);
        validation.leeway = 60; // +/-60s clock skew, per the documented tolerance

        let data = decode::<ProposalClaims>(&token, &DecodingKey::from_secret(self.signing_secret.as_bytes()), &validation)
            .map_err(|e| {
                tracing::warn!(error = %e, "proposal token rejected");
                BrokerError::AccessDenied("invalid or expired proposal".into())
            })?;

        let claims = data.claims;
        Ok(Proposal {
            id: claims.jti,
            group: claims.group,
            proposing_user: claims.user,
            recipients: claims.recipients,
            expiry: DateTime::from_timestamp(claims.exp, 0).unwrap_or(Utc::now()),
            joining_user_input: claims.joining_user_input,
            duration: chrono::Duration::seconds(claims.duration_secs),
        })
    }
}

/// URL-safe, reversible, non-cryptographic transform applied purely to keep
/// over-eager phishing filters from flagging a raw JWT in a URL: byte-reverse the
/// token, then base64url-encode it.
fn obfuscate(token: &str) -> String {
    use base64::Engine;
    let reversed: Vec<u8> = token.bytes().rev().collect();
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(reversed)
}

fn deobfuscate(obfuscated: &str) -> Option<String> {
    use base64::Engine;
    let reversed = base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(obfuscated).ok()?;
    let restored: Vec<u8> = reversed.into_iter().rev().collect();
    String::from_utf8(restored).ok()
}
