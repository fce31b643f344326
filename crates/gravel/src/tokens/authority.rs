//! Join token issuance and validation.
//!
//! Tokens are 32 random bytes, URL-safe base64 encoded. Each carries a scope
//! and a validity window `[issued_at, expires_at)`. Under the single-use
//! policy a successful validation consumes the token in the same call, so two
//! joiners can never both pass on one token.

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use gravel_common::{TokenError, TokenPolicy};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::Duration;

/// An issued join credential
#[derive(Clone, Debug)]
pub struct Token {
    /// Opaque secret presented by joining nodes
    pub value: String,
    /// Scope the token admits nodes into
    pub scope: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Set by single-use validation or revocation
    pub consumed: bool,
}

impl Token {
    /// Check if `now` falls outside the validity window
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now < self.issued_at || now >= self.expires_at
    }

    /// Short identifier safe to put in logs
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.value)
    }
}

/// What a validated token grants
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScopeInfo {
    pub scope: String,
    pub expires_at: DateTime<Utc>,
}

/// First 12 hex digits of the SHA-256 of a token value
pub fn fingerprint(value: &str) -> String {
    let digest = Sha256::digest(value.as_bytes());
    digest[..6].iter().map(|b| format!("{:02x}", b)).collect()
}

/// Issues, validates and revokes join tokens
pub struct TokenAuthority {
    policy: TokenPolicy,
    /// Issued tokens keyed by value
    tokens: HashMap<String, Token>,
    /// Value of the most recently issued token
    current: Option<String>,
}

impl TokenAuthority {
    pub fn new(policy: TokenPolicy) -> Self {
        Self {
            policy,
            tokens: HashMap::new(),
            current: None,
        }
    }

    /// Issue a new token valid for `ttl` from now
    pub fn generate(&mut self, scope: &str, ttl: Duration) -> Token {
        self.generate_at(scope, ttl, Utc::now())
    }

    pub fn generate_at(&mut self, scope: &str, ttl: Duration, now: DateTime<Utc>) -> Token {
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let token = Token {
            value: generate_token_value(),
            scope: scope.to_string(),
            issued_at: now,
            expires_at,
            consumed: false,
        };

        tracing::debug!(
            fingerprint = %token.fingerprint(),
            scope = %token.scope,
            expires_at = %token.expires_at,
            "Issued join token"
        );

        self.current = Some(token.value.clone());
        self.tokens.insert(token.value.clone(), token.clone());
        token
    }

    /// Validate a token, consuming it under the single-use policy
    pub fn validate(&mut self, value: &str) -> Result<ScopeInfo, TokenError> {
        self.validate_at(value, Utc::now())
    }

    pub fn validate_at(&mut self, value: &str, now: DateTime<Utc>) -> Result<ScopeInfo, TokenError> {
        let policy = self.policy;
        let token = self.tokens.get_mut(value).ok_or(TokenError::Unknown)?;
        check(token, now)?;

        if policy == TokenPolicy::SingleUse {
            token.consumed = true;
            tracing::debug!(fingerprint = %token.fingerprint(), "Join token consumed");
        }

        Ok(ScopeInfo {
            scope: token.scope.clone(),
            expires_at: token.expires_at,
        })
    }

    /// Run the validation checks without consuming the token
    pub fn inspect(&self, value: &str) -> Result<ScopeInfo, TokenError> {
        self.inspect_at(value, Utc::now())
    }

    pub fn inspect_at(&self, value: &str, now: DateTime<Utc>) -> Result<ScopeInfo, TokenError> {
        let token = self.tokens.get(value).ok_or(TokenError::Unknown)?;
        check(token, now)?;

        Ok(ScopeInfo {
            scope: token.scope.clone(),
            expires_at: token.expires_at,
        })
    }

    /// Mark a token consumed regardless of expiry.
    ///
    /// Returns false if the value was never issued (or already purged).
    pub fn revoke(&mut self, value: &str) -> bool {
        match self.tokens.get_mut(value) {
            Some(token) => {
                if !token.consumed {
                    token.consumed = true;
                    tracing::info!(fingerprint = %token.fingerprint(), "Join token revoked");
                }
                true
            }
            None => false,
        }
    }

    /// The most recently issued token, if it is still usable
    pub fn current(&self) -> Option<&Token> {
        self.current_at(Utc::now())
    }

    pub fn current_at(&self, now: DateTime<Utc>) -> Option<&Token> {
        self.current
            .as_ref()
            .and_then(|value| self.tokens.get(value))
            .filter(|token| !token.consumed && !token.is_expired_at(now))
    }

    /// Drop tokens that expired more than `retain` ago, returning how many
    /// were removed. Until then they keep failing with `Expired`.
    pub fn purge_expired(&mut self, now: DateTime<Utc>, retain: Duration) -> usize {
        // Out-of-range retention never purges
        let Ok(retain) = chrono::Duration::from_std(retain) else {
            return 0;
        };
        let before = self.tokens.len();
        self.tokens.retain(|_, token| match token.expires_at.checked_add_signed(retain) {
            Some(purge_at) => now < purge_at,
            None => true,
        });
        before - self.tokens.len()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.tokens.len()
    }
}

fn check(token: &Token, now: DateTime<Utc>) -> Result<(), TokenError> {
    if token.is_expired_at(now) {
        return Err(TokenError::Expired);
    }
    if token.consumed {
        return Err(TokenError::AlreadyConsumed);
    }
    Ok(())
}

/// Generate a cryptographically secure token value
fn generate_token_value() -> String {
    use rand::Rng;

    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
