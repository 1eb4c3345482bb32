//! Agent authentication handshake
//!
//! `POST /agent/auth` trades a hostname hint for a short-lived opaque
//! connection token bound to the caller's source address. The WebSocket
//! upgrade presents the token back; validation checks expiry and that the
//! connecting peer matches the bound source. Tokens are TTL-based, not
//! single-use.

use crate::config::AuthSettings;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::net::IpAddr;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

/// Authentication failures. The Display text of validation errors is what
/// goes into the 4001 close reason.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("too many authentication attempts")]
    RateLimited { retry_after: u64 },

    #[error("unknown or revoked token")]
    UnknownToken,

    #[error("token expired")]
    Expired,

    #[error("token bound to a different source address")]
    SourceMismatch,
}

/// What a token asserts about its holder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenClaims {
    pub hostname_hint: String,
    pub source_ip: IpAddr,
    pub issued_at: DateTime<Utc>,
    pub ttl_seconds: u64,
}

impl TokenClaims {
    fn expires_at(&self) -> DateTime<Utc> {
        self.issued_at + Duration::seconds(i64::try_from(self.ttl_seconds).unwrap_or(i64::MAX))
    }
}

/// A freshly issued connection token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedToken {
    pub token: String,
    pub expires_in: u64,
}

/// Issues and validates connection tokens, with a sliding per-source-IP
/// rate-limit window.
pub struct ConnectionAuthenticator {
    settings: AuthSettings,
    tokens: DashMap<String, TokenClaims>,
    attempts: DashMap<IpAddr, Vec<DateTime<Utc>>>,
}

impl ConnectionAuthenticator {
    #[must_use]
    pub fn new(settings: AuthSettings) -> Self {
        Self {
            settings,
            tokens: DashMap::new(),
            attempts: DashMap::new(),
        }
    }

    /// Issues a token for `source_ip`. The hostname hint is advisory (header
    /// supplied); absent, the source address stands in for it.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::RateLimited`] when the source exceeded its
    /// attempt budget inside the window.
    pub fn issue_token(
        &self,
        hostname_hint: Option<&str>,
        source_ip: IpAddr,
    ) -> Result<IssuedToken, AuthError> {
        self.check_and_record_attempt(source_ip)?;
        self.sweep_expired_tokens();

        let token = format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple());
        let claims = TokenClaims {
            hostname_hint: hostname_hint
                .map_or_else(|| source_ip.to_string(), ToString::to_string),
            source_ip,
            issued_at: Utc::now(),
            ttl_seconds: self.settings.connection_token_ttl_seconds,
        };
        info!(hostname = %claims.hostname_hint, %source_ip, "issued connection token");
        self.tokens.insert(token.clone(), claims);

        Ok(IssuedToken {
            token,
            expires_in: self.settings.connection_token_ttl_seconds,
        })
    }

    /// Validates a presented token against the connecting peer
    ///
    /// # Errors
    ///
    /// Returns the validation failure; its Display text is the close reason.
    pub fn validate_token(&self, token: &str, source_ip: IpAddr) -> Result<TokenClaims, AuthError> {
        let claims = self
            .tokens
            .get(token)
            .map(|entry| entry.value().clone())
            .ok_or(AuthError::UnknownToken)?;

        if Utc::now() > claims.expires_at() {
            self.tokens.remove(token);
            return Err(AuthError::Expired);
        }
        if claims.source_ip != source_ip {
            warn!(
                bound = %claims.source_ip,
                peer = %source_ip,
                "token presented from a different source address"
            );
            return Err(AuthError::SourceMismatch);
        }
        Ok(claims)
    }

    /// Seconds a rate-limited caller should wait before retrying
    #[must_use]
    pub fn retry_after_seconds(&self) -> u64 {
        self.settings.rate_limit_window_seconds
    }

    fn check_and_record_attempt(&self, source_ip: IpAddr) -> Result<(), AuthError> {
        let window =
            Duration::seconds(i64::try_from(self.settings.rate_limit_window_seconds).unwrap_or(0));
        let now = Utc::now();
        let mut attempts = self.attempts.entry(source_ip).or_default();
        attempts.retain(|at| *at + window > now);
        if attempts.len() >= self.settings.rate_limit_max_attempts as usize {
            warn!(%source_ip, "authentication rate limit hit");
            return Err(AuthError::RateLimited {
                retry_after: self.settings.rate_limit_window_seconds,
            });
        }
        attempts.push(now);
        Ok(())
    }

    fn sweep_expired_tokens(&self) {
        let now = Utc::now();
        self.tokens.retain(|_, claims| now <= claims.expires_at());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(ttl: u64, max_attempts: u32) -> AuthSettings {
        AuthSettings {
            connection_token_ttl_seconds: ttl,
            rate_limit_window_seconds: 900,
            rate_limit_max_attempts: max_attempts,
        }
    }

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([10, 0, 0, last])
    }

    #[test]
    fn issued_token_validates_for_its_source() {
        let auth = ConnectionAuthenticator::new(settings(3600, 10));
        let issued = auth.issue_token(Some("node-1.example.com"), ip(1)).unwrap();
        assert_eq!(issued.expires_in, 3600);

        let claims = auth.validate_token(&issued.token, ip(1)).unwrap();
        assert_eq!(claims.hostname_hint, "node-1.example.com");
    }

    #[test]
    fn token_bound_to_source_rejects_other_peers() {
        let auth = ConnectionAuthenticator::new(settings(3600, 10));
        let issued = auth.issue_token(None, ip(1)).unwrap();
        assert_eq!(
            auth.validate_token(&issued.token, ip(2)),
            Err(AuthError::SourceMismatch)
        );
    }

    #[test]
    fn expired_token_is_rejected_and_forgotten() {
        let auth = ConnectionAuthenticator::new(settings(0, 10));
        let issued = auth.issue_token(None, ip(1)).unwrap();
        assert_eq!(
            auth.validate_token(&issued.token, ip(1)),
            Err(AuthError::Expired)
        );
        // Second presentation no longer finds the token at all.
        assert_eq!(
            auth.validate_token(&issued.token, ip(1)),
            Err(AuthError::UnknownToken)
        );
    }

    #[test]
    fn unknown_token_is_rejected() {
        let auth = ConnectionAuthenticator::new(settings(3600, 10));
        assert_eq!(
            auth.validate_token("bogus", ip(1)),
            Err(AuthError::UnknownToken)
        );
    }

    #[test]
    fn rate_limit_applies_per_source_ip() {
        let auth = ConnectionAuthenticator::new(settings(3600, 2));
        assert!(auth.issue_token(None, ip(1)).is_ok());
        assert!(auth.issue_token(None, ip(1)).is_ok());
        assert_eq!(
            auth.issue_token(None, ip(1)),
            Err(AuthError::RateLimited { retry_after: 900 })
        );
        // A different source still has budget.
        assert!(auth.issue_token(None, ip(2)).is_ok());
    }

    #[test]
    fn missing_hostname_hint_falls_back_to_source_ip() {
        let auth = ConnectionAuthenticator::new(settings(3600, 10));
        let issued = auth.issue_token(None, ip(7)).unwrap();
        let claims = auth.validate_token(&issued.token, ip(7)).unwrap();
        assert_eq!(claims.hostname_hint, "10.0.0.7");
    }
}
