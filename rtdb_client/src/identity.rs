//! Identity, ConnectionId and IdentityToken (spec §3).
//!
//! Grounded on `EnhancedConnectionId` in
//! `examples/original_source/src/spacetimedb_sdk/connection_id.py`, which
//! keeps both a byte form and a two-`u64` form of the same 16 bytes.

use std::fmt;

use sha2::{Digest, Sha256};

use crate::error::{AuthError, Result};
use crate::time::Timestamp;

/// Opaque 32-byte principal identifier. All-zero denotes anonymous.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity(pub [u8; 32]);

impl Identity {
    pub const ANONYMOUS: Identity = Identity([0u8; 32]);

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Identity(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_anonymous(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// Derives an identity from a public key by hashing it, per spec §3.
    pub fn from_public_key(public_key: &[u8]) -> Self {
        let digest = Sha256::digest(public_key);
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        Identity(out)
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({})", hex_encode(&self.0))
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex_encode(&self.0))
    }
}

/// 16-byte handle identifying one live connection.
///
/// Representable equivalently as a pair of `u64`s, matching the server's
/// wire representation of a connection address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ConnectionId(pub [u8; 16]);

impl ConnectionId {
    pub const ZERO: ConnectionId = ConnectionId([0u8; 16]);

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        ConnectionId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn from_u64_pair(high: u64, low: u64) -> Self {
        let mut bytes = [0u8; 16];
        bytes[0..8].copy_from_slice(&high.to_be_bytes());
        bytes[8..16].copy_from_slice(&low.to_be_bytes());
        ConnectionId(bytes)
    }

    pub fn as_u64_pair(&self) -> (u64, u64) {
        let high = u64::from_be_bytes(self.0[0..8].try_into().unwrap());
        let low = u64::from_be_bytes(self.0[8..16].try_into().unwrap());
        (high, low)
    }

    /// Generates a client-side connection id when the server hasn't assigned one yet.
    pub fn generate() -> Self {
        let high = rand::random::<u64>();
        let low = rand::random::<u64>();
        Self::from_u64_pair(high, low)
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionId({})", hex_encode(&self.0))
    }
}

/// Identity, bearer token, and connection id, with validity window.
#[derive(Debug, Clone)]
pub struct IdentityToken {
    pub identity: Identity,
    pub token: String,
    pub connection_id: ConnectionId,
    pub issued_at: Timestamp,
    pub expires_at: Option<Timestamp>,
}

impl IdentityToken {
    pub fn new(
        identity: Identity,
        token: String,
        connection_id: ConnectionId,
        issued_at: Timestamp,
        expires_at: Option<Timestamp>,
    ) -> Result<Self> {
        Self::validate_token(&token)?;
        Ok(Self {
            identity,
            token,
            connection_id,
            issued_at,
            expires_at,
        })
    }

    fn validate_token(token: &str) -> Result<()> {
        if token.is_empty() || token.len() > 8192 {
            return Err(AuthError::InvalidToken(format!(
                "token length {} out of bounds",
                token.len()
            ))
            .into());
        }
        if !token.chars().all(|c| c.is_ascii_graphic() || c == '.') {
            return Err(AuthError::InvalidToken("token contains invalid characters".into()).into());
        }
        Ok(())
    }

    /// Validates the token hasn't expired as of `now`.
    pub fn check_expiry(&self, now: Timestamp) -> Result<()> {
        if let Some(expires_at) = self.expires_at {
            if now > expires_at {
                return Err(AuthError::Expired.into());
            }
        }
        Ok(())
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{b:02x}"));
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymous_identity_is_all_zero() {
        assert!(Identity::ANONYMOUS.is_anonymous());
        assert!(!Identity::from_public_key(b"key").is_anonymous());
    }

    #[test]
    fn connection_id_u64_pair_roundtrips() {
        let id = ConnectionId::from_u64_pair(0x0102030405060708, 0x1112131415161718);
        let (h, l) = id.as_u64_pair();
        assert_eq!(h, 0x0102030405060708);
        assert_eq!(l, 0x1112131415161718);
    }

    #[test]
    fn token_validation_rejects_empty() {
        let err = IdentityToken::new(
            Identity::ANONYMOUS,
            String::new(),
            ConnectionId::ZERO,
            Timestamp::from_micros(0),
            None,
        );
        assert!(err.is_err());
    }
}
