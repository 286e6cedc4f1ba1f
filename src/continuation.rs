//! Signed continuation tokens.
//!
//! A token is `base64url(json).base64url(hmac)`, where the MAC is
//! HMAC-SHA256 over the encoded payload. The payload pins the generation the
//! first page was served from, so every later page reads the same snapshot.

use crate::fetch::Format;
use crate::index::{Cursor, GenerationId};
use crate::planner::Progress;
use crate::profile::epoch_millis;
use crate::query::QuerySpec;
use crate::{Error, Result};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use hmac::{Hmac, Mac};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::Duration;

type HmacSha256 = Hmac<Sha256>;

pub const TOKEN_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContinuationToken {
    pub version: u32,
    pub index: String,
    pub generation: GenerationId,
    pub query: QuerySpec,
    pub cursor: Cursor,
    pub limit: usize,
    /// Page number the token resumes at (the first page is 1).
    pub page: u32,
    pub format: Format,
    /// Expiry, milliseconds since the epoch. Fixed when the first page is served.
    pub expires: u64,
    #[serde(default)]
    pub progress: Progress,
}

/// Encodes and verifies continuation tokens.
#[derive(Clone)]
pub struct TokenCodec {
    secret: Vec<u8>,
    ttl: Duration,
}

impl TokenCodec {
    /// # Arguments
    /// * `secret` - HMAC secret key
    /// * `ttl` - How long a pagination session stays resumable
    pub fn new(secret: impl Into<Vec<u8>>, ttl: Duration) -> Self {
        Self {
            secret: secret.into(),
            ttl,
        }
    }

    /// Generate a random 32-byte secret key from the OS random source.
    pub fn generate_secret() -> Vec<u8> {
        let mut bytes = vec![0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        bytes
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Expiry for a pagination session starting at `now_ms`.
    pub fn expiry_from(&self, now_ms: u64) -> u64 {
        let ttl_ms = u64::try_from(self.ttl.as_millis()).unwrap_or(u64::MAX);
        now_ms.saturating_add(ttl_ms)
    }

    pub fn encode(&self, token: &ContinuationToken) -> Result<String> {
        let json = serde_json::to_vec(token)
            .map_err(|e| Error::Internal(format!("cannot serialize token: {e}")))?;
        let payload = URL_SAFE_NO_PAD.encode(json);

        let mut mac = self.mac()?;
        mac.update(payload.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

        Ok(format!("{payload}.{signature}"))
    }

    /// Verify and decode a token, rejecting it if it has expired.
    pub fn decode(&self, raw: &str) -> Result<ContinuationToken> {
        self.decode_at(raw, epoch_millis())
    }

    fn decode_at(&self, raw: &str, now_ms: u64) -> Result<ContinuationToken> {
        let (payload, signature) = raw
            .trim()
            .split_once('.')
            .ok_or_else(|| Error::MalformedToken("missing signature".to_string()))?;

        let signature = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| Error::MalformedToken("signature is not base64url".to_string()))?;

        let mut mac = self.mac()?;
        mac.update(payload.as_bytes());
        if mac.verify_slice(&signature).is_err() {
            tracing::debug!("continuation token signature mismatch");
            return Err(Error::MalformedToken("bad signature".to_string()));
        }

        let json = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| Error::MalformedToken("payload is not base64url".to_string()))?;

        let version = serde_json::from_slice::<serde_json::Value>(&json)
            .ok()
            .and_then(|v| v.get("version").and_then(|v| v.as_u64()));
        if version != Some(u64::from(TOKEN_VERSION)) {
            return Err(Error::MalformedToken(format!(
                "unsupported token version {}",
                version.map_or_else(|| "(none)".to_string(), |v| v.to_string())
            )));
        }

        let token: ContinuationToken = serde_json::from_slice(&json)
            .map_err(|e| Error::MalformedToken(format!("invalid payload: {e}")))?;

        if now_ms > token.expires {
            tracing::debug!(
                "continuation token expired: now={}, expires={}",
                now_ms,
                token.expires
            );
            return Err(Error::ExpiredToken);
        }

        Ok(token)
    }

    fn mac(&self) -> Result<HmacSha256> {
        HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| Error::Internal(format!("invalid token secret: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(expires: u64) -> ContinuationToken {
        ContinuationToken {
            version: TOKEN_VERSION,
            index: "genes".to_string(),
            generation: 7,
            query: QuerySpec::Locus {
                chromosome: "8".to_string(),
                start: 100_000,
                end: 101_000,
            },
            cursor: Cursor::Locus {
                chromosome: "8".to_string(),
                start: 100_584,
                end: 100_728,
                source_key: "genes/part-00000.json".to_string(),
                byte_offset: 4096,
            },
            limit: 100,
            page: 2,
            format: Format::Column,
            expires,
            progress: Progress {
                bytes_read: 200,
                bytes_total: 1_000,
            },
        }
    }

    fn codec() -> TokenCodec {
        TokenCodec::new(b"test-secret".to_vec(), Duration::from_secs(3600))
    }

    #[test]
    fn test_encode_and_decode() {
        let codec = codec();
        let original = token(codec.expiry_from(epoch_millis()));
        let raw = codec.encode(&original).unwrap();
        assert!(!raw.contains('='));
        assert_eq!(codec.decode(&raw).unwrap(), original);
    }

    #[test]
    fn test_expired_token() {
        let codec = codec();
        let raw = codec.encode(&token(1_000)).unwrap();
        assert!(codec.decode_at(&raw, 1_000).is_ok());
        assert!(matches!(
            codec.decode_at(&raw, 1_001).unwrap_err(),
            Error::ExpiredToken
        ));
    }

    #[test]
    fn test_tampered_payload() {
        let codec = codec();
        let raw = codec.encode(&token(u64::MAX)).unwrap();
        let (_, signature) = raw.split_once('.').unwrap();

        let mut forged = token(u64::MAX);
        forged.generation = 8;
        let forged_payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&forged).unwrap());
        let err = codec
            .decode(&format!("{forged_payload}.{signature}"))
            .unwrap_err();
        assert!(matches!(err, Error::MalformedToken(_)));
    }

    #[test]
    fn test_wrong_secret() {
        let raw = codec().encode(&token(u64::MAX)).unwrap();
        let other = TokenCodec::new(b"other-secret".to_vec(), Duration::from_secs(3600));
        assert!(matches!(
            other.decode(&raw).unwrap_err(),
            Error::MalformedToken(_)
        ));
    }

    #[test]
    fn test_garbage_tokens() {
        let codec = codec();
        for raw in ["", "abc", "abc.def", "!!!.???", "."] {
            assert!(
                matches!(codec.decode(raw).unwrap_err(), Error::MalformedToken(_)),
                "{raw:?}"
            );
        }
    }

    #[test]
    fn test_unknown_version() {
        let codec = codec();
        let mut future = token(u64::MAX);
        future.version = TOKEN_VERSION + 1;
        let raw = codec.encode(&future).unwrap();
        let err = codec.decode(&raw).unwrap_err();
        assert!(err.to_string().contains("version"), "{err}");
    }

    #[test]
    fn test_expiry_from() {
        let codec = TokenCodec::new(b"k".to_vec(), Duration::from_secs(2));
        assert_eq!(codec.expiry_from(1_000), 3_000);
        assert_eq!(codec.expiry_from(u64::MAX), u64::MAX);
    }

    #[test]
    fn test_generate_secret() {
        let secret1 = TokenCodec::generate_secret();
        let secret2 = TokenCodec::generate_secret();

        assert_eq!(secret1.len(), 32);
        assert_eq!(secret2.len(), 32);
        assert_ne!(secret1, secret2);

        let chunks: Vec<&[u8]> = secret1.chunks(8).collect();
        assert!(chunks.windows(2).any(|pair| pair[0] != pair[1]));
    }
}
