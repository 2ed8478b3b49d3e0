//! Pre-signed direct bucket writes.

use crate::models::data::Location;
use base64::{Engine as _, engine::general_purpose};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// Authorization for one direct client → bucket write.
#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SignedUpload {
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

/// Signs `(location, key, expiry)` triples with a shared secret.
#[derive(Clone)]
pub struct UrlSigner {
    secret: Arc<str>,
    public_url: Arc<str>,
    ttl: Duration,
}

impl UrlSigner {
    pub fn new(secret: &str, public_url: &str, ttl: Duration) -> Self {
        Self {
            secret: secret.into(),
            public_url: public_url.trim_end_matches('/').into(),
            ttl,
        }
    }

    fn signature(&self, location: &Location, key: &str, expires: i64) -> String {
        let expires = expires.to_string();
        let mut sha = Sha256::new();
        for part in [
            self.secret.as_bytes(),
            location.as_str().as_bytes(),
            key.as_bytes(),
            expires.as_bytes(),
        ] {
            sha.update((part.len() as u64).to_be_bytes());
            sha.update(part);
        }
        general_purpose::URL_SAFE_NO_PAD.encode(sha.finalize())
    }

    /// Authorize a PUT of `key` into `location`'s bucket until now + TTL.
    pub fn sign_put(&self, location: &Location, key: &str) -> SignedUpload {
        let expires_at = Utc::now() + self.ttl;
        let expires = expires_at.timestamp();
        let signature = self.signature(location, key, expires);
        SignedUpload {
            url: format!(
                "{}/_bucket/{}/{}?expires={}&signature={}",
                self.public_url, location, key, expires, signature
            ),
            expires_at,
        }
    }

    /// Check a presented signature; expired authorizations never verify.
    pub fn verify(
        &self,
        location: &Location,
        key: &str,
        expires: i64,
        signature: &str,
        now: DateTime<Utc>,
    ) -> bool {
        if expires < now.timestamp() {
            return false;
        }
        let expected = self.signature(location, key, expires);
        constant_time_eq(expected.as_bytes(), signature.as_bytes())
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
