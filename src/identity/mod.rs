//! Session identity
//!
//! Bettors are identified by an HS256 session token minted at login by the
//! auth frontend. This module only consumes those tokens: it checks the
//! signature against the shared secret and pulls out the `wallet_address`
//! claim. Anything that does not verify resolves to no identity.

use base64::{engine::general_purpose, Engine as _};
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use tracing::warn;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Deserialize)]
struct TokenHeader {
    alg: String,
}

#[derive(Debug, Deserialize)]
struct TokenClaims {
    wallet_address: String,
    #[serde(default)]
    exp: Option<i64>,
}

fn decode_b64url(input: &str) -> Option<Vec<u8>> {
    general_purpose::URL_SAFE_NO_PAD
        .decode(input)
        .or_else(|_| general_purpose::URL_SAFE.decode(input))
        .ok()
}

/// Verifies session tokens and resolves them to wallet addresses
pub struct SessionIdentity {
    key: Vec<u8>,
    cookie_name: String,
}

impl SessionIdentity {
    pub fn new(secret: &str, cookie_name: &str) -> Self {
        Self {
            key: secret.as_bytes().to_vec(),
            cookie_name: cookie_name.to_string(),
        }
    }

    /// Pull the session token out of a `Cookie` header line and resolve it
    pub fn wallet_from_cookie_header(&self, header: &str) -> Option<String> {
        let token = header.split(';').find_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            (name == self.cookie_name).then(|| value.trim().to_string())
        })?;
        self.wallet_from_token(&token)
    }

    /// Resolve a raw token to the wallet address it attests, or nothing
    pub fn wallet_from_token(&self, token: &str) -> Option<String> {
        let mut parts = token.split('.');
        let header_b64 = parts.next()?;
        let payload_b64 = parts.next()?;
        let signature_b64 = parts.next()?;
        if parts.next().is_some() {
            return None;
        }

        let header: TokenHeader = serde_json::from_slice(&decode_b64url(header_b64)?).ok()?;
        if !header.alg.eq_ignore_ascii_case("HS256") {
            warn!(alg = %header.alg, "Rejected session token with unsupported algorithm");
            return None;
        }

        let signature = decode_b64url(signature_b64)?;
        let mut mac = HmacSha256::new_from_slice(&self.key).ok()?;
        mac.update(header_b64.as_bytes());
        mac.update(b".");
        mac.update(payload_b64.as_bytes());
        if mac.verify_slice(&signature).is_err() {
            return None;
        }

        // Claims are only read after the signature held up
        let claims: TokenClaims = serde_json::from_slice(&decode_b64url(payload_b64)?).ok()?;
        if let Some(exp) = claims.exp {
            if exp <= Utc::now().timestamp() {
                return None;
            }
        }
        if claims.wallet_address.trim().is_empty() {
            return None;
        }
        Some(claims.wallet_address)
    }
}
