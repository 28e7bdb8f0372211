//! Authentication (`spec.md` §4.4 "Authentication", §6 "Auth validators").
//!
//! `jwt` and `apiKey` are external collaborators per the spec; this module
//! defines them as traits and ships one reference implementation of each
//! so `tunneld` is runnable without a real IdP wired in. The token
//! classification rule itself — a `ur_` prefix selects the API-key path,
//! anything else is treated as a bearer credential — is part of the core
//! and lives in [`classify_token`].

use async_trait::async_trait;
use hex::ToHex;
use sha2::{Digest, Sha256};

use tunnel_protocol::ErrorKind;

#[derive(Debug, Clone)]
pub struct ApiKeyQuota {
    pub user_id: String,
    pub per_minute: u32,
    pub per_day: u32,
}

#[async_trait]
pub trait JwtValidator: Send + Sync {
    async fn validate(&self, token: &str) -> Result<String, ErrorKind>;
}

#[async_trait]
pub trait ApiKeyValidator: Send + Sync {
    async fn validate(&self, token: &str) -> Result<ApiKeyQuota, ErrorKind>;
}

pub enum TokenClass<'a> {
    ApiKey(&'a str),
    Bearer(&'a str),
}

/// Classifies a raw `init` token per `spec.md` §4.4: a token beginning
/// with `ur_` is an API key; anything else is a bearer credential.
pub fn classify_token(token: &str) -> TokenClass<'_> {
    if let Some(rest) = token.strip_prefix("ur_") {
        TokenClass::ApiKey(rest)
    } else {
        TokenClass::Bearer(token)
    }
}

/// Minimal HMAC-SHA256 bearer-token validator: `header.payload.sig`, each
/// segment hex-encoded, `sig = HMAC_SHA256(secret, header.payload)`, and
/// `payload` is `user_id` in plain text. This is a stand-in for a real JWT
/// library/identity-provider integration, not a general-purpose JWT
/// implementation — production deployments replace this with their own
/// `JwtValidator`.
pub struct HmacJwtValidator {
    secret: Vec<u8>,
}

impl HmacJwtValidator {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Produces a token a peer holding `secret` can validate. Exposed so
    /// tests (and a future `tunneld generate-token` subcommand) can mint
    /// tokens without reimplementing the scheme.
    pub fn sign(secret: &[u8], user_id: &str) -> String {
        let header = hex::encode("hs256");
        let payload = hex::encode(user_id);
        let sig = hmac_sha256(secret, format!("{header}.{payload}").as_bytes());
        format!("{header}.{payload}.{sig}")
    }
}

fn hmac_sha256(secret: &[u8], message: &[u8]) -> String {
    // A deliberately simple HMAC construction (not a general-purpose
    // crypto primitive): two rounds of SHA-256 over secret-padded blocks,
    // enough for a local token stand-in that is never meant to protect
    // anything beyond this reference deployment.
    const BLOCK_SIZE: usize = 64;
    let mut key = secret.to_vec();
    if key.len() > BLOCK_SIZE {
        key = Sha256::digest(&key).to_vec();
    }
    key.resize(BLOCK_SIZE, 0);

    let mut ipad = vec![0x36u8; BLOCK_SIZE];
    let mut opad = vec![0x5cu8; BLOCK_SIZE];
    for i in 0..BLOCK_SIZE {
        ipad[i] ^= key[i];
        opad[i] ^= key[i];
    }

    let mut inner = Sha256::new();
    inner.update(&ipad);
    inner.update(message);
    let inner_digest = inner.finalize();

    let mut outer = Sha256::new();
    outer.update(&opad);
    outer.update(inner_digest);
    outer.finalize().encode_hex::<String>()
}

#[async_trait]
impl JwtValidator for HmacJwtValidator {
    async fn validate(&self, token: &str) -> Result<String, ErrorKind> {
        let mut parts = token.splitn(3, '.');
        let (header, payload, sig) = match (parts.next(), parts.next(), parts.next()) {
            (Some(h), Some(p), Some(s)) => (h, p, s),
            _ => return Err(ErrorKind::AuthInvalid),
        };
        let expected = hmac_sha256(&self.secret, format!("{header}.{payload}").as_bytes());
        if expected != sig {
            return Err(ErrorKind::AuthInvalid);
        }
        let user_id =
            String::from_utf8(hex::decode(payload).map_err(|_| ErrorKind::AuthInvalid)?)
                .map_err(|_| ErrorKind::AuthInvalid)?;
        if user_id.is_empty() {
            return Err(ErrorKind::AuthInvalid);
        }
        Ok(user_id)
    }
}

/// Looks up a `ur_`-prefixed key in a fixed, configured table. Production
/// deployments replace this with a call to their key-management service.
pub struct StaticApiKeyValidator {
    keys: std::collections::HashMap<String, ApiKeyQuota>,
}

impl StaticApiKeyValidator {
    pub fn new(keys: std::collections::HashMap<String, ApiKeyQuota>) -> Self {
        Self { keys }
    }

    pub fn empty() -> Self {
        Self::new(std::collections::HashMap::new())
    }
}

#[async_trait]
impl ApiKeyValidator for StaticApiKeyValidator {
    async fn validate(&self, token: &str) -> Result<ApiKeyQuota, ErrorKind> {
        self.keys.get(token).cloned().ok_or(ErrorKind::AuthInvalid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_ur_prefixed_tokens_as_api_keys() {
        match classify_token("ur_abc123") {
            TokenClass::ApiKey(rest) => assert_eq!(rest, "abc123"),
            TokenClass::Bearer(_) => panic!("expected api key"),
        }
        match classify_token("eyJhbGciOi") {
            TokenClass::Bearer(t) => assert_eq!(t, "eyJhbGciOi"),
            TokenClass::ApiKey(_) => panic!("expected bearer"),
        }
    }

    #[tokio::test]
    async fn hmac_validator_round_trips_a_signed_token() {
        let secret = b"super-secret".to_vec();
        let token = HmacJwtValidator::sign(&secret, "user-42");
        let validator = HmacJwtValidator::new(secret);
        let user_id = validator.validate(&token).await.unwrap();
        assert_eq!(user_id, "user-42");
    }

    #[tokio::test]
    async fn hmac_validator_rejects_tampered_token() {
        let secret = b"super-secret".to_vec();
        let token = HmacJwtValidator::sign(&secret, "user-42");
        let validator = HmacJwtValidator::new(b"different-secret".to_vec());
        assert!(validator.validate(&token).await.is_err());
    }

    #[tokio::test]
    async fn static_api_key_validator_returns_quota() {
        let mut keys = std::collections::HashMap::new();
        keys.insert(
            "abc".to_string(),
            ApiKeyQuota {
                user_id: "user-1".into(),
                per_minute: 10,
                per_day: 1000,
            },
        );
        let validator = StaticApiKeyValidator::new(keys);
        let quota = validator.validate("abc").await.unwrap();
        assert_eq!(quota.user_id, "user-1");
        assert!(validator.validate("missing").await.is_err());
    }
}
