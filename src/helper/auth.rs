//! Short-lived authorization tokens for elevated calls.
//!
//! A token is `base64(claims) "." base64(ed25519 signature over claims)`.
//! The engine obtains one from an [`Authorizer`] before every elevated call;
//! the helper checks it with a [`TokenVerifier`] holding only the public key.
//! Each nonce is accepted once.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::Utc;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::util::atomic_write;

/// The only right the helper honours.
pub const ELEVATED_RIGHT: &str = "caretaker.elevated.execute";

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("malformed token: {0}")]
    Malformed(String),

    #[error("token signature is invalid")]
    BadSignature,

    #[error("token grants '{0}', not the requested right")]
    WrongRight(String),

    #[error("token expired")]
    Expired,

    #[error("token was already used")]
    Replayed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Claims {
    right: String,
    nonce: String,
    /// Unix milliseconds.
    expires_at: i64,
}

/// Source of authorization tokens. Decoupled from the RPC itself so the
/// helper can verify the grant independently of the request carrying it.
pub trait Authorizer: Send + Sync {
    fn authorize(&self, right: &str) -> Result<String, AuthError>;
}

/// Signs tokens with a locally held Ed25519 key.
pub struct LocalAuthority {
    signing_key: SigningKey,
    ttl: Duration,
}

impl LocalAuthority {
    /// Fresh in-memory key pair.
    pub fn generate(ttl: Duration) -> Self {
        let mut secret = [0u8; 32];
        rand::rng().fill(&mut secret);
        Self {
            signing_key: SigningKey::from_bytes(&secret),
            ttl,
        }
    }

    /// Load `authority.key` from `data_dir`, creating the pair on first use.
    /// The public half is (re)written to `authority.pub`.
    pub fn load_or_create(data_dir: &Path, ttl: Duration) -> Result<Self, AuthError> {
        let key_path = data_dir.join("authority.key");
        let authority = if key_path.exists() {
            let encoded = std::fs::read_to_string(&key_path)?;
            let bytes = decode_key::<32>(encoded.trim())?;
            Self {
                signing_key: SigningKey::from_bytes(&bytes),
                ttl,
            }
        } else {
            let authority = Self::generate(ttl);
            std::fs::create_dir_all(data_dir)?;
            atomic_write(&key_path, STANDARD.encode(authority.signing_key.to_bytes()).as_bytes())?;
            restrict_permissions(&key_path)?;
            log::info!("Created authorization key pair in {}", data_dir.display());
            authority
        };
        atomic_write(
            &data_dir.join("authority.pub"),
            authority.public_key_base64().as_bytes(),
        )?;
        Ok(authority)
    }

    pub fn public_key_base64(&self) -> String {
        STANDARD.encode(self.signing_key.verifying_key().to_bytes())
    }

    /// Verifier trusting this authority's public key.
    pub fn verifier(&self) -> TokenVerifier {
        TokenVerifier::new(self.signing_key.verifying_key())
    }

    fn sign(&self, claims: &Claims) -> Result<String, AuthError> {
        let payload =
            serde_json::to_vec(claims).map_err(|e| AuthError::Malformed(e.to_string()))?;
        let signature = self.signing_key.sign(&payload);
        Ok(format!(
            "{}.{}",
            STANDARD.encode(&payload),
            STANDARD.encode(signature.to_bytes())
        ))
    }
}

impl Authorizer for LocalAuthority {
    fn authorize(&self, right: &str) -> Result<String, AuthError> {
        let claims = Claims {
            right: right.to_string(),
            nonce: uuid::Uuid::new_v4().to_string(),
            expires_at: Utc::now().timestamp_millis() + self.ttl.as_millis() as i64,
        };
        self.sign(&claims)
    }
}

/// Helper-side token check.
pub struct TokenVerifier {
    key: VerifyingKey,
    /// nonce → expiry; pruned as entries expire.
    seen: Mutex<HashMap<String, i64>>,
}

impl TokenVerifier {
    pub fn new(key: VerifyingKey) -> Self {
        Self {
            key,
            seen: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_base64(public_key: &str) -> Result<Self, AuthError> {
        let bytes = decode_key::<32>(public_key.trim())?;
        let key =
            VerifyingKey::from_bytes(&bytes).map_err(|e| AuthError::InvalidKey(e.to_string()))?;
        Ok(Self::new(key))
    }

    pub fn load(path: &Path) -> Result<Self, AuthError> {
        Self::from_base64(&std::fs::read_to_string(path)?)
    }

    /// Accept `token` for `right` exactly once.
    pub fn verify(&self, token: &str, right: &str) -> Result<(), AuthError> {
        let (payload_b64, sig_b64) = token
            .split_once('.')
            .ok_or_else(|| AuthError::Malformed("missing signature".into()))?;
        let payload = STANDARD
            .decode(payload_b64)
            .map_err(|e| AuthError::Malformed(e.to_string()))?;
        let sig_bytes: [u8; 64] = STANDARD
            .decode(sig_b64)
            .map_err(|e| AuthError::Malformed(e.to_string()))?
            .try_into()
            .map_err(|_| AuthError::Malformed("signature must be 64 bytes".into()))?;

        self.key
            .verify(&payload, &Signature::from_bytes(&sig_bytes))
            .map_err(|_| AuthError::BadSignature)?;

        let claims: Claims =
            serde_json::from_slice(&payload).map_err(|e| AuthError::Malformed(e.to_string()))?;
        if claims.right != right {
            return Err(AuthError::WrongRight(claims.right));
        }
        let now = Utc::now().timestamp_millis();
        if claims.expires_at <= now {
            return Err(AuthError::Expired);
        }

        let mut seen = self
            .seen
            .lock()
            .map_err(|_| AuthError::Malformed("nonce cache lock poisoned".into()))?;
        seen.retain(|_, expires_at| *expires_at > now);
        if seen.contains_key(&claims.nonce) {
            return Err(AuthError::Replayed);
        }
        seen.insert(claims.nonce, claims.expires_at);
        Ok(())
    }
}

fn decode_key<const N: usize>(encoded: &str) -> Result<[u8; N], AuthError> {
    STANDARD
        .decode(encoded)
        .map_err(|e| AuthError::InvalidKey(format!("invalid base64: {}", e)))?
        .try_into()
        .map_err(|_| AuthError::InvalidKey(format!("key must be {} bytes", N)))
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
