//! Published verification keys, indexed by signer id.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;

use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{WardenError, WardenResult};
use crate::signer::local::{constant_time_eq, hmac_sha256};
use crate::signer::SignatureAlgorithm;

#[derive(Clone, PartialEq, Eq)]
pub enum KeyMaterial {
    Ed25519(VerifyingKey),
    /// Shared secret of the dev-only HMAC signer. Never listed.
    HmacSha256(Vec<u8>),
}

impl KeyMaterial {
    pub fn algorithm(&self) -> SignatureAlgorithm {
        match self {
            Self::Ed25519(_) => SignatureAlgorithm::Ed25519,
            Self::HmacSha256(_) => SignatureAlgorithm::HmacSha256,
        }
    }

    pub fn verify(&self, message: &[u8], signature: &[u8]) -> WardenResult<()> {
        match self {
            Self::Ed25519(key) => {
                let sig = Signature::from_slice(signature)
                    .map_err(|_| WardenError::validation("malformed ed25519 signature"))?;
                key.verify(message, &sig)
                    .map_err(|_| WardenError::validation("ed25519 signature mismatch"))
            }
            Self::HmacSha256(secret) => {
                let expected = hmac_sha256(secret, message);
                if constant_time_eq(&expected, signature) {
                    Ok(())
                } else {
                    Err(WardenError::validation("hmac signature mismatch"))
                }
            }
        }
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ed25519(key) => write!(f, "Ed25519({})", hex::encode(key.as_bytes())),
            Self::HmacSha256(_) => f.write_str("HmacSha256(<redacted>)"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyInfo {
    pub signer_id: String,
    pub algorithm: SignatureAlgorithm,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key_hex: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TrustedKeysFile {
    #[serde(default)]
    keys: BTreeMap<String, String>,
    #[serde(default)]
    hmac_keys: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
pub struct KeyRegistry {
    keys: RwLock<BTreeMap<String, KeyMaterial>>,
}

impl KeyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads `{"keys": {signerId: ed25519PubHex}, "hmacKeys": {signerId: secretHex}}`.
    pub fn load_from_json(path: impl AsRef<Path>) -> WardenResult<Self> {
        let path = path.as_ref();
        let payload = fs::read(path)
            .map_err(|e| WardenError::Storage(format!("read {}: {e}", path.display())))?;
        Self::from_json_slice(&payload)
    }

    pub fn from_json_slice(payload: &[u8]) -> WardenResult<Self> {
        let file: TrustedKeysFile = serde_json::from_slice(payload)
            .map_err(|e| WardenError::validation(format!("invalid key registry file: {e}")))?;
        let registry = Self::new();
        for (signer_id, key_hex) in file.keys {
            registry.register(signer_id, KeyMaterial::Ed25519(parse_ed25519_hex(&key_hex)?));
        }
        for (signer_id, secret_hex) in file.hmac_keys {
            let secret = hex::decode(secret_hex.trim())
                .map_err(|_| WardenError::validation("hmac key must be hex"))?;
            registry.register(signer_id, KeyMaterial::HmacSha256(secret));
        }
        Ok(registry)
    }

    pub fn register(&self, signer_id: impl Into<String>, key: KeyMaterial) {
        let signer_id = signer_id.into();
        tracing::debug!(signer_id = %signer_id, algorithm = ?key.algorithm(), "registered signer key");
        self.keys.write().insert(signer_id, key);
    }

    pub fn get(&self, signer_id: &str) -> Option<KeyMaterial> {
        self.keys.read().get(signer_id).cloned()
    }

    pub fn list(&self) -> Vec<KeyInfo> {
        self.keys
            .read()
            .iter()
            .map(|(signer_id, key)| KeyInfo {
                signer_id: signer_id.clone(),
                algorithm: key.algorithm(),
                public_key_hex: match key {
                    KeyMaterial::Ed25519(vk) => Some(hex::encode(vk.as_bytes())),
                    KeyMaterial::HmacSha256(_) => None,
                },
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.keys.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn verify(&self, signer_id: &str, message: &[u8], signature: &[u8]) -> WardenResult<()> {
        let key = self
            .get(signer_id)
            .ok_or_else(|| WardenError::NotFound(format!("unknown signer {signer_id}")))?;
        key.verify(message, signature)
    }
}

pub fn parse_ed25519_hex(key_hex: &str) -> WardenResult<VerifyingKey> {
    let bytes = hex::decode(key_hex.trim())
        .map_err(|_| WardenError::validation("ed25519 public key must be hex"))?;
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| WardenError::validation("ed25519 public key must be 32 bytes"))?;
    VerifyingKey::from_bytes(&arr)
        .map_err(|_| WardenError::validation("invalid ed25519 public key"))
}
