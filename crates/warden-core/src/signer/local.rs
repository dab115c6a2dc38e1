use async_trait::async_trait;
use ed25519_dalek::{Signer as _, SigningKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

use super::{SignatureAlgorithm, SignatureEnvelope, Signer};
use crate::error::{WardenError, WardenResult};
use crate::keys::KeyMaterial;

enum LocalKey {
    Ed25519(SigningKey),
    Hmac(Vec<u8>),
}

/// In-process signer. Ed25519 for real deployments; HMAC-SHA256 over a shared
/// secret for dev only.
pub struct LocalSigner {
    signer_id: String,
    key: LocalKey,
    ephemeral: bool,
}

impl std::fmt::Debug for LocalSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalSigner")
            .field("signer_id", &self.signer_id)
            .field("algorithm", &self.algorithm())
            .field("ephemeral", &self.ephemeral)
            .finish()
    }
}

impl LocalSigner {
    pub fn ed25519(key: SigningKey) -> Self {
        let signer_id = default_ed25519_signer_id(key.verifying_key().as_bytes());
        Self {
            signer_id,
            key: LocalKey::Ed25519(key),
            ephemeral: false,
        }
    }

    pub fn ed25519_from_seed_hex(seed_hex: &str) -> WardenResult<Self> {
        let bytes = hex::decode(seed_hex.trim())
            .map_err(|_| WardenError::validation("ed25519 seed must be hex"))?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| WardenError::validation("ed25519 seed must be 32 bytes"))?;
        Ok(Self::ed25519(SigningKey::from_bytes(&seed)))
    }

    /// Fresh key that lives only as long as the process.
    pub fn generate() -> Self {
        let mut signer = Self::ed25519(SigningKey::generate(&mut OsRng));
        signer.ephemeral = true;
        signer
    }

    pub fn hmac_dev(secret: impl Into<Vec<u8>>) -> WardenResult<Self> {
        let secret = secret.into();
        if secret.is_empty() {
            return Err(WardenError::validation("hmac secret must not be empty"));
        }
        Ok(Self {
            signer_id: "local-hmac-dev".to_string(),
            key: LocalKey::Hmac(secret),
            ephemeral: false,
        })
    }

    pub fn with_signer_id(mut self, signer_id: impl Into<String>) -> Self {
        self.signer_id = signer_id.into();
        self
    }

    pub fn algorithm(&self) -> SignatureAlgorithm {
        match self.key {
            LocalKey::Ed25519(_) => SignatureAlgorithm::Ed25519,
            LocalKey::Hmac(_) => SignatureAlgorithm::HmacSha256,
        }
    }

    pub fn is_dev_only(&self) -> bool {
        matches!(self.key, LocalKey::Hmac(_))
    }

    pub fn is_ephemeral(&self) -> bool {
        self.ephemeral
    }

    pub fn sign_sync(&self, payload: &[u8]) -> WardenResult<SignatureEnvelope> {
        if payload.is_empty() {
            return Err(WardenError::validation("refusing to sign an empty payload"));
        }
        let signature = match &self.key {
            LocalKey::Ed25519(sk) => sk.sign(payload).to_bytes().to_vec(),
            LocalKey::Hmac(secret) => hmac_sha256(secret, payload).to_vec(),
        };
        Ok(SignatureEnvelope {
            signature,
            signer_id: self.signer_id.clone(),
            fallback: false,
        })
    }

    pub fn key_material(&self) -> KeyMaterial {
        match &self.key {
            LocalKey::Ed25519(sk) => KeyMaterial::Ed25519(sk.verifying_key()),
            LocalKey::Hmac(secret) => KeyMaterial::HmacSha256(secret.clone()),
        }
    }
}

#[async_trait]
impl Signer for LocalSigner {
    async fn sign(&self, payload: &[u8]) -> WardenResult<SignatureEnvelope> {
        self.sign_sync(payload)
    }

    fn signer_id(&self) -> String {
        self.signer_id.clone()
    }

    fn verifying_key(&self) -> Option<KeyMaterial> {
        Some(self.key_material())
    }
}

/// `local-ed25519:<first 8 hex chars of sha256(public key)>`
pub fn default_ed25519_signer_id(public_key: &[u8]) -> String {
    let digest = Sha256::digest(public_key);
    format!("local-ed25519:{}", &hex::encode(digest)[..8])
}

pub(crate) fn hmac_sha256(secret: &[u8], message: &[u8]) -> [u8; 32] {
    const BLOCK_SIZE: usize = 64;
    let mut key_block = [0u8; BLOCK_SIZE];
    if secret.len() > BLOCK_SIZE {
        let digest = Sha256::digest(secret);
        key_block[..digest.len()].copy_from_slice(&digest);
    } else {
        key_block[..secret.len()].copy_from_slice(secret);
    }

    let mut o_key_pad = [0u8; BLOCK_SIZE];
    let mut i_key_pad = [0u8; BLOCK_SIZE];
    for i in 0..BLOCK_SIZE {
        o_key_pad[i] = key_block[i] ^ 0x5c;
        i_key_pad[i] = key_block[i] ^ 0x36;
    }

    let mut inner = Sha256::new();
    inner.update(i_key_pad);
    inner.update(message);
    let inner_hash = inner.finalize();

    let mut outer = Sha256::new();
    outer.update(o_key_pad);
    outer.update(inner_hash);
    outer.finalize().into()
}

pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (&x, &y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
