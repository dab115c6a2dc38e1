//! Signing capability.
//!
//! The variant is chosen once at startup and handed around as
//! `Arc<dyn Signer>`; call sites never inspect configuration.

mod guarded;
pub mod local;
mod remote;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::WardenResult;
use crate::keys::KeyMaterial;

pub use guarded::GuardedSigner;
pub use local::LocalSigner;
pub use remote::{RemoteSigner, RemoteSignerConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureAlgorithm {
    Ed25519,
    HmacSha256,
}

/// A signature plus the identity that produced it. Never carries key material.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureEnvelope {
    pub signature: Vec<u8>,
    pub signer_id: String,
    /// Produced by the permissive-mode local fallback instead of the primary signer.
    pub fallback: bool,
}

impl SignatureEnvelope {
    pub fn signature_b64(&self) -> String {
        B64.encode(&self.signature)
    }
}

#[async_trait]
pub trait Signer: Send + Sync {
    async fn sign(&self, payload: &[u8]) -> WardenResult<SignatureEnvelope>;

    /// Configured id for local keys; last id reported by a successful remote sign.
    fn signer_id(&self) -> String;

    /// Verification material for this signer when it is known locally.
    fn verifying_key(&self) -> Option<KeyMaterial>;

    /// Readiness probe.
    async fn health(&self) -> WardenResult<()> {
        Ok(())
    }

    /// Every (signer id, key) pair this signer may produce signatures under.
    async fn published_keys(&self) -> Vec<(String, KeyMaterial)> {
        self.verifying_key()
            .map(|key| vec![(self.signer_id(), key)])
            .unwrap_or_default()
    }
}
