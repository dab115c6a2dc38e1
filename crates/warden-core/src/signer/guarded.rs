use std::sync::Arc;

use async_trait::async_trait;

use super::{LocalSigner, SignatureEnvelope, Signer};
use crate::error::{WardenError, WardenResult};
use crate::keys::KeyMaterial;

/// Applies the fail-closed policy around a primary (remote) signer.
///
/// Fail-closed: every primary failure becomes `SignerUnavailable`.
/// Permissive: primary failures are logged at warn level and the local fallback
/// signs instead, with `fallback = true` on the envelope. Permissive without a
/// fallback still fails.
pub struct GuardedSigner {
    primary: Arc<dyn Signer>,
    fallback: Option<Arc<LocalSigner>>,
    fail_closed: bool,
}

impl GuardedSigner {
    pub fn fail_closed(primary: Arc<dyn Signer>) -> Self {
        Self {
            primary,
            fallback: None,
            fail_closed: true,
        }
    }

    pub fn permissive(primary: Arc<dyn Signer>, fallback: Option<Arc<LocalSigner>>) -> Self {
        Self {
            primary,
            fallback,
            fail_closed: false,
        }
    }

    pub fn is_fail_closed(&self) -> bool {
        self.fail_closed
    }
}

#[async_trait]
impl Signer for GuardedSigner {
    async fn sign(&self, payload: &[u8]) -> WardenResult<SignatureEnvelope> {
        let err = match self.primary.sign(payload).await {
            Ok(envelope) => return Ok(envelope),
            Err(err @ (WardenError::SignerUnavailable(_) | WardenError::SignerRejected(_))) => err,
            Err(other) => return Err(other),
        };
        if self.fail_closed {
            tracing::error!(error = %err, signer_id = %self.primary.signer_id(), "signer unavailable; failing closed");
            return Err(match err {
                WardenError::SignerRejected(detail) => {
                    WardenError::SignerUnavailable(format!("rejected: {detail}"))
                }
                other => other,
            });
        }
        let Some(fallback) = self.fallback.as_ref() else {
            tracing::error!(error = %err, "signer unavailable and no fallback configured");
            return Err(WardenError::SignerUnavailable(err.to_string()));
        };
        tracing::warn!(
            error = %err,
            fallback_signer_id = %fallback.signer_id(),
            "remote signer failed; signing with local fallback"
        );
        let mut envelope = fallback.sign_sync(payload)?;
        envelope.fallback = true;
        Ok(envelope)
    }

    fn signer_id(&self) -> String {
        self.primary.signer_id()
    }

    fn verifying_key(&self) -> Option<KeyMaterial> {
        self.primary.verifying_key()
    }

    async fn health(&self) -> WardenResult<()> {
        self.primary.health().await
    }

    async fn published_keys(&self) -> Vec<(String, KeyMaterial)> {
        let mut keys = self.primary.published_keys().await;
        if let Some(fallback) = self.fallback.as_ref() {
            keys.push((fallback.signer_id(), fallback.key_material()));
        }
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct DownSigner;

    #[async_trait]
    impl Signer for DownSigner {
        async fn sign(&self, _payload: &[u8]) -> WardenResult<SignatureEnvelope> {
            Err(WardenError::SignerUnavailable("connection refused".into()))
        }
        fn signer_id(&self) -> String {
            "kms-down".into()
        }
        fn verifying_key(&self) -> Option<KeyMaterial> {
            None
        }
    }

    #[tokio::test]
    async fn fail_closed_surfaces_signer_unavailable() {
        let signer = GuardedSigner::fail_closed(Arc::new(DownSigner));
        let err = signer.sign(b"x").await.unwrap_err();
        assert_eq!(err.code(), "SIGNER_UNAVAILABLE");
    }

    #[tokio::test]
    async fn permissive_signs_with_fallback_and_marks_it() {
        let fallback = Arc::new(LocalSigner::generate().with_signer_id("fallback-1"));
        let signer = GuardedSigner::permissive(Arc::new(DownSigner), Some(fallback.clone()));
        let env = signer.sign(b"x").await.unwrap();
        assert!(env.fallback);
        assert_eq!(env.signer_id, "fallback-1");
        fallback.key_material().verify(b"x", &env.signature).unwrap();
        assert_eq!(signer.published_keys().await.len(), 1);
    }

    #[tokio::test]
    async fn permissive_without_fallback_still_fails() {
        let signer = GuardedSigner::permissive(Arc::new(DownSigner), None);
        assert!(signer.sign(b"x").await.is_err());
    }
}
