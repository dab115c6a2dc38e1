use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use warden_core::keys::KeyRegistry;
use warden_core::signer::{GuardedSigner, LocalSigner, RemoteSigner, RemoteSignerConfig, Signer};
use warden_core::WardenError;

use crate::config::{DaemonConfig, SignerMode};

#[derive(Debug, Error)]
pub enum SignerSetupError {
    #[error("failed to read signing key file {path}: {source}")]
    KeyFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    Warden(#[from] WardenError),
}

fn local_signer(cfg: &DaemonConfig) -> Result<LocalSigner, SignerSetupError> {
    let signer = if let Some(secret) = cfg.hmac_dev_secret.as_deref() {
        tracing::warn!("using the HMAC dev signer; signatures are not publicly verifiable");
        LocalSigner::hmac_dev(secret.as_bytes().to_vec())?
    } else if let Some(seed_hex) = cfg.signing_key_hex.as_deref() {
        LocalSigner::ed25519_from_seed_hex(seed_hex)?
    } else if let Some(path) = cfg.signing_key_file.as_ref() {
        let seed_hex = std::fs::read_to_string(path).map_err(|source| SignerSetupError::KeyFile {
            path: path.clone(),
            source,
        })?;
        LocalSigner::ed25519_from_seed_hex(seed_hex.trim())?
    } else {
        tracing::warn!("no signing key configured; generated an ephemeral Ed25519 key");
        LocalSigner::generate()
    };
    Ok(match cfg.signer_id.as_deref() {
        Some(id) => signer.with_signer_id(id),
        None => signer,
    })
}

/// Chooses the signer once for the lifetime of the process.
pub fn build_signer(cfg: &DaemonConfig) -> Result<Arc<dyn Signer>, SignerSetupError> {
    match cfg.signer_mode {
        SignerMode::Local => {
            let signer = local_signer(cfg)?;
            tracing::info!(signer_id = %signer.signer_id(), algorithm = ?signer.algorithm(), "local signer selected");
            Ok(Arc::new(signer))
        }
        SignerMode::Remote => {
            let remote = RemoteSigner::new(RemoteSignerConfig {
                endpoint: cfg.remote_endpoint.clone().unwrap_or_default(),
                key_id: cfg.remote_key_id.clone(),
                bearer_token: cfg.remote_bearer_token.clone(),
                timeout: cfg.remote_timeout(),
                attempts: cfg.remote_attempts,
                backoff: cfg.remote_backoff(),
            })?;
            let primary: Arc<dyn Signer> = Arc::new(remote);
            let guarded = if cfg.fail_closed {
                GuardedSigner::fail_closed(primary)
            } else {
                let fallback = local_signer(cfg)?;
                tracing::warn!(
                    fallback_signer_id = %fallback.signer_id(),
                    "remote signer is permissive; failures fall back to a local key"
                );
                GuardedSigner::permissive(primary, Some(Arc::new(fallback)))
            };
            tracing::info!(fail_closed = cfg.fail_closed, "remote signer selected");
            Ok(Arc::new(guarded))
        }
    }
}

/// Registers every key the signer can produce signatures under. Returns the
/// number of keys added.
pub async fn publish_keys(signer: &dyn Signer, registry: &KeyRegistry) -> usize {
    let keys = signer.published_keys().await;
    let count = keys.len();
    for (signer_id, key) in keys {
        tracing::info!(signer_id = %signer_id, algorithm = ?key.algorithm(), "published signer key");
        registry.register(signer_id, key);
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEED: &str = "9d61b19deffd5a60ba844af492ec2cc44449c5697b326919703bac031cae7f60";

    #[tokio::test]
    async fn local_seed_is_published() {
        let cfg = DaemonConfig {
            signing_key_hex: Some(SEED.to_string()),
            signer_id: Some("release-key".to_string()),
            ..DaemonConfig::default()
        };
        let signer = build_signer(&cfg).unwrap();
        assert_eq!(signer.signer_id(), "release-key");
        let registry = KeyRegistry::new();
        assert_eq!(publish_keys(signer.as_ref(), &registry).await, 1);
        let env = signer.sign(b"payload").await.unwrap();
        registry
            .verify("release-key", b"payload", &env.signature)
            .unwrap();
    }

    #[test]
    fn missing_key_file_is_reported() {
        let cfg = DaemonConfig {
            signing_key_file: Some(PathBuf::from("/nonexistent/warden.key")),
            ..DaemonConfig::default()
        };
        let err = build_signer(&cfg).err().unwrap();
        assert!(matches!(err, SignerSetupError::KeyFile { .. }));
    }

    #[tokio::test]
    async fn permissive_remote_publishes_fallback() {
        let cfg = DaemonConfig {
            signer_mode: SignerMode::Remote,
            remote_endpoint: Some("http://127.0.0.1:9".to_string()),
            remote_attempts: 1,
            remote_timeout_ms: 200,
            fail_closed: false,
            signing_key_hex: Some(SEED.to_string()),
            signer_id: Some("fallback-key".to_string()),
            ..DaemonConfig::default()
        };
        let signer = build_signer(&cfg).unwrap();
        let env = signer.sign(b"x").await.unwrap();
        assert!(env.fallback);
        assert_eq!(env.signer_id, "fallback-key");

        let registry = KeyRegistry::new();
        publish_keys(signer.as_ref(), &registry).await;
        assert!(registry.get("fallback-key").is_some());
    }
}
