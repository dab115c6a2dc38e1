use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use ed25519_dalek::VerifyingKey;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::{SignatureEnvelope, Signer};
use crate::error::{WardenError, WardenResult};
use crate::keys::KeyMaterial;

#[derive(Clone)]
pub struct RemoteSignerConfig {
    /// Base URL; `/sign`, `/health` and `/publicKey` are appended.
    pub endpoint: String,
    pub key_id: Option<String>,
    pub bearer_token: Option<String>,
    /// Per-attempt timeout.
    pub timeout: Duration,
    pub attempts: u32,
    /// Attempt `n` failing waits `backoff * n` before the next one.
    pub backoff: Duration,
}

impl Default for RemoteSignerConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            key_id: None,
            bearer_token: None,
            timeout: Duration::from_secs(2),
            attempts: 3,
            backoff: Duration::from_millis(100),
        }
    }
}

impl std::fmt::Debug for RemoteSignerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteSignerConfig")
            .field("endpoint", &self.endpoint)
            .field("key_id", &self.key_id)
            .field("bearer_token", &self.bearer_token.as_ref().map(|_| "<redacted>"))
            .field("timeout", &self.timeout)
            .field("attempts", &self.attempts)
            .field("backoff", &self.backoff)
            .finish()
    }
}

#[derive(Debug, Serialize)]
struct SignRequest<'a> {
    payload_b64: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    key_id: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct SignResponse {
    #[serde(alias = "signatureBase64", alias = "signature")]
    signature_b64: String,
    #[serde(default, alias = "signerId")]
    signer_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PublicKeyRequest<'a> {
    signer_id: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublicKeyResponse {
    public_key: String,
}

enum AttemptError {
    Transient(String),
    Rejected(String),
}

/// Signer backed by a KMS-style HTTP endpoint.
#[derive(Debug)]
pub struct RemoteSigner {
    client: reqwest::Client,
    cfg: RemoteSignerConfig,
    last_signer_id: RwLock<String>,
}

impl RemoteSigner {
    pub fn new(cfg: RemoteSignerConfig) -> WardenResult<Self> {
        let endpoint = cfg.endpoint.trim().trim_end_matches('/').to_string();
        if endpoint.is_empty() {
            return Err(WardenError::validation("remote signer endpoint is required"));
        }
        let client = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .build()
            .map_err(|e| WardenError::Internal(format!("build http client: {e}")))?;
        let initial_id = cfg
            .key_id
            .clone()
            .unwrap_or_else(|| format!("remote:{endpoint}"));
        Ok(Self {
            client,
            cfg: RemoteSignerConfig {
                endpoint,
                attempts: cfg.attempts.max(1),
                ..cfg
            },
            last_signer_id: RwLock::new(initial_id),
        })
    }

    pub fn config(&self) -> &RemoteSignerConfig {
        &self.cfg
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.cfg.bearer_token.as_deref() {
            Some(token) if !token.is_empty() => req.bearer_auth(token),
            _ => req,
        }
    }

    async fn attempt(&self, payload: &[u8]) -> Result<SignatureEnvelope, AttemptError> {
        let body = SignRequest {
            payload_b64: B64.encode(payload),
            key_id: self.cfg.key_id.as_deref(),
        };
        let resp = self
            .authorize(self.client.post(format!("{}/sign", self.cfg.endpoint)))
            .json(&body)
            .send()
            .await
            .map_err(|e| AttemptError::Transient(format!("request failed: {e}")))?;

        let status = resp.status();
        if status.is_server_error() {
            return Err(AttemptError::Transient(format!("server error {status}")));
        }
        if !status.is_success() {
            return Err(AttemptError::Rejected(format!("status {status}")));
        }

        let decoded: SignResponse = resp
            .json()
            .await
            .map_err(|e| AttemptError::Transient(format!("undecodable response: {e}")))?;
        let signature = B64
            .decode(decoded.signature_b64.as_bytes())
            .map_err(|_| AttemptError::Transient("signature is not base64".to_string()))?;
        if signature.is_empty() {
            return Err(AttemptError::Transient("empty signature".to_string()));
        }
        let signer_id = if decoded.signer_id.is_empty() {
            self.last_signer_id.read().clone()
        } else {
            decoded.signer_id
        };
        Ok(SignatureEnvelope {
            signature,
            signer_id,
            fallback: false,
        })
    }

    /// Asks the endpoint for the Ed25519 public key behind the current signer id.
    pub async fn fetch_verifying_key(&self) -> WardenResult<VerifyingKey> {
        let signer_id = self.signer_id();
        let resp = self
            .authorize(self.client.post(format!("{}/publicKey", self.cfg.endpoint)))
            .json(&PublicKeyRequest {
                signer_id: &signer_id,
            })
            .send()
            .await
            .map_err(|e| WardenError::SignerUnavailable(format!("public key request: {e}")))?;
        if !resp.status().is_success() {
            return Err(WardenError::SignerRejected(format!(
                "public key request returned {}",
                resp.status()
            )));
        }
        let decoded: PublicKeyResponse = resp
            .json()
            .await
            .map_err(|e| WardenError::SignerUnavailable(format!("public key response: {e}")))?;
        let raw = B64
            .decode(decoded.public_key.as_bytes())
            .map_err(|_| WardenError::validation("public key is not base64"))?;
        let arr: [u8; 32] = raw
            .try_into()
            .map_err(|_| WardenError::validation("public key must be 32 bytes"))?;
        VerifyingKey::from_bytes(&arr).map_err(|_| WardenError::validation("invalid public key"))
    }
}

#[async_trait]
impl Signer for RemoteSigner {
    async fn sign(&self, payload: &[u8]) -> WardenResult<SignatureEnvelope> {
        if payload.is_empty() {
            return Err(WardenError::validation("refusing to sign an empty payload"));
        }
        let attempts = self.cfg.attempts;
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            match self.attempt(payload).await {
                Ok(envelope) => {
                    *self.last_signer_id.write() = envelope.signer_id.clone();
                    return Ok(envelope);
                }
                Err(AttemptError::Rejected(detail)) => {
                    tracing::warn!(attempt, detail = %detail, "remote signer rejected request");
                    return Err(WardenError::SignerRejected(detail));
                }
                Err(AttemptError::Transient(detail)) => {
                    tracing::warn!(attempt, attempts, detail = %detail, "remote signer attempt failed");
                    last_error = detail;
                    if attempt < attempts {
                        tokio::time::sleep(self.cfg.backoff * attempt).await;
                    }
                }
            }
        }
        Err(WardenError::SignerUnavailable(format!(
            "{attempts} attempt(s) failed; last error: {last_error}"
        )))
    }

    fn signer_id(&self) -> String {
        self.last_signer_id.read().clone()
    }

    fn verifying_key(&self) -> Option<KeyMaterial> {
        None
    }

    async fn health(&self) -> WardenResult<()> {
        let resp = self
            .authorize(self.client.get(format!("{}/health", self.cfg.endpoint)))
            .send()
            .await
            .map_err(|e| WardenError::SignerUnavailable(format!("health probe: {e}")))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(WardenError::SignerUnavailable(format!(
                "health probe returned {}",
                resp.status()
            )))
        }
    }

    async fn published_keys(&self) -> Vec<(String, KeyMaterial)> {
        match self.fetch_verifying_key().await {
            Ok(key) => vec![(self.signer_id(), KeyMaterial::Ed25519(key))],
            Err(err) => {
                tracing::warn!(error = %err, "remote signer public key unavailable");
                Vec::new()
            }
        }
    }
}
