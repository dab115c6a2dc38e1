//! Signed, hash-chained audit log.
//!
//! Each kept event stores `hash = sha256(canonical {actorId, eventType,
//! payload, prevHash})` and a signature over the raw 32 hash bytes. Appends to
//! one chain are serialized in process; the repository additionally enforces
//! unique hashes and unique `(chainId, sequence)` pairs.

pub mod policy;
pub mod verify;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::canonical::{canonicalize, sha256};
use crate::clock::Clock;
use crate::error::{WardenError, WardenResult};
use crate::locks::KeyedLocks;
use crate::principal::Principal;
use crate::signer::Signer;
use crate::store::AuditRepository;

pub use policy::{AuditPolicy, AuditPolicyFile, PolicyDecision, Sampler, SamplingRule};
pub use verify::{verify_chain, ChainVerification};

pub const COMPLIANCE_CHAIN: &str = "compliance";
pub const EVENT_PURGED: &str = "audit.event_purged";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub id: String,
    pub chain_id: String,
    /// 1-based position in the chain; 0 for sampled-and-dropped events.
    pub sequence: u64,
    pub event_type: String,
    pub actor_id: String,
    pub payload: Value,
    /// Hex sha256; empty for sampled-and-dropped events.
    pub hash: String,
    pub prev_hash: Option<String>,
    /// Base64 signature over the raw hash bytes.
    pub signature: String,
    pub signer_id: String,
    #[serde(default)]
    pub signer_fallback: bool,
    #[serde(default)]
    pub sampled: bool,
    pub retention_expires_at: Option<u64>,
    pub created_at: u64,
}

impl AuditEvent {
    pub fn compute_hash(
        actor_id: &str,
        event_type: &str,
        payload: &Value,
        prev_hash: Option<&str>,
    ) -> [u8; 32] {
        let preimage = json!({
            "actorId": actor_id,
            "eventType": event_type,
            "payload": payload,
            "prevHash": prev_hash,
        });
        sha256(&canonicalize(&preimage))
    }

    pub fn recompute_hash(&self) -> [u8; 32] {
        Self::compute_hash(
            &self.actor_id,
            &self.event_type,
            &self.payload,
            self.prev_hash.as_deref(),
        )
    }

    pub fn is_persisted(&self) -> bool {
        !self.sampled
    }
}

/// Last appended position of a chain. Survives GC of the events themselves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainHead {
    pub sequence: u64,
    pub hash: String,
}

#[derive(Debug, Clone)]
pub struct AppendRequest {
    pub chain_id: String,
    pub event_type: String,
    pub actor_id: String,
    pub payload: Value,
}

impl AppendRequest {
    pub fn new(
        chain_id: impl Into<String>,
        event_type: impl Into<String>,
        actor_id: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            chain_id: chain_id.into(),
            event_type: event_type.into(),
            actor_id: actor_id.into(),
            payload,
        }
    }
}

pub struct AuditLedger {
    repo: Arc<dyn AuditRepository>,
    signer: Arc<dyn Signer>,
    policy: AuditPolicy,
    sampler: Arc<dyn Sampler>,
    clock: Arc<dyn Clock>,
    chain_locks: KeyedLocks,
}

impl AuditLedger {
    pub fn new(
        repo: Arc<dyn AuditRepository>,
        signer: Arc<dyn Signer>,
        policy: AuditPolicy,
        sampler: Arc<dyn Sampler>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            repo,
            signer,
            policy,
            sampler,
            clock,
            chain_locks: KeyedLocks::new(),
        }
    }

    pub fn policy(&self) -> &AuditPolicy {
        &self.policy
    }

    pub fn signer(&self) -> &Arc<dyn Signer> {
        &self.signer
    }

    pub async fn append(
        &self,
        request: AppendRequest,
        principal: &Principal,
    ) -> WardenResult<AuditEvent> {
        let AppendRequest {
            chain_id,
            event_type,
            actor_id,
            payload,
        } = request;
        validate_label(&chain_id, "chainId")?;
        validate_label(&event_type, "eventType")?;
        if actor_id.trim().is_empty() {
            return Err(WardenError::validation("actorId is required"));
        }

        let decision = self
            .policy
            .decide(&event_type, principal, self.sampler.as_ref());
        if !decision.keep {
            tracing::debug!(
                chain_id = %chain_id,
                event_type = %event_type,
                rate = decision.rate,
                "audit event sampled out"
            );
            return Ok(AuditEvent {
                id: new_event_id(),
                chain_id,
                sequence: 0,
                event_type,
                actor_id,
                payload,
                hash: String::new(),
                prev_hash: None,
                signature: String::new(),
                signer_id: String::new(),
                signer_fallback: false,
                sampled: true,
                retention_expires_at: None,
                created_at: self.clock.now_ms(),
            });
        }

        let _chain_guard = self.chain_locks.lock(&chain_id).await;
        let head = self.repo.chain_head(&chain_id).await?;
        let (sequence, prev_hash) = match head {
            Some(h) => (h.sequence + 1, Some(h.hash)),
            None => (1, None),
        };
        let hash = AuditEvent::compute_hash(&actor_id, &event_type, &payload, prev_hash.as_deref());
        let envelope = self.signer.sign(&hash).await?;

        let now = self.clock.now_ms();
        let retention_expires_at = self
            .policy
            .retention_ms(&event_type)
            .map(|r| now.saturating_add(r));
        let event = AuditEvent {
            id: new_event_id(),
            chain_id,
            sequence,
            event_type,
            actor_id,
            payload,
            hash: hex::encode(hash),
            prev_hash,
            signature: envelope.signature_b64(),
            signer_id: envelope.signer_id,
            signer_fallback: envelope.fallback,
            sampled: false,
            retention_expires_at,
            created_at: now,
        };
        self.repo.insert_event(&event).await?;
        tracing::info!(
            event_id = %event.id,
            chain_id = %event.chain_id,
            sequence = event.sequence,
            event_type = %event.event_type,
            signer_id = %event.signer_id,
            signer_fallback = event.signer_fallback,
            "audit event appended"
        );
        Ok(event)
    }

    pub async fn get(&self, id: &str) -> WardenResult<AuditEvent> {
        self.repo
            .get_event(id)
            .await?
            .ok_or_else(|| WardenError::NotFound(format!("audit event {id}")))
    }

    /// Persisted events of a chain in sequence order.
    pub async fn chain(&self, chain_id: &str) -> WardenResult<Vec<AuditEvent>> {
        self.repo.chain_events(chain_id).await
    }

    pub async fn verify(
        &self,
        chain_id: &str,
        registry: &crate::keys::KeyRegistry,
    ) -> WardenResult<ChainVerification> {
        let events = self.chain(chain_id).await?;
        verify_chain(&events, registry)
    }

    /// Deletes expired, non-critical events in batches of `batch_size`.
    ///
    /// Only the leading run of each chain is removed, so surviving events
    /// always form a verifiable suffix.
    pub async fn collect_garbage(&self, now_ms: u64, batch_size: usize) -> WardenResult<usize> {
        let batch_size = batch_size.max(1);
        let protected = self.policy.critical_event_types();
        let mut total = 0;
        loop {
            let deleted = self
                .repo
                .delete_expired_events(now_ms, &protected, batch_size)
                .await?;
            total += deleted;
            if deleted < batch_size {
                break;
            }
        }
        if total > 0 {
            tracing::info!(deleted = total, "audit retention gc removed events");
        }
        Ok(total)
    }

    /// Explicit removal of any event, critical ones included. The purge itself
    /// is recorded on the compliance chain before the target is deleted.
    pub async fn purge_event(
        &self,
        id: &str,
        principal: &Principal,
        reason: &str,
    ) -> WardenResult<AuditEvent> {
        if reason.trim().is_empty() {
            return Err(WardenError::validation("purge reason is required"));
        }
        let target = self.get(id).await?;
        let record = self
            .append(
                AppendRequest::new(
                    COMPLIANCE_CHAIN,
                    EVENT_PURGED,
                    principal.id.clone(),
                    json!({
                        "eventId": target.id,
                        "chainId": target.chain_id,
                        "sequence": target.sequence,
                        "eventType": target.event_type,
                        "hash": target.hash,
                        "reason": reason,
                    }),
                ),
                principal,
            )
            .await?;
        self.repo.delete_event(&target.id).await?;
        tracing::warn!(
            event_id = %target.id,
            chain_id = %target.chain_id,
            purged_by = %principal.id,
            "audit event purged"
        );
        Ok(record)
    }
}

fn validate_label(value: &str, field: &str) -> WardenResult<()> {
    if value.is_empty() || value.len() > 128 {
        return Err(WardenError::validation(format!(
            "{field} must be 1..=128 characters"
        )));
    }
    if !value.bytes().all(|b| (0x21..=0x7e).contains(&b)) {
        return Err(WardenError::validation(format!(
            "{field} must be printable ascii without spaces"
        )));
    }
    Ok(())
}

pub(crate) fn new_event_id() -> String {
    format!("evt_{}", hex::encode(rand::random::<[u8; 16]>()))
}
