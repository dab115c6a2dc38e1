use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use super::AuditEvent;
use crate::error::{WardenError, WardenResult};
use crate::keys::KeyRegistry;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainVerification {
    pub chain_id: String,
    pub events_verified: usize,
    pub head_hash: Option<String>,
    /// The first event was not sequence 1; its `prevHash` was taken as the anchor.
    pub truncated_prefix: bool,
}

/// Re-derives every hash, link and signature of an ordered chain.
///
/// Any failure is reported as `TamperDetected` with the failing index. Nothing
/// is repaired.
pub fn verify_chain(events: &[AuditEvent], registry: &KeyRegistry) -> WardenResult<ChainVerification> {
    let Some(first) = events.first() else {
        return Ok(ChainVerification {
            chain_id: String::new(),
            events_verified: 0,
            head_hash: None,
            truncated_prefix: false,
        });
    };
    let chain_id = first.chain_id.clone();
    let mut truncated_prefix = false;

    for (index, event) in events.iter().enumerate() {
        let fail = |reason: String| {
            tracing::error!(index, event_id = %event.id, chain_id = %chain_id, reason = %reason, "audit chain tamper detected");
            WardenError::tamper(index, event.id.clone(), reason)
        };

        if event.sampled || event.sequence == 0 {
            return Err(fail("sampled event in persisted chain".to_string()));
        }
        if event.chain_id != chain_id {
            return Err(fail(format!(
                "chain id {} differs from {}",
                event.chain_id, chain_id
            )));
        }

        match index.checked_sub(1).map(|i| &events[i]) {
            None if event.sequence == 1 => {
                if event.prev_hash.is_some() {
                    return Err(fail("genesis event has a prevHash".to_string()));
                }
            }
            None => {
                if event.prev_hash.is_none() {
                    return Err(fail("truncated chain has no anchor prevHash".to_string()));
                }
                truncated_prefix = true;
            }
            Some(prev) => {
                if event.sequence != prev.sequence + 1 {
                    return Err(fail(format!(
                        "sequence {} does not follow {}",
                        event.sequence, prev.sequence
                    )));
                }
                if event.prev_hash.as_deref() != Some(prev.hash.as_str()) {
                    return Err(fail("prevHash does not match previous event hash".to_string()));
                }
            }
        }

        let recomputed = event.recompute_hash();
        if hex::encode(recomputed) != event.hash {
            return Err(fail("hash does not match event contents".to_string()));
        }

        let signature = B64
            .decode(event.signature.as_bytes())
            .map_err(|_| fail("signature is not base64".to_string()))?;
        registry
            .verify(&event.signer_id, &recomputed, &signature)
            .map_err(|e| fail(format!("signature check failed: {e}")))?;
    }

    Ok(ChainVerification {
        chain_id,
        events_verified: events.len(),
        head_hash: events.last().map(|e| e.hash.clone()),
        truncated_prefix,
    })
}
