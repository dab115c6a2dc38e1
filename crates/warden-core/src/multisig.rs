//! N-of-M approval gate in front of privileged "apply" actions.
//!
//! ```text
//! draft -> awaiting_multisig -> multisig_partial -> multisig_complete -> applied
//!                 \__________________\___________________\______-> rejected
//! ```
//!
//! Mutations of one request are serialized; different requests never contend.
//! Every transition is written to the request's audit chain before the new
//! state is persisted, so a failed signature or audit append leaves the request
//! untouched.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::audit::{AppendRequest, AuditLedger};
use crate::canonical::{canonicalize, sha256_hex};
use crate::clock::Clock;
use crate::error::{WardenError, WardenResult};
use crate::locks::KeyedLocks;
use crate::principal::Principal;
use crate::signer::Signer;
use crate::store::ApprovalRepository;

pub const EVENT_SUBMITTED: &str = "multisig.submitted";
pub const EVENT_REQUESTED: &str = "multisig.requested";
pub const EVENT_APPROVAL: &str = "multisig.approval";
pub const EVENT_REJECTION: &str = "multisig.rejection";
pub const EVENT_APPLIED: &str = "multisig.applied";
pub const EVENT_BREAKGLASS_APPLIED: &str = "multisig.breakglass_applied";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Draft,
    AwaitingMultisig,
    MultisigPartial,
    MultisigComplete,
    Applied,
    Rejected,
}

impl ApprovalStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::AwaitingMultisig => "awaiting_multisig",
            Self::MultisigPartial => "multisig_partial",
            Self::MultisigComplete => "multisig_complete",
            Self::Applied => "applied",
            Self::Rejected => "rejected",
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Applied | Self::Rejected)
    }

    pub const fn is_collecting(self) -> bool {
        matches!(
            self,
            Self::AwaitingMultisig | Self::MultisigPartial | Self::MultisigComplete
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approved,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Approval {
    pub approver_id: String,
    pub decision: Decision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub ts: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppliedRecord {
    pub signature: String,
    pub signer_id: String,
    #[serde(default)]
    pub signer_fallback: bool,
    pub audit_event_id: String,
    pub breakglass: bool,
    pub applied_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub applied_at: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequest {
    pub id: String,
    pub subject: String,
    pub payload: Value,
    pub payload_hash: String,
    pub approvals_required: u32,
    /// Allow-list; empty means any approver.
    #[serde(default)]
    pub approvers: BTreeSet<String>,
    #[serde(default)]
    pub approvals: Vec<Approval>,
    /// Approvals before this index were recorded while in draft and are not counted.
    #[serde(default)]
    pub counted_from: usize,
    pub status: ApprovalStatus,
    pub chain_id: String,
    pub created_by: String,
    pub created_at: u64,
    pub updated_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied: Option<AppliedRecord>,
}

impl ApprovalRequest {
    fn counted(&self) -> &[Approval] {
        self.approvals.get(self.counted_from..).unwrap_or(&[])
    }

    /// Distinct approvers with an `approved` decision in the counted window.
    pub fn unique_approvers(&self) -> BTreeSet<&str> {
        unique_approvers(self.counted())
    }
}

fn unique_approvers(approvals: &[Approval]) -> BTreeSet<&str> {
    approvals
        .iter()
        .filter(|a| a.decision == Decision::Approved)
        .map(|a| a.approver_id.as_str())
        .collect()
}

/// Status as a pure function of the counted approvals and the threshold.
pub fn derive_status(current: ApprovalStatus, approvals: &[Approval], required: u32) -> ApprovalStatus {
    if !current.is_collecting() {
        return current;
    }
    if approvals.iter().any(|a| a.decision == Decision::Rejected) {
        return ApprovalStatus::Rejected;
    }
    let approved = unique_approvers(approvals).len() as u64;
    if approved == 0 {
        ApprovalStatus::AwaitingMultisig
    } else if approved < u64::from(required) {
        ApprovalStatus::MultisigPartial
    } else {
        ApprovalStatus::MultisigComplete
    }
}

#[derive(Debug, Clone)]
pub struct NewApprovalRequest {
    pub subject: String,
    pub payload: Value,
    pub chain_id: Option<String>,
}

pub const DEFAULT_BREAKGLASS_ROLE: &str = "breakglass";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultisigConfig {
    /// Unique approvals a break-glass apply still needs.
    pub breakglass_min_approvals: u32,
    /// Role a principal must hold to break glass.
    pub breakglass_role: String,
}

impl Default for MultisigConfig {
    fn default() -> Self {
        Self {
            breakglass_min_approvals: 1,
            breakglass_role: DEFAULT_BREAKGLASS_ROLE.to_string(),
        }
    }
}

pub struct MultisigGate {
    repo: Arc<dyn ApprovalRepository>,
    ledger: Arc<AuditLedger>,
    signer: Arc<dyn Signer>,
    clock: Arc<dyn Clock>,
    cfg: MultisigConfig,
    locks: KeyedLocks,
}

impl MultisigGate {
    pub fn new(
        repo: Arc<dyn ApprovalRepository>,
        ledger: Arc<AuditLedger>,
        signer: Arc<dyn Signer>,
        clock: Arc<dyn Clock>,
        cfg: MultisigConfig,
    ) -> Self {
        Self {
            repo,
            ledger,
            signer,
            clock,
            cfg,
            locks: KeyedLocks::new(),
        }
    }

    pub async fn get(&self, id: &str) -> WardenResult<ApprovalRequest> {
        self.repo
            .get_request(id)
            .await?
            .ok_or_else(|| WardenError::NotFound(format!("approval request {id}")))
    }

    /// Submit-for-signing: records the payload and its hash as a draft.
    pub async fn create(
        &self,
        new: NewApprovalRequest,
        principal: &Principal,
    ) -> WardenResult<ApprovalRequest> {
        if new.subject.trim().is_empty() {
            return Err(WardenError::validation("subject is required"));
        }
        let now = self.clock.now_ms();
        let id = format!("apr_{}", hex::encode(rand::random::<[u8; 12]>()));
        let request = ApprovalRequest {
            chain_id: new.chain_id.unwrap_or_else(|| format!("approval:{id}")),
            payload_hash: sha256_hex(&canonicalize(&new.payload)),
            id,
            subject: new.subject,
            payload: new.payload,
            approvals_required: 1,
            approvers: BTreeSet::new(),
            approvals: Vec::new(),
            counted_from: 0,
            status: ApprovalStatus::Draft,
            created_by: principal.id.clone(),
            created_at: now,
            updated_at: now,
            applied: None,
        };
        self.audit(
            &request,
            EVENT_SUBMITTED,
            principal,
            json!({
                "requestId": request.id,
                "subject": request.subject,
                "payloadHash": request.payload_hash,
                "status": request.status,
            }),
        )
        .await?;
        self.repo.insert_request(&request).await?;
        tracing::info!(request_id = %request.id, subject = %request.subject, "approval request created");
        Ok(request)
    }

    pub async fn request_multisig(
        &self,
        id: &str,
        approvals_required: u32,
        approvers: Option<Vec<String>>,
        principal: &Principal,
    ) -> WardenResult<ApprovalRequest> {
        if approvals_required < 1 {
            return Err(WardenError::validation("approvalsRequired must be >= 1"));
        }
        let approvers: BTreeSet<String> = approvers.unwrap_or_default().into_iter().collect();
        if approvers.iter().any(|a| a.trim().is_empty()) {
            return Err(WardenError::validation("approver ids must not be empty"));
        }
        if !approvers.is_empty() && approvers.len() < approvals_required as usize {
            return Err(WardenError::validation(format!(
                "approvalsRequired {approvals_required} exceeds {} allowed approvers",
                approvers.len()
            )));
        }

        let _guard = self.locks.lock(id).await;
        let mut request = self.get(id).await?;
        if request.status != ApprovalStatus::Draft {
            return Err(WardenError::precondition(
                request.status.as_str(),
                "multisig can only be requested for a draft",
            ));
        }
        request.approvals_required = approvals_required;
        request.approvers = approvers;
        request.counted_from = request.approvals.len();
        request.status = ApprovalStatus::AwaitingMultisig;
        request.updated_at = self.clock.now_ms();

        self.audit(
            &request,
            EVENT_REQUESTED,
            principal,
            json!({
                "requestId": request.id,
                "approvalsRequired": request.approvals_required,
                "approvers": request.approvers,
                "status": request.status,
            }),
        )
        .await?;
        self.repo.save_request(&request).await?;
        tracing::info!(
            request_id = %request.id,
            approvals_required,
            "multisig requested"
        );
        Ok(request)
    }

    pub async fn record_approval(
        &self,
        id: &str,
        approver_id: &str,
        decision: Decision,
        note: Option<String>,
        principal: &Principal,
    ) -> WardenResult<ApprovalRequest> {
        if approver_id.trim().is_empty() {
            return Err(WardenError::validation("approverId is required"));
        }
        if approver_id != principal.id {
            return Err(WardenError::Forbidden(format!(
                "{} cannot record an approval as {approver_id}",
                principal.id
            )));
        }

        let _guard = self.locks.lock(id).await;
        let mut request = self.get(id).await?;
        if request.status.is_terminal() {
            return Err(WardenError::precondition(
                request.status.as_str(),
                "request is closed to approvals",
            ));
        }
        if !request.approvers.is_empty() && !request.approvers.contains(approver_id) {
            return Err(WardenError::Forbidden(format!(
                "{approver_id} is not an allowed approver"
            )));
        }

        let already_approved = request
            .counted()
            .iter()
            .any(|a| a.approver_id == approver_id && a.decision == Decision::Approved);
        if decision == Decision::Approved && already_approved && request.status.is_collecting() {
            tracing::info!(request_id = %id, approver_id, "duplicate approval ignored");
            return Ok(request);
        }

        let previous = request.status;
        let now = self.clock.now_ms();
        request.approvals.push(Approval {
            approver_id: approver_id.to_string(),
            decision,
            note: note.clone(),
            ts: now,
        });
        request.status = derive_status(request.status, request.counted(), request.approvals_required);
        request.updated_at = now;

        let event_type = match decision {
            Decision::Approved => EVENT_APPROVAL,
            Decision::Rejected => EVENT_REJECTION,
        };
        self.audit(
            &request,
            event_type,
            principal,
            json!({
                "requestId": request.id,
                "approverId": approver_id,
                "decision": decision,
                "note": note,
                "approvalsCounted": request.unique_approvers().len(),
                "approvalsRequired": request.approvals_required,
                "from": previous,
                "status": request.status,
            }),
        )
        .await?;
        self.repo.save_request(&request).await?;
        tracing::info!(
            request_id = %request.id,
            approver_id,
            decision = ?decision,
            from = previous.as_str(),
            to = request.status.as_str(),
            "approval recorded"
        );
        Ok(request)
    }

    pub async fn apply(&self, id: &str, principal: &Principal) -> WardenResult<ApprovalRequest> {
        let _guard = self.locks.lock(id).await;
        let mut request = self.get(id).await?;
        if request.status != ApprovalStatus::MultisigComplete {
            return Err(WardenError::precondition(
                request.status.as_str(),
                "apply requires multisig_complete",
            ));
        }
        self.finish(&mut request, principal, None).await?;
        Ok(request)
    }

    /// Emergency apply below the normal threshold. Still signed, still audited,
    /// and tagged `breakglass` everywhere.
    pub async fn breakglass_apply(
        &self,
        id: &str,
        principal: &Principal,
        reason: &str,
    ) -> WardenResult<ApprovalRequest> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(WardenError::validation("break-glass reason is required"));
        }
        if !principal.has_role(&self.cfg.breakglass_role) {
            return Err(WardenError::Forbidden(format!(
                "break-glass requires role {}",
                self.cfg.breakglass_role
            )));
        }
        let _guard = self.locks.lock(id).await;
        let mut request = self.get(id).await?;
        if !request.status.is_collecting() {
            return Err(WardenError::precondition(
                request.status.as_str(),
                "break-glass requires an open multisig request",
            ));
        }
        let have = request.unique_approvers().len();
        let need = self.cfg.breakglass_min_approvals as usize;
        if have < need {
            return Err(WardenError::precondition(
                request.status.as_str(),
                format!("break-glass needs {need} approval(s), have {have}"),
            ));
        }
        tracing::warn!(
            request_id = %id,
            actor = %principal.id,
            approvals = have,
            required = request.approvals_required,
            reason,
            "break-glass apply"
        );
        self.finish(&mut request, principal, Some(reason)).await?;
        Ok(request)
    }

    async fn finish(
        &self,
        request: &mut ApprovalRequest,
        principal: &Principal,
        breakglass_reason: Option<&str>,
    ) -> WardenResult<()> {
        let canonical = canonicalize(&request.payload);
        if sha256_hex(&canonical) != request.payload_hash {
            return Err(WardenError::tamper(
                0,
                request.id.clone(),
                "stored payload no longer matches payloadHash",
            ));
        }
        let envelope = self.signer.sign(&canonical).await?;
        let breakglass = breakglass_reason.is_some();
        let event_type = if breakglass {
            EVENT_BREAKGLASS_APPLIED
        } else {
            EVENT_APPLIED
        };
        let approvers: Vec<&str> = request.unique_approvers().into_iter().collect();
        let event = self
            .audit(
                request,
                event_type,
                principal,
                json!({
                    "requestId": request.id,
                    "subject": request.subject,
                    "payloadHash": request.payload_hash,
                    "signature": envelope.signature_b64(),
                    "signerId": envelope.signer_id,
                    "signerFallback": envelope.fallback,
                    "approvers": approvers,
                    "approvalsRequired": request.approvals_required,
                    "breakglass": breakglass,
                    "reason": breakglass_reason,
                    "role": breakglass.then_some(self.cfg.breakglass_role.as_str()),
                }),
            )
            .await?;

        let now = self.clock.now_ms();
        request.applied = Some(AppliedRecord {
            signature: envelope.signature_b64(),
            signer_id: envelope.signer_id,
            signer_fallback: envelope.fallback,
            audit_event_id: event.id,
            breakglass,
            applied_by: principal.id.clone(),
            reason: breakglass_reason.map(str::to_string),
            applied_at: now,
        });
        request.status = ApprovalStatus::Applied;
        request.updated_at = now;
        self.repo.save_request(request).await?;
        tracing::info!(request_id = %request.id, breakglass, "approval request applied");
        Ok(())
    }

    async fn audit(
        &self,
        request: &ApprovalRequest,
        event_type: &str,
        principal: &Principal,
        payload: Value,
    ) -> WardenResult<crate::audit::AuditEvent> {
        self.ledger
            .append(
                AppendRequest::new(
                    request.chain_id.clone(),
                    event_type,
                    principal.id.clone(),
                    payload,
                ),
                principal,
            )
            .await
    }
}
