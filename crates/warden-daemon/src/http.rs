// Copyright (c) 2026 Joseph Verdicchio and Warden Contributors
// SPDX-License-Identifier: Apache-2.0

use std::future::Future;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, HeaderValue, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use warden_core::audit::{AppendRequest, AuditLedger, AuditPolicy, Sampler};
use warden_core::clock::Clock;
use warden_core::idempotency::{IdempotencyStore, IdempotentRequest};
use warden_core::keys::KeyRegistry;
use warden_core::multisig::{Decision, MultisigConfig, MultisigGate, NewApprovalRequest};
use warden_core::signer::Signer;
use warden_core::store::{ApprovalRepository, AuditRepository, IdempotencyRepository};
use warden_core::{Principal, WardenError, WardenResult};

use crate::config::DaemonConfig;
use crate::public_error::ApiError;
use crate::telemetry::Telemetry;

pub const PRINCIPAL_ID_HEADER: &str = "x-principal-id";
pub const PRINCIPAL_ROLES_HEADER: &str = "x-principal-roles";
pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";
pub const IDEMPOTENCY_REPLAYED_HEADER: &str = "idempotency-replayed";

/// Role allowed to purge audit events.
pub const COMPLIANCE_ROLE: &str = "compliance";

#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<AuditLedger>,
    pub gate: Arc<MultisigGate>,
    pub idempotency: Arc<IdempotencyStore>,
    pub registry: Arc<KeyRegistry>,
    pub signer: Arc<dyn Signer>,
    pub clock: Arc<dyn Clock>,
    pub telemetry: Telemetry,
    pub max_body_bytes: usize,
}

impl AppState {
    /// Wires the core services over one store that implements every repository.
    pub fn assemble<S>(
        store: Arc<S>,
        signer: Arc<dyn Signer>,
        registry: Arc<KeyRegistry>,
        policy: AuditPolicy,
        sampler: Arc<dyn Sampler>,
        clock: Arc<dyn Clock>,
        cfg: &DaemonConfig,
    ) -> Self
    where
        S: AuditRepository + IdempotencyRepository + ApprovalRepository + 'static,
    {
        let audit_repo: Arc<dyn AuditRepository> = store.clone();
        let idem_repo: Arc<dyn IdempotencyRepository> = store.clone();
        let approval_repo: Arc<dyn ApprovalRepository> = store;

        let ledger = Arc::new(AuditLedger::new(
            audit_repo,
            signer.clone(),
            policy,
            sampler,
            clock.clone(),
        ));
        let gate = Arc::new(MultisigGate::new(
            approval_repo,
            ledger.clone(),
            signer.clone(),
            clock.clone(),
            MultisigConfig {
                breakglass_min_approvals: cfg.breakglass_min_approvals,
                breakglass_role: cfg.breakglass_role.clone(),
            },
        ));
        let idempotency = Arc::new(IdempotencyStore::new(
            idem_repo,
            clock.clone(),
            cfg.idempotency_ttl(),
        ));
        Self {
            ledger,
            gate,
            idempotency,
            registry,
            signer,
            clock,
            telemetry: Telemetry::new(),
            max_body_bytes: cfg.max_body_bytes,
        }
    }

    fn reject(&self, err: WardenError) -> ApiError {
        self.telemetry.record_error(err.code());
        ApiError(err)
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(metrics))
        .route("/v1/signers", get(list_signers))
        .route("/v1/audit/events", post(append_event))
        .route("/v1/audit/events/:id", get(get_event))
        .route("/v1/audit/events/:id/purge", post(purge_event))
        .route("/v1/audit/chains/:chain_id", get(get_chain))
        .route("/v1/audit/chains/:chain_id/verify", post(verify_chain))
        .route("/v1/approvals", post(create_approval))
        .route("/v1/approvals/:id", get(get_approval))
        .route("/v1/approvals/:id/request-multisig", post(request_multisig))
        .route("/v1/approvals/:id/approvals", post(record_approval))
        .route("/v1/approvals/:id/apply", post(apply_approval))
        .route("/v1/approvals/:id/breakglass", post(breakglass_apply))
        .layer(RequestBodyLimitLayer::new(state.max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(
    listener: tokio::net::TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), std::io::Error> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

fn validate_ascii_printable_len(value: &str, min: usize, max: usize, field: &str) -> WardenResult<()> {
    if value.len() < min || value.len() > max {
        return Err(WardenError::validation(format!(
            "{field} must be {min}..={max} characters"
        )));
    }
    if !value.bytes().all(|b| (0x20..=0x7e).contains(&b)) {
        return Err(WardenError::validation(format!(
            "{field} must be printable ASCII"
        )));
    }
    Ok(())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> WardenResult<Option<&'a str>> {
    match headers.get(name) {
        None => Ok(None),
        Some(value) => value
            .to_str()
            .map(Some)
            .map_err(|_| WardenError::validation(format!("{name} header must be printable ASCII"))),
    }
}

pub fn principal_from_headers(headers: &HeaderMap) -> WardenResult<Principal> {
    let id = header_str(headers, PRINCIPAL_ID_HEADER)?
        .map(str::trim)
        .unwrap_or_default();
    validate_ascii_printable_len(id, 1, 128, PRINCIPAL_ID_HEADER)?;
    let roles: Vec<String> = header_str(headers, PRINCIPAL_ROLES_HEADER)?
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|role| !role.is_empty())
        .map(str::to_string)
        .collect();
    Ok(Principal::new(id).with_roles(roles))
}

fn parse_body<T: DeserializeOwned>(body: &[u8]) -> WardenResult<T> {
    serde_json::from_slice(body)
        .map_err(|err| WardenError::validation(format!("invalid JSON body: {err}")))
}

/// Runs a side-effecting handler body under the request's idempotency key and
/// renders the stored (or fresh) result.
async fn idempotent<F, Fut>(
    state: &AppState,
    headers: &HeaderMap,
    uri: &Uri,
    principal: &Principal,
    op: F,
) -> WardenResult<Response>
where
    F: FnOnce() -> Fut + Send,
    Fut: Future<Output = WardenResult<(u16, Value)>> + Send,
{
    let key = header_str(headers, IDEMPOTENCY_KEY_HEADER)?;
    let path = uri.path();
    let outcome = state
        .idempotency
        .execute(
            IdempotentRequest {
                key,
                method: "POST",
                path,
                principal_id: &principal.id,
            },
            op,
        )
        .await?;
    let status = StatusCode::from_u16(outcome.record.status).unwrap_or(StatusCode::OK);
    let mut response = (status, Json(outcome.record.response)).into_response();
    if outcome.replayed {
        state.telemetry.record_idempotent_replay(path);
        response.headers_mut().insert(
            IDEMPOTENCY_REPLAYED_HEADER,
            HeaderValue::from_static("true"),
        );
    }
    Ok(response)
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({"status": "ok", "signerId": state.signer.signer_id()}))
}

async fn ready(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    state
        .signer
        .health()
        .await
        .map_err(|err| state.reject(WardenError::SignerUnavailable(err.to_string())))?;
    Ok(Json(json!({"ready": true, "signerId": state.signer.signer_id()})))
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.telemetry.render(),
    )
}

async fn list_signers(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({"signers": state.registry.list()}))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct AppendEventBody {
    chain_id: String,
    event_type: String,
    #[serde(default)]
    payload: Value,
}

async fn append_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    uri: Uri,
    body: Bytes,
) -> Result<Response, ApiError> {
    append_event_impl(&state, &headers, &uri, &body)
        .await
        .map_err(|err| state.reject(err))
}

async fn append_event_impl(
    state: &AppState,
    headers: &HeaderMap,
    uri: &Uri,
    body: &[u8],
) -> WardenResult<Response> {
    let principal = principal_from_headers(headers)?;
    let req: AppendEventBody = parse_body(body)?;
    let st = state.clone();
    let actor = principal.clone();
    idempotent(state, headers, uri, &principal, move || async move {
        let event = st
            .ledger
            .append(
                AppendRequest::new(req.chain_id, req.event_type, actor.id.clone(), req.payload),
                &actor,
            )
            .await?;
        st.telemetry
            .record_audit_append(&event.event_type, event.sampled);
        if event.signer_fallback {
            st.telemetry.record_signer_fallback();
        }
        let status = if event.sampled { 202 } else { 201 };
        Ok((status, serde_json::to_value(&event)?))
    })
    .await
}

async fn get_event(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let event = state.ledger.get(&id).await.map_err(|err| state.reject(err))?;
    Ok(Json(serde_json::to_value(&event).map_err(|err| state.reject(err.into()))?))
}

async fn get_chain(
    State(state): State<AppState>,
    Path(chain_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let events = state
        .ledger
        .chain(&chain_id)
        .await
        .map_err(|err| state.reject(err))?;
    Ok(Json(serde_json::to_value(&events).map_err(|err| state.reject(err.into()))?))
}

async fn verify_chain(
    State(state): State<AppState>,
    Path(chain_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let report = state
        .ledger
        .verify(&chain_id, &state.registry)
        .await
        .map_err(|err| state.reject(err))?;
    Ok(Json(serde_json::to_value(&report).map_err(|err| state.reject(err.into()))?))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ReasonBody {
    reason: String,
}

async fn purge_event(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    uri: Uri,
    body: Bytes,
) -> Result<Response, ApiError> {
    purge_event_impl(&state, id, &headers, &uri, &body)
        .await
        .map_err(|err| state.reject(err))
}

async fn purge_event_impl(
    state: &AppState,
    id: String,
    headers: &HeaderMap,
    uri: &Uri,
    body: &[u8],
) -> WardenResult<Response> {
    let principal = principal_from_headers(headers)?;
    if !principal.has_role(COMPLIANCE_ROLE) {
        return Err(WardenError::Forbidden(format!(
            "purging audit events requires the {COMPLIANCE_ROLE} role"
        )));
    }
    let req: ReasonBody = parse_body(body)?;
    let st = state.clone();
    let actor = principal.clone();
    idempotent(state, headers, uri, &principal, move || async move {
        let record = st.ledger.purge_event(&id, &actor, &req.reason).await?;
        st.telemetry.record_audit_append(&record.event_type, false);
        Ok((200, serde_json::to_value(&record)?))
    })
    .await
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct CreateApprovalBody {
    subject: String,
    payload: Value,
    #[serde(default)]
    chain_id: Option<String>,
}

async fn create_approval(
    State(state): State<AppState>,
    headers: HeaderMap,
    uri: Uri,
    body: Bytes,
) -> Result<Response, ApiError> {
    create_approval_impl(&state, &headers, &uri, &body)
        .await
        .map_err(|err| state.reject(err))
}

async fn create_approval_impl(
    state: &AppState,
    headers: &HeaderMap,
    uri: &Uri,
    body: &[u8],
) -> WardenResult<Response> {
    let principal = principal_from_headers(headers)?;
    let req: CreateApprovalBody = parse_body(body)?;
    let st = state.clone();
    let actor = principal.clone();
    idempotent(state, headers, uri, &principal, move || async move {
        let created = st
            .gate
            .create(
                NewApprovalRequest {
                    subject: req.subject,
                    payload: req.payload,
                    chain_id: req.chain_id,
                },
                &actor,
            )
            .await?;
        Ok((201, serde_json::to_value(&created)?))
    })
    .await
}

async fn get_approval(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let request = state.gate.get(&id).await.map_err(|err| state.reject(err))?;
    Ok(Json(serde_json::to_value(&request).map_err(|err| state.reject(err.into()))?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RequestMultisigBody {
    approvals_required: u32,
    #[serde(default)]
    approvers: Option<Vec<String>>,
}

async fn request_multisig(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    uri: Uri,
    body: Bytes,
) -> Result<Response, ApiError> {
    request_multisig_impl(&state, id, &headers, &uri, &body)
        .await
        .map_err(|err| state.reject(err))
}

async fn request_multisig_impl(
    state: &AppState,
    id: String,
    headers: &HeaderMap,
    uri: &Uri,
    body: &[u8],
) -> WardenResult<Response> {
    let principal = principal_from_headers(headers)?;
    let req: RequestMultisigBody = parse_body(body)?;
    let st = state.clone();
    let actor = principal.clone();
    idempotent(state, headers, uri, &principal, move || async move {
        let updated = st
            .gate
            .request_multisig(&id, req.approvals_required, req.approvers, &actor)
            .await?;
        Ok((200, serde_json::to_value(&updated)?))
    })
    .await
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ApprovalBody {
    #[serde(default)]
    approver_id: Option<String>,
    decision: Decision,
    #[serde(default)]
    note: Option<String>,
}

async fn record_approval(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    uri: Uri,
    body: Bytes,
) -> Result<Response, ApiError> {
    record_approval_impl(&state, id, &headers, &uri, &body)
        .await
        .map_err(|err| state.reject(err))
}

async fn record_approval_impl(
    state: &AppState,
    id: String,
    headers: &HeaderMap,
    uri: &Uri,
    body: &[u8],
) -> WardenResult<Response> {
    let principal = principal_from_headers(headers)?;
    let req: ApprovalBody = parse_body(body)?;
    let approver = req.approver_id.unwrap_or_else(|| principal.id.clone());
    let st = state.clone();
    let actor = principal.clone();
    idempotent(state, headers, uri, &principal, move || async move {
        let updated = st
            .gate
            .record_approval(&id, &approver, req.decision, req.note, &actor)
            .await?;
        st.telemetry.record_approval(match req.decision {
            Decision::Approved => "approved",
            Decision::Rejected => "rejected",
        });
        Ok((200, serde_json::to_value(&updated)?))
    })
    .await
}

async fn apply_approval(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    uri: Uri,
) -> Result<Response, ApiError> {
    apply_approval_impl(&state, id, &headers, &uri)
        .await
        .map_err(|err| state.reject(err))
}

async fn apply_approval_impl(
    state: &AppState,
    id: String,
    headers: &HeaderMap,
    uri: &Uri,
) -> WardenResult<Response> {
    let principal = principal_from_headers(headers)?;
    let st = state.clone();
    let actor = principal.clone();
    idempotent(state, headers, uri, &principal, move || async move {
        let applied = st.gate.apply(&id, &actor).await?;
        if applied.applied.as_ref().is_some_and(|a| a.signer_fallback) {
            st.telemetry.record_signer_fallback();
        }
        Ok((200, serde_json::to_value(&applied)?))
    })
    .await
}

async fn breakglass_apply(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    uri: Uri,
    body: Bytes,
) -> Result<Response, ApiError> {
    breakglass_apply_impl(&state, id, &headers, &uri, &body)
        .await
        .map_err(|err| state.reject(err))
}

async fn breakglass_apply_impl(
    state: &AppState,
    id: String,
    headers: &HeaderMap,
    uri: &Uri,
    body: &[u8],
) -> WardenResult<Response> {
    let principal = principal_from_headers(headers)?;
    let req: ReasonBody = parse_body(body)?;
    let st = state.clone();
    let actor = principal.clone();
    idempotent(state, headers, uri, &principal, move || async move {
        let applied = st.gate.breakglass_apply(&id, &actor, &req.reason).await?;
        if applied.applied.as_ref().is_some_and(|a| a.signer_fallback) {
            st.telemetry.record_signer_fallback();
        }
        Ok((200, serde_json::to_value(&applied)?))
    })
    .await
}
