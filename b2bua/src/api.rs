//! Management API: typed JSON request/response operations for calls,
//! routing rules, per-leg header mutation and system status.

use crate::call::{Call, CallRegistry, CallState, Leg};
use crate::dialog::Dialog;
use crate::error::B2buaError;
use crate::metrics::Metrics;
use crate::routing::{RoutingEngine, RoutingRule, RuleStore, RuleStoreError};
use crate::session::SessionManager;
use crate::sweep::HealthState;
use axum::extract::{Path, State};
use axum::http::StatusCode as HttpStatus;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use sip_core::Endpoint;
use sip_types::header::typed::Contact;
use sip_types::uri::{NameAddr, SipUri};
use sip_types::Method;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct ApiState {
    pub sessions: Arc<SessionManager>,
    pub rules: Arc<RuleStore>,
    pub engine: Arc<RoutingEngine>,
    pub metrics: Arc<Metrics>,
    pub health: Arc<HealthState>,
    pub endpoint: Endpoint,
    pub local_identity: NameAddr,
    pub started_at: Instant,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/v1/calls", get(list_calls).post(initiate_call))
        .route(
            "/v1/calls/:id",
            get(get_call).delete(terminate_call),
        )
        .route(
            "/v1/calls/:id/legs/:leg/headers",
            get(get_headers).post(mutate_header),
        )
        .route("/v1/rules", get(list_rules).post(add_rule))
        .route(
            "/v1/rules/:id",
            get(get_rule).put(update_rule).delete(delete_rule),
        )
        .route("/v1/status", get(system_status))
        .route("/v1/health", get(health_check))
        .route("/v1/metrics", get(metrics_text))
        .route("/v1/config/:name", get(get_config_snapshot))
        .with_state(state)
}

/// Serve the management API until shutdown
pub async fn serve(
    state: ApiState,
    bind: SocketAddr,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    log::info!("management API listening on {bind}");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

// ==== error mapping ====

struct ApiError(HttpStatus, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({ "error": self.1 }));

        (self.0, body).into_response()
    }
}

impl From<RuleStoreError> for ApiError {
    fn from(error: RuleStoreError) -> Self {
        let status = match &error {
            RuleStoreError::NotFound(_) => HttpStatus::NOT_FOUND,
            RuleStoreError::Rule(_) | RuleStoreError::Malformed(_) => HttpStatus::BAD_REQUEST,
            RuleStoreError::Store(_) => HttpStatus::SERVICE_UNAVAILABLE,
        };

        ApiError(status, error.to_string())
    }
}

impl From<B2buaError> for ApiError {
    fn from(error: B2buaError) -> Self {
        let status = match &error {
            B2buaError::LimitExceeded => HttpStatus::TOO_MANY_REQUESTS,
            B2buaError::StoreUnavailable(_) => HttpStatus::SERVICE_UNAVAILABLE,
            _ => HttpStatus::INTERNAL_SERVER_ERROR,
        };

        ApiError(status, error.to_string())
    }
}

fn not_found(what: &str) -> ApiError {
    ApiError(HttpStatus::NOT_FOUND, format!("{what} not found"))
}

// ==== calls ====

#[derive(Serialize)]
struct CallSummary {
    id: String,
    state: CallState,
    identity: String,
    caller_call_id: String,
    callee_call_id: Option<String>,
    age_secs: u64,
    idle_secs: u64,
}

async fn summarize(call: &Call) -> CallSummary {
    CallSummary {
        id: call.id.clone(),
        state: call.state,
        identity: call.identity.clone(),
        caller_call_id: call.caller.call_id.to_string(),
        callee_call_id: call
            .callee
            .as_ref()
            .map(|dialog| dialog.call_id.to_string()),
        age_secs: call.created_at.elapsed().as_secs(),
        idle_secs: call.last_activity.elapsed().as_secs(),
    }
}

async fn list_calls(State(state): State<ApiState>) -> Json<Vec<CallSummary>> {
    let mut out = Vec::new();

    for (_, handle) in state.sessions.registry().snapshot() {
        let call = handle.call.lock().await;
        out.push(summarize(&call).await);
    }

    Json(out)
}

#[derive(Serialize)]
struct CallDetails {
    #[serde(flatten)]
    summary: CallSummary,
    metadata: HashMap<String, String>,
    media: Option<crate::call::MediaSession>,
    persisted: Option<crate::session::SessionRecord>,
}

async fn get_call(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<CallDetails>, ApiError> {
    let handle = state
        .sessions
        .registry()
        .get(&id)
        .ok_or_else(|| not_found("call"))?;

    let persisted = state.sessions.persisted_record(&id).await?;

    let call = handle.call.lock().await;

    Ok(Json(CallDetails {
        summary: summarize(&call).await,
        metadata: call.metadata.clone(),
        media: call.media.clone(),
        persisted,
    }))
}

async fn terminate_call(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if state.sessions.registry().get(&id).is_none() {
        return Err(not_found("call"));
    }

    state.sessions.terminate(&id).await;

    Ok(Json(serde_json::json!({ "terminated": id })))
}

#[derive(Deserialize)]
struct InitiateCallRequest {
    target: String,
    #[serde(default)]
    identity: Option<String>,
    #[serde(default)]
    sdp: Option<String>,
}

#[derive(Serialize)]
struct InitiateCallResponse {
    session_id: String,
}

/// Originate a single-leg call toward `target`. The session appears in the
/// call list like any other and is driven to completion in the background.
async fn initiate_call(
    State(state): State<ApiState>,
    Json(body): Json<InitiateCallRequest>,
) -> Result<Json<InitiateCallResponse>, ApiError> {
    let target = SipUri::parse(&body.target)
        .map_err(|e| ApiError(HttpStatus::BAD_REQUEST, e.to_string()))?;

    let identity = body.identity.unwrap_or_else(|| "api".to_owned());

    let contact = Contact::new(state.local_identity.clone());
    let mut dialog = Dialog::new_uac(state.local_identity.clone(), target, contact);

    let session_id = CallRegistry::session_id(&dialog.call_id);

    let mut request = dialog.create_request(Method::INVITE);

    let offer = body.sdp.filter(|sdp| !sdp.is_empty());

    let mut call = Call::new(session_id.clone(), identity, dialog);
    call.metadata
        .insert("origin".to_owned(), "management-api".to_owned());

    let handle = state.sessions.create_session(call).await?;

    // anchor media when the caller supplied an offer
    if let Some(sdp) = &offer {
        let rewritten = state
            .sessions
            .process_offer(&session_id, sdp, "", Leg::A)
            .await?;

        request
            .headers
            .insert_named(&sip_types::header::typed::ContentType::sdp());
        request.body = bytes::Bytes::copy_from_slice(rewritten.as_bytes());
    }

    let endpoint = state.endpoint.clone();
    let sessions = state.sessions.clone();
    let id = session_id.clone();

    tokio::spawn(async move {
        let mut target = sip_core::transport::TargetTransportInfo::default();

        let mut tsx = match endpoint.send_invite(request, &mut target).await {
            Ok(tsx) => tsx,
            Err(e) => {
                log::warn!("api originated call {id} failed to send, {e}");
                sessions.terminate(&id).await;
                return;
            }
        };

        loop {
            match tsx.receive().await {
                Ok(Some(response)) if response.line.code.kind() == sip_types::CodeKind::Success => {
                    let to_tag = response.base_headers.to.tag.clone();

                    let ack = {
                        let mut call = handle.call.lock().await;

                        if let Some(tag) = to_tag {
                            call.caller.confirm_uac(tag, &response.headers);
                        }
                        call.caller.target = target.clone();

                        call.caller.create_ack()
                    };

                    let mut ack_target = target.clone();

                    if let Err(e) =
                        crate::b2bua::send_loose_ack(&endpoint, ack, &mut ack_target).await
                    {
                        log::warn!("api originated call {id} failed to ack, {e}");
                    }

                    sessions.update_state(&id, CallState::Connected).await;
                    return;
                }
                Ok(Some(response)) if response.line.code.is_final() => {
                    log::info!(
                        "api originated call {id} answered {}",
                        response.line.code
                    );
                    sessions.terminate(&id).await;
                    return;
                }
                Ok(Some(_)) => continue,
                Ok(None) | Err(_) => {
                    sessions.terminate(&id).await;
                    return;
                }
            }
        }
    });

    Ok(Json(InitiateCallResponse { session_id }))
}

// ==== per leg header mutation ====

#[derive(Deserialize)]
#[serde(rename_all = "snake_case", tag = "action")]
enum HeaderMutation {
    Add { name: String, value: String },
    Replace { name: String, value: String },
    Remove { name: String },
}

fn parse_leg(leg: &str) -> Result<Leg, ApiError> {
    match leg {
        "a" | "A" => Ok(Leg::A),
        "b" | "B" => Ok(Leg::B),
        _ => Err(ApiError(
            HttpStatus::BAD_REQUEST,
            format!("unknown leg {leg:?}, expected a or b"),
        )),
    }
}

/// Headers the B2BUA manages itself are off limits here, same rule as for
/// routing actions
fn is_protected(name: &str) -> bool {
    let name = sip_types::Name::from(name);

    [
        sip_types::Name::VIA,
        sip_types::Name::RECORD_ROUTE,
        sip_types::Name::CONTACT,
        sip_types::Name::FROM,
        sip_types::Name::TO,
        sip_types::Name::CALL_ID,
        sip_types::Name::CSEQ,
    ]
    .iter()
    .any(|protected| *protected == name)
}

async fn mutate_header(
    State(state): State<ApiState>,
    Path((id, leg)): Path<(String, String)>,
    Json(mutation): Json<HeaderMutation>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let leg = parse_leg(&leg)?;

    let handle = state
        .sessions
        .registry()
        .get(&id)
        .ok_or_else(|| not_found("call"))?;

    let name = match &mutation {
        HeaderMutation::Add { name, .. }
        | HeaderMutation::Replace { name, .. }
        | HeaderMutation::Remove { name } => name.clone(),
    };

    if is_protected(&name) {
        return Err(ApiError(
            HttpStatus::BAD_REQUEST,
            format!("header {name} is managed by the B2BUA"),
        ));
    }

    let mut call = handle.call.lock().await;

    let Some(dialog) = call.dialog_mut(leg) else {
        return Err(not_found("leg"));
    };

    match mutation {
        HeaderMutation::Add { name, value } | HeaderMutation::Replace { name, value } => {
            dialog
                .header_overrides
                .retain(|(existing, _)| !existing.eq_ignore_ascii_case(&name));
            dialog.header_overrides.push((name, Some(value)));
        }
        HeaderMutation::Remove { name } => {
            dialog
                .header_overrides
                .retain(|(existing, _)| !existing.eq_ignore_ascii_case(&name));
            dialog.header_overrides.push((name, None));
        }
    }

    Ok(Json(serde_json::json!({ "updated": id })))
}

#[derive(Serialize)]
struct LegHeaders {
    overrides: Vec<HeaderOverrideView>,
}

#[derive(Serialize)]
struct HeaderOverrideView {
    name: String,
    value: Option<String>,
}

async fn get_headers(
    State(state): State<ApiState>,
    Path((id, leg)): Path<(String, String)>,
) -> Result<Json<LegHeaders>, ApiError> {
    let leg = parse_leg(&leg)?;

    let handle = state
        .sessions
        .registry()
        .get(&id)
        .ok_or_else(|| not_found("call"))?;

    let call = handle.call.lock().await;

    let Some(dialog) = call.dialog(leg) else {
        return Err(not_found("leg"));
    };

    Ok(Json(LegHeaders {
        overrides: dialog
            .header_overrides
            .iter()
            .map(|(name, value)| HeaderOverrideView {
                name: name.clone(),
                value: value.clone(),
            })
            .collect(),
    }))
}

// ==== rules ====

async fn list_rules(
    State(state): State<ApiState>,
) -> Result<Json<Vec<RoutingRule>>, ApiError> {
    Ok(Json(state.rules.list_rules().await?))
}

async fn get_rule(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<RoutingRule>, ApiError> {
    Ok(Json(state.rules.get_rule(&id).await?))
}

async fn add_rule(
    State(state): State<ApiState>,
    Json(rule): Json<RoutingRule>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let id = rule.id.clone();
    state.rules.put_rule(rule).await?;

    Ok(Json(serde_json::json!({ "stored": id })))
}

async fn update_rule(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(mut rule): Json<RoutingRule>,
) -> Result<Json<serde_json::Value>, ApiError> {
    rule.id = id.clone();
    state.rules.put_rule(rule).await?;

    Ok(Json(serde_json::json!({ "stored": id })))
}

async fn delete_rule(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.rules.delete_rule(&id).await?;

    Ok(Json(serde_json::json!({ "deleted": id })))
}

// ==== status ====

#[derive(Serialize)]
struct SystemStatus {
    uptime_secs: u64,
    active_calls: usize,
    active_rules: usize,
    parse_errors: u64,
    relay_instances: Vec<RelayInstanceStatus>,
    components: HashMap<String, crate::sweep::ComponentHealth>,
}

#[derive(Serialize)]
struct RelayInstanceStatus {
    id: String,
    addr: String,
    weight: u32,
    enabled: bool,
    healthy: bool,
}

async fn system_status(State(state): State<ApiState>) -> Json<SystemStatus> {
    let relay_instances = state
        .sessions
        .relay()
        .instances()
        .iter()
        .map(|instance| RelayInstanceStatus {
            id: instance.id.clone(),
            addr: instance.addr.to_string(),
            weight: instance.weight,
            enabled: instance.is_enabled(),
            healthy: instance.is_healthy(),
        })
        .collect();

    Json(SystemStatus {
        uptime_secs: state.started_at.elapsed().as_secs(),
        active_calls: state.sessions.registry().len(),
        active_rules: state.engine.active_rules(),
        parse_errors: state.endpoint.parse_errors(),
        relay_instances,
        components: state.health.snapshot(),
    })
}

async fn health_check(State(state): State<ApiState>) -> Response {
    let components = state.health.snapshot();
    let degraded = components.values().any(|component| !component.healthy);

    let status = if degraded {
        HttpStatus::SERVICE_UNAVAILABLE
    } else {
        HttpStatus::OK
    };

    (
        status,
        Json(serde_json::json!({
            "status": if degraded { "degraded" } else { "ok" },
            "components": components,
        })),
    )
        .into_response()
}

/// Read a configuration snapshot blob from the shared store
async fn get_config_snapshot(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let blob = state
        .sessions
        .store()
        .get(&format!("/tandem/config/{name}"))
        .await
        .map_err(|e| ApiError(HttpStatus::SERVICE_UNAVAILABLE, e.to_string()))?
        .ok_or_else(|| not_found("config snapshot"))?;

    serde_json::from_str(&blob)
        .map(Json)
        .map_err(|e| ApiError(HttpStatus::INTERNAL_SERVER_ERROR, e.to_string()))
}

async fn metrics_text(State(state): State<ApiState>) -> Response {
    use prometheus::Encoder;

    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&state.metrics.registry.gather(), &mut buffer) {
        return ApiError(HttpStatus::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
    }

    (
        [(axum::http::header::CONTENT_TYPE, encoder.format_type().to_owned())],
        buffer,
    )
        .into_response()
}
