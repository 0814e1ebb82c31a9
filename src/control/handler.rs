//! HTTP handlers for the control plane.
//!
//! # Endpoints
//!
//! | Method | Path | Auth |
//! |--------|------|------|
//! | `POST` | `/api/v1/agent/heartbeat` | agent token in body |
//! | `POST` | `/api/v1/agent/provision` | agent token in body |
//! | `POST` | `/api/v1/agent/rules` | agent token in body |
//! | `POST` | `/api/v1/mesh/spokes` | hub token in body |
//! | `POST` | `/api/v1/sessions` | issuer bearer |
//! | `GET` | `/api/v1/admin/cas` | admin bearer |
//! | `POST` | `/api/v1/admin/cas/rotation` | admin bearer |
//! | `POST` | `/api/v1/admin/cas/{id}/activate` | admin bearer |
//! | `POST` | `/api/v1/admin/cas/{id}/revoke` | admin bearer |
//! | `GET` | `/api/v1/admin/cas/fingerprint` | admin bearer |
//! | `GET` | `/api/v1/admin/certificates` | admin bearer |
//! | `POST` | `/api/v1/admin/certificates/{serial}/revoke` | admin bearer |
//! | `POST` | `/api/v1/admin/identities/{identity}/revoke` | admin bearer |
//! | `GET` | `/api/v1/admin/points` | admin bearer |
//! | `PUT` | `/api/v1/admin/points/{id}` | admin bearer |
//! | `GET` | `/health` | none |
//!
//! ## Bearer Authentication
//!
//! Admin endpoints require `Authorization: Bearer <admin.bearer_token>`; the
//! session endpoint requires `Authorization: Bearer <admin.issuer_token>`.
//! If the matching token is not configured, the endpoint returns
//! `503 Service Unavailable`.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;
use ztgate_proto::{HeartbeatRequest, ProvisionRequest, RuleFetchRequest, SpokeFeedRequest};

use super::{ControlPlane, PointUpdate, SessionRequest};
use crate::Error;
use crate::config::{AdminConfig, resolve_secret};

/// Shared state behind every route.
pub struct ControlState {
    /// Control plane
    pub plane: ControlPlane,
    admin_token: Option<String>,
    issuer_token: Option<String>,
}

impl ControlState {
    /// Wrap `plane`, resolving `env:` indirection in the configured tokens.
    #[must_use]
    pub fn new(plane: ControlPlane, admin: &AdminConfig) -> Self {
        let resolve = |v: &Option<String>| {
            v.as_deref()
                .and_then(resolve_secret)
                .filter(|t| !t.is_empty())
        };
        Self {
            plane,
            admin_token: resolve(&admin.bearer_token),
            issuer_token: resolve(&admin.issuer_token),
        }
    }
}

// ── Request / Response types ───────────────────────────────────────────────

/// Query for `GET /api/v1/admin/certificates`.
#[derive(Debug, Deserialize)]
pub struct CertificateQuery {
    /// Only certificates of this identity
    pub identity: Option<String>,
}

/// Query for the revocation endpoints.
#[derive(Debug, Deserialize)]
pub struct RevokeQuery {
    /// Recorded revocation reason
    #[serde(default = "default_reason")]
    pub reason: String,
}

fn default_reason() -> String {
    "unspecified".to_string()
}

/// Response of `POST /api/v1/admin/identities/{identity}/revoke`.
#[derive(Debug, Serialize, Deserialize)]
pub struct BulkRevokeResponse {
    /// Identity offboarded
    pub identity: String,
    /// Certificates newly revoked
    pub revoked: usize,
}

/// Response of `PUT /api/v1/admin/points/{id}`.
#[derive(Debug, Serialize, Deserialize)]
pub struct PointUpdateResponse {
    /// Point id
    pub id: String,
    /// Canonical config version after the edit
    pub config_version: String,
}

// ── Route builder ─────────────────────────────────────────────────────────

/// Build the control plane routes.
pub fn control_routes(state: Arc<ControlState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/agent/heartbeat", post(heartbeat))
        .route("/api/v1/agent/provision", post(provision))
        .route("/api/v1/agent/rules", post(fetch_rules))
        .route("/api/v1/mesh/spokes", post(spokes))
        .route("/api/v1/sessions", post(issue_session))
        .route("/api/v1/admin/cas", get(list_cas))
        .route("/api/v1/admin/cas/rotation", post(prepare_rotation))
        .route("/api/v1/admin/cas/fingerprint", get(fingerprint))
        .route("/api/v1/admin/cas/{id}/activate", post(activate_ca))
        .route("/api/v1/admin/cas/{id}/revoke", post(revoke_ca))
        .route("/api/v1/admin/certificates", get(list_certificates))
        .route(
            "/api/v1/admin/certificates/{serial}/revoke",
            post(revoke_certificate),
        )
        .route(
            "/api/v1/admin/identities/{identity}/revoke",
            post(revoke_identity),
        )
        .route("/api/v1/admin/points", get(list_points))
        .route("/api/v1/admin/points/{id}", put(update_point))
        .with_state(state)
}

// ── Handlers ──────────────────────────────────────────────────────────────

/// `GET /health`
async fn health(State(s): State<Arc<ControlState>>) -> Response {
    Json(json!({
        "status": "ok",
        "active_cas": s.plane.engine().active_count(),
    }))
    .into_response()
}

/// `POST /api/v1/agent/heartbeat`
async fn heartbeat(
    State(s): State<Arc<ControlState>>,
    Json(body): Json<HeartbeatRequest>,
) -> Response {
    reply(s.plane.heartbeat(&body))
}

/// `POST /api/v1/agent/provision`
async fn provision(
    State(s): State<Arc<ControlState>>,
    Json(body): Json<ProvisionRequest>,
) -> Response {
    reply(s.plane.provision(&body))
}

/// `POST /api/v1/agent/rules`
async fn fetch_rules(
    State(s): State<Arc<ControlState>>,
    Json(body): Json<RuleFetchRequest>,
) -> Response {
    reply(s.plane.fetch_rules(&body))
}

/// `POST /api/v1/mesh/spokes`
async fn spokes(
    State(s): State<Arc<ControlState>>,
    Json(body): Json<SpokeFeedRequest>,
) -> Response {
    reply(s.plane.spokes(&body))
}

/// `POST /api/v1/sessions`: mint a client bundle for an authenticated identity.
async fn issue_session(
    State(s): State<Arc<ControlState>>,
    headers: HeaderMap,
    Json(body): Json<SessionRequest>,
) -> Response {
    if let Err(r) = check_bearer(s.issuer_token.as_deref(), &headers, "issuer") {
        return r;
    }
    reply(s.plane.issue_session(&body))
}

/// `GET /api/v1/admin/cas`
async fn list_cas(State(s): State<Arc<ControlState>>, headers: HeaderMap) -> Response {
    if let Err(r) = check_admin_auth(&s, &headers) {
        return r;
    }
    Json(s.plane.engine().list()).into_response()
}

/// `POST /api/v1/admin/cas/rotation`
async fn prepare_rotation(State(s): State<Arc<ControlState>>, headers: HeaderMap) -> Response {
    if let Err(r) = check_admin_auth(&s, &headers) {
        return r;
    }
    match s.plane.engine().prepare_rotation() {
        Ok(summary) => (StatusCode::CREATED, Json(summary)).into_response(),
        Err(e) => error_reply(&e),
    }
}

/// `GET /api/v1/admin/cas/fingerprint`
async fn fingerprint(State(s): State<Arc<ControlState>>, headers: HeaderMap) -> Response {
    if let Err(r) = check_admin_auth(&s, &headers) {
        return r;
    }
    reply(
        s.plane
            .engine()
            .fingerprint()
            .map(|fp| json!({ "fingerprint": fp })),
    )
}

/// `POST /api/v1/admin/cas/{id}/activate`
async fn activate_ca(
    State(s): State<Arc<ControlState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if let Err(r) = check_admin_auth(&s, &headers) {
        return r;
    }
    reply(s.plane.engine().activate(&id))
}

/// `POST /api/v1/admin/cas/{id}/revoke`
async fn revoke_ca(
    State(s): State<Arc<ControlState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if let Err(r) = check_admin_auth(&s, &headers) {
        return r;
    }
    reply(s.plane.engine().revoke(&id))
}

/// `GET /api/v1/admin/certificates[?identity=]`
async fn list_certificates(
    State(s): State<Arc<ControlState>>,
    headers: HeaderMap,
    Query(q): Query<CertificateQuery>,
) -> Response {
    if let Err(r) = check_admin_auth(&s, &headers) {
        return r;
    }
    Json(s.plane.issuer().list(q.identity.as_deref())).into_response()
}

/// `POST /api/v1/admin/certificates/{serial}/revoke[?reason=]`
async fn revoke_certificate(
    State(s): State<Arc<ControlState>>,
    headers: HeaderMap,
    Path(serial): Path<String>,
    Query(q): Query<RevokeQuery>,
) -> Response {
    if let Err(r) = check_admin_auth(&s, &headers) {
        return r;
    }
    reply(s.plane.issuer().revoke(&serial, &q.reason))
}

/// `POST /api/v1/admin/identities/{identity}/revoke[?reason=]`
async fn revoke_identity(
    State(s): State<Arc<ControlState>>,
    headers: HeaderMap,
    Path(identity): Path<String>,
    Query(q): Query<RevokeQuery>,
) -> Response {
    if let Err(r) = check_admin_auth(&s, &headers) {
        return r;
    }
    let revoked = s.plane.revoke_identity(&identity, &q.reason);
    Json(BulkRevokeResponse { identity, revoked }).into_response()
}

/// `GET /api/v1/admin/points`
async fn list_points(State(s): State<Arc<ControlState>>, headers: HeaderMap) -> Response {
    if let Err(r) = check_admin_auth(&s, &headers) {
        return r;
    }
    Json(s.plane.point_statuses()).into_response()
}

/// `PUT /api/v1/admin/points/{id}`
async fn update_point(
    State(s): State<Arc<ControlState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<PointUpdate>,
) -> Response {
    if let Err(r) = check_admin_auth(&s, &headers) {
        return r;
    }
    reply(
        s.plane
            .update_point(&id, &body)
            .map(|config_version| PointUpdateResponse { id, config_version }),
    )
}

// ── Helpers ───────────────────────────────────────────────────────────────

fn check_admin_auth(s: &ControlState, headers: &HeaderMap) -> Result<(), Response> {
    check_bearer(s.admin_token.as_deref(), headers, "admin")
}

/// Validate `Authorization: Bearer` against `expected` in constant time.
fn check_bearer(expected: Option<&str>, headers: &HeaderMap, role: &str) -> Result<(), Response> {
    use subtle::ConstantTimeEq;

    let Some(expected) = expected else {
        return Err(error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            &format!("{role}_not_configured"),
            &format!("No {role} token configured; endpoint disabled"),
        ));
    };

    let provided = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer ").or_else(|| v.strip_prefix("bearer ")));

    let matches = provided.is_some_and(|p| p.as_bytes().ct_eq(expected.as_bytes()).into());

    if matches {
        Ok(())
    } else {
        Err((
            StatusCode::UNAUTHORIZED,
            [("WWW-Authenticate", "Bearer")],
            Json(json!({
                "error": "unauthorized",
                "message": format!("Invalid {role} token"),
            })),
        )
            .into_response())
    }
}

fn reply<T: Serialize>(result: crate::Result<T>) -> Response {
    match result {
        Ok(body) => Json(body).into_response(),
        Err(e) => error_reply(&e),
    }
}

fn error_reply(e: &Error) -> Response {
    let status = e.status_code();
    if status.is_server_error() {
        warn!(error = %e, "Request failed");
    }
    error_response(status, e.code(), &e.to_string())
}

fn error_response(status: StatusCode, error: &str, message: &str) -> Response {
    (status, Json(json!({"error": error, "message": message}))).into_response()
}
