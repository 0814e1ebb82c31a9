//! Audit logging for CA and certificate lifecycle events.
//!
//! Every event is emitted via `tracing::info!` with the event serialized as
//! JSON in the `audit` field, making the trail queryable by any log
//! aggregator.
//!
//! # Events
//!
//! | Event | When |
//! |-------|------|
//! | `ca.prepared` | A pending CA was generated for rotation |
//! | `ca.activated` | A CA became active (the prior one, if any, retired) |
//! | `ca.revoked` | A CA was revoked |
//! | `cert.issued` | A client or server certificate was signed |
//! | `cert.revoked` | A certificate was revoked |
//! | `cert.denied` | Issuance was refused (no active CA, unknown point) |

use serde::Serialize;

/// Structured audit event emitted for every PKI lifecycle transition.
#[derive(Debug, Serialize)]
pub struct AuditEvent {
    /// Event type string (e.g., `"cert.issued"`).
    pub event: &'static str,
    /// CA involved (issuing CA for certificate events).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca_id: Option<String>,
    /// CA retired by an activation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retired_ca_id: Option<String>,
    /// Certificate serial (lowercase hex).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,
    /// Certificate subject identity.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    /// Enforcement point the certificate is bound to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enforcement_point: Option<String>,
    /// Human-readable reason for revocation or denial.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AuditEvent {
    fn empty(event: &'static str) -> Self {
        Self {
            event,
            ca_id: None,
            retired_ca_id: None,
            serial: None,
            subject: None,
            enforcement_point: None,
            reason: None,
        }
    }

    /// A CA lifecycle event.
    #[must_use]
    pub fn ca(event: &'static str, ca_id: &str, retired_ca_id: Option<String>) -> Self {
        Self {
            ca_id: Some(ca_id.to_string()),
            retired_ca_id,
            ..Self::empty(event)
        }
    }

    /// A `cert.issued` event.
    #[must_use]
    pub fn issued(serial: &str, subject: &str, point: &str, ca_id: &str) -> Self {
        Self {
            ca_id: Some(ca_id.to_string()),
            serial: Some(serial.to_string()),
            subject: Some(subject.to_string()),
            enforcement_point: Some(point.to_string()),
            ..Self::empty("cert.issued")
        }
    }

    /// A `cert.revoked` event.
    #[must_use]
    pub fn revoked(serial: &str, subject: &str, reason: &str) -> Self {
        Self {
            serial: Some(serial.to_string()),
            subject: Some(subject.to_string()),
            reason: Some(reason.to_string()),
            ..Self::empty("cert.revoked")
        }
    }

    /// A `cert.denied` event.
    #[must_use]
    pub fn denied(subject: &str, point: &str, reason: impl Into<String>) -> Self {
        Self {
            subject: Some(subject.to_string()),
            enforcement_point: Some(point.to_string()),
            reason: Some(reason.into()),
            ..Self::empty("cert.denied")
        }
    }
}

/// Emit an audit event via `tracing::info!` with structured fields.
pub fn emit(event: &AuditEvent) {
    match serde_json::to_string(event) {
        Ok(ref json) => tracing::info!(audit = %json, "pki audit"),
        Err(ref e) => tracing::warn!(error = %e, "Failed to serialize audit event"),
    }
}
