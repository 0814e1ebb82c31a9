//! Certificate authority lifecycle with dual-trust rotation.
//!
//! ```text
//!  prepare_rotation()        activate(id)                 revoke(id)
//!  ───────────────► pending ──────────────► active ──┐   ─────────► revoked
//!                                    (prior active) └─► retired ─┘
//! ```
//!
//! - `active` signs and verifies. At most one CA is active at any instant.
//! - `pending` neither signs nor verifies.
//! - `retired` verifies but never signs. This is the dual-trust window after
//!   a rotation.
//! - `revoked` verifies nothing, effective immediately.
//!
//! All state sits behind one `RwLock`. `activate` holds the write guard for
//! the whole retire-and-promote step, so concurrent rotations serialize and
//! no reader can observe two active CAs.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
    KeyUsagePurpose,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use x509_parser::certificate::X509Certificate;
use x509_parser::pem::parse_x509_pem;
use x509_parser::prelude::FromDer;

use super::audit::{self, AuditEvent};
use super::keys::{self, KeyAlgorithm, SecretPem};
use crate::{Error, Result};

/// CA lifecycle status.
///
/// Persisted and transmitted as the lowercase strings `active`, `pending`,
/// `retired` and `revoked`; [`FromStr`] and `Display` are the only
/// conversion points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaStatus {
    /// Issues and verifies
    Active,
    /// Prepared for rotation; does nothing yet
    Pending,
    /// Verifies only
    Retired,
    /// Verifies nothing
    Revoked,
}

impl CaStatus {
    /// Whether certificates chaining to a CA in this status verify.
    #[must_use]
    pub fn verifies(self) -> bool {
        matches!(self, Self::Active | Self::Retired)
    }

    /// Stable string form.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Pending => "pending",
            Self::Retired => "retired",
            Self::Revoked => "revoked",
        }
    }
}

impl fmt::Display for CaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CaStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(Self::Active),
            "pending" => Ok(Self::Pending),
            "retired" => Ok(Self::Retired),
            "revoked" => Ok(Self::Revoked),
            other => Err(Error::Internal(format!("unknown CA status '{other}'"))),
        }
    }
}

/// A certificate authority with its key material.
#[derive(Debug, Clone)]
pub struct CertificateAuthority {
    /// Opaque id
    pub id: String,
    /// Lifecycle status
    pub status: CaStatus,
    /// SHA-256 over the certificate DER
    pub fingerprint: String,
    /// Start of validity
    pub not_before: DateTime<Utc>,
    /// End of validity
    pub not_after: DateTime<Utc>,
    /// Self-signed root certificate
    pub cert_pem: String,
    cert_der: Vec<u8>,
    key: SecretPem,
}

impl CertificateAuthority {
    fn summary(&self) -> CaSummary {
        CaSummary {
            id: self.id.clone(),
            status: self.status,
            fingerprint: self.fingerprint.clone(),
            not_before: self.not_before,
            not_after: self.not_after,
        }
    }
}

/// Public view of a CA, safe to return from the admin API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaSummary {
    /// Opaque id
    pub id: String,
    /// Lifecycle status
    pub status: CaStatus,
    /// SHA-256 over the certificate DER
    pub fingerprint: String,
    /// Start of validity
    pub not_before: DateTime<Utc>,
    /// End of validity
    pub not_after: DateTime<Utc>,
}

/// Material needed to sign one certificate under the active CA.
pub(crate) struct SigningMaterial {
    pub ca_id: String,
    pub cert_pem: String,
    pub key: SecretPem,
}

/// The CA engine.
pub struct CaEngine {
    algorithm: KeyAlgorithm,
    common_name: String,
    validity: Duration,
    cas: RwLock<Vec<CertificateAuthority>>,
    revoked_serials: RwLock<HashSet<String>>,
}

impl CaEngine {
    /// Create an engine with no CAs. Call [`bootstrap`](Self::bootstrap) or
    /// [`import_active`](Self::import_active) before issuing.
    #[must_use]
    pub fn new(algorithm: KeyAlgorithm, common_name: impl Into<String>, validity_days: u32) -> Self {
        Self {
            algorithm,
            common_name: common_name.into(),
            validity: Duration::from_secs(u64::from(validity_days) * 86_400),
            cas: RwLock::new(Vec::new()),
            revoked_serials: RwLock::new(HashSet::new()),
        }
    }

    /// Ensure exactly one CA is active, generating one if none is.
    ///
    /// Returns the active CA.
    pub fn bootstrap(&self) -> Result<CaSummary> {
        let mut cas = self.cas.write();
        if let Some(active) = cas.iter().find(|c| c.status == CaStatus::Active) {
            return Ok(active.summary());
        }
        let ca = self.generate(CaStatus::Active)?;
        let summary = ca.summary();
        cas.push(ca);
        drop(cas);

        info!(ca_id = %summary.id, fingerprint = %summary.fingerprint, "Generated initial active CA");
        audit::emit(&AuditEvent::ca("ca.activated", &summary.id, None));
        Ok(summary)
    }

    /// Import an existing root as the active CA.
    ///
    /// # Errors
    ///
    /// Fails if a CA is already active, or if the PEMs do not parse.
    pub fn import_active(&self, cert_pem: &str, key_pem: &str) -> Result<CaSummary> {
        KeyPair::from_pem(key_pem)
            .map_err(|e| Error::Crypto(format!("Failed to parse CA key: {e}")))?;
        let (_, pem) = parse_x509_pem(cert_pem.as_bytes())
            .map_err(|e| Error::Crypto(format!("Failed to parse CA certificate PEM: {e}")))?;
        let cert = pem
            .parse_x509()
            .map_err(|e| Error::Crypto(format!("Failed to parse CA certificate: {e}")))?;

        let not_before = asn1_to_chrono(cert.validity().not_before.timestamp())?;
        let not_after = asn1_to_chrono(cert.validity().not_after.timestamp())?;

        let ca = CertificateAuthority {
            id: uuid::Uuid::new_v4().to_string(),
            status: CaStatus::Active,
            fingerprint: keys::fingerprint(&pem.contents),
            not_before,
            not_after,
            cert_pem: cert_pem.to_string(),
            cert_der: pem.contents.clone(),
            key: SecretPem::new(key_pem.to_string()),
        };

        let mut cas = self.cas.write();
        if cas.iter().any(|c| c.status == CaStatus::Active) {
            return Err(Error::InvalidCaTransition {
                id: ca.id,
                reason: "an active CA already exists".to_string(),
            });
        }
        let summary = ca.summary();
        cas.push(ca);
        info!(ca_id = %summary.id, fingerprint = %summary.fingerprint, "Imported active CA");
        Ok(summary)
    }

    /// Generate a new key pair and self-signed root in `pending` status.
    ///
    /// Issuance is unaffected until [`activate`](Self::activate).
    pub fn prepare_rotation(&self) -> Result<CaSummary> {
        let ca = self.generate(CaStatus::Pending)?;
        let summary = ca.summary();
        self.cas.write().push(ca);

        info!(ca_id = %summary.id, "Prepared pending CA for rotation");
        audit::emit(&AuditEvent::ca("ca.prepared", &summary.id, None));
        Ok(summary)
    }

    /// Promote a `pending` CA and retire the prior active one in one step.
    ///
    /// # Errors
    ///
    /// `CaNotFound` for an unknown id; `InvalidCaTransition` if the target is
    /// not `pending`. No state changes on error.
    pub fn activate(&self, id: &str) -> Result<CaSummary> {
        let mut cas = self.cas.write();

        let target = cas
            .iter()
            .position(|c| c.id == id)
            .ok_or_else(|| Error::CaNotFound(id.to_string()))?;
        if cas[target].status != CaStatus::Pending {
            return Err(Error::InvalidCaTransition {
                id: id.to_string(),
                reason: format!("status is {}, expected pending", cas[target].status),
            });
        }

        let mut retired = None;
        for ca in cas.iter_mut() {
            if ca.status == CaStatus::Active {
                ca.status = CaStatus::Retired;
                retired = Some(ca.id.clone());
            }
        }
        cas[target].status = CaStatus::Active;
        let summary = cas[target].summary();
        drop(cas);

        info!(
            ca_id = %summary.id,
            retired = retired.as_deref().unwrap_or("-"),
            "CA rotation activated"
        );
        audit::emit(&AuditEvent::ca("ca.activated", &summary.id, retired));
        Ok(summary)
    }

    /// Revoke a CA. Certificates chaining to it stop verifying immediately.
    ///
    /// Revoking an already-revoked CA succeeds without change.
    ///
    /// # Errors
    ///
    /// `CaNotFound` for an unknown id.
    pub fn revoke(&self, id: &str) -> Result<CaSummary> {
        let mut cas = self.cas.write();
        let ca = cas
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| Error::CaNotFound(id.to_string()))?;
        if ca.status == CaStatus::Revoked {
            return Ok(ca.summary());
        }
        let was_active = ca.status == CaStatus::Active;
        ca.status = CaStatus::Revoked;
        let summary = ca.summary();
        drop(cas);

        if was_active {
            warn!(ca_id = %id, "Active CA revoked; issuance disabled until a pending CA is activated");
        } else {
            info!(ca_id = %id, "CA revoked");
        }
        audit::emit(&AuditEvent::ca("ca.revoked", id, None));
        Ok(summary)
    }

    /// Fingerprint of the active CA.
    ///
    /// # Errors
    ///
    /// `NoActiveCa` if none is active.
    pub fn fingerprint(&self) -> Result<String> {
        self.cas
            .read()
            .iter()
            .find(|c| c.status == CaStatus::Active)
            .map(|c| c.fingerprint.clone())
            .ok_or(Error::NoActiveCa)
    }

    /// All CAs, oldest first.
    #[must_use]
    pub fn list(&self) -> Vec<CaSummary> {
        self.cas.read().iter().map(CertificateAuthority::summary).collect()
    }

    /// Number of CAs in `active` status (0 or 1).
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.cas
            .read()
            .iter()
            .filter(|c| c.status == CaStatus::Active)
            .count()
    }

    /// PEM of every CA that still verifies, active first, then retired.
    #[must_use]
    pub fn trust_bundle(&self) -> String {
        let cas = self.cas.read();
        let active = cas.iter().filter(|c| c.status == CaStatus::Active);
        let retired = cas.iter().filter(|c| c.status == CaStatus::Retired);
        active
            .chain(retired)
            .map(|c| c.cert_pem.trim_end())
            .collect::<Vec<_>>()
            .join("\n")
            + "\n"
    }

    /// Certificate and key of the active CA, for exporting to disk.
    ///
    /// # Errors
    ///
    /// `NoActiveCa` if none is active.
    pub fn active_pem_pair(&self) -> Result<(String, SecretPem)> {
        let m = self.signing_material()?;
        Ok((m.cert_pem, m.key))
    }

    /// Signing material of the active CA. Never falls back to another status.
    pub(crate) fn signing_material(&self) -> Result<SigningMaterial> {
        self.cas
            .read()
            .iter()
            .find(|c| c.status == CaStatus::Active)
            .map(|c| SigningMaterial {
                ca_id: c.id.clone(),
                cert_pem: c.cert_pem.clone(),
                key: c.key.clone(),
            })
            .ok_or(Error::NoActiveCa)
    }

    /// Record a revoked leaf serial (lowercase hex).
    pub(crate) fn mark_revoked(&self, serial: &str) {
        self.revoked_serials.write().insert(serial.to_ascii_lowercase());
    }

    /// Verify a leaf certificate.
    ///
    /// True when the certificate is within its validity period, its serial is
    /// not revoked, and its signature chains to a CA whose status is `active`
    /// or `retired`.
    #[must_use]
    pub fn verify(&self, cert_pem: &str) -> bool {
        let Ok((_, pem)) = parse_x509_pem(cert_pem.as_bytes()) else {
            return false;
        };
        let Ok(leaf) = pem.parse_x509() else {
            return false;
        };

        if !leaf.validity().is_valid() {
            return false;
        }
        let serial = hex::encode(leaf.raw_serial());
        if self.revoked_serials.read().contains(&serial) {
            return false;
        }

        let cas = self.cas.read();
        cas.iter()
            .filter(|ca| ca.status.verifies())
            .any(|ca| chains_to(&leaf, &ca.cert_der))
    }

    fn generate(&self, status: CaStatus) -> Result<CertificateAuthority> {
        let id = uuid::Uuid::new_v4().to_string();
        let key_pair = self.algorithm.generate()?;

        let (not_before, nb) = keys::now_pair()?;
        let (not_after, na) = keys::expiry_pair(not_before, self.validity)?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        // The id keeps subjects unique across rotations.
        dn.push(DnType::CommonName, format!("{} {}", self.common_name, &id[..8]));
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.not_before = nb;
        params.not_after = na;
        params.serial_number = Some(keys::random_serial().0);

        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| Error::Crypto(format!("CA cert generation failed: {e}")))?;

        Ok(CertificateAuthority {
            id,
            status,
            fingerprint: keys::fingerprint(cert.der()),
            not_before,
            not_after,
            cert_pem: cert.pem(),
            cert_der: cert.der().to_vec(),
            key: SecretPem::new(key_pair.serialize_pem()),
        })
    }
}

/// Issuer name matches the CA subject (compared in RFC 4514 form, so string
/// encodings may differ) and the signature verifies under the CA public key.
fn chains_to(leaf: &X509Certificate<'_>, ca_der: &[u8]) -> bool {
    let Ok((_, ca)) = X509Certificate::from_der(ca_der) else {
        return false;
    };
    leaf.issuer().to_string() == ca.subject().to_string()
        && leaf.verify_signature(Some(ca.public_key())).is_ok()
}

fn asn1_to_chrono(unix_secs: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(unix_secs, 0)
        .ok_or_else(|| Error::Crypto("certificate validity out of range".to_string()))
}
