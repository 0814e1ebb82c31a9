//! Per-session credential minting and revocation.
//!
//! Every issued certificate leaves an [`IssuedCertificate`] record indexed by
//! serial. Revocation flips the record and tells the CA engine. Records are
//! never removed; they stay for audit.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, Issuer, KeyPair,
    KeyUsagePurpose,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::audit::{self, AuditEvent};
use super::authority::CaEngine;
use super::keys::{self, KeyAlgorithm, SecretPem};
use crate::{Error, Result};

/// What a certificate is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CertUsage {
    /// Tunnel client session
    Client,
    /// Enforcement point server
    Server,
}

/// Issuance record, retained after revocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedCertificate {
    /// Lowercase hex serial
    pub serial: String,
    /// Identity (certificate common name)
    pub subject: String,
    /// Enforcement point the session is bound to
    pub enforcement_point: String,
    /// Client or server
    pub usage: CertUsage,
    /// SHA-256 over the DER
    pub fingerprint: String,
    /// Start of validity
    pub not_before: DateTime<Utc>,
    /// End of validity
    pub not_after: DateTime<Utc>,
    /// CA that signed it
    pub issuing_ca: String,
    /// Revoked flag
    pub revoked: bool,
    /// When it was revoked
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<DateTime<Utc>>,
    /// Why it was revoked
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revocation_reason: Option<String>,
}

/// A freshly signed certificate with its private key.
#[derive(Clone)]
pub struct IssuedCredential {
    /// The stored record
    pub record: IssuedCertificate,
    /// PEM certificate
    pub cert_pem: String,
    /// PEM private key; only ever returned once
    pub key_pem: SecretPem,
}

impl fmt::Debug for IssuedCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedCredential")
            .field("record", &self.record)
            .finish_non_exhaustive()
    }
}

/// The certificate issuer.
pub struct CertificateIssuer {
    engine: Arc<CaEngine>,
    algorithm: KeyAlgorithm,
    records: DashMap<String, IssuedCertificate>,
}

impl CertificateIssuer {
    /// Create an issuer signing under `engine`'s active CA.
    #[must_use]
    pub fn new(engine: Arc<CaEngine>, algorithm: KeyAlgorithm) -> Self {
        Self {
            engine,
            algorithm,
            records: DashMap::new(),
        }
    }

    /// The CA engine this issuer signs under.
    #[must_use]
    pub fn engine(&self) -> &Arc<CaEngine> {
        &self.engine
    }

    /// Mint a client certificate for `identity`, bound to one enforcement
    /// point.
    ///
    /// # Errors
    ///
    /// `NoActiveCa` when no CA is active; there is no fallback to a pending
    /// or retired CA.
    pub fn issue(
        &self,
        identity: &str,
        enforcement_point: &str,
        validity: Duration,
    ) -> Result<IssuedCredential> {
        self.sign(identity, enforcement_point, validity, CertUsage::Client)
    }

    /// Mint the server certificate for an enforcement point.
    ///
    /// # Errors
    ///
    /// `NoActiveCa` when no CA is active.
    pub fn issue_server(&self, enforcement_point: &str, validity: Duration) -> Result<IssuedCredential> {
        self.sign(enforcement_point, enforcement_point, validity, CertUsage::Server)
    }

    /// Revoke a certificate by serial. Revoking twice is a no-op success.
    ///
    /// # Errors
    ///
    /// `CertificateNotFound` if the serial was never issued here.
    pub fn revoke(&self, serial: &str, reason: &str) -> Result<IssuedCertificate> {
        let serial = serial.to_ascii_lowercase();
        let mut entry = self
            .records
            .get_mut(&serial)
            .ok_or_else(|| Error::CertificateNotFound(serial.clone()))?;

        if entry.revoked {
            debug!(serial = %serial, "Certificate already revoked");
            return Ok(entry.clone());
        }

        entry.revoked = true;
        entry.revoked_at = Some(Utc::now());
        entry.revocation_reason = Some(reason.to_string());
        let record = entry.clone();
        drop(entry);

        self.engine.mark_revoked(&serial);
        info!(serial = %serial, subject = %record.subject, reason = %reason, "Certificate revoked");
        audit::emit(&AuditEvent::revoked(&serial, &record.subject, reason));
        Ok(record)
    }

    /// Revoke every non-revoked certificate of an identity. Returns how many
    /// were revoked by this call.
    pub fn revoke_identity(&self, identity: &str, reason: &str) -> usize {
        let serials: Vec<String> = self
            .records
            .iter()
            .filter(|e| e.value().subject == identity && !e.value().revoked)
            .map(|e| e.key().clone())
            .collect();

        let mut count = 0;
        for serial in serials {
            if self.revoke(&serial, reason).is_ok() {
                count += 1;
            }
        }
        count
    }

    /// Look up one record.
    #[must_use]
    pub fn get(&self, serial: &str) -> Option<IssuedCertificate> {
        self.records
            .get(&serial.to_ascii_lowercase())
            .map(|e| e.value().clone())
    }

    /// All records, optionally filtered by identity, oldest first.
    #[must_use]
    pub fn list(&self, identity: Option<&str>) -> Vec<IssuedCertificate> {
        let mut out: Vec<IssuedCertificate> = self
            .records
            .iter()
            .filter(|e| identity.is_none_or(|id| e.value().subject == id))
            .map(|e| e.value().clone())
            .collect();
        out.sort_by(|a, b| a.not_before.cmp(&b.not_before).then(a.serial.cmp(&b.serial)));
        out
    }

    fn sign(
        &self,
        subject: &str,
        enforcement_point: &str,
        validity: Duration,
        usage: CertUsage,
    ) -> Result<IssuedCredential> {
        let material = match self.engine.signing_material() {
            Ok(m) => m,
            Err(e) => {
                warn!(subject = %subject, point = %enforcement_point, "Issuance refused: no active CA");
                audit::emit(&AuditEvent::denied(subject, enforcement_point, e.to_string()));
                return Err(e);
            }
        };

        let ca_key = KeyPair::from_pem(material.key.expose())
            .map_err(|e| Error::Crypto(format!("Failed to parse CA key: {e}")))?;
        let issuer = Issuer::from_ca_cert_pem(&material.cert_pem, ca_key)
            .map_err(|e| Error::Crypto(format!("Failed to load CA for signing: {e}")))?;

        let leaf_key = self.algorithm.generate()?;
        let (not_before, nb) = keys::now_pair()?;
        let (not_after, na) = keys::expiry_pair(not_before, validity)?;
        let (serial_number, serial) = keys::random_serial();

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, subject);
        dn.push(DnType::OrganizationalUnitName, enforcement_point);
        params.distinguished_name = dn;
        params.not_before = nb;
        params.not_after = na;
        params.serial_number = Some(serial_number);
        params.use_authority_key_identifier_extension = true;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![match usage {
            CertUsage::Client => ExtendedKeyUsagePurpose::ClientAuth,
            CertUsage::Server => ExtendedKeyUsagePurpose::ServerAuth,
        }];

        let cert = params
            .signed_by(&leaf_key, &issuer)
            .map_err(|e| Error::Crypto(format!("Leaf cert signing failed: {e}")))?;

        let record = IssuedCertificate {
            serial: serial.clone(),
            subject: subject.to_string(),
            enforcement_point: enforcement_point.to_string(),
            usage,
            fingerprint: keys::fingerprint(cert.der()),
            not_before,
            not_after,
            issuing_ca: material.ca_id,
            revoked: false,
            revoked_at: None,
            revocation_reason: None,
        };
        self.records.insert(serial.clone(), record.clone());

        audit::emit(&AuditEvent::issued(
            &serial,
            subject,
            enforcement_point,
            &record.issuing_ca,
        ));

        Ok(IssuedCredential {
            record,
            cert_pem: cert.pem(),
            key_pem: SecretPem::new(leaf_key.serialize_pem()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    fn issuer() -> CertificateIssuer {
        let engine = Arc::new(CaEngine::new(KeyAlgorithm::EcdsaP256, "Test CA", 365));
        engine.bootstrap().unwrap();
        CertificateIssuer::new(engine, KeyAlgorithm::EcdsaP256)
    }

    #[test]
    fn issue_records_and_verifies() {
        // GIVEN: an issuer with an active CA
        let issuer = issuer();

        // WHEN: issuing a client certificate
        let cred = issuer.issue("alice", "gw-eu", HOUR).unwrap();

        // THEN: PEMs are present, the record is stored, and it verifies
        assert!(cred.cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(cred.key_pem.expose().contains("PRIVATE KEY"));
        assert_eq!(cred.record.usage, CertUsage::Client);
        assert_eq!(issuer.get(&cred.record.serial).unwrap(), cred.record);
        assert_eq!((cred.record.not_after - cred.record.not_before).num_seconds(), 3600);
        assert!(issuer.engine().verify(&cred.cert_pem));
    }

    #[test]
    fn issue_without_active_ca_fails_closed() {
        // GIVEN: active CA revoked, one pending CA waiting
        let issuer = issuer();
        let active = issuer.engine().list()[0].id.clone();
        issuer.engine().prepare_rotation().unwrap();
        issuer.engine().revoke(&active).unwrap();

        // WHEN: issuing
        let result = issuer.issue("alice", "gw-eu", HOUR);

        // THEN: NoActiveCa, no silent fallback to the pending CA
        assert!(matches!(result, Err(Error::NoActiveCa)));
        assert!(issuer.list(None).is_empty());
    }

    #[test]
    fn revoke_is_idempotent_and_blocks_verify() {
        let issuer = issuer();
        let cred = issuer.issue("alice", "gw-eu", HOUR).unwrap();

        let first = issuer.revoke(&cred.record.serial, "lost laptop").unwrap();
        let second = issuer.revoke(&cred.record.serial, "again").unwrap();

        assert!(first.revoked);
        assert_eq!(second.revocation_reason.as_deref(), Some("lost laptop"));
        assert!(!issuer.engine().verify(&cred.cert_pem));
        // record retained for audit
        assert_eq!(issuer.list(Some("alice")).len(), 1);
    }

    #[test]
    fn revoke_unknown_serial_is_not_found() {
        let issuer = issuer();
        assert!(matches!(
            issuer.revoke("deadbeef", "x"),
            Err(Error::CertificateNotFound(_))
        ));
    }

    #[test]
    fn revoke_identity_counts_only_live_certs() {
        let issuer = issuer();
        let a1 = issuer.issue("alice", "gw-eu", HOUR).unwrap();
        issuer.issue("alice", "gw-us", HOUR).unwrap();
        issuer.issue("bob", "gw-eu", HOUR).unwrap();
        issuer.revoke(&a1.record.serial, "rotated").unwrap();

        assert_eq!(issuer.revoke_identity("alice", "offboarding"), 1);
        assert_eq!(issuer.revoke_identity("alice", "offboarding"), 0);
        assert!(issuer.list(Some("bob")).iter().all(|c| !c.revoked));
    }

    #[test]
    fn server_cert_has_server_usage() {
        let issuer = issuer();
        let cred = issuer.issue_server("gw-eu", HOUR).unwrap();
        assert_eq!(cred.record.usage, CertUsage::Server);
        assert_eq!(cred.record.subject, "gw-eu");
        assert!(issuer.engine().verify(&cred.cert_pem));
    }

    #[test]
    fn credential_debug_hides_key() {
        let issuer = issuer();
        let cred = issuer.issue("alice", "gw-eu", HOUR).unwrap();
        assert!(!format!("{cred:?}").contains("PRIVATE KEY"));
    }

    #[test]
    fn ed25519_issuance_verifies() {
        let engine = Arc::new(CaEngine::new(KeyAlgorithm::Ed25519, "Ed CA", 30));
        engine.bootstrap().unwrap();
        let issuer = CertificateIssuer::new(Arc::clone(&engine), KeyAlgorithm::Ed25519);

        let cred = issuer.issue("carol", "hub-1", HOUR).unwrap();
        assert!(engine.verify(&cred.cert_pem));
    }
}
