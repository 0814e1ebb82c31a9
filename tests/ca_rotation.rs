//! Dual-trust CA rotation, end to end through the CA engine and the issuer.

use std::sync::Arc;
use std::time::Duration;

use ztgate::Error;
use ztgate::pki::{CaEngine, CaStatus, CertificateIssuer, KeyAlgorithm};

fn setup() -> (Arc<CaEngine>, CertificateIssuer) {
    let engine = Arc::new(CaEngine::new(KeyAlgorithm::EcdsaP256, "ztgate test CA", 30));
    engine.bootstrap().unwrap();
    let issuer = CertificateIssuer::new(Arc::clone(&engine), KeyAlgorithm::EcdsaP256);
    (engine, issuer)
}

fn status_of(engine: &CaEngine, id: &str) -> CaStatus {
    engine.list().into_iter().find(|c| c.id == id).unwrap().status
}

/// A -> B rotation: C1 survives retirement of A and dies with its revocation.
#[test]
fn test_rotation_scenario() {
    // GIVEN: CA-A active and C1 issued under it
    let (engine, issuer) = setup();
    let a = engine.list()[0].id.clone();
    let c1 = issuer.issue("alice", "gw-1", Duration::from_secs(3600)).unwrap();
    assert_eq!(c1.record.issuing_ca, a);

    // WHEN: B is prepared and activated
    let b = engine.prepare_rotation().unwrap().id;
    assert_eq!(status_of(&engine, &b), CaStatus::Pending);
    engine.activate(&b).unwrap();

    // THEN: A retired, B active, C1 still verifies
    assert_eq!(status_of(&engine, &a), CaStatus::Retired);
    assert_eq!(status_of(&engine, &b), CaStatus::Active);
    assert_eq!(engine.active_count(), 1);
    assert!(engine.verify(&c1.cert_pem));

    // AND: new issuance uses B
    let c2 = issuer.issue("bob", "gw-1", Duration::from_secs(3600)).unwrap();
    assert_eq!(c2.record.issuing_ca, b);

    // WHEN: A is revoked
    engine.revoke(&a).unwrap();

    // THEN: C1 fails, C2 unaffected
    assert!(!engine.verify(&c1.cert_pem));
    assert!(engine.verify(&c2.cert_pem));
}

/// The trust bundle carries both CAs only during the dual-trust window.
#[test]
fn test_trust_bundle_follows_rotation() {
    let (engine, _) = setup();
    let a = engine.list()[0].id.clone();
    let pem_blocks = |e: &CaEngine| e.trust_bundle().matches("BEGIN CERTIFICATE").count();
    assert_eq!(pem_blocks(&engine), 1);

    let b = engine.prepare_rotation().unwrap().id;
    assert_eq!(pem_blocks(&engine), 1, "pending CAs are not trusted");

    engine.activate(&b).unwrap();
    assert_eq!(pem_blocks(&engine), 2);

    engine.revoke(&a).unwrap();
    assert_eq!(pem_blocks(&engine), 1);
}

/// Activating anything but a pending CA is rejected without side effects.
#[test]
fn test_activate_requires_pending() {
    let (engine, _) = setup();
    let a = engine.list()[0].id.clone();
    let before = engine.list();

    let err = engine.activate(&a).unwrap_err();
    assert!(matches!(err, Error::InvalidCaTransition { .. }));
    assert_eq!(engine.list(), before);

    assert!(matches!(engine.activate("missing"), Err(Error::CaNotFound(_))));
}

/// With the only active CA revoked, issuance fails and never falls back.
#[test]
fn test_no_active_ca_blocks_issuance() {
    let (engine, issuer) = setup();
    let a = engine.list()[0].id.clone();
    engine.prepare_rotation().unwrap();
    engine.revoke(&a).unwrap();

    assert_eq!(engine.active_count(), 0);
    assert!(matches!(
        issuer.issue("alice", "gw-1", Duration::from_secs(60)),
        Err(Error::NoActiveCa)
    ));
}

/// Revoking a leaf takes effect immediately and is idempotent.
#[test]
fn test_leaf_revocation() {
    let (engine, issuer) = setup();
    let c = issuer.issue("alice", "gw-1", Duration::from_secs(3600)).unwrap();
    assert!(engine.verify(&c.cert_pem));

    issuer.revoke(&c.record.serial, "key compromise").unwrap();
    assert!(!engine.verify(&c.cert_pem));

    let again = issuer.revoke(&c.record.serial, "other").unwrap();
    assert_eq!(again.revocation_reason.as_deref(), Some("key compromise"));
}
