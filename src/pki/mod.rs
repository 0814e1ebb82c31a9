//! Certificate authority engine and certificate issuer.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`authority`] | CA lifecycle: prepare, activate, revoke, verify |
//! | [`issuer`] | Per-session client and server certificates |
//! | [`keys`] | Key algorithms, serials, fingerprints, PEM IO |
//! | [`audit`] | Structured audit events |

pub mod audit;
pub mod authority;
pub mod issuer;
pub mod keys;

pub use authority::{CaEngine, CaStatus, CaSummary};
pub use issuer::{CertUsage, CertificateIssuer, IssuedCertificate, IssuedCredential};
pub use keys::{KeyAlgorithm, SecretPem};
