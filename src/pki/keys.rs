//! Key generation, certificate field helpers and PEM file IO.
//!
//! All key material is handled as PEM strings. `rcgen` does generation and
//! signing and `x509-parser` does inspection, so no external `openssl` binary
//! is needed.

use std::fmt;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rcgen::{KeyPair, SerialNumber, SignatureAlgorithm};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{Error, Result};

/// Key algorithm for CA and leaf keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum KeyAlgorithm {
    /// ECDSA over P-256 with SHA-256
    #[default]
    #[serde(rename = "ecdsa-p256")]
    EcdsaP256,
    /// ECDSA over P-384 with SHA-384
    #[serde(rename = "ecdsa-p384")]
    EcdsaP384,
    /// Ed25519
    #[serde(rename = "ed25519")]
    Ed25519,
}

impl KeyAlgorithm {
    fn signature_algorithm(self) -> &'static SignatureAlgorithm {
        match self {
            Self::EcdsaP256 => &rcgen::PKCS_ECDSA_P256_SHA256,
            Self::EcdsaP384 => &rcgen::PKCS_ECDSA_P384_SHA384,
            Self::Ed25519 => &rcgen::PKCS_ED25519,
        }
    }

    /// Generate a fresh key pair.
    ///
    /// # Errors
    ///
    /// Returns `Error::Crypto` if the crypto backend fails.
    pub fn generate(self) -> Result<KeyPair> {
        KeyPair::generate_for(self.signature_algorithm())
            .map_err(|e| Error::Crypto(format!("Failed to generate {self} key: {e}")))
    }
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::EcdsaP256 => "ecdsa-p256",
            Self::EcdsaP384 => "ecdsa-p384",
            Self::Ed25519 => "ed25519",
        })
    }
}

/// PEM private key that never shows up in `Debug` output or logs.
#[derive(Clone)]
pub struct SecretPem(String);

impl SecretPem {
    /// Wrap a PEM string.
    #[must_use]
    pub fn new(pem: String) -> Self {
        Self(pem)
    }

    /// Expose the PEM for signing or writing to disk.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretPem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretPem(<redacted>)")
    }
}

/// 128-bit random positive serial, returned with its lowercase hex form.
///
/// The top bit of the first byte is cleared and the first byte is never zero,
/// so the DER integer encoding equals the raw bytes and the hex parsed back
/// out of the certificate matches the recorded one.
#[must_use]
pub fn random_serial() -> (SerialNumber, String) {
    let mut bytes: [u8; 16] = rand::random();
    bytes[0] = (bytes[0] & 0x7f) | 0x01;
    (SerialNumber::from_slice(&bytes), hex::encode(bytes))
}

/// Lowercase hex SHA-256 over DER bytes.
#[must_use]
pub fn fingerprint(der: &[u8]) -> String {
    hex::encode(Sha256::digest(der))
}

/// Current time truncated to whole seconds, as both `chrono` and `time`
/// values (X.509 validity has second precision).
pub(crate) fn now_pair() -> Result<(DateTime<Utc>, time::OffsetDateTime)> {
    let now = Utc::now();
    let secs = now.timestamp();
    let chrono_now = DateTime::<Utc>::from_timestamp(secs, 0)
        .ok_or_else(|| Error::Internal("clock out of range".to_string()))?;
    Ok((chrono_now, to_offset(secs)?))
}

/// Add a validity period to a `chrono` timestamp and convert for `rcgen`.
pub(crate) fn expiry_pair(
    from: DateTime<Utc>,
    validity: Duration,
) -> Result<(DateTime<Utc>, time::OffsetDateTime)> {
    let delta = chrono::Duration::from_std(validity)
        .map_err(|e| Error::Config(format!("validity out of range: {e}")))?;
    let until = from
        .checked_add_signed(delta)
        .ok_or_else(|| Error::Config("validity out of range".to_string()))?;
    Ok((until, to_offset(until.timestamp())?))
}

fn to_offset(unix_secs: i64) -> Result<time::OffsetDateTime> {
    time::OffsetDateTime::from_unix_timestamp(unix_secs)
        .map_err(|e| Error::Internal(format!("Date calculation error: {e}")))
}

/// Read a PEM file into a string.
///
/// # Errors
///
/// Returns `Error::Config` if the file cannot be read.
pub fn read_pem(path: &Path) -> Result<String> {
    fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Cannot read '{}': {e}", path.display())))
}

/// Write `contents` to `path` through a temporary sibling plus rename, with
/// the given Unix permission bits, and fsync before the rename.
///
/// # Errors
///
/// Returns `Error::Io` if any step fails; the destination is untouched then.
pub fn write_atomic(path: &Path, contents: &[u8], mode: u32) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::Config(format!("'{}' has no parent directory", path.display())))?;
    fs::create_dir_all(dir)?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::Config(format!("invalid file name '{}'", path.display())))?;
    let tmp = dir.join(format!(".{file_name}.tmp"));

    {
        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(mode);
        }
        #[cfg(not(unix))]
        let _ = mode;
        let mut file = options.open(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp, fs::Permissions::from_mode(mode))?;
    }

    fs::rename(&tmp, path)?;
    Ok(())
}
