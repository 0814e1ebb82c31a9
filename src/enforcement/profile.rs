//! Cipher directives for each [`CryptoProfile`].
//!
//! The same lines go into the server configuration and into every client
//! configuration issued for that enforcement point, so both ends always
//! negotiate from the same list.

use ztgate_proto::CryptoProfile;

const MODERN: &[&str] = &[
    "data-ciphers AES-256-GCM:CHACHA20-POLY1305",
    "auth SHA256",
    "tls-version-min 1.2",
    "tls-cipher TLS-ECDHE-ECDSA-WITH-AES-256-GCM-SHA384:TLS-ECDHE-ECDSA-WITH-CHACHA20-POLY1305-SHA256",
    "tls-ciphersuites TLS_AES_256_GCM_SHA384:TLS_CHACHA20_POLY1305_SHA256",
];

const FIPS: &[&str] = &[
    "data-ciphers AES-256-GCM:AES-128-GCM",
    "auth SHA256",
    "tls-version-min 1.2",
    "tls-cipher TLS-ECDHE-ECDSA-WITH-AES-256-GCM-SHA384:TLS-ECDHE-ECDSA-WITH-AES-128-GCM-SHA256",
    "tls-ciphersuites TLS_AES_256_GCM_SHA384:TLS_AES_128_GCM_SHA256",
];

const COMPATIBLE: &[&str] = &[
    "data-ciphers AES-256-GCM:AES-128-GCM:CHACHA20-POLY1305:AES-256-CBC",
    "data-ciphers-fallback AES-256-CBC",
    "auth SHA256",
    "tls-version-min 1.2",
];

/// Configuration lines selecting the profile's ciphers.
#[must_use]
pub fn directives(profile: CryptoProfile) -> &'static [&'static str] {
    match profile {
        CryptoProfile::Modern => MODERN,
        CryptoProfile::Fips => FIPS,
        CryptoProfile::Compatible => COMPATIBLE,
    }
}
