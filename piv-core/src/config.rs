//! Ambient configuration threaded through the enumerator and box sealing,
//! replacing the compiled-in constants a C driver would use (`SPEC_FULL.md`
//! §3, §4.E).

use crate::crypto_provider::AeadCipher;
use crate::transport::Protocol;

/// Tunables for connecting to readers and sealing boxes.
#[derive(Debug, Clone)]
pub struct PivConfig {
    /// Protocol preference order offered at `connect` time.
    pub preferred_protocols: Vec<Protocol>,
    /// PC/SC connect/transmit timeout. Only consulted by transport
    /// implementations that support timeouts; the in-tree `pcsc` backend
    /// uses the daemon's default and does not read this field, but it is
    /// threaded through so a timeout-aware transport can.
    pub connect_timeout_ms: u32,
    /// Default cipher for `seal_offline` when the caller leaves the box's
    /// cipher unset.
    pub default_cipher: AeadCipher,
    /// Default hash for the box KDF when the caller leaves it unset.
    pub default_kdf: crate::crypto_provider::HashAlg,
}

impl Default for PivConfig {
    fn default() -> Self {
        Self {
            preferred_protocols: vec![Protocol::T0, Protocol::T1],
            connect_timeout_ms: 5000,
            default_cipher: AeadCipher::ChaCha20Poly1305,
            default_kdf: crate::crypto_provider::HashAlg::Sha512,
        }
    }
}
