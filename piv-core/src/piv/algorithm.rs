//! PIV algorithm identifiers (`spec.md` §4.D `generate`/`sign`).

use crate::error::{PivError, Result};

/// Wire algorithm IDs (`GEN ASYMMETRIC`'s `AC 03 80 01 <alg>` body, and the
/// `ALGS` list returned by `select`).
pub const ALG_ID_3DES: u8 = 0x03;
pub const ALG_ID_RSA1024: u8 = 0x06;
pub const ALG_ID_RSA2048: u8 = 0x07;
pub const ALG_ID_ECCP256: u8 = 0x11;
pub const ALG_ID_ECCP384: u8 = 0x14;
/// Yubico extension algorithm IDs selecting card-side SHA-1/SHA-256 hashing
/// for a P-256 signature (`spec.md` §4.D "card-side hashing shortcut").
pub const ALG_ID_ECCP256_SHA1: u8 = 0xF0;
pub const ALG_ID_ECCP256_SHA256: u8 = 0xF1;

/// The key algorithm held in a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    Rsa1024,
    Rsa2048,
    EccP256,
    EccP384,
}

impl Algorithm {
    pub fn wire_id(self) -> u8 {
        match self {
            Algorithm::Rsa1024 => ALG_ID_RSA1024,
            Algorithm::Rsa2048 => ALG_ID_RSA2048,
            Algorithm::EccP256 => ALG_ID_ECCP256,
            Algorithm::EccP384 => ALG_ID_ECCP384,
        }
    }

    pub fn from_wire_id(id: u8) -> Result<Self> {
        match id {
            ALG_ID_RSA1024 => Ok(Algorithm::Rsa1024),
            ALG_ID_RSA2048 => Ok(Algorithm::Rsa2048),
            ALG_ID_ECCP256 => Ok(Algorithm::EccP256),
            ALG_ID_ECCP384 => Ok(Algorithm::EccP384),
            other => Err(PivError::NotSup(format!("unrecognized algorithm id {other:#04x}"))),
        }
    }

    /// The RSA modulus size in bytes, or `None` for EC algorithms.
    pub fn rsa_modulus_len(self) -> Option<usize> {
        match self {
            Algorithm::Rsa1024 => Some(128),
            Algorithm::Rsa2048 => Some(256),
            _ => None,
        }
    }
}
