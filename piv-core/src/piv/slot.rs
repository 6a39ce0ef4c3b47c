//! PIV key slots (`spec.md` §3 "Slot").

use crate::error::{PivError, Result};
use crate::piv::algorithm::Algorithm;
use crate::sshkey::EcPublicKey;
use crate::x509::ParsedPublicKey;

/// A PIV key slot identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotId {
    Authentication,
    Signature,
    KeyManagement,
    CardAuthentication,
}

impl SlotId {
    pub fn wire_id(self) -> u8 {
        match self {
            SlotId::Authentication => 0x9a,
            SlotId::Signature => 0x9c,
            SlotId::KeyManagement => 0x9d,
            SlotId::CardAuthentication => 0x9e,
        }
    }

    pub fn from_wire_id(id: u8) -> Result<Self> {
        match id {
            0x9a => Ok(SlotId::Authentication),
            0x9c => Ok(SlotId::Signature),
            0x9d => Ok(SlotId::KeyManagement),
            0x9e => Ok(SlotId::CardAuthentication),
            other => Err(PivError::Invalid(format!("not a PIV key slot id: {other:#04x}"))),
        }
    }

    /// The `GET DATA`/`PUT DATA` object id carrying this slot's certificate.
    pub fn cert_object_id(self) -> [u8; 3] {
        match self {
            SlotId::Authentication => [0x5F, 0xC1, 0x05],
            SlotId::Signature => [0x5F, 0xC1, 0x0A],
            SlotId::KeyManagement => [0x5F, 0xC1, 0x0B],
            SlotId::CardAuthentication => [0x5F, 0xC1, 0x01],
        }
    }

    /// `read_all_certs`'s fixed read order (`spec.md` §4.D).
    pub const READ_ORDER: [SlotId; 4] = [
        SlotId::CardAuthentication,
        SlotId::Authentication,
        SlotId::Signature,
        SlotId::KeyManagement,
    ];
}

/// Cached certificate/public-key material for one slot (`spec.md` §3).
#[derive(Debug, Clone)]
pub struct Slot {
    pub id: SlotId,
    pub algorithm: Algorithm,
    pub certificate_der: Vec<u8>,
    pub subject: String,
    pub public_key: ParsedPublicKey,
    pub ssh_public_key: Option<EcPublicKey>,
}
