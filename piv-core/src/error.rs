//! Unified error type for the PIV core.
//!
//! One variant per error kind from the protocol's status-word mapping
//! (see the crate-level documentation for the authoritative table).

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, PivError>;

/// Errors surfaced by the PIV core.
#[derive(Debug, Error)]
pub enum PivError {
    /// Transport failure talking to the reader or card.
    #[error("transport I/O error: {0}")]
    Io(String),

    /// No such object, slot, file, or token.
    #[error("not found: {0}")]
    NoEnt(String),

    /// Card capability missing, or a format this crate deliberately does
    /// not support (e.g. compressed or gzip certificates).
    #[error("not supported: {0}")]
    NotSup(String),

    /// Malformed input, or a status word that does not fit any other kind.
    #[error("invalid: {0}")]
    Invalid(String),

    /// Security status not satisfied: PIN or admin authentication missing.
    #[error("permission denied: {0}")]
    Perm(String),

    /// Bad PIN or bad admin key.
    #[error("access denied: {0}")]
    Access(String),

    /// Too few PIN retries remain to safely attempt verification.
    #[error("too few retries remaining ({retries} left)")]
    Again {
        /// Retries remaining as reported by the card.
        retries: u8,
    },

    /// Card or host out of memory.
    #[error("out of memory: {0}")]
    NoMem(String),

    /// AEAD authentication tag failed to verify.
    #[error("authentication failed (bad message)")]
    BadMsg,
}

impl PivError {
    /// Map a raw ISO-7816 status word to a [`PivError`] per the
    /// authoritative table, for the "generic" status checks that most PIV
    /// instructions share. Instructions with bespoke mappings (e.g.
    /// `auth_admin`'s `6A80` -> `EACCES`) build their own `PivError`
    /// directly instead of calling this helper.
    pub(crate) fn from_status(sw: u16, context: &str) -> Self {
        match sw {
            0x9000 => unreachable!("from_status must not be called on success"),
            0x6A80 => PivError::Invalid(format!("{context}: wrong data (6A80)")),
            0x6A81 => PivError::NoEnt(format!("{context}: function not supported (6A81)")),
            0x6A82 => PivError::NoEnt(format!("{context}: file not found (6A82)")),
            0x6A84 => PivError::NoMem(format!("{context}: out of memory (6A84)")),
            0x6A86 => PivError::NoEnt(format!("{context}: incorrect P1/P2 (6A86)")),
            0x6982 => PivError::Perm(format!("{context}: security status not satisfied (6982)")),
            sw if sw & 0xFFF0 == 0x63C0 => PivError::Access(format!(
                "{context}: verify failed, {} tries left",
                sw & 0x000F
            )),
            sw => PivError::Invalid(format!("{context}: unexpected status word {sw:04X}")),
        }
    }
}
