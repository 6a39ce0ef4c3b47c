//! RAII transaction guard bracketing card access (`spec.md` §4.C).

use crate::error::Result;
use crate::transport::CardHandle;

/// Anything that owns a card handle and can lend it out for the duration of
/// a transaction. Implemented for any [`CardHandle`] directly (the identity
/// case, used by this module's own tests) and for [`crate::piv::Token`],
/// which additionally carries the cached metadata a PIV operation reads and
/// updates while the transaction is open.
pub trait HasHandle {
    type Handle: CardHandle;
    fn handle_mut(&mut self) -> &mut Self::Handle;
}

impl<H: CardHandle> HasHandle for H {
    type Handle = H;
    fn handle_mut(&mut self) -> &mut H {
        self
    }
}

/// Holds a card's transaction open for its lifetime and ends it on drop.
///
/// Mirrors `ykpiv.rs`'s `Transaction<'tx>`: callers reach the card only
/// through [`TokenTransaction::handle`], so a transaction can never be used
/// after it has been released. Operations that change card security state
/// (PIN verification, admin authentication) call
/// [`TokenTransaction::mark_reset`] so the reader resets the card on
/// release, matching the C driver's behavior of forcing re-selection of the
/// PIV application after either.
pub struct TokenTransaction<'t, T: HasHandle> {
    target: &'t mut T,
    reset_on_drop: bool,
    ended: bool,
}

impl<'t, T: HasHandle> TokenTransaction<'t, T> {
    /// Begin a transaction on `target`. Propagates the handle's error if the
    /// reader is already locked by another process.
    pub fn begin(target: &'t mut T) -> Result<Self> {
        target.handle_mut().begin_txn()?;
        Ok(Self {
            target,
            reset_on_drop: false,
            ended: false,
        })
    }

    /// Borrow the underlying card handle to issue APDUs.
    pub fn handle(&mut self) -> &mut T::Handle {
        self.target.handle_mut()
    }

    /// Borrow the transaction's target (e.g. the [`crate::piv::Token`]) for
    /// reading or updating cached metadata alongside issuing APDUs.
    pub fn target(&mut self) -> &mut T {
        self.target
    }

    /// Request that the card be reset when this transaction ends, because
    /// the operation just performed altered PIV security state.
    pub fn mark_reset(&mut self) {
        self.reset_on_drop = true;
    }

    /// End the transaction early and report any failure, instead of
    /// deferring to `Drop` (which can only log, never return `Result`).
    pub fn end(mut self) -> Result<()> {
        self.end_inner()
    }

    fn end_inner(&mut self) -> Result<()> {
        if self.ended {
            return Ok(());
        }
        self.ended = true;
        self.target.handle_mut().end_txn(self.reset_on_drop)
    }
}

impl<'t, T: HasHandle> Drop for TokenTransaction<'t, T> {
    fn drop(&mut self) {
        if !self.ended {
            if let Err(e) = self.end_inner() {
                tracing::warn!(error = %e, "failed to end card transaction on drop");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Matcher, ScriptedCard};

    #[test]
    fn drop_ends_transaction_without_reset() {
        let mut card = ScriptedCard::from_script(vec![(
            Matcher::Exact(vec![0x00, 0xA4, 0x04, 0x00]),
            vec![0x90, 0x00],
        )]);
        {
            let mut txn = TokenTransaction::begin(&mut card).unwrap();
            let h = txn.handle();
            h.transmit(&[0x00, 0xA4, 0x04, 0x00]).unwrap();
        }
        // transaction ended without panicking on a mismatched begin/end pair
    }

    #[test]
    fn mark_reset_propagates_to_end_txn() {
        let mut card = ScriptedCard::from_script(vec![]);
        let mut txn = TokenTransaction::begin(&mut card).unwrap();
        txn.mark_reset();
        txn.end().unwrap();
    }
}
