//! Token enumerator (`spec.md` §4.E): walk readers, open, probe, build
//! token objects.

use crate::config::PivConfig;
use crate::error::{PivError, Result};
use crate::piv::{probe_yubico, read_chuid, select, Slot, SlotId, Token};
use crate::transaction::TokenTransaction;
use crate::transport::{CardContext, CardHandle};

fn enumerate_one<H: CardHandle>(txn: &mut TokenTransaction<'_, Token<H>>) -> Result<()> {
    if let Err(e) = select(txn) {
        txn.mark_reset();
        return Err(e);
    }
    match read_chuid(txn) {
        Ok(()) => {}
        Err(PivError::NoEnt(_)) => {
            txn.target().no_chuid = true;
        }
        Err(e) => {
            txn.mark_reset();
            return Err(e);
        }
    }
    match probe_yubico(txn) {
        Ok(()) | Err(PivError::NotSup(_)) => {}
        Err(e) => {
            txn.mark_reset();
            return Err(e);
        }
    }
    Ok(())
}

/// `enumerate(ctx)` — `spec.md` §4.E. Returns tokens owned in a `Vec`
/// (`spec.md` §9's ownership redesign) rather than the source's intrusive
/// singly-linked list; order is most-recently-opened first, matching the
/// original return order.
pub fn enumerate<C: CardContext>(ctx: &C, config: &PivConfig) -> Result<Vec<Token<C::Handle>>> {
    let mut tokens = Vec::new();
    for reader in ctx.list_readers()? {
        let handle = match ctx.connect(&reader, &config.preferred_protocols) {
            Ok(h) => h,
            Err(e) => {
                tracing::debug!(reader = %reader, error = %e, "skipping reader with no connectable card");
                continue;
            }
        };
        let protocol = handle.protocol();
        let mut token = Token::new(reader.clone(), handle, protocol);

        let outcome = match token.begin_txn() {
            Ok(mut txn) => enumerate_one(&mut txn),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => tokens.push(token),
            Err(e) => tracing::warn!(reader = %reader, error = %e, "dropping card that failed PIV enumeration"),
        }
    }
    tokens.reverse();
    Ok(tokens)
}

/// `release(list)` — `spec.md` §4.E. Disconnects every token, leaving each
/// card powered (no reset). The borrow checker already enforces "never
/// release a token while in-transaction": a live `TokenTransaction` holds
/// the only path to a token's handle, so a token cannot be moved into this
/// function while one is outstanding.
pub fn release<H: CardHandle>(tokens: Vec<Token<H>>) -> Result<()> {
    for token in tokens {
        token.disconnect()?;
    }
    Ok(())
}

/// `get_slot(token, slot_id)` — `spec.md` §4.E.
pub fn get_slot<H: CardHandle>(token: &Token<H>, slot_id: SlotId) -> Option<&Slot> {
    token.slot(slot_id)
}
