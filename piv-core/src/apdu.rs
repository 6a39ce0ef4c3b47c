//! APDU framing, single-shot transceive, and ISO-7816 command/response
//! chaining.

use crate::error::{PivError, Result};
use crate::transport::CardHandle;

/// Command-chaining CLA bit (`spec.md` §4.B).
const CLA_CHAIN: u8 = 0x10;
/// GET RESPONSE instruction used to continue response chaining.
const INS_CONTINUE: u8 = 0xC0;
/// Maximum command-body bytes per wire block (short-form APDUs only).
const MAX_BLOCK: usize = 255;

/// A request/response APDU pair.
///
/// Unlike the C original, the command body here is an owned `Vec<u8>`
/// rather than an offset/length view into a larger buffer — Rust's
/// ownership makes the copy-avoidance trick unnecessary for chaining,
/// which instead slices the owned `Vec` directly (see
/// [`transceive_chain`]).
#[derive(Debug, Clone)]
pub struct Apdu {
    pub cla: u8,
    pub ins: u8,
    pub p1: u8,
    pub p2: u8,
    pub data: Vec<u8>,
    /// Reply body, populated after a successful transceive (status word
    /// stripped).
    pub reply: Vec<u8>,
    /// Status word from the most recent transceive.
    pub sw: u16,
}

impl Apdu {
    /// Allocate a new APDU with an empty command body.
    pub fn new(cla: u8, ins: u8, p1: u8, p2: u8) -> Self {
        Self {
            cla,
            ins,
            p1,
            p2,
            data: Vec::new(),
            reply: Vec::new(),
            sw: 0,
        }
    }

    /// Builder-style helper to attach a command body in one line, in the
    /// style of `yubikey-piv.rs`'s `APDU::new(ins).p1(..).data(..)`.
    pub fn with_data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.data = data.into();
        self
    }

    /// True if the last transceive returned `9000`.
    pub fn is_success(&self) -> bool {
        self.sw == 0x9000
    }

    /// Serialize `CLA INS P1 P2 [Lc data]`. `Lc` is omitted (implicit 0)
    /// when the body is empty. Extended-length APDUs are never emitted;
    /// callers must keep `data.len() <= 255` per block (chaining handles
    /// larger bodies by splitting, see [`transceive_chain`]).
    pub fn to_wire(&self) -> Result<Vec<u8>> {
        if self.data.len() > MAX_BLOCK {
            return Err(PivError::Invalid(
                "apdu: command body exceeds 255 bytes for a single wire block".into(),
            ));
        }
        let mut wire = Vec::with_capacity(5 + self.data.len());
        wire.push(self.cla);
        wire.push(self.ins);
        wire.push(self.p1);
        wire.push(self.p2);
        if !self.data.is_empty() {
            wire.push(self.data.len() as u8);
            wire.extend_from_slice(&self.data);
        }
        Ok(wire)
    }

    /// Parse a wire-format command back into its fields (used by tests
    /// that assert the §8 APDU round-trip property).
    pub fn from_wire(wire: &[u8]) -> Result<(u8, u8, u8, u8, Vec<u8>)> {
        if wire.len() < 4 {
            return Err(PivError::Invalid("apdu: wire too short".into()));
        }
        let (cla, ins, p1, p2) = (wire[0], wire[1], wire[2], wire[3]);
        if wire.len() == 4 {
            return Ok((cla, ins, p1, p2, Vec::new()));
        }
        let lc = wire[4] as usize;
        let body = wire.get(5..5 + lc).ok_or_else(|| {
            PivError::Invalid("apdu: declared Lc exceeds wire buffer".into())
        })?;
        Ok((cla, ins, p1, p2, body.to_vec()))
    }
}

/// Split a raw reply into body and status word. The status word is always
/// the trailing two bytes.
fn split_reply(raw: &[u8]) -> Result<(Vec<u8>, u16)> {
    if raw.len() < 2 {
        return Err(PivError::Io("apdu: reply shorter than a status word".into()));
    }
    let (body, sw_bytes) = raw.split_at(raw.len() - 2);
    let sw = u16::from_be_bytes([sw_bytes[0], sw_bytes[1]]);
    Ok((body.to_vec(), sw))
}

/// Send a single APDU (no chaining) and populate `apdu.reply`/`apdu.sw`.
///
/// Command chaining and response continuation both require the card to be
/// mid-transaction; callers that need either should use
/// [`transceive_chain`] instead, which also handles the single-shot case.
pub fn transceive(handle: &mut dyn CardHandle, apdu: &mut Apdu) -> Result<()> {
    let wire = apdu.to_wire()?;
    let result = handle.transmit(&wire);
    // The command buffer may have carried a PIN or admin-key challenge;
    // wipe it regardless of outcome so a failed transmit never leaves
    // sensitive bytes sitting in a reusable buffer.
    let mut wire = wire;
    zeroize::Zeroize::zeroize(&mut wire);
    let raw = result?;
    let (body, sw) = split_reply(&raw)?;
    apdu.reply = body;
    apdu.sw = sw;
    Ok(())
}

/// Status-word high bytes that mean "keep chaining" for command chaining:
/// success, bytes-remaining, and the two warning classes.
fn continues_chaining(sw: u16) -> bool {
    matches!(sw >> 8, 0x90 | 0x61 | 0x62 | 0x63)
}

/// Send `apdu`, splitting its command body into ≤255-byte blocks with the
/// `CLA_CHAIN` bit set on all but the last (command chaining), then
/// reassemble any `61xx` response continuation via `GET RESPONSE` into a
/// single contiguous reply (response chaining).
pub fn transceive_chain(handle: &mut dyn CardHandle, apdu: &mut Apdu) -> Result<()> {
    let mut offset = 0usize;
    let total = apdu.data.len();
    let mut reply = Vec::new();
    let mut sw;

    loop {
        let remaining = total - offset;
        let this_len = remaining.min(MAX_BLOCK);
        let more_to_come = offset + this_len < total;
        let cla = if more_to_come {
            apdu.cla | CLA_CHAIN
        } else {
            apdu.cla & !CLA_CHAIN
        };

        let block = Apdu {
            cla,
            ins: apdu.ins,
            p1: apdu.p1,
            p2: apdu.p2,
            data: apdu.data[offset..offset + this_len].to_vec(),
            reply: Vec::new(),
            sw: 0,
        };
        let wire = block.to_wire()?;
        let raw = handle.transmit(&wire)?;
        let (body, this_sw) = split_reply(&raw)?;
        sw = this_sw;

        if more_to_come {
            if !continues_chaining(sw) {
                apdu.sw = sw;
                apdu.reply = body;
                return Ok(());
            }
        } else if !body.is_empty() {
            reply.extend_from_slice(&body);
        }

        offset += this_len;
        if offset >= total {
            break;
        }
    }

    // Response chaining: while the status word's high byte is 0x61 (bytes
    // remaining), issue GET RESPONSE and append each block.
    while sw >> 8 == 0x61 {
        let cont = Apdu::new(apdu.cla & !CLA_CHAIN, INS_CONTINUE, 0, 0);
        let wire = cont.to_wire()?;
        let raw = handle.transmit(&wire)?;
        let (body, this_sw) = split_reply(&raw)?;
        reply.extend_from_slice(&body);
        sw = this_sw;
    }

    apdu.reply = reply;
    apdu.sw = sw;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedCard;
    use proptest::prelude::*;

    #[test]
    fn wire_round_trip_empty_body() {
        let apdu = Apdu::new(0x00, 0xA4, 0x04, 0x00);
        let wire = apdu.to_wire().unwrap();
        assert_eq!(wire, vec![0x00, 0xA4, 0x04, 0x00]);
        let (cla, ins, p1, p2, body) = Apdu::from_wire(&wire).unwrap();
        assert_eq!((cla, ins, p1, p2), (0x00, 0xA4, 0x04, 0x00));
        assert!(body.is_empty());
    }

    #[test]
    fn wire_round_trip_with_body() {
        let apdu = Apdu::new(0x00, 0x20, 0x00, 0x80).with_data(vec![1, 2, 3, 4]);
        let wire = apdu.to_wire().unwrap();
        assert_eq!(wire, vec![0x00, 0x20, 0x00, 0x80, 0x04, 1, 2, 3, 4]);
        let (.., body) = Apdu::from_wire(&wire).unwrap();
        assert_eq!(body, vec![1, 2, 3, 4]);
    }

    #[test]
    fn chaining_equivalence_against_mock() {
        // A body bigger than 255 bytes must be split into CLA_CHAIN blocks;
        // the mock accepts them and returns a chained 0x61xx response that
        // must be reassembled identically to a direct single-shot transfer.
        let body: Vec<u8> = (0u32..600).map(|i| (i % 256) as u8).collect();
        let mut card = ScriptedCard::accept_chained_command_and_chunk_reply(body.clone(), 300);
        let mut apdu = Apdu::new(0x00, 0xDB, 0x3F, 0xFF).with_data(body);
        transceive_chain(&mut card, &mut apdu).unwrap();
        assert!(apdu.is_success());
        assert_eq!(apdu.reply.len(), 300);
        assert!(apdu.reply.iter().enumerate().all(|(i, &b)| b == (i % 256) as u8));
    }

    proptest! {
        #[test]
        fn apdu_round_trip_prop(cla in any::<u8>(), ins in any::<u8>(), p1 in any::<u8>(), p2 in any::<u8>(),
                                 body in proptest::collection::vec(any::<u8>(), 0..255)) {
            let apdu = Apdu::new(cla, ins, p1, p2).with_data(body.clone());
            let wire = apdu.to_wire().unwrap();
            let (c, i, p_1, p_2, b) = Apdu::from_wire(&wire).unwrap();
            prop_assert_eq!((c, i, p_1, p_2), (cla, ins, p1, p2));
            prop_assert_eq!(b, body);
        }
    }
}
