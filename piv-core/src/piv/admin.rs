//! Admin (3DES challenge-response) authentication and PIN management
//! (`spec.md` §4.D).

use crate::apdu::{transceive_chain, Apdu};
use crate::crypto_provider::CryptoProvider;
use crate::error::{PivError, Result};
use crate::piv::algorithm::ALG_ID_3DES;
use crate::piv::token::Token;
use crate::transaction::TokenTransaction;
use crate::transport::CardHandle;
use crate::tlv::{TlvReader, TlvWriter};
use zeroize::Zeroize;

const SLOT_ADMIN: u8 = 0x9B;
const INS_GEN_AUTH: u8 = 0x87;
const INS_VERIFY: u8 = 0x20;
const INS_CHANGE_REF: u8 = 0x24;
const INS_SET_MGMKEY: u8 = 0xFF;

fn is_pin_retries_status(sw: u16) -> bool {
    sw & 0xFFF0 == 0x63C0
}

fn pin_retries(sw: u16) -> u8 {
    (sw & 0x000F) as u8
}

/// `auth_admin(token, key)` — `spec.md` §4.D.
pub fn auth_admin<H: CardHandle>(
    txn: &mut TokenTransaction<'_, Token<H>>,
    key: &[u8],
    provider: &dyn CryptoProvider,
) -> Result<()> {
    let mut challenge_req = TlvWriter::init_write();
    challenge_req.push(0x7C);
    challenge_req.push(0x81);
    challenge_req.pop();
    challenge_req.pop();
    let mut apdu = Apdu::new(0x00, INS_GEN_AUTH, ALG_ID_3DES, SLOT_ADMIN).with_data(challenge_req.into_vec());
    transceive_chain(txn.handle(), &mut apdu)?;
    if apdu.sw != 0x9000 {
        return Err(PivError::from_status(apdu.sw, "auth_admin: challenge request"));
    }

    let mut r = TlvReader::init(&apdu.reply, 0, apdu.reply.len())?;
    if r.read_tag()? != 0x7C {
        return Err(PivError::NotSup("auth_admin: unexpected outer tag".into()));
    }
    let mut challenge = None;
    while !r.at_end() {
        let tag = r.read_tag()?;
        if tag == 0x81 {
            challenge = Some(r.read_all()?);
        } else {
            r.skip()?;
        }
        r.end()?;
    }
    r.end()?;
    let mut challenge = challenge.ok_or_else(|| PivError::Invalid("auth_admin: missing challenge".into()))?;
    if challenge.len() != 8 {
        challenge.zeroize();
        return Err(PivError::Invalid("auth_admin: challenge not 8 bytes".into()));
    }
    let mut block = [0u8; 8];
    block.copy_from_slice(&challenge);
    challenge.zeroize();

    let response = provider.tdes_cbc_zero_iv_encrypt(key, &block)?;
    block.zeroize();

    let mut response_tlv = TlvWriter::init_write();
    response_tlv.push(0x7C);
    response_tlv.push(0x82);
    response_tlv.write(&response);
    response_tlv.pop();
    response_tlv.pop();
    let mut body = response_tlv.into_vec();
    let mut apdu2 = Apdu::new(0x00, INS_GEN_AUTH, ALG_ID_3DES, SLOT_ADMIN).with_data(body.clone());
    body.zeroize();
    let result = transceive_chain(txn.handle(), &mut apdu2);
    result?;
    match apdu2.sw {
        0x9000 => {
            txn.mark_reset();
            Ok(())
        }
        0x6A86 => Err(PivError::NoEnt("auth_admin: incorrect P1/P2 (6A86)".into())),
        0x6A80 => Err(PivError::Access("auth_admin: wrong data, bad admin key (6A80)".into())),
        sw => Err(PivError::Invalid(format!("auth_admin: unexpected status {sw:04X}"))),
    }
}

/// `change_admin_key(token, old_key, new_key, touch)` — supplemented
/// operation (`SPEC_FULL.md` §4.D). Requires a prior successful
/// `auth_admin(token, old_key)` in the same transaction; this function does
/// not re-authenticate itself.
pub fn change_admin_key<H: CardHandle>(txn: &mut TokenTransaction<'_, Token<H>>, new_key: &[u8], touch: bool) -> Result<()> {
    if new_key.len() != 24 {
        return Err(PivError::Invalid("change_admin_key: key must be 24 bytes (3DES)".into()));
    }
    let mut body = vec![SLOT_ADMIN, new_key.len() as u8];
    body.extend_from_slice(new_key);
    let p1 = if touch { 0xFE } else { 0xFF };
    let mut apdu = Apdu::new(0x00, INS_SET_MGMKEY, p1, ALG_ID_3DES).with_data(body.clone());
    body.zeroize();
    let result = transceive_chain(txn.handle(), &mut apdu);
    result?;
    match apdu.sw {
        0x9000 => {
            txn.mark_reset();
            Ok(())
        }
        0x6982 => Err(PivError::Perm("change_admin_key: security status not satisfied (6982)".into())),
        0x6A80 => Err(PivError::Invalid("change_admin_key: wrong data (6A80)".into())),
        sw => Err(PivError::Invalid(format!("change_admin_key: unexpected status {sw:04X}"))),
    }
}

fn pin_wire_block(pin: &[u8]) -> Result<[u8; 8]> {
    if pin.len() > 8 {
        return Err(PivError::Invalid("pin: longer than 8 bytes".into()));
    }
    let mut wire = [0xFFu8; 8];
    // Bounded by `pin.len()` up front (a slice, not a C string), which is
    // the Rust-native form of the corrected `i < 8 && pin[i] != 0` loop
    // bound from `spec.md` §9 note 2 — the source's comma-expression bug
    // has no equivalent to preserve once the length is part of the type.
    wire[..pin.len()].copy_from_slice(pin);
    Ok(wire)
}

/// `verify_pin(token, pin, retries_io)` — `spec.md` §4.D, including the
/// retries-probe semantics and the §9 note 5 fallthrough-on-unexpected-
/// status behavior.
pub fn verify_pin<H: CardHandle>(txn: &mut TokenTransaction<'_, Token<H>>, pin: &[u8], retries: &mut Option<u8>) -> Result<()> {
    let mut wire = pin_wire_block(pin)?;

    if let Some(want) = *retries {
        if want != 0 {
            let mut probe = Apdu::new(0x00, INS_VERIFY, 0x00, 0x80);
            transceive_chain(txn.handle(), &mut probe)?;
            if is_pin_retries_status(probe.sw) {
                let remaining = pin_retries(probe.sw);
                if remaining <= want {
                    wire.zeroize();
                    return Err(PivError::Again { retries: remaining });
                }
            }
            // Any other probe status: proceed to the real VERIFY anyway —
            // preserved per `spec.md` §9 note 5.
        }
    }

    let mut apdu = Apdu::new(0x00, INS_VERIFY, 0x00, 0x80).with_data(wire.to_vec());
    let result = transceive_chain(txn.handle(), &mut apdu);
    wire.zeroize();
    result?;
    match apdu.sw {
        0x9000 => {
            txn.mark_reset();
            Ok(())
        }
        sw if is_pin_retries_status(sw) => {
            let remaining = pin_retries(sw);
            *retries = Some(remaining);
            Err(PivError::Access(format!("verify_pin: bad PIN, {remaining} tries left")))
        }
        sw => Err(PivError::Invalid(format!("verify_pin: unexpected status {sw:04X}"))),
    }
}

/// `change_pin(token, old, new)` — `spec.md` §4.D.
pub fn change_pin<H: CardHandle>(txn: &mut TokenTransaction<'_, Token<H>>, old: &[u8], new: &[u8]) -> Result<()> {
    let old_block = pin_wire_block(old)?;
    let new_block = pin_wire_block(new)?;
    let mut wire = [0u8; 16];
    wire[..8].copy_from_slice(&old_block);
    wire[8..].copy_from_slice(&new_block);

    let mut apdu = Apdu::new(0x00, INS_CHANGE_REF, 0x00, 0x80).with_data(wire.to_vec());
    let result = transceive_chain(txn.handle(), &mut apdu);
    wire.zeroize();
    result?;
    match apdu.sw {
        0x9000 => {
            txn.mark_reset();
            Ok(())
        }
        sw if is_pin_retries_status(sw) => Err(PivError::Access(format!(
            "change_pin: bad old PIN, {} tries left",
            pin_retries(sw)
        ))),
        sw => Err(PivError::Invalid(format!("change_pin: unexpected status {sw:04X}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::piv::token::Token;
    use crate::testing::{Matcher, ScriptedCard};
    use crate::transport::Protocol;

    #[test]
    fn pin_wire_block_pads_with_ff() {
        let wire = pin_wire_block(b"1234").unwrap();
        assert_eq!(wire, [0x31, 0x32, 0x33, 0x34, 0xFF, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn pin_wire_block_rejects_over_length() {
        assert!(pin_wire_block(b"123456789").is_err());
    }

    fn verify_wire(wire: [u8; 8]) -> Vec<u8> {
        Apdu::new(0x00, INS_VERIFY, 0x00, 0x80).with_data(wire.to_vec()).to_wire().unwrap()
    }

    fn probe_wire() -> Vec<u8> {
        Apdu::new(0x00, INS_VERIFY, 0x00, 0x80).to_wire().unwrap()
    }

    #[test]
    fn verify_pin_retries_guard_blocks_when_at_or_below_threshold() {
        // Card reports 2 retries left (63C2); caller's floor is also 2, so
        // verify_pin must refuse without ever sending the real VERIFY.
        let card = ScriptedCard::from_script(vec![(Matcher::Exact(probe_wire()), vec![0x63, 0xC2])]);
        let mut token = Token::new("reader0".to_string(), card, Protocol::T1);
        let mut txn = token.begin_txn().unwrap();
        let mut retries = Some(2);
        let err = verify_pin(&mut txn, b"1234", &mut retries).unwrap_err();
        assert!(matches!(err, PivError::Again { retries: 2 }));
    }

    #[test]
    fn verify_pin_retries_guard_proceeds_above_threshold() {
        // Card reports 3 retries left (63C3), above the caller's floor of 2,
        // so verify_pin proceeds to the real VERIFY and succeeds.
        let card = ScriptedCard::from_script(vec![
            (Matcher::Exact(probe_wire()), vec![0x63, 0xC3]),
            (Matcher::Exact(verify_wire(pin_wire_block(b"1234").unwrap())), vec![0x90, 0x00]),
        ]);
        let mut token = Token::new("reader0".to_string(), card, Protocol::T1);
        let mut txn = token.begin_txn().unwrap();
        let mut retries = Some(2);
        verify_pin(&mut txn, b"1234", &mut retries).unwrap();
    }
}
