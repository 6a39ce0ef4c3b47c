//! Sign, prehash-sign, and ECDH key-agreement operations against a slot key
//! (`spec.md` §4.D).

use crate::apdu::{transceive_chain, Apdu};
use crate::crypto_provider::{CryptoProvider, HashAlg};
use crate::error::{PivError, Result};
use crate::piv::algorithm::{Algorithm, ALG_ID_ECCP256_SHA1, ALG_ID_ECCP256_SHA256};
use crate::piv::slot::SlotId;
use crate::piv::token::Token;
use crate::transaction::TokenTransaction;
use crate::transport::CardHandle;
use crate::tlv::{TlvReader, TlvWriter};

const INS_GEN_AUTH: u8 = 0x87;

/// `DigestInfo` prefix for SHA-256, hard-coded regardless of the hash
/// actually used — preserved per `spec.md` §9 note 1 (a known bug surface,
/// not a typo).
const SHA256_DIGEST_INFO_PREFIX: [u8; 15] = [
    0x30, 0x0D, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x01, 0x05, 0x00,
];

fn digest_info_sha256_oid(digest: &[u8]) -> Vec<u8> {
    let mut inner = Vec::with_capacity(SHA256_DIGEST_INFO_PREFIX.len() + 2 + digest.len());
    inner.extend_from_slice(&SHA256_DIGEST_INFO_PREFIX);
    inner.push(0x04);
    inner.push(digest.len() as u8);
    inner.extend_from_slice(digest);
    let mut out = Vec::with_capacity(inner.len() + 2);
    out.push(0x30);
    out.push(inner.len() as u8);
    out.extend_from_slice(&inner);
    out
}

/// PKCS#1 v1.5 padding: `00 01 FF..FF 00 <DigestInfo>` left-padded to
/// `modulus_len` (`spec.md` §4.D).
fn pkcs1_v15_pad(digest: &[u8], modulus_len: usize) -> Result<Vec<u8>> {
    let digest_info = digest_info_sha256_oid(digest);
    if digest_info.len() + 11 > modulus_len {
        return Err(PivError::Invalid("sign: digest too large for RSA modulus".into()));
    }
    let pad_len = modulus_len - digest_info.len() - 3;
    let mut out = Vec::with_capacity(modulus_len);
    out.push(0x00);
    out.push(0x01);
    out.resize(out.len() + pad_len, 0xFF);
    out.push(0x00);
    out.extend_from_slice(&digest_info);
    Ok(out)
}

fn gen_auth_single_tag<H: CardHandle>(
    txn: &mut TokenTransaction<'_, Token<H>>,
    wire_alg: u8,
    slot: SlotId,
    request_tag: u32,
    payload: &[u8],
    response_tag: u32,
) -> Result<Vec<u8>> {
    let mut w = TlvWriter::init_write();
    w.push(0x7C);
    w.push(0x82);
    w.pop();
    w.push_long(request_tag, payload.len());
    w.write(payload);
    w.pop();
    w.pop();
    let mut apdu = Apdu::new(0x00, INS_GEN_AUTH, wire_alg, slot.wire_id()).with_data(w.into_vec());
    transceive_chain(txn.handle(), &mut apdu)?;
    match apdu.sw {
        0x9000 => {}
        0x6982 => return Err(PivError::Perm("gen_auth: security status not satisfied (6982)".into())),
        sw => return Err(PivError::Invalid(format!("gen_auth: unexpected status {sw:04X}"))),
    }

    let mut r = TlvReader::init(&apdu.reply, 0, apdu.reply.len())?;
    if r.read_tag()? != 0x7C {
        return Err(PivError::NotSup("gen_auth: unexpected outer tag".into()));
    }
    let mut out = None;
    while !r.at_end() {
        let tag = r.read_tag()?;
        if tag == response_tag {
            out = Some(r.read_all()?);
        } else {
            r.skip()?;
        }
        r.end()?;
    }
    r.end()?;
    out.ok_or_else(|| PivError::NotSup("gen_auth: response tag not present in reply".into()))
}

/// `sign(token, slot, data, hash_io, out_sig)` — `spec.md` §4.D, including
/// the per-slot hash/padding table and the P-256 card-side-hashing
/// shortcut.
pub fn sign<H: CardHandle>(
    txn: &mut TokenTransaction<'_, Token<H>>,
    slot: SlotId,
    data: &[u8],
    hash: Option<HashAlg>,
    provider: &dyn CryptoProvider,
) -> Result<Vec<u8>> {
    let slot_alg = txn
        .target()
        .slot(slot)
        .map(|s| s.algorithm)
        .ok_or_else(|| PivError::NoEnt("sign: slot not cached; call read_cert or generate first".into()))?;

    let default_hash = if slot_alg == Algorithm::EccP384 { HashAlg::Sha384 } else { HashAlg::Sha256 };
    let hash = hash.unwrap_or(default_hash);
    if slot_alg == Algorithm::EccP384 && hash != HashAlg::Sha384 {
        return Err(PivError::Invalid("sign: P-384 slots always use SHA-384".into()));
    }

    let mut wire_alg = slot_alg.wire_id();
    let mut payload;
    let mut shortcut_applied = false;

    if slot_alg == Algorithm::EccP256 {
        let shortcut_id = match hash {
            HashAlg::Sha1 => Some(ALG_ID_ECCP256_SHA1),
            HashAlg::Sha256 => Some(ALG_ID_ECCP256_SHA256),
            _ => None,
        };
        if let Some(id) = shortcut_id {
            if txn.target().supports_algorithm(id) {
                wire_alg = id;
                payload = data.to_vec();
                shortcut_applied = true;
            } else {
                payload = Vec::new();
            }
        } else {
            payload = Vec::new();
        }
    } else {
        payload = Vec::new();
    }

    if !shortcut_applied {
        let digest = provider.hash(hash, data);
        payload = match slot_alg {
            Algorithm::Rsa1024 | Algorithm::Rsa2048 => {
                pkcs1_v15_pad(&digest, slot_alg.rsa_modulus_len().unwrap())?
            }
            Algorithm::EccP256 | Algorithm::EccP384 => digest,
        };
    }

    // `wire_alg` only ever diverges from the cached `slot_alg` locally, for
    // this one APDU — no cached token state needs restoring afterward.
    gen_auth_single_tag(txn, wire_alg, slot, 0x81, &payload, 0x81)
}

/// `sign_prehash(token, slot, hashed, out_sig)` — `spec.md` §4.D.
pub fn sign_prehash<H: CardHandle>(txn: &mut TokenTransaction<'_, Token<H>>, slot: SlotId, hashed: &[u8]) -> Result<Vec<u8>> {
    let slot_alg = txn
        .target()
        .slot(slot)
        .map(|s| s.algorithm)
        .ok_or_else(|| PivError::NoEnt("sign_prehash: slot not cached".into()))?;
    gen_auth_single_tag(txn, slot_alg.wire_id(), slot, 0x81, hashed, 0x81)
}

/// `ecdh(token, slot, peer_pub, out_secret)` — `spec.md` §4.D.
pub fn ecdh<H: CardHandle>(txn: &mut TokenTransaction<'_, Token<H>>, slot: SlotId, peer_pub_sec1: &[u8]) -> Result<Vec<u8>> {
    let slot_alg = txn
        .target()
        .slot(slot)
        .map(|s| s.algorithm)
        .ok_or_else(|| PivError::NoEnt("ecdh: slot not cached".into()))?;
    gen_auth_single_tag(txn, slot_alg.wire_id(), slot, 0x85, peer_pub_sec1, 0x82)
}
