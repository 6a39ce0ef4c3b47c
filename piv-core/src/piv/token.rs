//! The PIV application state machine: selection, CHUID/cert reads, key
//! generation, and raw data-object writes (`spec.md` §4.D).

use crate::apdu::{transceive, transceive_chain, Apdu};
use crate::error::{PivError, Result};
use crate::piv::algorithm::Algorithm;
use crate::piv::slot::{Slot, SlotId};
use crate::transaction::{HasHandle, TokenTransaction};
use crate::transport::{CardHandle, Protocol};
use crate::tlv::{TlvReader, TlvWriter};
use crate::x509::{ParsedPublicKey, X509Parser};

/// The fixed 11-byte PIV application identifier (`spec.md` §4.D).
pub const PIV_AID: [u8; 11] = [0xA0, 0x00, 0x00, 0x03, 0x08, 0x00, 0x00, 0x10, 0x00, 0x01, 0x00];

/// A connected PIV card (`spec.md` §3 "Token"), owning its handle directly
/// rather than through the source's intrusive linked list (`spec.md` §9).
pub struct Token<H: CardHandle> {
    pub reader_name: String,
    handle: H,
    pub protocol: Protocol,
    pub guid: Option<[u8; 16]>,
    pub algorithms: Vec<u8>,
    pub yubico: bool,
    pub yubico_version: Option<(u8, u8, u8)>,
    pub no_chuid: bool,
    pub slots: Vec<Slot>,
}

impl<H: CardHandle> HasHandle for Token<H> {
    type Handle = H;
    fn handle_mut(&mut self) -> &mut H {
        &mut self.handle
    }
}

impl<H: CardHandle> Token<H> {
    pub fn new(reader_name: String, handle: H, protocol: Protocol) -> Self {
        Self {
            reader_name,
            handle,
            protocol,
            guid: None,
            algorithms: Vec::new(),
            yubico: false,
            yubico_version: None,
            no_chuid: false,
            slots: Vec::new(),
        }
    }

    /// Begin an exclusive transaction (`spec.md` §4.C/§5); the returned
    /// guard is the only way to reach `handle` for the duration of the
    /// transaction.
    pub fn begin_txn(&mut self) -> Result<TokenTransaction<'_, Self>> {
        TokenTransaction::begin(self)
    }

    pub fn slot(&self, id: SlotId) -> Option<&Slot> {
        self.slots.iter().find(|s| s.id == id)
    }

    /// Whether `select`'s cached algorithm list advertises `alg_id`, used by
    /// `sign`'s card-side-hashing shortcut (`SPEC_FULL.md` §4.D).
    pub fn supports_algorithm(&self, alg_id: u8) -> bool {
        self.algorithms.contains(&alg_id)
    }

    /// Disconnect the handle, leaving the card powered. Callers must not be
    /// in a transaction (enforced by the enumerator's `release`).
    pub fn disconnect(mut self) -> Result<()> {
        self.handle.disconnect()
    }
}

fn get_data<H: CardHandle>(txn: &mut TokenTransaction<'_, Token<H>>, object_id: &[u8]) -> Result<Vec<u8>> {
    let mut w = TlvWriter::init_write();
    w.push(0x5C);
    w.write(object_id);
    w.pop();
    let mut apdu = Apdu::new(0x00, 0xCB, 0x3F, 0xFF).with_data(w.into_vec());
    transceive_chain(txn.handle(), &mut apdu)?;
    match apdu.sw {
        0x9000 => Ok(apdu.reply),
        0x6A82 => Err(PivError::NoEnt("get_data: file not found (6A82)".into())),
        sw => Err(PivError::from_status(sw, "get_data")),
    }
}

/// `select(token)` — `spec.md` §4.D.
pub fn select<H: CardHandle>(txn: &mut TokenTransaction<'_, Token<H>>) -> Result<()> {
    let mut apdu = Apdu::new(0x00, 0xA4, 0x04, 0x00).with_data(PIV_AID.to_vec());
    transceive_chain(txn.handle(), &mut apdu)?;
    if apdu.sw != 0x9000 {
        return Err(PivError::NoEnt(format!("select: status {:04x}", apdu.sw)));
    }

    let mut r = TlvReader::init(&apdu.reply, 0, apdu.reply.len())?;
    if r.read_tag()? != 0x61 {
        return Err(PivError::NotSup("select: unexpected APT tag".into()));
    }
    let mut algorithms = Vec::new();
    while !r.at_end() {
        let tag = r.read_tag()?;
        match tag {
            0x4F | 0x79 | 0x50 | 0x5F50 => {
                r.skip()?;
            }
            0xAC => {
                while !r.at_end() {
                    let sub = r.read_tag()?;
                    match sub {
                        0x80 => algorithms.push(r.read_byte()?),
                        0x06 => r.skip()?,
                        _ => return Err(PivError::NotSup("select: unknown ALGS sub-tag".into())),
                    }
                    r.end()?;
                }
            }
            _ => return Err(PivError::NotSup("select: unknown APT tag".into())),
        }
        r.end()?;
    }
    r.end()?;

    txn.target().algorithms = algorithms;
    Ok(())
}

/// `read_chuid(token)` — `spec.md` §4.D.
pub fn read_chuid<H: CardHandle>(txn: &mut TokenTransaction<'_, Token<H>>) -> Result<()> {
    let data = get_data(txn, &[0x5F, 0xC1, 0x02])?;
    let mut r = TlvReader::init(&data, 0, data.len())?;
    if r.read_tag()? != 0x53 {
        return Err(PivError::NotSup("chuid: unexpected outer tag".into()));
    }
    let mut guid = None;
    while !r.at_end() {
        let tag = r.read_tag()?;
        if tag == 0x34 {
            let bytes = r.read_all()?;
            if bytes.len() != 16 {
                return Err(PivError::Invalid("chuid: GUID field not 16 bytes".into()));
            }
            let mut g = [0u8; 16];
            g.copy_from_slice(&bytes);
            guid = Some(g);
        } else {
            r.skip()?;
        }
        r.end()?;
    }
    r.end()?;
    txn.target().guid = guid;
    Ok(())
}

/// `probe_yubico(token)` — `spec.md` §4.D.
pub fn probe_yubico<H: CardHandle>(txn: &mut TokenTransaction<'_, Token<H>>) -> Result<()> {
    let mut apdu = Apdu::new(0x00, 0xFD, 0x00, 0x00);
    transceive(txn.handle(), &mut apdu)?;
    if apdu.sw != 0x9000 {
        return Err(PivError::NotSup("probe_yubico: status word indicates not a YubiKey".into()));
    }
    if apdu.reply.len() != 3 {
        return Err(PivError::Invalid("probe_yubico: malformed version reply".into()));
    }
    txn.target().yubico = true;
    txn.target().yubico_version = Some((apdu.reply[0], apdu.reply[1], apdu.reply[2]));
    Ok(())
}

const PIV_CI_X509: u8 = 0x04;
const PIV_COMP_MASK: u8 = 0x03;
const PIV_COMP_NONE: u8 = 0x00;

/// Infer the PIV RSA algorithm from a DER-encoded modulus. The DER INTEGER
/// carries a leading `0x00` sign byte whenever the modulus MSB is set (the
/// common case for real keys), so the size is read off the trimmed length.
fn rsa_algorithm_for_modulus(modulus: &[u8]) -> Result<Algorithm> {
    let trimmed = modulus.strip_prefix(&[0x00]).unwrap_or(modulus);
    match trimmed.len() {
        128 => Ok(Algorithm::Rsa1024),
        256 => Ok(Algorithm::Rsa2048),
        _ => Err(PivError::NotSup("cert: unsupported RSA modulus size".into())),
    }
}

/// `read_cert(token, slot)` — `spec.md` §4.D, including the certinfo
/// rejection rules and unexpected-key-size handling from §9 note 4.
pub fn read_cert<H: CardHandle>(
    txn: &mut TokenTransaction<'_, Token<H>>,
    slot: SlotId,
    x509: &dyn X509Parser,
) -> Result<()> {
    let data = get_data(txn, &slot.cert_object_id())?;
    let mut r = TlvReader::init(&data, 0, data.len())?;
    if r.read_tag()? != 0x53 {
        return Err(PivError::NotSup("cert: unexpected outer tag".into()));
    }
    let mut cert_der = None;
    let mut certinfo = 0u8;
    while !r.at_end() {
        let tag = r.read_tag()?;
        match tag {
            0x70 => cert_der = Some(r.read_all()?),
            0x71 => certinfo = r.read_byte()?,
            _ => r.skip()?,
        }
        r.end()?;
    }
    r.end()?;

    let der = cert_der.ok_or_else(|| PivError::Invalid("cert: missing DER body (tag 70)".into()))?;
    if certinfo & PIV_CI_X509 != 0 {
        return Err(PivError::NotSup("cert: PIV_CI_X509 bit set".into()));
    }
    if certinfo & PIV_COMP_MASK != PIV_COMP_NONE {
        return Err(PivError::NotSup("cert: compressed certificates unsupported".into()));
    }

    let parsed = x509.parse(&der)?;
    let (algorithm, ssh_public_key) = match &parsed.public_key {
        ParsedPublicKey::Rsa { modulus, .. } => (rsa_algorithm_for_modulus(modulus)?, None),
        ParsedPublicKey::EcP256 { point } => (
            Algorithm::EccP256,
            Some(crate::sshkey::EcPublicKey {
                curve: crate::sshkey::EcCurve::P256,
                point: point.clone(),
            }),
        ),
        ParsedPublicKey::EcP384 { point } => (
            Algorithm::EccP384,
            Some(crate::sshkey::EcPublicKey {
                curve: crate::sshkey::EcCurve::P384,
                point: point.clone(),
            }),
        ),
    };

    let entry = Slot {
        id: slot,
        algorithm,
        certificate_der: der,
        subject: parsed.subject,
        public_key: parsed.public_key,
        ssh_public_key,
    };
    txn.target().slots.retain(|s| s.id != slot);
    txn.target().slots.push(entry);
    Ok(())
}

/// `read_all_certs(token)` — `spec.md` §4.D: `NOENT`/`NOTSUP` per slot are
/// non-fatal, any other error propagates.
pub fn read_all_certs<H: CardHandle>(txn: &mut TokenTransaction<'_, Token<H>>, x509: &dyn X509Parser) -> Result<()> {
    for slot in SlotId::READ_ORDER {
        match read_cert(txn, slot, x509) {
            Ok(()) => {}
            Err(PivError::NoEnt(_)) | Err(PivError::NotSup(_)) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn validate_ec_point(alg: Algorithm, point: &[u8]) -> Result<()> {
    match alg {
        Algorithm::EccP256 => {
            p256::PublicKey::from_sec1_bytes(point).map_err(|_| PivError::Invalid("generate: EC point not on P-256".into()))?;
        }
        Algorithm::EccP384 => {
            p384::PublicKey::from_sec1_bytes(point).map_err(|_| PivError::Invalid("generate: EC point not on P-384".into()))?;
        }
        _ => unreachable!("validate_ec_point called on a non-EC algorithm"),
    }
    Ok(())
}

/// `generate(token, slot, alg, out_pubkey)` — `spec.md` §4.D.
pub fn generate<H: CardHandle>(
    txn: &mut TokenTransaction<'_, Token<H>>,
    slot: SlotId,
    alg: Algorithm,
) -> Result<ParsedPublicKey> {
    let mut w = TlvWriter::init_write();
    w.push(0xAC);
    w.push(0x80);
    w.write_byte(alg.wire_id());
    w.pop();
    w.pop();
    let mut apdu = Apdu::new(0x00, 0x47, 0x00, slot.wire_id()).with_data(w.into_vec());
    transceive_chain(txn.handle(), &mut apdu)?;
    match apdu.sw {
        0x9000 => {}
        0x6982 => return Err(PivError::Perm("generate: security status not satisfied".into())),
        sw => return Err(PivError::Invalid(format!("generate: unexpected status {sw:04X}"))),
    }

    let mut r = TlvReader::init(&apdu.reply, 0, apdu.reply.len())?;
    if r.read_tag()? != 0x7F49 {
        return Err(PivError::NotSup("generate: unexpected response tag".into()));
    }
    let pubkey = match alg {
        Algorithm::Rsa1024 | Algorithm::Rsa2048 => {
            let mut modulus = None;
            let mut exponent = None;
            while !r.at_end() {
                let tag = r.read_tag()?;
                match tag {
                    0x81 => modulus = Some(r.read_all()?),
                    0x82 => exponent = Some(r.read_all()?),
                    _ => r.skip()?,
                }
                r.end()?;
            }
            ParsedPublicKey::Rsa {
                modulus: modulus.ok_or_else(|| PivError::Invalid("generate: missing RSA modulus".into()))?,
                exponent: exponent.ok_or_else(|| PivError::Invalid("generate: missing RSA exponent".into()))?,
            }
        }
        Algorithm::EccP256 | Algorithm::EccP384 => {
            let mut point = None;
            while !r.at_end() {
                let tag = r.read_tag()?;
                if tag == 0x86 {
                    point = Some(r.read_all()?);
                } else {
                    r.skip()?;
                }
                r.end()?;
            }
            let point = point.ok_or_else(|| PivError::Invalid("generate: missing EC point".into()))?;
            validate_ec_point(alg, &point)?;
            if alg == Algorithm::EccP256 {
                ParsedPublicKey::EcP256 { point }
            } else {
                ParsedPublicKey::EcP384 { point }
            }
        }
    };
    r.end()?;
    Ok(pubkey)
}

/// `write_file(token, tag, data)` — `spec.md` §4.D.
pub fn write_file<H: CardHandle>(txn: &mut TokenTransaction<'_, Token<H>>, object_id: &[u8], data: &[u8]) -> Result<()> {
    let mut w = TlvWriter::init_write();
    w.push(0x5C);
    w.write(object_id);
    w.pop();
    w.push_long(0x53, data.len());
    w.write(data);
    w.pop();
    let mut apdu = Apdu::new(0x00, 0xDB, 0x3F, 0xFF).with_data(w.into_vec());
    transceive_chain(txn.handle(), &mut apdu)?;
    match apdu.sw {
        0x9000 => Ok(()),
        0x6A84 => Err(PivError::NoMem("write_file: card out of memory (6A84)".into())),
        0x6982 => Err(PivError::Perm("write_file: security status not satisfied (6982)".into())),
        0x6A81 => Err(PivError::NoEnt("write_file: function not supported (6A81)".into())),
        sw => Err(PivError::Invalid(format!("write_file: unexpected status {sw:04X}"))),
    }
}

/// `write_cert(token, slot, cert_der, flags)` — `spec.md` §4.D.
pub fn write_cert<H: CardHandle>(
    txn: &mut TokenTransaction<'_, Token<H>>,
    slot: SlotId,
    cert_der: &[u8],
    certinfo: u8,
) -> Result<()> {
    let mut w = TlvWriter::init_write();
    w.push_long(0x70, cert_der.len());
    w.write(cert_der);
    w.pop();
    w.push(0x71);
    w.write_byte(certinfo);
    w.pop();
    write_file(txn, &slot.cert_object_id(), &w.into_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rsa_modulus_with_sign_byte_is_not_mistaken_for_unsupported_size() {
        let mut modulus_1024 = vec![0x00];
        modulus_1024.extend(vec![0xAB; 128]);
        assert_eq!(rsa_algorithm_for_modulus(&modulus_1024).unwrap(), Algorithm::Rsa1024);

        let mut modulus_2048 = vec![0x00];
        modulus_2048.extend(vec![0xCD; 256]);
        assert_eq!(rsa_algorithm_for_modulus(&modulus_2048).unwrap(), Algorithm::Rsa2048);
    }

    #[test]
    fn rsa_modulus_without_sign_byte_matches_directly() {
        let modulus_1024 = vec![0x7F; 128];
        assert_eq!(rsa_algorithm_for_modulus(&modulus_1024).unwrap(), Algorithm::Rsa1024);
    }

    #[test]
    fn rsa_modulus_unsupported_size_is_notsup() {
        let err = rsa_algorithm_for_modulus(&[0xAB; 64]).unwrap_err();
        assert!(matches!(err, PivError::NotSup(_)));
    }
}
