//! End-to-end scenarios against the scripted card simulator.

use piv_core::crypto_provider::{CryptoProvider, HashAlg, RustCryptoProvider};
use piv_core::envelope::{find_token, open_offline, seal_offline};
use piv_core::error::PivError;
use piv_core::piv::algorithm::{Algorithm, ALG_ID_ECCP256_SHA256};
use piv_core::piv::slot::{Slot, SlotId};
use piv_core::piv::token::{PIV_AID, Token};
use piv_core::piv::{auth_admin, probe_yubico, read_chuid, select, sign};
use piv_core::sshkey::{EcCurve, EcPublicKey};
use piv_core::testing::{Matcher, ScriptedCard, ScriptedContext};
use piv_core::transport::Protocol;
use piv_core::tlv::TlvWriter;
use piv_core::x509::{ParsedCert, ParsedPublicKey, X509Parser};
use piv_core::{enumerate, PivConfig};

fn ok(mut body: Vec<u8>) -> Vec<u8> {
    body.extend_from_slice(&[0x90, 0x00]);
    body
}

fn apdu_wire(cla: u8, ins: u8, p1: u8, p2: u8, data: &[u8]) -> Vec<u8> {
    piv_core::apdu::Apdu::new(cla, ins, p1, p2)
        .with_data(data.to_vec())
        .to_wire()
        .unwrap()
}

#[test]
fn enumerate_empty_returns_no_tokens() {
    let ctx = ScriptedContext::empty();
    let tokens = enumerate(&ctx, &PivConfig::default()).unwrap();
    assert!(tokens.is_empty());
}

#[test]
fn enumerate_one_card_populates_guid_and_not_yubico() {
    let select_wire = apdu_wire(0x00, 0xA4, 0x04, 0x00, &PIV_AID);
    let select_reply = {
        let mut w = TlvWriter::init_write();
        w.push(0x61);
        w.pop();
        ok(w.into_vec())
    };

    let chuid_wire = apdu_wire(0x00, 0xCB, 0x3F, 0xFF, &{
        let mut w = TlvWriter::init_write();
        w.push(0x5C);
        w.write(&[0x5F, 0xC1, 0x02]);
        w.pop();
        w.into_vec()
    });
    let guid = [
        0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff,
    ];
    let chuid_reply = {
        let mut w = TlvWriter::init_write();
        w.push(0x53);
        w.push(0x34);
        w.write(&guid);
        w.pop();
        w.pop();
        ok(w.into_vec())
    };

    let getver_wire = apdu_wire(0x00, 0xFD, 0x00, 0x00, &[]);
    let getver_reply = vec![0x6D, 0x00];

    let card = ScriptedCard::from_script(vec![
        (Matcher::Exact(select_wire), select_reply),
        (Matcher::Exact(chuid_wire), chuid_reply),
        (Matcher::Exact(getver_wire), getver_reply),
    ]);
    let ctx = ScriptedContext::with_readers(vec![("reader0".to_string(), card)]);

    let tokens = enumerate(&ctx, &PivConfig::default()).unwrap();
    assert_eq!(tokens.len(), 1);
    assert_eq!(tokens[0].guid, Some(guid));
    assert!(!tokens[0].yubico);
}

struct FakeEcP256Parser {
    point: Vec<u8>,
}

impl X509Parser for FakeEcP256Parser {
    fn parse(&self, _der: &[u8]) -> piv_core::error::Result<ParsedCert> {
        Ok(ParsedCert {
            subject: "CN=test".to_string(),
            public_key: ParsedPublicKey::EcP256 { point: self.point.clone() },
        })
    }
}

#[test]
fn read_cert_9e_populates_slot_cache_with_inferred_algorithm() {
    let der = vec![0x30, 0x82, 0x01, 0x00]; // opaque; the fake parser ignores it
    let point = vec![0x04; 65];

    let body = {
        let mut w = TlvWriter::init_write();
        w.push(0x53);
        w.push_long(0x70, der.len());
        w.write(&der);
        w.pop();
        w.push(0x71);
        w.write_byte(0x00);
        w.pop();
        w.pop();
        w.into_vec()
    };
    let object_id = SlotId::CardAuthentication.cert_object_id();
    let get_data_wire = apdu_wire(0x00, 0xCB, 0x3F, 0xFF, &{
        let mut w = TlvWriter::init_write();
        w.push(0x5C);
        w.write(&object_id);
        w.pop();
        w.into_vec()
    });

    let card = ScriptedCard::from_script(vec![(Matcher::Exact(get_data_wire), ok(body))]);
    let mut token = Token::new("reader0".to_string(), card, Protocol::T1);
    {
        let mut txn = token.begin_txn().unwrap();
        let parser = FakeEcP256Parser { point: point.clone() };
        piv_core::piv::read_cert(&mut txn, SlotId::CardAuthentication, &parser).unwrap();
    }

    let slot = token.slot(SlotId::CardAuthentication).unwrap();
    assert_eq!(slot.algorithm, Algorithm::EccP256);
    assert_eq!(slot.subject, "CN=test");
    assert_eq!(slot.ssh_public_key.as_ref().unwrap().point, point);
}

#[test]
fn admin_auth_success_sets_reset_on_end() {
    let provider = RustCryptoProvider;
    let key: Vec<u8> = (1u8..=24).collect();
    let challenge: [u8; 8] = [1, 2, 3, 4, 5, 6, 7, 8];
    let expected_response = provider.tdes_cbc_zero_iv_encrypt(&key, &challenge).unwrap();

    let req1_wire = apdu_wire(0x00, 0x87, 0x03, 0x9B, &{
        let mut w = TlvWriter::init_write();
        w.push(0x7C);
        w.push(0x81);
        w.pop();
        w.pop();
        w.into_vec()
    });
    let req1_reply = {
        let mut w = TlvWriter::init_write();
        w.push(0x7C);
        w.push(0x81);
        w.write(&challenge);
        w.pop();
        w.pop();
        ok(w.into_vec())
    };

    let req2_wire = apdu_wire(0x00, 0x87, 0x03, 0x9B, &{
        let mut w = TlvWriter::init_write();
        w.push(0x7C);
        w.push(0x82);
        w.write(&expected_response);
        w.pop();
        w.pop();
        w.into_vec()
    });
    let req2_reply = vec![0x90, 0x00];

    let card = ScriptedCard::from_script(vec![
        (Matcher::Exact(req1_wire), req1_reply),
        (Matcher::Exact(req2_wire), req2_reply),
    ]);
    let mut token = Token::new("reader0".to_string(), card, Protocol::T1);
    let mut txn = token.begin_txn().unwrap();
    auth_admin(&mut txn, &key, &provider).unwrap();
}

#[test]
fn sign_p256_uses_card_side_hash_shortcut() {
    let signature = vec![0xAB; 64];
    let req_wire = apdu_wire(0x00, 0x87, ALG_ID_ECCP256_SHA256, SlotId::Authentication.wire_id(), &{
        let mut w = TlvWriter::init_write();
        w.push(0x7C);
        w.push(0x82);
        w.pop();
        w.push_long(0x81, 5);
        w.write(b"hello");
        w.pop();
        w.pop();
        w.into_vec()
    });
    let reply = {
        let mut w = TlvWriter::init_write();
        w.push(0x7C);
        w.push(0x81);
        w.write(&signature);
        w.pop();
        w.pop();
        ok(w.into_vec())
    };

    let card = ScriptedCard::from_script(vec![(Matcher::Exact(req_wire), reply)]);
    let mut token = Token::new("reader0".to_string(), card, Protocol::T1);
    token.algorithms = vec![ALG_ID_ECCP256_SHA256];
    token.slots.push(Slot {
        id: SlotId::Authentication,
        algorithm: Algorithm::EccP256,
        certificate_der: Vec::new(),
        subject: String::new(),
        public_key: ParsedPublicKey::EcP256 { point: Vec::new() },
        ssh_public_key: None,
    });

    let provider = RustCryptoProvider;
    let mut txn = token.begin_txn().unwrap();
    let sig = sign(&mut txn, SlotId::Authentication, b"hello", Some(HashAlg::Sha256), &provider).unwrap();
    assert_eq!(sig, signature);
}

#[test]
fn box_open_on_wrong_token_is_not_found_and_never_touches_the_card() {
    let provider = RustCryptoProvider;
    let (target_priv, target_point) = provider.generate_p256().unwrap();
    let target_pub = EcPublicKey { curve: EcCurve::P256, point: target_point };

    let config = PivConfig::default();
    let mut box_ = seal_offline(&target_pub, b"top secret".to_vec(), &config, &provider).unwrap();
    box_.guid = [0xAA; 16]; // token A's GUID
    box_.slot_id = SlotId::KeyManagement.wire_id();

    // token B: different GUID, never connected to, so any transmit would panic.
    let card_b = ScriptedCard::from_script(Vec::new());
    let mut token_b = Token::new("readerB".to_string(), card_b, Protocol::T1);
    token_b.guid = Some([0xBB; 16]);

    let x509 = piv_core::x509::X509ParserImpl;
    let err = find_token(std::slice::from_mut(&mut token_b), &box_, &x509).unwrap_err();
    assert!(matches!(err, PivError::NoEnt(_)));

    // sanity: token A can actually open what was sealed to it.
    let reopened = open_offline(&target_priv, &box_, &provider).unwrap();
    assert_eq!(&reopened[.."top secret".len()], b"top secret");
}

#[test]
fn read_chuid_missing_object_is_nonfatal_no_chuid() {
    let chuid_wire = apdu_wire(0x00, 0xCB, 0x3F, 0xFF, &{
        let mut w = TlvWriter::init_write();
        w.push(0x5C);
        w.write(&[0x5F, 0xC1, 0x02]);
        w.pop();
        w.into_vec()
    });
    let card = ScriptedCard::from_script(vec![(Matcher::Exact(chuid_wire), vec![0x6A, 0x82])]);
    let mut token = Token::new("reader0".to_string(), card, Protocol::T1);
    let mut txn = token.begin_txn().unwrap();
    let err = read_chuid(&mut txn).unwrap_err();
    assert!(matches!(err, PivError::NoEnt(_)));
}

#[test]
fn probe_yubico_not_a_yubikey_is_notsup() {
    let getver_wire = apdu_wire(0x00, 0xFD, 0x00, 0x00, &[]);
    let card = ScriptedCard::from_script(vec![(Matcher::Exact(getver_wire), vec![0x6D, 0x00])]);
    let mut token = Token::new("reader0".to_string(), card, Protocol::T1);
    let mut txn = token.begin_txn().unwrap();
    let err = probe_yubico(&mut txn).unwrap_err();
    assert!(matches!(err, PivError::NotSup(_)));
}

#[test]
fn select_rejects_non_success_status() {
    let select_wire = apdu_wire(0x00, 0xA4, 0x04, 0x00, &PIV_AID);
    let card = ScriptedCard::from_script(vec![(Matcher::Exact(select_wire), vec![0x6A, 0x82])]);
    let mut token = Token::new("reader0".to_string(), card, Protocol::T1);
    let mut txn = token.begin_txn().unwrap();
    let err = select(&mut txn).unwrap_err();
    assert!(matches!(err, PivError::NoEnt(_)));
}
