//! ECDH sealed-envelope box: seal/open, binary framing, and token discovery
//! (`spec.md` §4.F).

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use zeroize::{Zeroize, Zeroizing};

use crate::crypto_provider::{AeadCipher, CryptoProvider, HashAlg};
use crate::config::PivConfig;
use crate::error::{PivError, Result};
use crate::piv::{read_cert, Token};
use crate::piv::slot::SlotId;
use crate::sshkey::{EcCurve, EcPublicKey, SshKeyCodec};
use crate::transaction::TokenTransaction;
use crate::transport::CardHandle;
use crate::x509::X509Parser;

const BOX_VERSION: u8 = 1;

/// A sealed or in-progress ECDH envelope (`spec.md` §3 "ECDH box"). Once
/// sealed, `ciphertext` always carries its trailing AEAD tag.
#[derive(Debug, Clone)]
pub struct ECDHBox {
    pub version: u8,
    /// `[0u8; 16]` until [`seal`] stamps it with the sealing token's GUID.
    pub guid: [u8; 16],
    /// `0` until [`seal`] stamps it with the sealing slot's wire id.
    pub slot_id: u8,
    pub ephemeral_pub: EcPublicKey,
    pub target_pub: EcPublicKey,
    pub cipher: AeadCipher,
    pub kdf: HashAlg,
    pub iv: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

fn write_string(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(bytes);
}

fn read_string<'a>(buf: &'a [u8], pos: &mut usize) -> Result<&'a [u8]> {
    if buf.len() < *pos + 4 {
        return Err(PivError::Invalid("box: truncated length prefix".into()));
    }
    let len = u32::from_be_bytes(buf[*pos..*pos + 4].try_into().unwrap()) as usize;
    *pos += 4;
    if buf.len() < *pos + len {
        return Err(PivError::Invalid("box: truncated field".into()));
    }
    let out = &buf[*pos..*pos + len];
    *pos += len;
    Ok(out)
}

impl ECDHBox {
    /// `to_binary(box)` — `spec.md` §4.F / §6.
    pub fn to_binary(&self, ssh: &dyn SshKeyCodec) -> Vec<u8> {
        let mut out = Vec::new();
        out.push(self.version);
        write_string(&mut out, &self.guid);
        out.push(self.slot_id);
        write_string(&mut out, &ssh.encode(&self.ephemeral_pub));
        write_string(&mut out, &ssh.encode(&self.target_pub));
        write_string(&mut out, self.cipher.name().as_bytes());
        write_string(&mut out, self.kdf.name().as_bytes());
        write_string(&mut out, &self.iv);
        write_string(&mut out, &self.ciphertext);
        out
    }

    /// `from_binary(bytes)` — `spec.md` §4.F / §6.
    pub fn from_binary(bytes: &[u8], ssh: &dyn SshKeyCodec) -> Result<Self> {
        if bytes.is_empty() {
            return Err(PivError::Invalid("box: empty input".into()));
        }
        let version = bytes[0];
        if version != BOX_VERSION {
            return Err(PivError::NotSup(format!("box: unsupported version {version}")));
        }
        let mut pos = 1usize;
        let guid_bytes = read_string(bytes, &mut pos)?;
        if guid_bytes.len() != 16 {
            return Err(PivError::Invalid("box: GUID field not 16 bytes".into()));
        }
        let mut guid = [0u8; 16];
        guid.copy_from_slice(guid_bytes);

        if bytes.len() < pos + 1 {
            return Err(PivError::Invalid("box: truncated slot id".into()));
        }
        let slot_id = bytes[pos];
        pos += 1;

        let ephemeral_pub = ssh.decode(read_string(bytes, &mut pos)?)?;
        let target_pub = ssh.decode(read_string(bytes, &mut pos)?)?;
        let cipher_name = std::str::from_utf8(read_string(bytes, &mut pos)?)
            .map_err(|_| PivError::Invalid("box: cipher name not valid UTF-8".into()))?;
        let cipher = AeadCipher::from_name(cipher_name)?;
        let kdf_name = std::str::from_utf8(read_string(bytes, &mut pos)?)
            .map_err(|_| PivError::Invalid("box: kdf name not valid UTF-8".into()))?;
        let kdf = HashAlg::from_name(kdf_name)?;
        let iv = read_string(bytes, &mut pos)?.to_vec();
        let ciphertext = read_string(bytes, &mut pos)?.to_vec();

        Ok(Self { version, guid, slot_id, ephemeral_pub, target_pub, cipher, kdf, iv, ciphertext })
    }

    /// Base64 framing convenience over [`Self::to_binary`]
    /// (`SPEC_FULL.md` §4.F).
    pub fn to_base64(&self, ssh: &dyn SshKeyCodec) -> String {
        BASE64.encode(self.to_binary(ssh))
    }

    /// Base64 framing convenience over [`Self::from_binary`]
    /// (`SPEC_FULL.md` §4.F).
    pub fn from_base64(text: &str, ssh: &dyn SshKeyCodec) -> Result<Self> {
        let bytes = BASE64
            .decode(text.trim())
            .map_err(|e| PivError::Invalid(format!("box: invalid base64: {e}")))?;
        Self::from_binary(&bytes, ssh)
    }
}

fn derive_key(provider: &dyn CryptoProvider, kdf: HashAlg, shared: &[u8], key_len: usize) -> Result<Zeroizing<Vec<u8>>> {
    let mut digest = provider.hash(kdf, shared);
    if digest.len() < key_len {
        digest.zeroize();
        return Err(PivError::Invalid("box: KDF digest shorter than cipher key length".into()));
    }
    let key = Zeroizing::new(digest[..key_len].to_vec());
    digest.zeroize();
    Ok(key)
}

/// Pad `plaintext` to a multiple of `block_size` with the bytes `1, 2, 3, …`
/// wrapping mod 256 (`spec.md` §4.F step 6).
fn pad(plaintext: &[u8], block_size: usize) -> Vec<u8> {
    let pad_len = (block_size - plaintext.len() % block_size) % block_size;
    let mut out = Vec::with_capacity(plaintext.len() + pad_len);
    out.extend_from_slice(plaintext);
    let mut counter: u8 = 1;
    for _ in 0..pad_len {
        out.push(counter);
        counter = counter.wrapping_add(1);
    }
    out
}

/// `seal_offline(target_pub, box)` — `spec.md` §4.F. `plaintext` is consumed
/// and wiped once its padded copy has been encrypted.
pub fn seal_offline(
    target_pub: &EcPublicKey,
    plaintext: Vec<u8>,
    config: &PivConfig,
    provider: &dyn CryptoProvider,
) -> Result<ECDHBox> {
    if target_pub.curve != EcCurve::P256 {
        return Err(PivError::NotSup("seal_offline: only P-256 target keys are supported".into()));
    }
    let cipher = config.default_cipher;
    let kdf = config.default_kdf;

    let (eph_scalar, eph_point) = provider.generate_p256()?;
    let shared = provider.ecdh_p256(&eph_scalar, &target_pub.point)?;
    drop(eph_scalar);
    let key = derive_key(provider, kdf, &shared, cipher.key_len())?;
    drop(shared);

    let mut iv = vec![0u8; cipher.iv_len()];
    provider.random(&mut iv);

    let mut plaintext = plaintext;
    let padded = pad(&plaintext, cipher.block_size());
    plaintext.zeroize();

    let ciphertext = provider.aead_seal(cipher, &key, &iv, &padded)?;

    Ok(ECDHBox {
        version: BOX_VERSION,
        guid: [0u8; 16],
        slot_id: 0,
        ephemeral_pub: EcPublicKey { curve: EcCurve::P256, point: eph_point },
        target_pub: target_pub.clone(),
        cipher,
        kdf,
        iv,
        ciphertext,
    })
}

/// `seal(token, slot, box)` — `spec.md` §4.F.
pub fn seal<H: CardHandle>(
    token: &Token<H>,
    slot: SlotId,
    plaintext: Vec<u8>,
    config: &PivConfig,
    provider: &dyn CryptoProvider,
) -> Result<ECDHBox> {
    let entry = token
        .slot(slot)
        .ok_or_else(|| PivError::NoEnt("seal: slot not cached; call read_cert first".into()))?;
    let target_pub = entry
        .ssh_public_key
        .clone()
        .ok_or_else(|| PivError::NotSup("seal: slot key is not an EC key".into()))?;
    let mut sealed = seal_offline(&target_pub, plaintext, config, provider)?;
    sealed.guid = token.guid.unwrap_or([0u8; 16]);
    sealed.slot_id = slot.wire_id();
    Ok(sealed)
}

/// `open(token, slot, box)` — `spec.md` §4.F. Requires a transaction with an
/// already-authenticated session (PIN/admin auth as the card demands).
pub fn open<H: CardHandle>(
    txn: &mut TokenTransaction<'_, Token<H>>,
    slot: SlotId,
    box_: &ECDHBox,
    provider: &dyn CryptoProvider,
) -> Result<Zeroizing<Vec<u8>>> {
    let mut shared = crate::piv::ecdh(txn, slot, &box_.ephemeral_pub.point)?;
    let key = derive_key(provider, box_.kdf, &shared, box_.cipher.key_len())?;
    shared.zeroize();
    provider.aead_open(box_.cipher, &key, &box_.iv, &box_.ciphertext)
}

/// `open_offline(privkey, box)` — `spec.md` §4.F. Does not and must not
/// perform padding verification; trimming is left to the caller.
pub fn open_offline(priv_scalar: &[u8], box_: &ECDHBox, provider: &dyn CryptoProvider) -> Result<Zeroizing<Vec<u8>>> {
    let shared = provider.ecdh_p256(priv_scalar, &box_.ephemeral_pub.point)?;
    let key = derive_key(provider, box_.kdf, &shared, box_.cipher.key_len())?;
    provider.aead_open(box_.cipher, &key, &box_.iv, &box_.ciphertext)
}

fn ensure_slot_cached<H: CardHandle>(token: &mut Token<H>, slot_id: SlotId, x509: &dyn X509Parser) -> Result<()> {
    if token.slot(slot_id).is_some() {
        return Ok(());
    }
    let mut txn = token.begin_txn()?;
    read_cert(&mut txn, slot_id, x509)
}

/// `find_token(tokens, box)` — `spec.md` §4.F, including the slot-9D
/// fallback restricted to sentinel slot ids `0`/`0xFF` (`spec.md` §9 note 3).
/// Returns the matching token's index and resolved slot id.
pub fn find_token<H: CardHandle>(
    tokens: &mut [Token<H>],
    box_: &ECDHBox,
    x509: &dyn X509Parser,
) -> Result<(usize, SlotId)> {
    if let Some(idx) = tokens.iter().position(|t| t.guid == Some(box_.guid)) {
        let slot_id = SlotId::from_wire_id(box_.slot_id)?;
        ensure_slot_cached(&mut tokens[idx], slot_id, x509)?;
        return Ok((idx, slot_id));
    }

    if box_.slot_id == 0x00 || box_.slot_id == 0xFF {
        for (idx, token) in tokens.iter_mut().enumerate() {
            let _ = ensure_slot_cached(token, SlotId::KeyManagement, x509);
            if let Some(slot) = token.slot(SlotId::KeyManagement) {
                if slot.ssh_public_key.as_ref() == Some(&box_.target_pub) {
                    return Ok((idx, SlotId::KeyManagement));
                }
            }
        }
    }

    Err(PivError::NoEnt("find_token: no token holds the box's target key".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto_provider::RustCryptoProvider;
    use crate::sshkey::SshKeyCodecImpl;

    fn fresh_target(provider: &RustCryptoProvider) -> (Zeroizing<Vec<u8>>, EcPublicKey) {
        let (scalar, point) = provider.generate_p256().unwrap();
        (scalar, EcPublicKey { curve: EcCurve::P256, point })
    }

    #[test]
    fn seal_offline_then_open_offline_round_trips() {
        let provider = RustCryptoProvider;
        for (cipher, kdf) in [
            (AeadCipher::ChaCha20Poly1305, HashAlg::Sha512),
            (AeadCipher::Aes256Gcm, HashAlg::Sha256),
        ] {
            let config = PivConfig { default_cipher: cipher, default_kdf: kdf, ..PivConfig::default() };
            let (target_priv, target_pub) = fresh_target(&provider);
            for len in [1usize, 15, 16, 17, 1024] {
                let plaintext = vec![0x42u8; len];
                let box_ = seal_offline(&target_pub, plaintext.clone(), &config, &provider).unwrap();

                let codec = SshKeyCodecImpl;
                let wire = box_.to_binary(&codec);
                let roundtrip = ECDHBox::from_binary(&wire, &codec).unwrap();

                let opened = open_offline(&target_priv, &roundtrip, &provider).unwrap();
                assert_eq!(&opened[..len], &plaintext[..]);
            }
        }
    }

    #[test]
    fn tampering_any_field_breaks_authenticity() {
        let provider = RustCryptoProvider;
        let config = PivConfig::default();
        let (target_priv, target_pub) = fresh_target(&provider);
        let box_ = seal_offline(&target_pub, b"shh".to_vec(), &config, &provider).unwrap();

        let mut bad_ciphertext = box_.clone();
        *bad_ciphertext.ciphertext.last_mut().unwrap() ^= 0x01;
        assert!(matches!(open_offline(&target_priv, &bad_ciphertext, &provider), Err(PivError::BadMsg)));

        let mut bad_iv = box_.clone();
        bad_iv.iv[0] ^= 0x01;
        assert!(matches!(open_offline(&target_priv, &bad_iv, &provider), Err(PivError::BadMsg)));

        let mut bad_eph = box_;
        bad_eph.ephemeral_pub.point[5] ^= 0x01;
        // A flipped ephemeral point either fails to validate as a curve
        // point (Invalid) or produces the wrong shared secret (BadMsg);
        // either way the plaintext must not come back.
        assert!(open_offline(&target_priv, &bad_eph, &provider).is_err());
    }

    #[test]
    fn to_base64_from_base64_round_trips() {
        let provider = RustCryptoProvider;
        let config = PivConfig::default();
        let (_target_priv, target_pub) = fresh_target(&provider);
        let box_ = seal_offline(&target_pub, b"hello".to_vec(), &config, &provider).unwrap();
        let codec = SshKeyCodecImpl;
        let text = box_.to_base64(&codec);
        let back = ECDHBox::from_base64(&text, &codec).unwrap();
        assert_eq!(back.ciphertext, box_.ciphertext);
    }

    #[test]
    fn from_binary_rejects_unknown_version() {
        let codec = SshKeyCodecImpl;
        let err = ECDHBox::from_binary(&[0x02], &codec).unwrap_err();
        assert!(matches!(err, PivError::NotSup(_)));
    }
}
