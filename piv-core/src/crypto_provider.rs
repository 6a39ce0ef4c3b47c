//! The injected primitive-crypto collaborator (`spec.md` §1, interface b).
//!
//! Hashing, 3DES-CBC for admin challenge-response, AEAD for the ECDH box,
//! and P-256 keypair generation / ECDH point multiplication all go through
//! this trait so callers can swap in a different backend (an HSM, a WASM
//! crypto shim) without touching the PIV state machine or the box codec.

use crate::error::{PivError, Result};
use rand::RngCore;
use zeroize::Zeroizing;

/// A hash algorithm named in the protocol (slot default hashes, box KDF).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlg {
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlg {
    pub fn name(self) -> &'static str {
        match self {
            HashAlg::Sha1 => "sha1",
            HashAlg::Sha256 => "sha256",
            HashAlg::Sha384 => "sha384",
            HashAlg::Sha512 => "sha512",
        }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "sha1" => Ok(HashAlg::Sha1),
            "sha256" => Ok(HashAlg::Sha256),
            "sha384" => Ok(HashAlg::Sha384),
            "sha512" => Ok(HashAlg::Sha512),
            other => Err(PivError::NotSup(format!("unknown hash algorithm: {other}"))),
        }
    }

    pub fn digest_len(self) -> usize {
        match self {
            HashAlg::Sha1 => 20,
            HashAlg::Sha256 => 32,
            HashAlg::Sha384 => 48,
            HashAlg::Sha512 => 64,
        }
    }
}

/// An AEAD cipher named in the box format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AeadCipher {
    ChaCha20Poly1305,
    Aes256Gcm,
}

impl AeadCipher {
    pub fn name(self) -> &'static str {
        match self {
            AeadCipher::ChaCha20Poly1305 => "chacha20-poly1305",
            AeadCipher::Aes256Gcm => "aes256-gcm",
        }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "chacha20-poly1305" => Ok(AeadCipher::ChaCha20Poly1305),
            "aes256-gcm" => Ok(AeadCipher::Aes256Gcm),
            other => Err(PivError::NotSup(format!("unknown box cipher: {other}"))),
        }
    }

    pub fn key_len(self) -> usize {
        32
    }

    pub fn iv_len(self) -> usize {
        12
    }

    pub fn auth_len(self) -> usize {
        16
    }

    /// Padding block size used by `seal_offline`'s plaintext padding step
    /// (`spec.md` §4.F step 6); both ciphers here are stream AEADs, but the
    /// box format still pads to a fixed block size so ciphertext length
    /// alone never reveals the exact plaintext length to the byte.
    pub fn block_size(self) -> usize {
        16
    }
}

/// The injected crypto collaborator: hashing, 3DES admin challenge-response,
/// box AEAD, and P-256 keypair/ECDH for the box's ephemeral-static agreement.
pub trait CryptoProvider {
    /// Fill `buf` with cryptographically secure random bytes.
    fn random(&self, buf: &mut [u8]);

    /// Hash `data` under `alg`.
    fn hash(&self, alg: HashAlg, data: &[u8]) -> Vec<u8>;

    /// Encrypt a single 8-byte block under 3DES-CBC with a zero IV, no
    /// padding — the admin challenge-response cipher (`spec.md` §6).
    fn tdes_cbc_zero_iv_encrypt(&self, key: &[u8], block: &[u8; 8]) -> Result<[u8; 8]>;

    /// Generate a fresh P-256 keypair, returning `(scalar, SEC1 uncompressed
    /// point)`. The scalar is wiped on drop.
    fn generate_p256(&self) -> Result<(Zeroizing<Vec<u8>>, Vec<u8>)>;

    /// Perform ECDH between a local P-256 scalar and a peer's SEC1
    /// uncompressed point, returning the shared secret's X-coordinate.
    fn ecdh_p256(&self, priv_scalar: &[u8], peer_point: &[u8]) -> Result<Zeroizing<Vec<u8>>>;

    /// AEAD-seal `plaintext` under `cipher`, returning ciphertext||tag.
    fn aead_seal(&self, cipher: AeadCipher, key: &[u8], iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>>;

    /// AEAD-open `ciphertext` (which includes the trailing tag) under
    /// `cipher`. Returns `PivError::BadMsg` on authentication failure.
    fn aead_open(&self, cipher: AeadCipher, key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>>;
}

/// RustCrypto-backed implementation used by default.
#[derive(Debug, Default, Clone, Copy)]
pub struct RustCryptoProvider;

impl CryptoProvider for RustCryptoProvider {
    fn random(&self, buf: &mut [u8]) {
        rand::rngs::OsRng.fill_bytes(buf);
    }

    fn hash(&self, alg: HashAlg, data: &[u8]) -> Vec<u8> {
        use sha1::Digest as _;
        use sha2::Digest as _;
        match alg {
            HashAlg::Sha1 => sha1::Sha1::digest(data).to_vec(),
            HashAlg::Sha256 => sha2::Sha256::digest(data).to_vec(),
            HashAlg::Sha384 => sha2::Sha384::digest(data).to_vec(),
            HashAlg::Sha512 => sha2::Sha512::digest(data).to_vec(),
        }
    }

    fn tdes_cbc_zero_iv_encrypt(&self, key: &[u8], block: &[u8; 8]) -> Result<[u8; 8]> {
        use cipher::{BlockEncryptMut, KeyIvInit};
        if key.len() != 24 {
            return Err(PivError::Invalid("admin key must be 24 bytes (3DES)".into()));
        }
        type TdesCbcEnc = cbc::Encryptor<des::TdesEde3>;
        let mut buf = *block;
        let mut enc = TdesCbcEnc::new(key.into(), &[0u8; 8].into());
        enc.encrypt_block_mut((&mut buf).into());
        Ok(buf)
    }

    fn generate_p256(&self) -> Result<(Zeroizing<Vec<u8>>, Vec<u8>)> {
        use p256::elliptic_curve::sec1::ToEncodedPoint;
        let secret = p256::SecretKey::random(&mut rand::rngs::OsRng);
        let scalar = Zeroizing::new(secret.to_bytes().to_vec());
        let point = secret.public_key().to_encoded_point(false).as_bytes().to_vec();
        Ok((scalar, point))
    }

    fn ecdh_p256(&self, priv_scalar: &[u8], peer_point: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        use p256::elliptic_curve::sec1::FromEncodedPoint;
        let secret = p256::SecretKey::from_slice(priv_scalar)
            .map_err(|_| PivError::Invalid("malformed P-256 scalar".into()))?;
        let encoded = p256::EncodedPoint::from_bytes(peer_point)
            .map_err(|_| PivError::Invalid("malformed P-256 peer point".into()))?;
        let peer_public = Option::<p256::PublicKey>::from(p256::PublicKey::from_encoded_point(&encoded))
            .ok_or_else(|| PivError::Invalid("P-256 peer point not on curve".into()))?;
        let shared = p256::ecdh::diffie_hellman(secret.to_nonzero_scalar(), peer_public.as_affine());
        Ok(Zeroizing::new(shared.raw_secret_bytes().to_vec()))
    }

    fn aead_seal(&self, cipher: AeadCipher, key: &[u8], iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        use aes_gcm::aead::{Aead, KeyInit};
        match cipher {
            AeadCipher::ChaCha20Poly1305 => {
                let c = chacha20poly1305::ChaCha20Poly1305::new_from_slice(key)
                    .map_err(|_| PivError::Invalid("bad chacha20-poly1305 key length".into()))?;
                c.encrypt(iv.into(), plaintext)
                    .map_err(|_| PivError::Invalid("chacha20-poly1305 seal failed".into()))
            }
            AeadCipher::Aes256Gcm => {
                let c = aes_gcm::Aes256Gcm::new_from_slice(key)
                    .map_err(|_| PivError::Invalid("bad aes256-gcm key length".into()))?;
                c.encrypt(iv.into(), plaintext)
                    .map_err(|_| PivError::Invalid("aes256-gcm seal failed".into()))
            }
        }
    }

    fn aead_open(&self, cipher: AeadCipher, key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        use aes_gcm::aead::{Aead, KeyInit};
        let plain = match cipher {
            AeadCipher::ChaCha20Poly1305 => {
                let c = chacha20poly1305::ChaCha20Poly1305::new_from_slice(key)
                    .map_err(|_| PivError::Invalid("bad chacha20-poly1305 key length".into()))?;
                c.decrypt(iv.into(), ciphertext).map_err(|_| PivError::BadMsg)?
            }
            AeadCipher::Aes256Gcm => {
                let c = aes_gcm::Aes256Gcm::new_from_slice(key)
                    .map_err(|_| PivError::Invalid("bad aes256-gcm key length".into()))?;
                c.decrypt(iv.into(), ciphertext).map_err(|_| PivError::BadMsg)?
            }
        };
        Ok(Zeroizing::new(plain))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aead_round_trip_both_ciphers() {
        let provider = RustCryptoProvider;
        for cipher in [AeadCipher::ChaCha20Poly1305, AeadCipher::Aes256Gcm] {
            let mut key = vec![0u8; cipher.key_len()];
            provider.random(&mut key);
            let mut iv = vec![0u8; cipher.iv_len()];
            provider.random(&mut iv);
            let msg = b"hello, sealed world";
            let sealed = provider.aead_seal(cipher, &key, &iv, msg).unwrap();
            let opened = provider.aead_open(cipher, &key, &iv, &sealed).unwrap();
            assert_eq!(&opened[..], msg);
        }
    }

    #[test]
    fn aead_open_rejects_tampered_ciphertext() {
        let provider = RustCryptoProvider;
        let key = vec![0u8; 32];
        let iv = vec![0u8; 12];
        let mut sealed = provider.aead_seal(AeadCipher::ChaCha20Poly1305, &key, &iv, b"secret").unwrap();
        *sealed.last_mut().unwrap() ^= 0x01;
        let err = provider.aead_open(AeadCipher::ChaCha20Poly1305, &key, &iv, &sealed).unwrap_err();
        assert!(matches!(err, PivError::BadMsg));
    }

    #[test]
    fn ecdh_is_symmetric() {
        let provider = RustCryptoProvider;
        let (a_scalar, a_point) = provider.generate_p256().unwrap();
        let (b_scalar, b_point) = provider.generate_p256().unwrap();
        let shared_a = provider.ecdh_p256(&a_scalar, &b_point).unwrap();
        let shared_b = provider.ecdh_p256(&b_scalar, &a_point).unwrap();
        assert_eq!(&shared_a[..], &shared_b[..]);
    }

    #[test]
    fn tdes_known_answer_zero_key_zero_block() {
        let provider = RustCryptoProvider;
        let key = [0u8; 24];
        let block = [0u8; 8];
        let out = provider.tdes_cbc_zero_iv_encrypt(&key, &block).unwrap();
        // EDE3 with K1 == K2 == K3 collapses to single DES
        // (E(K3, D(K2, E(K1, P))) == E(0, D(0, E(0, P))) == E(0, P)), so the
        // all-zero-key/all-zero-block case reduces to the standard single-DES
        // known-answer vector.
        assert_eq!(out, [0x8C, 0xA6, 0x4D, 0xE9, 0xC1, 0xB1, 0x23, 0xA7]);
    }
}
