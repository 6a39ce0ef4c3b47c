//! The injected SSH-key collaborator (`spec.md` §1, interface d).
//!
//! The box format embeds public keys as SSH public-key blobs
//! (`<cstring type><cstring curve><string Q>` for ECDSA, per `spec.md` §6).
//! This module is the only place that knows that encoding.

use crate::error::{PivError, Result};
use ssh_encoding::{Decode, Encode, Reader};

/// An EC public key in the shape the box format needs: curve name plus the
/// SEC1 uncompressed point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EcPublicKey {
    pub curve: EcCurve,
    pub point: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EcCurve {
    P256,
    P384,
}

impl EcCurve {
    fn ssh_name(self) -> &'static str {
        match self {
            EcCurve::P256 => "nistp256",
            EcCurve::P384 => "nistp384",
        }
    }

    fn from_ssh_name(name: &str) -> Result<Self> {
        match name {
            "nistp256" => Ok(EcCurve::P256),
            "nistp384" => Ok(EcCurve::P384),
            other => Err(PivError::NotSup(format!("unsupported SSH EC curve: {other}"))),
        }
    }
}

/// The injected SSH-key collaborator: encode/decode an `ecdsa-sha2-*`
/// public-key blob.
pub trait SshKeyCodec {
    fn encode(&self, key: &EcPublicKey) -> Vec<u8>;
    fn decode(&self, blob: &[u8]) -> Result<EcPublicKey>;
}

/// `ssh-encoding`-backed implementation: the blob is three consecutive SSH
/// wire "strings" (`Encode`/`Decode` for `str`/`Vec<u8>` already produce and
/// consume that `u32`-length-prefixed form), rather than pulling in
/// `ssh-key`'s full `PublicKey` wrapper, since the box only ever needs the
/// bare ECDSA blob, never OpenSSH's outer authorized-keys text format.
#[derive(Debug, Default, Clone, Copy)]
pub struct SshKeyCodecImpl;

impl SshKeyCodec for SshKeyCodecImpl {
    fn encode(&self, key: &EcPublicKey) -> Vec<u8> {
        let type_name = format!("ecdsa-sha2-{}", key.curve.ssh_name());
        let mut out = Vec::new();
        type_name.as_str().encode(&mut out).expect("encoding into a Vec<u8> cannot fail");
        key.curve.ssh_name().encode(&mut out).expect("encoding into a Vec<u8> cannot fail");
        key.point.as_slice().encode(&mut out).expect("encoding into a Vec<u8> cannot fail");
        out
    }

    fn decode(&self, blob: &[u8]) -> Result<EcPublicKey> {
        let mut reader: &[u8] = blob;
        let type_name = String::decode(&mut reader).map_err(|_| PivError::Invalid("sshkey: malformed type name".into()))?;
        if !type_name.starts_with("ecdsa-sha2-") {
            return Err(PivError::NotSup(format!("sshkey: unsupported key type {type_name}")));
        }
        let curve_name =
            String::decode(&mut reader).map_err(|_| PivError::Invalid("sshkey: malformed curve name".into()))?;
        let curve = EcCurve::from_ssh_name(&curve_name)?;
        let point = Vec::<u8>::decode(&mut reader).map_err(|_| PivError::Invalid("sshkey: malformed point".into()))?;
        if reader.remaining_len() != 0 {
            return Err(PivError::Invalid("sshkey: trailing bytes after point".into()));
        }
        Ok(EcPublicKey { curve, point })
    }
}
