//! The injected X.509 collaborator (`spec.md` §1, interface c).
//!
//! `read_cert` needs only two things out of a certificate: the subject name
//! for display, and the SubjectPublicKeyInfo so the slot's algorithm can be
//! inferred. Everything else (validity, extensions, chain building) is out
//! of scope for the core.

use crate::error::{PivError, Result};

/// The public key extracted from a certificate's SubjectPublicKeyInfo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedPublicKey {
    Rsa { modulus: Vec<u8>, exponent: Vec<u8> },
    EcP256 { point: Vec<u8> },
    EcP384 { point: Vec<u8> },
}

/// What `read_cert` needs out of a DER certificate.
#[derive(Debug, Clone)]
pub struct ParsedCert {
    pub subject: String,
    pub public_key: ParsedPublicKey,
}

/// The injected X.509 collaborator: DER in, subject + public key out.
pub trait X509Parser {
    fn parse(&self, der: &[u8]) -> Result<ParsedCert>;
}

/// `x509-parser`-backed implementation.
#[derive(Debug, Default, Clone, Copy)]
pub struct X509ParserImpl;

impl X509Parser for X509ParserImpl {
    fn parse(&self, der: &[u8]) -> Result<ParsedCert> {
        use x509_parser::oid_registry;
        use x509_parser::prelude::*;
        use x509_parser::public_key::PublicKey;

        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| PivError::Invalid(format!("x509: malformed certificate: {e}")))?;
        let subject = cert.subject().to_string();
        let spki = cert.public_key();
        let alg_oid = spki.algorithm.algorithm.clone();

        let public_key = if alg_oid == oid_registry::OID_PKCS1_RSAENCRYPTION {
            let rsa = spki
                .parsed()
                .map_err(|e| PivError::Invalid(format!("x509: malformed RSA public key: {e}")))?;
            match rsa {
                PublicKey::RSA(rsa_pub) => ParsedPublicKey::Rsa {
                    modulus: rsa_pub.modulus.to_vec(),
                    exponent: rsa_pub.exponent.to_vec(),
                },
                _ => return Err(PivError::NotSup("x509: SPKI algorithm/key mismatch".into())),
            }
        } else if alg_oid == oid_registry::OID_KEY_TYPE_EC_PUBLIC_KEY {
            let curve_oid = spki
                .algorithm
                .parameters
                .as_ref()
                .and_then(|p| p.as_oid().ok())
                .ok_or_else(|| PivError::NotSup("x509: EC key missing named curve".into()))?;
            let point = spki.subject_public_key.data.to_vec();
            if curve_oid == oid_registry::OID_EC_P256 {
                ParsedPublicKey::EcP256 { point }
            } else if curve_oid == oid_registry::OID_NIST_EC_P384 {
                ParsedPublicKey::EcP384 { point }
            } else {
                return Err(PivError::NotSup("x509: unsupported EC curve".into()));
            }
        } else {
            return Err(PivError::NotSup("x509: unsupported public key algorithm".into()));
        };

        Ok(ParsedCert { subject, public_key })
    }
}
