// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs,
    path::{Path, PathBuf},
};

use base64::{Engine, engine::general_purpose::STANDARD};
use pkcs8::DecodePublicKey;
use rsa::{Pkcs1v15Sign, RsaPublicKey, pkcs1::DecodeRsaPublicKey, traits::PublicKeyParts};
use sha2::Sha256;
use thiserror::Error;
use tracing::debug;
use x509_cert::{
    Certificate,
    der::{DecodePem, referenced::OwnedToRef},
};

use crate::{hash::SHA256_DIGEST_SIZE, protobuf::chromeos_update_engine::Signatures};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Digest has {0} bytes, but should have {SHA256_DIGEST_SIZE}")]
    InvalidDigestLength(usize),
    #[error("PEM has start tag, but no end tag")]
    PemNoEndTag,
    #[error("Data does not contain a supported public key format")]
    UnknownKeyFormat,
    #[error("Signature set is empty")]
    NoSignatures,
    #[error("None of the {0} signatures match the public key")]
    NoMatchingSignature(usize),
    #[error("Failed to decode base64 public key")]
    Base64(#[from] base64::DecodeError),
    #[error("Failed to load PKCS8 public key")]
    LoadPubKey(#[source] pkcs8::spki::Error),
    #[error("Failed to load PKCS1 public key")]
    LoadPkcs1PubKey(#[source] rsa::pkcs1::Error),
    #[error("Failed to load certificate")]
    LoadCert(#[source] x509_cert::der::Error),
    #[error("Failed to verify RSA signature")]
    RsaVerify(#[source] Box<rsa::Error>),
    #[error("Failed to read file: {0:?}")]
    ReadFile(PathBuf, #[source] std::io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// PEM files must have lines no longer than 64 characters, but some tools
/// produce longer ones. Rewrap the base64 section so that the strict parsers
/// accept it.
fn reformat_pem(data: &str) -> Result<String> {
    let mut result = String::new();
    let mut base64 = String::new();
    let mut inside_base64 = false;

    for line in data.lines().map(str::trim_end) {
        if line.is_empty() {
            continue;
        } else if line.starts_with("-----BEGIN ") {
            inside_base64 = true;

            result.push_str(line);
            result.push('\n');
        } else if line.starts_with("-----END ") {
            inside_base64 = false;

            let bytes = base64.as_bytes();
            for chunk in bytes.chunks(64) {
                // Chunks of an ASCII string are always valid UTF-8.
                result.push_str(&String::from_utf8_lossy(chunk));
                result.push('\n');
            }

            base64.clear();

            result.push_str(line);
            result.push('\n');
        } else if inside_base64 {
            base64.push_str(line.trim_start());
        }
    }

    if inside_base64 {
        return Err(Error::PemNoEndTag);
    }

    Ok(result)
}

/// Parse an RSA public key from PEM text. SPKI public keys, PKCS1 public keys,
/// and X509 certificates are accepted.
pub fn parse_pem_public_key(data: &str) -> Result<RsaPublicKey> {
    let data = reformat_pem(data)?;

    if data.contains("-----BEGIN CERTIFICATE-----") {
        let cert = Certificate::from_pem(data.as_bytes()).map_err(Error::LoadCert)?;
        get_public_key(&cert)
    } else if data.contains("-----BEGIN RSA PUBLIC KEY-----") {
        RsaPublicKey::from_pkcs1_pem(&data).map_err(Error::LoadPkcs1PubKey)
    } else if data.contains("-----BEGIN PUBLIC KEY-----") {
        RsaPublicKey::from_public_key_pem(&data).map_err(Error::LoadPubKey)
    } else {
        Err(Error::UnknownKeyFormat)
    }
}

/// Parse an RSA public key from DER (SPKI or PKCS1) or PEM bytes.
pub fn parse_public_key(data: &[u8]) -> Result<RsaPublicKey> {
    if data.starts_with(b"-----BEGIN ") {
        let text = std::str::from_utf8(data).map_err(|_| Error::UnknownKeyFormat)?;
        return parse_pem_public_key(text);
    }

    match RsaPublicKey::from_public_key_der(data) {
        Ok(key) => Ok(key),
        Err(e) => {
            debug!("Not an SPKI public key: {e}");
            RsaPublicKey::from_pkcs1_der(data).map_err(Error::LoadPkcs1PubKey)
        }
    }
}

/// Parse a base64-encoded public key, as delivered alongside an update.
pub fn parse_base64_public_key(data: &str) -> Result<RsaPublicKey> {
    let raw = STANDARD.decode(data.trim())?;

    parse_public_key(&raw)
}

/// Read a PEM-encoded public key or certificate from a file.
pub fn read_pem_public_key_file(path: &Path) -> Result<RsaPublicKey> {
    let data = fs::read_to_string(path).map_err(|e| Error::ReadFile(path.to_owned(), e))?;

    parse_pem_public_key(&data)
}

/// Get the RSA public key from a certificate.
pub fn get_public_key(cert: &Certificate) -> Result<RsaPublicKey> {
    RsaPublicKey::try_from(cert.tbs_certificate.subject_public_key_info.owned_to_ref())
        .map_err(Error::LoadPubKey)
}

/// Verify a single PKCS#1 v1.5 signature over a SHA-256 digest.
pub fn verify_raw_signature(key: &RsaPublicKey, digest: &[u8], signature: &[u8]) -> Result<()> {
    // Check this explicitly so we can provide a better error message.
    if digest.len() != SHA256_DIGEST_SIZE {
        return Err(Error::InvalidDigestLength(digest.len()));
    }

    key.verify(Pkcs1v15Sign::new::<Sha256>(), digest, signature)
        .map_err(|e| Error::RsaVerify(Box::new(e)))
}

/// Verify that at least one signature in the set matches the digest. When a
/// signature declares an unpadded size, only that many bytes of its data are
/// used.
pub fn verify_signatures(key: &RsaPublicKey, digest: &[u8], signatures: &Signatures) -> Result<()> {
    if signatures.signatures.is_empty() {
        return Err(Error::NoSignatures);
    }

    for (i, signature) in signatures.signatures.iter().enumerate() {
        let data = signature.data();
        let data = match signature.unpadded_signature_size {
            Some(size) if (size as usize) <= data.len() => &data[..size as usize],
            Some(size) => {
                debug!(
                    "Signature #{i} unpadded size {size} exceeds data size {}",
                    data.len(),
                );
                continue;
            }
            None => data,
        };

        if data.len() != key.size() {
            debug!(
                "Signature #{i} has {} bytes, but key has {} bytes",
                data.len(),
                key.size(),
            );
            continue;
        }

        match verify_raw_signature(key, digest, data) {
            Ok(()) => {
                debug!("Signature #{i} matches");
                return Ok(());
            }
            Err(e) => debug!("Signature #{i} does not match: {e}"),
        }
    }

    Err(Error::NoMatchingSignature(signatures.signatures.len()))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use rand::{SeedableRng, rngs::StdRng};
    use rsa::{RsaPrivateKey, pkcs8::EncodePublicKey, pkcs8::LineEnding};

    use super::*;
    use crate::protobuf::chromeos_update_engine::signatures::Signature;

    fn key_pair() -> RsaPrivateKey {
        let mut rng = StdRng::seed_from_u64(0x6b6579);
        RsaPrivateKey::new(&mut rng, 1024).unwrap()
    }

    fn sign(key: &RsaPrivateKey, digest: &[u8]) -> Vec<u8> {
        key.sign(Pkcs1v15Sign::new::<Sha256>(), digest).unwrap()
    }

    #[test]
    fn load_key_formats() {
        let key = key_pair();
        let public_key = key.to_public_key();

        let pem = public_key.to_public_key_pem(LineEnding::LF).unwrap();
        assert_eq!(parse_pem_public_key(&pem).unwrap(), public_key);

        // Long lines are rewrapped.
        let long = pem
            .lines()
            .filter(|l| !l.starts_with("-----"))
            .collect::<String>();
        let unwrapped = format!("-----BEGIN PUBLIC KEY-----\n{long}\n-----END PUBLIC KEY-----\n");
        assert_eq!(parse_pem_public_key(&unwrapped).unwrap(), public_key);

        let der = public_key.to_public_key_der().unwrap();
        let encoded = STANDARD.encode(der.as_bytes());
        assert_eq!(parse_base64_public_key(&encoded).unwrap(), public_key);

        let encoded = STANDARD.encode(pem.as_bytes());
        assert_eq!(parse_base64_public_key(&encoded).unwrap(), public_key);

        assert_matches!(
            parse_pem_public_key("-----BEGIN PUBLIC KEY-----\nAAAA\n"),
            Err(Error::PemNoEndTag)
        );
    }

    #[test]
    fn verify_signature_set() {
        let key = key_pair();
        let public_key = key.to_public_key();
        let digest = ring::digest::digest(&ring::digest::SHA256, b"payload");
        let digest = digest.as_ref();

        let mut padded = sign(&key, digest);
        let size = padded.len() as u32;
        padded.extend_from_slice(&[0u8; 8]);

        let signatures = Signatures {
            signatures: vec![
                Signature {
                    data: Some(vec![0u8; 128]),
                    ..Default::default()
                },
                Signature {
                    data: Some(padded),
                    unpadded_signature_size: Some(size),
                    ..Default::default()
                },
            ],
        };

        verify_signatures(&public_key, digest, &signatures).unwrap();

        let other = ring::digest::digest(&ring::digest::SHA256, b"other");
        assert_matches!(
            verify_signatures(&public_key, other.as_ref(), &signatures),
            Err(Error::NoMatchingSignature(2))
        );
        assert_matches!(
            verify_signatures(&public_key, digest, &Signatures::default()),
            Err(Error::NoSignatures)
        );
        assert_matches!(
            verify_raw_signature(&public_key, b"short", &[]),
            Err(Error::InvalidDigestLength(5))
        );
    }
}
