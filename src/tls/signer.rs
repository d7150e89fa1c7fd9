/* httpctl (AGPL-3.0)

Copyright (C) 2025 - 404 Contributors

This program is free software: you can redistribute it and/or modify
it under the terms of the GNU Affero General Public License as published by
the Free Software Foundation, either version 3 of the License, or
(at your option) any later version.

This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
GNU Affero General Public License for more details.

You should have received a copy of the GNU Affero General Public License
along with this program.  If not, see <https://www.gnu.org/licenses/>.

*/

use p256::{ecdsa::SigningKey as EcdsaSigningKey, elliptic_curve::sec1::ToEncodedPoint, SecretKey};
use parking_lot::Mutex;
use pkcs8::{DecodePrivateKey, EncodePrivateKey, ObjectIdentifier, PrivateKeyInfo};
use rcgen::{RemoteKeyPair, SignatureAlgorithm, PKCS_ECDSA_P256_SHA256, PKCS_RSA_SHA256};
use rsa::{
    pkcs1::EncodeRsaPublicKey, pkcs1v15::SigningKey as RsaSigningKey, RsaPrivateKey,
};
use sha2::Sha256;

use crate::utils::{CaError, IssuanceError};

use super::keystream::KeyStream;

const OID_RSA_ENCRYPTION: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.1");
const OID_EC_PUBLIC_KEY: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.2.1");
const OID_SECP256R1: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.3.1.7");
const OID_ED25519: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.101.112");

pub const LEAF_RSA_BITS: usize = 2048;

/// Which family a key belongs to; leaves always mirror the root's family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAlgorithm {
    Rsa,
    EcdsaP256,
}

impl KeyAlgorithm {
    pub fn signature_algorithm(self) -> &'static SignatureAlgorithm {
        match self {
            KeyAlgorithm::Rsa => &PKCS_RSA_SHA256,
            KeyAlgorithm::EcdsaP256 => &PKCS_ECDSA_P256_SHA256,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            KeyAlgorithm::Rsa => "rsa-2048",
            KeyAlgorithm::EcdsaP256 => "ecdsa-p256",
        }
    }
}

/// Private key material of a root or leaf.
#[derive(Clone)]
pub enum PrivateKey {
    Rsa(RsaPrivateKey),
    EcdsaP256(SecretKey),
}

/// Root key as loaded from disk. Only the first two variants can issue leaves.
#[derive(Clone)]
pub enum RootKey {
    Supported(PrivateKey),
    /// A valid X.509 signing key this proxy cannot issue with (e.g. Ed25519, P-384).
    Unsupported(String),
}

impl std::fmt::Debug for RootKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RootKey::Supported(key) => write!(f, "RootKey({})", key.algorithm().label()),
            RootKey::Unsupported(kind) => write!(f, "RootKey(unsupported {kind})"),
        }
    }
}

/// Classifies a PKCS#8 blob, rejecting anything that is not an X.509 signing key.
pub fn parse_root_key(pkcs8_der: &[u8]) -> Result<RootKey, CaError> {
    let info = PrivateKeyInfo::try_from(pkcs8_der)
        .map_err(|err| CaError::ParseFailure(format!("invalid PKCS#8 key: {err}")))?;
    let oid = info.algorithm.oid;

    if oid == OID_RSA_ENCRYPTION {
        let key = RsaPrivateKey::from_pkcs8_der(pkcs8_der)
            .map_err(|err| CaError::ParseFailure(format!("invalid RSA key: {err}")))?;
        return Ok(RootKey::Supported(PrivateKey::Rsa(key)));
    }

    if oid == OID_EC_PUBLIC_KEY {
        let curve = info.algorithm.parameters_oid().map_err(|err| {
            CaError::ParseFailure(format!("EC key without named curve: {err}"))
        })?;
        if curve != OID_SECP256R1 {
            return Ok(RootKey::Unsupported(format!("ecdsa curve {curve}")));
        }
        let key = SecretKey::from_pkcs8_der(pkcs8_der)
            .map_err(|err| CaError::ParseFailure(format!("invalid P-256 key: {err}")))?;
        return Ok(RootKey::Supported(PrivateKey::EcdsaP256(key)));
    }

    if oid == OID_ED25519 {
        return Ok(RootKey::Unsupported("ed25519".into()));
    }

    Err(CaError::UnsupportedKeyType(oid.to_string()))
}

impl PrivateKey {
    pub fn algorithm(&self) -> KeyAlgorithm {
        match self {
            PrivateKey::Rsa(_) => KeyAlgorithm::Rsa,
            PrivateKey::EcdsaP256(_) => KeyAlgorithm::EcdsaP256,
        }
    }

    /// Draws a fresh key of `algorithm` entirely from `stream`.
    pub fn generate(algorithm: KeyAlgorithm, stream: &mut KeyStream) -> Result<Self, IssuanceError> {
        match algorithm {
            KeyAlgorithm::Rsa => RsaPrivateKey::new(stream, LEAF_RSA_BITS)
                .map(PrivateKey::Rsa)
                .map_err(|err| IssuanceError::SigningFailure(format!("rsa keygen: {err}"))),
            KeyAlgorithm::EcdsaP256 => Ok(PrivateKey::EcdsaP256(SecretKey::random(stream))),
        }
    }

    /// Public key in the form rcgen wraps into a SubjectPublicKeyInfo.
    pub fn raw_public_key(&self) -> Result<Vec<u8>, IssuanceError> {
        match self {
            PrivateKey::Rsa(key) => key
                .to_public_key()
                .to_pkcs1_der()
                .map(|doc| doc.as_bytes().to_vec())
                .map_err(|err| IssuanceError::SigningFailure(format!("rsa public key: {err}"))),
            PrivateKey::EcdsaP256(key) => {
                Ok(key.public_key().to_encoded_point(false).as_bytes().to_vec())
            }
        }
    }

    pub fn to_pkcs8_der(&self) -> Result<Vec<u8>, IssuanceError> {
        let doc = match self {
            PrivateKey::Rsa(key) => key.to_pkcs8_der(),
            PrivateKey::EcdsaP256(key) => key.to_pkcs8_der(),
        }
        .map_err(|err| IssuanceError::SigningFailure(format!("pkcs8 encoding: {err}")))?;
        Ok(doc.as_bytes().to_vec())
    }

    fn sign(&self, stream: &mut KeyStream, message: &[u8]) -> Result<Vec<u8>, String> {
        match self {
            PrivateKey::Rsa(key) => {
                use rsa::signature::{RandomizedSigner, SignatureEncoding};
                let signer = RsaSigningKey::<Sha256>::new(key.clone());
                signer
                    .try_sign_with_rng(stream, message)
                    .map(|sig| sig.to_vec())
                    .map_err(|err| err.to_string())
            }
            PrivateKey::EcdsaP256(key) => {
                use p256::ecdsa::{signature::RandomizedSigner, Signature};
                let signer = EcdsaSigningKey::from(key);
                let sig: Signature = signer
                    .try_sign_with_rng(stream, message)
                    .map_err(|err| err.to_string())?;
                Ok(sig.to_der().as_bytes().to_vec())
            }
        }
    }
}

/// rcgen key pair whose signatures draw their randomness from a [`KeyStream`].
///
/// The root signer owns the issuance's stream. A freshly generated leaf key is wrapped
/// without one, since rcgen only reads its public half.
pub struct StreamKeyPair {
    key: PrivateKey,
    public_key: Vec<u8>,
    stream: Option<Mutex<KeyStream>>,
}

impl StreamKeyPair {
    pub fn signing(key: PrivateKey, stream: KeyStream) -> Result<Self, IssuanceError> {
        let public_key = key.raw_public_key()?;
        Ok(Self {
            key,
            public_key,
            stream: Some(Mutex::new(stream)),
        })
    }

    pub fn public_only(key: PrivateKey) -> Result<Self, IssuanceError> {
        let public_key = key.raw_public_key()?;
        Ok(Self {
            key,
            public_key,
            stream: None,
        })
    }

    pub fn into_rcgen(self) -> Result<rcgen::KeyPair, IssuanceError> {
        rcgen::KeyPair::from_remote(Box::new(self))
            .map_err(|err| IssuanceError::SigningFailure(err.to_string()))
    }
}

impl RemoteKeyPair for StreamKeyPair {
    fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    fn sign(&self, msg: &[u8]) -> Result<Vec<u8>, rcgen::Error> {
        let Some(stream) = self.stream.as_ref() else {
            tracing::warn!("sign requested from a public-only key pair");
            return Err(rcgen::Error::RemoteKeyError);
        };
        let mut stream = stream.lock();
        self.key.sign(&mut stream, msg).map_err(|err| {
            tracing::warn!(error = %err, "signature failed");
            rcgen::Error::RemoteKeyError
        })
    }

    fn algorithm(&self) -> &'static SignatureAlgorithm {
        self.key.algorithm().signature_algorithm()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ecdsa_generation_is_reproducible_per_stream() {
        let mut a = KeyStream::new(b"root", b"example.com");
        let mut b = KeyStream::new(b"root", b"example.com");
        let left = PrivateKey::generate(KeyAlgorithm::EcdsaP256, &mut a).expect("keygen");
        let right = PrivateKey::generate(KeyAlgorithm::EcdsaP256, &mut b).expect("keygen");
        assert_eq!(
            left.raw_public_key().expect("public"),
            right.raw_public_key().expect("public")
        );
    }

    #[test]
    fn ecdsa_public_key_is_uncompressed_point() {
        let mut stream = KeyStream::new(b"root", b"example.com");
        let key = PrivateKey::generate(KeyAlgorithm::EcdsaP256, &mut stream).expect("keygen");
        let public = key.raw_public_key().expect("public");
        assert_eq!(public.len(), 65);
        assert_eq!(public[0], 0x04);
    }

    #[test]
    fn parse_root_key_round_trips_p256_pkcs8() {
        let mut stream = KeyStream::new(b"root", b"");
        let key = PrivateKey::generate(KeyAlgorithm::EcdsaP256, &mut stream).expect("keygen");
        let der = key.to_pkcs8_der().expect("pkcs8");
        match parse_root_key(&der).expect("parse") {
            RootKey::Supported(parsed) => assert_eq!(parsed.algorithm(), KeyAlgorithm::EcdsaP256),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parse_root_key_rejects_garbage() {
        assert!(matches!(
            parse_root_key(b"not a key"),
            Err(CaError::ParseFailure(_))
        ));
    }
}
