//! A single ES256 signing key and its public representations.
//!
//! The key id is the RFC 7638 JWK thumbprint of the public key, so the same
//! key material always yields the same `kid` across restarts.

use std::fmt;

use base64::{
    Engine as _,
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
};
use chrono::{DateTime, Utc};
use jsonwebtoken::{
    DecodingKey, EncodingKey,
    jwk::{
        AlgorithmParameters, CommonParameters, EllipticCurve, EllipticCurveKeyParameters,
        EllipticCurveKeyType, Jwk, KeyAlgorithm, PublicKeyUse,
    },
};
use rcgen::KeyPair;
use sha2::{Digest, Sha256};

use super::KeyError;

/// DER prefix of a P-256 `SubjectPublicKeyInfo` up to the uncompressed point.
const P256_SPKI_PREFIX: [u8; 26] = [
    0x30, 0x59, 0x30, 0x13, 0x06, 0x07, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x02, 0x01, 0x06, 0x08,
    0x2a, 0x86, 0x48, 0xce, 0x3d, 0x03, 0x01, 0x07, 0x03, 0x42, 0x00,
];
const P256_SPKI_LEN: usize = P256_SPKI_PREFIX.len() + 65;
const COORDINATE_LEN: usize = 32;

/// An asymmetric signing key with its verification material.
#[derive(Clone)]
pub struct SigningKey {
    kid: String,
    encoding: EncodingKey,
    decoding: DecodingKey,
    public_pem: String,
    jwk: Jwk,
    created_at: DateTime<Utc>,
    retired_at: Option<DateTime<Utc>>,
}

impl SigningKey {
    /// Generate a fresh P-256 key.
    pub fn generate() -> Result<Self, KeyError> {
        Self::from_pkcs8_pem(&generate_pkcs8_pem()?)
    }

    /// Load a key from a PKCS#8 PEM document.
    pub fn from_pkcs8_pem(pem: &str) -> Result<Self, KeyError> {
        let key_pair = KeyPair::from_pem(pem).map_err(|e| KeyError::Generation(e.to_string()))?;
        let private_pem = key_pair.serialize_pem();
        let public_pem = key_pair.public_key_pem();

        let (x, y) = ec_point_coordinates(&public_pem)?;
        let kid = thumbprint(&x, &y);

        let encoding = EncodingKey::from_ec_pem(private_pem.as_bytes())
            .map_err(|e| KeyError::Generation(e.to_string()))?;
        let decoding = DecodingKey::from_ec_pem(public_pem.as_bytes())
            .map_err(|e| KeyError::Generation(e.to_string()))?;

        let jwk = Jwk {
            common: CommonParameters {
                public_key_use: Some(PublicKeyUse::Signature),
                key_algorithm: Some(KeyAlgorithm::ES256),
                key_id: Some(kid.clone()),
                ..Default::default()
            },
            algorithm: AlgorithmParameters::EllipticCurve(EllipticCurveKeyParameters {
                key_type: EllipticCurveKeyType::EC,
                curve: EllipticCurve::P256,
                x,
                y,
            }),
        };

        Ok(Self {
            kid,
            encoding,
            decoding,
            public_pem,
            jwk,
            created_at: Utc::now(),
            retired_at: None,
        })
    }

    /// Key id (`kid` header of every token this key signs).
    #[must_use]
    pub fn kid(&self) -> &str {
        &self.kid
    }

    /// Public key as a PEM block.
    #[must_use]
    pub fn public_pem(&self) -> &str {
        &self.public_pem
    }

    /// Public key as a JWK.
    #[must_use]
    pub fn jwk(&self) -> &Jwk {
        &self.jwk
    }

    /// When this key was loaded or generated.
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// When this key stopped being the active key, if it has.
    #[must_use]
    pub fn retired_at(&self) -> Option<DateTime<Utc>> {
        self.retired_at
    }

    pub(super) fn encoding_key(&self) -> &EncodingKey {
        &self.encoding
    }

    pub(super) fn decoding_key(&self) -> &DecodingKey {
        &self.decoding
    }

    pub(super) fn retire(&self, at: DateTime<Utc>) -> Self {
        let mut retired = self.clone();
        retired.retired_at = Some(at);
        retired
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("kid", &self.kid)
            .field("created_at", &self.created_at)
            .field("retired_at", &self.retired_at)
            .finish_non_exhaustive()
    }
}

/// Generate a P-256 private key as PKCS#8 PEM.
pub fn generate_pkcs8_pem() -> Result<String, KeyError> {
    let key_pair = KeyPair::generate().map_err(|e| KeyError::Generation(e.to_string()))?;
    Ok(key_pair.serialize_pem())
}

/// Extract the base64url `x` and `y` coordinates from a P-256 public key PEM.
fn ec_point_coordinates(public_pem: &str) -> Result<(String, String), KeyError> {
    let body: String = public_pem
        .lines()
        .filter(|line| !line.starts_with("-----"))
        .map(str::trim)
        .collect();
    let der = STANDARD
        .decode(body)
        .map_err(|e| KeyError::Generation(format!("invalid public key PEM: {e}")))?;

    if der.len() != P256_SPKI_LEN || der[..P256_SPKI_PREFIX.len()] != P256_SPKI_PREFIX {
        return Err(KeyError::Generation(
            "signing key must be an ECDSA P-256 key".to_string(),
        ));
    }
    let point = &der[P256_SPKI_PREFIX.len()..];
    if point[0] != 0x04 {
        return Err(KeyError::Generation(
            "compressed EC points are not supported".to_string(),
        ));
    }

    let x = URL_SAFE_NO_PAD.encode(&point[1..=COORDINATE_LEN]);
    let y = URL_SAFE_NO_PAD.encode(&point[1 + COORDINATE_LEN..]);
    Ok((x, y))
}

/// RFC 7638 thumbprint over the required EC members in lexicographic order.
fn thumbprint(x: &str, y: &str) -> String {
    let canonical = format!(r#"{{"crv":"P-256","kty":"EC","x":"{x}","y":"{y}"}}"#);
    URL_SAFE_NO_PAD.encode(Sha256::digest(canonical.as_bytes()))
}
