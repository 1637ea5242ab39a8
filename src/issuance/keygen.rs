// Copyright (c) 2025 - Cowboy AI, LLC.

//! Server-side keypair generation
//!
//! Each key algorithm is wrapped in a [`PublicKeyDeriver`] capability so
//! the SubjectPublicKeyInfo of a generated private key is produced by one
//! implementation per algorithm; adding an algorithm never touches the
//! template builder.

use async_trait::async_trait;
use ed25519_dalek::pkcs8::{DecodePrivateKey as _, EncodePrivateKey as _};
use p256::pkcs8::{DecodePrivateKey as _, EncodePrivateKey as _, EncodePublicKey as _};
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs8::{DecodePrivateKey as _, EncodePrivateKey as _, EncodePublicKey as _};
use x509_cert::spki::SubjectPublicKeyInfoOwned;
use zeroize::Zeroizing;

use crate::profile::publickey::parse_spki;
use crate::traits::{GeneratedKeypair, KeypairGenerator};
use crate::types::{EcCurve, KeySpec};
use crate::{CaError, Result};

/// Derive the SubjectPublicKeyInfo from a PKCS#8 private key
pub trait PublicKeyDeriver: Send + Sync {
    /// True when this deriver handles keys of `spec`
    fn matches(&self, spec: &KeySpec) -> bool;

    /// Derive the SPKI from the PKCS#8 DER of the private key
    fn derive_spki(&self, private_pkcs8: &[u8]) -> Result<SubjectPublicKeyInfoOwned>;
}

struct RsaDeriver;

impl PublicKeyDeriver for RsaDeriver {
    fn matches(&self, spec: &KeySpec) -> bool {
        matches!(spec, KeySpec::Rsa { .. })
    }

    fn derive_spki(&self, private_pkcs8: &[u8]) -> Result<SubjectPublicKeyInfoOwned> {
        // RSA: the SPKI is built from modulus and public exponent.
        let private = rsa::RsaPrivateKey::from_pkcs8_der(private_pkcs8)
            .map_err(|e| CaError::SystemFailure(format!("invalid RSA private key: {}", e)))?;
        let der = private
            .to_public_key()
            .to_public_key_der()
            .map_err(|e| CaError::SystemFailure(format!("SPKI encoding failed: {}", e)))?;
        parse_spki(der.as_bytes())
    }
}

struct EcP256Deriver;

impl PublicKeyDeriver for EcP256Deriver {
    fn matches(&self, spec: &KeySpec) -> bool {
        matches!(
            spec,
            KeySpec::Ec {
                curve: EcCurve::P256
            }
        )
    }

    fn derive_spki(&self, private_pkcs8: &[u8]) -> Result<SubjectPublicKeyInfoOwned> {
        // EC: the public point is recovered from the private scalar.
        let secret = p256::SecretKey::from_pkcs8_der(private_pkcs8)
            .map_err(|e| CaError::SystemFailure(format!("invalid EC private key: {}", e)))?;
        let der = secret
            .public_key()
            .to_public_key_der()
            .map_err(|e| CaError::SystemFailure(format!("SPKI encoding failed: {}", e)))?;
        parse_spki(der.as_bytes())
    }
}

struct Ed25519Deriver;

impl PublicKeyDeriver for Ed25519Deriver {
    fn matches(&self, spec: &KeySpec) -> bool {
        matches!(spec, KeySpec::Ed25519)
    }

    fn derive_spki(&self, private_pkcs8: &[u8]) -> Result<SubjectPublicKeyInfoOwned> {
        // EdDSA: the SPKI carries the raw public key data.
        let key = ed25519_dalek::SigningKey::from_pkcs8_der(private_pkcs8)
            .map_err(|e| CaError::SystemFailure(format!("invalid Ed25519 private key: {}", e)))?;
        Ok(SubjectPublicKeyInfoOwned {
            algorithm: x509_cert::spki::AlgorithmIdentifierOwned {
                oid: crate::asn1::alg::ED25519,
                parameters: None,
            },
            subject_public_key: der::asn1::BitString::from_bytes(
                key.verifying_key().as_bytes(),
            )?,
        })
    }
}

const DERIVERS: &[&dyn PublicKeyDeriver] = &[&RsaDeriver, &EcP256Deriver, &Ed25519Deriver];

/// Derive the SPKI of a generated private key through the capability
/// registry
pub fn derive_public_key(spec: &KeySpec, private_pkcs8: &[u8]) -> Result<SubjectPublicKeyInfoOwned> {
    for deriver in DERIVERS {
        if deriver.matches(spec) {
            return deriver.derive_spki(private_pkcs8);
        }
    }
    Err(CaError::SystemFailure(format!(
        "no public-key deriver for {}",
        spec
    )))
}

/// Software keypair generator for RSA, EC P-256 and Ed25519
pub struct SoftwareKeypairGenerator {
    name: String,
}

impl SoftwareKeypairGenerator {
    /// Create a generator registered under `name`
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl KeypairGenerator for SoftwareKeypairGenerator {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports(&self, spec: &KeySpec) -> bool {
        match spec {
            KeySpec::Rsa { bits } => (2048..=8192).contains(bits) && bits % 8 == 0,
            KeySpec::Ec { curve } => *curve == EcCurve::P256,
            KeySpec::Ed25519 => true,
            _ => false,
        }
    }

    async fn generate(&self, spec: &KeySpec) -> Result<GeneratedKeypair> {
        if !self.supports(spec) {
            return Err(CaError::SystemFailure(format!(
                "keypair generator {} does not support {}",
                self.name, spec
            )));
        }
        let private_key_der: Zeroizing<Vec<u8>> = match spec {
            KeySpec::Rsa { bits } => {
                let private = rsa::RsaPrivateKey::new(&mut OsRng, *bits as usize)
                    .map_err(|e| CaError::SystemFailure(format!("RSA keygen failed: {}", e)))?;
                let doc = private.to_pkcs8_der().map_err(|e| {
                    CaError::SystemFailure(format!("PKCS#8 encoding failed: {}", e))
                })?;
                Zeroizing::new(doc.as_bytes().to_vec())
            }
            KeySpec::Ec { .. } => {
                let secret = p256::SecretKey::random(&mut OsRng);
                let doc = secret.to_pkcs8_der().map_err(|e| {
                    CaError::SystemFailure(format!("PKCS#8 encoding failed: {}", e))
                })?;
                Zeroizing::new(doc.as_bytes().to_vec())
            }
            KeySpec::Ed25519 => {
                let mut seed = [0u8; 32];
                OsRng.fill_bytes(&mut seed);
                let key = ed25519_dalek::SigningKey::from_bytes(&seed);
                let doc = key.to_pkcs8_der().map_err(|e| {
                    CaError::SystemFailure(format!("PKCS#8 encoding failed: {}", e))
                })?;
                Zeroizing::new(doc.as_bytes().to_vec())
            }
            _ => unreachable!("supports() filtered unsupported specs"),
        };

        let spki = derive_public_key(spec, &private_key_der)?;
        Ok(GeneratedKeypair {
            private_key_der,
            spki,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asn1::alg;

    #[tokio::test]
    async fn generates_ec_keypair_with_matching_spki() {
        let generator = SoftwareKeypairGenerator::new("software");
        let spec = KeySpec::Ec {
            curve: EcCurve::P256,
        };
        let keypair = generator.generate(&spec).await.unwrap();

        assert_eq!(keypair.spki.algorithm.oid, alg::EC_PUBLIC_KEY);
        let rederived = derive_public_key(&spec, &keypair.private_key_der).unwrap();
        assert_eq!(rederived, keypair.spki);
    }

    #[tokio::test]
    async fn generates_ed25519_keypair() {
        let generator = SoftwareKeypairGenerator::new("software");
        let keypair = generator.generate(&KeySpec::Ed25519).await.unwrap();
        assert_eq!(keypair.spki.algorithm.oid, alg::ED25519);
        assert_eq!(keypair.spki.subject_public_key.raw_bytes().len(), 32);
    }

    #[test]
    fn x448_not_supported() {
        let generator = SoftwareKeypairGenerator::new("software");
        assert!(!generator.supports(&KeySpec::X448));
    }
}
