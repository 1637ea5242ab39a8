// Copyright (c) 2025 - Cowboy AI, LLC.

//! Software signers and the per-CA signer pool
//!
//! A CA owns a pool of [`Signer`]s; signing parallelism is bounded by a
//! semaphore because signers may delegate to hardware with limited
//! sessions. Software signers back the pool with in-memory RSA, ECDSA
//! P-256 and Ed25519 keys.

use async_trait::async_trait;
use ed25519_dalek::pkcs8::DecodePrivateKey as _;
use p256::pkcs8::{DecodePrivateKey as _, EncodePublicKey as _};
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs8::{DecodePrivateKey as _, EncodePublicKey as _};
use rsa::signature::{SignatureEncoding, Signer as _};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Semaphore;
use x509_cert::spki::SubjectPublicKeyInfoOwned;

use crate::profile::publickey::parse_spki;
use crate::traits::Signer;
use crate::types::SignatureAlgo;
use crate::{CaError, Result};

/// Serialized signer definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignerConf {
    /// Signer type; only `software` is built in
    #[serde(default = "default_signer_type")]
    pub r#type: String,
    /// Signature algorithm
    pub algorithm: SignatureAlgo,
    /// PKCS#8 private key, PEM encoded
    pub private_key_pem: String,
}

fn default_signer_type() -> String {
    "software".to_string()
}

enum SignerKey {
    RsaSha256(rsa::pkcs1v15::SigningKey<sha2::Sha256>),
    RsaSha384(rsa::pkcs1v15::SigningKey<sha2::Sha384>),
    RsaSha512(rsa::pkcs1v15::SigningKey<sha2::Sha512>),
    EcdsaP256(p256::ecdsa::SigningKey),
    Ed25519(Box<ed25519_dalek::SigningKey>),
}

/// A signer backed by an in-memory software key
pub struct SoftwareSigner {
    algorithm: SignatureAlgo,
    key: SignerKey,
}

impl SoftwareSigner {
    /// Load a signer from a PKCS#8 DER private key
    pub fn from_pkcs8_der(algorithm: SignatureAlgo, pkcs8: &[u8]) -> Result<Self> {
        let key = match algorithm {
            SignatureAlgo::RsaSha256 | SignatureAlgo::RsaSha384 | SignatureAlgo::RsaSha512 => {
                let private = rsa::RsaPrivateKey::from_pkcs8_der(pkcs8).map_err(|e| {
                    CaError::InvalidConf(format!("invalid RSA private key: {}", e))
                })?;
                match algorithm {
                    SignatureAlgo::RsaSha256 => {
                        SignerKey::RsaSha256(rsa::pkcs1v15::SigningKey::new(private))
                    }
                    SignatureAlgo::RsaSha384 => {
                        SignerKey::RsaSha384(rsa::pkcs1v15::SigningKey::new(private))
                    }
                    _ => SignerKey::RsaSha512(rsa::pkcs1v15::SigningKey::new(private)),
                }
            }
            SignatureAlgo::EcdsaSha256 => {
                let secret = p256::SecretKey::from_pkcs8_der(pkcs8).map_err(|e| {
                    CaError::InvalidConf(format!("invalid EC private key: {}", e))
                })?;
                SignerKey::EcdsaP256(p256::ecdsa::SigningKey::from(&secret))
            }
            SignatureAlgo::EcdsaSha384 => {
                return Err(CaError::InvalidConf(
                    "ecdsa-sha384 is not supported by the software signer".to_string(),
                ))
            }
            SignatureAlgo::Ed25519 => {
                let key = ed25519_dalek::SigningKey::from_pkcs8_der(pkcs8).map_err(|e| {
                    CaError::InvalidConf(format!("invalid Ed25519 private key: {}", e))
                })?;
                SignerKey::Ed25519(Box::new(key))
            }
        };
        Ok(Self { algorithm, key })
    }

    /// Load a signer from a conf
    pub fn from_conf(conf: &SignerConf) -> Result<Self> {
        if conf.r#type != "software" {
            return Err(CaError::InvalidConf(format!(
                "unknown signer type: {}",
                conf.r#type
            )));
        }
        let parsed = pem::parse(&conf.private_key_pem)
            .map_err(|e| CaError::InvalidConf(format!("invalid signer PEM: {}", e)))?;
        Self::from_pkcs8_der(conf.algorithm, parsed.contents())
    }

    /// Generate a fresh software signer, returning it with the public key
    pub fn generate(algorithm: SignatureAlgo) -> Result<(Self, SubjectPublicKeyInfoOwned)> {
        match algorithm {
            SignatureAlgo::RsaSha256 | SignatureAlgo::RsaSha384 | SignatureAlgo::RsaSha512 => {
                let private = rsa::RsaPrivateKey::new(&mut OsRng, 2048)
                    .map_err(|e| CaError::SystemFailure(format!("RSA keygen failed: {}", e)))?;
                let public_der = private
                    .to_public_key()
                    .to_public_key_der()
                    .map_err(|e| CaError::SystemFailure(format!("SPKI encoding failed: {}", e)))?;
                let spki = parse_spki(public_der.as_bytes())?;
                let key = match algorithm {
                    SignatureAlgo::RsaSha256 => {
                        SignerKey::RsaSha256(rsa::pkcs1v15::SigningKey::new(private))
                    }
                    SignatureAlgo::RsaSha384 => {
                        SignerKey::RsaSha384(rsa::pkcs1v15::SigningKey::new(private))
                    }
                    _ => SignerKey::RsaSha512(rsa::pkcs1v15::SigningKey::new(private)),
                };
                Ok((Self { algorithm, key }, spki))
            }
            SignatureAlgo::EcdsaSha256 => {
                let secret = p256::SecretKey::random(&mut OsRng);
                let public_der = secret
                    .public_key()
                    .to_public_key_der()
                    .map_err(|e| CaError::SystemFailure(format!("SPKI encoding failed: {}", e)))?;
                let spki = parse_spki(public_der.as_bytes())?;
                Ok((
                    Self {
                        algorithm,
                        key: SignerKey::EcdsaP256(p256::ecdsa::SigningKey::from(&secret)),
                    },
                    spki,
                ))
            }
            SignatureAlgo::EcdsaSha384 => Err(CaError::InvalidConf(
                "ecdsa-sha384 is not supported by the software signer".to_string(),
            )),
            SignatureAlgo::Ed25519 => {
                let mut seed = [0u8; 32];
                OsRng.fill_bytes(&mut seed);
                let key = ed25519_dalek::SigningKey::from_bytes(&seed);
                let spki = SubjectPublicKeyInfoOwned {
                    algorithm: x509_cert::spki::AlgorithmIdentifierOwned {
                        oid: crate::asn1::alg::ED25519,
                        parameters: None,
                    },
                    subject_public_key: der::asn1::BitString::from_bytes(
                        key.verifying_key().as_bytes(),
                    )?,
                };
                Ok((
                    Self {
                        algorithm,
                        key: SignerKey::Ed25519(Box::new(key)),
                    },
                    spki,
                ))
            }
        }
    }
}

#[async_trait]
impl Signer for SoftwareSigner {
    fn algorithm(&self) -> SignatureAlgo {
        self.algorithm
    }

    async fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
        match &self.key {
            SignerKey::RsaSha256(key) => {
                let sig: rsa::pkcs1v15::Signature = key.sign(data);
                Ok(sig.to_vec())
            }
            SignerKey::RsaSha384(key) => {
                let sig: rsa::pkcs1v15::Signature = key.sign(data);
                Ok(sig.to_vec())
            }
            SignerKey::RsaSha512(key) => {
                let sig: rsa::pkcs1v15::Signature = key.sign(data);
                Ok(sig.to_vec())
            }
            SignerKey::EcdsaP256(key) => {
                let sig: p256::ecdsa::Signature = key.sign(data);
                Ok(sig.to_der().as_bytes().to_vec())
            }
            SignerKey::Ed25519(key) => {
                use ed25519_dalek::Signer as _;
                Ok(key.sign(data).to_bytes().to_vec())
            }
        }
    }
}

/// A CA's pool of signers with bounded signing parallelism
pub struct SignerPool {
    signers: Vec<Arc<dyn Signer>>,
    permits: Arc<Semaphore>,
}

impl SignerPool {
    /// Create a pool; `parallelism` bounds concurrent sign operations
    pub fn new(signers: Vec<Arc<dyn Signer>>, parallelism: usize) -> Self {
        Self {
            signers,
            permits: Arc::new(Semaphore::new(parallelism.max(1))),
        }
    }

    /// Algorithms offered by this pool
    pub fn algorithms(&self) -> Vec<SignatureAlgo> {
        self.signers.iter().map(|s| s.algorithm()).collect()
    }

    /// Select the first signer matching the preference-ordered list
    pub fn select(&self, preferred: &[SignatureAlgo]) -> Option<Arc<dyn Signer>> {
        for algo in preferred {
            if let Some(signer) = self.signers.iter().find(|s| s.algorithm() == *algo) {
                return Some(signer.clone());
            }
        }
        None
    }

    /// Sign under the pool's parallelism bound
    pub async fn sign(&self, signer: &Arc<dyn Signer>, data: &[u8]) -> Result<Vec<u8>> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| CaError::SystemFailure("signer pool is shut down".to_string()))?;
        signer.sign(data).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ecdsa_signer_produces_der_signatures() {
        let (signer, _spki) = SoftwareSigner::generate(SignatureAlgo::EcdsaSha256).unwrap();
        let sig = signer.sign(b"data").await.unwrap();
        // DER SEQUENCE of two INTEGERs
        assert_eq!(sig[0], 0x30);
    }

    #[tokio::test]
    async fn ed25519_signatures_are_64_bytes() {
        let (signer, _spki) = SoftwareSigner::generate(SignatureAlgo::Ed25519).unwrap();
        let sig = signer.sign(b"data").await.unwrap();
        assert_eq!(sig.len(), 64);
    }

    #[tokio::test]
    async fn pool_selects_by_preference_order() {
        let (ec, _) = SoftwareSigner::generate(SignatureAlgo::EcdsaSha256).unwrap();
        let (ed, _) = SoftwareSigner::generate(SignatureAlgo::Ed25519).unwrap();
        let pool = SignerPool::new(vec![Arc::new(ec), Arc::new(ed)], 4);

        let chosen = pool
            .select(&[SignatureAlgo::Ed25519, SignatureAlgo::EcdsaSha256])
            .unwrap();
        assert_eq!(chosen.algorithm(), SignatureAlgo::Ed25519);
        assert!(pool.select(&[SignatureAlgo::RsaSha512]).is_none());
    }
}
