//! Trait definitions at the component seams
//!
//! Low-level cryptographic primitives are assumed available behind
//! [`Signer`]; publishers and keypair generators are pluggable the same
//! way. Implementations backed by software keys live in [`crate::signer`]
//! and [`crate::issuance::keygen`].

use async_trait::async_trait;
use x509_cert::spki::SubjectPublicKeyInfoOwned;
use zeroize::Zeroizing;

use crate::types::{KeySpec, NameId, RevocationInfo, Serial, SignatureAlgo};
use crate::Result;

/// Abstract signing primitive
///
/// A signer owns exactly one key and one signature algorithm. Signing may
/// delegate to hardware and is treated as a suspension point; it is not
/// interruptible once started.
#[async_trait]
pub trait Signer: Send + Sync {
    /// Signature algorithm this signer produces
    fn algorithm(&self) -> SignatureAlgo;

    /// Sign `data`, returning the signature in the X.509 wire form
    /// (PKCS#1 v1.5 block, DER-encoded ECDSA, or raw EdDSA)
    async fn sign(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// What happened to a certificate, as seen by publishers
#[derive(Debug, Clone)]
pub enum PublishEventKind {
    /// Certificate was issued
    Issued,
    /// Certificate was revoked or suspended
    Revoked(RevocationInfo),
    /// Certificate was released from hold
    Unrevoked,
    /// Certificate row was physically removed
    Removed,
}

/// A single certificate event handed to publishers
#[derive(Debug, Clone)]
pub struct CertPublishEvent {
    /// Issuing CA
    pub ca: NameId,
    /// Certificate serial
    pub serial: Serial,
    /// DER of the certificate, when still available
    pub cert_der: Option<Vec<u8>>,
    /// Event kind
    pub kind: PublishEventKind,
}

/// Certificate publisher fan-out target
///
/// Publishers are notified asynchronously; a failed delivery is queued for
/// republish and never fails the originating operation.
#[async_trait]
pub trait CertPublisher: Send + Sync {
    /// Registered publisher name
    fn name(&self) -> &str;

    /// Deliver one certificate event
    async fn publish(&self, event: &CertPublishEvent) -> Result<()>;

    /// Deliver a generated CRL
    async fn publish_crl(&self, ca: &NameId, crl_der: &[u8]) -> Result<()>;
}

/// A freshly generated keypair
///
/// The private key is PKCS#8 DER and zeroized on drop.
pub struct GeneratedKeypair {
    /// PKCS#8 DER of the private key
    pub private_key_der: Zeroizing<Vec<u8>>,
    /// SubjectPublicKeyInfo derived from the private key
    pub spki: SubjectPublicKeyInfoOwned,
}

/// Server-side keypair generation capability
///
/// Each generator declares which key specs it supports; the granted
/// template builder selects the first supporting generator.
#[async_trait]
pub trait KeypairGenerator: Send + Sync {
    /// Registered generator name
    fn name(&self) -> &str;

    /// True when this generator can produce keys of `spec`
    fn supports(&self, spec: &KeySpec) -> bool;

    /// Generate a keypair of `spec`
    async fn generate(&self, spec: &KeySpec) -> Result<GeneratedKeypair>;
}
