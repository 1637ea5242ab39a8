// Copyright (c) 2025 - Cowboy AI, LLC.

//! Public-key policy checks
//!
//! Canonicalises incoming SubjectPublicKeyInfo to the RFC 3279/5480/8410
//! parameter conventions, enforces the profile's key whitelist, and
//! rejects RSA moduli fingerprinted by the ROCA key-generation flaw.

use der::asn1::ObjectIdentifier;
use der::{Any, AnyRef, Decode, Encode};
use x509_cert::spki::{AlgorithmIdentifierOwned, SubjectPublicKeyInfoOwned};

use crate::asn1::{self, alg};
use crate::types::{EcCurve, KeySpec};
use crate::{CaError, Result};

/// Primes of the ROCA fingerprint test
///
/// A modulus produced by the flawed generator satisfies
/// `n mod p ∈ <65537 mod p>` for every listed prime.
const ROCA_PRIMES: &[u64] = &[
    11, 13, 17, 19, 23, 29, 31, 37, 41, 43, 47, 53, 59, 61, 67, 71, 73, 79, 83, 89, 97, 101,
    103, 107, 109, 113, 127, 131, 137, 139, 149, 151, 157, 163, 167,
];

/// `big-endian bytes mod m` without big-integer arithmetic
fn bytes_mod(bytes: &[u8], m: u64) -> u64 {
    let mut r: u64 = 0;
    for &b in bytes {
        r = (r * 256 + b as u64) % m;
    }
    r
}

/// True when the modulus is in the multiplicative subgroup generated by
/// 65537 for every fingerprint prime
pub fn is_roca_affected(modulus_be: &[u8]) -> bool {
    for &p in ROCA_PRIMES {
        let residue = bytes_mod(modulus_be, p);
        let mut member = false;
        let mut power = 1u64;
        loop {
            if power == residue {
                member = true;
                break;
            }
            power = power * (65537 % p) % p;
            if power == 1 {
                break;
            }
        }
        if !member {
            return false;
        }
    }
    true
}

/// Determine the key spec of a SubjectPublicKeyInfo, rejecting malformed
/// encodings
pub fn key_spec_of(spki: &SubjectPublicKeyInfoOwned) -> Result<KeySpec> {
    let oid = spki.algorithm.oid;
    let key_bits = spki.subject_public_key.raw_bytes();

    if oid == alg::RSA_ENCRYPTION {
        let pk = rsa::pkcs1::RsaPublicKey::from_der(key_bits)
            .map_err(|e| CaError::BadCertTemplate(format!("malformed RSA public key: {}", e)))?;
        let modulus = pk.modulus.as_bytes();
        let bits = modulus
            .iter()
            .position(|&b| b != 0)
            .map(|i| (modulus.len() - i) * 8 - modulus[i].leading_zeros() as usize)
            .unwrap_or(0) as u32;
        Ok(KeySpec::Rsa { bits })
    } else if oid == alg::EC_PUBLIC_KEY {
        let params = spki.algorithm.parameters.as_ref().ok_or_else(|| {
            CaError::BadCertTemplate("EC public key without namedCurve parameter".to_string())
        })?;
        let curve_oid: ObjectIdentifier = params.decode_as().map_err(|_| {
            CaError::BadCertTemplate("EC parameters are not a named curve".to_string())
        })?;
        let curve = asn1::curve_from_oid(&curve_oid).ok_or_else(|| {
            CaError::BadCertTemplate(format!("unsupported EC curve: {}", curve_oid))
        })?;
        check_ec_point(curve, key_bits)?;
        Ok(KeySpec::Ec { curve })
    } else if oid == alg::ED25519 {
        if key_bits.len() != 32 {
            return Err(CaError::BadCertTemplate(
                "malformed Ed25519 public key".to_string(),
            ));
        }
        Ok(KeySpec::Ed25519)
    } else if oid == alg::ED448 {
        if key_bits.len() != 57 {
            return Err(CaError::BadCertTemplate(
                "malformed Ed448 public key".to_string(),
            ));
        }
        Ok(KeySpec::Ed448)
    } else if oid == alg::X25519 {
        Ok(KeySpec::X25519)
    } else if oid == alg::X448 {
        Ok(KeySpec::X448)
    } else {
        Err(CaError::BadCertTemplate(format!(
            "unsupported public key algorithm: {}",
            oid
        )))
    }
}

fn check_ec_point(curve: EcCurve, point: &[u8]) -> Result<()> {
    let coord_len = match curve {
        EcCurve::P256 => 32,
        EcCurve::P384 => 48,
        EcCurve::P521 => 66,
    };
    let valid = match point.first() {
        Some(0x04) => point.len() == 1 + 2 * coord_len,
        Some(0x02) | Some(0x03) => point.len() == 1 + coord_len,
        _ => false,
    };
    if !valid {
        return Err(CaError::BadCertTemplate(
            "malformed EC public key point".to_string(),
        ));
    }
    Ok(())
}

/// Enforce the profile's key whitelist and reject weak keys
///
/// An empty whitelist accepts every supported algorithm. RSA keys are
/// additionally screened for ROCA-affected moduli and non-odd public
/// exponents.
pub fn check_public_key(allowed: &[KeySpec], spki: &SubjectPublicKeyInfoOwned) -> Result<KeySpec> {
    let spec = key_spec_of(spki)?;

    if !allowed.is_empty() && !allowed.contains(&spec) {
        return Err(CaError::BadCertTemplate(format!(
            "public key {} not permitted by the profile",
            spec
        )));
    }

    if let KeySpec::Rsa { bits } = spec {
        if bits < 1024 {
            return Err(CaError::BadCertTemplate(format!(
                "RSA modulus of {} bits is too small",
                bits
            )));
        }
        let pk = rsa::pkcs1::RsaPublicKey::from_der(spki.subject_public_key.raw_bytes())
            .map_err(|e| CaError::BadCertTemplate(format!("malformed RSA public key: {}", e)))?;
        let exponent = pk.public_exponent.as_bytes();
        if exponent.last().map(|b| b % 2 == 0).unwrap_or(true) {
            return Err(CaError::BadCertTemplate(
                "RSA public exponent must be odd".to_string(),
            ));
        }
        if is_roca_affected(pk.modulus.as_bytes()) {
            return Err(CaError::BadCertTemplate(
                "RSA modulus is affected by the ROCA vulnerability".to_string(),
            ));
        }
    }

    Ok(spec)
}

/// Canonicalise a SubjectPublicKeyInfo to the RFC 3279/5480/8410
/// parameter conventions: NULL parameters for RSA, named curve for EC,
/// absent parameters for the Edwards/Montgomery algorithms
pub fn canonicalize_spki(spki: &SubjectPublicKeyInfoOwned) -> Result<SubjectPublicKeyInfoOwned> {
    let oid = spki.algorithm.oid;
    let algorithm = if oid == alg::RSA_ENCRYPTION {
        AlgorithmIdentifierOwned {
            oid,
            parameters: Some(Any::from(AnyRef::NULL)),
        }
    } else if oid == alg::EC_PUBLIC_KEY {
        AlgorithmIdentifierOwned {
            oid,
            parameters: spki.algorithm.parameters.clone(),
        }
    } else {
        AlgorithmIdentifierOwned {
            oid,
            parameters: None,
        }
    };
    Ok(SubjectPublicKeyInfoOwned {
        algorithm,
        subject_public_key: spki.subject_public_key.clone(),
    })
}

/// Parse a DER SubjectPublicKeyInfo
pub fn parse_spki(der_bytes: &[u8]) -> Result<SubjectPublicKeyInfoOwned> {
    SubjectPublicKeyInfoOwned::from_der(der_bytes)
        .map_err(|e| CaError::BadCertTemplate(format!("malformed SubjectPublicKeyInfo: {}", e)))
}

/// Encode a SubjectPublicKeyInfo to DER
pub fn spki_to_der(spki: &SubjectPublicKeyInfoOwned) -> Result<Vec<u8>> {
    Ok(spki.to_der()?)
}
