// Copyright (c) 2025 - Cowboy AI, LLC.

//! Issuance: granted template building and server-side key generation

pub mod keygen;
pub mod template;

pub use keygen::{derive_public_key, PublicKeyDeriver, SoftwareKeypairGenerator};
pub use template::{
    build_granted_template, CertTemplateData, GrantedCertTemplate, PublicKeyRequest,
};
