//! Error types for CA and OCSP operations

use thiserror::Error;

/// Result type alias for CA operations
pub type Result<T> = std::result::Result<T, CaError>;

/// Main error type for certification-authority operations
#[derive(Error, Debug)]
pub enum CaError {
    /// A certificate with the granted subject or serial was already issued
    #[error("already issued: {0}")]
    AlreadyIssued(String),

    /// The request template violates profile or issuer policy
    #[error("bad certificate template: {0}")]
    BadCertTemplate(String),

    /// The operation is not permitted in the current state
    #[error("not permitted: {0}")]
    NotPermitted(String),

    /// Unexpected I/O, signer or crypto failure (sanitized before surfacing)
    #[error("system failure: {0}")]
    SystemFailure(String),

    /// The named certificate profile is not registered
    #[error("unknown certificate profile: {0}")]
    UnknownCertProfile(String),

    /// CRL generation or publication failed
    #[error("CRL failure: {0}")]
    CrlFailure(String),

    /// Database operation failed
    #[error("database failure: {0}")]
    DatabaseFailure(String),

    /// Malformed or inconsistent request
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Contradictory or invalid profile configuration, detected at load
    #[error("profile configuration error: {0}")]
    ProfileConfig(String),

    /// Registry insertion with a name that is already taken
    #[error("duplicate name: {0}")]
    DuplicateName(String),

    /// Registry insertion with an id that is already taken
    #[error("duplicate id: {0}")]
    DuplicateId(String),

    /// Entity not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Entity already exists
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Wall clock moved backwards beyond tolerance
    #[error("clock regression of {regression_secs}s detected")]
    ClockRegression {
        /// Observed regression in seconds
        regression_secs: i64,
    },

    /// Master lock is held by another instance
    #[error("lock failed: {0}")]
    LockFailed(String),

    /// Invalid manager or store configuration
    #[error("configuration error: {0}")]
    InvalidConf(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// DER encoding/decoding errors
    #[error("DER error: {0}")]
    Der(#[from] der::Error),
}

impl CaError {
    /// Stable issuance error code as surfaced through the issuance API.
    ///
    /// Every error that escapes the issuance path maps onto one of the
    /// eight stable identifiers; unexpected conditions collapse into
    /// `SYSTEM_FAILURE`.
    pub fn code(&self) -> &'static str {
        match self {
            CaError::AlreadyIssued(_) => "ALREADY_ISSUED",
            CaError::BadCertTemplate(_) => "BAD_CERT_TEMPLATE",
            CaError::NotPermitted(_) => "NOT_PERMITTED",
            CaError::UnknownCertProfile(_) => "UNKNOWN_CERT_PROFILE",
            CaError::CrlFailure(_) => "CRL_FAILURE",
            CaError::DatabaseFailure(_) => "DATABASE_FAILURE",
            CaError::BadRequest(_) | CaError::NotFound(_) | CaError::AlreadyExists(_) => {
                "BAD_REQUEST"
            }
            _ => "SYSTEM_FAILURE",
        }
    }
}

/// Errors raised by the OCSP certificate store
///
/// Known datasource failures are converted into `DataSource`; anything
/// unexpected is elided to `Unexpected` with the detail going to logs only.
#[derive(Error, Debug)]
pub enum OcspStoreError {
    /// The underlying datasource failed
    #[error("datasource error: {0}")]
    DataSource(String),

    /// A stored issuer certificate could not be decoded
    #[error("issuer decode error: {0}")]
    IssuerDecode(String),

    /// The store is not initialized (required schema entries missing)
    #[error("store not initialized: {0}")]
    NotInitialized(String),

    /// Unexpected internal error
    #[error("unexpected OCSP store error")]
    Unexpected(String),
}

impl From<CaError> for OcspStoreError {
    fn from(err: CaError) -> Self {
        match err {
            CaError::DatabaseFailure(msg) => OcspStoreError::DataSource(msg),
            other => OcspStoreError::Unexpected(other.to_string()),
        }
    }
}
