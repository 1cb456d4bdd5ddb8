//! Client core for the Ecuadorian SRI electronic-document authorization protocol
//! (access keys, XAdES-BES signing, reception and authorization web services).
//!
//! # Examples
//! ```rust
//! use sri_core::access_key::validate_access_key;
//! use sri_core::config::{Config, EnvironmentType};
//!
//! let config = Config::new(EnvironmentType::Test);
//! let report = validate_access_key("0507202401179001122300110010010000000011234567813");
//! assert!(report.valid);
//! # let _ = config;
//! ```
pub mod access_key;
pub mod api;
pub mod config;
pub mod document;
pub mod orchestrator;
pub mod sign;

use thiserror::Error;

/// Top-level error wrapper for core operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    AccessKey(#[from] access_key::AccessKeyError),
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    #[error(transparent)]
    Document(#[from] document::DocumentError),
    #[error(transparent)]
    Signing(#[from] sign::SigningError),
    #[error(transparent)]
    Api(#[from] api::SriError),
    #[error(transparent)]
    Submission(#[from] orchestrator::SubmissionError),
}

#[cfg(test)]
mod tests {
    use super::Error;
    use crate::access_key::AccessKeyError;
    use crate::api::SriError;
    use crate::config::{ConfigError, EnvironmentParseError};
    use crate::document::DocumentError;
    use crate::orchestrator::SubmissionError;
    use crate::sign::SigningError;

    #[test]
    fn error_conversions_cover_variants() {
        let err: Error = AccessKeyError::NonNumeric.into();
        assert!(matches!(err, Error::AccessKey(_)));

        let err: Error = ConfigError::Environment(EnvironmentParseError::Invalid {
            input: "staging".into(),
        })
        .into();
        assert!(matches!(err, Error::Config(_)));

        let err: Error = DocumentError::MalformedDocument("doc".into()).into();
        assert!(matches!(err, Error::Document(_)));

        let err: Error = SigningError::Crypto("sign".into()).into();
        assert!(matches!(err, Error::Signing(_)));

        let err: Error = SriError::InvalidResponse("soap".into()).into();
        assert!(matches!(err, Error::Api(_)));

        let err: Error = SubmissionError::MissingCredential.into();
        assert!(matches!(err, Error::Submission(_)));
        assert_eq!(
            err.to_string(),
            "a signing credential is required in the production environment"
        );
    }
}
