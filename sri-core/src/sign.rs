//! XAdES-BES enveloped signatures over SRI documents.
//!
//! The signer unlocks a PKCS#12 bundle, digests the canonical document, builds the
//! `KeyInfo` and `SignedProperties` fragments, signs the canonical `SignedInfo` with
//! RSA PKCS#1 v1.5 and splices the resulting `ds:Signature` before the closing root tag.
mod template;

use base64ct::{Base64, Encoding};
use chrono::{DateTime, FixedOffset, Offset, Utc};
use openssl::{
    hash::MessageDigest,
    pkcs12::Pkcs12,
    pkey::{PKey, Private},
    sign::Signer,
};
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::{fmt, path::Path};
use thiserror::Error;
use x509_cert::{Certificate, der::Decode};
use zeroize::Zeroizing;

use crate::access_key::AccessKey;
use crate::document::constants::{RSA_SHA1_URI, RSA_SHA256_URI, SHA1_URI, SHA256_URI};
use crate::document::{DocumentError, UnsignedDocument};
use template::{
    KeyInfoValues, ReferenceDigests, SignatureIds, SignedPropertiesValues, in_scope_namespaces,
    namespace_attributes,
};

/// Ecuador (mainland) is UTC-05:00 all year.
const ECUADOR_UTC_OFFSET_SECS: i32 = 5 * 3600;
const SIGNING_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%:z";

#[derive(Debug, Error)]
pub enum SigningError {
    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),
    #[error("certificate is only valid from {not_before} to {not_after}")]
    ExpiredCertificate {
        not_before: DateTime<Utc>,
        not_after: DateTime<Utc>,
    },
    #[error(transparent)]
    MalformedDocument(#[from] DocumentError),
    #[error("signing error: {0}")]
    Crypto(String),
}

/// Digest used for references and the RSA signature.
///
/// The SRI currently mandates SHA-1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestAlgorithm {
    #[default]
    Sha1,
    Sha256,
}

impl DigestAlgorithm {
    pub fn digest_uri(&self) -> &'static str {
        match self {
            DigestAlgorithm::Sha1 => SHA1_URI,
            DigestAlgorithm::Sha256 => SHA256_URI,
        }
    }

    pub fn signature_uri(&self) -> &'static str {
        match self {
            DigestAlgorithm::Sha1 => RSA_SHA1_URI,
            DigestAlgorithm::Sha256 => RSA_SHA256_URI,
        }
    }

    pub fn digest(&self, data: &[u8]) -> Vec<u8> {
        match self {
            DigestAlgorithm::Sha1 => Sha1::digest(data).to_vec(),
            DigestAlgorithm::Sha256 => Sha256::digest(data).to_vec(),
        }
    }

    pub fn digest_base64(&self, data: &[u8]) -> String {
        Base64::encode_string(&self.digest(data))
    }

    fn message_digest(&self) -> MessageDigest {
        match self {
            DigestAlgorithm::Sha1 => MessageDigest::sha1(),
            DigestAlgorithm::Sha256 => MessageDigest::sha256(),
        }
    }
}

/// A PKCS#12 bundle and its password, supplied per signing call.
///
/// Both buffers are wiped on drop.
pub struct SigningCredential {
    pkcs12: Zeroizing<Vec<u8>>,
    password: Zeroizing<String>,
}

impl SigningCredential {
    pub fn new(pkcs12: Vec<u8>, password: impl Into<String>) -> Self {
        Self {
            pkcs12: Zeroizing::new(pkcs12),
            password: Zeroizing::new(password.into()),
        }
    }

    pub fn from_file(path: &Path, password: impl Into<String>) -> Result<Self, SigningError> {
        let pkcs12 = std::fs::read(path).map_err(|e| {
            SigningError::InvalidCertificate(format!("failed to read {}: {e}", path.display()))
        })?;
        Ok(Self::new(pkcs12, password))
    }

    /// Unlock the bundle and describe its certificate as of now.
    pub fn certificate_info(&self) -> Result<CertificateInfo, SigningError> {
        self.certificate_info_at(Utc::now())
    }

    pub fn certificate_info_at(
        &self,
        now: DateTime<Utc>,
    ) -> Result<CertificateInfo, SigningError> {
        validate_certificate_at(&self.pkcs12, &self.password, now)
    }
}

impl fmt::Debug for SigningCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningCredential")
            .field("pkcs12", &format_args!("<{} bytes redacted>", self.pkcs12.len()))
            .field("password", &format_args!("<redacted>"))
            .finish()
    }
}

/// Certificate details of a PKCS#12 bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CertificateInfo {
    pub subject: String,
    pub issuer: String,
    pub serial: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    /// Whether `not_before <= now <= not_after` at validation time.
    pub valid: bool,
}

impl CertificateInfo {
    pub fn ensure_current(&self) -> Result<(), SigningError> {
        if self.valid {
            Ok(())
        } else {
            Err(SigningError::ExpiredCertificate {
                not_before: self.not_before,
                not_after: self.not_after,
            })
        }
    }
}

pub fn validate_certificate(
    pkcs12: &[u8],
    password: &str,
) -> Result<CertificateInfo, SigningError> {
    validate_certificate_at(pkcs12, password, Utc::now())
}

pub fn validate_certificate_at(
    pkcs12: &[u8],
    password: &str,
    now: DateTime<Utc>,
) -> Result<CertificateInfo, SigningError> {
    describe_certificate(&unlock(pkcs12, password)?.certificate, now)
}

fn describe_certificate(
    certificate: &Certificate,
    now: DateTime<Utc>,
) -> Result<CertificateInfo, SigningError> {
    let tbs = &certificate.tbs_certificate;
    let not_before = certificate_time(tbs.validity.not_before)?;
    let not_after = certificate_time(tbs.validity.not_after)?;
    let (issuer, serial) = issuer_and_serial(certificate);
    Ok(CertificateInfo {
        subject: tbs.subject.to_string(),
        issuer,
        serial,
        not_before,
        not_after,
        valid: not_before <= now && now <= not_after,
    })
}

/// Output of [`DocumentSigner::sign`].
#[derive(Debug, Clone)]
pub struct SignedDocument {
    xml: String,
    access_key: AccessKey,
    signature_xml: String,
    signing_time: DateTime<FixedOffset>,
    certificate: CertificateInfo,
    document_digest: String,
    canonical_signed_info: String,
    signature_value: String,
}

impl SignedDocument {
    pub fn xml(&self) -> &str {
        &self.xml
    }

    pub fn into_xml(self) -> String {
        self.xml
    }

    pub fn access_key(&self) -> &AccessKey {
        &self.access_key
    }

    /// The embedded `ds:Signature` element.
    pub fn signature_xml(&self) -> &str {
        &self.signature_xml
    }

    /// The signing certificate, with `valid` evaluated at the signing time.
    pub fn certificate(&self) -> &CertificateInfo {
        &self.certificate
    }

    pub fn signing_time(&self) -> DateTime<FixedOffset> {
        self.signing_time
    }

    /// Base64 digest of the canonical unsigned document.
    pub fn document_digest(&self) -> &str {
        &self.document_digest
    }

    /// The exact bytes that were signed.
    pub fn canonical_signed_info(&self) -> &str {
        &self.canonical_signed_info
    }

    pub fn signature_value(&self) -> &str {
        &self.signature_value
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DocumentSigner {
    digest: DigestAlgorithm,
}

impl DocumentSigner {
    pub fn new(digest: DigestAlgorithm) -> Self {
        Self { digest }
    }

    pub fn digest(&self) -> DigestAlgorithm {
        self.digest
    }

    pub fn sign(
        &self,
        xml: &str,
        credential: SigningCredential,
    ) -> Result<SignedDocument, SigningError> {
        self.sign_at(xml, credential, ecuador_time(Utc::now()))
    }

    pub fn sign_at(
        &self,
        xml: &str,
        credential: SigningCredential,
        signing_time: DateTime<FixedOffset>,
    ) -> Result<SignedDocument, SigningError> {
        let document = UnsignedDocument::parse(xml)?;
        let unlocked = unlock(&credential.pkcs12, &credential.password)?;
        drop(credential);

        let rsa = unlocked.key.rsa().map_err(|_| {
            SigningError::InvalidCertificate("private key is not an RSA key".into())
        })?;
        let ids = SignatureIds::for_key(document.access_key());
        let ns = namespace_attributes(&in_scope_namespaces(document.namespaces()));

        let document_digest = self.digest.digest_base64(document.canonicalize()?.as_bytes());

        let certificate = Base64::encode_string(&unlocked.cert_der);
        let modulus = Base64::encode_string(&rsa.n().to_vec());
        let exponent = Base64::encode_string(&rsa.e().to_vec());
        let key_info_values = KeyInfoValues {
            certificate: &certificate,
            modulus: &modulus,
            exponent: &exponent,
        };
        let key_info_digest = self
            .digest
            .digest_base64(template::key_info(&ns, &ids, &key_info_values).as_bytes());

        let certificate_info =
            describe_certificate(&unlocked.certificate, signing_time.with_timezone(&Utc))?;
        let (issuer, serial) = issuer_and_serial(&unlocked.certificate);
        let formatted_time = signing_time.format(SIGNING_TIME_FORMAT).to_string();
        let cert_digest = self.digest.digest_base64(&unlocked.cert_der);
        let properties = SignedPropertiesValues {
            signing_time: &formatted_time,
            cert_digest: &cert_digest,
            issuer: &issuer,
            serial: &serial,
        };
        let signed_properties_digest = self.digest.digest_base64(
            template::signed_properties(&ns, &ids, self.digest, &properties).as_bytes(),
        );

        let document_uri = document
            .root_id()
            .map(|id| format!("#{id}"))
            .unwrap_or_default();
        let digests = ReferenceDigests {
            signed_properties: &signed_properties_digest,
            key_info: &key_info_digest,
            document: &document_digest,
            document_uri: &document_uri,
        };
        let canonical_signed_info = template::signed_info(&ns, &ids, self.digest, &digests);
        let signature_value =
            rsa_sign(&unlocked.key, self.digest, canonical_signed_info.as_bytes())?;

        let signature_xml = template::signature(
            &ids,
            &template::signed_info("", &ids, self.digest, &digests),
            &signature_value,
            &template::key_info("", &ids, &key_info_values),
            &template::signed_properties("", &ids, self.digest, &properties),
        );
        let signed_xml = document.splice_before_root_close(&signature_xml)?;
        log::debug!(
            "signed document {} ({:?}, signing time {formatted_time})",
            document.access_key(),
            self.digest
        );

        Ok(SignedDocument {
            xml: signed_xml,
            access_key: document.access_key().clone(),
            signature_xml,
            signing_time,
            certificate: certificate_info,
            document_digest,
            canonical_signed_info,
            signature_value,
        })
    }
}

pub(crate) fn ecuador_offset() -> FixedOffset {
    FixedOffset::west_opt(ECUADOR_UTC_OFFSET_SECS).unwrap_or_else(|| Utc.fix())
}

/// `at` expressed in Ecuador local time.
pub fn ecuador_time(at: DateTime<Utc>) -> DateTime<FixedOffset> {
    at.with_timezone(&ecuador_offset())
}

struct UnlockedCredential {
    key: PKey<Private>,
    cert_der: Vec<u8>,
    certificate: Certificate,
}

fn unlock(pkcs12: &[u8], password: &str) -> Result<UnlockedCredential, SigningError> {
    let parsed = Pkcs12::from_der(pkcs12)
        .map_err(|e| SigningError::InvalidCertificate(format!("not a PKCS#12 bundle: {e}")))?
        .parse2(password)
        .map_err(|_| {
            SigningError::InvalidCertificate("wrong password or corrupt PKCS#12 bundle".into())
        })?;
    let key = parsed
        .pkey
        .ok_or_else(|| SigningError::InvalidCertificate("bundle has no private key".into()))?;
    let cert = parsed
        .cert
        .ok_or_else(|| SigningError::InvalidCertificate("bundle has no certificate".into()))?;
    let cert_der = cert
        .to_der()
        .map_err(|e| SigningError::InvalidCertificate(format!("certificate DER error: {e}")))?;
    let certificate = Certificate::from_der(&cert_der)
        .map_err(|e| SigningError::InvalidCertificate(format!("certificate parse error: {e:?}")))?;
    Ok(UnlockedCredential {
        key,
        cert_der,
        certificate,
    })
}

fn rsa_sign(
    key: &PKey<Private>,
    digest: DigestAlgorithm,
    data: &[u8],
) -> Result<String, SigningError> {
    let mut signer = Signer::new(digest.message_digest(), key)
        .map_err(|e| SigningError::Crypto(format!("failed to initialise signer: {e}")))?;
    signer
        .update(data)
        .map_err(|e| SigningError::Crypto(e.to_string()))?;
    let signature = signer
        .sign_to_vec()
        .map_err(|e| SigningError::Crypto(format!("failed to sign SignedInfo: {e}")))?;
    Ok(Base64::encode_string(&signature))
}

fn certificate_time(time: x509_cert::time::Time) -> Result<DateTime<Utc>, SigningError> {
    let secs = time.to_unix_duration().as_secs();
    i64::try_from(secs)
        .ok()
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
        .ok_or_else(|| SigningError::InvalidCertificate("validity out of range".into()))
}

fn issuer_and_serial(cert: &Certificate) -> (String, String) {
    let serial = serial_bytes_to_decimal_string(cert.tbs_certificate.serial_number.as_bytes());
    let issuer = cert
        .tbs_certificate
        .issuer
        .to_string()
        .split(',')
        .map(|part| part.trim())
        .collect::<Vec<_>>()
        .join(",");
    (issuer, serial)
}

fn serial_bytes_to_decimal_string(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return "0".to_string();
    }

    let mut digits: Vec<u8> = vec![0];
    for &byte in bytes {
        let mut carry = byte as u32;
        for digit in digits.iter_mut() {
            let value = (*digit as u32) * 256 + carry;
            *digit = (value % 10) as u8;
            carry = value / 10;
        }
        while carry > 0 {
            digits.push((carry % 10) as u8);
            carry /= 10;
        }
    }

    while digits.len() > 1 && matches!(digits.last(), Some(0)) {
        digits.pop();
    }

    digits.iter().rev().map(|d| (b'0' + *d) as char).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serial_bytes_to_decimal_handles_large_values() {
        assert_eq!(serial_bytes_to_decimal_string(&[0x01]), "1");
        assert_eq!(serial_bytes_to_decimal_string(&[0x01, 0x00]), "256");
        assert_eq!(serial_bytes_to_decimal_string(&[0x00, 0x01]), "1");
        assert_eq!(serial_bytes_to_decimal_string(&[0xFF, 0xFF]), "65535");
        assert_eq!(
            serial_bytes_to_decimal_string(&[0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]),
            "18446744073709551616"
        );
    }

    #[test]
    fn digest_algorithms_map_to_uris() {
        assert_eq!(DigestAlgorithm::default(), DigestAlgorithm::Sha1);
        assert_eq!(DigestAlgorithm::Sha1.digest(b"abc").len(), 20);
        assert_eq!(DigestAlgorithm::Sha256.digest(b"abc").len(), 32);
        assert!(DigestAlgorithm::Sha1.signature_uri().ends_with("rsa-sha1"));
        assert_eq!(
            DigestAlgorithm::Sha1.digest_base64(b"abc"),
            "qZk+NkcGgWq6PiVxeFDCbJzQ2J0="
        );
    }

    #[test]
    fn ecuador_time_uses_fixed_offset() {
        let at = DateTime::<Utc>::from_timestamp(1_720_195_200, 0).expect("timestamp");
        let local = ecuador_time(at);
        assert_eq!(
            local.format(SIGNING_TIME_FORMAT).to_string(),
            "2024-07-05T11:00:00-05:00"
        );
    }

    #[test]
    fn credential_debug_is_redacted() {
        let credential = SigningCredential::new(vec![1, 2, 3], "s3cret");
        let debug = format!("{credential:?}");
        assert!(!debug.contains("s3cret"));
        assert!(debug.contains("3 bytes redacted"));
    }

    #[test]
    fn non_pkcs12_bytes_are_invalid_certificate() {
        let err = validate_certificate(b"not a bundle", "pw").expect_err("invalid");
        assert!(matches!(err, SigningError::InvalidCertificate(_)));
    }
}
