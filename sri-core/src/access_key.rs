//! 49-digit access keys ("clave de acceso") and their modulo-11 check digit.
//!
//! Layout, left to right:
//!
//! | field              | digits |
//! |--------------------|--------|
//! | issue date         | 8 (`DDMMYYYY`) |
//! | document type      | 2 |
//! | taxpayer RUC       | 13 |
//! | environment        | 1 |
//! | establishment      | 3 |
//! | emission point     | 3 |
//! | sequential         | 9 |
//! | numeric code       | 8 |
//! | emission type      | 1 |
//! | check digit        | 1 |
use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use thiserror::Error;

use crate::config::EnvironmentType;

pub const ACCESS_KEY_LEN: usize = 49;
const BASE_LEN: usize = ACCESS_KEY_LEN - 1;

/// Access key errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AccessKeyError {
    #[error("access key must have {ACCESS_KEY_LEN} digits, got {0}")]
    InvalidLength(usize),
    #[error("access key must be numeric")]
    NonNumeric,
    #[error("check digit mismatch: expected {expected}, found {found}")]
    ChecksumMismatch { expected: u8, found: u8 },
    #[error("invalid {field}: '{value}'")]
    InvalidField { field: &'static str, value: String },
    #[error("unknown document type code '{0}'")]
    UnknownDocumentType(String),
}

/// Tax document kinds ("tipo de comprobante").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DocumentType {
    Invoice,
    PurchaseSettlement,
    CreditNote,
    DebitNote,
    Remittance,
    Retention,
}

impl DocumentType {
    pub fn code(&self) -> &'static str {
        match self {
            DocumentType::Invoice => "01",
            DocumentType::PurchaseSettlement => "03",
            DocumentType::CreditNote => "04",
            DocumentType::DebitNote => "05",
            DocumentType::Remittance => "06",
            DocumentType::Retention => "07",
        }
    }
}

impl FromStr for DocumentType {
    type Err = AccessKeyError;

    fn from_str(code: &str) -> Result<Self, Self::Err> {
        match code.trim() {
            "01" => Ok(DocumentType::Invoice),
            "03" => Ok(DocumentType::PurchaseSettlement),
            "04" => Ok(DocumentType::CreditNote),
            "05" => Ok(DocumentType::DebitNote),
            "06" => Ok(DocumentType::Remittance),
            "07" => Ok(DocumentType::Retention),
            other => Err(AccessKeyError::UnknownDocumentType(other.to_string())),
        }
    }
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Emission type ("tipo de emisión"). Only normal emission is accepted by the SRI.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EmissionType {
    #[default]
    Normal,
}

impl EmissionType {
    pub fn code(&self) -> char {
        match self {
            EmissionType::Normal => '1',
        }
    }
}

impl FromStr for EmissionType {
    type Err = AccessKeyError;

    fn from_str(code: &str) -> Result<Self, Self::Err> {
        match code.trim() {
            "1" => Ok(EmissionType::Normal),
            other => Err(AccessKeyError::InvalidField {
                field: "emission type",
                value: other.to_string(),
            }),
        }
    }
}

/// Inputs for [`AccessKey::generate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessKeyParts {
    pub issue_date: NaiveDate,
    pub document_type: DocumentType,
    pub ruc: String,
    pub environment: EnvironmentType,
    pub establishment: String,
    pub emission_point: String,
    pub sequential: String,
    /// Eight digits. A random code is drawn when `None`.
    pub numeric_code: Option<String>,
    pub emission_type: EmissionType,
}

/// A structurally valid 49-digit access key.
///
/// # Examples
/// ```rust
/// use sri_core::access_key::generate_access_key;
///
/// let key = generate_access_key(
///     "05072024", "01", "1790011223001", "1", "001", "001", "000000001",
///     Some("12345678"), None,
/// )?;
/// assert_eq!(key.as_str().len(), 49);
/// assert_eq!(key.ruc(), "1790011223001");
/// # Ok::<(), sri_core::access_key::AccessKeyError>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AccessKey(String);

impl AccessKey {
    pub fn generate(parts: &AccessKeyParts) -> Result<AccessKey, AccessKeyError> {
        let ruc = exact_digits("RUC", &parts.ruc, 13)?;
        let establishment = padded_digits("establishment", &parts.establishment, 3)?;
        let emission_point = padded_digits("emission point", &parts.emission_point, 3)?;
        let sequential = padded_digits("sequential", &parts.sequential, 9)?;
        let numeric_code = match parts.numeric_code.as_deref() {
            Some(code) => exact_digits("numeric code", code, 8)?,
            None => random_numeric_code(),
        };

        let mut base = String::with_capacity(ACCESS_KEY_LEN);
        base.push_str(&parts.issue_date.format("%d%m%Y").to_string());
        base.push_str(parts.document_type.code());
        base.push_str(&ruc);
        base.push(parts.environment.code());
        base.push_str(&establishment);
        base.push_str(&emission_point);
        base.push_str(&sequential);
        base.push_str(&numeric_code);
        base.push(parts.emission_type.code());

        if base.len() != BASE_LEN {
            return Err(AccessKeyError::InvalidField {
                field: "issue date",
                value: parts.issue_date.to_string(),
            });
        }

        let check = checksum(&base)?;
        base.push(char::from(b'0' + check));
        AccessKey::parse(&base)
    }

    /// Validate a 49-digit key: length, digits, check digit, date, document type and
    /// environment.
    pub fn parse(input: &str) -> Result<AccessKey, AccessKeyError> {
        let input = input.trim();
        if input.len() != ACCESS_KEY_LEN {
            return Err(AccessKeyError::InvalidLength(input.chars().count()));
        }
        if !input.bytes().all(|b| b.is_ascii_digit()) {
            return Err(AccessKeyError::NonNumeric);
        }

        let expected = checksum(&input[..BASE_LEN])?;
        let found = input.as_bytes()[BASE_LEN] - b'0';
        if expected != found {
            return Err(AccessKeyError::ChecksumMismatch { expected, found });
        }

        let key = AccessKey(input.to_string());
        parse_issue_date(&input[0..8])?;
        DocumentType::from_str(&input[8..10])?;
        if EnvironmentType::from_code(key.environment_code()).is_none() {
            return Err(AccessKeyError::InvalidField {
                field: "environment",
                value: key.environment_code().to_string(),
            });
        }
        Ok(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn issue_date(&self) -> NaiveDate {
        // validated on construction
        parse_issue_date(&self.0[0..8]).unwrap_or(NaiveDate::MIN)
    }

    pub fn document_type(&self) -> DocumentType {
        DocumentType::from_str(&self.0[8..10]).unwrap_or(DocumentType::Invoice)
    }

    pub fn ruc(&self) -> &str {
        &self.0[10..23]
    }

    pub fn environment(&self) -> EnvironmentType {
        EnvironmentType::from_code(self.environment_code()).unwrap_or(EnvironmentType::Test)
    }

    pub fn establishment(&self) -> &str {
        &self.0[24..27]
    }

    pub fn emission_point(&self) -> &str {
        &self.0[27..30]
    }

    pub fn sequential(&self) -> &str {
        &self.0[30..39]
    }

    pub fn numeric_code(&self) -> &str {
        &self.0[39..47]
    }

    pub fn emission_type(&self) -> char {
        char::from(self.0.as_bytes()[47])
    }

    pub fn check_digit(&self) -> u8 {
        self.0.as_bytes()[BASE_LEN] - b'0'
    }

    fn environment_code(&self) -> char {
        char::from(self.0.as_bytes()[23])
    }
}

impl FromStr for AccessKey {
    type Err = AccessKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AccessKey::parse(s)
    }
}

impl TryFrom<String> for AccessKey {
    type Error = AccessKeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        AccessKey::parse(&value)
    }
}

impl From<AccessKey> for String {
    fn from(key: AccessKey) -> Self {
        key.0
    }
}

impl fmt::Display for AccessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for AccessKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Modulo-11 check digit over the 48-digit base.
///
/// Digits are weighted right to left with 2, 3, 4, 5, 6, 7, 2, 3, ... and
/// the digit is `11 - sum % 11`, where 11 becomes 0 and 10 becomes 1.
pub fn checksum(base: &str) -> Result<u8, AccessKeyError> {
    if base.len() != BASE_LEN {
        return Err(AccessKeyError::InvalidLength(base.len()));
    }
    let mut sum: u32 = 0;
    let mut weight: u32 = 2;
    for byte in base.bytes().rev() {
        if !byte.is_ascii_digit() {
            return Err(AccessKeyError::NonNumeric);
        }
        sum += u32::from(byte - b'0') * weight;
        weight = if weight == 7 { 2 } else { weight + 1 };
    }
    let digit = match 11 - (sum % 11) {
        11 => 0,
        10 => 1,
        d => d,
    };
    Ok(digit as u8)
}

/// Result of [`validate_access_key`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccessKeyValidation {
    pub valid: bool,
    pub reason: Option<String>,
}

pub fn validate_access_key(input: &str) -> AccessKeyValidation {
    match AccessKey::parse(input) {
        Ok(_) => AccessKeyValidation {
            valid: true,
            reason: None,
        },
        Err(e) => AccessKeyValidation {
            valid: false,
            reason: Some(e.to_string()),
        },
    }
}

/// String-level generator: `date` is `DDMMYYYY` (or `DD/MM/YYYY`), `environment` is the
/// access-key digit or an environment name.
#[allow(clippy::too_many_arguments)]
pub fn generate_access_key(
    date: &str,
    document_type: &str,
    ruc: &str,
    environment: &str,
    establishment: &str,
    emission_point: &str,
    sequential: &str,
    numeric_code: Option<&str>,
    emission_type: Option<&str>,
) -> Result<AccessKey, AccessKeyError> {
    let digits: String = date.chars().filter(|c| *c != '/' && *c != '-').collect();
    let parts = AccessKeyParts {
        issue_date: parse_issue_date(&digits)?,
        document_type: DocumentType::from_str(document_type)?,
        ruc: ruc.to_string(),
        environment: EnvironmentType::from_str(environment).map_err(|_| {
            AccessKeyError::InvalidField {
                field: "environment",
                value: environment.to_string(),
            }
        })?,
        establishment: establishment.to_string(),
        emission_point: emission_point.to_string(),
        sequential: sequential.to_string(),
        numeric_code: numeric_code.map(str::to_string),
        emission_type: emission_type
            .map(EmissionType::from_str)
            .transpose()?
            .unwrap_or_default(),
    };
    AccessKey::generate(&parts)
}

fn parse_issue_date(ddmmyyyy: &str) -> Result<NaiveDate, AccessKeyError> {
    NaiveDate::parse_from_str(ddmmyyyy, "%d%m%Y")
        .ok()
        .filter(|d| ddmmyyyy.len() == 8 && (1000..=9999).contains(&d.year()))
        .ok_or_else(|| AccessKeyError::InvalidField {
            field: "issue date",
            value: ddmmyyyy.to_string(),
        })
}

fn exact_digits(field: &'static str, value: &str, len: usize) -> Result<String, AccessKeyError> {
    let value = value.trim();
    if value.len() != len || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(AccessKeyError::InvalidField {
            field,
            value: value.to_string(),
        });
    }
    Ok(value.to_string())
}

fn padded_digits(field: &'static str, value: &str, len: usize) -> Result<String, AccessKeyError> {
    let value = value.trim();
    if value.is_empty() || value.len() > len || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(AccessKeyError::InvalidField {
            field,
            value: value.to_string(),
        });
    }
    Ok(format!("{value:0>len$}"))
}

fn random_numeric_code() -> String {
    format!("{:08}", rand::random::<u32>() % 100_000_000)
}
