//! Configuration and environment selection.
use serde::{Deserialize, Serialize};
use std::{path::Path, str::FromStr, time::Duration};
use thiserror::Error;

use crate::sign::DigestAlgorithm;

/// SRI environment selection.
/// This determines which reception/authorization endpoints the client talks to and the
/// environment digit embedded in every access key.
/// - Test: what the SRI calls "ambiente de pruebas" (celcer.sri.gob.ec).
/// - Production: the live environment (cel.sri.gob.ec).
/// # Examples
/// ```rust
/// use std::str::FromStr;
/// use sri_core::config::EnvironmentType;
///
/// let env = EnvironmentType::from_str("pruebas")?;
/// assert_eq!(env, EnvironmentType::Test);
/// assert_eq!(env.code(), '1');
/// # Ok::<(), sri_core::config::EnvironmentParseError>(())
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvironmentType {
    Test,
    Production,
}

/// Error returned when parsing an [`EnvironmentType`] from a string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvironmentParseError {
    #[error("invalid environment type: {input}")]
    Invalid { input: String },
}

impl FromStr for EnvironmentType {
    type Err = EnvironmentParseError;
    fn from_str(env: &str) -> Result<EnvironmentType, EnvironmentParseError> {
        match env.trim().to_ascii_lowercase().as_str() {
            "test" | "pruebas" | "1" => Ok(EnvironmentType::Test),
            "production" | "produccion" | "producción" | "2" => Ok(EnvironmentType::Production),
            _ => Err(EnvironmentParseError::Invalid {
                input: env.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for EnvironmentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl EnvironmentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvironmentType::Test => "test",
            EnvironmentType::Production => "production",
        }
    }

    /// Digit used in position 24 of the access key.
    pub fn code(&self) -> char {
        match self {
            EnvironmentType::Test => '1',
            EnvironmentType::Production => '2',
        }
    }

    pub fn from_code(code: char) -> Option<Self> {
        match code {
            '1' => Some(EnvironmentType::Test),
            '2' => Some(EnvironmentType::Production),
            _ => None,
        }
    }

    /// Label the SRI uses in authorization responses (`<ambiente>`).
    pub fn sri_label(&self) -> &'static str {
        match self {
            EnvironmentType::Test => "PRUEBAS",
            EnvironmentType::Production => "PRODUCCION",
        }
    }

    fn host(&self) -> &'static str {
        match self {
            EnvironmentType::Test => "https://celcer.sri.gob.ec",
            EnvironmentType::Production => "https://cel.sri.gob.ec",
        }
    }
}

/// Reception and authorization web-service addresses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoints {
    reception: String,
    authorization: String,
}

impl Endpoints {
    pub fn new(reception: impl Into<String>, authorization: impl Into<String>) -> Self {
        Self {
            reception: reception.into(),
            authorization: authorization.into(),
        }
    }

    /// Offline web services published by the SRI for the given environment.
    pub fn for_environment(env: EnvironmentType) -> Self {
        let host = env.host();
        Self {
            reception: format!(
                "{host}/comprobantes-electronicos-ws/RecepcionComprobantesOffline"
            ),
            authorization: format!(
                "{host}/comprobantes-electronicos-ws/AutorizacionComprobantesOffline"
            ),
        }
    }

    pub fn reception(&self) -> &str {
        &self.reception
    }

    pub fn authorization(&self) -> &str {
        &self.authorization
    }
}

/// How often and how many times the authorization service is queried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollingPolicy {
    max_attempts: u32,
    #[serde(rename = "interval_ms", with = "duration_ms")]
    interval: Duration,
}

impl PollingPolicy {
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            interval,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

impl Default for PollingPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            interval: Duration::from_millis(2500),
        }
    }
}

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Toml(#[from] toml::de::Error),
    #[error(transparent)]
    Environment(#[from] EnvironmentParseError),
}

/// Configuration for the SRI client and the submission orchestrator.
///
/// # Examples
/// ```rust
/// use std::time::Duration;
/// use sri_core::config::{Config, EnvironmentType, PollingPolicy};
///
/// let config = Config::new(EnvironmentType::Test)
///     .with_polling(PollingPolicy::new(5, Duration::from_secs(1)));
/// assert_eq!(config.polling().max_attempts(), 5);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    env: EnvironmentType,
    endpoints: Endpoints,
    request_timeout: Duration,
    polling: PollingPolicy,
    digest: DigestAlgorithm,
}

impl Config {
    pub fn new(env: EnvironmentType) -> Self {
        Self {
            env,
            endpoints: Endpoints::for_environment(env),
            request_timeout: Duration::from_secs(20),
            polling: PollingPolicy::default(),
            digest: DigestAlgorithm::default(),
        }
    }

    pub fn with_endpoints(mut self, endpoints: Endpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_polling(mut self, polling: PollingPolicy) -> Self {
        self.polling = polling;
        self
    }

    pub fn with_digest(mut self, digest: DigestAlgorithm) -> Self {
        self.digest = digest;
        self
    }

    /// Replace endpoints from `SRI_RECEPTION_URL` / `SRI_AUTHORIZATION_URL` when set.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(url) = std::env::var("SRI_RECEPTION_URL") {
            self.endpoints.reception = url;
        }
        if let Ok(url) = std::env::var("SRI_AUTHORIZATION_URL") {
            self.endpoints.authorization = url;
        }
        self
    }

    /// Parse a TOML document. Only `environment` is required.
    ///
    /// ```toml
    /// environment = "production"
    /// request_timeout_ms = 15000
    /// digest = "sha1"
    ///
    /// [polling]
    /// max_attempts = 10
    /// interval_ms = 2500
    /// ```
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(input)?;
        let env = EnvironmentType::from_str(&file.environment)?;
        let mut config = Config::new(env);
        if let Some(endpoints) = file.endpoints {
            config.endpoints = endpoints;
        }
        if let Some(ms) = file.request_timeout_ms {
            config.request_timeout = Duration::from_millis(ms);
        }
        if let Some(polling) = file.polling {
            config.polling = PollingPolicy::new(polling.max_attempts, polling.interval);
        }
        if let Some(digest) = file.digest {
            config.digest = digest;
        }
        Ok(config)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let input = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&input)
    }

    pub fn env(&self) -> EnvironmentType {
        self.env
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn polling(&self) -> PollingPolicy {
        self.polling
    }

    pub fn digest(&self) -> DigestAlgorithm {
        self.digest
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::new(EnvironmentType::Test)
    }
}

#[derive(Debug, Deserialize)]
struct ConfigFile {
    environment: String,
    endpoints: Option<Endpoints>,
    request_timeout_ms: Option<u64>,
    polling: Option<PollingPolicy>,
    digest: Option<DigestAlgorithm>,
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub(super) fn serialize<S>(value: &Duration, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        s.serialize_u64(value.as_millis() as u64)
    }

    pub(super) fn deserialize<'de, D>(d: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
