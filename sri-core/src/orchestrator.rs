//! Submission workflow: validate the access key, sign, send to reception and poll the
//! authorization service until a terminal answer or the attempt budget runs out.
//!
//! The orchestrator owns no shared state between submissions. Network access goes
//! through [`SriGateway`] and waiting goes through [`Clock`], so the whole workflow can be
//! driven by scripted fakes.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{fmt, future::Future, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::sync::{mpsc, watch};

use crate::{
    access_key::AccessKey,
    api::{AuthorizationResult, Authorization, SriClient, SriError, SriMessage, SubmissionResult},
    config::{Config, EnvironmentType},
    document::{DocumentError, UnsignedDocument},
    sign::{DocumentSigner, SigningCredential, SigningError, ecuador_time},
};

/// Reception and authorization calls used by the orchestrator.
#[async_trait]
pub trait SriGateway: Send + Sync {
    async fn submit(&self, signed_xml: &str) -> Result<SubmissionResult, SriError>;
    async fn query_authorization(&self, key: &AccessKey) -> Result<AuthorizationResult, SriError>;
}

#[async_trait]
impl SriGateway for SriClient {
    async fn submit(&self, signed_xml: &str) -> Result<SubmissionResult, SriError> {
        SriClient::submit(self, signed_xml).await
    }

    async fn query_authorization(&self, key: &AccessKey) -> Result<AuthorizationResult, SriError> {
        SriClient::query_authorization(self, key).await
    }
}

#[async_trait]
impl<T: SriGateway + ?Sized> SriGateway for Arc<T> {
    async fn submit(&self, signed_xml: &str) -> Result<SubmissionResult, SriError> {
        (**self).submit(signed_xml).await
    }

    async fn query_authorization(&self, key: &AccessKey) -> Result<AuthorizationResult, SriError> {
        (**self).query_authorization(key).await
    }
}

/// Time source for progress timestamps, signing times and polling waits.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
    async fn sleep(&self, duration: Duration);
}

/// Wall clock backed by tokio timers.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[async_trait]
impl<T: Clock + ?Sized> Clock for Arc<T> {
    fn now(&self) -> DateTime<Utc> {
        (**self).now()
    }

    async fn sleep(&self, duration: Duration) {
        (**self).sleep(duration).await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ProcessState {
    Idle,
    KeyValidated,
    Signed,
    Submitted,
    Polling { attempt: u32 },
    Authorized,
    Rejected,
    TimedOut,
    Cancelled,
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessState::Idle => f.write_str("idle"),
            ProcessState::KeyValidated => f.write_str("key-validated"),
            ProcessState::Signed => f.write_str("signed"),
            ProcessState::Submitted => f.write_str("submitted"),
            ProcessState::Polling { attempt } => write!(f, "polling#{attempt}"),
            ProcessState::Authorized => f.write_str("authorized"),
            ProcessState::Rejected => f.write_str("rejected"),
            ProcessState::TimedOut => f.write_str("timed-out"),
            ProcessState::Cancelled => f.write_str("cancelled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressEvent {
    pub at: DateTime<Utc>,
    pub state: ProcessState,
    pub message: String,
}

/// Receiver of state transitions.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: ProgressEvent);
}

impl<F> ProgressSink for F
where
    F: Fn(ProgressEvent) + Send + Sync,
{
    fn emit(&self, event: ProgressEvent) {
        self(event)
    }
}

impl ProgressSink for mpsc::UnboundedSender<ProgressEvent> {
    fn emit(&self, event: ProgressEvent) {
        // a dropped receiver only means nobody is listening
        let _ = self.send(event);
    }
}

/// Forwards progress events to the `log` facade.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn emit(&self, event: ProgressEvent) {
        log::info!("[{}] {}", event.state, event.message);
    }
}

/// Cooperative cancellation for a running submission.
#[derive(Debug, Clone)]
pub struct CancelToken {
    sender: Arc<watch::Sender<bool>>,
    receiver: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
            receiver,
        }
    }

    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        if receiver.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// One document to authorize.
#[derive(Debug)]
pub struct SubmissionRequest {
    pub unsigned_xml: String,
    pub credential: Option<SigningCredential>,
}

impl SubmissionRequest {
    pub fn new(unsigned_xml: impl Into<String>) -> Self {
        Self {
            unsigned_xml: unsigned_xml.into(),
            credential: None,
        }
    }

    pub fn with_credential(mut self, credential: SigningCredential) -> Self {
        self.credential = Some(credential);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingReason {
    /// Every polling attempt came back without a terminal answer.
    TimedOut,
    Cancelled,
}

/// Final result of a submission. Protocol rejections are outcomes, not errors.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SubmissionOutcome {
    Authorized {
        access_key: AccessKey,
        authorization: Authorization,
        signed_xml: Option<String>,
    },
    Rejected {
        access_key: AccessKey,
        reason: String,
        messages: Vec<SriMessage>,
        signed_xml: Option<String>,
    },
    /// Not yet decided; poll again later with [`Orchestrator::resume_polling`].
    Pending {
        access_key: AccessKey,
        reason: PendingReason,
        signed_xml: Option<String>,
    },
}

impl SubmissionOutcome {
    pub fn access_key(&self) -> &AccessKey {
        match self {
            SubmissionOutcome::Authorized { access_key, .. }
            | SubmissionOutcome::Rejected { access_key, .. }
            | SubmissionOutcome::Pending { access_key, .. } => access_key,
        }
    }

    pub fn state(&self) -> ProcessState {
        match self {
            SubmissionOutcome::Authorized { .. } => ProcessState::Authorized,
            SubmissionOutcome::Rejected { .. } => ProcessState::Rejected,
            SubmissionOutcome::Pending {
                reason: PendingReason::TimedOut,
                ..
            } => ProcessState::TimedOut,
            SubmissionOutcome::Pending {
                reason: PendingReason::Cancelled,
                ..
            } => ProcessState::Cancelled,
        }
    }
}

/// Failures detected before or instead of a protocol answer.
#[derive(Debug, Error)]
pub enum SubmissionError {
    #[error(transparent)]
    MalformedDocument(#[from] DocumentError),
    #[error("access key is for the {key} environment but the client is configured for {configured}")]
    EnvironmentMismatch {
        key: EnvironmentType,
        configured: EnvironmentType,
    },
    #[error("a signing credential is required in the production environment")]
    MissingCredential,
    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),
    #[error("transport error: {0}")]
    Transport(#[from] SriError),
}

impl SubmissionError {
    pub fn is_retryable(&self) -> bool {
        match self {
            SubmissionError::Transport(e) => e.is_retryable(),
            _ => false,
        }
    }
}

enum SignStep {
    Signed(String),
    Refused(String),
}

/// Drives one document through the SRI workflow.
///
/// # Examples
/// ```rust,no_run
/// use sri_core::api::SriClient;
/// use sri_core::config::Config;
/// use sri_core::orchestrator::{LogProgress, Orchestrator, SubmissionRequest, SystemClock};
///
/// # async fn run(xml: String) -> Result<(), Box<dyn std::error::Error>> {
/// let config = Config::default();
/// let orchestrator = Orchestrator::new(SriClient::new(config.clone())?, SystemClock, config);
/// let outcome = orchestrator
///     .submit(SubmissionRequest::new(xml), &LogProgress)
///     .await?;
/// println!("{:?}", outcome.state());
/// # Ok(())
/// # }
/// ```
pub struct Orchestrator<G, C = SystemClock> {
    gateway: G,
    clock: C,
    config: Config,
    signer: DocumentSigner,
}

impl<G: SriGateway, C: Clock> Orchestrator<G, C> {
    pub fn new(gateway: G, clock: C, config: Config) -> Self {
        let signer = DocumentSigner::new(config.digest());
        Self {
            gateway,
            clock,
            config,
            signer,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub async fn submit(
        &self,
        request: SubmissionRequest,
        progress: &dyn ProgressSink,
    ) -> Result<SubmissionOutcome, SubmissionError> {
        self.submit_with_cancel(request, progress, &CancelToken::new())
            .await
    }

    pub async fn submit_with_cancel(
        &self,
        request: SubmissionRequest,
        progress: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<SubmissionOutcome, SubmissionError> {
        let SubmissionRequest {
            unsigned_xml,
            credential,
        } = request;
        self.emit(progress, ProcessState::Idle, "validating document");

        let access_key = UnsignedDocument::parse(&unsigned_xml)?.access_key().clone();
        self.ensure_env(&access_key)?;
        if credential.is_none() && self.config.env() == EnvironmentType::Production {
            return Err(SubmissionError::MissingCredential);
        }
        self.emit(
            progress,
            ProcessState::KeyValidated,
            format!("access key {access_key}"),
        );

        let xml = match credential {
            Some(credential) => match self.sign(&unsigned_xml, credential)? {
                SignStep::Signed(xml) => {
                    self.emit(progress, ProcessState::Signed, "document signed");
                    xml
                }
                SignStep::Refused(reason) => {
                    self.emit(progress, ProcessState::Rejected, reason.clone());
                    return Ok(SubmissionOutcome::Rejected {
                        access_key,
                        reason,
                        messages: Vec::new(),
                        signed_xml: None,
                    });
                }
            },
            None => {
                log::warn!("no credential supplied, submitting {access_key} unsigned");
                self.emit(
                    progress,
                    ProcessState::Signed,
                    "signing skipped in the test environment",
                );
                unsigned_xml
            }
        };

        match self.bounded(self.gateway.submit(&xml)).await {
            Ok(SubmissionResult::Received) => {
                self.emit(progress, ProcessState::Submitted, "RECIBIDA");
            }
            Ok(SubmissionResult::InProgress { .. }) => {
                self.emit(
                    progress,
                    ProcessState::Submitted,
                    "access key already in processing",
                );
            }
            Ok(SubmissionResult::Returned { messages }) => {
                let reason = describe(&messages, "DEVUELTA");
                self.emit(progress, ProcessState::Rejected, reason.clone());
                return Ok(SubmissionOutcome::Rejected {
                    access_key,
                    reason,
                    messages,
                    signed_xml: Some(xml),
                });
            }
            Err(e) if e.signals_in_progress() => {
                self.emit(
                    progress,
                    ProcessState::Submitted,
                    format!("access key already in processing ({e})"),
                );
            }
            Err(e) => {
                log::warn!("reception of {access_key} failed: {e}");
                return Err(SubmissionError::Transport(e));
            }
        }

        self.poll(access_key, Some(xml), progress, cancel).await
    }

    /// Poll a previously submitted document without sending it again.
    pub async fn resume_polling(
        &self,
        key: &AccessKey,
        progress: &dyn ProgressSink,
    ) -> Result<SubmissionOutcome, SubmissionError> {
        self.ensure_env(key)?;
        self.emit(
            progress,
            ProcessState::KeyValidated,
            format!("resuming authorization of {key}"),
        );
        self.poll(key.clone(), None, progress, &CancelToken::new())
            .await
    }
}

impl<G: SriGateway, C: Clock> Orchestrator<G, C> {
    fn ensure_env(&self, key: &AccessKey) -> Result<(), SubmissionError> {
        if key.environment() != self.config.env() {
            return Err(SubmissionError::EnvironmentMismatch {
                key: key.environment(),
                configured: self.config.env(),
            });
        }
        Ok(())
    }

    fn sign(&self, xml: &str, credential: SigningCredential) -> Result<SignStep, SubmissionError> {
        match self
            .signer
            .sign_at(xml, credential, ecuador_time(self.clock.now()))
        {
            Ok(signed) => match signed.certificate().ensure_current() {
                Ok(()) => Ok(SignStep::Signed(signed.into_xml())),
                Err(e) => Ok(SignStep::Refused(e.to_string())),
            },
            Err(SigningError::InvalidCertificate(reason)) => {
                Err(SubmissionError::InvalidCertificate(reason))
            }
            Err(e) => Ok(SignStep::Refused(e.to_string())),
        }
    }

    async fn poll(
        &self,
        access_key: AccessKey,
        signed_xml: Option<String>,
        progress: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<SubmissionOutcome, SubmissionError> {
        let policy = self.config.polling();
        for attempt in 1..=policy.max_attempts() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.emit(progress, ProcessState::Cancelled, "cancelled while polling");
                    return Ok(SubmissionOutcome::Pending {
                        access_key,
                        reason: PendingReason::Cancelled,
                        signed_xml,
                    });
                }
                _ = self.clock.sleep(policy.interval()) => {}
            }

            self.emit(
                progress,
                ProcessState::Polling { attempt },
                format!("authorization query {attempt}/{}", policy.max_attempts()),
            );
            match self
                .bounded(self.gateway.query_authorization(&access_key))
                .await
            {
                Ok(AuthorizationResult::Authorized(authorization)) => {
                    self.emit(
                        progress,
                        ProcessState::Authorized,
                        format!("authorization number {}", authorization.number),
                    );
                    return Ok(SubmissionOutcome::Authorized {
                        access_key,
                        authorization,
                        signed_xml,
                    });
                }
                Ok(AuthorizationResult::NotAuthorized { reason, messages }) => {
                    self.emit(progress, ProcessState::Rejected, reason.clone());
                    return Ok(SubmissionOutcome::Rejected {
                        access_key,
                        reason,
                        messages,
                        signed_xml,
                    });
                }
                Ok(AuthorizationResult::Pending | AuthorizationResult::NotFound) => {}
                Err(e) => log::warn!("authorization query {attempt} for {access_key} failed: {e}"),
            }
        }

        self.emit(
            progress,
            ProcessState::TimedOut,
            format!(
                "no final answer after {} attempts",
                policy.max_attempts()
            ),
        );
        Ok(SubmissionOutcome::Pending {
            access_key,
            reason: PendingReason::TimedOut,
            signed_xml,
        })
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, SriError>>,
    ) -> Result<T, SriError> {
        let limit = self.config.request_timeout();
        tokio::time::timeout(limit, call)
            .await
            .unwrap_or(Err(SriError::Timeout(limit)))
    }

    fn emit(&self, progress: &dyn ProgressSink, state: ProcessState, message: impl Into<String>) {
        let event = ProgressEvent {
            at: self.clock.now(),
            state,
            message: message.into(),
        };
        log::debug!("{} {}", event.state, event.message);
        progress.emit(event);
    }
}

fn describe(messages: &[SriMessage], fallback: &str) -> String {
    if messages.is_empty() {
        return fallback.to_string();
    }
    messages
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
