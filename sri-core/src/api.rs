//! SRI reception and authorization web services (SOAP over HTTP).
use base64ct::{Base64, Encoding};
use chrono::{DateTime, FixedOffset, NaiveDateTime};
use libxml::{parser::Parser, tree::Node, xpath};
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

use crate::{
    access_key::AccessKey,
    config::Config,
    document::constants::{AUTHORIZATION_NS, RECEPTION_NS, SOAP_ENV_NS},
    sign::ecuador_offset,
};

/// SRI message code for "CLAVE DE ACCESO EN PROCESAMIENTO".
pub const IN_PROCESSING_CODE: &str = "70";
const IN_PROCESSING_TEXT: &str = "EN PROCESAMIENTO";
const SOAP_CONTENT_TYPE: &str = "text/xml;charset=UTF-8";

/// Errors returned by the SRI web-service client.
#[derive(Error, Debug)]
pub enum SriError {
    #[error("HTTP client error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("server error (status {status}): {body}")]
    Server { status: u16, body: String },
    #[error("invalid response from SRI: {0}")]
    InvalidResponse(String),
}

impl SriError {
    /// Transport-class failures that may succeed when the same call is repeated.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SriError::Transport(_) | SriError::Timeout(_) | SriError::Server { .. }
        )
    }

    /// Whether the SRI reported that the access key is already being processed.
    pub fn signals_in_progress(&self) -> bool {
        match self {
            SriError::Server { body, .. } => mentions_in_processing(body),
            _ => false,
        }
    }
}

/// A message attached to a reception or authorization response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SriMessage {
    pub identifier: String,
    pub message: String,
    pub additional_info: Option<String>,
    /// `ERROR`, `ADVERTENCIA` or `INFORMATIVO`.
    pub kind: Option<String>,
}

impl SriMessage {
    pub fn is_error(&self) -> bool {
        self.kind
            .as_deref()
            .is_none_or(|kind| kind.eq_ignore_ascii_case("ERROR"))
    }

    fn is_in_processing(&self) -> bool {
        self.identifier == IN_PROCESSING_CODE
    }
}

impl std::fmt::Display for SriMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.identifier, self.message)?;
        if let Some(info) = &self.additional_info {
            write!(f, " ({info})")?;
        }
        Ok(())
    }
}

/// Outcome of `validarComprobante`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SubmissionResult {
    /// `RECIBIDA`
    Received,
    /// `DEVUELTA`: the document was refused and will never be authorized.
    Returned { messages: Vec<SriMessage> },
    /// `DEVUELTA` only because the key is already being processed.
    InProgress { messages: Vec<SriMessage> },
}

/// An `AUTORIZADO` authorization record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Authorization {
    pub number: String,
    pub authorized_at: Option<DateTime<FixedOffset>>,
    pub environment: Option<String>,
    /// The authorized document as returned by the SRI.
    pub document: String,
    pub messages: Vec<SriMessage>,
}

/// Outcome of `autorizacionComprobante`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AuthorizationResult {
    Authorized(Authorization),
    NotAuthorized {
        reason: String,
        messages: Vec<SriMessage>,
    },
    Pending,
    NotFound,
}

impl AuthorizationResult {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AuthorizationResult::Authorized(_) | AuthorizationResult::NotAuthorized { .. }
        )
    }
}

/// SRI web-service client.
///
/// # Examples
/// ```rust,no_run
/// use sri_core::api::{SriClient, SriError};
/// use sri_core::config::Config;
///
/// let client = SriClient::new(Config::default())?;
/// # let _ = client;
/// # Ok::<(), SriError>(())
/// ```
#[derive(Debug, Clone)]
pub struct SriClient {
    config: Config,
    client: Client,
}

// Public API
impl SriClient {
    /// Create a client with one pooled connection set and a per-request timeout.
    ///
    /// # Errors
    /// Returns [`SriError::Transport`] if the HTTP client cannot be built.
    pub fn new(config: Config) -> Result<Self, SriError> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self { config, client })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Send a signed document to the reception service.
    ///
    /// # Errors
    /// Returns [`SriError`] for transport failures, SOAP faults and unparseable replies.
    /// A refused document is not an error: it is [`SubmissionResult::Returned`].
    pub async fn submit(&self, signed_xml: &str) -> Result<SubmissionResult, SriError> {
        let envelope = reception_envelope(signed_xml);
        log::debug!("posting document to {}", self.config.endpoints().reception());
        let body = self
            .post_envelope(self.config.endpoints().reception(), envelope)
            .await?;
        let result = parse_reception_response(&body)?;
        log::info!("reception answered {}", reception_label(&result));
        Ok(result)
    }

    /// Query the authorization status of `key`.
    ///
    /// # Errors
    /// Returns [`SriError`] for transport failures, SOAP faults and unparseable replies.
    pub async fn query_authorization(
        &self,
        key: &AccessKey,
    ) -> Result<AuthorizationResult, SriError> {
        let envelope = authorization_envelope(key);
        log::debug!(
            "querying authorization of {key} at {}",
            self.config.endpoints().authorization()
        );
        let body = self
            .post_envelope(self.config.endpoints().authorization(), envelope)
            .await?;
        let result = parse_authorization_response(&body, key)?;
        log::debug!("authorization of {key}: {result:?}");
        Ok(result)
    }
}

// Private API
impl SriClient {
    async fn post_envelope(&self, url: &str, envelope: String) -> Result<String, SriError> {
        let response = self
            .client
            .post(url)
            .header("Content-Type", SOAP_CONTENT_TYPE)
            .header("Accept", "text/xml")
            .body(envelope)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        let status = response.status();
        let body = response.text().await.map_err(|e| self.transport_error(e))?;

        if status.is_server_error() {
            return Err(SriError::Server {
                status: status.as_u16(),
                body: soap_fault(&body).unwrap_or(body),
            });
        }
        if !status.is_success() {
            return Err(SriError::InvalidResponse(format!("status {status}: {body}")));
        }
        Ok(body)
    }

    fn transport_error(&self, e: reqwest::Error) -> SriError {
        if e.is_timeout() {
            SriError::Timeout(self.config.request_timeout())
        } else {
            SriError::Transport(e)
        }
    }
}

pub(crate) fn reception_envelope(signed_xml: &str) -> String {
    format!(
        "<soapenv:Envelope xmlns:soapenv=\"{SOAP_ENV_NS}\" xmlns:ec=\"{RECEPTION_NS}\"><soapenv:Header/><soapenv:Body><ec:validarComprobante><xml>{}</xml></ec:validarComprobante></soapenv:Body></soapenv:Envelope>",
        Base64::encode_string(signed_xml.as_bytes())
    )
}

pub(crate) fn authorization_envelope(key: &AccessKey) -> String {
    format!(
        "<soapenv:Envelope xmlns:soapenv=\"{SOAP_ENV_NS}\" xmlns:ec=\"{AUTHORIZATION_NS}\"><soapenv:Header/><soapenv:Body><ec:autorizacionComprobante><claveAccesoComprobante>{key}</claveAccesoComprobante></ec:autorizacionComprobante></soapenv:Body></soapenv:Envelope>"
    )
}

pub(crate) fn parse_reception_response(body: &str) -> Result<SubmissionResult, SriError> {
    let doc = parse_body(body)?;
    let ctx = xpath::Context::new(&doc)
        .map_err(|e| SriError::InvalidResponse(format!("XPath context error: {e:?}")))?;
    if let Some(fault) = fault_message(&ctx, body) {
        return Err(SriError::Server {
            status: 200,
            body: fault,
        });
    }

    let state = first_text(
        &ctx,
        "//*[local-name()='RespuestaRecepcionComprobante']/*[local-name()='estado']",
    )?
    .ok_or_else(|| SriError::InvalidResponse("missing reception state".into()))?;
    let messages = nodes(
        &ctx,
        "//*[local-name()='comprobante']/*[local-name()='mensajes']/*[local-name()='mensaje']",
    )?
    .iter()
    .map(message_from_node)
    .collect::<Vec<_>>();

    match state.to_ascii_uppercase().as_str() {
        "RECIBIDA" => Ok(SubmissionResult::Received),
        "DEVUELTA" if only_in_processing(&messages) => {
            Ok(SubmissionResult::InProgress { messages })
        }
        "DEVUELTA" => Ok(SubmissionResult::Returned { messages }),
        other => Err(SriError::InvalidResponse(format!(
            "unknown reception state '{other}'"
        ))),
    }
}

pub(crate) fn parse_authorization_response(
    body: &str,
    key: &AccessKey,
) -> Result<AuthorizationResult, SriError> {
    let doc = parse_body(body)?;
    let ctx = xpath::Context::new(&doc)
        .map_err(|e| SriError::InvalidResponse(format!("XPath context error: {e:?}")))?;
    if let Some(fault) = fault_message(&ctx, body) {
        return Err(SriError::Server {
            status: 200,
            body: fault,
        });
    }

    let count = first_text(
        &ctx,
        "//*[local-name()='RespuestaAutorizacionComprobante']/*[local-name()='numeroComprobantes']",
    )?;
    let records = nodes(
        &ctx,
        "//*[local-name()='autorizaciones']/*[local-name()='autorizacion']",
    )?;
    if records.is_empty() || count.as_deref() == Some("0") {
        return Ok(AuthorizationResult::NotFound);
    }

    let record = records
        .iter()
        .find(|node| {
            child_text(node, "estado").is_some_and(|s| s.eq_ignore_ascii_case("AUTORIZADO"))
        })
        .unwrap_or(&records[0]);
    let state = child_text(record, "estado")
        .ok_or_else(|| SriError::InvalidResponse("missing authorization state".into()))?;
    let messages = child_messages(record);

    match state.to_ascii_uppercase().as_str() {
        "AUTORIZADO" => Ok(AuthorizationResult::Authorized(Authorization {
            number: child_text(record, "numeroAutorizacion")
                .unwrap_or_else(|| key.as_str().to_string()),
            authorized_at: child_text(record, "fechaAutorizacion")
                .as_deref()
                .and_then(parse_authorization_date),
            environment: child_text(record, "ambiente"),
            document: child_text(record, "comprobante").unwrap_or_default(),
            messages,
        })),
        "NO AUTORIZADO" | "RECHAZADA" => Ok(AuthorizationResult::NotAuthorized {
            reason: messages
                .iter()
                .find(|m| m.is_error())
                .or_else(|| messages.first())
                .map(ToString::to_string)
                .unwrap_or(state),
            messages,
        }),
        "EN PROCESO" | "EN PROCESAMIENTO" | "PPR" => Ok(AuthorizationResult::Pending),
        other => Err(SriError::InvalidResponse(format!(
            "unknown authorization state '{other}'"
        ))),
    }
}

fn reception_label(result: &SubmissionResult) -> &'static str {
    match result {
        SubmissionResult::Received => "RECIBIDA",
        SubmissionResult::Returned { .. } => "DEVUELTA",
        SubmissionResult::InProgress { .. } => "DEVUELTA (en procesamiento)",
    }
}

fn only_in_processing(messages: &[SriMessage]) -> bool {
    let mut errors = messages.iter().filter(|m| m.is_error()).peekable();
    errors.peek().is_some() && errors.all(SriMessage::is_in_processing)
}

/// Named code first, free text as the fallback.
fn mentions_in_processing(text: &str) -> bool {
    text.contains(&format!("<identificador>{IN_PROCESSING_CODE}</identificador>"))
        || text.to_uppercase().contains(IN_PROCESSING_TEXT)
}

fn soap_fault(body: &str) -> Option<String> {
    let doc = Parser::default().parse_string(body).ok()?;
    let ctx = xpath::Context::new(&doc).ok()?;
    fault_message(&ctx, body)
}

/// `faultstring` of a SOAP fault, tagged when the fault detail carries code 70.
fn fault_message(ctx: &xpath::Context, body: &str) -> Option<String> {
    first_text(ctx, "//*[local-name()='Fault']/*[local-name()='faultstring']")
        .ok()
        .flatten()
        .map(|fault| {
            // keep the code so in-progress detection still sees it
            if mentions_in_processing(body) && !mentions_in_processing(&fault) {
                format!("{fault} ({IN_PROCESSING_TEXT})")
            } else {
                fault
            }
        })
}

fn parse_authorization_date(raw: &str) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(raw)
        .or_else(|_| DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f%:z"))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(raw, "%d/%m/%Y %H:%M:%S")
                .ok()?
                .and_local_timezone(ecuador_offset())
                .single()
        })
}

fn parse_body(body: &str) -> Result<libxml::tree::Document, SriError> {
    Parser::default()
        .parse_string(body)
        .map_err(|e| SriError::InvalidResponse(format!("XML parse error: {e:?}")))
}

fn nodes(ctx: &xpath::Context, expr: &str) -> Result<Vec<Node>, SriError> {
    Ok(ctx
        .evaluate(expr)
        .map_err(|e| SriError::InvalidResponse(format!("XPath error: {e:?}")))?
        .get_nodes_as_vec())
}

fn first_text(ctx: &xpath::Context, expr: &str) -> Result<Option<String>, SriError> {
    Ok(nodes(ctx, expr)?
        .first()
        .map(|node| node.get_content().trim().to_string())
        .filter(|value| !value.is_empty()))
}

fn child(node: &Node, name: &str) -> Option<Node> {
    node.get_child_elements()
        .into_iter()
        .find(|c| c.get_name() == name)
}

fn child_text(node: &Node, name: &str) -> Option<String> {
    child(node, name)
        .map(|c| c.get_content().trim().to_string())
        .filter(|value| !value.is_empty())
}

fn child_messages(node: &Node) -> Vec<SriMessage> {
    child(node, "mensajes")
        .map(|list| {
            list.get_child_elements()
                .iter()
                .filter(|m| m.get_name() == "mensaje")
                .map(message_from_node)
                .collect()
        })
        .unwrap_or_default()
}

fn message_from_node(node: &Node) -> SriMessage {
    SriMessage {
        identifier: child_text(node, "identificador").unwrap_or_default(),
        message: child_text(node, "mensaje").unwrap_or_default(),
        additional_info: child_text(node, "informacionAdicional"),
        kind: child_text(node, "tipo"),
    }
}
