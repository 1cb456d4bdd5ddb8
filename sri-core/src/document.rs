//! Inspection of the unsigned XML produced by the document templates.
//!
//! The template layer hands over a complete document. This module only locates the
//! embedded access key, canonicalizes the document for digesting, and splices a
//! signature before the closing root tag. It never re-serializes the caller's text.
pub(crate) mod constants;

use libxml::{
    parser::Parser,
    tree::{Document, c14n},
    xpath,
};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::access_key::{AccessKey, AccessKeyError};
use constants::ACCESS_KEY_ELEMENT;

/// Errors raised while inspecting an unsigned document.
#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("malformed document: {0}")]
    MalformedDocument(String),
    #[error("malformed document: invalid access key: {0}")]
    InvalidAccessKey(#[from] AccessKeyError),
}

/// A parsed unsigned document together with the caller's original text.
pub struct UnsignedDocument<'a> {
    source: &'a str,
    doc: Document,
    access_key: AccessKey,
    root_name: String,
    root_id: Option<String>,
    namespaces: BTreeMap<String, String>,
}

impl<'a> UnsignedDocument<'a> {
    /// Parse `xml` and locate its single `claveAcceso` element.
    pub fn parse(xml: &'a str) -> Result<Self, DocumentError> {
        let doc = Parser::default()
            .parse_string(xml)
            .map_err(|e| DocumentError::MalformedDocument(format!("XML parse error: {e:?}")))?;
        let root = doc
            .get_root_element()
            .ok_or_else(|| DocumentError::MalformedDocument("missing root element".into()))?;

        let root_name = match root.get_namespace() {
            Some(ns) if !ns.get_prefix().is_empty() => {
                format!("{}:{}", ns.get_prefix(), root.get_name())
            }
            _ => root.get_name(),
        };
        let root_id = root
            .get_attribute("id")
            .or_else(|| root.get_attribute("Id"))
            .filter(|id| !id.trim().is_empty());
        let namespaces = root
            .get_namespace_declarations()
            .into_iter()
            .map(|ns| (ns.get_prefix(), ns.get_href()))
            .collect();

        let access_key = extract_access_key(&doc)?;

        Ok(Self {
            source: xml,
            doc,
            access_key,
            root_name,
            root_id,
            namespaces,
        })
    }

    pub fn access_key(&self) -> &AccessKey {
        &self.access_key
    }

    pub fn source(&self) -> &str {
        self.source
    }

    /// Qualified name of the root element, e.g. `factura`.
    pub fn root_name(&self) -> &str {
        &self.root_name
    }

    /// Value of the root `id` attribute (`comprobante` in SRI templates).
    pub fn root_id(&self) -> Option<&str> {
        self.root_id.as_deref()
    }

    /// Namespace declarations on the root element, keyed by prefix (`""` is the default
    /// namespace).
    pub fn namespaces(&self) -> &BTreeMap<String, String> {
        &self.namespaces
    }

    /// Inclusive C14N 1.0 (no comments) of what the document reference points at: the
    /// root subtree when the root carries an id, the whole document otherwise.
    pub fn canonicalize(&self) -> Result<String, DocumentError> {
        let options = c14n::CanonicalizationOptions {
            mode: c14n::CanonicalizationMode::Canonical1_0,
            inclusive_ns_prefixes: vec![],
            with_comments: false,
        };
        let canonical = match (self.root_id.as_ref(), self.doc.get_root_element()) {
            (Some(_), Some(mut root)) => root.canonicalize(options),
            _ => self.doc.canonicalize(options, None),
        };
        canonical.map_err(|e| {
            DocumentError::MalformedDocument(format!("failed to canonicalize xml: {e:?}"))
        })
    }

    /// Insert `fragment` immediately before the closing root tag of the original text.
    pub fn splice_before_root_close(&self, fragment: &str) -> Result<String, DocumentError> {
        let at = closing_tag_offset(self.source, &self.root_name).ok_or_else(|| {
            DocumentError::MalformedDocument(format!(
                "closing tag </{}> not found",
                self.root_name
            ))
        })?;
        let mut out = String::with_capacity(self.source.len() + fragment.len());
        out.push_str(&self.source[..at]);
        out.push_str(fragment);
        out.push_str(&self.source[at..]);
        Ok(out)
    }
}

fn extract_access_key(doc: &Document) -> Result<AccessKey, DocumentError> {
    let ctx = xpath::Context::new(doc)
        .map_err(|e| DocumentError::MalformedDocument(format!("XPath context error: {e:?}")))?;
    let nodes = ctx
        .evaluate(&format!("//*[local-name()='{ACCESS_KEY_ELEMENT}']"))
        .map_err(|e| DocumentError::MalformedDocument(format!("XPath error: {e:?}")))?
        .get_nodes_as_vec();

    match nodes.as_slice() {
        [] => Err(DocumentError::MalformedDocument(format!(
            "missing <{ACCESS_KEY_ELEMENT}> element"
        ))),
        [node] => Ok(AccessKey::parse(node.get_content().trim())?),
        many => Err(DocumentError::MalformedDocument(format!(
            "expected one <{ACCESS_KEY_ELEMENT}> element, found {}",
            many.len()
        ))),
    }
}

/// Byte offset of the root end tag `</name>` (optionally `</name >`), skipping the
/// comments and processing instructions that may follow it.
fn closing_tag_offset(xml: &str, name: &str) -> Option<usize> {
    let mut tail = xml.trim_end();
    loop {
        if tail.ends_with("-->") {
            tail = tail[..tail.rfind("<!--")?].trim_end();
        } else if tail.ends_with("?>") {
            tail = tail[..pi_start(tail)?].trim_end();
        } else {
            break;
        }
    }
    let tag = tail.strip_suffix('>')?.trim_end();
    let at = tag.len().checked_sub(name.len() + 2)?;
    (tag.get(at..)? == format!("</{name}")).then_some(at)
}

/// Start of the processing instruction that ends `tail`. PI content may itself hold
/// `<?`, so the start is the one preceded by the end of earlier markup.
fn pi_start(tail: &str) -> Option<usize> {
    let mut search = tail.len().saturating_sub(2);
    loop {
        let at = tail[..search].rfind("<?")?;
        if tail[..at].trim_end().ends_with('>') {
            return Some(at);
        }
        search = at;
    }
}
