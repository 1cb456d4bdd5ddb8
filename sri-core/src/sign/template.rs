//! String templates for the `ds:Signature` block.
//!
//! Every fragment is rendered directly in canonical form: no insignificant whitespace,
//! explicit end tags, attributes in C14N order. Passing the in-scope namespace
//! attributes as `ns` yields the digest input; passing `""` yields the embedded form.
use std::collections::BTreeMap;

use quick_xml::escape::partial_escape;

use super::DigestAlgorithm;
use crate::access_key::AccessKey;
use crate::document::constants::{
    C14N_URI, DS_NS, ENVELOPED_SIGNATURE_URI, ETSI_NS, SIGNED_PROPERTIES_TYPE,
};

/// `Id` attributes of the signature, all derived from the access key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct SignatureIds {
    pub signature: String,
    pub signed_info: String,
    pub signed_properties: String,
    pub signed_properties_ref: String,
    pub certificate: String,
    pub reference: String,
    pub signature_value: String,
    pub object: String,
}

impl SignatureIds {
    pub fn for_key(key: &AccessKey) -> Self {
        let k = key.as_str();
        Self {
            signature: format!("Signature-{k}"),
            signed_info: format!("Signature-SignedInfo-{k}"),
            signed_properties: format!("Signature-SignedProperties-{k}"),
            signed_properties_ref: format!("SignedPropertiesID-{k}"),
            certificate: format!("Certificate-{k}"),
            reference: format!("Reference-ID-{k}"),
            signature_value: format!("SignatureValue-{k}"),
            object: format!("Signature-Object-{k}"),
        }
    }
}

pub(super) struct KeyInfoValues<'a> {
    pub certificate: &'a str,
    pub modulus: &'a str,
    pub exponent: &'a str,
}

pub(super) struct SignedPropertiesValues<'a> {
    pub signing_time: &'a str,
    pub cert_digest: &'a str,
    pub issuer: &'a str,
    pub serial: &'a str,
}

pub(super) struct ReferenceDigests<'a> {
    pub signed_properties: &'a str,
    pub key_info: &'a str,
    pub document: &'a str,
    /// `#<root id>` or `""` for the whole document.
    pub document_uri: &'a str,
}

/// Root namespace declarations plus `ds`/`etsi`, in C14N order (default first, then by
/// prefix).
pub(super) fn in_scope_namespaces(root: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut scope = root.clone();
    scope.insert("ds".to_string(), DS_NS.to_string());
    scope.insert("etsi".to_string(), ETSI_NS.to_string());
    scope
}

pub(super) fn namespace_attributes(scope: &BTreeMap<String, String>) -> String {
    scope
        .iter()
        .map(|(prefix, href)| {
            if prefix.is_empty() {
                format!(" xmlns=\"{href}\"")
            } else {
                format!(" xmlns:{prefix}=\"{href}\"")
            }
        })
        .collect()
}

pub(super) fn key_info(ns: &str, ids: &SignatureIds, values: &KeyInfoValues<'_>) -> String {
    format!(
        "<ds:KeyInfo{ns} Id=\"{id}\"><ds:X509Data><ds:X509Certificate>{cert}</ds:X509Certificate></ds:X509Data><ds:KeyValue><ds:RSAKeyValue><ds:Modulus>{modulus}</ds:Modulus><ds:Exponent>{exponent}</ds:Exponent></ds:RSAKeyValue></ds:KeyValue></ds:KeyInfo>",
        id = ids.certificate,
        cert = values.certificate,
        modulus = values.modulus,
        exponent = values.exponent,
    )
}

pub(super) fn signed_properties(
    ns: &str,
    ids: &SignatureIds,
    digest: DigestAlgorithm,
    values: &SignedPropertiesValues<'_>,
) -> String {
    format!(
        concat!(
            "<etsi:SignedProperties{ns} Id=\"{id}\">",
            "<etsi:SignedSignatureProperties>",
            "<etsi:SigningTime>{time}</etsi:SigningTime>",
            "<etsi:SigningCertificate><etsi:Cert><etsi:CertDigest>",
            "<ds:DigestMethod Algorithm=\"{digest_uri}\"></ds:DigestMethod>",
            "<ds:DigestValue>{cert_digest}</ds:DigestValue>",
            "</etsi:CertDigest><etsi:IssuerSerial>",
            "<ds:X509IssuerName>{issuer}</ds:X509IssuerName>",
            "<ds:X509SerialNumber>{serial}</ds:X509SerialNumber>",
            "</etsi:IssuerSerial></etsi:Cert></etsi:SigningCertificate>",
            "</etsi:SignedSignatureProperties>",
            "<etsi:SignedDataObjectProperties>",
            "<etsi:DataObjectFormat ObjectReference=\"#{reference}\">",
            "<etsi:Description>contenido comprobante</etsi:Description>",
            "<etsi:MimeType>text/xml</etsi:MimeType>",
            "</etsi:DataObjectFormat>",
            "</etsi:SignedDataObjectProperties>",
            "</etsi:SignedProperties>",
        ),
        ns = ns,
        id = ids.signed_properties,
        time = values.signing_time,
        digest_uri = digest.digest_uri(),
        cert_digest = values.cert_digest,
        issuer = partial_escape(values.issuer),
        serial = values.serial,
        reference = ids.reference,
    )
}

pub(super) fn signed_info(
    ns: &str,
    ids: &SignatureIds,
    digest: DigestAlgorithm,
    digests: &ReferenceDigests<'_>,
) -> String {
    let method = format!(
        "<ds:DigestMethod Algorithm=\"{}\"></ds:DigestMethod>",
        digest.digest_uri()
    );
    format!(
        concat!(
            "<ds:SignedInfo{ns} Id=\"{id}\">",
            "<ds:CanonicalizationMethod Algorithm=\"{c14n}\"></ds:CanonicalizationMethod>",
            "<ds:SignatureMethod Algorithm=\"{signature_uri}\"></ds:SignatureMethod>",
            "<ds:Reference Id=\"{sp_ref}\" Type=\"{sp_type}\" URI=\"#{sp}\">",
            "{method}<ds:DigestValue>{sp_digest}</ds:DigestValue></ds:Reference>",
            "<ds:Reference URI=\"#{cert}\">",
            "{method}<ds:DigestValue>{key_info_digest}</ds:DigestValue></ds:Reference>",
            "<ds:Reference Id=\"{reference}\" URI=\"{document_uri}\">",
            "<ds:Transforms><ds:Transform Algorithm=\"{enveloped}\"></ds:Transform></ds:Transforms>",
            "{method}<ds:DigestValue>{document_digest}</ds:DigestValue></ds:Reference>",
            "</ds:SignedInfo>",
        ),
        ns = ns,
        id = ids.signed_info,
        c14n = C14N_URI,
        signature_uri = digest.signature_uri(),
        sp_ref = ids.signed_properties_ref,
        sp_type = SIGNED_PROPERTIES_TYPE,
        sp = ids.signed_properties,
        method = method,
        sp_digest = digests.signed_properties,
        cert = ids.certificate,
        key_info_digest = digests.key_info,
        reference = ids.reference,
        document_uri = digests.document_uri,
        enveloped = ENVELOPED_SIGNATURE_URI,
        document_digest = digests.document,
    )
}

/// The complete block as embedded in the document. The fragments must be the
/// namespace-free renditions.
pub(super) fn signature(
    ids: &SignatureIds,
    signed_info: &str,
    signature_value: &str,
    key_info: &str,
    signed_properties: &str,
) -> String {
    format!(
        concat!(
            "<ds:Signature xmlns:ds=\"{ds}\" xmlns:etsi=\"{etsi}\" Id=\"{id}\">",
            "{signed_info}",
            "<ds:SignatureValue Id=\"{value_id}\">{value}</ds:SignatureValue>",
            "{key_info}",
            "<ds:Object Id=\"{object}\">",
            "<etsi:QualifyingProperties Target=\"#{id}\">{signed_properties}</etsi:QualifyingProperties>",
            "</ds:Object>",
            "</ds:Signature>",
        ),
        ds = DS_NS,
        etsi = ETSI_NS,
        id = ids.signature,
        signed_info = signed_info,
        value_id = ids.signature_value,
        value = signature_value,
        key_info = key_info,
        object = ids.object,
        signed_properties = signed_properties,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespaces_render_default_first_then_by_prefix() {
        let mut root = BTreeMap::new();
        root.insert("xsi".to_string(), "urn:xsi".to_string());
        root.insert(String::new(), "urn:default".to_string());
        let rendered = namespace_attributes(&in_scope_namespaces(&root));
        assert_eq!(
            rendered,
            format!(
                " xmlns=\"urn:default\" xmlns:ds=\"{DS_NS}\" xmlns:etsi=\"{ETSI_NS}\" xmlns:xsi=\"urn:xsi\""
            )
        );
    }

    #[test]
    fn ids_embed_access_key() {
        let key = AccessKey::parse("0507202401179001122300110010010000000011234567813")
            .expect("key");
        let ids = SignatureIds::for_key(&key);
        assert_eq!(ids.signature, format!("Signature-{}", key.as_str()));
        assert!(ids.object.ends_with(key.as_str()));
    }

    #[test]
    fn issuer_text_is_escaped() {
        let key = AccessKey::parse("0507202401179001122300110010010000000011234567813")
            .expect("key");
        let rendered = signed_properties(
            "",
            &SignatureIds::for_key(&key),
            DigestAlgorithm::Sha1,
            &SignedPropertiesValues {
                signing_time: "2024-07-05T10:00:00-05:00",
                cert_digest: "AAAA",
                issuer: "CN=A&B <Test>",
                serial: "1",
            },
        );
        assert!(rendered.contains("<ds:X509IssuerName>CN=A&amp;B &lt;Test&gt;</ds:X509IssuerName>"));
        assert!(rendered.starts_with("<etsi:SignedProperties Id=\"Signature-SignedProperties-"));
    }
}
