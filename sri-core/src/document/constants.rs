pub(crate) const DS_NS: &str = "http://www.w3.org/2000/09/xmldsig#";
pub(crate) const ETSI_NS: &str = "http://uri.etsi.org/01903/v1.3.2#";

pub(crate) const C14N_URI: &str = "http://www.w3.org/TR/2001/REC-xml-c14n-20010315";
pub(crate) const ENVELOPED_SIGNATURE_URI: &str =
    "http://www.w3.org/2000/09/xmldsig#enveloped-signature";
pub(crate) const SIGNED_PROPERTIES_TYPE: &str = "http://uri.etsi.org/01903#SignedProperties";

pub(crate) const SHA1_URI: &str = "http://www.w3.org/2000/09/xmldsig#sha1";
pub(crate) const SHA256_URI: &str = "http://www.w3.org/2001/04/xmlenc#sha256";
pub(crate) const RSA_SHA1_URI: &str = "http://www.w3.org/2000/09/xmldsig#rsa-sha1";
pub(crate) const RSA_SHA256_URI: &str = "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256";

pub(crate) const SOAP_ENV_NS: &str = "http://schemas.xmlsoap.org/soap/envelope/";
pub(crate) const RECEPTION_NS: &str = "http://ec.gob.sri.ws.recepcion";
pub(crate) const AUTHORIZATION_NS: &str = "http://ec.gob.sri.ws.autorizacion";

/// Element holding the access key in every SRI document template.
pub(crate) const ACCESS_KEY_ELEMENT: &str = "claveAcceso";
