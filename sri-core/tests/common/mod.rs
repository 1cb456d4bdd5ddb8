use openssl::{
    asn1::Asn1Time,
    bn::BigNum,
    hash::MessageDigest,
    pkcs12::Pkcs12,
    pkey::{PKey, Private},
    rsa::Rsa,
    x509::{X509, X509NameBuilder},
};

/// Worked example key, test environment.
#[allow(dead_code)]
pub const TEST_KEY: &str = "0507202401179001122300110010010000000011234567813";
#[allow(dead_code)]
pub const PASSWORD: &str = "clave-de-prueba";
#[allow(dead_code)]
pub const SERIAL: u32 = 4242;

#[allow(dead_code)]
pub struct TestBundle {
    pub pkcs12: Vec<u8>,
    pub cert: X509,
    pub key: PKey<Private>,
}

/// Self-signed RSA 2048 bundle valid from yesterday for a year.
#[allow(dead_code)]
pub fn test_bundle() -> TestBundle {
    let now = chrono::Utc::now().timestamp();
    bundle_valid_between(now - 86_400, now + 365 * 86_400)
}

/// Bundle whose certificate expired in 2021.
#[allow(dead_code)]
pub fn expired_bundle() -> TestBundle {
    bundle_valid_between(1_577_836_800, 1_609_459_200)
}

fn bundle_valid_between(not_before: i64, not_after: i64) -> TestBundle {
    let rsa = Rsa::generate(2048).expect("generate RSA key");
    let key = PKey::from_rsa(rsa).expect("wrap RSA key");

    let mut name = X509NameBuilder::new().expect("name builder");
    name.append_entry_by_text("C", "EC").expect("country");
    name.append_entry_by_text("O", "Entidad de Certificacion de Prueba")
        .expect("organization");
    name.append_entry_by_text("CN", "EMISOR DE PRUEBA").expect("common name");
    let name = name.build();

    let mut builder = X509::builder().expect("X509 builder");
    builder.set_version(2).expect("version");
    let serial = BigNum::from_u32(SERIAL)
        .expect("serial")
        .to_asn1_integer()
        .expect("serial integer");
    builder.set_serial_number(&serial).expect("set serial");
    builder.set_subject_name(&name).expect("subject");
    builder.set_issuer_name(&name).expect("issuer");
    builder
        .set_not_before(&Asn1Time::from_unix(not_before).expect("not_before"))
        .expect("set not_before");
    builder
        .set_not_after(&Asn1Time::from_unix(not_after).expect("not_after"))
        .expect("set not_after");
    builder.set_pubkey(&key).expect("pubkey");
    builder.sign(&key, MessageDigest::sha256()).expect("self-sign");
    let cert = builder.build();

    let pkcs12 = Pkcs12::builder()
        .name("firma electronica")
        .pkey(&key)
        .cert(&cert)
        .build2(PASSWORD)
        .expect("build PKCS#12")
        .to_der()
        .expect("PKCS#12 DER");

    TestBundle { pkcs12, cert, key }
}

/// Minimal unsigned invoice as produced by the template layer.
#[allow(dead_code)]
pub fn sample_invoice(key: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<factura id="comprobante" version="1.1.0">
  <infoTributaria>
    <ambiente>{env}</ambiente>
    <tipoEmision>1</tipoEmision>
    <razonSocial>Comercial Andes &amp; Cia.</razonSocial>
    <ruc>1790011223001</ruc>
    <claveAcceso>{key}</claveAcceso>
    <codDoc>01</codDoc>
    <estab>001</estab>
    <ptoEmi>001</ptoEmi>
    <secuencial>000000001</secuencial>
  </infoTributaria>
  <infoFactura>
    <fechaEmision>05/07/2024</fechaEmision>
    <importeTotal>11.50</importeTotal>
  </infoFactura>
</factura>
"#,
        env = &key[23..24],
    )
}
