use chrono::NaiveDate;
use sri_core::access_key::{
    AccessKey, AccessKeyError, AccessKeyParts, DocumentType, EmissionType, checksum,
    generate_access_key, validate_access_key,
};
use sri_core::config::EnvironmentType;

#[test]
fn worked_example_key() {
    let key = generate_access_key(
        "05072024",
        "01",
        "1790011223001",
        "1",
        "001",
        "001",
        "000000001",
        Some("12345678"),
        None,
    )
    .expect("key");

    assert_eq!(key.as_str(), "0507202401179001122300110010010000000011234567813");
    assert_eq!(key.as_str().len(), 49);
    assert!(key.as_str().bytes().all(|b| b.is_ascii_digit()));
    assert_eq!(key.check_digit(), checksum(&key.as_str()[..48]).expect("checksum"));
}

#[test]
fn worked_example_with_random_code_is_valid() {
    let key = generate_access_key(
        "05/07/2024",
        "01",
        "1790011223001",
        "1",
        "001",
        "001",
        "000000001",
        None,
        None,
    )
    .expect("key");

    assert_eq!(&key.as_str()[..39], "050720240117900112230011001001000000001");
    assert_eq!(key.numeric_code().len(), 8);
    assert!(validate_access_key(key.as_str()).valid);
}

#[test]
fn checksum_is_deterministic() {
    let base = "050720240117900112230011001001000000001123456781";
    let first = checksum(base).expect("checksum");
    for _ in 0..10 {
        assert_eq!(checksum(base).expect("checksum"), first);
    }
}

#[test]
fn generated_keys_validate_for_every_document_type() {
    for (code, document_type) in [
        ("01", DocumentType::Invoice),
        ("03", DocumentType::PurchaseSettlement),
        ("04", DocumentType::CreditNote),
        ("05", DocumentType::DebitNote),
        ("06", DocumentType::Remittance),
        ("07", DocumentType::Retention),
    ] {
        for environment in [EnvironmentType::Test, EnvironmentType::Production] {
            let key = AccessKey::generate(&AccessKeyParts {
                issue_date: NaiveDate::from_ymd_opt(2024, 12, 31).expect("date"),
                document_type,
                ruc: "0992345678001".into(),
                environment,
                establishment: "2".into(),
                emission_point: "15".into(),
                sequential: "987654321".into(),
                numeric_code: None,
                emission_type: EmissionType::Normal,
            })
            .expect("key");

            let report = validate_access_key(key.as_str());
            assert!(report.valid, "{code}: {:?}", report.reason);
            assert_eq!(&key.as_str()[8..10], code);
            assert_eq!(key.environment(), environment);
            assert_eq!(key.establishment(), "002");
            assert_eq!(key.emission_point(), "015");
        }
    }
}

#[test]
fn validation_rejects_each_kind_of_damage() {
    let valid = "0507202401179001122300110010010000000011234567813";

    assert_eq!(
        AccessKey::parse(&valid[..40]),
        Err(AccessKeyError::InvalidLength(40))
    );

    let letters = valid.replacen('1', "X", 1);
    assert_eq!(AccessKey::parse(&letters), Err(AccessKeyError::NonNumeric));

    let mut wrong_check = valid[..48].to_string();
    wrong_check.push('4');
    assert!(matches!(
        AccessKey::parse(&wrong_check),
        Err(AccessKeyError::ChecksumMismatch {
            expected: 3,
            found: 4
        })
    ));

    let report = validate_access_key(&wrong_check);
    assert!(!report.valid);
    assert!(report.reason.expect("reason").contains("check digit"));
}

#[test]
fn generator_rejects_bad_inputs() {
    let bad_ruc = generate_access_key(
        "05072024", "01", "17900112", "1", "001", "001", "1", None, None,
    );
    assert!(matches!(
        bad_ruc,
        Err(AccessKeyError::InvalidField { field: "RUC", .. })
    ));

    let bad_type = generate_access_key(
        "05072024", "99", "1790011223001", "1", "001", "001", "1", None, None,
    );
    assert!(matches!(bad_type, Err(AccessKeyError::UnknownDocumentType(_))));

    let bad_date = generate_access_key(
        "31022024", "01", "1790011223001", "1", "001", "001", "1", None, None,
    );
    assert!(matches!(
        bad_date,
        Err(AccessKeyError::InvalidField {
            field: "issue date",
            ..
        })
    ));

    let bad_env = generate_access_key(
        "05072024", "01", "1790011223001", "3", "001", "001", "1", None, None,
    );
    assert!(matches!(
        bad_env,
        Err(AccessKeyError::InvalidField {
            field: "environment",
            ..
        })
    ));
}
