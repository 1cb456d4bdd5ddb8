mod common;

use httpmock::{Method::POST, MockServer};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sri_core::api::SriClient;
use sri_core::config::{Config, Endpoints, EnvironmentType, PollingPolicy};
use sri_core::orchestrator::{
    Orchestrator, ProcessState, ProgressEvent, SubmissionError, SubmissionOutcome,
    SubmissionRequest, SystemClock,
};
use sri_core::sign::SigningCredential;

use common::{PASSWORD, TEST_KEY, expired_bundle, sample_invoice, test_bundle};

const PRODUCTION_KEY: &str = "0507202401179001122300120010010000000011234567811";

fn try_start_server() -> Option<MockServer> {
    std::panic::catch_unwind(MockServer::start).ok()
}

fn config_for(server: &MockServer, env: EnvironmentType) -> Config {
    Config::new(env)
        .with_endpoints(Endpoints::new(
            server.url("/recepcion"),
            server.url("/autorizacion"),
        ))
        .with_polling(PollingPolicy::new(3, Duration::from_millis(10)))
        .with_request_timeout(Duration::from_secs(5))
}

fn reception_reply(state: &str, messages: &str) -> String {
    format!(
        r#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/"><soap:Body><ns2:validarComprobanteResponse xmlns:ns2="http://ec.gob.sri.ws.recepcion"><RespuestaRecepcionComprobante><estado>{state}</estado><comprobantes><comprobante><claveAcceso>{TEST_KEY}</claveAcceso><mensajes>{messages}</mensajes></comprobante></comprobantes></RespuestaRecepcionComprobante></ns2:validarComprobanteResponse></soap:Body></soap:Envelope>"#
    )
}

fn authorization_reply(state: &str) -> String {
    format!(
        r#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/"><soap:Body><ns2:autorizacionComprobanteResponse xmlns:ns2="http://ec.gob.sri.ws.autorizacion"><RespuestaAutorizacionComprobante><claveAccesoConsultada>{TEST_KEY}</claveAccesoConsultada><numeroComprobantes>1</numeroComprobantes><autorizaciones><autorizacion><estado>{state}</estado><numeroAutorizacion>{TEST_KEY}</numeroAutorizacion><fechaAutorizacion>2024-07-05T10:15:30-05:00</fechaAutorizacion><ambiente>PRUEBAS</ambiente><comprobante><![CDATA[<factura/>]]></comprobante><mensajes/></autorizacion></autorizaciones></RespuestaAutorizacionComprobante></ns2:autorizacionComprobanteResponse></soap:Body></soap:Envelope>"#
    )
}

#[test]
fn returned_document_never_reaches_authorization() {
    let server = match try_start_server() {
        Some(server) => server,
        None => return,
    };
    let reception = server.mock(|when, then| {
        when.method(POST).path("/recepcion");
        then.status(200).body(reception_reply(
            "DEVUELTA",
            "<mensaje><identificador>35</identificador><mensaje>ARCHIVO NO CUMPLE ESTRUCTURA XML</mensaje><tipo>ERROR</tipo></mensaje>",
        ));
    });
    let authorization = server.mock(|when, then| {
        when.method(POST).path("/autorizacion");
        then.status(200).body(authorization_reply("AUTORIZADO"));
    });

    let rt = tokio::runtime::Runtime::new().expect("runtime");
    rt.block_on(async {
        let config = config_for(&server, EnvironmentType::Test);
        let client = SriClient::new(config.clone()).expect("client");
        let orchestrator = Orchestrator::new(client, SystemClock, config);
        let bundle = test_bundle();
        let request = SubmissionRequest::new(sample_invoice(TEST_KEY))
            .with_credential(SigningCredential::new(bundle.pkcs12, PASSWORD));

        let outcome = orchestrator
            .submit(request, &|_: ProgressEvent| {})
            .await
            .expect("outcome");

        match outcome {
            SubmissionOutcome::Rejected {
                reason,
                messages,
                signed_xml,
                ..
            } => {
                assert!(reason.contains("ARCHIVO NO CUMPLE ESTRUCTURA XML"));
                assert_eq!(messages[0].identifier, "35");
                assert!(signed_xml.expect("signed xml").contains("<ds:Signature"));
            }
            other => panic!("unexpected {other:?}"),
        }
    });

    reception.assert_hits(1);
    authorization.assert_hits(0);
}

#[test]
fn signed_document_is_authorized_end_to_end() {
    let server = match try_start_server() {
        Some(server) => server,
        None => return,
    };
    let reception = server.mock(|when, then| {
        when.method(POST)
            .path("/recepcion")
            .body_contains("<ec:validarComprobante>");
        then.status(200).body(reception_reply("RECIBIDA", ""));
    });
    let authorization = server.mock(|when, then| {
        when.method(POST)
            .path("/autorizacion")
            .body_contains(TEST_KEY);
        then.status(200).body(authorization_reply("AUTORIZADO"));
    });

    let events = Arc::new(Mutex::new(Vec::new()));
    let rt = tokio::runtime::Runtime::new().expect("runtime");
    rt.block_on(async {
        let config = config_for(&server, EnvironmentType::Test);
        let client = SriClient::new(config.clone()).expect("client");
        let orchestrator = Orchestrator::new(client, SystemClock, config);
        let bundle = test_bundle();
        let request = SubmissionRequest::new(sample_invoice(TEST_KEY))
            .with_credential(SigningCredential::new(bundle.pkcs12, PASSWORD));
        let sink = {
            let events = Arc::clone(&events);
            move |event: ProgressEvent| events.lock().expect("events").push(event.state)
        };

        let outcome = orchestrator.submit(request, &sink).await.expect("outcome");

        match outcome {
            SubmissionOutcome::Authorized { authorization, .. } => {
                assert_eq!(authorization.number, TEST_KEY);
                assert_eq!(authorization.environment.as_deref(), Some("PRUEBAS"));
            }
            other => panic!("unexpected {other:?}"),
        }
    });

    reception.assert_hits(1);
    authorization.assert_hits(1);
    assert_eq!(
        *events.lock().expect("events"),
        vec![
            ProcessState::Idle,
            ProcessState::KeyValidated,
            ProcessState::Signed,
            ProcessState::Submitted,
            ProcessState::Polling { attempt: 1 },
            ProcessState::Authorized,
        ]
    );
}

#[test]
fn pending_authorization_times_out_as_pending() {
    let server = match try_start_server() {
        Some(server) => server,
        None => return,
    };
    server.mock(|when, then| {
        when.method(POST).path("/recepcion");
        then.status(200).body(reception_reply("RECIBIDA", ""));
    });
    let authorization = server.mock(|when, then| {
        when.method(POST).path("/autorizacion");
        then.status(200).body(authorization_reply("EN PROCESO"));
    });

    let rt = tokio::runtime::Runtime::new().expect("runtime");
    rt.block_on(async {
        let config = config_for(&server, EnvironmentType::Test);
        let client = SriClient::new(config.clone()).expect("client");
        let orchestrator = Orchestrator::new(client, SystemClock, config);

        let outcome = orchestrator
            .submit(
                SubmissionRequest::new(sample_invoice(TEST_KEY)),
                &|_: ProgressEvent| {},
            )
            .await
            .expect("outcome");

        assert_eq!(outcome.state(), ProcessState::TimedOut);
        assert_eq!(outcome.access_key().as_str(), TEST_KEY);
    });

    authorization.assert_hits(3);
}

#[test]
fn production_without_credential_makes_no_calls() {
    let server = match try_start_server() {
        Some(server) => server,
        None => return,
    };
    let reception = server.mock(|when, then| {
        when.method(POST).path("/recepcion");
        then.status(200).body(reception_reply("RECIBIDA", ""));
    });
    let authorization = server.mock(|when, then| {
        when.method(POST).path("/autorizacion");
        then.status(200).body(authorization_reply("AUTORIZADO"));
    });

    let rt = tokio::runtime::Runtime::new().expect("runtime");
    rt.block_on(async {
        let config = config_for(&server, EnvironmentType::Production);
        let client = SriClient::new(config.clone()).expect("client");
        let orchestrator = Orchestrator::new(client, SystemClock, config);

        let err = orchestrator
            .submit(
                SubmissionRequest::new(sample_invoice(PRODUCTION_KEY)),
                &|_: ProgressEvent| {},
            )
            .await
            .expect_err("missing credential");
        assert!(matches!(err, SubmissionError::MissingCredential));
    });

    reception.assert_hits(0);
    authorization.assert_hits(0);
}

#[test]
fn expired_certificate_is_rejected_before_any_call() {
    let server = match try_start_server() {
        Some(server) => server,
        None => return,
    };
    let reception = server.mock(|when, then| {
        when.method(POST).path("/recepcion");
        then.status(200).body(reception_reply("RECIBIDA", ""));
    });
    let authorization = server.mock(|when, then| {
        when.method(POST).path("/autorizacion");
        then.status(200).body(authorization_reply("AUTORIZADO"));
    });

    let rt = tokio::runtime::Runtime::new().expect("runtime");
    rt.block_on(async {
        let config = config_for(&server, EnvironmentType::Test);
        let client = SriClient::new(config.clone()).expect("client");
        let orchestrator = Orchestrator::new(client, SystemClock, config);
        let bundle = expired_bundle();
        let request = SubmissionRequest::new(sample_invoice(TEST_KEY))
            .with_credential(SigningCredential::new(bundle.pkcs12, PASSWORD));

        let outcome = orchestrator
            .submit(request, &|_: ProgressEvent| {})
            .await
            .expect("outcome");

        match outcome {
            SubmissionOutcome::Rejected {
                reason, signed_xml, ..
            } => {
                assert!(reason.contains("certificate"), "{reason}");
                assert!(signed_xml.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    });

    reception.assert_hits(0);
    authorization.assert_hits(0);
}
