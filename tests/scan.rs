mod common;

use common::{alert, issue, server_hello, spawn_raw, spawn_silent, spawn_tls, Reply};
use openssl::ssl::{Ssl, SslAcceptor, SslMethod};
use std::collections::BTreeMap;
use std::pin::Pin;
use std::time::Duration;
use tls_prober::certificate::TrustStore;
use tls_prober::model::{
    GapReason, ProbeId, ProbeOutcome, RejectReason, ScanReport, ScanStatus, StartTlsProtocol,
    VersionSupport,
};
use tls_prober::tls::{Alert, ProtocolVersion};
use tls_prober::{ProbeRegistry, ScanConfig, Scanner, Target};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_openssl::SslStream;

const GCM: &str = "TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256";
const CBC: &str = "TLS_RSA_WITH_AES_128_CBC_SHA";

fn config() -> ScanConfig {
    ScanConfig {
        connect_timeout: Duration::from_millis(500),
        read_timeout: Duration::from_millis(500),
        per_probe_timeout: Duration::from_secs(2),
        ..ScanConfig::default()
    }
}

/// Accepts only TLS 1.2 with ECDHE-RSA-AES128-GCM; everything else gets a
/// handshake_failure alert.
fn tls12_gcm_only(hello: &common::Hello) -> Reply {
    if hello.version == 0x0303 && hello.ciphers.contains(&0xc02f) {
        Reply::Send(server_hello(0x0303, 0xc02f))
    } else {
        Reply::Send(alert(40))
    }
}

#[tokio::test]
async fn reports_accepted_suite_and_rejected_version() {
    let addr = spawn_tls(tls12_gcm_only).await;
    let probes = ProbeRegistry::builtin()
        .resolve(&[format!("cipher/tls1_2/{GCM}"), "cipher/tls1_0/*".into()])
        .unwrap();
    assert!(probes.len() > 1);

    let scanner = Scanner::new(config()).unwrap();
    let report = scanner
        .scan(Target::new("127.0.0.1", addr.port()), &probes)
        .await
        .unwrap();

    assert!(report.is_complete(), "{:?}", report.status);
    assert!(report.accepts(ProtocolVersion::Tls12, GCM));
    assert_eq!(report.accepted_suites.len(), 1);
    assert_eq!(
        report.protocol_support.get(&ProtocolVersion::Tls12),
        Some(&VersionSupport::Accepted)
    );
    assert_eq!(
        report.protocol_support.get(&ProtocolVersion::Tls10),
        Some(&VersionSupport::Rejected)
    );
    assert!(report.conflicts.is_empty());
    assert_eq!(
        report.probes[&ProbeId::new(format!("cipher/tls1_0/{CBC}"))].outcome,
        ProbeOutcome::Rejected(RejectReason::Alert(Alert {
            level: 2,
            description: Alert::HANDSHAKE_FAILURE,
        }))
    );
}

/// Probe outcomes only; timings and timestamps differ between runs.
fn outcomes(report: &ScanReport) -> BTreeMap<ProbeId, ProbeOutcome> {
    report
        .probes
        .iter()
        .map(|(id, record)| (id.clone(), record.outcome.clone()))
        .collect()
}

#[tokio::test]
async fn rescanning_a_stable_server_gives_the_same_findings() {
    let addr = spawn_tls(tls12_gcm_only).await;
    let probes = ProbeRegistry::builtin()
        .resolve(&["cipher/tls1_2/*".to_string(), "cipher/tls1_0/*".into()])
        .unwrap();
    let scanner = Scanner::new(config()).unwrap();
    let target = Target::new("127.0.0.1", addr.port());

    let first = scanner.scan(target.clone(), &probes).await.unwrap();
    let second = scanner.scan(target, &probes).await.unwrap();

    assert!(first.is_complete(), "{:?}", first.status);
    assert_eq!(outcomes(&first), outcomes(&second));
    assert_eq!(first.accepted_suites, second.accepted_suites);
    assert_eq!(first.protocol_support, second.protocol_support);
    assert_eq!(first.status, second.status);
}

#[tokio::test]
async fn silent_target_does_not_hold_back_a_healthy_one() {
    let silent = spawn_silent().await;
    let healthy = spawn_tls(tls12_gcm_only).await;
    let probes = ProbeRegistry::builtin()
        .resolve(&[format!("cipher/tls1_2/{GCM}"), format!("cipher/tls1_0/{CBC}")])
        .unwrap();

    let scanner = Scanner::new(ScanConfig {
        read_timeout: Duration::from_millis(100),
        per_probe_timeout: Duration::from_millis(500),
        max_retries: 0,
        ..config()
    })
    .unwrap();
    let results = scanner
        .scan_many(
            vec![
                Target::new("127.0.0.1", silent.port()),
                Target::new("127.0.0.1", healthy.port()),
            ],
            &probes,
        )
        .await
        .unwrap();

    let silent = results[0].as_ref().unwrap();
    assert!(!silent.is_complete());
    let healthy = results[1].as_ref().unwrap();
    assert!(healthy.is_complete(), "{:?}", healthy.status);
    assert!(healthy.accepts(ProtocolVersion::Tls12, GCM));
    assert_eq!(healthy.probes.len(), 2);
}

#[tokio::test]
async fn silent_server_yields_partial_report() {
    let addr = spawn_silent().await;
    let ids = [format!("cipher/tls1_2/{GCM}"), "ext/alpn".to_string()];
    let probes = ProbeRegistry::builtin().resolve(&ids).unwrap();

    let scanner = Scanner::new(ScanConfig {
        read_timeout: Duration::from_millis(100),
        per_probe_timeout: Duration::from_millis(500),
        max_retries: 1,
        retry_backoff: Duration::from_millis(10),
        ..config()
    })
    .unwrap();
    let report = scanner
        .scan(Target::new("127.0.0.1", addr.port()), &probes)
        .await
        .unwrap();

    match &report.status {
        ScanStatus::Partial { gaps } => {
            assert_eq!(gaps.len(), 2);
            assert!(gaps.iter().all(|g| g.reason == GapReason::TimedOut));
        }
        other => panic!("expected partial report, got {other:?}"),
    }
    assert!(report.accepted_suites.is_empty());
    for id in &ids {
        let record = &report.probes[&ProbeId::new(id.as_str())];
        assert_eq!(record.attempts.len(), 2, "{id} was not retried");
    }
}

#[tokio::test]
async fn starttls_smtp_upgrade_then_probe() {
    let addr = spawn_raw(|socket| async move {
        let mut stream = BufReader::new(socket);
        let _ = stream.write_all(b"220 mx.example.com ESMTP\r\n").await;
        let mut line = String::new();
        let _ = stream.read_line(&mut line).await;
        let _ = stream
            .write_all(b"250-mx.example.com\r\n250 STARTTLS\r\n")
            .await;
        line.clear();
        let _ = stream.read_line(&mut line).await;
        let _ = stream.write_all(b"220 go ahead\r\n").await;
        common::answer(stream, &tls12_gcm_only).await;
    })
    .await;

    let probes = ProbeRegistry::builtin()
        .resolve(&[format!("cipher/tls1_2/{GCM}")])
        .unwrap();
    let target = Target::new("127.0.0.1", addr.port()).with_starttls(StartTlsProtocol::Smtp);
    let report = Scanner::new(config())
        .unwrap()
        .scan(target, &probes)
        .await
        .unwrap();

    assert!(report.is_complete(), "{:?}", report.status);
    assert!(report.accepts(ProtocolVersion::Tls12, GCM));
    assert_eq!(report.target.starttls, Some(StartTlsProtocol::Smtp));
}

#[tokio::test]
async fn each_trust_store_gets_its_own_verdict() {
    let lab_root = issue("Lab Root", None, None);
    let other_root = issue("Other Root", None, None);
    let leaf = issue("example.com", Some("example.com"), Some(&lab_root));

    let mut builder = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls()).unwrap();
    builder.set_private_key(&leaf.key).unwrap();
    builder.set_certificate(&leaf.cert).unwrap();
    let context = builder.build().into_context();

    let addr = spawn_raw(move |socket| {
        let context = context.clone();
        async move {
            let ssl = Ssl::new(&context).unwrap();
            let mut stream = SslStream::new(ssl, socket).unwrap();
            if Pin::new(&mut stream).accept().await.is_ok() {
                let mut buf = [0u8; 64];
                let _ = tokio::io::AsyncReadExt::read(&mut stream, &mut buf).await;
            }
        }
    })
    .await;

    let stores = vec![
        TrustStore::from_pem("lab", &lab_root.pem()).unwrap(),
        TrustStore::from_pem("other", &other_root.pem()).unwrap(),
    ];
    let probes = ProbeRegistry::builtin().resolve(&["cert/chain"]).unwrap();
    let target = Target::new("127.0.0.1", addr.port()).with_server_name("example.com");
    let report = Scanner::new(config())
        .unwrap()
        .with_trust_stores(stores)
        .scan(target, &probes)
        .await
        .unwrap();

    let cert = report.certificate.expect("certificate findings");
    assert!(cert.validation["lab"].is_valid());
    assert!(!cert.validation["other"].trusted);
    assert!(cert.validation["other"].hostname_match);
}
