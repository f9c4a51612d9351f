//! Renewal client against a live TLS listener on loopback.

use axum::{Json, Router, routing::post};
use axum_server::Handle;
use openssl::x509::X509;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tempfile::TempDir;
use untactorder_pki::{
    config::{AuthorityAppState, AuthorityConfig},
    crypto::{Authority, IssuedCertificate, common_name, generate_root},
    error::Error,
    identity::{UnitIdentity, UnitType},
    mode::certserver::{router, tls_config},
    renewal::{RenewalClient, RenewalTarget},
    secret::SecretConfig,
    storage::CertStore,
    trust::{PinnedRoot, TrustCheck},
};

struct Running {
    port: u16,
    root: PinnedRoot,
}

async fn serve() -> Running {
    serve_with(|authority| router(AuthorityAppState { authority })).await
}

/// Same TLS identity as the real authority, but whatever routes `app` builds.
async fn serve_with(app: impl FnOnce(Arc<Authority>) -> Router) -> Running {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let cfg = AuthorityConfig {
        listen:              "127.0.0.1:0".into(),
        address:             "127.0.0.1".into(),
        ca_cert:             "unused/rootCA.crt".into(),
        ca_key:              "unused/rootCA.key".into(),
        organization:        "UntactOrder".into(),
        cert_ttl_days:       7,
        root_ttl_days:       30,
        require_client_cert: false,
        secret:              SecretConfig::Prompt,
    };
    let (cert, key) = generate_root(&cfg.address, &cfg.organization, cfg.root_ttl_days).unwrap();
    let authority = Authority::new(cert, key, &cfg.organization, cfg.cert_ttl_days).unwrap();
    let root = PinnedRoot::from_pem(authority.certificate_pem().unwrap().as_bytes()).unwrap();

    let tls = tls_config(&cfg, &authority).unwrap();
    let app = app(Arc::new(authority));

    let handle = Handle::new();
    let server = axum_server::bind_rustls(cfg.listen.parse::<SocketAddr>().unwrap(), tls)
        .handle(handle.clone())
        .serve(app.into_make_service_with_connect_info::<SocketAddr>());
    tokio::spawn(server);

    let addr = handle.listening().await.unwrap();
    Running { port: addr.port(), root }
}

fn client(running: &Running) -> RenewalClient {
    RenewalClient::new(
        "127.0.0.1",
        running.port,
        running.root.clone(),
        None,
        Duration::from_secs(10),
        TrustCheck::Signature,
    )
    .unwrap()
}

fn target(dir: &TempDir, unit_type: UnitType, private_ip: &str) -> RenewalTarget {
    RenewalTarget {
        unit_type,
        private_ip: private_ip.into(),
        store: CertStore::new(
            dir.path().join(format!("{unit_type}.crt")),
            dir.path().join(format!("{unit_type}.key")),
        ),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn probe_greets_over_the_pinned_root() {
    let running = serve().await;
    let greeting = client(&running).probe().await.unwrap();
    assert_eq!(greeting, "Hello, 127.0.0.1!");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn renews_own_unit_and_dependent() {
    let running = serve().await;
    let dir = TempDir::new().unwrap();
    let targets = [
        target(&dir, UnitType::Pos, "192.168.0.42"),
        target(&dir, UnitType::Bridge, "192.168.0.43"),
    ];

    let outcome = client(&running).renew_all(&targets).await;
    assert!(outcome.is_complete(), "{:?}", outcome.failed);
    assert_eq!(outcome.renewed, vec![UnitType::Pos, UnitType::Bridge]);

    for (t, ip) in targets.iter().zip(["192.168.0.42", "192.168.0.43"]) {
        let (cert_pem, key_pem) = t.store.load().unwrap();
        let cert = X509::from_pem(cert_pem.as_bytes()).unwrap();
        assert_eq!(common_name(&cert).as_deref(), Some(ip));
        assert!(running.root.check(&cert, TrustCheck::Signature));
        assert!(key_pem.contains("PRIVATE KEY"));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn one_rejected_target_does_not_stop_the_other() {
    let running = serve().await;
    let dir = TempDir::new().unwrap();
    let targets = [
        target(&dir, UnitType::Bridge, "not-an-ip"),
        target(&dir, UnitType::Pos, "192.168.0.42"),
    ];

    let outcome = client(&running).renew_all(&targets).await;
    assert_eq!(outcome.renewed, vec![UnitType::Pos]);
    assert_eq!(outcome.failed.len(), 1);
    let (unit, err) = &outcome.failed[0];
    assert_eq!(*unit, UnitType::Bridge);
    assert!(matches!(err, Error::Remote { status: 400, .. }), "{err}");
    assert!(!targets[0].store.exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn foreign_root_is_not_trusted() {
    let running = serve().await;
    let (other, _) = generate_root("127.0.0.1", "UntactOrder", 30).unwrap();
    let foreign = PinnedRoot::from_pem(&other.to_pem().unwrap()).unwrap();

    let client = RenewalClient::new(
        "127.0.0.1",
        running.port,
        foreign,
        None,
        Duration::from_secs(10),
        TrustCheck::Issuer,
    )
    .unwrap();
    assert!(matches!(client.probe().await, Err(Error::Http(_))));
}

/// Answers every certificate request with the same canned pair.
fn canned(issued: IssuedCertificate) -> Router {
    Router::new().route(
        "/cert_request/{unit_type}",
        post(move || {
            let issued = issued.clone();
            async move { Json(issued) }
        }),
    )
}

fn pos_identity() -> UnitIdentity {
    UnitIdentity::new(UnitType::Pos, "127.0.0.1", "192.168.0.42")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn certificate_from_a_same_named_impostor_is_not_stored() {
    // same subject as the pinned root, different key
    let (twin_cert, twin_key) = generate_root("127.0.0.1", "UntactOrder", 30).unwrap();
    let twin = Authority::new(twin_cert, twin_key, "UntactOrder", 7).unwrap();
    let forged = twin.sign(&pos_identity()).unwrap();

    let running = serve_with(move |_| canned(forged)).await;
    let dir = TempDir::new().unwrap();
    let target = target(&dir, UnitType::Pos, "192.168.0.42");

    let err = client(&running).renew(&target).await.unwrap_err();
    assert!(matches!(err, Error::TrustBootstrap(_)), "{err}");
    assert!(!target.store.exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn key_not_matching_its_certificate_is_not_stored() {
    let running = serve_with(|authority| {
        let mut issued = authority.sign(&pos_identity()).unwrap();
        issued.key_pem = authority.sign(&pos_identity()).unwrap().key_pem;
        canned(issued)
    })
    .await;
    let dir = TempDir::new().unwrap();
    let target = target(&dir, UnitType::Pos, "192.168.0.42");

    let err = client(&running).renew(&target).await.unwrap_err();
    assert!(matches!(err, Error::TrustBootstrap(_)), "{err}");
    assert!(!target.store.exists());
}
