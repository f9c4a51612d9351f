use crate::{
    config::{AuthorityAppState, AuthorityConfig, ensure_dir},
    crypto::{Authority, encrypt_key, generate_root},
    handlers::{cert_request::cert_request_handler, index::index_handler},
    storage::write_atomic,
    utils::{certs_from_pem, key_from_pem, load_ca},
};

use std::{
    fs,
    io::{self, BufRead},
    net::SocketAddr,
    path::PathBuf,
    sync::Arc,
};
use anyhow::{Context, bail};
use axum::{routing::{get, post}, Router};
use axum_server::tls_rustls::RustlsConfig;
use rustls::{
    server::WebPkiClientVerifier,
    ServerConfig as RustlsServerConfig,
};
use tracing::{info, warn};

fn default_pass_file(cfg: &AuthorityConfig) -> PathBuf {
    cfg.ca_key
        .parent()
        .map(|dir| dir.join("ssl.pass"))
        .unwrap_or_else(|| PathBuf::from("ssl.pass"))
}

/// Unlocks the authority key. Any failure here is fatal for the server.
pub fn load_authority(cfg: &AuthorityConfig) -> anyhow::Result<Authority> {
    let cert_pem = fs::read(&cfg.ca_cert)
        .with_context(|| format!("reading authority certificate `{}`", cfg.ca_cert.display()))?;
    let material = cfg
        .secret
        .provider(&cfg.ca_key, &default_pass_file(cfg))
        .acquire()
        .context("acquiring authority key material")?;

    Authority::from_material(&cert_pem, &material, cfg.organization.clone(), cfg.cert_ttl_days)
        .context("loading authority key")
}

pub fn router(state: AuthorityAppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/cert_request/{unit_type}", post(cert_request_handler))
        .with_state(state)
}

/// The authority's root doubles as the server certificate, which is what
/// units pin through their bootstrap handshake.
pub fn tls_config(cfg: &AuthorityConfig, authority: &Authority) -> anyhow::Result<RustlsConfig> {
    let cert_chain = certs_from_pem(authority.certificate_pem()?.as_bytes())
        .context("reading server certificate")?;
    let priv_key = key_from_pem(authority.key_pem()?.as_bytes())
        .context("reading server private key")?;

    let builder = RustlsServerConfig::builder();
    let builder = if cfg.require_client_cert {
        let ca_store = load_ca(&cfg.ca_cert).context("reading CA root cert")?;
        let verifier = WebPkiClientVerifier::builder(Arc::new(ca_store))
            .build()
            .context("building client certificate verifier")?;
        builder.with_client_cert_verifier(verifier)
    } else {
        builder.with_no_client_auth()
    };

    let mut srv_cfg = builder
        .with_single_cert(cert_chain, priv_key)
        .context("invalid TLS cert/key combo")?;
    srv_cfg.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(RustlsConfig::from_config(Arc::new(srv_cfg)))
}

pub async fn run(cfg: AuthorityConfig) -> anyhow::Result<()> {
    let authority = load_authority(&cfg)?;
    info!(
        address = authority.common_name().as_deref().unwrap_or("?"),
        ttl_days = cfg.cert_ttl_days,
        require_client_cert = cfg.require_client_cert,
        "authority key loaded"
    );

    let tls_config = tls_config(&cfg, &authority)?;
    let state = AuthorityAppState { authority: Arc::new(authority) };
    let app = router(state);

    let addr: SocketAddr = cfg.listen
        .parse()
        .context("invalid listen address")?;
    info!(%addr, "certificate server listening");

    axum_server::bind_rustls(addr, tls_config)
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .await?;

    Ok(())
}

/// Creates the authority root and its encrypted key. Refuses to overwrite.
pub fn init(cfg: &AuthorityConfig) -> anyhow::Result<()> {
    if cfg.ca_cert.exists() || cfg.ca_key.exists() {
        bail!(
            "`{}` or `{}` already exists; remove them first to re-initialise",
            cfg.ca_cert.display(),
            cfg.ca_key.display()
        );
    }
    for path in [&cfg.ca_cert, &cfg.ca_key] {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            ensure_dir(dir)?;
        }
    }

    let passphrase = init_passphrase(cfg)?;
    let (cert, key) = generate_root(&cfg.address, &cfg.organization, cfg.root_ttl_days)?;

    write_atomic(&cfg.ca_key, encrypt_key(&key, &passphrase)?.as_bytes())
        .context("writing authority key")?;
    write_atomic(&cfg.ca_cert, &cert.to_pem()?)
        .context("writing authority certificate")?;

    info!(cert = %cfg.ca_cert.display(), key = %cfg.ca_key.display(), "authority initialised");
    Ok(())
}

fn init_passphrase(cfg: &AuthorityConfig) -> anyhow::Result<String> {
    use crate::secret::SecretConfig;

    let passphrase = match &cfg.secret {
        SecretConfig::File { pass_file } => {
            let path = pass_file.clone().unwrap_or_else(|| default_pass_file(cfg));
            fs::read_to_string(&path)
                .with_context(|| format!("reading `{}`", path.display()))?
                .replace(['\r', '\n'], "")
        }
        SecretConfig::Stdin => {
            let mut line = String::new();
            io::stdin().lock().read_line(&mut line)?;
            line.trim_end_matches(['\r', '\n']).to_string()
        }
        SecretConfig::Prompt => {
            let first = rpassword::prompt_password("New passphrase: ")?;
            let again = rpassword::prompt_password("Confirm passphrase: ")?;
            if first != again {
                bail!("passphrases do not match");
            }
            first
        }
    };

    if passphrase.is_empty() {
        bail!("empty passphrase not allowed");
    }
    if passphrase.len() < 8 {
        warn!("passphrase is shorter than 8 characters");
    }
    Ok(passphrase)
}
