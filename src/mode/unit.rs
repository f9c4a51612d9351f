use crate::{
    config::{UnitConfig, ensure_dir},
    crypto::common_name,
    error::Error,
    gateway::{GatewayGuard, GuardOutcome},
    identity::UnitType,
    network::{LinuxProbe, NetworkInfo, NetworkProbe},
    operator::{Console, Operator},
    renewal::{ClientIdentity, RenewalClient, RenewalOutcome, RenewalTarget},
    storage::{CertStore, GatewayStore, TextRecord},
    trust::PinnedRoot,
};

use std::{fs, io::ErrorKind};
use anyhow::{Context, Result, bail};
use openssl::x509::X509;
use tracing::{info, warn};

/// Where the two blocking startup phases ended up.
pub struct Startup {
    pub network:           NetworkInfo,
    pub gateway:           GuardOutcome,
    pub authority_address: String,
    pub root:              PinnedRoot,
}

/// Phase 1 pins the gateway, phase 2 pins the authority root.
/// Nothing talks to the authority before both have finished.
pub fn startup(cfg: &UnitConfig, probe: &dyn NetworkProbe, operator: &dyn Operator) -> Result<Startup> {
    ensure_dir(&cfg.cert_dir)?;
    ensure_dir(&cfg.setting_dir)?;

    let guard = GatewayGuard::new(GatewayStore::new(cfg.gateway_file()), probe, operator);
    let (network, gateway) = guard.run().context("pinning the gateway")?;
    info!(binding = %gateway.binding(), "gateway resolved");

    let authority_address = authority_address(cfg, operator)?;
    let root = PinnedRoot::fetch(&authority_address, cfg.authority_port, cfg.timeout())
        .context("fetching the root CA certificate")?;
    pin_root(cfg, &root, operator)?;

    Ok(Startup { network, gateway, authority_address, root })
}

/// Config first, then the stored record, then ask once and remember.
pub fn authority_address(cfg: &UnitConfig, operator: &dyn Operator) -> Result<String> {
    if let Some(addr) = &cfg.authority_address {
        return Ok(addr.clone());
    }

    let record = TextRecord::new(cfg.authority_address_file());
    if let Some(addr) = record.load()? {
        return Ok(addr);
    }

    warn!("Root-CA ip address setting is not found");
    let addr = operator.ask("Root-CA IP Address:")?.trim().to_string();
    if addr.is_empty() {
        bail!("no Root-CA address given");
    }
    record.save(&addr)?;
    Ok(addr)
}

// a root that differs from last run's is only accepted on explicit confirmation
pub fn pin_root(cfg: &UnitConfig, root: &PinnedRoot, operator: &dyn Operator) -> Result<()> {
    let path = cfg.root_ca_file();
    let previous = match fs::read(&path) {
        Ok(pem) => Some(pem),
        Err(e) if e.kind() == ErrorKind::NotFound => None,
        Err(e) => {
            return Err(Error::TrustBootstrap(format!(
                "cannot read pinned root `{}`: {e}",
                path.display()
            ))
            .into());
        }
    };
    if let Some(previous) = previous {
        if !root.matches_previous(&previous)
            && !operator.confirm("The authority presented a different root certificate. Trust it?")?
        {
            return Err(Error::TrustBootstrap(format!(
                "root certificate changed, keeping `{}`",
                path.display()
            ))
            .into());
        }
    }
    root.persist(&path)?;
    Ok(())
}

/// Own unit first, then the dependent if one is configured.
pub fn renewal_targets(cfg: &UnitConfig, own_private_ip: &str) -> Vec<RenewalTarget> {
    let target = |unit_type: UnitType, private_ip: &str| RenewalTarget {
        unit_type,
        private_ip: private_ip.to_string(),
        store: CertStore::new(cfg.cert_file(unit_type), cfg.key_file(unit_type)),
    };

    let mut targets = vec![target(cfg.unit_type, own_private_ip)];
    if let Some(dep) = &cfg.dependent {
        targets.push(target(dep.unit_type, &dep.private_ip));
    }
    targets
}

/// The unit's current authority-issued pair, unlocked through the configured secret channel.
/// `None` on a unit that has never been enrolled.
pub fn client_identity(cfg: &UnitConfig) -> Result<Option<ClientIdentity>> {
    let store = CertStore::new(cfg.cert_file(cfg.unit_type), cfg.key_file(cfg.unit_type));
    store.recover().context("recovering an interrupted certificate update")?;
    if !store.exists() {
        warn!(
            path = %store.cert_path.display(),
            "certificate files not found, enrolling without a client identity"
        );
        return Ok(None);
    }

    let material = cfg
        .secret
        .provider(&store.key_path, &cfg.pass_file())
        .acquire()
        .context("acquiring unit key material")?;
    let key = material.unlock()?;
    let cert_pem = fs::read_to_string(&store.cert_path)?;

    let cert = X509::from_pem(cert_pem.as_bytes()).context("parsing unit certificate")?;
    if !cert.public_key()?.public_eq(&key) {
        warn!(
            path = %store.cert_path.display(),
            "certificate and private key do not match, enrolling without a client identity"
        );
        return Ok(None);
    }

    Ok(Some(ClientIdentity {
        cert_pem,
        key_pem: String::from_utf8_lossy(&key.private_key_to_pem_pkcs8()?).into_owned(),
    }))
}

fn notice_private_ip_change(identity: Option<&ClientIdentity>, private_ip: &str) {
    let previous = identity
        .and_then(|id| X509::from_pem(id.cert_pem.as_bytes()).ok())
        .and_then(|cert| common_name(&cert));
    if let Some(previous) = previous.filter(|p| p != private_ip) {
        info!("NOTICE: Internal IP address has changed. {previous} => {private_ip}");
    }
}

pub async fn renew(cfg: &UnitConfig, startup: Startup) -> Result<RenewalOutcome> {
    let own_ip = cfg
        .private_ip
        .clone()
        .unwrap_or_else(|| startup.network.internal_ip.clone());

    let identity = client_identity(cfg)?;
    notice_private_ip_change(identity.as_ref(), &own_ip);

    let client = RenewalClient::new(
        &startup.authority_address,
        cfg.authority_port,
        startup.root,
        identity.as_ref(),
        cfg.timeout(),
        cfg.trust_check,
    )?;

    let greeting = client
        .probe()
        .await
        .context("couldn't connect with the certificate server")?;
    info!(%greeting, "certificate server reachable");

    Ok(client.renew_all(&renewal_targets(cfg, &own_ip)).await)
}

pub async fn run(cfg: UnitConfig) -> Result<()> {
    // blocking on purpose: nothing else may run until both phases are terminal
    let startup = startup(&cfg, &LinuxProbe, &Console)?;
    let outcome = renew(&cfg, startup).await?;

    for unit in &outcome.renewed {
        info!(%unit, "renewed");
    }
    if !outcome.is_complete() {
        let failed: Vec<String> = outcome
            .failed
            .iter()
            .map(|(unit, e)| format!("{unit}: {e}"))
            .collect();
        bail!("renewal failed for {}", failed.join(", "));
    }
    Ok(())
}
