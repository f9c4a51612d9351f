use crate::{
    crypto::Authority,
    identity::UnitType,
    secret::SecretConfig,
    trust::TrustCheck,
};

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

fn default_organization() -> String { "UntactOrder".into() }
fn default_cert_ttl_days() -> u32 { 365 }
fn default_authority_port() -> u16 { 443 }
fn default_timeout_ms() -> u64 { 5_000 }

#[derive(Clone, Debug, Deserialize)]
pub struct AuthorityConfig {
    pub listen: String,                     // ex 0.0.0.0:443
    pub address: String,                    // CN/SAN of the root, ex 10.0.0.5
    pub ca_cert: PathBuf,                   // "/etc/certserver/rootCA.crt"
    pub ca_key: PathBuf,                    // encrypted PKCS#8 PEM
    #[serde(default = "default_organization")]
    pub organization: String,
    #[serde(default = "default_cert_ttl_days")]
    pub cert_ttl_days: u32,
    #[serde(default = "default_cert_ttl_days")]
    pub root_ttl_days: u32,
    #[serde(default)]
    pub require_client_cert: bool,
    pub secret: SecretConfig,
}

#[derive(Clone)]
pub struct AuthorityAppState {
    pub authority: Arc<Authority>,
}

impl AuthorityConfig {
    pub fn load(path: &str) -> Result<Self> {
        let s = fs::read_to_string(path)
            .with_context(|| format!("reading config file `{}`", path))?;
        let cfg: AuthorityConfig = toml::from_str(&s)
            .with_context(|| format!("parsing `{}` as TOML", path))?;
        Ok(cfg)
    }
}

/// A unit this one renews certificates for, ex the bridge behind a pos.
#[derive(Clone, Debug, Deserialize)]
pub struct DependentUnit {
    pub unit_type: UnitType,
    pub private_ip: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct UnitConfig {
    pub unit_type: UnitType,                // "bridge" | "pos"
    pub cert_dir: PathBuf,                  // "/etc/posserver"
    pub setting_dir: PathBuf,               // "data"
    #[serde(default)]
    pub authority_address: Option<String>,  // falls back to the rootca record, then a prompt
    #[serde(default = "default_authority_port")]
    pub authority_port: u16,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub trust_check: TrustCheck,
    #[serde(default)]
    pub private_ip: Option<String>,         // overrides discovery
    #[serde(default)]
    pub dependent: Option<DependentUnit>,
    pub secret: SecretConfig,
}

impl UnitConfig {
    pub fn load(path: &str) -> Result<Self> {
        let s = fs::read_to_string(path)
            .with_context(|| format!("reading config file `{}`", path))?;
        let cfg: UnitConfig = toml::from_str(&s)
            .with_context(|| format!("parsing `{}` as TOML", path))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.unit_type == UnitType::CertAuthority {
            bail!("unit_type must be `bridge` or `pos`");
        }
        if let Some(dep) = &self.dependent {
            if dep.unit_type == UnitType::CertAuthority || dep.unit_type == self.unit_type {
                bail!("dependent unit_type must be the other enrollable role");
            }
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn cert_file(&self, unit: UnitType) -> PathBuf {
        self.cert_dir.join(format!("{}.crt", unit.as_str()))
    }

    pub fn key_file(&self, unit: UnitType) -> PathBuf {
        self.cert_dir.join(format!("{}.key", unit.as_str()))
    }

    pub fn pass_file(&self) -> PathBuf {
        self.cert_dir.join("ssl.pass")
    }

    pub fn root_ca_file(&self) -> PathBuf {
        self.cert_dir.join("rootCA.crt")
    }

    pub fn gateway_file(&self) -> PathBuf {
        self.setting_file("gateway")
    }

    pub fn authority_address_file(&self) -> PathBuf {
        self.setting_file("rootca")
    }

    fn setting_file(&self, stem: &str) -> PathBuf {
        self.setting_dir.join(format!("{}.{}setting", stem, self.unit_type.as_str()))
    }
}

pub fn ensure_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)
        .with_context(|| format!("creating directory `{}`", dir.display()))
}
