use crate::{
    error::Result,
    network::GatewayRecord,
};

use openssl::{pkey::PKey, x509::X509};
use std::{
    fs,
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
};
use tempfile::NamedTempFile;
use tracing::{info, warn};

/// Replaces `path` with `contents` via a synced temp file in the same directory.
/// A crash leaves either the old file or the new one, never a partial write.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

fn read_optional(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(s)                                      => Ok(Some(s)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e)                                     => Err(e.into()),
    }
}

/// `gateway.<unit>setting`
#[derive(Clone, Debug)]
pub struct GatewayStore {
    path: PathBuf,
}

impl GatewayStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        GatewayStore { path: path.into() }
    }

    pub fn load(&self) -> Result<Option<GatewayRecord>> {
        read_optional(&self.path)?
            .map(|s| s.parse::<GatewayRecord>())
            .transpose()
    }

    pub fn save(&self, record: &GatewayRecord) -> Result<()> {
        write_atomic(&self.path, record.to_string().as_bytes())
    }
}

/// Single trimmed line of text, e.g. the authority address record.
#[derive(Clone, Debug)]
pub struct TextRecord {
    path: PathBuf,
}

impl TextRecord {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        TextRecord { path: path.into() }
    }

    pub fn load(&self) -> Result<Option<String>> {
        Ok(read_optional(&self.path)?
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty()))
    }

    pub fn save(&self, value: &str) -> Result<()> {
        write_atomic(&self.path, value.trim().as_bytes())
    }
}

/// A unit's certificate and private key files.
///
/// A new pair is staged next to the live one (`<file>.new`) before either live
/// file is touched, then promoted key first. [`CertStore::recover`] finishes or
/// discards a promotion that a crash interrupted.
#[derive(Clone, Debug)]
pub struct CertStore {
    pub cert_path: PathBuf,
    pub key_path:  PathBuf,
}

impl CertStore {
    pub fn new(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        CertStore { cert_path: cert_path.into(), key_path: key_path.into() }
    }

    pub fn save(&self, cert_pem: &str, key_pem: &str) -> Result<()> {
        let (staged_cert, staged_key) = (self.staged_cert(), self.staged_key());
        write_atomic(&staged_key, key_pem.as_bytes())?;
        write_atomic(&staged_cert, cert_pem.as_bytes())?;
        fs::rename(&staged_key, &self.key_path)?;
        fs::rename(&staged_cert, &self.cert_path)?;
        Ok(())
    }

    pub fn load(&self) -> Result<(String, String)> {
        Ok((
            fs::read_to_string(&self.cert_path)?,
            fs::read_to_string(&self.key_path)?,
        ))
    }

    pub fn exists(&self) -> bool {
        self.cert_path.is_file() && self.key_path.is_file()
    }

    /// Completes an interrupted [`CertStore::save`] when the staged files form a
    /// matching pair with whatever is live, otherwise drops them.
    /// Returns whether anything was promoted.
    pub fn recover(&self) -> Result<bool> {
        let (staged_cert, staged_key) = (self.staged_cert(), self.staged_key());
        let cert_staged = staged_cert.is_file();
        let key_staged = staged_key.is_file();
        if !cert_staged && !key_staged {
            return Ok(false);
        }

        let cert_src = if cert_staged { &staged_cert } else { &self.cert_path };
        let key_src = if key_staged { &staged_key } else { &self.key_path };

        if pair_matches(cert_src, key_src) {
            if key_staged {
                fs::rename(&staged_key, &self.key_path)?;
            }
            if cert_staged {
                fs::rename(&staged_cert, &self.cert_path)?;
            }
            info!(path = %self.cert_path.display(), "interrupted certificate update completed");
            Ok(true)
        } else {
            warn!(path = %self.cert_path.display(), "discarding incomplete certificate update");
            for path in [&staged_cert, &staged_key] {
                remove_if_present(path)?;
            }
            Ok(false)
        }
    }

    fn staged_cert(&self) -> PathBuf {
        staged(&self.cert_path)
    }

    fn staged_key(&self) -> PathBuf {
        staged(&self.key_path)
    }
}

fn staged(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".new");
    PathBuf::from(name)
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

// staged keys are always the unencrypted PKCS#8 the authority hands out
fn pair_matches(cert_path: &Path, key_path: &Path) -> bool {
    let cert = fs::read(cert_path).ok().and_then(|pem| X509::from_pem(&pem).ok());
    let key = fs::read(key_path).ok().and_then(|pem| PKey::private_key_from_pem(&pem).ok());
    match (cert, key) {
        (Some(cert), Some(key)) => cert
            .public_key()
            .map(|public| public.public_eq(&key))
            .unwrap_or(false),
        _ => false,
    }
}
