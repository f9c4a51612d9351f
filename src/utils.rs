use rustls_pemfile::{certs, private_key, read_one, Item};
use anyhow::{Context, Result};
use axum::http::HeaderMap;
use std::{
    fs::File,
    io::{BufRead, BufReader},
    path::Path,
};
use rustls::{
    RootCertStore,
    pki_types::{CertificateDer, PrivateKeyDer},
};

// all x509 certs in a PEM buffer
pub fn certs_from_pem(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let mut rd = pem;
    let raw_certs = certs(&mut rd)
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("reading certificates from PEM")?;
    if raw_certs.is_empty() {
        anyhow::bail!("no certificate found in PEM");
    }
    Ok(raw_certs)
}

// first private key in a PEM buffer (pkcs8, pkcs1 or sec1)
pub fn key_from_pem(pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    let mut rd = pem;
    private_key(&mut rd)
        .context("reading PEM block")?
        .context("no private key found in PEM")
}

// load and add CA certs to a rustls RootCertStore from PEM
pub fn load_ca(path: &Path) -> Result<RootCertStore> {
    let rd = BufReader::new(File::open(path)
        .with_context(|| format!("opening CA file `{}`", path.display()))?);
    ca_store(rd)
}

pub fn ca_store(mut rd: impl BufRead) -> Result<RootCertStore> {
    let mut store = RootCertStore::empty();
    loop {
        match read_one(&mut rd)
            .context("reading PEM block")?
        {
            Some(Item::X509Certificate(der)) => {
                store.add_parsable_certificates(std::iter::once(CertificateDer::from(der)));
            }
            Some(_) => continue,
            None    => break,
        }
    }
    if store.is_empty() {
        anyhow::bail!("no usable CA certificate found");
    }
    Ok(store)
}

// X-Real-IP set by the reverse proxy, then the first X-Forwarded-For hop
pub fn forwarded_ip(headers: &HeaderMap) -> Option<String> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    header("x-real-ip")
        .or_else(|| header("x-forwarded-for").and_then(|v| v.split(',').next()).map(str::trim))
        .map(str::to_string)
}
