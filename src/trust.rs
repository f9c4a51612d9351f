//! Trust-on-first-use pinning of the authority's root certificate.

use crate::{
    crypto::common_name,
    error::{Error, Result},
    storage::write_atomic,
};

use openssl::{
    ssl::{SslConnector, SslMethod, SslVerifyMode},
    x509::{X509, X509Ref},
};
use serde::Deserialize;
use std::{
    cmp::Ordering,
    net::{TcpStream, ToSocketAddrs},
    path::Path,
    time::Duration,
};
use tracing::{debug, info, warn};

/// How a received certificate is matched against the pinned root.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustCheck {
    /// `issuer == pinned.subject`. Says nothing about who actually signed it.
    #[default]
    Issuer,
    /// Issuer equality plus a signature check against the pinned public key.
    Signature,
}

/// Trust anchor for the lifetime of the process.
#[derive(Clone, Debug)]
pub struct PinnedRoot {
    cert: X509,
}

impl PinnedRoot {
    pub fn from_pem(pem: &[u8]) -> Result<Self> {
        let cert = X509::from_pem(pem)
            .map_err(|e| Error::TrustBootstrap(format!("unparseable root certificate: {e}")))?;
        Ok(PinnedRoot { cert })
    }

    /// Handshakes with `address:port` only to read the peer certificate.
    /// No verification is done and no application data is sent.
    pub fn fetch(address: &str, port: u16, timeout: Duration) -> Result<Self> {
        info!(%address, port, "getting root CA certificate");
        let fail = |what: String| Error::TrustBootstrap(format!("{address}:{port}: {what}"));

        let addr = (address, port)
            .to_socket_addrs()
            .map_err(|e| fail(format!("resolve: {e}")))?
            .next()
            .ok_or_else(|| fail("no address resolved".into()))?;
        let stream = TcpStream::connect_timeout(&addr, timeout)
            .map_err(|e| fail(format!("no connection: {e}")))?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;

        let mut builder = SslConnector::builder(SslMethod::tls_client())?;
        builder.set_verify(SslVerifyMode::NONE);
        let mut session = builder.build().configure()?;
        session.set_verify_hostname(false);
        session.set_use_server_name_indication(false);

        let mut tls = session
            .connect(address, stream)
            .map_err(|e| fail(format!("handshake: {e}")))?;
        let cert = tls
            .ssl()
            .peer_certificate()
            .ok_or_else(|| fail("peer presented no certificate".into()))?;
        // the certificate is already in hand, a failed close-notify changes nothing
        if let Err(e) = tls.shutdown() {
            debug!(error = %e, "close-notify to the authority failed");
        }

        let root = PinnedRoot { cert };
        info!(
            subject = root.authority_common_name().as_deref().unwrap_or("?"),
            fingerprint = %root.fingerprint()?,
            "root CA certificate received"
        );
        Ok(root)
    }

    pub fn certificate(&self) -> &X509Ref {
        &self.cert
    }

    pub fn to_pem(&self) -> Result<Vec<u8>> {
        Ok(self.cert.to_pem()?)
    }

    pub fn persist(&self, path: &Path) -> Result<()> {
        write_atomic(path, &self.to_pem()?)
    }

    /// CN of the pinned root, i.e. the address the authority issued it for.
    pub fn authority_common_name(&self) -> Option<String> {
        common_name(&self.cert)
    }

    pub fn fingerprint(&self) -> Result<String> {
        let digest = self.cert.digest(openssl::hash::MessageDigest::sha256())?;
        Ok(hex::encode(&*digest))
    }

    /// Shallow check: does `candidate` claim to be issued by the pinned authority?
    pub fn check_issuer(&self, candidate: &X509Ref) -> bool {
        matches!(
            candidate.issuer_name().try_cmp(self.cert.subject_name()),
            Ok(Ordering::Equal)
        )
    }

    pub fn check(&self, candidate: &X509Ref, mode: TrustCheck) -> bool {
        if !self.check_issuer(candidate) {
            return false;
        }
        match mode {
            TrustCheck::Issuer => true,
            TrustCheck::Signature => self
                .cert
                .public_key()
                .and_then(|key| candidate.verify(&key))
                .unwrap_or(false),
        }
    }

    /// Compares against the root pinned on a previous run and warns on drift.
    pub fn matches_previous(&self, previous_pem: &[u8]) -> bool {
        let same = X509::from_pem(previous_pem)
            .and_then(|prev| Ok(prev.to_der()? == self.cert.to_der()?))
            .unwrap_or(false);
        if !same {
            warn!("root CA certificate differs from the one pinned on a previous run");
        }
        same
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        crypto::{Authority, generate_root},
        identity::{UnitIdentity, UnitType},
    };
    use openssl::ssl::SslAcceptor;
    use std::{net::TcpListener, thread};

    fn issued_by(ca: &Authority) -> X509 {
        let issued = ca
            .sign(&UnitIdentity::new(UnitType::Pos, "203.0.113.5", "192.168.0.7"))
            .unwrap();
        X509::from_pem(issued.certificate_pem.as_bytes()).unwrap()
    }

    #[test]
    fn issuer_check_accepts_own_children_and_self() {
        let (cert, key) = generate_root("10.0.0.5", "UntactOrder", 30).unwrap();
        let root = PinnedRoot::from_pem(&cert.to_pem().unwrap()).unwrap();
        let ca = Authority::new(cert.clone(), key, "UntactOrder", 7).unwrap();

        assert!(root.check_issuer(&issued_by(&ca)));
        assert!(root.check_issuer(&cert), "self-signed root is its own issuer");
        assert!(root.check(&issued_by(&ca), TrustCheck::Signature));
    }

    #[test]
    fn issuer_check_rejects_other_authorities() {
        let (cert, _) = generate_root("10.0.0.5", "UntactOrder", 30).unwrap();
        let root = PinnedRoot::from_pem(&cert.to_pem().unwrap()).unwrap();

        let (other_cert, other_key) = generate_root("10.0.0.6", "UntactOrder", 30).unwrap();
        let other = Authority::new(other_cert, other_key, "UntactOrder", 7).unwrap();
        assert!(!root.check_issuer(&issued_by(&other)));
    }

    #[test]
    fn signature_mode_catches_a_forged_issuer_name() {
        let (cert, _) = generate_root("10.0.0.5", "UntactOrder", 30).unwrap();
        let root = PinnedRoot::from_pem(&cert.to_pem().unwrap()).unwrap();

        // same subject, different key: the shallow check is fooled, the signature check is not
        let (twin_cert, twin_key) = generate_root("10.0.0.5", "UntactOrder", 30).unwrap();
        let twin = Authority::new(twin_cert, twin_key, "UntactOrder", 7).unwrap();
        let forged = issued_by(&twin);

        assert!(root.check(&forged, TrustCheck::Issuer));
        assert!(!root.check(&forged, TrustCheck::Signature));
    }

    #[test]
    fn fetch_pins_the_presented_certificate() {
        let (cert, key) = generate_root("127.0.0.1", "UntactOrder", 30).unwrap();
        let mut acceptor = SslAcceptor::mozilla_intermediate(SslMethod::tls()).unwrap();
        acceptor.set_private_key(&key).unwrap();
        acceptor.set_certificate(&cert).unwrap();
        let acceptor = acceptor.build();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let _ = acceptor.accept(stream);
        });

        let root = PinnedRoot::fetch("127.0.0.1", port, Duration::from_secs(5)).unwrap();
        server.join().unwrap();

        assert_eq!(root.certificate().to_der().unwrap(), cert.to_der().unwrap());
        assert_eq!(root.authority_common_name().as_deref(), Some("127.0.0.1"));
        assert!(root.matches_previous(&cert.to_pem().unwrap()));
    }

    #[test]
    fn unreachable_authority_is_fatal() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = PinnedRoot::fetch("127.0.0.1", port, Duration::from_millis(500));
        assert!(matches!(err, Err(Error::TrustBootstrap(_))));
    }
}
