//! Certificate renewal against the authority, one attempt per unit.

use crate::{
    crypto::IssuedCertificate,
    error::{Error, Result},
    handlers::cert_request::models::CertReq,
    identity::UnitType,
    storage::CertStore,
    trust::{PinnedRoot, TrustCheck},
};

use openssl::{pkey::PKey, x509::X509};
use reqwest::{Certificate, Client, Identity, StatusCode};
use std::time::Duration;
use tracing::{error, info};

/// PEM pair presented as the TLS client identity.
pub struct ClientIdentity {
    pub cert_pem: String,
    pub key_pem:  String,           // unencrypted PKCS#8
}

/// One unit to renew and where its result goes.
#[derive(Clone, Debug)]
pub struct RenewalTarget {
    pub unit_type:  UnitType,
    pub private_ip: String,
    pub store:      CertStore,
}

#[derive(Debug, Default)]
pub struct RenewalOutcome {
    pub renewed: Vec<UnitType>,
    pub failed:  Vec<(UnitType, Error)>,
}

impl RenewalOutcome {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct RenewalClient {
    http:        Client,
    base_url:    String,
    root:        PinnedRoot,
    trust_check: TrustCheck,
}

impl RenewalClient {
    /// Only the pinned root is trusted; built-in roots are disabled.
    pub fn new(
        address: &str,
        port: u16,
        root: PinnedRoot,
        identity: Option<&ClientIdentity>,
        timeout: Duration,
        trust_check: TrustCheck,
    ) -> Result<Self> {
        let mut builder = Client::builder()
            .tls_built_in_root_certs(false)
            .add_root_certificate(Certificate::from_pem(&root.to_pem()?)?)
            .connect_timeout(timeout)
            .timeout(timeout);

        if let Some(id) = identity {
            let identity = Identity::from_pkcs8_pem(id.cert_pem.as_bytes(), id.key_pem.as_bytes())
                .map_err(|e| Error::KeyMaterial(format!("client identity: {e}")))?;
            builder = builder.identity(identity);
        }

        Ok(RenewalClient {
            http: builder.build()?,
            base_url: base_url(address, port),
            root,
            trust_check,
        })
    }

    /// `GET /`, returns the greeting.
    pub async fn probe(&self) -> Result<String> {
        let resp = self.http.get(format!("{}/", self.base_url)).send().await?;
        let status = resp.status();
        let body = resp.text().await?;
        if status != StatusCode::OK {
            return Err(Error::Remote { status: status.as_u16(), body });
        }
        Ok(body)
    }

    /// One `POST /cert_request/{unit}`; anything but 200 is a remote error.
    pub async fn request(&self, unit_type: UnitType, private_ip: &str) -> Result<IssuedCertificate> {
        let url = format!("{}/cert_request/{}", self.base_url, unit_type);
        let resp = self
            .http
            .post(&url)
            .json(&CertReq { ip: private_ip.to_string() })
            .send()
            .await?;

        let status = resp.status();
        if status != StatusCode::OK {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Remote { status: status.as_u16(), body });
        }
        Ok(resp.json::<IssuedCertificate>().await?)
    }

    /// Requests, checks against the pinned root, then writes atomically.
    pub async fn renew(&self, target: &RenewalTarget) -> Result<IssuedCertificate> {
        info!(unit = %target.unit_type, private_ip = %target.private_ip, "requesting certificate");
        let issued = self.request(target.unit_type, &target.private_ip).await?;
        self.verify(&issued)?;
        target
            .store
            .save(&issued.certificate_pem, &issued.key_pem)?;
        info!(
            unit = %target.unit_type,
            path = %target.store.cert_path.display(),
            "certificate renewed"
        );
        Ok(issued)
    }

    /// Renews every target independently; one failure does not stop the others.
    pub async fn renew_all(&self, targets: &[RenewalTarget]) -> RenewalOutcome {
        let mut outcome = RenewalOutcome::default();
        for target in targets {
            match self.renew(target).await {
                Ok(_) => outcome.renewed.push(target.unit_type),
                Err(e) => {
                    error!(unit = %target.unit_type, error = %e, "renewal failed");
                    outcome.failed.push((target.unit_type, e));
                }
            }
        }
        outcome
    }

    fn verify(&self, issued: &IssuedCertificate) -> Result<()> {
        let cert = X509::from_pem(issued.certificate_pem.as_bytes())
            .map_err(|e| Error::TrustBootstrap(format!("unparseable certificate: {e}")))?;
        if !self.root.check(&cert, self.trust_check) {
            return Err(Error::TrustBootstrap(
                "certificate was not issued by the pinned root".into(),
            ));
        }
        let key = PKey::private_key_from_pem(issued.key_pem.as_bytes())
            .map_err(|e| Error::TrustBootstrap(format!("unparseable key: {e}")))?;
        if !cert.public_key()?.public_eq(&key) {
            return Err(Error::TrustBootstrap("key does not match certificate".into()));
        }
        Ok(())
    }
}

fn base_url(address: &str, port: u16) -> String {
    if address.contains(':') {
        format!("https://[{address}]:{port}")
    } else {
        format!("https://{address}:{port}")
    }
}
