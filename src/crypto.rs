use crate::{
    error::{Error, Result},
    identity::{EnrollmentRequest, UnitIdentity, UnitType},
    secret::SecretMaterial,
};

use openssl::{
    asn1::Asn1Time,
    bn::{BigNum, MsbOption},
    hash::MessageDigest,
    nid::Nid,
    pkey::{PKey, Private},
    rsa::Rsa,
    symm::Cipher,
    x509::{
        X509, X509Builder, X509NameBuilder, X509Ref,
        extension::{
            AuthorityKeyIdentifier, BasicConstraints, ExtendedKeyUsage, KeyUsage,
            SubjectAlternativeName, SubjectKeyIdentifier,
        },
    },
};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use tracing::{debug, info};

const RSA_BITS: u32 = 2048;
const SERIAL_BITS: i32 = 159;

/// Certificate material handed back to an enrolling unit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedCertificate {
    #[serde(rename = "crt")]
    pub certificate_pem: String,
    #[serde(rename = "key")]
    pub key_pem:         String,
}

/// The authority's unlocked signing key and its own certificate.
/// Loaded once at startup and shared read-only between requests.
pub struct Authority {
    cert:         X509,
    key:          PKey<Private>,
    organization: String,
    ttl_days:     u32,
}

impl Authority {
    pub fn new(cert: X509, key: PKey<Private>, organization: impl Into<String>, ttl_days: u32) -> Result<Self> {
        if !cert.public_key()?.public_eq(&key) {
            return Err(Error::KeyMaterial(
                "private key does not belong to the authority certificate".into(),
            ));
        }
        Ok(Authority { cert, key, organization: organization.into(), ttl_days })
    }

    /// Decrypts the key with the acquired passphrase and pairs it with `cert_pem`.
    pub fn from_material(
        cert_pem: &[u8],
        material: &SecretMaterial,
        organization: impl Into<String>,
        ttl_days: u32,
    ) -> Result<Self> {
        let cert = X509::from_pem(cert_pem)
            .map_err(|e| Error::KeyMaterial(format!("authority certificate: {e}")))?;
        let key = material.unlock()?;
        Authority::new(cert, key, organization, ttl_days)
    }

    pub fn certificate(&self) -> &X509Ref {
        &self.cert
    }

    pub fn certificate_pem(&self) -> Result<String> {
        Ok(pem_string(self.cert.to_pem()?))
    }

    /// Unencrypted PKCS#8 PEM of the signing key, for the TLS listener.
    pub fn key_pem(&self) -> Result<String> {
        Ok(pem_string(self.key.private_key_to_pem_pkcs8()?))
    }

    /// `CertAuthority` subject CN, which is the address units connect to.
    pub fn common_name(&self) -> Option<String> {
        common_name(&self.cert)
    }

    /// Validates the enrollment body, then signs a fresh keypair for `unit_type`.
    /// Nothing cryptographic happens for a malformed body.
    pub fn issue(&self, unit_type: UnitType, public_ip: &str, body: &[u8]) -> Result<IssuedCertificate> {
        let req = EnrollmentRequest::parse(body)?;
        self.sign(&UnitIdentity::new(unit_type, public_ip, req.private_ip))
    }

    pub fn sign(&self, identity: &UnitIdentity) -> Result<IssuedCertificate> {
        let key = PKey::from_rsa(Rsa::generate(RSA_BITS)?)?;
        let name = identity.subject_name(&self.organization)?;

        let mut builder = X509Builder::new()?;
        builder.set_version(2)?;
        let serial = random_serial()?;
        builder.set_serial_number(&serial)?;
        builder.set_subject_name(&name)?;
        builder.set_issuer_name(self.cert.subject_name())?;
        builder.set_pubkey(&key)?;
        let not_before = Asn1Time::days_from_now(0)?;
        let not_after = Asn1Time::days_from_now(self.ttl_days)?;
        builder.set_not_before(&not_before)?;
        builder.set_not_after(&not_after)?;

        builder.append_extension(BasicConstraints::new().critical().build()?)?;
        builder.append_extension(
            KeyUsage::new().critical().digital_signature().key_encipherment().build()?,
        )?;
        builder.append_extension(ExtendedKeyUsage::new().server_auth().client_auth().build()?)?;

        let ski = SubjectKeyIdentifier::new().build(&builder.x509v3_context(Some(&*self.cert), None))?;
        builder.append_extension(ski)?;
        let aki = AuthorityKeyIdentifier::new()
            .keyid(false)
            .build(&builder.x509v3_context(Some(&*self.cert), None))?;
        builder.append_extension(aki)?;

        let ips = identity.san_ips();
        if !ips.is_empty() {
            let mut san = SubjectAlternativeName::new();
            for ip in &ips {
                san.ip(&ip.to_string());
            }
            let san = san.build(&builder.x509v3_context(Some(&*self.cert), None))?;
            builder.append_extension(san)?;
        }

        builder.sign(&self.key, MessageDigest::sha256())?;
        let cert = builder.build();

        debug!(
            unit = %identity.unit_type,
            public_ip = %identity.public_ip,
            private_ip = %identity.private_ip,
            serial = %serial_hex(&cert),
            "certificate signed"
        );

        Ok(IssuedCertificate {
            certificate_pem: pem_string(cert.to_pem()?),
            key_pem:         pem_string(key.private_key_to_pem_pkcs8()?),
        })
    }
}

/// Self-signed root for a new authority reachable at `address`.
pub fn generate_root(address: &str, organization: &str, days: u32) -> Result<(X509, PKey<Private>)> {
    let key = PKey::from_rsa(Rsa::generate(RSA_BITS)?)?;

    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_text("O", organization)?;
    name.append_entry_by_text("OU", UnitType::CertAuthority.instance_name())?;
    name.append_entry_by_text("CN", address)?;
    let name = name.build();

    let mut builder = X509Builder::new()?;
    builder.set_version(2)?;
    let serial = random_serial()?;
    builder.set_serial_number(&serial)?;
    builder.set_subject_name(&name)?;
    builder.set_issuer_name(&name)?;
    builder.set_pubkey(&key)?;
    let not_before = Asn1Time::days_from_now(0)?;
    let not_after = Asn1Time::days_from_now(days)?;
    builder.set_not_before(&not_before)?;
    builder.set_not_after(&not_after)?;

    // the root doubles as the TLS server certificate, so it needs the server usages too
    builder.append_extension(BasicConstraints::new().critical().ca().build()?)?;
    builder.append_extension(
        KeyUsage::new()
            .critical()
            .key_cert_sign()
            .crl_sign()
            .digital_signature()
            .key_encipherment()
            .build()?,
    )?;
    let ski = SubjectKeyIdentifier::new().build(&builder.x509v3_context(None, None))?;
    builder.append_extension(ski)?;

    let mut san = SubjectAlternativeName::new();
    match address.parse::<IpAddr>() {
        Ok(ip) => san.ip(&ip.to_string()),
        Err(_) => san.dns(address),
    };
    let san = san.build(&builder.x509v3_context(None, None))?;
    builder.append_extension(san)?;

    builder.sign(&key, MessageDigest::sha256())?;
    let cert = builder.build();

    info!(%address, serial = %serial_hex(&cert), days, "authority root generated");
    Ok((cert, key))
}

/// PKCS#8 PEM encrypted with AES-256-CBC under `passphrase`.
pub fn encrypt_key(key: &PKey<Private>, passphrase: &str) -> Result<String> {
    let pem = key.private_key_to_pem_pkcs8_passphrase(Cipher::aes_256_cbc(), passphrase.as_bytes())?;
    Ok(pem_string(pem))
}

pub fn common_name(cert: &X509Ref) -> Option<String> {
    cert.subject_name()
        .entries_by_nid(Nid::COMMONNAME)
        .next()
        .and_then(|e| e.data().as_utf8().ok())
        .map(|s| s.to_string())
}

pub fn serial_hex(cert: &X509Ref) -> String {
    cert.serial_number()
        .to_bn()
        .and_then(|bn| bn.to_hex_str().map(|s| s.to_string()))
        .unwrap_or_default()
}

fn random_serial() -> Result<openssl::asn1::Asn1Integer> {
    let mut bn = BigNum::new()?;
    bn.rand(SERIAL_BITS, MsbOption::MAYBE_ZERO, false)?;
    Ok(bn.to_asn1_integer()?)
}

// openssl only ever emits ASCII PEM
fn pem_string(pem: Vec<u8>) -> String {
    String::from_utf8_lossy(&pem).into_owned()
}
