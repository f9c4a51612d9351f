//! Unit roles and the certificate subject derived from a unit's addresses.

use crate::error::{Error, Result};

use openssl::x509::{X509Name, X509NameBuilder};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{fmt, net::IpAddr, str::FromStr};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitType {
    Bridge,
    Pos,
    #[serde(rename = "cert")]
    CertAuthority,
}

impl UnitType {
    /// Path segment and file stem used for this role (`bridge`, `pos`, `cert`).
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitType::Bridge        => "bridge",
            UnitType::Pos           => "pos",
            UnitType::CertAuthority => "cert",
        }
    }

    /// Organizational unit written into issued subjects.
    pub fn instance_name(&self) -> &'static str {
        match self {
            UnitType::Bridge        => "A BridgeServer Instance",
            UnitType::Pos           => "A PosServer Instance",
            UnitType::CertAuthority => "A CertServer Instance",
        }
    }

    /// Parses a role taken from a request path. Only `bridge` and `pos` can enroll.
    pub fn enrollable(raw: &str) -> Result<Self> {
        match raw.parse()? {
            UnitType::CertAuthority => Err(Error::Validation(
                "the authority role cannot be enrolled".into(),
            )),
            unit => Ok(unit),
        }
    }
}

impl FromStr for UnitType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "bridge" => Ok(UnitType::Bridge),
            "pos"    => Ok(UnitType::Pos),
            "cert"   => Ok(UnitType::CertAuthority),
            other    => Err(Error::Validation(format!("unknown unit type `{other}`"))),
        }
    }
}

impl fmt::Display for UnitType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// INET6_ADDRSTRLEN without the NUL
const MAX_IP_LEN: usize = 45;

/// Accepts anything of address length with the separator count of an
/// IPv4 (3 `.`) or IPv6 (7 `:`) address.
pub fn has_ip_shape(value: &str) -> bool {
    value.len() <= MAX_IP_LEN
        && (value.matches('.').count() == 3 || value.matches(':').count() == 7)
}

fn body_error(detail: impl fmt::Display) -> Error {
    Error::Validation(format!("Json Parse Error: {detail}"))
}

/// Body of `POST /cert_request/{unit}`: a single-entry JSON object holding the private IP.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnrollmentRequest {
    pub private_ip: String,
}

impl EnrollmentRequest {
    /// Validates the raw body. The key name is not significant, only the entry count and value shape.
    pub fn parse(body: &[u8]) -> Result<Self> {
        let map: Map<String, Value> = serde_json::from_slice(body)
            .map_err(|e| body_error(format_args!("body is not a JSON object ({e})")))?;

        if map.len() != 1 {
            return Err(body_error(format_args!(
                "expected exactly one entry, got {}",
                map.len()
            )));
        }

        let private_ip = match map.into_iter().next() {
            Some((_, Value::String(ip))) if has_ip_shape(&ip) => ip,
            _ => return Err(body_error("value is not an IPv4/IPv6 address")),
        };

        Ok(EnrollmentRequest { private_ip })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnitIdentity {
    pub unit_type:  UnitType,
    pub public_ip:  String,
    pub private_ip: String,
}

impl UnitIdentity {
    pub fn new(unit_type: UnitType, public_ip: impl Into<String>, private_ip: impl Into<String>) -> Self {
        UnitIdentity {
            unit_type,
            public_ip:  public_ip.into(),
            private_ip: private_ip.into(),
        }
    }

    /// `O=<org>, OU=<instance>, CN=<private ip>, description=<public ip>`
    pub fn subject_name(&self, organization: &str) -> Result<X509Name> {
        let mut name = X509NameBuilder::new()?;
        name.append_entry_by_text("O", organization)?;
        name.append_entry_by_text("OU", self.unit_type.instance_name())?;
        name.append_entry_by_text("CN", &self.private_ip)?;
        name.append_entry_by_text("description", &self.public_ip)?;
        Ok(name.build())
    }

    /// Addresses that parse as IPs, for the subjectAltName extension.
    pub fn san_ips(&self) -> Vec<IpAddr> {
        let mut ips: Vec<IpAddr> = [&self.private_ip, &self.public_ip]
            .into_iter()
            .filter_map(|s| s.parse().ok())
            .collect();
        ips.dedup();
        ips
    }
}
