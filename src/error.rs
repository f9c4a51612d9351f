use crate::network::GatewayRecord;

use thiserror::Error;

/// Failures surfaced by the issuance, bootstrap and renewal paths.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed enrollment payload or role. The caller can fix it and retry.
    #[error("{0}")]
    Validation(String),

    /// The authority's root certificate could not be fetched, parsed or matched.
    #[error("trust bootstrap failed: {0}")]
    TrustBootstrap(String),

    #[error("gateway changed ({stored} => {observed}) and the overwrite was not confirmed")]
    GatewayAmbiguity {
        stored:   GatewayRecord,
        observed: GatewayRecord,
    },

    /// Non-200 answer from the authority during renewal.
    #[error("authority answered {status}: {body}")]
    Remote { status: u16, body: String },

    #[error("key material unavailable: {0}")]
    KeyMaterial(String),

    #[error("network probe failed: {0}")]
    Network(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Crypto(#[from] openssl::error::ErrorStack),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
