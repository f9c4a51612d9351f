use serde::{Serialize, Deserialize};

pub use crate::crypto::IssuedCertificate as CertResp;

// what a unit sends; the server only cares that there is exactly one entry
#[derive(Serialize, Deserialize)]
pub struct CertReq {
    pub ip: String,             // private ip of the enrolling unit
}
