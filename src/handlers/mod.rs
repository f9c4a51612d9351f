pub mod error;
pub mod client_ip;

pub mod cert_request {
    pub mod models;
    mod src;
    pub use src::cert_request_handler;
}

pub mod index {
    mod src;
    pub use src::index_handler;
}
