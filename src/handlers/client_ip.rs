use crate::{handlers::error::ApiError, utils::forwarded_ip};

use axum::{
    extract::{ConnectInfo, FromRequestParts},
    http::request::Parts,
};
use std::net::SocketAddr;

/// Apparent caller address: forwarding headers first, then the TCP peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientIp(pub String);

impl<S: Send + Sync> FromRequestParts<S> for ClientIp {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        if let Some(ip) = forwarded_ip(&parts.headers) {
            return Ok(ClientIp(ip));
        }
        // also resolves MockConnectInfo in tests
        let ConnectInfo(addr) = ConnectInfo::<SocketAddr>::from_request_parts(parts, state)
            .await
            .map_err(|e| ApiError::Internal(format!("peer address unavailable: {e}")))?;
        Ok(ClientIp(addr.ip().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::connect_info::MockConnectInfo, http::Request};

    async fn extract(req: Request<()>) -> Result<ClientIp, ApiError> {
        let (mut parts, _) = req.into_parts();
        ClientIp::from_request_parts(&mut parts, &()).await
    }

    #[tokio::test]
    async fn real_connect_info_is_used() {
        let mut req = Request::new(());
        req.extensions_mut().insert(ConnectInfo(SocketAddr::from(([192, 0, 2, 7], 5000))));
        assert_eq!(extract(req).await.unwrap(), ClientIp("192.0.2.7".into()));
    }

    #[tokio::test]
    async fn mock_connect_info_is_used() {
        let mut req = Request::new(());
        req.extensions_mut().insert(MockConnectInfo(SocketAddr::from(([203, 0, 113, 5], 40123))));
        assert_eq!(extract(req).await.unwrap(), ClientIp("203.0.113.5".into()));
    }

    #[tokio::test]
    async fn missing_peer_is_an_internal_error() {
        assert!(matches!(extract(Request::new(())).await, Err(ApiError::Internal(_))));
    }
}
