use crate::handlers::client_ip::ClientIp;

// liveness probe
pub async fn index_handler(ClientIp(ip): ClientIp) -> String {
    format!("Hello, {ip}!")
}
