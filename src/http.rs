use crate::config::HttpTimeouts;
use reqwest::Client;

/// Shared outbound client. Built once by the composition root and cloned into
/// every provider client.
pub fn build_client(timeouts: &HttpTimeouts) -> Client {
    Client::builder()
        .timeout(timeouts.request)
        .connect_timeout(timeouts.connect)
        .user_agent(concat!("thrift-tryon-api/", env!("CARGO_PKG_VERSION")))
        .build()
        .unwrap_or_else(|_| Client::new())
}
