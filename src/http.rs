// Shared outbound HTTP client with connection pooling and optional
// proxy support.

use anyhow::{Context, Result};
use reqwest::{Client, Proxy};
use std::time::Duration;

use crate::config::Config;

pub fn build_client(config: &Config) -> Result<Client> {
    let mut builder = Client::builder()
        .pool_max_idle_per_host(config.http_max_connections)
        .connect_timeout(Duration::from_secs(config.http_connect_timeout))
        .timeout(Duration::from_secs(config.http_request_timeout));

    // SOCKS5 wins over HTTP when both are configured
    if let Some(proxy) = &config.socks5_proxy {
        let url = if proxy.contains("://") {
            proxy.clone()
        } else {
            format!("socks5h://{}", proxy)
        };
        tracing::info!("Routing upstream traffic through SOCKS5 proxy");
        builder = builder.proxy(Proxy::all(&url).context("Invalid SOCKS5_PROXY")?);
    } else if let Some(proxy) = &config.http_proxy {
        tracing::info!("Routing upstream traffic through HTTP proxy");
        builder = builder.proxy(Proxy::all(proxy).context("Invalid HTTP_PROXY")?);
    }

    builder.build().context("Failed to build HTTP client")
}
