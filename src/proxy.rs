//! Proxy endpoint derivation.
//!
//! Ports are a published contract: HTTP/HTTPS listen on `8128 + index` and SOCKS5 on
//! `1080 + index`, where `index` is the country's position in [`PORT_ORDER`]. Countries outside
//! that table all share index 0.

use crate::model::{EndpointStatus, Node, ProxyEndpoint};

pub const HTTP_BASE_PORT: u16 = 8128;
pub const SOCKS5_BASE_PORT: u16 = 1080;
pub const PORT_ORDER: [&str; 4] = ["us", "de", "jp", "ie"];
pub const PROXY_DOMAIN: &str = "rbnk.uk";

fn port_index(country: &str) -> u16 {
    PORT_ORDER
        .iter()
        .position(|code| *code == country)
        .unwrap_or(0) as u16
}

pub fn http_port(country: &str) -> u16 {
    HTTP_BASE_PORT + port_index(country)
}

pub fn socks5_port(country: &str) -> u16 {
    SOCKS5_BASE_PORT + port_index(country)
}

pub fn proxy_host(country: &str) -> String {
    format!("proxy-{}.{}", country, PROXY_DOMAIN)
}

/// One endpoint per country; only a running node makes an endpoint active.
pub fn derive_endpoints(nodes: &[Node], countries: &[String]) -> Vec<ProxyEndpoint> {
    countries
        .iter()
        .map(|country| {
            let backing = nodes
                .iter()
                .find(|node| &node.country == country && node.is_running());
            let host = proxy_host(country);
            let http = format!("http://{}:{}", host, http_port(country));
            ProxyEndpoint {
                country: country.clone(),
                https_proxy: http.clone(),
                http_proxy: http,
                socks5_proxy: format!("socks5://{}:{}", host, socks5_port(country)),
                node_id: backing.map(|node| node.id.clone()),
                status: if backing.is_some() {
                    EndpointStatus::Active
                } else {
                    EndpointStatus::Inactive
                },
            }
        })
        .collect()
}

impl ProxyEndpoint {
    pub fn is_active(&self) -> bool {
        self.status == EndpointStatus::Active
    }

    /// Plain-text usage snippet for copy/paste.
    pub fn usage(&self) -> String {
        let socks = self
            .socks5_proxy
            .strip_prefix("socks5://")
            .unwrap_or(&self.socks5_proxy);
        format!(
            "# HTTP proxy\ncurl -x {http} https://httpbin.org/ip\n\n\
             # SOCKS5 proxy\ncurl --socks5 {socks} https://httpbin.org/ip\n\n\
             # Environment\nexport HTTP_PROXY={http}\nexport HTTPS_PROXY={https}\n",
            http = self.http_proxy,
            https = self.https_proxy,
            socks = socks,
        )
    }
}
