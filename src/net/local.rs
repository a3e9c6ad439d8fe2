use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::OnceLock;
use tokio::sync::OnceCell;

/// Node identity: hostname, local interface addresses, and the lazily
/// discovered public IPv4.

pub fn node_hostname() -> String {
    static HOSTNAME: OnceLock<String> = OnceLock::new();
    HOSTNAME
        .get_or_init(|| {
            hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown".to_string())
        })
        .clone()
}

/// Local IPv4 of this node. Prefers the pod/host IP env vars set by the
/// deployment, falls back to scanning interfaces for the first address
/// that is neither loopback nor link-local.
pub fn local_ipv4() -> Option<Ipv4Addr> {
    static LOCAL_V4: OnceLock<Option<Ipv4Addr>> = OnceLock::new();
    *LOCAL_V4.get_or_init(|| {
        for var in ["MY_POD_IP", "POD_IP", "HOST_IP"] {
            if let Ok(v) = std::env::var(var) {
                if let Ok(IpAddr::V4(addr)) = v.parse::<IpAddr>() {
                    return Some(addr);
                }
            }
        }

        for iface in pnet_datalink::interfaces() {
            for ip in iface.ips {
                if let ipnetwork::IpNetwork::V4(net) = ip {
                    let addr = net.ip();
                    if !addr.is_loopback() && !addr.is_link_local() {
                        return Some(addr);
                    }
                }
            }
        }
        None
    })
}

/// Local global-scope IPv6 of this node, if any interface carries one.
pub fn local_ipv6() -> Option<Ipv6Addr> {
    static LOCAL_V6: OnceLock<Option<Ipv6Addr>> = OnceLock::new();
    *LOCAL_V6.get_or_init(|| {
        for iface in pnet_datalink::interfaces() {
            for ip in iface.ips {
                if let ipnetwork::IpNetwork::V6(net) = ip {
                    let addr = net.ip();
                    if !addr.is_loopback() && !crate::net::ip::is_link_local(IpAddr::V6(addr)) {
                        return Some(addr);
                    }
                }
            }
        }
        None
    })
}

/// Lazily discovered public IPv4 of this node.
///
/// The fetch happens at most once per process; concurrent first readers
/// race benignly (the discovery request is idempotent). A failed fetch is
/// memoized as `None` so the safety filter degrades to the local-address
/// checks instead of hammering the discovery service per request.
pub struct PublicIp {
    cell: OnceCell<Option<Ipv4Addr>>,
}

impl PublicIp {
    pub fn new() -> Self {
        Self {
            cell: OnceCell::new(),
        }
    }

    pub async fn get(&self, discovery_url: &str) -> Option<Ipv4Addr> {
        *self
            .cell
            .get_or_init(|| async { fetch_public_ipv4(discovery_url).await })
            .await
    }
}

impl Default for PublicIp {
    fn default() -> Self {
        Self::new()
    }
}

async fn fetch_public_ipv4(discovery_url: &str) -> Option<Ipv4Addr> {
    if discovery_url.is_empty() {
        return None;
    }

    let client = match reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(5))
        .build()
    {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!("public_ip: client build failed, error={}", e);
            return None;
        }
    };

    match client.get(discovery_url).send().await {
        Ok(resp) => match resp.text().await {
            Ok(body) => match body.trim().parse::<Ipv4Addr>() {
                Ok(addr) => {
                    tracing::info!("public_ip: discovered, addr={}", addr);
                    Some(addr)
                }
                Err(_) => {
                    tracing::warn!(
                        "public_ip: discovery returned a non-IPv4 body, url={}",
                        discovery_url
                    );
                    None
                }
            },
            Err(e) => {
                tracing::warn!("public_ip: body read failed, error={}", e);
                None
            }
        },
        Err(e) => {
            tracing::warn!(
                "public_ip: discovery failed, url={}, error={}",
                discovery_url,
                e
            );
            None
        }
    }
}
