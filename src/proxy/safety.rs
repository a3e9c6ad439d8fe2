use crate::error::ProxyError;
use crate::net::ip;
use crate::net::local::{local_ipv4, local_ipv6, PublicIp};
use crate::proxy::context::html_escape;
use crate::settings::SafetySettings;
use std::net::IpAddr;

/// Reject upstream targets the proxy must never dial: loopback, the
/// node itself (local or public address), and, when LAN access is
/// denied, the private/unique-local ranges. Both the pre-resolution
/// host (when it is an address literal) and the resolved address are
/// checked, so a hostname resolving into the LAN is caught the same as
/// a raw literal.
pub async fn check(
    host: &str,
    resolved: IpAddr,
    client_ip: IpAddr,
    settings: &SafetySettings,
    public_ip: &PublicIp,
) -> Result<(), ProxyError> {
    let mut targets: Vec<IpAddr> = vec![resolved];
    if let Ok(literal) = host.parse::<IpAddr>() {
        if literal != resolved {
            targets.push(literal);
        }
    }

    let public = public_ip.get(&settings.public_ip_discovery_url()).await;
    let lan_denied = settings.hate_lan_access();

    for addr in targets {
        if ip::is_loopback(addr) {
            return Err(reject("Loopback detected from upstream client", client_ip, host, addr));
        }

        let is_self = match addr {
            IpAddr::V4(v4) => Some(v4) == local_ipv4() || Some(v4) == public,
            IpAddr::V6(v6) => Some(v6) == local_ipv6(),
        };
        if is_self {
            return Err(reject("Proxy node address detected from upstream client", client_ip, host, addr));
        }

        if ip::is_link_local(addr) {
            return Err(reject("Link-local address detected from upstream client", client_ip, host, addr));
        }

        if lan_denied && ip::is_lan(addr) {
            return Err(reject("LAN access denied from upstream client", client_ip, host, addr));
        }
    }

    Ok(())
}

fn reject(reason: &str, client_ip: IpAddr, host: &str, addr: IpAddr) -> ProxyError {
    metrics::counter!("proxy_safety_rejected_total").increment(1);
    tracing::info!(
        "safety: upstream rejected, reason={}, client_ip={}, host={}, addr={}",
        reason,
        client_ip,
        host,
        addr
    );
    ProxyError::Forbidden(format!(
        "{} {} to resolved upstream {} ({})",
        reason,
        html_escape(&client_ip.to_string()),
        html_escape(host),
        html_escape(&addr.to_string()),
    ))
}
