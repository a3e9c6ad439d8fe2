use crate::net::CidrSet;
use crate::settings::EnvelopeSettings;
use http::header::HOST;
use http::HeaderMap;
use std::net::{IpAddr, SocketAddr};

/// Transport-level request fields after envelope normalization.
///
/// Header names are lowercase by construction (`http::HeaderMap` stores
/// canonical lowercase names), so normalization here is limited to
/// reassigning the transport fields from forwarding headers when the
/// direct peer is a trusted reverse proxy.
#[derive(Debug, PartialEq, Eq)]
pub struct Envelope {
    pub client_ip: IpAddr,
    /// Host header (or forwarded-host), without further processing.
    pub host: Option<String>,
    pub scheme: String,
    pub port: u16,
}

/// Normalize the request transport fields.
///
/// `listener_scheme` / `listener_port` are the defaults from the socket
/// the request arrived on; each reassignment from a forwarding header is
/// gated by its own flag and only honored when the peer is trusted.
pub fn normalize(
    headers: &HeaderMap,
    peer: SocketAddr,
    listener_scheme: &str,
    listener_port: u16,
    settings: &EnvelopeSettings,
) -> Envelope {
    let mut envelope = Envelope {
        client_ip: peer.ip(),
        host: header_str(headers, HOST.as_str()),
        scheme: listener_scheme.to_string(),
        port: listener_port,
    };

    let trusted = CidrSet::parse(
        &settings.trusted_proxy_cidrs_v4(),
        &settings.trusted_proxy_cidrs_v6(),
    );
    if !trusted.contains(peer.ip()) {
        return envelope;
    }

    if settings.rewrite_client_ip() {
        if let Some(ip) = forwarded_client_ip(headers, peer.ip(), settings) {
            envelope.client_ip = ip;
        }
    }

    if settings.rewrite_host() {
        if let Some(host) = header_str(headers, &settings.forwarded_host_header()) {
            envelope.host = Some(host);
        }
    }

    if settings.rewrite_scheme() {
        if let Some(proto) = header_str(headers, &settings.forwarded_proto_header()) {
            envelope.scheme = proto.to_ascii_lowercase();
        }
    }

    if settings.rewrite_port() {
        if let Some(port) = header_str(headers, &settings.forwarded_port_header())
            .and_then(|v| v.trim().parse::<u16>().ok())
        {
            envelope.port = port;
        }
    }

    envelope
}

/// The forwarded client address: the Cloudflare header when Cloudflare
/// support is on and the peer is a Cloudflare edge, otherwise the first
/// token of the configured forwarding header.
fn forwarded_client_ip(
    headers: &HeaderMap,
    peer_ip: IpAddr,
    settings: &EnvelopeSettings,
) -> Option<IpAddr> {
    if settings.cloudflare_aware() {
        let cloudflare = CidrSet::parse(&settings.cloudflare_cidrs_v4(), &[]);
        if cloudflare.contains(peer_ip) {
            if let Some(ip) = header_str(headers, &settings.cloudflare_for_header())
                .and_then(|v| v.trim().parse::<IpAddr>().ok())
            {
                return Some(ip);
            }
        }
    }

    header_str(headers, &settings.forwarded_for_header())
        .and_then(|v| v.split(',').next().map(|s| s.trim().to_string()))
        .and_then(|s| s.parse::<IpAddr>().ok())
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::Settings;
    use std::collections::HashMap;

    fn envelope_settings(entries: &[(&str, &str)]) -> EnvelopeSettings {
        let settings = Settings::from_map(
            entries
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<HashMap<_, _>>(),
        );
        EnvelopeSettings::new(&settings).unwrap()
    }

    fn headers(entries: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in entries {
            map.insert(
                http::header::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                value.parse().unwrap(),
            );
        }
        map
    }

    #[test]
    fn test_untrusted_peer_keeps_transport_defaults() {
        let settings = envelope_settings(&[("TRUSTED_PROXY_CIDRS_V4", "198.51.100.0/24")]);
        let hdrs = headers(&[
            ("host", "www.gametest1.example.com"),
            ("x-forwarded-for", "203.0.113.50"),
            ("x-forwarded-proto", "https"),
        ]);

        let env = normalize(
            &hdrs,
            "192.0.2.10:55000".parse().unwrap(),
            "http",
            80,
            &settings,
        );
        assert_eq!(env.client_ip, "192.0.2.10".parse::<IpAddr>().unwrap());
        assert_eq!(env.scheme, "http");
        assert_eq!(env.port, 80);
        assert_eq!(env.host.as_deref(), Some("www.gametest1.example.com"));
    }

    #[test]
    fn test_trusted_peer_honors_forwarding_headers() {
        let settings = envelope_settings(&[("TRUSTED_PROXY_CIDRS_V4", "198.51.100.0/24")]);
        let hdrs = headers(&[
            ("host", "internal-lb"),
            ("x-forwarded-for", "203.0.113.50, 198.51.100.1"),
            ("x-forwarded-host", "www.gametest1.example.com"),
            ("x-forwarded-proto", "HTTPS"),
            ("x-forwarded-port", "8443"),
        ]);

        let env = normalize(
            &hdrs,
            "198.51.100.7:55000".parse().unwrap(),
            "http",
            80,
            &settings,
        );
        assert_eq!(env.client_ip, "203.0.113.50".parse::<IpAddr>().unwrap());
        assert_eq!(env.host.as_deref(), Some("www.gametest1.example.com"));
        assert_eq!(env.scheme, "https");
        assert_eq!(env.port, 8443);
    }

    #[test]
    fn test_missing_forwarded_port_keeps_listener_port() {
        let settings = envelope_settings(&[("TRUSTED_PROXY_CIDRS_V4", "198.51.100.0/24")]);
        let hdrs = headers(&[("host", "a"), ("x-forwarded-for", "203.0.113.50")]);

        let env = normalize(
            &hdrs,
            "198.51.100.7:55000".parse().unwrap(),
            "https",
            443,
            &settings,
        );
        assert_eq!(env.port, 443);
        assert_eq!(env.scheme, "https");
    }

    #[test]
    fn test_per_field_flags_gate_reassignment() {
        let settings = envelope_settings(&[
            ("TRUSTED_PROXY_CIDRS_V4", "198.51.100.0/24"),
            ("REWRITE_HOST", "false"),
            ("REWRITE_PORT", "false"),
        ]);
        let hdrs = headers(&[
            ("host", "direct-host"),
            ("x-forwarded-for", "203.0.113.50"),
            ("x-forwarded-host", "forwarded-host"),
            ("x-forwarded-port", "9443"),
        ]);

        let env = normalize(
            &hdrs,
            "198.51.100.7:55000".parse().unwrap(),
            "http",
            80,
            &settings,
        );
        assert_eq!(env.client_ip, "203.0.113.50".parse::<IpAddr>().unwrap());
        assert_eq!(env.host.as_deref(), Some("direct-host"));
        assert_eq!(env.port, 80);
    }

    #[test]
    fn test_cloudflare_header_consulted_first() {
        let settings = envelope_settings(&[
            ("TRUSTED_PROXY_CIDRS_V4", "198.51.100.0/24"),
            ("CLOUDFLARE_AWARE", "true"),
            ("CLOUDFLARE_CIDRS_V4", "198.51.100.0/24"),
        ]);
        let hdrs = headers(&[
            ("host", "a"),
            ("cf-connecting-ip", "203.0.113.77"),
            ("x-forwarded-for", "203.0.113.50"),
        ]);

        let env = normalize(
            &hdrs,
            "198.51.100.7:55000".parse().unwrap(),
            "http",
            80,
            &settings,
        );
        assert_eq!(env.client_ip, "203.0.113.77".parse::<IpAddr>().unwrap());
    }
}
