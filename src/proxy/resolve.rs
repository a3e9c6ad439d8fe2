use crate::error::ProxyError;
use crate::proxy::context::html_escape;
use crate::settings::ResolverSettings;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use regex::Regex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;

/// DNS seam. The pipeline only needs one address per host; caching and
/// TTL handling live inside the resolver implementation.
pub trait HostResolver: Send + Sync {
    fn resolve<'a>(&'a self, host: &'a str) -> BoxFuture<'a, Result<IpAddr, String>>;
}

/// System-configured hickory resolver.
pub struct DnsResolver {
    inner: hickory_resolver::TokioAsyncResolver,
}

impl DnsResolver {
    pub fn from_system() -> Self {
        let inner = match hickory_resolver::TokioAsyncResolver::tokio_from_system_conf() {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(
                    "resolver: system DNS config unavailable, using defaults, error={}",
                    e
                );
                hickory_resolver::TokioAsyncResolver::tokio(
                    hickory_resolver::config::ResolverConfig::default(),
                    hickory_resolver::config::ResolverOpts::default(),
                )
            }
        };
        Self { inner }
    }
}

impl HostResolver for DnsResolver {
    fn resolve<'a>(&'a self, host: &'a str) -> BoxFuture<'a, Result<IpAddr, String>> {
        async move {
            let lookup = self
                .inner
                .lookup_ip(host)
                .await
                .map_err(|e| e.to_string())?;
            lookup
                .iter()
                .next()
                .ok_or_else(|| "empty answer".to_string())
        }
        .boxed()
    }
}

/// Fixed host→address table. Test double for the DNS seam.
#[derive(Default)]
pub struct StaticResolver {
    map: HashMap<String, IpAddr>,
}

impl StaticResolver {
    pub fn new(entries: &[(&str, &str)]) -> Self {
        Self {
            map: entries
                .iter()
                .map(|(host, addr)| (host.to_string(), addr.parse().expect("valid address")))
                .collect(),
        }
    }
}

impl HostResolver for StaticResolver {
    fn resolve<'a>(&'a self, host: &'a str) -> BoxFuture<'a, Result<IpAddr, String>> {
        let result = self
            .map
            .get(host)
            .copied()
            .ok_or_else(|| format!("no address for {}", host));
        async move { result }.boxed()
    }
}

/// Remove a `:port` suffix, handling bracketed IPv6 literals.
pub fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            return &rest[..end];
        }
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) && !name.contains(':') => {
            name
        }
        _ => host,
    }
}

/// Apply the test→production rewrite. A match with a non-empty first
/// capture yields `<capture>.<apex>`; anything else keeps the original.
pub fn rewrite_host(host: &str, pattern: &str, apex: &str) -> Option<String> {
    let re = cached_rewrite_regex(pattern)?;
    let caps = re.captures(host)?;
    let capture = caps.get(1)?.as_str();
    if capture.is_empty() {
        return None;
    }
    Some(format!("{}.{}", capture, apex))
}

/// The rewrite pattern comes from settings and rarely changes; keep the
/// last compiled form instead of recompiling per request.
fn cached_rewrite_regex(pattern: &str) -> Option<Regex> {
    static CACHE: Mutex<Option<(String, Regex)>> = Mutex::new(None);

    let mut cache = CACHE.lock().unwrap();
    if let Some((cached_src, cached_re)) = cache.as_ref() {
        if cached_src == pattern {
            return Some(cached_re.clone());
        }
    }
    match Regex::new(pattern) {
        Ok(re) => {
            *cache = Some((pattern.to_string(), re.clone()));
            Some(re)
        }
        Err(e) => {
            tracing::warn!(
                "resolver: invalid rewrite pattern, pattern={}, error={}",
                pattern,
                e
            );
            None
        }
    }
}

/// Output of the resolver stage.
#[derive(Debug)]
pub struct Resolution {
    /// Inbound host with the port stripped.
    pub host: String,
    /// Host after the test→production rewrite.
    pub transformed: String,
    pub addr: IpAddr,
}

pub async fn resolve_stage(
    raw_host: &str,
    settings: &ResolverSettings,
    resolver: &dyn HostResolver,
) -> Result<Resolution, ProxyError> {
    let host = if settings.strip_port_from_host() {
        strip_port(raw_host)
    } else {
        raw_host
    };

    let transformed = rewrite_host(
        host,
        &settings.hostname_rewrite_regex(),
        &settings.production_apex(),
    )
    .unwrap_or_else(|| host.to_string());

    let addr = lookup(&transformed, resolver).await?;

    Ok(Resolution {
        host: host.to_string(),
        transformed,
        addr,
    })
}

async fn lookup(host: &str, resolver: &dyn HostResolver) -> Result<IpAddr, ProxyError> {
    // IP literals and localhost skip DNS entirely.
    if let Ok(addr) = host.parse::<IpAddr>() {
        return Ok(addr);
    }
    if host.eq_ignore_ascii_case("localhost") || host.to_ascii_lowercase().ends_with(".localhost") {
        return Ok(IpAddr::V4(std::net::Ipv4Addr::LOCALHOST));
    }

    match resolver.resolve(host).await {
        Ok(addr) => Ok(addr),
        Err(e) => {
            tracing::info!("resolver: lookup failed, host={}, error={}", host, e);
            Err(ProxyError::NotResolvable(html_escape(host)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::Settings;
    use std::collections::HashMap as StdHashMap;

    fn resolver_settings(entries: &[(&str, &str)]) -> ResolverSettings {
        let settings = Settings::from_map(
            entries
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<StdHashMap<_, _>>(),
        );
        ResolverSettings::new(&settings).unwrap()
    }

    #[test]
    fn test_strip_port() {
        assert_eq!(strip_port("www.example.com:8080"), "www.example.com");
        assert_eq!(strip_port("www.example.com"), "www.example.com");
        assert_eq!(strip_port("[::1]:443"), "::1");
        assert_eq!(strip_port("[2001:db8::1]"), "2001:db8::1");
        assert_eq!(strip_port("127.0.0.1:80"), "127.0.0.1");
    }

    #[test]
    fn test_rewrite_host_match() {
        let rewritten = rewrite_host(
            "www.gametest1.example.com",
            r"^(.*)\.(?:game|site)test\d+\.example\.com$",
            "example.com",
        );
        assert_eq!(rewritten.as_deref(), Some("www.example.com"));

        let rewritten = rewrite_host(
            "apis.sitetest3.example.com",
            r"^(.*)\.(?:game|site)test\d+\.example\.com$",
            "example.com",
        );
        assert_eq!(rewritten.as_deref(), Some("apis.example.com"));
    }

    #[test]
    fn test_rewrite_host_no_match_keeps_original() {
        assert_eq!(
            rewrite_host(
                "www.example.com",
                r"^(.*)\.(?:game|site)test\d+\.example\.com$",
                "example.com"
            ),
            None
        );
    }

    #[test]
    fn test_rewrite_host_invalid_pattern() {
        assert_eq!(rewrite_host("www.example.com", "([", "example.com"), None);
    }

    #[tokio::test]
    async fn test_resolve_stage_rewrites_and_resolves() {
        let settings = resolver_settings(&[]);
        let resolver = StaticResolver::new(&[("www.example.com", "93.184.216.34")]);

        let res = resolve_stage("www.gametest1.example.com:443", &settings, &resolver)
            .await
            .unwrap();
        assert_eq!(res.host, "www.gametest1.example.com");
        assert_eq!(res.transformed, "www.example.com");
        assert_eq!(res.addr, "93.184.216.34".parse::<IpAddr>().unwrap());
    }

    #[tokio::test]
    async fn test_resolve_stage_unresolvable_is_503() {
        let settings = resolver_settings(&[]);
        let resolver = StaticResolver::default();

        let err = resolve_stage("nonexistent.example.com", &settings, &resolver)
            .await
            .unwrap_err();
        assert_eq!(err.status(), 503);
        assert!(err.to_string().contains("nonexistent.example.com"));
    }

    #[tokio::test]
    async fn test_localhost_and_literals_skip_dns() {
        let settings = resolver_settings(&[]);
        let resolver = StaticResolver::default();

        let res = resolve_stage("localhost", &settings, &resolver).await.unwrap();
        assert!(res.addr.is_loopback());

        let res = resolve_stage("192.0.2.1", &settings, &resolver).await.unwrap();
        assert_eq!(res.addr, "192.0.2.1".parse::<IpAddr>().unwrap());
    }
}
