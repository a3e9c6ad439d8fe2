use crate::error::ProxyError;
use crate::proxy::context::{full_body, html_escape, BoxBody, RequestContext};
use crate::rules::CorsRule;
use crate::settings::ForwarderSettings;
use bytes::Bytes;
use http::header::{
    HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, DATE, HOST, LOCATION, ORIGIN, REFERER,
    SERVER, SET_COOKIE, TRANSFER_ENCODING, VARY,
};
use http::{HeaderMap, Request, Response};
use http_body_util::BodyExt;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// A rustls `ServerCertVerifier` that accepts any certificate without
/// validation. Used when upstream TLS verification is disabled; the
/// production fleet fronts its own certificates and the proxy dials it
/// by rewritten hostname.
#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Builds upstream requests, relays responses, and owns the response
/// transformation chain. One shared HTTP client for the whole process;
/// redirects are never followed (the client has no redirect policy),
/// so `location` headers reach the rewrite step untouched.
pub struct Forwarder {
    settings: ForwarderSettings,
    client: Client<HttpsConnector<HttpConnector>, BoxBody>,
}

impl Forwarder {
    pub fn new(settings: ForwarderSettings) -> Self {
        let client = build_upstream_client(settings.upstream_tls_verify());
        Self { settings, client }
    }

    /// Forward the request and relay the transformed response. Upstream
    /// statuses in [400, ∞) take the error branch: same transformations,
    /// relayed as-is, logged as upstream errors.
    pub async fn forward(
        &self,
        ctx: &mut RequestContext,
        req_headers: &HeaderMap,
        body: BoxBody,
        upstream_path: &str,
        cors: Option<&CorsRule>,
    ) -> Result<Response<BoxBody>, ProxyError> {
        let max_body = self.settings.max_body_bytes();

        // Early reject on declared length, then enforce on the buffered
        // bytes (catches chunked bodies without a content-length).
        if let Some(declared) = req_headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
        {
            if declared > max_body {
                return Err(ProxyError::BadRequest("request body too large".into()));
            }
        }

        let body_bytes = body
            .collect()
            .await
            .map_err(|e| ProxyError::Internal(format!("request body read failed: {}", e)))?
            .to_bytes();
        if body_bytes.len() as u64 > max_body {
            return Err(ProxyError::BadRequest("request body too large".into()));
        }

        let upstream_url = format!(
            "{}://{}:{}{}",
            ctx.scheme, ctx.transformed_host, ctx.port, upstream_path
        );

        let headers = build_upstream_headers(req_headers, ctx);
        let origin = req_headers
            .get(ORIGIN)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let mut builder = Request::builder()
            .method(ctx.method.as_str())
            .uri(&upstream_url);
        for (name, value) in &headers {
            builder = builder.header(name, value);
        }
        let upstream_req = builder
            .body(full_body(body_bytes))
            .map_err(|e| ProxyError::Internal(format!("upstream request build failed: {}", e)))?;

        let timeout = Duration::from_millis(self.settings.upstream_timeout_ms());
        let upstream_start = Instant::now();
        ctx.upstream_start = Some(upstream_start);

        let result = tokio::time::timeout(timeout, async {
            let resp = self.client.request(upstream_req).await.map_err(|e| {
                // The error text can echo the (client-chosen) hostname.
                ProxyError::Internal(html_escape(&format!("upstream request failed: {}", e)))
            })?;
            let (parts, body) = resp.into_parts();
            let collected = body
                .collect()
                .await
                .map_err(|e| ProxyError::Internal(format!("upstream body read failed: {}", e)))?;
            Ok::<_, ProxyError>((parts, collected.to_bytes()))
        })
        .await;

        let elapsed_ms = upstream_start.elapsed().as_millis();

        let (parts, resp_body) = match result {
            Ok(Ok(v)) => v,
            Ok(Err(e)) => {
                warn!(
                    "forward: upstream error, upstream={}, error={}",
                    upstream_url, e
                );
                metrics::counter!(
                    "proxy_upstream_requests_total",
                    "result" => "error",
                )
                .increment(1);
                return Err(e);
            }
            Err(_) => {
                warn!(
                    "forward: upstream timeout, upstream={}, elapsed_ms={}",
                    upstream_url, elapsed_ms
                );
                metrics::counter!(
                    "proxy_upstream_requests_total",
                    "result" => "timeout",
                )
                .increment(1);
                return Err(ProxyError::GatewayTimeout {
                    upstream: html_escape(&upstream_url),
                    elapsed_ms,
                });
            }
        };

        if parts.status.as_u16() >= 400 {
            debug!(
                "forward: upstream error status relayed, upstream={}, status={}",
                upstream_url,
                parts.status.as_u16()
            );
            metrics::counter!(
                "proxy_upstream_requests_total",
                "result" => "upstream_error",
            )
            .increment(1);
        } else {
            metrics::counter!(
                "proxy_upstream_requests_total",
                "result" => "success",
            )
            .increment(1);
        }

        Ok(transform_upstream_response(
            parts,
            resp_body,
            ctx,
            cors,
            origin.as_deref(),
            elapsed_ms,
        ))
    }
}

/// Inbound headers pass through with the forwarding overrides applied
/// and hop-by-hop headers removed.
pub fn build_upstream_headers(req_headers: &HeaderMap, ctx: &RequestContext) -> HeaderMap {
    let mut headers = req_headers.clone();
    remove_hop_headers(&mut headers);

    set_str(&mut headers, "x-forwarded-for", &ctx.client_ip.to_string());
    set_str(&mut headers, "x-forwarded-host", &ctx.host);
    set_str(&mut headers, "x-forwarded-proto", &ctx.scheme);
    if let Ok(v) = HeaderValue::from_str(&ctx.transformed_host) {
        headers.insert(HOST, v);
    }

    for name in [ORIGIN, REFERER] {
        if let Some(value) = headers.get(&name).and_then(|v| v.to_str().ok()) {
            let rewritten = value.replacen(&ctx.host, &ctx.transformed_host, 1);
            if let Ok(v) = HeaderValue::from_str(&rewritten) {
                headers.insert(name, v);
            }
        }
    }

    headers
}

/// The transformation chain applied to every upstream response, success
/// and error branch alike.
pub fn transform_upstream_response(
    parts: http::response::Parts,
    body: Bytes,
    ctx: &RequestContext,
    cors: Option<&CorsRule>,
    origin: Option<&str>,
    elapsed_ms: u128,
) -> Response<BoxBody> {
    let mut headers = parts.headers;

    // 1. Point redirects back at the hostname the client asked for.
    if let Some(location) = headers.get(LOCATION).and_then(|v| v.to_str().ok()) {
        if let Some(rewritten) = rewrite_location(location, &ctx.transformed_host, &ctx.host) {
            if let Ok(v) = HeaderValue::from_str(&rewritten) {
                headers.insert(LOCATION, v);
            }
        }
    }

    // 2. CORS response rewriting.
    if let (Some(rule), Some(origin)) = (cors, origin) {
        let applies = rule.origin_allowed(origin)
            || (!rule.has_allowed_origins() && rule.allow_request_origin_if_no_allowed_origins);
        if applies {
            apply_cors_headers(&mut headers, rule, origin);
        }
    }

    // 3. Cookie domains move back to the inbound base host.
    let upstream_base = base_host(&ctx.transformed_host).to_string();
    let inbound_base = base_host(&ctx.host).to_string();
    let cookies: Vec<String> = headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .map(|v| rewrite_cookie_domain(v, &upstream_base, &inbound_base))
        .collect();
    if !cookies.is_empty() {
        headers.remove(SET_COOKIE);
        for cookie in cookies {
            if let Ok(v) = HeaderValue::from_str(&cookie) {
                headers.append(SET_COOKIE, v);
            }
        }
    }

    // 4. Transport headers the proxy owns.
    for name in [SERVER, DATE, CONNECTION, TRANSFER_ENCODING] {
        headers.remove(name);
    }
    headers.remove(HeaderName::from_static("x-powered-by"));

    // 5. Downstream timing.
    set_str(&mut headers, "x-downstream-timing", &format!("{}ms", elapsed_ms));

    // 6. Decoded body length.
    let body = strip_utf8_bom(body);
    if let Ok(v) = HeaderValue::from_str(&body.len().to_string()) {
        headers.insert(CONTENT_LENGTH, v);
    }

    let mut resp = Response::builder().status(parts.status);
    if let Some(h) = resp.headers_mut() {
        *h = headers;
    }
    resp.body(full_body(body)).unwrap()
}

fn apply_cors_headers(headers: &mut HeaderMap, rule: &CorsRule, origin: &str) {
    if rule.allow_response_headers_overwrite {
        let upstream_cors: Vec<HeaderName> = headers
            .keys()
            .filter(|name| name.as_str().starts_with("access-control-"))
            .cloned()
            .collect();
        for name in upstream_cors {
            headers.remove(name);
        }
    }

    set_str(headers, "access-control-allow-origin", origin);
    if rule.allow_credentials {
        set_str(headers, "access-control-allow-credentials", "true");
    }
    if !rule.allowed_methods.is_empty() {
        set_str(
            headers,
            "access-control-allow-methods",
            &rule.allowed_methods.join(", "),
        );
    }
    if !rule.allowed_headers.is_empty() {
        set_str(
            headers,
            "access-control-allow-headers",
            &rule.allowed_headers.join(", "),
        );
    }
    if !rule.exposed_headers.is_empty() {
        set_str(
            headers,
            "access-control-expose-headers",
            &rule.exposed_headers.join(", "),
        );
    }
    if let Some(max_age) = rule.max_age {
        set_str(headers, "access-control-max-age", &max_age.to_string());
    }
    headers.insert(VARY, HeaderValue::from_static("origin"));
}

/// Last two labels of a hostname, the base domain used for cookie
/// rewriting.
pub fn base_host(host: &str) -> &str {
    match host.rmatch_indices('.').nth(1) {
        Some((idx, _)) => &host[idx + 1..],
        None => host,
    }
}

/// Rewrite the `domain` attribute of one `set-cookie` value, replacing
/// the upstream base host with the inbound base host. A leading dot
/// survives because only the base substring is replaced. Idempotent:
/// once rewritten, the upstream base no longer occurs.
pub fn rewrite_cookie_domain(set_cookie: &str, upstream_base: &str, inbound_base: &str) -> String {
    set_cookie
        .split(';')
        .map(|part| {
            let trimmed = part.trim_start();
            let lead = &part[..part.len() - trimmed.len()];
            if let Some(value) = strip_prefix_ignore_case(trimmed, "domain=") {
                if value.contains(upstream_base) {
                    let domain = value.replacen(upstream_base, inbound_base, 1);
                    return format!("{}domain={}", lead, domain);
                }
            }
            part.to_string()
        })
        .collect::<Vec<_>>()
        .join(";")
}

/// Substitute the inbound host back into an absolute `location` that
/// points at the rewritten host.
pub fn rewrite_location(value: &str, transformed_host: &str, original_host: &str) -> Option<String> {
    for scheme in ["http://", "https://"] {
        if let Some(rest) = value.strip_prefix(scheme) {
            if let Some(after) = rest.strip_prefix(transformed_host) {
                if after.is_empty() || after.starts_with(['/', ':', '?', '#']) {
                    return Some(format!("{}{}{}", scheme, original_host, after));
                }
            }
        }
    }
    None
}

pub fn strip_utf8_bom(body: Bytes) -> Bytes {
    if body.starts_with(&[0xEF, 0xBB, 0xBF]) {
        body.slice(3..)
    } else {
        body
    }
}

fn strip_prefix_ignore_case<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    if s.len() >= prefix.len() && s[..prefix.len()].eq_ignore_ascii_case(prefix) {
        Some(&s[prefix.len()..])
    } else {
        None
    }
}

fn set_str(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(v) = HeaderValue::from_str(value) {
        headers.insert(HeaderName::from_static(name), v);
    }
}

fn remove_hop_headers(headers: &mut HeaderMap) {
    let hop_headers: &[HeaderName] = &[
        CONNECTION,
        HeaderName::from_static("keep-alive"),
        HeaderName::from_static("proxy-authenticate"),
        HeaderName::from_static("proxy-authorization"),
        HeaderName::from_static("te"),
        HeaderName::from_static("trailers"),
        TRANSFER_ENCODING,
        HeaderName::from_static("upgrade"),
    ];

    for h in hop_headers {
        headers.remove(h);
    }
}

/// One process-wide hyper client for both `http://` and `https://`
/// upstreams. TLS via rustls (ring), ALPN picks h2 when offered; with
/// verification off, a permissive verifier stands in.
fn build_upstream_client(tls_verify: bool) -> Client<HttpsConnector<HttpConnector>, BoxBody> {
    let mut http = HttpConnector::new();
    http.set_nodelay(true);
    http.set_connect_timeout(Some(Duration::from_secs(10)));
    http.enforce_http(false);

    let https = if tls_verify {
        hyper_rustls::HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(http)
    } else {
        let tls_config = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier))
            .with_no_client_auth();

        hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(http)
    };

    Client::builder(TokioExecutor::new())
        .pool_idle_timeout(Duration::from_secs(30))
        .build(https)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    fn ctx() -> RequestContext {
        let mut ctx = RequestContext::new(
            "203.0.113.9".parse::<IpAddr>().unwrap(),
            "https".to_string(),
            443,
            "GET".to_string(),
            "/x".to_string(),
        );
        ctx.host = "www.gametest1.example.com".to_string();
        ctx.transformed_host = "www.example.com".to_string();
        ctx
    }

    #[test]
    fn test_base_host() {
        assert_eq!(base_host("www.gametest1.example.com"), "example.com");
        assert_eq!(base_host("www.example.com"), "example.com");
        assert_eq!(base_host("example.com"), "example.com");
        assert_eq!(base_host("localhost"), "localhost");
    }

    #[test]
    fn test_upstream_headers_overrides() {
        let mut inbound = HeaderMap::new();
        inbound.insert(HOST, "www.gametest1.example.com".parse().unwrap());
        inbound.insert(ORIGIN, "https://www.gametest1.example.com".parse().unwrap());
        inbound.insert(REFERER, "https://www.gametest1.example.com/page".parse().unwrap());
        inbound.insert(CONNECTION, "keep-alive".parse().unwrap());
        inbound.insert("x-custom", "preserved".parse().unwrap());

        let headers = build_upstream_headers(&inbound, &ctx());

        assert_eq!(headers.get("x-forwarded-for").unwrap(), "203.0.113.9");
        assert_eq!(
            headers.get("x-forwarded-host").unwrap(),
            "www.gametest1.example.com"
        );
        assert_eq!(headers.get("x-forwarded-proto").unwrap(), "https");
        assert_eq!(headers.get(HOST).unwrap(), "www.example.com");
        assert_eq!(headers.get(ORIGIN).unwrap(), "https://www.example.com");
        assert_eq!(
            headers.get(REFERER).unwrap(),
            "https://www.example.com/page"
        );
        assert_eq!(headers.get("x-custom").unwrap(), "preserved");
        assert!(!headers.contains_key(CONNECTION));
    }

    #[test]
    fn test_rewrite_location() {
        assert_eq!(
            rewrite_location(
                "https://www.example.com/login",
                "www.example.com",
                "www.gametest1.example.com"
            )
            .as_deref(),
            Some("https://www.gametest1.example.com/login")
        );
        // Host boundary respected, no substring surprises.
        assert_eq!(
            rewrite_location(
                "https://www.example.community/x",
                "www.example.com",
                "www.gametest1.example.com"
            ),
            None
        );
        assert_eq!(
            rewrite_location("/relative/path", "www.example.com", "inbound"),
            None
        );
    }

    #[test]
    fn test_cookie_domain_rewrite() {
        let rewritten = rewrite_cookie_domain("id=abc; Domain=.example.com", "example.com", "example.com");
        assert_eq!(rewritten, "id=abc; domain=.example.com");

        let rewritten =
            rewrite_cookie_domain("sid=1; Path=/; Domain=.prod.net; Secure", "prod.net", "test.org");
        assert_eq!(rewritten, "sid=1; Path=/; domain=.test.org; Secure");
    }

    #[test]
    fn test_cookie_domain_rewrite_idempotent() {
        let once = rewrite_cookie_domain("sid=1; Domain=.prod.net", "prod.net", "test.org");
        let twice = rewrite_cookie_domain(&once, "prod.net", "test.org");
        assert_eq!(once, twice);
    }

    #[test]
    fn test_cookie_without_domain_untouched() {
        let value = "sid=1; Path=/; HttpOnly";
        assert_eq!(rewrite_cookie_domain(value, "prod.net", "test.org"), value);
    }

    #[test]
    fn test_strip_utf8_bom() {
        let with_bom = Bytes::from_static(&[0xEF, 0xBB, 0xBF, b'o', b'k']);
        assert_eq!(strip_utf8_bom(with_bom), Bytes::from_static(b"ok"));
        let without = Bytes::from_static(b"ok");
        assert_eq!(strip_utf8_bom(without), Bytes::from_static(b"ok"));
    }

    #[test]
    fn test_transform_strips_transport_headers_and_stamps_timing() {
        let resp = Response::builder()
            .status(200)
            .header(SERVER, "origin-server")
            .header(DATE, "Mon, 01 Jan 2024 00:00:00 GMT")
            .header(CONNECTION, "keep-alive")
            .header("x-powered-by", "php")
            .header("content-type", "text/plain")
            .body(())
            .unwrap();
        let (parts, _) = resp.into_parts();

        let out = transform_upstream_response(
            parts,
            Bytes::from_static(b"ok"),
            &ctx(),
            None,
            None,
            12,
        );

        assert_eq!(out.status(), 200);
        let headers = out.headers();
        assert!(!headers.contains_key(SERVER));
        assert!(!headers.contains_key(DATE));
        assert!(!headers.contains_key(CONNECTION));
        assert!(!headers.contains_key("x-powered-by"));
        assert_eq!(headers.get("x-downstream-timing").unwrap(), "12ms");
        assert_eq!(headers.get(CONTENT_LENGTH).unwrap(), "2");
        assert_eq!(headers.get("content-type").unwrap(), "text/plain");
    }

    #[test]
    fn test_transform_rewrites_set_cookie() {
        let resp = Response::builder()
            .status(200)
            .header(SET_COOKIE, "id=abc; Domain=.example.com")
            .body(())
            .unwrap();
        let (parts, _) = resp.into_parts();

        let out = transform_upstream_response(
            parts,
            Bytes::from_static(b""),
            &ctx(),
            None,
            None,
            1,
        );
        assert_eq!(
            out.headers().get(SET_COOKIE).unwrap(),
            "id=abc; domain=.example.com"
        );
    }

    #[test]
    fn test_transform_applies_cors() {
        let yaml = r#"
- allowed_origins: ['^https://portal\.example\.com$']
  allowed_methods: [GET, POST]
  exposed_headers: [x-request-id]
  max_age: 600
  allow_credentials: true
  allow_response_headers_overwrite: true
"#;
        let set = crate::rules::CorsRuleSet::load(yaml, std::path::Path::new("cors.yaml")).unwrap();
        let rule = set.find("/x", "www.gametest1.example.com").unwrap();

        let resp = Response::builder()
            .status(200)
            .header("access-control-allow-origin", "*")
            .body(())
            .unwrap();
        let (parts, _) = resp.into_parts();

        let out = transform_upstream_response(
            parts,
            Bytes::new(),
            &ctx(),
            Some(rule),
            Some("https://portal.example.com"),
            1,
        );

        let headers = out.headers();
        assert_eq!(
            headers.get("access-control-allow-origin").unwrap(),
            "https://portal.example.com"
        );
        assert_eq!(headers.get("access-control-allow-credentials").unwrap(), "true");
        assert_eq!(headers.get("access-control-allow-methods").unwrap(), "GET, POST");
        assert_eq!(headers.get("access-control-expose-headers").unwrap(), "x-request-id");
        assert_eq!(headers.get("access-control-max-age").unwrap(), "600");
        assert_eq!(headers.get(VARY).unwrap(), "origin");
    }

    #[test]
    fn test_transform_cors_skipped_for_disallowed_origin() {
        let yaml = r#"
- allowed_origins: ['^https://portal\.example\.com$']
"#;
        let set = crate::rules::CorsRuleSet::load(yaml, std::path::Path::new("cors.yaml")).unwrap();
        let rule = set.find("/x", "www.gametest1.example.com").unwrap();

        let resp = Response::builder().status(200).body(()).unwrap();
        let (parts, _) = resp.into_parts();

        let out = transform_upstream_response(
            parts,
            Bytes::new(),
            &ctx(),
            Some(rule),
            Some("https://evil.example.net"),
            1,
        );
        assert!(!out.headers().contains_key("access-control-allow-origin"));
    }
}
