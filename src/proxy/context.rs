use crate::error::ProxyError;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Instant;

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

pub fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn empty_body() -> BoxBody {
    Full::new(Bytes::new())
        .map_err(|never| match never {})
        .boxed()
}

/// Escape a value before interpolating it into an HTML error body.
pub fn html_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Per-request context that flows through the pipeline stages.
///
/// Exclusively owned by the request task; the bag is cleared by the
/// response finalizer when the response is handed back to the server.
pub struct RequestContext {
    /// Downstream client IP: TCP peer, or the forwarded address when the
    /// peer is a trusted reverse proxy.
    pub client_ip: IpAddr,
    /// Inbound host after envelope normalization, before rewriting.
    pub host: String,
    /// Host after the test→production rewrite. Equal to `host` when no
    /// rewrite rule matched.
    pub transformed_host: String,
    pub resolved_addr: Option<IpAddr>,
    pub scheme: String,
    pub port: u16,
    pub method: String,
    /// Path plus query of the inbound request.
    pub uri_path: String,
    pub bag: HashMap<String, String>,
    pub start: Instant,
    pub upstream_start: Option<Instant>,
}

impl RequestContext {
    pub fn new(client_ip: IpAddr, scheme: String, port: u16, method: String, uri_path: String) -> Self {
        Self {
            client_ip,
            host: String::new(),
            transformed_host: String::new(),
            resolved_addr: None,
            scheme,
            port,
            method,
            uri_path,
            bag: HashMap::new(),
            start: Instant::now(),
            upstream_start: None,
        }
    }

    /// Render a pipeline error as the client-facing HTML response and
    /// record metrics. Single exit point for every local error path.
    pub fn error_response(&self, err: &ProxyError) -> hyper::Response<BoxBody> {
        let status = err.status();
        let mut buf = itoa::Buffer::new();
        let status_str = buf.format(status.as_u16());

        metrics::counter!(
            "proxy_http_requests_total",
            "method" => self.method.clone(),
            "status_code" => status_str.to_owned(),
            "outcome" => "error",
        )
        .increment(1);

        let title = format!(
            "{} {}",
            status.as_u16(),
            status.canonical_reason().unwrap_or("Error")
        );
        // Messages are escaped where user-supplied values are inserted.
        let body = format!(
            "<html><head><title>{title}</title></head><body><h1>{title}</h1><p>{}</p></body></html>",
            err
        );

        hyper::Response::builder()
            .status(status)
            .header("content-type", "text/html; charset=utf-8")
            .header("cache-control", "no-cache, no-store, must-revalidate")
            .header("pragma", "no-cache")
            .header("expires", "0")
            .body(full_body(body))
            .unwrap()
    }

    /// Record final metrics for a response that is about to be flushed.
    pub fn finalize_metrics(&self, resp_status: u16) {
        let mut buf = itoa::Buffer::new();
        let status_str = buf.format(resp_status);

        metrics::counter!(
            "proxy_http_requests_total",
            "method" => self.method.clone(),
            "status_code" => status_str.to_owned(),
            "outcome" => "served",
        )
        .increment(1);

        if let Some(upstream_start) = self.upstream_start {
            metrics::histogram!("proxy_upstream_request_duration_seconds")
                .record(upstream_start.elapsed().as_secs_f64());
        }
    }
}
