use crate::error::{ConnectionAbort, ProxyError};
use crate::proxy::context::{full_body, BoxBody, RequestContext};
use crate::proxy::guard::GuardVerdict;
use crate::proxy::{envelope, finalizer, guard, health, resolve, safety};
use crate::rules::HardcodedRule;
use crate::server::ProxyState;
use http::header::{HeaderName, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE, USER_AGENT};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Request, Response};
use std::net::SocketAddr;
use tracing::debug;

/// Handle an incoming request through the staged pipeline:
///
/// 1. ENVELOPE: transport-field normalization from forwarding headers
/// 2. GUARD:    source CIDR / crawler checks (may abort the socket)
/// 3. HEALTH:   LB probe paths answered locally
/// 4. RESOLVE:  strip port, test-to-production rewrite, DNS
/// 5. SAFETY:   loopback / self / LAN target rejection
/// 6. RULES:    hardcoded responses, then the services path rewrite
/// 7. FORWARD:  upstream call and response transformation
///
/// Exactly one response leaves this function per request (or the
/// connection is aborted), and every response passes the finalizer.
pub async fn handle_request(
    req: Request<Incoming>,
    state: ProxyState,
    peer_addr: SocketAddr,
    listener_scheme: &'static str,
    listener_port: u16,
) -> Result<Response<BoxBody>, ConnectionAbort> {
    metrics::gauge!("proxy_http_requests_in_flight").increment(1.0);

    let (parts, body) = req.into_parts();
    let headers = parts.headers;
    let method = parts.method.as_str().to_string();
    let uri_path_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_owned())
        .unwrap_or_else(|| "/".to_owned());
    let path_only = parts.uri.path().to_string();

    let env = envelope::normalize(
        &headers,
        peer_addr,
        listener_scheme,
        listener_port,
        &state.envelope,
    );
    let mut ctx = RequestContext::new(env.client_ip, env.scheme, env.port, method, uri_path_query);

    // Source guard.
    let user_agent = headers.get(USER_AGENT).and_then(|v| v.to_str().ok());
    match guard::check(ctx.client_ip, user_agent, &state.guard) {
        GuardVerdict::Pass => {}
        GuardVerdict::Abort => {
            state.telemetry.fire("guard", "abort", &ctx.client_ip.to_string());
            metrics::gauge!("proxy_http_requests_in_flight").decrement(1.0);
            return Err(ConnectionAbort);
        }
        GuardVerdict::Reject(err) => {
            state.telemetry.fire("guard", "reject", &ctx.client_ip.to_string());
            let resp = ctx.error_response(&err);
            return respond(ctx, resp);
        }
    }

    // Health probes never reach the resolver or the upstream.
    if health::is_health_path(&path_only, &state.health) {
        let resp = health::respond(&state.health, ctx.port);
        return respond(ctx, resp);
    }

    let raw_host = match env.host {
        Some(h) => h,
        None => {
            let err = ProxyError::BadRequest("host header is missing".to_string());
            let resp = ctx.error_response(&err);
            return respond(ctx, resp);
        }
    };

    // Hostname resolution.
    let resolution = match resolve::resolve_stage(
        &raw_host,
        &state.resolver_settings,
        state.resolver.as_ref(),
    )
    .await
    {
        Ok(r) => r,
        Err(err) => {
            let resp = ctx.error_response(&err);
            return respond(ctx, resp);
        }
    };
    ctx.host = resolution.host;
    ctx.transformed_host = resolution.transformed;
    ctx.resolved_addr = Some(resolution.addr);

    debug!(
        "proxy: host resolved, host={}, transformed={}, addr={}",
        ctx.host, ctx.transformed_host, resolution.addr
    );

    // Safety filter.
    if let Err(err) = safety::check(
        &ctx.host,
        resolution.addr,
        ctx.client_ip,
        &state.safety,
        &state.public_ip,
    )
    .await
    {
        state.telemetry.fire("safety", "reject", &ctx.transformed_host);
        let resp = ctx.error_response(&err);
        return respond(ctx, resp);
    }

    // Hardcoded responses.
    let hardcoded = state.rules.hardcoded_snapshot().await;
    if let Some(rule) = hardcoded.find(
        &ctx.uri_path,
        &ctx.transformed_host,
        &ctx.method,
        &ctx.scheme,
    ) {
        debug!(
            "proxy: hardcoded rule hit, route={}, host={}",
            rule.meta.route_source, ctx.transformed_host
        );
        metrics::counter!("proxy_hardcoded_responses_total").increment(1);
        state
            .telemetry
            .fire("rules", "hardcoded_hit", &rule.meta.route_source);
        let resp = materialize_hardcoded(rule);
        return respond(ctx, resp);
    }

    // Services-apex path rewrite, applied to the outgoing URL only.
    let mut upstream_path = ctx.uri_path.clone();
    if ctx.transformed_host == state.rules.services_apex() {
        if let Some(rewritten) = state.rules.rewrite_snapshot().await.apply(&upstream_path) {
            upstream_path = rewritten;
        }
    }

    // Forward upstream.
    let cors_snapshot = state.rules.cors_snapshot().await;
    let cors_rule = cors_snapshot.find(&ctx.uri_path, &ctx.transformed_host);

    let resp = match state
        .forwarder
        .forward(&mut ctx, &headers, body.boxed(), &upstream_path, cors_rule)
        .await
    {
        Ok(resp) => resp,
        Err(err) => ctx.error_response(&err),
    };

    respond(ctx, resp)
}

/// Single exit point: finalize, record metrics, write the access line.
fn respond(
    mut ctx: RequestContext,
    mut resp: Response<BoxBody>,
) -> Result<Response<BoxBody>, ConnectionAbort> {
    finalizer::finalize(&mut ctx, &mut resp);

    let status = resp.status().as_u16();
    ctx.finalize_metrics(status);
    metrics::gauge!("proxy_http_requests_in_flight").decrement(1.0);

    let total_ms = ctx.start.elapsed().as_millis();
    tracing::info!(
        client_ip = %ctx.client_ip,
        method = %ctx.method,
        host = %ctx.host,
        upstream_host = %ctx.transformed_host,
        path = %ctx.uri_path,
        status = status,
        latency_ms = %total_ms,
        "access"
    );

    Ok(resp)
}

/// Materialize a hardcoded rule as a response: rule headers, the
/// template provenance header, a recomputed content-length, and the
/// rendered body.
fn materialize_hardcoded(rule: &HardcodedRule) -> Response<BoxBody> {
    let body = rule.render_body();

    let mut builder = Response::builder().status(rule.status_code);
    for (name, value) in &rule.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }

    let headers_complete = builder.headers_mut().map(|headers| {
        if let Ok(v) = HeaderValue::from_str(&rule.meta.route_source) {
            headers.insert(
                HeaderName::from_static("x-hardcoded-response-template"),
                v,
            );
        }
        if !headers.contains_key(CONTENT_TYPE) {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/html"));
        }
        if let Ok(v) = HeaderValue::from_str(&body.len().to_string()) {
            headers.insert(CONTENT_LENGTH, v);
        }
    });

    match headers_complete {
        Some(()) => builder.body(full_body(body)).unwrap(),
        // A malformed rule header name poisoned the builder; surface a
        // plain 500 rather than panicking in the request path.
        None => Response::builder()
            .status(500)
            .header(CONTENT_TYPE, "text/html")
            .body(full_body("<html><body><h1>500 Internal Server Error</h1></body></html>"))
            .unwrap(),
    }
}
