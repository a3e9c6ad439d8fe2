use super::ProxyState;
use crate::metrics::Metrics;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Request, Response};

type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

pub async fn handle_admin(
    req: Request<Incoming>,
    state: ProxyState,
    metrics: Metrics,
) -> Result<Response<BoxBody>, hyper::Error> {
    match req.uri().path() {
        "/health" | "/healthz" => Ok(Response::builder()
            .status(200)
            .body(full_body(r#"{"status":"ok"}"#))
            .unwrap()),

        "/metrics" => Ok(Response::builder()
            .status(200)
            .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
            .body(full_body(metrics.render()))
            .unwrap()),

        "/rules" => {
            let hardcoded = state.rules.hardcoded_snapshot().await;
            let cors = state.rules.cors_snapshot().await;
            let rewrite = state.rules.rewrite_snapshot().await;

            let rules: Vec<serde_json::Value> = hardcoded
                .rules()
                .iter()
                .map(|r| {
                    serde_json::json!({
                        "id": r.meta.id,
                        "source_file": r.meta.source_file,
                        "route_template": r.meta.route_source,
                        "hostname": r.meta.hostname_source,
                        "method": r.meta.method_source,
                        "scheme": r.meta.scheme_source,
                        "weight": r.weight,
                        "status_code": r.status_code.as_u16(),
                        "specificity": r.specificity(),
                    })
                })
                .collect();

            let body = serde_json::to_string_pretty(&serde_json::json!({
                "hardcoded": rules,
                "cors_rules": cors.len(),
                "rewrite_rules": rewrite.len(),
            }))
            .unwrap_or_default();

            Ok(Response::builder()
                .status(200)
                .header("content-type", "application/json")
                .body(full_body(body))
                .unwrap())
        }

        "/overrides" => {
            // Overlay introspection for the replicated keys operators
            // usually reach for.
            let keys = [
                "HATE_LAN_ACCESS",
                "CIDR_CHECK_ENABLED",
                "CRAWLER_CHECK_ENABLED",
                "RELOAD_RULES_ON_REQUEST",
            ];
            let overrides: serde_json::Map<String, serde_json::Value> = keys
                .iter()
                .filter_map(|k| {
                    state
                        .settings
                        .override_value(k)
                        .map(|v| (k.to_string(), serde_json::Value::String(v)))
                })
                .collect();

            Ok(Response::builder()
                .status(200)
                .header("content-type", "application/json")
                .body(full_body(
                    serde_json::to_string_pretty(&overrides).unwrap_or_default(),
                ))
                .unwrap())
        }

        _ => Ok(Response::builder()
            .status(404)
            .body(full_body(r#"{"error":"not found"}"#))
            .unwrap()),
    }
}
