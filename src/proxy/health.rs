use crate::proxy::context::{full_body, BoxBody};
use crate::settings::HealthSettings;
use hyper::Response;
use std::sync::OnceLock;
use std::time::Instant;

/// Secondary probe path answered in addition to the configured one.
const CHECKHEALTH_PATH: &str = "/_lb/_/checkhealth";

/// Process start instant for the uptime header. Touched once from
/// bootstrap so the clock starts before the first probe.
pub fn process_start() -> Instant {
    static START: OnceLock<Instant> = OnceLock::new();
    *START.get_or_init(Instant::now)
}

pub fn is_health_path(path: &str, settings: &HealthSettings) -> bool {
    path == settings.health_path() || path == CHECKHEALTH_PATH
}

/// Answer an LB probe without touching the resolver or the upstream.
pub fn respond(settings: &HealthSettings, port: u16) -> Response<BoxBody> {
    let node = crate::net::local::node_hostname();
    let local_ip = crate::net::local::local_ipv4()
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let uptime = process_start().elapsed();
    let uptime = humantime::format_duration(std::time::Duration::from_secs(uptime.as_secs()));

    let body = if settings.arc_deploy() {
        settings
            .node_url_template()
            .replace("{hostname}", &node)
            .replace("{port}", &port.to_string())
    } else {
        "OK".to_string()
    };

    Response::builder()
        .status(200)
        .header("server", "janus-proxy")
        .header("x-powered-by", "janus-proxy")
        .header("x-lb-service", format!("{} ({})", node, local_ip))
        .header("x-lb-uptime", uptime.to_string())
        .header("content-type", "text/plain; charset=utf-8")
        .body(full_body(body))
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::Settings;
    use std::collections::HashMap;

    fn health_settings(entries: &[(&str, &str)]) -> HealthSettings {
        let settings = Settings::from_map(
            entries
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<HashMap<_, _>>(),
        );
        HealthSettings::new(&settings).unwrap()
    }

    #[test]
    fn test_health_paths() {
        let settings = health_settings(&[]);
        assert!(is_health_path("/_lb/_/health", &settings));
        assert!(is_health_path("/_lb/_/checkhealth", &settings));
        assert!(!is_health_path("/", &settings));

        let custom = health_settings(&[("HEALTH_PATH", "/probe")]);
        assert!(is_health_path("/probe", &custom));
        assert!(is_health_path("/_lb/_/checkhealth", &custom));
        assert!(!is_health_path("/_lb/_/health", &custom));
    }

    #[test]
    fn test_identity_headers() {
        let settings = health_settings(&[]);
        let resp = respond(&settings, 443);
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.headers().get("server").unwrap(), "janus-proxy");
        assert_eq!(resp.headers().get("x-powered-by").unwrap(), "janus-proxy");
        assert!(resp.headers().contains_key("x-lb-service"));
    }

    #[tokio::test]
    async fn test_arc_deploy_body_has_node_url() {
        use http_body_util::BodyExt;

        let settings = health_settings(&[
            ("ARC_DEPLOY", "true"),
            ("NODE_URL_TEMPLATE", "http://{hostname}:{port}"),
        ]);
        let resp = respond(&settings, 8080);
        assert_eq!(resp.status(), 200);

        let node = crate::net::local::node_hostname();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, format!("http://{}:8080", node).as_bytes());
    }
}
