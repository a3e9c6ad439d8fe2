use super::{Settings, SettingsError};
use std::sync::Arc;

/// Per-feature views over the shared [`Settings`] registry.
///
/// A view is a thin accessor: it claims its keys for its environment at
/// construction (bootstrap time) and reads through the overlay on every
/// call, so replicated overrides take effect on the next read without a
/// restart.
macro_rules! settings_view {
    ($name:ident, $environment:literal, [$($key:literal),+ $(,)?]) => {
        #[derive(Clone)]
        pub struct $name {
            settings: Arc<Settings>,
        }

        impl $name {
            pub const ENVIRONMENT: &'static str = $environment;
            const KEYS: &'static [&'static str] = &[$($key),+];

            pub fn new(settings: &Arc<Settings>) -> Result<Self, SettingsError> {
                for key in Self::KEYS {
                    settings.claim(Self::ENVIRONMENT, key)?;
                }
                Ok(Self {
                    settings: settings.clone(),
                })
            }

            #[allow(dead_code)]
            fn settings(&self) -> &Settings {
                &self.settings
            }
        }
    };
}

settings_view!(EnvelopeSettings, "envelope", [
    "TRUSTED_PROXY_CIDRS_V4",
    "TRUSTED_PROXY_CIDRS_V6",
    "REWRITE_CLIENT_IP",
    "REWRITE_HOST",
    "REWRITE_SCHEME",
    "REWRITE_PORT",
    "FORWARDED_FOR_HEADER",
    "FORWARDED_HOST_HEADER",
    "FORWARDED_PROTO_HEADER",
    "FORWARDED_PORT_HEADER",
    "CLOUDFLARE_AWARE",
    "CLOUDFLARE_CIDRS_V4",
    "CLOUDFLARE_FOR_HEADER",
]);

impl EnvelopeSettings {
    pub fn trusted_proxy_cidrs_v4(&self) -> Vec<String> {
        self.settings.list_or_empty("TRUSTED_PROXY_CIDRS_V4")
    }

    pub fn trusted_proxy_cidrs_v6(&self) -> Vec<String> {
        self.settings.list_or_empty("TRUSTED_PROXY_CIDRS_V6")
    }

    pub fn rewrite_client_ip(&self) -> bool {
        self.settings.bool_or("REWRITE_CLIENT_IP", true)
    }

    pub fn rewrite_host(&self) -> bool {
        self.settings.bool_or("REWRITE_HOST", true)
    }

    pub fn rewrite_scheme(&self) -> bool {
        self.settings.bool_or("REWRITE_SCHEME", true)
    }

    pub fn rewrite_port(&self) -> bool {
        self.settings.bool_or("REWRITE_PORT", true)
    }

    pub fn forwarded_for_header(&self) -> String {
        self.settings
            .string_or("FORWARDED_FOR_HEADER", "x-forwarded-for")
    }

    pub fn forwarded_host_header(&self) -> String {
        self.settings
            .string_or("FORWARDED_HOST_HEADER", "x-forwarded-host")
    }

    pub fn forwarded_proto_header(&self) -> String {
        self.settings
            .string_or("FORWARDED_PROTO_HEADER", "x-forwarded-proto")
    }

    pub fn forwarded_port_header(&self) -> String {
        self.settings
            .string_or("FORWARDED_PORT_HEADER", "x-forwarded-port")
    }

    pub fn cloudflare_aware(&self) -> bool {
        self.settings.bool_or("CLOUDFLARE_AWARE", false)
    }

    pub fn cloudflare_cidrs_v4(&self) -> Vec<String> {
        self.settings.list_or_empty("CLOUDFLARE_CIDRS_V4")
    }

    pub fn cloudflare_for_header(&self) -> String {
        self.settings
            .string_or("CLOUDFLARE_FOR_HEADER", "cf-connecting-ip")
    }
}

settings_view!(GuardSettings, "guard", [
    "CIDR_CHECK_ENABLED",
    "ALLOWED_CIDRS_V4",
    "ALLOWED_CIDRS_V6",
    "CIDR_CHECK_ABORT",
    "CRAWLER_CHECK_ENABLED",
    "CRAWLER_CHECK_ABORT",
]);

impl GuardSettings {
    pub fn cidr_check_enabled(&self) -> bool {
        self.settings.bool_or("CIDR_CHECK_ENABLED", false)
    }

    pub fn allowed_cidrs_v4(&self) -> Vec<String> {
        self.settings.list_or_empty("ALLOWED_CIDRS_V4")
    }

    pub fn allowed_cidrs_v6(&self) -> Vec<String> {
        self.settings.list_or_empty("ALLOWED_CIDRS_V6")
    }

    pub fn cidr_check_abort(&self) -> bool {
        self.settings.bool_or("CIDR_CHECK_ABORT", false)
    }

    pub fn crawler_check_enabled(&self) -> bool {
        self.settings.bool_or("CRAWLER_CHECK_ENABLED", false)
    }

    pub fn crawler_check_abort(&self) -> bool {
        self.settings.bool_or("CRAWLER_CHECK_ABORT", false)
    }
}

settings_view!(ResolverSettings, "resolver", [
    "STRIP_PORT_FROM_HOST",
    "HOSTNAME_REWRITE_REGEX",
    "PRODUCTION_APEX",
]);

impl ResolverSettings {
    pub fn strip_port_from_host(&self) -> bool {
        self.settings.bool_or("STRIP_PORT_FROM_HOST", true)
    }

    pub fn hostname_rewrite_regex(&self) -> String {
        self.settings.string_or(
            "HOSTNAME_REWRITE_REGEX",
            r"^(.*)\.(?:game|site)test\d+\.example\.com$",
        )
    }

    pub fn production_apex(&self) -> String {
        self.settings.string_or("PRODUCTION_APEX", "example.com")
    }
}

settings_view!(SafetySettings, "safety", [
    "HATE_LAN_ACCESS",
    "PUBLIC_IP_DISCOVERY_URL",
]);

impl SafetySettings {
    pub fn hate_lan_access(&self) -> bool {
        self.settings.bool_or("HATE_LAN_ACCESS", false)
    }

    /// Empty string disables public-IP discovery entirely.
    pub fn public_ip_discovery_url(&self) -> String {
        self.settings
            .string_or("PUBLIC_IP_DISCOVERY_URL", "https://checkip.amazonaws.com")
    }
}

settings_view!(RulesSettings, "rules", [
    "HARDCODED_RULES_FILE",
    "CORS_RULES_FILE",
    "REWRITE_RULES_FILE",
    "RULES_BASE_DIR",
    "RELOAD_RULES_ON_REQUEST",
    "SERVICES_APEX",
]);

impl RulesSettings {
    pub fn hardcoded_rules_file(&self) -> String {
        self.settings
            .string_or("HARDCODED_RULES_FILE", "hardcoded-responses.yaml")
    }

    pub fn cors_rules_file(&self) -> String {
        self.settings.string_or("CORS_RULES_FILE", "cors-rules.yaml")
    }

    pub fn rewrite_rules_file(&self) -> String {
        self.settings
            .string_or("REWRITE_RULES_FILE", "rewrite-rules.yaml")
    }

    pub fn rules_base_dir(&self) -> String {
        self.settings.string_or("RULES_BASE_DIR", ".")
    }

    pub fn reload_on_request(&self) -> bool {
        self.settings.bool_or("RELOAD_RULES_ON_REQUEST", false)
    }

    pub fn services_apex(&self) -> String {
        self.settings
            .string_or("SERVICES_APEX", "services.example.com")
    }
}

settings_view!(ForwarderSettings, "forwarder", [
    "UPSTREAM_TIMEOUT_MS",
    "MAX_BODY_BYTES",
    "UPSTREAM_TLS_VERIFY",
]);

impl ForwarderSettings {
    pub fn upstream_timeout_ms(&self) -> u64 {
        self.settings.u64_or("UPSTREAM_TIMEOUT_MS", 35_000)
    }

    pub fn max_body_bytes(&self) -> u64 {
        self.settings.u64_or("MAX_BODY_BYTES", 5 * 1024 * 1024 * 1024)
    }

    pub fn upstream_tls_verify(&self) -> bool {
        self.settings.bool_or("UPSTREAM_TLS_VERIFY", false)
    }
}

settings_view!(ReplicatorSettings, "replicator", [
    "REPLICATION_ENABLED",
    "MULTICAST_GROUP",
    "MULTICAST_PORT",
]);

impl ReplicatorSettings {
    pub fn replication_enabled(&self) -> bool {
        self.settings.bool_or("REPLICATION_ENABLED", true)
    }

    pub fn multicast_group(&self) -> String {
        self.settings.string_or("MULTICAST_GROUP", "224.0.0.3")
    }

    pub fn multicast_port(&self) -> u16 {
        self.settings.u16_or("MULTICAST_PORT", 5000)
    }
}

settings_view!(HealthSettings, "health", [
    "HEALTH_PATH",
    "ARC_DEPLOY",
    "NODE_URL_TEMPLATE",
]);

impl HealthSettings {
    pub fn health_path(&self) -> String {
        self.settings.string_or("HEALTH_PATH", "/_lb/_/health")
    }

    pub fn arc_deploy(&self) -> bool {
        self.settings.bool_or("ARC_DEPLOY", false)
    }

    /// `{hostname}` and `{port}` are substituted when rendering the ARC
    /// info body.
    pub fn node_url_template(&self) -> String {
        self.settings
            .string_or("NODE_URL_TEMPLATE", "http://{hostname}:{port}")
    }
}

settings_view!(ServerSettings, "server", [
    "BIND_ADDRESS_V4",
    "HTTP_PORT",
    "HTTPS_PORT",
    "TLS_ENABLED",
    "TLS_CERT",
    "TLS_KEY",
    "TLS_CHAIN",
    "TLS_PASSPHRASE",
    "TLS_BASE_DIR",
    "EXIT_ON_PANIC",
]);

impl ServerSettings {
    pub fn bind_address_v4(&self) -> String {
        self.settings.string_or("BIND_ADDRESS_V4", "0.0.0.0")
    }

    pub fn http_port(&self) -> u16 {
        self.settings.u16_or("HTTP_PORT", 80)
    }

    pub fn https_port(&self) -> u16 {
        self.settings.u16_or("HTTPS_PORT", 443)
    }

    pub fn tls_enabled(&self) -> bool {
        self.settings.bool_or("TLS_ENABLED", false)
    }

    pub fn tls_cert(&self) -> String {
        self.settings.string_or("TLS_CERT", "")
    }

    pub fn tls_key(&self) -> String {
        self.settings.string_or("TLS_KEY", "")
    }

    pub fn tls_chain(&self) -> String {
        self.settings.string_or("TLS_CHAIN", "")
    }

    pub fn tls_passphrase(&self) -> String {
        self.settings.string_or("TLS_PASSPHRASE", "")
    }

    pub fn tls_base_dir(&self) -> String {
        self.settings.string_or("TLS_BASE_DIR", ".")
    }

    pub fn exit_on_panic(&self) -> bool {
        self.settings.bool_or("EXIT_ON_PANIC", false)
    }
}

settings_view!(TelemetrySettings, "telemetry", ["TELEMETRY_ENDPOINT"]);

impl TelemetrySettings {
    /// Empty endpoint selects the no-op telemetry implementation.
    pub fn telemetry_endpoint(&self) -> String {
        self.settings.string_or("TELEMETRY_ENDPOINT", "")
    }
}
