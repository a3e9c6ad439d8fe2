use crate::error::ProxyError;
use crate::net::CidrSet;
use crate::proxy::context::html_escape;
use crate::settings::GuardSettings;
use regex::Regex;
use std::net::IpAddr;
use std::sync::OnceLock;

/// Outcome of the source guard. `Abort` means destroy the socket
/// without writing a response.
#[derive(Debug)]
pub enum GuardVerdict {
    Pass,
    Reject(ProxyError),
    Abort,
}

/// User agents rejected by the crawler check: named bots, generic
/// bot/crawler substrings, and HTTP-library signatures.
fn crawler_regex() -> &'static Regex {
    static CRAWLER: OnceLock<Regex> = OnceLock::new();
    CRAWLER.get_or_init(|| {
        Regex::new(
            r"(?i)(bot|crawler|spider|crawling|slurp|bingpreview|googlebot|baiduspider|yandex|duckduckbot|facebookexternalhit|ia_archiver|curl|wget|python-requests|python-urllib|go-http-client|okhttp|libwww|httpclient|java/|axios|node-fetch|headlesschrome|phantomjs)",
        )
        .expect("crawler pattern compiles")
    })
}

/// Run the CIDR check then the crawler check, in order, short-circuiting
/// on the first rejection. Each check picks its own rejection form.
pub fn check(client_ip: IpAddr, user_agent: Option<&str>, settings: &GuardSettings) -> GuardVerdict {
    if settings.cidr_check_enabled() {
        let allowed = CidrSet::parse(&settings.allowed_cidrs_v4(), &settings.allowed_cidrs_v6());
        if !allowed.allows(client_ip) {
            metrics::counter!(
                "proxy_guard_rejected_total",
                "check" => "cidr",
            )
            .increment(1);
            tracing::info!("guard: source address rejected, client_ip={}", client_ip);

            if settings.cidr_check_abort() {
                return GuardVerdict::Abort;
            }
            return GuardVerdict::Reject(ProxyError::Forbidden(format!(
                "access denied for client {}",
                html_escape(&client_ip.to_string())
            )));
        }
    }

    if settings.crawler_check_enabled() {
        if let Some(ua) = user_agent {
            if crawler_regex().is_match(ua) {
                metrics::counter!(
                    "proxy_guard_rejected_total",
                    "check" => "crawler",
                )
                .increment(1);
                tracing::info!(
                    "guard: crawler rejected, client_ip={}, user_agent={}",
                    client_ip,
                    ua
                );

                if settings.crawler_check_abort() {
                    return GuardVerdict::Abort;
                }
                return GuardVerdict::Reject(ProxyError::Forbidden(format!(
                    "automated clients are not allowed from {}",
                    html_escape(&client_ip.to_string())
                )));
            }
        }
    }

    GuardVerdict::Pass
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::Settings;
    use std::collections::HashMap;

    fn guard_settings(entries: &[(&str, &str)]) -> GuardSettings {
        let settings = Settings::from_map(
            entries
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<HashMap<_, _>>(),
        );
        GuardSettings::new(&settings).unwrap()
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_disabled_checks_pass_everything() {
        let settings = guard_settings(&[]);
        assert!(matches!(
            check(ip("203.0.113.9"), Some("curl/8.0"), &settings),
            GuardVerdict::Pass
        ));
    }

    #[test]
    fn test_cidr_reject_403() {
        let settings = guard_settings(&[
            ("CIDR_CHECK_ENABLED", "true"),
            ("ALLOWED_CIDRS_V4", "198.51.100.0/24"),
        ]);
        match check(ip("203.0.113.9"), None, &settings) {
            GuardVerdict::Reject(e) => assert_eq!(e.status(), 403),
            other => panic!("expected reject, got {:?}", other),
        }
        assert!(matches!(
            check(ip("198.51.100.9"), None, &settings),
            GuardVerdict::Pass
        ));
    }

    #[test]
    fn test_cidr_reject_abort_mode() {
        let settings = guard_settings(&[
            ("CIDR_CHECK_ENABLED", "true"),
            ("ALLOWED_CIDRS_V4", "198.51.100.0/24"),
            ("CIDR_CHECK_ABORT", "true"),
        ]);
        assert!(matches!(
            check(ip("203.0.113.9"), None, &settings),
            GuardVerdict::Abort
        ));
    }

    #[test]
    fn test_empty_allow_list_disables_family() {
        let settings = guard_settings(&[
            ("CIDR_CHECK_ENABLED", "true"),
            ("ALLOWED_CIDRS_V4", "198.51.100.0/24"),
        ]);
        // No v6 list configured, so v6 clients pass.
        assert!(matches!(
            check(ip("2001:db8::1"), None, &settings),
            GuardVerdict::Pass
        ));
    }

    #[test]
    fn test_crawler_reject() {
        let settings = guard_settings(&[("CRAWLER_CHECK_ENABLED", "true")]);
        for ua in [
            "Mozilla/5.0 (compatible; Googlebot/2.1; +http://www.google.com/bot.html)",
            "curl/8.4.0",
            "python-requests/2.31",
            "Go-http-client/1.1",
        ] {
            assert!(
                matches!(check(ip("203.0.113.9"), Some(ua), &settings), GuardVerdict::Reject(_)),
                "expected crawler rejection for {ua}"
            );
        }
        assert!(matches!(
            check(
                ip("203.0.113.9"),
                Some("Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 Chrome/120.0 Safari/537.36"),
                &settings
            ),
            GuardVerdict::Pass
        ));
    }

    #[test]
    fn test_crawler_abort_mode() {
        let settings = guard_settings(&[
            ("CRAWLER_CHECK_ENABLED", "true"),
            ("CRAWLER_CHECK_ABORT", "true"),
        ]);
        assert!(matches!(
            check(ip("203.0.113.9"), Some("curl/8.4.0"), &settings),
            GuardVerdict::Abort
        ));
    }
}
