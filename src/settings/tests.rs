use super::*;
use std::collections::HashMap;

fn base(entries: &[(&str, &str)]) -> std::sync::Arc<Settings> {
    Settings::from_map(
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>(),
    )
}

#[test]
fn test_typed_defaults() {
    let s = base(&[]);
    assert_eq!(s.string_or("MISSING", "fallback"), "fallback");
    assert!(!s.bool_or("MISSING", false));
    assert_eq!(s.u64_or("MISSING", 42), 42);
    assert!(s.list_or_empty("MISSING").is_empty());
}

#[test]
fn test_typed_parsing() {
    let s = base(&[
        ("FLAG", "1"),
        ("PORT", "8443"),
        ("CIDRS", "10.0.0.0/8, 192.168.0.0/16 ,"),
        ("BAD_PORT", "notaport"),
    ]);
    assert!(s.bool_or("FLAG", false));
    assert_eq!(s.u16_or("PORT", 80), 8443);
    assert_eq!(s.list_or_empty("CIDRS"), vec!["10.0.0.0/8", "192.168.0.0/16"]);
    // Unparseable values fall back to the default.
    assert_eq!(s.u16_or("BAD_PORT", 80), 80);
}

#[test]
fn test_overlay_wins_over_base() {
    let s = base(&[("UPSTREAM_TIMEOUT_MS", "1000")]);
    assert_eq!(s.u64_or("UPSTREAM_TIMEOUT_MS", 35_000), 1000);

    s.set_override("UPSTREAM_TIMEOUT_MS", "250");
    assert_eq!(s.u64_or("UPSTREAM_TIMEOUT_MS", 35_000), 250);

    s.remove_override("UPSTREAM_TIMEOUT_MS");
    assert_eq!(s.u64_or("UPSTREAM_TIMEOUT_MS", 35_000), 1000);
}

#[test]
fn test_claim_same_environment_is_idempotent() {
    let s = base(&[]);
    s.claim("safety", "HATE_LAN_ACCESS").unwrap();
    s.claim("safety", "HATE_LAN_ACCESS").unwrap();
    assert_eq!(s.owner("HATE_LAN_ACCESS"), Some("safety"));
}

#[test]
fn test_claim_cross_environment_fails() {
    let s = base(&[]);
    s.claim("safety", "HATE_LAN_ACCESS").unwrap();
    let err = s.claim("guard", "HATE_LAN_ACCESS").unwrap_err();
    assert_eq!(
        err.to_string(),
        "HATE_LAN_ACCESS is already registered in environment safety"
    );
}

#[test]
fn test_views_claim_disjoint_keys() {
    let s = base(&[]);
    let guard = GuardSettings::new(&s).unwrap();
    let safety = SafetySettings::new(&s).unwrap();
    assert!(!guard.cidr_check_enabled());
    assert!(!safety.hate_lan_access());
    // Reconstructing a view over the same registry is fine.
    GuardSettings::new(&s).unwrap();
}

#[test]
fn test_view_reads_through_overlay() {
    let s = base(&[]);
    let safety = SafetySettings::new(&s).unwrap();
    assert!(!safety.hate_lan_access());
    s.set_override("HATE_LAN_ACCESS", "true");
    assert!(safety.hate_lan_access());
}

#[test]
fn test_view_defaults() {
    let s = base(&[]);
    let fw = ForwarderSettings::new(&s).unwrap();
    assert_eq!(fw.upstream_timeout_ms(), 35_000);
    assert_eq!(fw.max_body_bytes(), 5 * 1024 * 1024 * 1024);

    let rep = ReplicatorSettings::new(&s).unwrap();
    assert_eq!(rep.multicast_group(), "224.0.0.3");
    assert_eq!(rep.multicast_port(), 5000);

    let env = EnvelopeSettings::new(&s).unwrap();
    assert_eq!(env.forwarded_for_header(), "x-forwarded-for");
}
