use crate::net::local::PublicIp;
use crate::proxy::forward::Forwarder;
use crate::proxy::resolve::{DnsResolver, HostResolver};
use crate::rules::RuleEngine;
use crate::settings::{
    EnvelopeSettings, GuardSettings, HealthSettings, ResolverSettings, SafetySettings, Settings,
};
use crate::telemetry::Telemetry;
use anyhow::Result;
use std::sync::Arc;

/// Shared proxy state, cheaply cloneable; one clone per connection.
///
/// Construction claims every settings key for its owning environment,
/// so a key reachable through two feature areas fails here, at startup,
/// with the registry's "already registered" error.
#[derive(Clone)]
pub struct ProxyState {
    pub settings: Arc<Settings>,
    pub envelope: EnvelopeSettings,
    pub guard: GuardSettings,
    pub resolver_settings: ResolverSettings,
    pub safety: SafetySettings,
    pub health: HealthSettings,
    pub rules: Arc<RuleEngine>,
    pub forwarder: Arc<Forwarder>,
    pub resolver: Arc<dyn HostResolver>,
    pub public_ip: Arc<PublicIp>,
    pub telemetry: Arc<dyn Telemetry>,
}

impl ProxyState {
    pub fn new(settings: Arc<Settings>) -> Result<Self> {
        Self::with_resolver(settings, Arc::new(DnsResolver::from_system()))
    }

    /// Test entry point: swap the DNS seam for a static resolver.
    pub fn with_resolver(
        settings: Arc<Settings>,
        resolver: Arc<dyn HostResolver>,
    ) -> Result<Self> {
        let envelope = EnvelopeSettings::new(&settings)?;
        let guard = GuardSettings::new(&settings)?;
        let resolver_settings = ResolverSettings::new(&settings)?;
        let safety = SafetySettings::new(&settings)?;
        let health = HealthSettings::new(&settings)?;
        let rules_settings = crate::settings::RulesSettings::new(&settings)?;
        let forwarder_settings = crate::settings::ForwarderSettings::new(&settings)?;
        let telemetry_settings = crate::settings::TelemetrySettings::new(&settings)?;

        let telemetry = crate::telemetry::from_settings(&telemetry_settings);

        Ok(Self {
            settings,
            envelope,
            guard,
            resolver_settings,
            safety,
            health,
            rules: Arc::new(RuleEngine::new(rules_settings)),
            forwarder: Arc::new(Forwarder::new(forwarder_settings)),
            resolver,
            public_ip: Arc::new(PublicIp::new()),
            telemetry,
        })
    }
}
