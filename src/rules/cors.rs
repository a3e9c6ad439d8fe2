use super::hardcoded::RulePattern;
use crate::error::ProxyError;
use regex::Regex;
use serde::Deserialize;
use std::path::Path;

/// On-disk shape of one CORS rule.
#[derive(Debug, Clone, Deserialize)]
pub struct CorsRuleRecord {
    #[serde(default)]
    pub route_template: Option<String>,

    #[serde(default)]
    pub hostname: Option<String>,

    /// Origin patterns; `*` allows every origin.
    #[serde(default)]
    pub allowed_origins: Vec<String>,

    #[serde(default)]
    pub allowed_methods: Vec<String>,

    #[serde(default)]
    pub allowed_headers: Vec<String>,

    #[serde(default)]
    pub exposed_headers: Vec<String>,

    #[serde(default)]
    pub max_age: Option<u64>,

    #[serde(default)]
    pub allow_credentials: bool,

    /// With no allowed origins configured, echo the request origin
    /// instead of matching it.
    #[serde(default)]
    pub allow_request_origin_if_no_allowed_origins: bool,

    /// Strip CORS headers the upstream set before applying this rule's.
    #[serde(default)]
    pub allow_response_headers_overwrite: bool,
}

#[derive(Debug, Clone)]
enum OriginPattern {
    Any,
    Regex(Regex),
}

#[derive(Debug, Clone)]
pub struct CorsRule {
    route: RulePattern,
    hostname: RulePattern,
    origins: Vec<OriginPattern>,
    pub allowed_methods: Vec<String>,
    pub allowed_headers: Vec<String>,
    pub exposed_headers: Vec<String>,
    pub max_age: Option<u64>,
    pub allow_credentials: bool,
    pub allow_request_origin_if_no_allowed_origins: bool,
    pub allow_response_headers_overwrite: bool,
}

impl CorsRule {
    fn compile(record: CorsRuleRecord) -> Result<Self, ProxyError> {
        let mut origins = Vec::with_capacity(record.allowed_origins.len());
        for source in &record.allowed_origins {
            if source == "*" {
                origins.push(OriginPattern::Any);
            } else {
                let re = Regex::new(source).map_err(|e| {
                    ProxyError::Internal(format!("invalid cors origin {:?}: {}", source, e))
                })?;
                origins.push(OriginPattern::Regex(re));
            }
        }

        Ok(Self {
            route: RulePattern::compile(record.route_template.as_deref())?,
            hostname: RulePattern::compile(record.hostname.as_deref())?,
            origins,
            allowed_methods: record.allowed_methods,
            allowed_headers: record.allowed_headers,
            exposed_headers: record.exposed_headers,
            max_age: record.max_age,
            allow_credentials: record.allow_credentials,
            allow_request_origin_if_no_allowed_origins: record
                .allow_request_origin_if_no_allowed_origins,
            allow_response_headers_overwrite: record.allow_response_headers_overwrite,
        })
    }

    pub fn applies_to(&self, url: &str, host: &str) -> bool {
        self.route.matches(url) && self.hostname.matches(host)
    }

    pub fn has_allowed_origins(&self) -> bool {
        !self.origins.is_empty()
    }

    pub fn origin_allowed(&self, origin: &str) -> bool {
        self.origins.iter().any(|p| match p {
            OriginPattern::Any => true,
            OriginPattern::Regex(re) => re.is_match(origin),
        })
    }
}

#[derive(Debug, Default)]
pub struct CorsRuleSet {
    rules: Vec<CorsRule>,
}

impl CorsRuleSet {
    pub fn load(raw: &str, path: &Path) -> Result<Self, ProxyError> {
        let records = super::store::parse_records::<CorsRuleRecord>(raw, path)?;
        let mut rules = Vec::with_capacity(records.len());
        for record in records {
            rules.push(CorsRule::compile(record)?);
        }
        Ok(Self { rules })
    }

    /// First rule whose route and hostname patterns cover the request.
    pub fn find(&self, url: &str, host: &str) -> Option<&CorsRule> {
        self.rules.iter().find(|rule| rule.applies_to(url, host))
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
