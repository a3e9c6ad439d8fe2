use crate::error::ProxyError;
use http::StatusCode;
use rand::Rng;
use regex::Regex;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::SystemTime;

/// Compiled form of one rule predicate.
///
/// Computed once at load time. A source string without regex
/// metacharacters compiles to `Literal`, which keeps the unanchored
/// substring semantics of an equivalent regex while matching with a
/// plain `contains`.
#[derive(Debug, Clone)]
pub enum RulePattern {
    /// Field absent in the source; matches everything.
    Any,
    Literal(String),
    Regex(Regex),
}

impl RulePattern {
    pub fn compile(source: Option<&str>) -> Result<Self, ProxyError> {
        match source {
            None => Ok(RulePattern::Any),
            Some(s) if s.is_empty() => Ok(RulePattern::Any),
            Some(s) => {
                if regex::escape(s) == s {
                    Ok(RulePattern::Literal(s.to_string()))
                } else {
                    let re = Regex::new(s).map_err(|e| {
                        ProxyError::Internal(format!("invalid rule pattern {:?}: {}", s, e))
                    })?;
                    Ok(RulePattern::Regex(re))
                }
            }
        }
    }

    pub fn matches(&self, haystack: &str) -> bool {
        match self {
            RulePattern::Any => true,
            RulePattern::Literal(lit) => haystack.contains(lit.as_str()),
            RulePattern::Regex(re) => re.is_match(haystack),
        }
    }
}

/// Scheme predicate: `*` or a literal scheme.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemePattern {
    Any,
    Literal(String),
}

impl SchemePattern {
    fn parse(source: &str) -> Self {
        if source == "*" {
            SchemePattern::Any
        } else {
            SchemePattern::Literal(source.to_ascii_lowercase())
        }
    }

    pub fn matches(&self, scheme: &str) -> bool {
        match self {
            SchemePattern::Any => true,
            SchemePattern::Literal(lit) => lit.eq_ignore_ascii_case(scheme),
        }
    }
}

/// On-disk shape of one hardcoded-response rule.
#[derive(Debug, Clone, Deserialize)]
pub struct RuleRecord {
    #[serde(default)]
    pub route_template: Option<String>,

    #[serde(default)]
    pub hostname: Option<String>,

    #[serde(default)]
    pub method: Option<String>,

    #[serde(default = "default_scheme")]
    pub scheme: String,

    #[serde(default)]
    pub weight: i64,

    #[serde(default = "default_status_code")]
    pub status_code: u16,

    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// A string is served as-is; any other value is serialized as JSON.
    #[serde(default)]
    pub body: Option<serde_json::Value>,

    #[serde(default)]
    pub format_body: bool,

    #[serde(default)]
    pub template_variables: HashMap<String, String>,
}

fn default_scheme() -> String {
    "*".to_string()
}

fn default_status_code() -> u16 {
    200
}

/// Provenance kept off the matching path.
#[derive(Debug, Clone)]
pub struct RuleMeta {
    pub source_file: String,
    pub id: String,
    pub created_at: SystemTime,
    pub route_source: String,
    pub hostname_source: String,
    pub method_source: String,
    pub scheme_source: String,
}

#[derive(Debug, Clone)]
pub struct HardcodedRule {
    pub route: RulePattern,
    pub hostname: RulePattern,
    pub method: RulePattern,
    pub scheme: SchemePattern,
    pub weight: i64,
    pub status_code: StatusCode,
    pub headers: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
    pub format_body: bool,
    pub template_variables: HashMap<String, String>,
    pub meta: RuleMeta,
}

impl HardcodedRule {
    fn compile(record: RuleRecord, source_file: &str) -> Result<Self, ProxyError> {
        let status_code = StatusCode::from_u16(record.status_code).map_err(|_| {
            ProxyError::Internal(format!("invalid rule status code {}", record.status_code))
        })?;

        let headers = record
            .headers
            .into_iter()
            .map(|(name, value)| (name.to_ascii_lowercase(), value))
            .collect();

        Ok(Self {
            route: RulePattern::compile(record.route_template.as_deref())?,
            hostname: RulePattern::compile(record.hostname.as_deref())?,
            method: RulePattern::compile(record.method.as_deref())?,
            scheme: SchemePattern::parse(&record.scheme),
            weight: record.weight,
            status_code,
            headers,
            body: record.body,
            format_body: record.format_body,
            template_variables: record.template_variables,
            meta: RuleMeta {
                source_file: source_file.to_string(),
                id: generate_rule_id(),
                created_at: SystemTime::now(),
                route_source: record.route_template.unwrap_or_default(),
                hostname_source: record.hostname.unwrap_or_default(),
                method_source: record.method.unwrap_or_default(),
                scheme_source: record.scheme,
            },
        })
    }

    /// All four predicates must hold.
    pub fn matches(&self, url: &str, host: &str, method: &str, scheme: &str) -> bool {
        self.route.matches(url)
            && self.hostname.matches(host)
            && self.method.matches(method)
            && self.scheme.matches(scheme)
    }

    /// Primary sort key: count of `/` across the three raw pattern
    /// sources. More path segments in the sources means a more specific
    /// rule.
    pub fn specificity(&self) -> usize {
        let slashes = |s: &str| s.matches('/').count();
        slashes(&self.meta.route_source)
            + slashes(&self.meta.hostname_source)
            + slashes(&self.meta.method_source)
    }

    fn dedup_key(&self) -> (String, String, String, String) {
        (
            self.meta.route_source.clone(),
            self.meta.hostname_source.clone(),
            self.meta.method_source.clone(),
            self.meta.scheme_source.clone(),
        )
    }

    /// Response body bytes, after optional template interpolation.
    pub fn render_body(&self) -> Vec<u8> {
        let raw = match &self.body {
            None => String::new(),
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(other) => serde_json::to_string(other).unwrap_or_default(),
        };

        if !self.format_body || self.template_variables.is_empty() {
            return raw.into_bytes();
        }

        let mut rendered = raw;
        for (name, value) in &self.template_variables {
            rendered = rendered.replace(&format!("{{{{{}}}}}", name), value);
        }
        rendered.into_bytes()
    }
}

fn generate_rule_id() -> String {
    let mut rng = rand::thread_rng();
    let bytes: [u8; 8] = rng.gen();
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// An immutable, deterministically ordered rule set.
#[derive(Debug, Default)]
pub struct HardcodedRuleSet {
    rules: Vec<HardcodedRule>,
}

impl HardcodedRuleSet {
    /// Compile, collapse duplicates (first loaded wins), and order by
    /// (specificity desc, weight desc). The sort is stable, so rule sets
    /// built from equivalent files order identically across reloads.
    pub fn from_records(records: Vec<RuleRecord>, source_file: &str) -> Result<Self, ProxyError> {
        let mut rules = Vec::with_capacity(records.len());
        let mut seen: HashSet<(String, String, String, String)> = HashSet::new();

        for record in records {
            let rule = HardcodedRule::compile(record, source_file)?;
            if seen.insert(rule.dedup_key()) {
                rules.push(rule);
            }
        }

        rules.sort_by(|a, b| {
            b.specificity()
                .cmp(&a.specificity())
                .then(b.weight.cmp(&a.weight))
        });

        Ok(Self { rules })
    }

    pub fn load(raw: &str, path: &Path) -> Result<Self, ProxyError> {
        let records = super::store::parse_records::<RuleRecord>(raw, path)?;
        let source_file = path.to_string_lossy().to_string();
        Self::from_records(records, &source_file)
    }

    /// First match in sort order.
    pub fn find(&self, url: &str, host: &str, method: &str, scheme: &str) -> Option<&HardcodedRule> {
        self.rules
            .iter()
            .find(|rule| rule.matches(url, host, method, scheme))
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn rules(&self) -> &[HardcodedRule] {
        &self.rules
    }
}
