use crate::error::ProxyError;
use regex::Regex;
use serde::Deserialize;
use std::path::Path;

/// On-disk shape of one path-rewrite rule for the services apex.
#[derive(Debug, Clone, Deserialize)]
pub struct RewriteRuleRecord {
    /// Regex matched against the request path+query.
    pub path: String,

    /// Replacement template; `$1`, `$2`, … expand capture groups.
    pub target: String,
}

#[derive(Debug)]
pub struct RewriteRule {
    path: Regex,
    target: String,
    pub path_source: String,
}

impl RewriteRule {
    fn compile(record: RewriteRuleRecord) -> Result<Self, ProxyError> {
        let path = Regex::new(&record.path).map_err(|e| {
            ProxyError::Internal(format!("invalid rewrite pattern {:?}: {}", record.path, e))
        })?;
        Ok(Self {
            path,
            target: record.target,
            path_source: record.path,
        })
    }
}

/// Path-rewrite table applied to requests for the services apex domain,
/// before the forwarder builds the upstream URL.
#[derive(Debug, Default)]
pub struct RewriteRuleSet {
    rules: Vec<RewriteRule>,
}

impl RewriteRuleSet {
    pub fn load(raw: &str, path: &Path) -> Result<Self, ProxyError> {
        let records = super::store::parse_records::<RewriteRuleRecord>(raw, path)?;
        let mut rules = Vec::with_capacity(records.len());
        for record in records {
            rules.push(RewriteRule::compile(record)?);
        }
        Ok(Self { rules })
    }

    /// First matching rule rewrites the path+query; no match leaves the
    /// original untouched.
    pub fn apply(&self, path_and_query: &str) -> Option<String> {
        for rule in &self.rules {
            if rule.path.is_match(path_and_query) {
                let rewritten = rule
                    .path
                    .replace(path_and_query, rule.target.as_str())
                    .into_owned();
                tracing::debug!(
                    "rules: path rewritten, pattern={}, from={}, to={}",
                    rule.path_source,
                    path_and_query,
                    rewritten
                );
                return Some(rewritten);
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(rules: &[(&str, &str)]) -> RewriteRuleSet {
        let records = rules
            .iter()
            .map(|(p, t)| RewriteRuleRecord {
                path: p.to_string(),
                target: t.to_string(),
            })
            .collect::<Vec<_>>();
        let mut compiled = Vec::new();
        for r in records {
            compiled.push(RewriteRule::compile(r).unwrap());
        }
        RewriteRuleSet { rules: compiled }
    }

    #[test]
    fn test_first_match_rewrites_with_captures() {
        let set = set(&[
            (r"^/game/(\d+)/join$", "/v2/games/$1/join"),
            (r"^/game/", "/v2/games/"),
        ]);
        assert_eq!(
            set.apply("/game/42/join").as_deref(),
            Some("/v2/games/42/join")
        );
        assert_eq!(set.apply("/game/lobby").as_deref(), Some("/v2/games/lobby"));
        assert_eq!(set.apply("/profile"), None);
    }

    #[test]
    fn test_load_yaml() {
        let yaml = r#"
- path: "^/ping$"
  target: "/internal/ping"
"#;
        let set = RewriteRuleSet::load(yaml, Path::new("rewrite.yaml")).unwrap();
        assert_eq!(set.apply("/ping").as_deref(), Some("/internal/ping"));
    }
}
