pub mod cors;
pub mod hardcoded;
pub mod rewrite;
pub mod store;

pub use cors::{CorsRule, CorsRuleSet};
pub use hardcoded::{HardcodedRule, HardcodedRuleSet, RulePattern};
pub use rewrite::RewriteRuleSet;
pub use store::RuleStore;

use crate::settings::RulesSettings;
use std::path::PathBuf;
use std::sync::Arc;

/// The three file-backed rule artifacts behind one reload discipline.
///
/// Each snapshot call resolves the configured file path and consults the
/// per-request reload flag, so replicated settings overrides steer the
/// engine without a restart.
pub struct RuleEngine {
    settings: RulesSettings,
    hardcoded: RuleStore<HardcodedRuleSet>,
    cors: RuleStore<CorsRuleSet>,
    rewrite: RuleStore<RewriteRuleSet>,
}

impl RuleEngine {
    pub fn new(settings: RulesSettings) -> Self {
        Self {
            settings,
            hardcoded: RuleStore::new("hardcoded", HardcodedRuleSet::load),
            cors: RuleStore::new("cors", CorsRuleSet::load),
            rewrite: RuleStore::new("rewrite", RewriteRuleSet::load),
        }
    }

    fn rule_path(&self, file: &str) -> PathBuf {
        PathBuf::from(self.settings.rules_base_dir()).join(file)
    }

    pub async fn hardcoded_snapshot(&self) -> Arc<HardcodedRuleSet> {
        let path = self.rule_path(&self.settings.hardcoded_rules_file());
        self.hardcoded
            .snapshot(&path, self.settings.reload_on_request())
            .await
    }

    pub async fn cors_snapshot(&self) -> Arc<CorsRuleSet> {
        let path = self.rule_path(&self.settings.cors_rules_file());
        self.cors
            .snapshot(&path, self.settings.reload_on_request())
            .await
    }

    pub async fn rewrite_snapshot(&self) -> Arc<RewriteRuleSet> {
        let path = self.rule_path(&self.settings.rewrite_rules_file());
        self.rewrite
            .snapshot(&path, self.settings.reload_on_request())
            .await
    }

    pub fn services_apex(&self) -> String {
        self.settings.services_apex()
    }
}
