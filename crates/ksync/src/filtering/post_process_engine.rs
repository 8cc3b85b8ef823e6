//! ⚖️ PostProcessEngine: every extracted document stands before the rules, in order.
//! First rule that matches decides. If none do, the DEFAULT rule has the final word.

use anyhow::{Context, Result};
use tracing::debug;

use super::simple_rule::SimpleRule;
use super::FilterDefinition;
use crate::common::Document;

#[derive(Debug, Clone)]
pub struct PostProcessEngine {
    rules: Vec<SimpleRule>,
    fallback: SimpleRule,
}

/// 🧾 The verdict, plus the rule that handed it down.
#[derive(Debug, Clone, Copy)]
pub struct PostProcessResult<'a> {
    pub document: &'a Document,
    pub matching_rule: &'a SimpleRule,
}

impl PostProcessResult<'_> {
    pub fn is_include(&self) -> bool {
        self.matching_rule.is_include()
    }
}

impl Default for PostProcessEngine {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl PostProcessEngine {
    pub fn new(rules: Vec<SimpleRule>) -> Self {
        let (defaults, mut rules): (Vec<_>, Vec<_>) = rules.into_iter().partition(SimpleRule::is_default);
        // stable, so equal orders keep their configured sequence
        rules.sort_by_key(SimpleRule::order);
        let fallback = defaults
            .into_iter()
            .next()
            .unwrap_or_else(SimpleRule::default_rule);
        debug!(
            "⚖️ Post-process engine armed with {} rules, fallback policy {:?}",
            rules.len(),
            fallback.policy()
        );
        Self { rules, fallback }
    }

    /// 📜 Build from a filter definition's raw rule list.
    pub fn from_filter(filter: &FilterDefinition) -> Result<Self> {
        let rules = filter
            .rules
            .iter()
            .map(SimpleRule::from_value)
            .collect::<Result<Vec<_>>>()
            .context("💀 The active filtering has a simple rule we cannot use. Validate the draft filtering and activate it again.")?;
        Ok(Self::new(rules))
    }

    pub fn process<'a>(&'a self, document: &'a Document) -> PostProcessResult<'a> {
        let matching_rule = self
            .rules
            .iter()
            .find(|rule| rule.is_match(document))
            .unwrap_or(&self.fallback);
        PostProcessResult {
            document,
            matching_rule,
        }
    }

    pub fn rules(&self) -> &[SimpleRule] {
        &self.rules
    }
}
