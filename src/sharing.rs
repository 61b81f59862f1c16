//! Sharing rule evaluation
//!
//! Decides which agents receive a shadow copy of a record. Evaluation is a
//! pure function of the rule set and the record.

use std::collections::{BTreeMap, BTreeSet};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::memory::MemoryRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SharingMode {
    /// Share matching categories with the targets
    GlobalAllow,

    /// Never share (or never share with the targets)
    RestrictedDeny,

    /// Share on category or tag match
    AutoPropagate,
}

impl std::fmt::Display for SharingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SharingMode::GlobalAllow => write!(f, "global-allow"),
            SharingMode::RestrictedDeny => write!(f, "restricted-deny"),
            SharingMode::AutoPropagate => write!(f, "auto-propagate"),
        }
    }
}

/// What a rule matches on. Patterns accept `*` as a wildcard and compare
/// case-insensitively.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleTrigger {
    Category(String),
    Tag(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharingRule {
    pub name: String,

    pub trigger: RuleTrigger,

    #[serde(default)]
    pub target_agents: BTreeSet<String>,

    pub mode: SharingMode,

    /// Owner a restricted-deny rule applies to; `None` means every owner
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
}

impl SharingRule {
    pub fn global_allow<I, S>(name: &str, category: &str, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.to_string(),
            trigger: RuleTrigger::Category(category.to_string()),
            target_agents: targets.into_iter().map(Into::into).collect(),
            mode: SharingMode::GlobalAllow,
            agent_id: None,
        }
    }

    /// Deny every share of `category` written by `agent_id`
    pub fn restricted(name: &str, agent_id: &str, category: &str) -> Self {
        Self {
            name: name.to_string(),
            trigger: RuleTrigger::Category(category.to_string()),
            target_agents: BTreeSet::new(),
            mode: SharingMode::RestrictedDeny,
            agent_id: Some(agent_id.to_string()),
        }
    }

    pub fn auto_propagate<I, S>(name: &str, trigger: RuleTrigger, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.to_string(),
            trigger,
            target_agents: targets.into_iter().map(Into::into).collect(),
            mode: SharingMode::AutoPropagate,
            agent_id: None,
        }
    }
}

fn compile_pattern(pattern: &str) -> Result<Regex> {
    let body = regex::escape(pattern).replace(r"\*", ".*");
    Regex::new(&format!("(?i)^{}$", body))
        .map_err(|e| Error::config(format!("invalid sharing pattern {:?}: {}", pattern, e)))
}

struct CompiledRule {
    rule: SharingRule,
    pattern: Regex,
}

impl CompiledRule {
    fn matches(&self, record: &MemoryRecord) -> bool {
        if let Some(owner) = &self.rule.agent_id {
            if owner != &record.owner_agent_id {
                return false;
            }
        }
        match &self.rule.trigger {
            RuleTrigger::Category(_) => self.pattern.is_match(&record.category),
            RuleTrigger::Tag(_) => record.tags.iter().any(|t| self.pattern.is_match(t)),
        }
    }
}

enum Denial {
    Everyone,
    Agents(BTreeSet<String>),
}

/// Compiled rule set
pub struct SharingRuleEngine {
    rules: Vec<CompiledRule>,
}

impl SharingRuleEngine {
    pub fn new(rules: Vec<SharingRule>) -> Result<Self> {
        let rules = rules
            .into_iter()
            .map(|rule| {
                let pattern = match &rule.trigger {
                    RuleTrigger::Category(p) | RuleTrigger::Tag(p) => compile_pattern(p)?,
                };
                Ok(CompiledRule { rule, pattern })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { rules })
    }

    pub fn rules(&self) -> Vec<SharingRule> {
        self.rules.iter().map(|c| c.rule.clone()).collect()
    }

    fn denial(&self, record: &MemoryRecord) -> Option<Denial> {
        let mut denied = BTreeSet::new();
        for compiled in &self.rules {
            if compiled.rule.mode != SharingMode::RestrictedDeny || !compiled.matches(record) {
                continue;
            }
            if compiled.rule.target_agents.is_empty() {
                return Some(Denial::Everyone);
            }
            denied.extend(compiled.rule.target_agents.iter().cloned());
        }
        (!denied.is_empty()).then_some(Denial::Agents(denied))
    }

    /// Whether `record` may never leave its owner's slice
    pub fn is_restricted(&self, record: &MemoryRecord) -> bool {
        matches!(self.denial(record), Some(Denial::Everyone))
    }

    /// Whether a restricted-deny rule keeps `record` away from `agent_id`
    pub fn is_denied(&self, record: &MemoryRecord, agent_id: &str) -> bool {
        match self.denial(record) {
            Some(Denial::Everyone) => true,
            Some(Denial::Agents(agents)) => agents.contains(agent_id),
            None => false,
        }
    }

    /// Agents that should hold a shadow copy of `record`, each mapped to the
    /// rule (or explicit request) that put it there
    pub fn explain(
        &self,
        record: &MemoryRecord,
        share_with: &BTreeSet<String>,
    ) -> BTreeMap<String, String> {
        let denied = match self.denial(record) {
            Some(Denial::Everyone) => return BTreeMap::new(),
            Some(Denial::Agents(agents)) => agents,
            None => BTreeSet::new(),
        };

        let mut targets = BTreeMap::new();
        let mut add = |agent: &String, reason: &str| {
            if agent != &record.owner_agent_id && !denied.contains(agent) {
                targets
                    .entry(agent.clone())
                    .or_insert_with(|| reason.to_string());
            }
        };

        for compiled in &self.rules {
            let applies = match compiled.rule.mode {
                SharingMode::RestrictedDeny => false,
                SharingMode::GlobalAllow => {
                    matches!(compiled.rule.trigger, RuleTrigger::Category(_)) && compiled.matches(record)
                }
                SharingMode::AutoPropagate => compiled.matches(record),
            };
            if applies {
                for agent in &compiled.rule.target_agents {
                    add(agent, &compiled.rule.name);
                }
            }
        }

        for agent in share_with {
            add(agent, "explicit share request");
        }

        targets
    }

    /// The final target set, possibly empty
    pub fn resolve_targets(
        &self,
        record: &MemoryRecord,
        share_with: &BTreeSet<String>,
    ) -> BTreeSet<String> {
        self.explain(record, share_with).into_keys().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> SharingRuleEngine {
        SharingRuleEngine::new(vec![
            SharingRule::restricted("alden-private", "alden", "personal_*"),
            SharingRule::global_allow("preferences", "preference", ["alden", "alice", "mimic"]),
            SharingRule::auto_propagate(
                "security-incidents",
                RuleTrigger::Tag("security-incident".into()),
                ["alden", "sentry"],
            ),
        ])
        .unwrap()
    }

    fn none() -> BTreeSet<String> {
        BTreeSet::new()
    }

    #[test]
    fn global_allow_excludes_owner() {
        let record = MemoryRecord::new("alden", "u1", "dark mode").with_category("Preference");
        let targets = engine().resolve_targets(&record, &none());
        assert_eq!(
            targets,
            ["alice", "mimic"].iter().map(|s| s.to_string()).collect()
        );
    }

    #[test]
    fn restricted_category_wins_over_everything() {
        let record = MemoryRecord::new("alden", "u1", "diary")
            .with_category("personal_conversation")
            .with_tags(["security-incident"]);
        let explicit: BTreeSet<String> = ["alice".to_string()].into();

        let engine = engine();
        assert!(engine.is_restricted(&record));
        assert!(engine.resolve_targets(&record, &explicit).is_empty());
        assert!(engine.is_denied(&record, "alice"));
    }

    #[test]
    fn restriction_is_scoped_to_its_owner() {
        let record = MemoryRecord::new("alice", "u1", "notes")
            .with_category("personal_conversation");
        let explicit: BTreeSet<String> = ["mimic".to_string()].into();
        assert_eq!(engine().resolve_targets(&record, &explicit), explicit);
    }

    #[test]
    fn tag_trigger_propagates_and_explains() {
        let record = MemoryRecord::new("alice", "u1", "odd login")
            .with_category("observation")
            .with_tags(["security-incident"]);
        let reasons = engine().explain(&record, &none());
        assert_eq!(reasons.len(), 2);
        assert_eq!(reasons["sentry"], "security-incidents");
    }

    #[test]
    fn deny_with_targets_excludes_only_those_agents() {
        let mut rule = SharingRule::restricted("no-mimic", "alden", "preference");
        rule.target_agents.insert("mimic".into());
        let engine = SharingRuleEngine::new(vec![
            rule,
            SharingRule::global_allow("preferences", "preference", ["alice", "mimic"]),
        ])
        .unwrap();

        let record = MemoryRecord::new("alden", "u1", "dark mode").with_category("preference");
        assert!(!engine.is_restricted(&record));
        assert_eq!(
            engine.resolve_targets(&record, &none()),
            ["alice".to_string()].into()
        );
    }

    #[test]
    fn wildcard_does_not_leak_regex_syntax() {
        let engine = SharingRuleEngine::new(vec![SharingRule::global_allow(
            "dotted",
            "a.b",
            ["alice"],
        )])
        .unwrap();
        let literal = MemoryRecord::new("alden", "u1", "x").with_category("a.b");
        let other = MemoryRecord::new("alden", "u1", "x").with_category("axb");
        assert_eq!(engine.resolve_targets(&literal, &none()).len(), 1);
        assert!(engine.resolve_targets(&other, &none()).is_empty());
    }
}
