//! Module path filtering.
//!
//! Decides whether a module is worth stashing, reporting or fetching at all.
//! Rules are prefix based and matched on whole path components, so
//! `github.com/acme` covers `github.com/acme/tool` but not
//! `github.com/acme-corp/tool`.  The longest matching prefix wins.

use parking_lot::RwLock;
use serde::Deserialize;
use tracing::debug;

use crate::config::FilterConfig;
use crate::errors::{Error, Result};

pub trait FilterPolicy: Send + Sync {
    fn should_process(&self, module: &str) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rule {
    Include,
    Exclude,
}

/// Parse one `+ prefix` / `- prefix` rule line.
pub fn parse_rule_line(line: &str) -> Result<(Rule, String)> {
    let line = line.trim();
    let (rule, rest) = match line.chars().next() {
        Some('+') => (Rule::Include, &line[1..]),
        Some('-') => (Rule::Exclude, &line[1..]),
        _ => {
            return Err(Error::Internal(format!(
                "filter rule must start with '+' or '-': {line:?}"
            )))
        }
    };
    let prefix = rest.trim().trim_end_matches('/');
    if prefix.is_empty() {
        return Err(Error::Internal(format!("filter rule has no prefix: {line:?}")));
    }
    Ok((rule, prefix.to_string()))
}

#[derive(Debug)]
pub struct ModFilter {
    default: Rule,
    rules: RwLock<Vec<(String, Rule)>>,
}

impl ModFilter {
    pub fn new(default: Rule) -> Self {
        Self {
            default,
            rules: RwLock::new(Vec::new()),
        }
    }

    pub fn from_config(config: &FilterConfig) -> Result<Self> {
        let filter = Self::new(config.default);
        for line in &config.rules {
            let (rule, prefix) = parse_rule_line(line)?;
            filter.add_rule(&prefix, rule);
        }
        Ok(filter)
    }

    /// Add or replace the rule for `prefix`.
    pub fn add_rule(&self, prefix: &str, rule: Rule) {
        let prefix = prefix.trim_end_matches('/').to_string();
        let mut rules = self.rules.write();
        match rules.iter_mut().find(|(p, _)| *p == prefix) {
            Some(existing) => existing.1 = rule,
            None => rules.push((prefix, rule)),
        }
    }

    fn rule_for(&self, module: &str) -> Rule {
        self.rules
            .read()
            .iter()
            .filter(|(prefix, _)| prefix_matches(prefix, module))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, rule)| *rule)
            .unwrap_or(self.default)
    }
}

impl FilterPolicy for ModFilter {
    fn should_process(&self, module: &str) -> bool {
        let rule = self.rule_for(module);
        if rule == Rule::Exclude {
            debug!(%module, "module excluded by filter");
        }
        rule == Rule::Include
    }
}

fn prefix_matches(prefix: &str, module: &str) -> bool {
    match module.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}
