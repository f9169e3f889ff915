//! Compiled rename rules: ordered `(regex, replacement)` lists applied
//! first-match-wins against the SLS reference, state id, and positional state
//! args. Built once at startup from config and shared read-only across every
//! parser worker.

use crate::errors::{CollectorError, Result};
use regex::Regex;

#[derive(Clone)]
pub struct RuleSet {
    rules: Vec<(Regex, String)>,
}

impl RuleSet {
    pub fn compile(raw: &[(String, String)]) -> Result<Self> {
        let mut rules = Vec::with_capacity(raw.len());
        for (pattern, replacement) in raw {
            let full = anchor_full_match(pattern);
            let re = Regex::new(&full).map_err(|source| CollectorError::Regex {
                pattern: pattern.clone(),
                source,
            })?;
            rules.push((re, replacement.clone()));
        }
        Ok(RuleSet { rules })
    }

    pub fn empty() -> Self {
        RuleSet { rules: Vec::new() }
    }

    /// Apply the first rule whose pattern fully matches `input`, expanding
    /// capture-group references (`$1`, `$2`, ...) in its replacement.
    /// Returns `input` unchanged if nothing matches.
    pub fn apply<'a>(&self, input: &'a str) -> std::borrow::Cow<'a, str> {
        for (re, replacement) in &self.rules {
            if let Some(captures) = re.captures(input) {
                if captures.get(0).map(|m| m.as_str()) == Some(input) {
                    let mut expanded = String::new();
                    captures.expand(replacement, &mut expanded);
                    return std::borrow::Cow::Owned(expanded);
                }
            }
        }
        std::borrow::Cow::Borrowed(input)
    }
}

/// Rename-rule semantics require a *full* match, not a search — anchor the
/// pattern unless the author already did.
fn anchor_full_match(pattern: &str) -> String {
    let has_start = pattern.starts_with('^');
    let has_end = pattern.ends_with('$');
    match (has_start, has_end) {
        (true, true) => pattern.to_string(),
        (true, false) => format!("{pattern}$"),
        (false, true) => format!("^{pattern}"),
        (false, false) => format!("^{pattern}$"),
    }
}

#[derive(Clone)]
pub struct RenameRules {
    pub sls: RuleSet,
    pub sid: RuleSet,
    pub mod_: RuleSet,
}

impl RenameRules {
    pub fn empty() -> Self {
        RenameRules {
            sls: RuleSet::empty(),
            sid: RuleSet::empty(),
            mod_: RuleSet::empty(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_ruleset_is_identity() {
        let rules = RuleSet::empty();
        assert_eq!(rules.apply("common/hosts"), "common/hosts");
    }

    #[test]
    fn first_match_wins() {
        let raw = vec![
            ("^common/(.*)$".to_string(), "shared.$1".to_string()),
            ("^common/(.*)$".to_string(), "other.$1".to_string()),
        ];
        let rules = RuleSet::compile(&raw).unwrap();
        assert_eq!(rules.apply("common/hosts"), "shared.hosts");
    }

    #[test]
    fn reordering_ruleset_changes_result() {
        let raw = vec![
            ("^web(.*)$".to_string(), "wwweb$1".to_string()),
            ("^webserver$".to_string(), "exact-match".to_string()),
        ];
        let rules = RuleSet::compile(&raw).unwrap();
        assert_eq!(rules.apply("webserver"), "wwweb" .to_string() + "server");

        let raw_reordered = vec![
            ("^webserver$".to_string(), "exact-match".to_string()),
            ("^web(.*)$".to_string(), "wwweb$1".to_string()),
        ];
        let rules_reordered = RuleSet::compile(&raw_reordered).unwrap();
        assert_eq!(rules_reordered.apply("webserver"), "exact-match");
    }

    #[test]
    fn non_matching_input_passes_through() {
        let raw = vec![("^nomatch$".to_string(), "x".to_string())];
        let rules = RuleSet::compile(&raw).unwrap();
        assert_eq!(rules.apply("webserver"), "webserver");
    }

    #[test]
    fn mod_rule_from_scenario() {
        let raw = vec![("^web(.*)$".to_string(), "wwweb$1".to_string())];
        let rules = RuleSet::compile(&raw).unwrap();
        assert_eq!(rules.apply("webserver"), "wwwebserver");
    }
}
