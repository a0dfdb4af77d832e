use regex::Regex;
use thiserror::Error;

use crate::crd::{FilterAction, FilterRule};
use crate::subject::SERVICE_ACCOUNT_PREFIX;

/* ============================= ERRORS ============================= */

/// A bad filter chain is a configuration fault: the pipeline must not start.
#[derive(Debug, Error)]
pub enum FilterError {
    #[error("invalid {field} pattern {pattern:?} in filter rule {index}: {source}")]
    InvalidPattern {
        index: usize,
        field: &'static str,
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/* ============================= CHAIN ============================= */

#[derive(Debug)]
struct CompiledRule {
    action: FilterAction,
    user: Option<Regex>,
    namespace: Option<Regex>,
}

impl CompiledRule {
    /// Disjunctive match: either pattern hitting is enough.
    /// A rule with no patterns matches nothing.
    fn matches(&self, username: &str, namespace: &str) -> bool {
        self.user.as_ref().is_some_and(|re| re.is_match(username))
            || self
                .namespace
                .as_ref()
                .is_some_and(|re| re.is_match(namespace))
    }
}

/// Ordered allow/deny predicate chain, compiled once at pipeline start.
#[derive(Debug)]
pub struct FilterChain {
    rules: Vec<CompiledRule>,
    ignore_system_users: bool,
}

impl FilterChain {
    pub fn compile(rules: &[FilterRule], ignore_system_users: bool) -> Result<Self, FilterError> {
        let mut compiled = Vec::with_capacity(rules.len());
        for (index, rule) in rules.iter().enumerate() {
            let user = match &rule.user_pattern {
                Some(p) => Some(Regex::new(p).map_err(|source| FilterError::InvalidPattern {
                    index,
                    field: "user",
                    pattern: p.clone(),
                    source,
                })?),
                None => None,
            };
            let namespace = match &rule.namespace_pattern {
                Some(p) => Some(Regex::new(p).map_err(|source| FilterError::InvalidPattern {
                    index,
                    field: "namespace",
                    pattern: p.clone(),
                    source,
                })?),
                None => None,
            };
            compiled.push(CompiledRule {
                action: rule.action,
                user,
                namespace,
            });
        }
        Ok(FilterChain {
            rules: compiled,
            ignore_system_users,
        })
    }

    /// Decide whether an event for `(username, namespace)` passes.
    ///
    /// The system-user short-circuit runs first; service accounts are
    /// always handed to the chain. First matching rule decides; no match
    /// anywhere means Allow.
    pub fn allows(&self, username: &str, namespace: &str) -> bool {
        if self.ignore_system_users
            && username.starts_with("system:")
            && !username.starts_with(SERVICE_ACCOUNT_PREFIX)
        {
            return false;
        }

        for rule in &self.rules {
            if rule.matches(username, namespace) {
                return rule.action == FilterAction::Allow;
            }
        }
        true
    }
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(action: FilterAction, user: Option<&str>, ns: Option<&str>) -> FilterRule {
        FilterRule {
            action,
            user_pattern: user.map(str::to_string),
            namespace_pattern: ns.map(str::to_string),
        }
    }

    // ── compilation ──

    #[test]
    fn test_compile_empty_chain() {
        let chain = FilterChain::compile(&[], false).expect("empty chain compiles");
        assert!(chain.allows("anyone", "anywhere"));
    }

    #[test]
    fn test_compile_rejects_invalid_user_pattern() {
        let err = FilterChain::compile(&[rule(FilterAction::Deny, Some("(unclosed"), None)], false)
            .expect_err("invalid regex must fail compilation");
        let msg = err.to_string();
        assert!(msg.contains("user"), "error names the field: {msg}");
        assert!(msg.contains("rule 0"), "error names the rule index: {msg}");
    }

    #[test]
    fn test_compile_rejects_invalid_namespace_pattern() {
        let rules = [
            rule(FilterAction::Allow, Some("ok"), None),
            rule(FilterAction::Deny, None, Some("[bad")),
        ];
        let err = FilterChain::compile(&rules, false).expect_err("invalid regex must fail");
        assert!(err.to_string().contains("rule 1"));
    }

    // ── first-match semantics ──

    #[test]
    fn test_first_match_decides() {
        let rules = [
            rule(FilterAction::Deny, Some("^system:node:.*"), None),
            rule(FilterAction::Allow, Some("^system:.*"), None),
        ];
        let chain = FilterChain::compile(&rules, false).unwrap();
        assert!(!chain.allows("system:node:worker-1", ""));
        assert!(chain.allows("system:kube-proxy", ""));
    }

    #[test]
    fn test_default_allow_when_nothing_matches() {
        let rules = [rule(FilterAction::Deny, Some("^blocked$"), None)];
        let chain = FilterChain::compile(&rules, false).unwrap();
        assert!(chain.allows("alice", "prod"));
    }

    #[test]
    fn test_rule_without_patterns_matches_nothing() {
        let rules = [
            rule(FilterAction::Deny, None, None),
            rule(FilterAction::Allow, Some(".*"), None),
        ];
        let chain = FilterChain::compile(&rules, false).unwrap();
        // The pattern-less deny never fires; the catch-all allow does.
        assert!(chain.allows("anyone", "anywhere"));
    }

    // ── disjunctive patterns ──

    #[test]
    fn test_patterns_combine_disjunctively() {
        let rules = [rule(
            FilterAction::Deny,
            Some("^badactor$"),
            Some("^quarantine$"),
        )];
        let chain = FilterChain::compile(&rules, false).unwrap();
        assert!(!chain.allows("badactor", "prod"), "user match alone denies");
        assert!(!chain.allows("alice", "quarantine"), "namespace match alone denies");
        assert!(chain.allows("alice", "prod"), "neither matches → default allow");
    }

    // ── system-user short-circuit ──

    #[test]
    fn test_ignore_system_users_drops_system_principals() {
        let chain = FilterChain::compile(&[], true).unwrap();
        assert!(!chain.allows("system:kube-scheduler", ""));
        assert!(!chain.allows("system:node:worker-1", "prod"));
    }

    #[test]
    fn test_ignore_system_users_retains_service_accounts() {
        let chain = FilterChain::compile(&[], true).unwrap();
        assert!(chain.allows("system:serviceaccount:prod:backend", "prod"));
    }

    #[test]
    fn test_short_circuit_runs_before_chain() {
        // Even a catch-all allow rule cannot resurrect a dropped system user.
        let rules = [rule(FilterAction::Allow, Some(".*"), None)];
        let chain = FilterChain::compile(&rules, true).unwrap();
        assert!(!chain.allows("system:kube-controller-manager", ""));
    }

    // ── realistic three-rule chain ──

    #[test]
    fn test_deny_allow_deny_chain() {
        let rules = [
            rule(FilterAction::Deny, Some("^system:node:.*"), None),
            rule(FilterAction::Allow, None, Some("^production$")),
            rule(FilterAction::Deny, Some(".*"), None),
        ];
        let chain = FilterChain::compile(&rules, false).unwrap();

        assert!(!chain.allows("system:node:worker-1", "production"));
        assert!(chain.allows("system:serviceaccount:production:app", "production"));
        assert!(!chain.allows("system:serviceaccount:staging:app", "staging"));
    }
}
