use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::crd::{PolicyStrategy, ScopeMode, VerbMerge, WildcardPolicy};
use crate::rule::ObservedRule;
use crate::subject::Subject;

/* ============================= VERBS ============================= */

/// The eight standard verbs, in their conventional rendering order.
pub const STANDARD_VERBS: [&str; 8] = [
    "get",
    "list",
    "watch",
    "create",
    "update",
    "patch",
    "delete",
    "deletecollection",
];

fn verb_sort_key(verb: &str) -> (usize, String) {
    let index = STANDARD_VERBS
        .iter()
        .position(|v| *v == verb)
        .unwrap_or(STANDARD_VERBS.len());
    (index, verb.to_string())
}

fn has_all_standard_verbs(verbs: &BTreeSet<String>) -> bool {
    STANDARD_VERBS.iter().all(|v| verbs.contains(*v))
}

/* ============================= MANIFEST SHAPES ============================= */

// Local serialization structs pin the key order, which makes the rendered
// text byte-identical across runs.

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MetaManifest {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    namespace: Option<String>,
    labels: BTreeMap<String, String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RuleManifest {
    #[serde(skip_serializing_if = "Option::is_none")]
    api_groups: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    resources: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    non_resource_urls: Option<Vec<String>>,
    verbs: Vec<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RoleManifest {
    api_version: &'static str,
    kind: &'static str,
    metadata: MetaManifest,
    rules: Vec<RuleManifest>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RoleRefManifest {
    api_group: &'static str,
    kind: &'static str,
    name: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SubjectManifest {
    kind: String,
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    namespace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    api_group: Option<&'static str>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BindingManifest {
    api_version: &'static str,
    kind: &'static str,
    metadata: MetaManifest,
    role_ref: RoleRefManifest,
    subjects: Vec<SubjectManifest>,
}

const RBAC_API_VERSION: &str = "rbac.authorization.k8s.io/v1";
const RBAC_API_GROUP: &str = "rbac.authorization.k8s.io";

fn labels(source_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            "app.kubernetes.io/managed-by".to_string(),
            "kube-rbac-watch".to_string(),
        ),
        ("rbacwatch.io/source".to_string(), source_name.to_string()),
    ])
}

fn subject_manifest(subject: &Subject) -> SubjectManifest {
    match subject {
        Subject::ServiceAccount { namespace, name } => SubjectManifest {
            kind: "ServiceAccount".to_string(),
            name: name.clone(),
            namespace: Some(namespace.clone()),
            api_group: None,
        },
        Subject::User(name) => SubjectManifest {
            kind: "User".to_string(),
            name: name.clone(),
            namespace: None,
            api_group: Some(RBAC_API_GROUP),
        },
        Subject::Group(name) => SubjectManifest {
            kind: "Group".to_string(),
            name: name.clone(),
            namespace: None,
            api_group: Some(RBAC_API_GROUP),
        },
    }
}

/* ============================= RULE MERGING ============================= */

/// Grouping key inside one scope: an observed rule's identity minus verbs.
#[derive(PartialEq, Eq, PartialOrd, Ord)]
struct RuleKey {
    api_groups: Vec<String>,
    resources: Vec<String>,
    non_resource_urls: Vec<String>,
}

/// Merge one scope's rules under the verb-merge and wildcard policy.
///
/// The safe-wildcard collapse inspects the key's complete observed verb set,
/// so it fires exactly when all eight standard verbs were observed for the
/// `(apiGroups, resources, namespace)` in question, in either merge mode.
fn merge_rules(rules: &[&ObservedRule], merge: VerbMerge, wildcards: WildcardPolicy) -> Vec<RuleManifest> {
    let mut grouped: BTreeMap<RuleKey, BTreeSet<String>> = BTreeMap::new();
    for rule in rules {
        let key = RuleKey {
            api_groups: rule.api_groups.clone(),
            resources: rule.resources.clone(),
            non_resource_urls: rule.non_resource_urls.clone(),
        };
        grouped.entry(key).or_default().extend(rule.verbs.iter().cloned());
    }

    let mut out = Vec::new();
    for (key, verbs) in grouped {
        let verb_lists: Vec<Vec<String>> =
            if wildcards == WildcardPolicy::Safe && has_all_standard_verbs(&verbs) {
                vec![vec!["*".to_string()]]
            } else {
                let mut sorted: Vec<String> = verbs.into_iter().collect();
                sorted.sort_by_key(|v| verb_sort_key(v));
                match merge {
                    VerbMerge::Smart => vec![sorted],
                    VerbMerge::Exact => sorted.into_iter().map(|v| vec![v]).collect(),
                }
            };

        for verbs in verb_lists {
            out.push(RuleManifest {
                api_groups: if key.non_resource_urls.is_empty() {
                    Some(key.api_groups.clone())
                } else {
                    None
                },
                resources: if key.resources.is_empty() {
                    None
                } else {
                    Some(key.resources.clone())
                },
                non_resource_urls: if key.non_resource_urls.is_empty() {
                    None
                } else {
                    Some(key.non_resource_urls.clone())
                },
                verbs,
            });
        }
    }
    out
}

/* ============================= RENDERING ============================= */

/// Render the observed rules for one subject into RBAC manifests.
///
/// Output is deterministic: identical input produces byte-identical text,
/// including key order within each manifest. Cluster-scope objects (when
/// allowed) come first, then namespace objects in namespace order; each
/// role is followed by its binding.
pub fn render_manifests(
    source_name: &str,
    subject: &Subject,
    rules: &[ObservedRule],
    strategy: &PolicyStrategy,
) -> Vec<String> {
    let scope = strategy.scope_mode();
    let merge = strategy.verb_merge();
    let wildcards = strategy.wildcards();

    let mut by_namespace: BTreeMap<String, Vec<&ObservedRule>> = BTreeMap::new();
    for rule in rules {
        by_namespace.entry(rule.namespace.clone()).or_default().push(rule);
    }

    let slug = subject.slug();
    let mut manifests = Vec::new();

    if scope == ScopeMode::ClusterScopeAllowed
        && let Some(cluster_rules) = by_namespace.get("")
    {
        let name = format!("rbacwatch-{slug}");
        let role = RoleManifest {
            api_version: RBAC_API_VERSION,
            kind: "ClusterRole",
            metadata: MetaManifest {
                name: name.clone(),
                namespace: None,
                labels: labels(source_name),
            },
            rules: merge_rules(cluster_rules, merge, wildcards),
        };
        let binding = BindingManifest {
            api_version: RBAC_API_VERSION,
            kind: "ClusterRoleBinding",
            metadata: MetaManifest {
                name: name.clone(),
                namespace: None,
                labels: labels(source_name),
            },
            role_ref: RoleRefManifest {
                api_group: RBAC_API_GROUP,
                kind: "ClusterRole",
                name,
            },
            subjects: vec![subject_manifest(subject)],
        };
        manifests.push(to_yaml(&role));
        manifests.push(to_yaml(&binding));
    }

    for (namespace, scoped_rules) in &by_namespace {
        if namespace.is_empty() {
            // Cluster-wide usage: rendered above when the scope mode allows
            // it, otherwise it has no namespaced home and is omitted.
            continue;
        }
        let name = format!("rbacwatch-{slug}");
        let role = RoleManifest {
            api_version: RBAC_API_VERSION,
            kind: "Role",
            metadata: MetaManifest {
                name: name.clone(),
                namespace: Some(namespace.clone()),
                labels: labels(source_name),
            },
            rules: merge_rules(scoped_rules, merge, wildcards),
        };
        let binding = BindingManifest {
            api_version: RBAC_API_VERSION,
            kind: "RoleBinding",
            metadata: MetaManifest {
                name: name.clone(),
                namespace: Some(namespace.clone()),
                labels: labels(source_name),
            },
            role_ref: RoleRefManifest {
                api_group: RBAC_API_GROUP,
                kind: "Role",
                name,
            },
            subjects: vec![subject_manifest(subject)],
        };
        manifests.push(to_yaml(&role));
        manifests.push(to_yaml(&binding));
    }

    manifests
}

fn to_yaml<T: Serialize>(value: &T) -> String {
    // Rendering a struct we just built cannot fail; keep the signature
    // infallible for callers.
    serde_yaml::to_string(value).unwrap_or_default()
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};

    use crate::crd::{PolicyStrategy, ScopeMode, VerbMerge, WildcardPolicy};
    use crate::rule::CanonicalRule;

    fn ts() -> DateTime<Utc> {
        "2026-03-01T10:00:00Z".parse().expect("valid timestamp")
    }

    fn observed(verb: &str, resource: &str, ns: &str) -> ObservedRule {
        ObservedRule::first(
            &CanonicalRule {
                api_group: String::new(),
                resource: resource.to_string(),
                verb: verb.to_string(),
                non_resource_url: String::new(),
                namespace: ns.to_string(),
            },
            ts(),
        )
    }

    fn observed_url(verb: &str, url: &str) -> ObservedRule {
        ObservedRule::first(
            &CanonicalRule {
                verb: verb.to_string(),
                non_resource_url: url.to_string(),
                ..Default::default()
            },
            ts(),
        )
    }

    fn strategy(scope: ScopeMode, merge: VerbMerge, wildcards: WildcardPolicy) -> PolicyStrategy {
        PolicyStrategy {
            scope_mode: Some(scope),
            verb_merge: Some(merge),
            wildcards: Some(wildcards),
        }
    }

    fn subject() -> Subject {
        Subject::ServiceAccount {
            namespace: "prod".to_string(),
            name: "backend".to_string(),
        }
    }

    fn default_strategy() -> PolicyStrategy {
        strategy(ScopeMode::NamespaceStrict, VerbMerge::Smart, WildcardPolicy::Forbidden)
    }

    // ── scope modes ──

    #[test]
    fn test_strict_one_role_per_namespace() {
        let rules = [
            observed("get", "pods", "prod"),
            observed("list", "services", "prod"),
            observed("get", "pods", "staging"),
        ];
        let manifests = render_manifests("src", &subject(), &rules, &default_strategy());
        // Role + RoleBinding per namespace.
        assert_eq!(manifests.len(), 4);
        assert!(manifests[0].contains("kind: Role\n"));
        assert!(manifests[0].contains("namespace: prod"));
        assert!(manifests[1].contains("kind: RoleBinding"));
        assert!(manifests[2].contains("namespace: staging"));
    }

    #[test]
    fn test_strict_omits_cluster_scope_rules() {
        let rules = [observed("get", "nodes", ""), observed("get", "pods", "prod")];
        let manifests = render_manifests("src", &subject(), &rules, &default_strategy());
        assert_eq!(manifests.len(), 2);
        assert!(!manifests.iter().any(|m| m.contains("ClusterRole")));
        assert!(!manifests.iter().any(|m| m.contains("nodes")));
    }

    #[test]
    fn test_cluster_scope_allowed_emits_cluster_role() {
        let rules = [observed("get", "nodes", ""), observed("get", "pods", "prod")];
        let s = strategy(
            ScopeMode::ClusterScopeAllowed,
            VerbMerge::Smart,
            WildcardPolicy::Forbidden,
        );
        let manifests = render_manifests("src", &subject(), &rules, &s);
        assert_eq!(manifests.len(), 4);
        assert!(manifests[0].contains("kind: ClusterRole\n"));
        assert!(manifests[0].contains("nodes"));
        assert!(manifests[1].contains("kind: ClusterRoleBinding"));
        assert!(manifests[2].contains("kind: Role\n"));
    }

    #[test]
    fn test_non_resource_rules_render_in_cluster_role() {
        let rules = [observed_url("get", "/healthz")];
        let s = strategy(
            ScopeMode::ClusterScopeAllowed,
            VerbMerge::Smart,
            WildcardPolicy::Forbidden,
        );
        let manifests = render_manifests("src", &subject(), &rules, &s);
        assert!(manifests[0].contains("nonResourceURLs"));
        assert!(manifests[0].contains("/healthz"));
        assert!(!manifests[0].contains("apiGroups"));
    }

    // ── verb merging ──

    #[test]
    fn test_smart_merge_unions_verbs() {
        let rules = [
            observed("get", "pods", "prod"),
            observed("list", "pods", "prod"),
            observed("watch", "pods", "prod"),
        ];
        let manifests = render_manifests("src", &subject(), &rules, &default_strategy());
        let role = &manifests[0];
        assert_eq!(role.matches("- pods").count(), 1, "one merged rule:\n{role}");
        assert!(role.contains("- get"));
        assert!(role.contains("- list"));
        assert!(role.contains("- watch"));
    }

    #[test]
    fn test_exact_merge_one_rule_per_verb() {
        let rules = [
            observed("get", "pods", "prod"),
            observed("list", "pods", "prod"),
        ];
        let s = strategy(ScopeMode::NamespaceStrict, VerbMerge::Exact, WildcardPolicy::Forbidden);
        let manifests = render_manifests("src", &subject(), &rules, &s);
        let role = &manifests[0];
        assert_eq!(role.matches("- pods").count(), 2, "one rule per verb:\n{role}");
    }

    #[test]
    fn test_smart_merge_keeps_namespaces_apart() {
        let rules = [
            observed("get", "pods", "prod"),
            observed("list", "pods", "staging"),
        ];
        let manifests = render_manifests("src", &subject(), &rules, &default_strategy());
        assert_eq!(manifests.len(), 4, "no cross-namespace merge");
    }

    // ── wildcards ──

    fn all_standard(ns: &str) -> Vec<ObservedRule> {
        STANDARD_VERBS.iter().map(|v| observed(v, "pods", ns)).collect()
    }

    #[test]
    fn test_safe_wildcard_collapses_full_verb_set() {
        let rules = all_standard("default");
        let s = strategy(ScopeMode::NamespaceStrict, VerbMerge::Smart, WildcardPolicy::Safe);
        let manifests = render_manifests("src", &subject(), &rules, &s);
        let role = &manifests[0];
        assert!(role.contains("- '*'"), "verb list collapsed:\n{role}");
        assert!(!role.contains("- get"));
    }

    #[test]
    fn test_safe_wildcard_requires_all_eight() {
        let mut rules = all_standard("default");
        rules.pop();
        let s = strategy(ScopeMode::NamespaceStrict, VerbMerge::Smart, WildcardPolicy::Safe);
        let manifests = render_manifests("src", &subject(), &rules, &s);
        assert!(!manifests[0].contains('*'), "seven verbs must not collapse");
    }

    #[test]
    fn test_forbidden_never_emits_wildcard() {
        let rules = all_standard("default");
        let manifests = render_manifests("src", &subject(), &rules, &default_strategy());
        for m in &manifests {
            assert!(!m.contains('*'), "wildcard leaked into:\n{m}");
        }
        // The merged list carries all eight verbs instead.
        assert!(manifests[0].contains("- deletecollection"));
    }

    #[test]
    fn test_safe_collapse_applies_under_exact_merge() {
        // The collapse keys on the complete observed verb set for the
        // (apiGroups, resources, namespace), regardless of merge mode.
        let rules = all_standard("default");
        let s = strategy(ScopeMode::NamespaceStrict, VerbMerge::Exact, WildcardPolicy::Safe);
        let manifests = render_manifests("src", &subject(), &rules, &s);
        let role = &manifests[0];
        assert_eq!(role.matches("- pods").count(), 1);
        assert!(role.contains("- '*'"));
    }

    // ── determinism ──

    #[test]
    fn test_rendering_is_deterministic() {
        let rules = [
            observed("get", "pods", "prod"),
            observed("list", "services", "prod"),
            observed("delete", "deployments", "staging"),
            observed_url("get", "/metrics"),
        ];
        let s = strategy(ScopeMode::ClusterScopeAllowed, VerbMerge::Smart, WildcardPolicy::Safe);
        let a = render_manifests("src", &subject(), &rules, &s);
        let b = render_manifests("src", &subject(), &rules, &s);
        assert_eq!(a, b, "byte-identical across runs");
    }

    #[test]
    fn test_verb_order_is_standard_then_alphabetical() {
        let rules = [
            observed("deletecollection", "pods", "prod"),
            observed("impersonate", "pods", "prod"),
            observed("approve", "pods", "prod"),
            observed("get", "pods", "prod"),
        ];
        let manifests = render_manifests("src", &subject(), &rules, &default_strategy());
        let role = &manifests[0];
        let get = role.find("- get").expect("get present");
        let dc = role.find("- deletecollection").expect("deletecollection present");
        let approve = role.find("- approve").expect("approve present");
        let impersonate = role.find("- impersonate").expect("impersonate present");
        assert!(get < dc, "standard verbs keep conventional order");
        assert!(dc < approve, "custom verbs follow standard ones");
        assert!(approve < impersonate, "custom verbs alphabetical");
    }

    // ── binding content ──

    #[test]
    fn test_binding_references_role_and_subject() {
        let rules = [observed("get", "pods", "prod")];
        let manifests = render_manifests("audit-src", &subject(), &rules, &default_strategy());
        let binding = &manifests[1];
        assert!(binding.contains("kind: RoleBinding"));
        assert!(binding.contains("name: rbacwatch-sa-prod-backend"));
        assert!(binding.contains("kind: ServiceAccount"));
        assert!(binding.contains("name: backend"));
        assert!(binding.contains("namespace: prod"));
        assert!(binding.contains("rbacwatch.io/source: audit-src"));
    }

    #[test]
    fn test_user_subject_carries_rbac_api_group() {
        let rules = [observed("get", "pods", "prod")];
        let user = Subject::User("alice".to_string());
        let manifests = render_manifests("src", &user, &rules, &default_strategy());
        let binding = &manifests[1];
        assert!(binding.contains("kind: User"));
        assert!(binding.contains("apiGroup: rbac.authorization.k8s.io"));
    }

    #[test]
    fn test_empty_rules_render_nothing() {
        let manifests = render_manifests("src", &subject(), &[], &default_strategy());
        assert!(manifests.is_empty());
    }
}
