use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::AuditEvent;

/* ============================= GROUP MIGRATION ============================= */

/// Deprecated API-group aliases collapsed into their successor groups.
///
/// Keyed by `(legacy group, resource)`; a resource-less entry (`""`) is the
/// fallback for the group. Migration applies to resource rules only — a
/// non-resource URL carries no API group to migrate.
const GROUP_MIGRATIONS: &[(&str, &str, &str)] = &[
    ("extensions", "ingresses", "networking.k8s.io"),
    ("extensions", "networkpolicies", "networking.k8s.io"),
    ("extensions", "podsecuritypolicies", "policy"),
    ("extensions", "", "apps"),
];

/// Map a legacy API group to its current home for the given resource.
pub fn migrate_api_group(api_group: &str, resource: &str) -> String {
    let base = resource.split('/').next().unwrap_or(resource);
    for (group, res, target) in GROUP_MIGRATIONS {
        if *group == api_group && (*res == base || res.is_empty()) {
            return (*target).to_string();
        }
    }
    api_group.to_string()
}

/* ============================= CANONICAL RULE ============================= */

/// The normalized deduplication key derived from one audit event.
///
/// Exactly one of `resource` / `non_resource_url` is non-empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CanonicalRule {
    pub api_group: String,
    pub resource: String,
    pub verb: String,
    pub non_resource_url: String,
    pub namespace: String,
}

impl CanonicalRule {
    pub fn is_non_resource(&self) -> bool {
        !self.non_resource_url.is_empty()
    }
}

/// Derive the canonical rule for an event, or `None` when the event names
/// neither an API object nor a request URI (nothing to aggregate).
pub fn normalize_event(event: &AuditEvent) -> Option<CanonicalRule> {
    if event.verb.is_empty() {
        return None;
    }

    if let Some(obj) = &event.object_ref
        && !obj.resource.is_empty()
    {
        let resource = if obj.subresource.is_empty() {
            obj.resource.clone()
        } else {
            format!("{}/{}", obj.resource, obj.subresource)
        };
        return Some(CanonicalRule {
            api_group: migrate_api_group(&obj.api_group, &obj.resource),
            resource,
            verb: event.verb.clone(),
            non_resource_url: String::new(),
            namespace: obj.namespace.clone(),
        });
    }

    if !event.request_uri.is_empty() {
        // Strip the query string; it is request detail, not identity.
        let url = event
            .request_uri
            .split('?')
            .next()
            .unwrap_or(&event.request_uri)
            .to_string();
        return Some(CanonicalRule {
            api_group: String::new(),
            resource: String::new(),
            verb: event.verb.clone(),
            non_resource_url: url,
            namespace: String::new(),
        });
    }

    None
}

/* ============================= OBSERVED RULE ============================= */

/// Aggregation state for one canonical rule.
///
/// The list fields always hold exactly one element (the key dimensions);
/// they are lists so the shape matches RBAC policy rules downstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedRule {
    pub api_groups: Vec<String>,
    pub resources: Vec<String>,
    pub non_resource_urls: Vec<String>,
    pub verbs: Vec<String>,
    pub namespace: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub count: u64,
}

impl ObservedRule {
    /// Initial state for a rule observed once at `timestamp`.
    pub fn first(key: &CanonicalRule, timestamp: DateTime<Utc>) -> Self {
        let (api_groups, resources, non_resource_urls) = if key.is_non_resource() {
            (Vec::new(), Vec::new(), vec![key.non_resource_url.clone()])
        } else {
            (vec![key.api_group.clone()], vec![key.resource.clone()], Vec::new())
        };
        ObservedRule {
            api_groups,
            resources,
            non_resource_urls,
            verbs: vec![key.verb.clone()],
            namespace: key.namespace.clone(),
            first_seen: timestamp,
            last_seen: timestamp,
            count: 1,
        }
    }

    /// Record one more observation.
    ///
    /// Callers are contracted to deliver events in chronological order;
    /// `last_seen` is overwritten unconditionally.
    pub fn merge(&mut self, timestamp: DateTime<Utc>) {
        self.count += 1;
        self.last_seen = timestamp;
        if timestamp < self.first_seen {
            self.first_seen = timestamp;
        }
    }

    /// The deterministic snapshot ordering: namespace, first API group,
    /// first resource (or non-resource URL), first verb.
    pub fn sort_key(&self) -> (String, String, String, String) {
        let resource = self
            .resources
            .first()
            .or_else(|| self.non_resource_urls.first())
            .cloned()
            .unwrap_or_default();
        (
            self.namespace.clone(),
            self.api_groups.first().cloned().unwrap_or_default(),
            resource,
            self.verbs.first().cloned().unwrap_or_default(),
        )
    }
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ObjectReference;

    fn resource_event(verb: &str, group: &str, resource: &str, sub: &str, ns: &str) -> AuditEvent {
        AuditEvent {
            verb: verb.to_string(),
            object_ref: Some(ObjectReference {
                api_group: group.to_string(),
                resource: resource.to_string(),
                subresource: sub.to_string(),
                namespace: ns.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn ts(s: &str) -> DateTime<Utc> {
        s.parse().expect("valid RFC3339 timestamp")
    }

    // ── group migration ──

    #[test]
    fn test_migrate_extensions_deployments_to_apps() {
        assert_eq!(migrate_api_group("extensions", "deployments"), "apps");
        assert_eq!(migrate_api_group("extensions", "daemonsets"), "apps");
        assert_eq!(migrate_api_group("extensions", "replicasets"), "apps");
    }

    #[test]
    fn test_migrate_extensions_ingresses_to_networking() {
        assert_eq!(migrate_api_group("extensions", "ingresses"), "networking.k8s.io");
        assert_eq!(
            migrate_api_group("extensions", "networkpolicies"),
            "networking.k8s.io"
        );
    }

    #[test]
    fn test_migrate_leaves_current_groups_alone() {
        assert_eq!(migrate_api_group("apps", "deployments"), "apps");
        assert_eq!(migrate_api_group("", "pods"), "");
        assert_eq!(migrate_api_group("batch", "jobs"), "batch");
    }

    #[test]
    fn test_migrate_uses_base_resource_for_subresources() {
        assert_eq!(migrate_api_group("extensions", "deployments/scale"), "apps");
    }

    // ── normalization ──

    #[test]
    fn test_normalize_resource_event() {
        let ev = resource_event("get", "", "pods", "", "prod");
        let rule = normalize_event(&ev).expect("should normalize");
        assert_eq!(rule.api_group, "");
        assert_eq!(rule.resource, "pods");
        assert_eq!(rule.verb, "get");
        assert_eq!(rule.namespace, "prod");
        assert!(rule.non_resource_url.is_empty());
        assert!(!rule.is_non_resource());
    }

    #[test]
    fn test_normalize_subresource_is_concatenated_not_split() {
        let ev = resource_event("create", "", "pods", "exec", "default");
        let rule = normalize_event(&ev).expect("should normalize");
        assert_eq!(rule.resource, "pods/exec");
    }

    #[test]
    fn test_normalize_applies_group_migration() {
        let ev = resource_event("list", "extensions", "deployments", "", "default");
        let rule = normalize_event(&ev).expect("should normalize");
        assert_eq!(rule.api_group, "apps");
        assert_eq!(rule.resource, "deployments");
    }

    #[test]
    fn test_normalize_non_resource_event() {
        let ev = AuditEvent {
            verb: "get".to_string(),
            request_uri: "/healthz?verbose=1".to_string(),
            ..Default::default()
        };
        let rule = normalize_event(&ev).expect("should normalize");
        assert!(rule.is_non_resource());
        assert_eq!(rule.non_resource_url, "/healthz");
        assert_eq!(rule.api_group, "");
        assert_eq!(rule.resource, "");
        assert_eq!(rule.namespace, "");
    }

    #[test]
    fn test_normalize_no_migration_on_non_resource_path() {
        // An event with no object reference never gains an API group,
        // even if the URI happens to mention a legacy group.
        let ev = AuditEvent {
            verb: "get".to_string(),
            request_uri: "/apis/extensions/v1beta1".to_string(),
            ..Default::default()
        };
        let rule = normalize_event(&ev).expect("should normalize");
        assert_eq!(rule.api_group, "");
        assert_eq!(rule.non_resource_url, "/apis/extensions/v1beta1");
    }

    #[test]
    fn test_normalize_rejects_verbless_event() {
        let mut ev = resource_event("get", "", "pods", "", "prod");
        ev.verb = String::new();
        assert_eq!(normalize_event(&ev), None);
    }

    #[test]
    fn test_normalize_rejects_empty_event() {
        assert_eq!(
            normalize_event(&AuditEvent {
                verb: "get".to_string(),
                ..Default::default()
            }),
            None
        );
    }

    #[test]
    fn test_normalize_exactly_one_side_set() {
        let resource = normalize_event(&resource_event("get", "", "pods", "", "ns")).unwrap();
        assert!(!resource.resource.is_empty() && resource.non_resource_url.is_empty());

        let ev = AuditEvent {
            verb: "get".to_string(),
            request_uri: "/version".to_string(),
            ..Default::default()
        };
        let non_resource = normalize_event(&ev).unwrap();
        assert!(non_resource.resource.is_empty() && !non_resource.non_resource_url.is_empty());
    }

    // ── observed rule ──

    #[test]
    fn test_observed_first() {
        let key = normalize_event(&resource_event("get", "", "pods", "", "prod")).unwrap();
        let r = ObservedRule::first(&key, ts("2026-03-01T10:00:00Z"));
        assert_eq!(r.api_groups, vec![""]);
        assert_eq!(r.resources, vec!["pods"]);
        assert_eq!(r.verbs, vec!["get"]);
        assert!(r.non_resource_urls.is_empty());
        assert_eq!(r.count, 1);
        assert_eq!(r.first_seen, r.last_seen);
    }

    #[test]
    fn test_observed_first_non_resource() {
        let key = CanonicalRule {
            verb: "get".to_string(),
            non_resource_url: "/healthz".to_string(),
            ..Default::default()
        };
        let r = ObservedRule::first(&key, ts("2026-03-01T10:00:00Z"));
        assert!(r.api_groups.is_empty());
        assert!(r.resources.is_empty());
        assert_eq!(r.non_resource_urls, vec!["/healthz"]);
    }

    #[test]
    fn test_observed_merge_updates_count_and_last_seen() {
        let key = normalize_event(&resource_event("get", "", "pods", "", "prod")).unwrap();
        let mut r = ObservedRule::first(&key, ts("2026-03-01T10:00:00Z"));
        r.merge(ts("2026-03-01T11:00:00Z"));
        r.merge(ts("2026-03-01T12:00:00Z"));
        assert_eq!(r.count, 3);
        assert_eq!(r.first_seen, ts("2026-03-01T10:00:00Z"));
        assert_eq!(r.last_seen, ts("2026-03-01T12:00:00Z"));
    }

    #[test]
    fn test_observed_first_seen_is_smallest() {
        // first_seen tracks the minimum even if a straggler arrives,
        // while last_seen stays the most recent add.
        let key = normalize_event(&resource_event("get", "", "pods", "", "prod")).unwrap();
        let mut r = ObservedRule::first(&key, ts("2026-03-01T10:00:00Z"));
        r.merge(ts("2026-03-01T09:00:00Z"));
        assert_eq!(r.first_seen, ts("2026-03-01T09:00:00Z"));
        assert_eq!(r.last_seen, ts("2026-03-01T09:00:00Z"));
    }

    #[test]
    fn test_sort_key_uses_non_resource_url_in_resource_slot() {
        let key = CanonicalRule {
            verb: "get".to_string(),
            non_resource_url: "/metrics".to_string(),
            ..Default::default()
        };
        let r = ObservedRule::first(&key, ts("2026-03-01T10:00:00Z"));
        assert_eq!(
            r.sort_key(),
            (String::new(), String::new(), "/metrics".to_string(), "get".to_string())
        );
    }
}
