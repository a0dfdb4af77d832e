#![allow(dead_code)]

use chrono::{DateTime, Utc};

use kube_rbac_watch::event::{AuditEvent, ObjectReference, UserInfo};

/// Build a resource audit event the way the apiserver emits them.
pub fn audit_event(
    audit_id: &str,
    username: &str,
    verb: &str,
    api_group: &str,
    resource: &str,
    subresource: &str,
    namespace: &str,
    timestamp: &str,
) -> AuditEvent {
    AuditEvent {
        audit_id: audit_id.to_string(),
        stage: "ResponseComplete".to_string(),
        verb: verb.to_string(),
        user: UserInfo {
            username: username.to_string(),
            ..Default::default()
        },
        object_ref: Some(ObjectReference {
            api_group: api_group.to_string(),
            resource: resource.to_string(),
            subresource: subresource.to_string(),
            namespace: namespace.to_string(),
            ..Default::default()
        }),
        stage_timestamp: Some(ts(timestamp)),
        ..Default::default()
    }
}

pub fn simple_event(username: &str, verb: &str, resource: &str, namespace: &str) -> AuditEvent {
    audit_event(
        &format!("{username}-{verb}-{resource}"),
        username,
        verb,
        "",
        resource,
        "",
        namespace,
        "2026-03-01T10:00:00Z",
    )
}

pub fn ts(s: &str) -> DateTime<Utc> {
    s.parse().expect("valid RFC3339 timestamp")
}
