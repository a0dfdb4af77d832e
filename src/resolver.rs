use std::collections::HashMap;

use anyhow::Result;
use k8s_openapi::api::rbac::v1::{
    ClusterRole, ClusterRoleBinding, PolicyRule, Role, RoleBinding, Subject as RbacSubject,
};
use kube::api::ListParams;
use kube::{Api, Client};
use tracing::debug;

use crate::subject::Subject;

/* ============================= TYPES ============================= */

/// One rule the binding graph currently grants, annotated with the
/// namespace in which it applies (empty = cluster-wide).
#[derive(Debug, Clone, PartialEq)]
pub struct GrantedRule {
    pub namespace: String,
    pub rule: PolicyRule,
}

/* ============================= SUBJECT MATCH ============================= */

/// Whether a binding's subject entry refers to the target.
///
/// Kind and name must match; service accounts additionally match on the
/// entry's namespace. Group entries only ever match a Group target — group
/// membership is never inferred.
pub fn subject_entry_matches(entry: &RbacSubject, target: &Subject) -> bool {
    match target {
        Subject::ServiceAccount { namespace, name } => {
            entry.kind == "ServiceAccount"
                && entry.name == *name
                && entry.namespace.as_deref() == Some(namespace.as_str())
        }
        Subject::User(name) => entry.kind == "User" && entry.name == *name,
        Subject::Group(name) => entry.kind == "Group" && entry.name == *name,
    }
}

fn binding_matches(subjects: Option<&Vec<RbacSubject>>, target: &Subject) -> bool {
    subjects
        .map(|list| list.iter().any(|s| subject_entry_matches(s, target)))
        .unwrap_or(false)
}

/* ============================= GRAPH WALK ============================= */

/// Reconstruct the granted rules for `target` from pre-listed bindings and
/// role lookup tables.
///
/// Cluster-scope bindings emit rules with an empty namespace; namespace
/// bindings emit rules carrying the binding's namespace, including when the
/// binding references a ClusterRole. A referenced role that cannot be found
/// is skipped — a deleted role is not a fatal condition. Label-aggregated
/// ClusterRoles are taken as written; their aggregation is not expanded.
pub fn grants_for_subject(
    cluster_bindings: &[ClusterRoleBinding],
    role_bindings: &[RoleBinding],
    cluster_roles: &HashMap<String, ClusterRole>,
    roles: &HashMap<(String, String), Role>,
    target: &Subject,
) -> Vec<GrantedRule> {
    let mut granted = Vec::new();

    for binding in cluster_bindings {
        if !binding_matches(binding.subjects.as_ref(), target) {
            continue;
        }
        let Some(role) = cluster_roles.get(&binding.role_ref.name) else {
            debug!(
                role = %binding.role_ref.name,
                "cluster role referenced by binding not found, skipping"
            );
            continue;
        };
        for rule in role.rules.iter().flatten() {
            granted.push(GrantedRule {
                namespace: String::new(),
                rule: rule.clone(),
            });
        }
    }

    for binding in role_bindings {
        if !binding_matches(binding.subjects.as_ref(), target) {
            continue;
        }
        let namespace = binding.metadata.namespace.clone().unwrap_or_default();
        let rules: Option<&Vec<PolicyRule>> = match binding.role_ref.kind.as_str() {
            "ClusterRole" => cluster_roles
                .get(&binding.role_ref.name)
                .and_then(|r| r.rules.as_ref()),
            "Role" => roles
                .get(&(namespace.clone(), binding.role_ref.name.clone()))
                .and_then(|r| r.rules.as_ref()),
            _ => None,
        };
        let Some(rules) = rules else {
            debug!(
                role = %binding.role_ref.name,
                kind = %binding.role_ref.kind,
                namespace = %namespace,
                "role referenced by binding not found, skipping"
            );
            continue;
        };
        for rule in rules {
            granted.push(GrantedRule {
                namespace: namespace.clone(),
                rule: rule.clone(),
            });
        }
    }

    granted
}

/* ============================= CLUSTER READ ============================= */

/// List the binding graph through the (substrate-cached) client and walk it.
pub async fn resolve_effective(client: &Client, target: &Subject) -> Result<Vec<GrantedRule>> {
    let lp = ListParams::default();

    let cluster_bindings: Api<ClusterRoleBinding> = Api::all(client.clone());
    let role_bindings: Api<RoleBinding> = Api::all(client.clone());
    let cluster_roles_api: Api<ClusterRole> = Api::all(client.clone());
    let roles_api: Api<Role> = Api::all(client.clone());

    let (cluster_bindings, role_bindings, cluster_roles, roles) = tokio::try_join!(
        cluster_bindings.list(&lp),
        role_bindings.list(&lp),
        cluster_roles_api.list(&lp),
        roles_api.list(&lp),
    )?;

    let cluster_roles: HashMap<String, ClusterRole> = cluster_roles
        .items
        .into_iter()
        .filter_map(|r| r.metadata.name.clone().map(|name| (name, r)))
        .collect();
    let roles: HashMap<(String, String), Role> = roles
        .items
        .into_iter()
        .filter_map(|r| {
            let ns = r.metadata.namespace.clone()?;
            let name = r.metadata.name.clone()?;
            Some(((ns, name), r))
        })
        .collect();

    Ok(grants_for_subject(
        &cluster_bindings.items,
        &role_bindings.items,
        &cluster_roles,
        &roles,
        target,
    ))
}

/* ============================= TESTS ============================= */
