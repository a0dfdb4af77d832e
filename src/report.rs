use anyhow::{Context, Result};
use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Patch, PatchParams, PostParams};
use kube::{Api, Client, Resource, ResourceExt};
use tracing::{debug, info, warn};

use crate::crd::{
    AuditSource, ComplianceStatus, ObservedRuleStatus, PolicyReport, PolicyReportSpec,
    PolicyReportStatus, RuleAtomStatus, SubjectRef, SuggestedPolicy,
};
use crate::metrics;
use crate::rule::ObservedRule;
use crate::scorer::Compliance;
use crate::subject::Subject;

const UPSERT_ATTEMPTS: usize = 3;
const FIELD_MANAGER: &str = "kube-rbac-watch";

/* ============================= NAMING ============================= */

/// FNV-1a over the subject's exact identity; the slug alone is lossy, so
/// the hash keeps distinct subjects from colliding on one report name.
fn fnv1a(input: &str) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in input.as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

pub fn report_name(source_name: &str, subject: &Subject) -> String {
    let hash = fnv1a(&format!("{subject}"));
    format!("{source_name}-{}-{hash:08x}", subject.slug())
}

/* ============================= RULE CAP ============================= */

/// Enforce the per-report rule cap by evicting the oldest rules first
/// (by `last_seen`, with the sort key as a deterministic tiebreak).
/// The surviving rules keep their snapshot order. Returns the eviction
/// count.
pub fn cap_rules(rules: &mut Vec<ObservedRule>, cap: usize) -> usize {
    if cap == 0 || rules.len() <= cap {
        return 0;
    }
    let excess = rules.len() - cap;

    let mut by_age: Vec<usize> = (0..rules.len()).collect();
    by_age.sort_by_key(|&i| (rules[i].last_seen, rules[i].sort_key()));
    let evict: std::collections::HashSet<usize> = by_age.into_iter().take(excess).collect();

    let mut index = 0;
    rules.retain(|_| {
        let keep = !evict.contains(&index);
        index += 1;
        keep
    });
    excess
}

/* ============================= STATUS ASSEMBLY ============================= */

pub fn subject_ref(subject: &Subject) -> SubjectRef {
    SubjectRef {
        kind: subject.kind().to_string(),
        name: subject.name().to_string(),
        namespace: subject.namespace().map(str::to_string),
    }
}

fn observed_rule_status(rule: &ObservedRule) -> ObservedRuleStatus {
    ObservedRuleStatus {
        api_groups: rule.api_groups.clone(),
        resources: rule.resources.clone(),
        non_resource_urls: rule.non_resource_urls.clone(),
        verbs: rule.verbs.clone(),
        namespace: rule.namespace.clone(),
        first_seen: rule.first_seen.to_rfc3339(),
        last_seen: rule.last_seen.to_rfc3339(),
        count: rule.count,
    }
}

fn compliance_status(compliance: &Compliance) -> ComplianceStatus {
    ComplianceStatus {
        score: compliance.score,
        severity: compliance.severity.clone(),
        needed: compliance.needed,
        excess: compliance.excess,
        ungranted: compliance.ungranted,
        excess_atoms: compliance
            .excess_atoms
            .iter()
            .map(|atom| RuleAtomStatus {
                api_group: atom.api_group.clone(),
                resource: atom.resource.clone(),
                verb: atom.verb.clone(),
                namespace: atom.namespace.clone(),
            })
            .collect(),
        sensitive: compliance.sensitive,
    }
}

pub fn build_status(
    rules: &[ObservedRule],
    manifests: Vec<String>,
    compliance: &Compliance,
) -> PolicyReportStatus {
    let audit_events = rules.iter().map(|r| r.count).sum();
    PolicyReportStatus {
        observed_rules: rules.iter().map(observed_rule_status).collect(),
        suggested_policy: Some(SuggestedPolicy { manifests }),
        compliance: Some(compliance_status(compliance)),
        audit_events: Some(audit_events),
        last_updated: Some(Utc::now().to_rfc3339()),
    }
}

/* ============================= UPSERT ============================= */

fn owner_reference(source: &AuditSource) -> Option<OwnerReference> {
    let uid = source.metadata.uid.clone()?;
    Some(OwnerReference {
        api_version: AuditSource::api_version(&()).to_string(),
        kind: AuditSource::kind(&()).to_string(),
        name: source.name_any(),
        uid,
        controller: Some(true),
        block_owner_deletion: None,
    })
}

/// Create or update the report for one subject.
///
/// The report is owned by its AuditSource, so deleting the source
/// garbage-collects every report it produced. Writes use optimistic
/// concurrency with bounded retries; losing all attempts is logged and
/// retried at the next flush.
pub async fn upsert_report(
    client: &Client,
    source: &AuditSource,
    subject: &Subject,
    status: PolicyReportStatus,
) -> Result<()> {
    let namespace = source.namespace().unwrap_or_else(|| "default".to_string());
    let source_name = source.name_any();
    let name = report_name(&source_name, subject);
    let api: Api<PolicyReport> = Api::namespaced(client.clone(), &namespace);

    for attempt in 1..=UPSERT_ATTEMPTS {
        let existing = api.get_opt(&name).await?;

        if existing.is_none() {
            let mut report = PolicyReport::new(
                &name,
                PolicyReportSpec {
                    source_name: source_name.clone(),
                    subject: subject_ref(subject),
                },
            );
            report.metadata.owner_references = owner_reference(source).map(|o| vec![o]);
            match api.create(&PostParams::default(), &report).await {
                Ok(_) => {
                    info!(report = %name, subject = %subject, "policy_report_created");
                }
                Err(kube::Error::Api(e)) if e.code == 409 => {
                    // Lost the creation race; re-read and patch.
                    debug!(report = %name, attempt, "policy_report_create_conflict");
                    continue;
                }
                Err(e) => return Err(e).context("creating policy report"),
            }
        }

        let patch = serde_json::json!({ "status": status });
        match api
            .patch_status(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => {
                metrics::REPORTS_UPSERTED
                    .with_label_values(&[&source_name])
                    .inc();
                return Ok(());
            }
            Err(kube::Error::Api(e)) if e.code == 409 => {
                warn!(report = %name, attempt, "policy_report_status_conflict");
                continue;
            }
            Err(e) => return Err(e).context("patching policy report status"),
        }
    }

    warn!(report = %name, "policy_report_upsert_retries_exhausted");
    Ok(())
}

/// Delete reports owned by this source whose subject has aged out of the
/// aggregator entirely (all rules expired under retention). `live` holds
/// the report names produced by the current flush.
pub async fn delete_stale_reports(
    client: &Client,
    source: &AuditSource,
    live: &std::collections::HashSet<String>,
) -> Result<usize> {
    let namespace = source.namespace().unwrap_or_else(|| "default".to_string());
    let source_name = source.name_any();
    let api: Api<PolicyReport> = Api::namespaced(client.clone(), &namespace);

    let mut deleted = 0;
    for report in api.list(&Default::default()).await?.items {
        if report.spec.source_name != source_name {
            continue;
        }
        let name = report.name_any();
        if live.contains(&name) {
            continue;
        }
        match api.delete(&name, &Default::default()).await {
            Ok(_) => {
                deleted += 1;
                info!(report = %name, source = %source_name, "stale_policy_report_deleted");
            }
            Err(kube::Error::Api(e)) if e.code == 404 => {}
            Err(e) => warn!(report = %name, error = %e, "stale_policy_report_delete_failed"),
        }
    }
    Ok(deleted)
}

/* ============================= TESTS ============================= */
