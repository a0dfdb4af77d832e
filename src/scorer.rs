use std::collections::BTreeSet;

use crate::crd::SeverityBand;
use crate::resolver::GrantedRule;
use crate::rule::ObservedRule;

/* ============================= ATOMS ============================= */

/// One fully-expanded permission: the unit of comparison between observed
/// usage and granted rules. Non-resource permissions carry the URL in the
/// resource slot with an empty group and namespace.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RuleAtom {
    pub api_group: String,
    pub resource: String,
    pub verb: String,
    pub namespace: String,
}

/// The distinct values observed per dimension. Wildcards and cluster-wide
/// namespaces in granted rules expand over these sets, so a broad grant is
/// measured against what was actually used.
#[derive(Debug, Default)]
struct ObservedDimensions {
    api_groups: BTreeSet<String>,
    resources: BTreeSet<String>,
    urls: BTreeSet<String>,
    verbs: BTreeSet<String>,
    namespaces: BTreeSet<String>,
}

/* ============================= EXPANSION ============================= */

/// Expand observed rules into their atom set. Observed rules never contain
/// wildcards — they come from concrete events.
pub fn expand_observed(rules: &[ObservedRule]) -> BTreeSet<RuleAtom> {
    let mut atoms = BTreeSet::new();
    for rule in rules {
        for verb in &rule.verbs {
            for url in &rule.non_resource_urls {
                atoms.insert(RuleAtom {
                    api_group: String::new(),
                    resource: url.clone(),
                    verb: verb.clone(),
                    namespace: String::new(),
                });
            }
            for (i, resource) in rule.resources.iter().enumerate() {
                let api_group = rule.api_groups.get(i).or(rule.api_groups.first());
                atoms.insert(RuleAtom {
                    api_group: api_group.cloned().unwrap_or_default(),
                    resource: resource.clone(),
                    verb: verb.clone(),
                    namespace: rule.namespace.clone(),
                });
            }
        }
    }
    atoms
}

fn observed_dimensions(atoms: &BTreeSet<RuleAtom>) -> ObservedDimensions {
    let mut dims = ObservedDimensions::default();
    for atom in atoms {
        if atom.resource.starts_with('/') {
            dims.urls.insert(atom.resource.clone());
        } else {
            dims.api_groups.insert(atom.api_group.clone());
            dims.resources.insert(atom.resource.clone());
            dims.namespaces.insert(atom.namespace.clone());
        }
        dims.verbs.insert(atom.verb.clone());
    }
    dims
}

fn expand_values(values: &[String], observed: &BTreeSet<String>) -> Vec<String> {
    if values.iter().any(|v| v == "*") {
        observed.iter().cloned().collect()
    } else {
        values.to_vec()
    }
}

/// Expand granted rules into atoms, bounding every wildcard dimension by
/// the observed value-set.
fn expand_granted(granted: &[GrantedRule], dims: &ObservedDimensions) -> BTreeSet<RuleAtom> {
    let mut atoms = BTreeSet::new();
    for g in granted {
        let verbs = expand_values(&g.rule.verbs, &dims.verbs);

        if let Some(resources) = &g.rule.resources {
            let groups = match &g.rule.api_groups {
                Some(groups) => expand_values(groups, &dims.api_groups),
                None => vec![String::new()],
            };
            let resources = expand_values(resources, &dims.resources);
            let namespaces: Vec<String> = if g.namespace.is_empty() {
                dims.namespaces.iter().cloned().collect()
            } else {
                vec![g.namespace.clone()]
            };
            for group in &groups {
                for resource in &resources {
                    for verb in &verbs {
                        for namespace in &namespaces {
                            atoms.insert(RuleAtom {
                                api_group: group.clone(),
                                resource: resource.clone(),
                                verb: verb.clone(),
                                namespace: namespace.clone(),
                            });
                        }
                    }
                }
            }
        }

        if let Some(urls) = &g.rule.non_resource_urls {
            let urls = expand_values(urls, &dims.urls);
            for url in &urls {
                for verb in &verbs {
                    atoms.insert(RuleAtom {
                        api_group: String::new(),
                        resource: url.clone(),
                        verb: verb.clone(),
                        namespace: String::new(),
                    });
                }
            }
        }
    }
    atoms
}

/* ============================= SENSITIVE SET ============================= */

/// Resources whose unused grants flag a report as sensitive.
pub const DEFAULT_SENSITIVE_RESOURCES: &[&str] = &[
    "secrets",
    "nodes",
    "mutatingwebhookconfigurations",
    "validatingwebhookconfigurations",
    "customresourcedefinitions",
    "tokenreviews",
    "certificatesigningrequests",
    "clusterroles",
    "clusterrolebindings",
    "roles",
    "rolebindings",
    "pods/exec",
    "serviceaccounts/token",
];

pub fn default_sensitive_set() -> BTreeSet<String> {
    DEFAULT_SENSITIVE_RESOURCES
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn is_sensitive(atom: &RuleAtom, sensitive: &BTreeSet<String>) -> bool {
    if sensitive.contains(&atom.resource) {
        return true;
    }
    let base = atom.resource.split('/').next().unwrap_or(&atom.resource);
    sensitive.contains(base)
}

/* ============================= SCORING ============================= */

#[derive(Debug, Clone, PartialEq)]
pub struct Compliance {
    pub score: u32,
    pub severity: SeverityBand,
    pub needed: u32,
    pub excess: u32,
    pub ungranted: u32,
    pub excess_atoms: Vec<RuleAtom>,
    pub sensitive: bool,
}

pub fn severity_band(score: u32) -> SeverityBand {
    match score {
        76..=100 => SeverityBand::Green,
        34..=75 => SeverityBand::Yellow,
        _ => SeverityBand::Red,
    }
}

/// Compare observed usage against granted permissions for one subject.
pub fn score_subject(
    observed: &[ObservedRule],
    granted: &[GrantedRule],
    sensitive: &BTreeSet<String>,
) -> Compliance {
    let observed_atoms = expand_observed(observed);
    let dims = observed_dimensions(&observed_atoms);
    let granted_atoms = expand_granted(granted, &dims);

    let needed = observed_atoms.intersection(&granted_atoms).count() as u32;
    let ungranted = observed_atoms.difference(&granted_atoms).count() as u32;
    let excess_atoms: Vec<RuleAtom> = granted_atoms.difference(&observed_atoms).cloned().collect();
    let excess = excess_atoms.len() as u32;

    let granted_total = granted_atoms.len() as u32;
    let score = if granted_total == 0 {
        if observed_atoms.is_empty() { 100 } else { 0 }
    } else {
        (needed * 100 + granted_total / 2) / granted_total
    };

    let sensitive_flag = excess_atoms.iter().any(|a| is_sensitive(a, sensitive));

    Compliance {
        score,
        severity: severity_band(score),
        needed,
        excess,
        ungranted,
        excess_atoms,
        sensitive: sensitive_flag,
    }
}

/* ============================= TESTS ============================= */
