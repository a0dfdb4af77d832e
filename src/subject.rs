use serde::{Deserialize, Serialize};

/* ============================= TYPES ============================= */

/// Username prefix the apiserver assigns to service-account tokens.
pub const SERVICE_ACCOUNT_PREFIX: &str = "system:serviceaccount:";

/// The principal a report is keyed by.
///
/// Equality is structural and case-sensitive. Ordering is derived so report
/// iteration over a subject map is deterministic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Subject {
    ServiceAccount { namespace: String, name: String },
    User(String),
    Group(String),
}

impl Subject {
    pub fn kind(&self) -> &'static str {
        match self {
            Subject::ServiceAccount { .. } => "ServiceAccount",
            Subject::User(_) => "User",
            Subject::Group(_) => "Group",
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Subject::ServiceAccount { name, .. } => name,
            Subject::User(name) | Subject::Group(name) => name,
        }
    }

    pub fn namespace(&self) -> Option<&str> {
        match self {
            Subject::ServiceAccount { namespace, .. } => Some(namespace),
            _ => None,
        }
    }

    /// A DNS-1123-safe slug used in report object names.
    pub fn slug(&self) -> String {
        let raw = match self {
            Subject::ServiceAccount { namespace, name } => format!("sa-{namespace}-{name}"),
            Subject::User(name) => format!("user-{name}"),
            Subject::Group(name) => format!("group-{name}"),
        };
        let mut slug: String = raw
            .to_lowercase()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect();
        while slug.contains("--") {
            slug = slug.replace("--", "-");
        }
        slug.trim_matches('-').chars().take(48).collect()
    }
}

impl std::fmt::Display for Subject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Subject::ServiceAccount { namespace, name } => {
                write!(f, "ServiceAccount {namespace}/{name}")
            }
            Subject::User(name) => write!(f, "User {name}"),
            Subject::Group(name) => write!(f, "Group {name}"),
        }
    }
}

/* ============================= NORMALIZATION ============================= */

/// Canonicalize an audit-event username into a `Subject`.
///
/// `system:serviceaccount:NS:NAME` splits on the first colon after the
/// prefix, so a service-account name containing colons survives intact.
/// Other `system:` principals are dropped when `ignore_system_users` is set;
/// everything else is a `User`.
pub fn normalize_username(username: &str, ignore_system_users: bool) -> Option<Subject> {
    if let Some(rest) = username.strip_prefix(SERVICE_ACCOUNT_PREFIX)
        && let Some((namespace, name)) = rest.split_once(':')
        && !namespace.is_empty()
        && !name.is_empty()
    {
        return Some(Subject::ServiceAccount {
            namespace: namespace.to_string(),
            name: name.to_string(),
        });
    }

    if username.starts_with("system:") && ignore_system_users {
        return None;
    }

    Some(Subject::User(username.to_string()))
}

/* ============================= TESTS ============================= */
