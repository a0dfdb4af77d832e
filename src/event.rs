use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/* ============================= WIRE TYPES ============================= */

/// The apiserver audit stage at which request processing has completed.
///
/// Aggregating any other stage would count the same request twice.
pub const STAGE_RESPONSE_COMPLETE: &str = "ResponseComplete";

/// One record from the cluster audit stream.
///
/// Mirrors the `audit.k8s.io/v1` Event schema, keeping only the fields the
/// pipeline reads. Unknown fields are ignored on deserialization.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,

    #[serde(rename = "auditID", default)]
    pub audit_id: String,

    #[serde(default)]
    pub stage: String,

    #[serde(rename = "requestURI", default)]
    pub request_uri: String,

    #[serde(default)]
    pub verb: String,

    #[serde(default)]
    pub user: UserInfo,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_ref: Option<ObjectReference>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_received_timestamp: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_timestamp: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// The authenticated principal recorded on an event.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    #[serde(default)]
    pub username: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<String>,
}

/// The API object a resource request addressed.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectReference {
    #[serde(default)]
    pub api_group: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_version: String,

    #[serde(default)]
    pub resource: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub subresource: String,

    #[serde(default)]
    pub namespace: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
}

/// The audit-webhook envelope the apiserver posts: a list of events.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventList {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,

    #[serde(default)]
    pub items: Vec<AuditEvent>,
}

/* ============================= ACCESSORS ============================= */

impl AuditEvent {
    /// The event's observation time: the stage timestamp when present,
    /// otherwise the request-received timestamp.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.stage_timestamp.or(self.request_received_timestamp)
    }

    /// Whether this event should enter the aggregation pipeline.
    ///
    /// An empty stage is tolerated so that pre-filtered streams (cloud
    /// exports that strip the field) still flow through.
    pub fn is_aggregatable_stage(&self) -> bool {
        self.stage.is_empty() || self.stage == STAGE_RESPONSE_COMPLETE
    }
}

/* ============================= TESTS ============================= */
