use serde_json::Value;
use tracing::debug;

use crate::event::AuditEvent;
use crate::ingest::cloud::EnvelopeParser;

/* ============================= SHARED ============================= */

/// Whether a deserialized object is plausibly an audit event rather than an
/// unrelated wrapper record that happened to deserialize.
fn looks_like_audit_event(event: &AuditEvent) -> bool {
    !event.verb.is_empty() || !event.audit_id.is_empty()
}

fn push_if_audit(out: &mut Vec<AuditEvent>, value: Value) {
    match serde_json::from_value::<AuditEvent>(value) {
        Ok(event) if looks_like_audit_event(&event) => out.push(event),
        Ok(_) => debug!("skipping record that is not an audit event"),
        Err(e) => debug!(error = %e, "skipping undecodable record"),
    }
}

/// Tolerant decoding shared by the providers: empty bodies, JSON arrays,
/// `items`-list envelopes, and single-event bodies all work.
fn parse_flexible(body: &[u8]) -> Result<Vec<AuditEvent>, serde_json::Error> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    let value: Value = serde_json::from_slice(body)?;
    let mut out = Vec::new();
    match value {
        Value::Array(elements) => {
            for element in elements {
                push_if_audit(&mut out, element);
            }
        }
        Value::Object(ref map) if map.contains_key("items") => {
            if let Some(Value::Array(elements)) = map.get("items") {
                for element in elements.clone() {
                    push_if_audit(&mut out, element);
                }
            }
        }
        other => push_if_audit(&mut out, other),
    }
    Ok(out)
}

/* ============================= AZURE ============================= */

/// Diagnostic-settings export: `records[]` wrappers with a `category` and
/// the audit event JSON string-encoded under `properties.log`. Categories
/// other than `kube-audit*` are skipped.
pub struct AzureEnvelopeParser;

impl EnvelopeParser for AzureEnvelopeParser {
    fn parse(&self, body: &[u8]) -> Result<Vec<AuditEvent>, serde_json::Error> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }
        let value: Value = serde_json::from_slice(body)?;
        let Some(records) = value.get("records").and_then(Value::as_array) else {
            return parse_flexible(body);
        };

        let mut out = Vec::new();
        for record in records {
            if let Some(category) = record.get("category").and_then(Value::as_str)
                && !category.starts_with("kube-audit")
            {
                continue;
            }
            let Some(log) = record.pointer("/properties/log").and_then(Value::as_str) else {
                debug!("skipping record without properties.log payload");
                continue;
            };
            match serde_json::from_str::<AuditEvent>(log) {
                Ok(event) if looks_like_audit_event(&event) => out.push(event),
                Ok(_) => debug!("skipping non-audit log payload"),
                Err(e) => debug!(error = %e, "skipping undecodable log payload"),
            }
        }
        Ok(out)
    }
}

/* ============================= AWS ============================= */

/// CloudWatch log records carry one raw audit event per message; arrays are
/// tolerated for pre-batched exports.
pub struct AwsEnvelopeParser;

impl EnvelopeParser for AwsEnvelopeParser {
    fn parse(&self, body: &[u8]) -> Result<Vec<AuditEvent>, serde_json::Error> {
        parse_flexible(body)
    }
}

/* ============================= GCP ============================= */

/// Pub/Sub messages deliver either a single event or a batched JSON list.
pub struct GcpEnvelopeParser;

impl EnvelopeParser for GcpEnvelopeParser {
    fn parse(&self, body: &[u8]) -> Result<Vec<AuditEvent>, serde_json::Error> {
        parse_flexible(body)
    }
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;

    fn event_json(id: &str) -> String {
        format!(r#"{{"auditID":"{id}","verb":"get","stage":"ResponseComplete"}}"#)
    }

    // ── flexible decoding (aws / gcp) ──

    #[test]
    fn test_empty_body_yields_nothing() {
        for parser in [&AwsEnvelopeParser as &dyn EnvelopeParser, &GcpEnvelopeParser] {
            assert!(parser.parse(b"").unwrap().is_empty());
            assert!(parser.parse(b"   \n").unwrap().is_empty());
        }
    }

    #[test]
    fn test_single_event_body() {
        let events = AwsEnvelopeParser.parse(event_json("a").as_bytes()).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].audit_id, "a");
    }

    #[test]
    fn test_array_body() {
        let body = format!("[{},{}]", event_json("a"), event_json("b"));
        let events = GcpEnvelopeParser.parse(body.as_bytes()).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].audit_id, "b");
    }

    #[test]
    fn test_items_envelope_body() {
        let body = format!(r#"{{"kind":"EventList","items":[{}]}}"#, event_json("a"));
        let events = GcpEnvelopeParser.parse(body.as_bytes()).unwrap();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_invalid_json_is_an_error() {
        assert!(AwsEnvelopeParser.parse(b"{{{").is_err());
    }

    #[test]
    fn test_unrelated_object_is_skipped_not_error() {
        let events = AwsEnvelopeParser
            .parse(br#"{"some":"other record"}"#)
            .unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn test_array_with_mixed_records_keeps_audit_events() {
        let body = format!(r#"[{}, {{"noise": true}}, {}]"#, event_json("a"), event_json("b"));
        let events = AwsEnvelopeParser.parse(body.as_bytes()).unwrap();
        assert_eq!(events.len(), 2);
    }

    // ── azure records wrapper ──

    fn azure_record(category: &str, id: &str) -> String {
        let log = event_json(id).replace('"', "\\\"");
        format!(r#"{{"category":"{category}","properties":{{"log":"{log}"}}}}"#)
    }

    #[test]
    fn test_azure_kube_audit_records() {
        let body = format!(
            r#"{{"records":[{},{}]}}"#,
            azure_record("kube-audit", "a"),
            azure_record("kube-audit-admin", "b"),
        );
        let events = AzureEnvelopeParser.parse(body.as_bytes()).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].audit_id, "a");
        assert_eq!(events[1].audit_id, "b");
    }

    #[test]
    fn test_azure_skips_other_categories() {
        let body = format!(
            r#"{{"records":[{},{}]}}"#,
            azure_record("kube-apiserver", "noise"),
            azure_record("kube-audit", "keep"),
        );
        let events = AzureEnvelopeParser.parse(body.as_bytes()).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].audit_id, "keep");
    }

    #[test]
    fn test_azure_skips_record_with_bad_payload() {
        let body = r#"{"records":[
            {"category":"kube-audit","properties":{"log":"not json"}},
            {"category":"kube-audit","properties":{}}
        ]}"#;
        let events = AzureEnvelopeParser.parse(body.as_bytes()).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn test_azure_falls_back_to_flexible_decoding() {
        let events = AzureEnvelopeParser.parse(event_json("raw").as_bytes()).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].audit_id, "raw");
    }

    #[test]
    fn test_azure_empty_body() {
        assert!(AzureEnvelopeParser.parse(b"").unwrap().is_empty());
    }
}
