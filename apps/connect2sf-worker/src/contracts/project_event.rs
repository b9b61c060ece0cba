//! Payloads of the project lifecycle events this worker subscribes to.

use serde_json::{Map, Value};

use super::validation::{ValidationError, require_array, require_id, require_object};

pub const PROJECT_CREATED: &str = "project-created";
pub const PROJECT_UPDATED: &str = "project-updated";

const FAILED_SUFFIX: &str = "-failed";
const CUSTOMER_ROLE: &str = "customer";

/// Routing key used when a message is diverted to the failure exchange.
pub fn failed_routing_key(routing_key: &str) -> String {
    format!("{}{}", routing_key, FAILED_SUFFIX)
}

/// A freshly created (draft) project.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectCreated {
    pub id: i64,
    raw: Value,
}

impl ProjectCreated {
    pub fn parse(payload: &Value) -> Result<Self, ValidationError> {
        let id = require_id(payload, "id")?;
        require_array(payload, "members")?;
        Ok(Self {
            id,
            raw: payload.clone(),
        })
    }

    /// User id of the member with role `customer` flagged as primary.
    pub fn primary_customer_id(&self) -> Option<String> {
        self.raw
            .get("members")
            .and_then(Value::as_array)?
            .iter()
            .find(|member| {
                member.get("role").and_then(Value::as_str) == Some(CUSTOMER_ROLE)
                    && member.get("isPrimary").and_then(Value::as_bool) == Some(true)
            })
            .and_then(|member| match member.get("userId")? {
                Value::Number(n) => Some(n.to_string()),
                Value::String(s) if !s.is_empty() => Some(s.clone()),
                _ => None,
            })
    }

    pub fn members(&self) -> &[Value] {
        self.raw
            .get("members")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Value at a JSON pointer, or `""` when the path does not exist.
    /// An explicit `null` is kept as-is.
    pub fn field_or_empty(&self, pointer: &str) -> Value {
        field_or_empty(&self.raw, pointer)
    }
}

/// An update to an existing project, carrying both snapshots.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectUpdated {
    pub project_id: i64,
    pub updated: Map<String, Value>,
}

impl ProjectUpdated {
    pub fn parse(payload: &Value) -> Result<Self, ValidationError> {
        let original = payload
            .get("original")
            .filter(|v| !v.is_null())
            .ok_or_else(|| ValidationError::MissingField("original".to_string()))?;
        if !original.is_object() {
            return Err(ValidationError::InvalidType {
                field: "original".to_string(),
                expected: "an object",
            });
        }
        let project_id = require_id(original, "id").map_err(|e| match e {
            ValidationError::MissingField(_) => {
                ValidationError::MissingField("original.id".to_string())
            }
            ValidationError::InvalidType { expected, .. } => ValidationError::InvalidType {
                field: "original.id".to_string(),
                expected,
            },
        })?;
        let updated = require_object(payload, "updated")?.clone();

        Ok(Self {
            project_id,
            updated,
        })
    }

    /// Lead columns derived from the truthy fields of the updated snapshot.
    pub fn lead_changes(&self) -> Map<String, Value> {
        let updated = Value::Object(self.updated.clone());
        let mut changes = Map::new();

        if let Some(status) = truthy(&updated, "status") {
            changes.insert("TC_Connect_Project_Status__c".into(), status.clone());
        }
        if let Some(reason) = truthy(&updated, "cancelReason") {
            changes.insert("TC_Connect_Cancel_Reason__c".into(), reason.clone());
        }
        if let Some(description) = truthy(&updated, "description") {
            changes.insert("TC_Connect_Description__c".into(), description.clone());
        }
        if truthy(&updated, "details").is_some() {
            changes.insert(
                "Ref_Code__c".into(),
                field_or_empty(&updated, "/details/utm/code"),
            );
        }
        if let Some(direct_id) = truthy(&updated, "directProjectId") {
            changes.insert("TC_Connect_Direct_Project_Id__c".into(), direct_id.clone());
        }

        changes
    }
}

fn field_or_empty(value: &Value, pointer: &str) -> Value {
    value
        .pointer(pointer)
        .cloned()
        .unwrap_or_else(|| Value::String(String::new()))
}

fn truthy<'a>(value: &'a Value, field: &str) -> Option<&'a Value> {
    value.get(field).filter(|v| match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_created_requires_members() {
        let err = ProjectCreated::parse(&json!({"id": 1})).unwrap_err();
        assert_eq!(err, ValidationError::MissingField("members".to_string()));
    }

    #[test]
    fn test_primary_customer_lookup() {
        let project = ProjectCreated::parse(&json!({
            "id": 1,
            "members": [
                {"role": "manager", "isPrimary": true, "userId": 7},
                {"role": "customer", "isPrimary": false, "userId": 8},
                {"role": "customer", "isPrimary": true, "userId": 42},
            ]
        }))
        .unwrap();
        assert_eq!(project.primary_customer_id().as_deref(), Some("42"));
        assert_eq!(project.members().len(), 3);
    }

    #[test]
    fn test_no_primary_customer() {
        let project = ProjectCreated::parse(&json!({"id": 1, "members": []})).unwrap();
        assert_eq!(project.primary_customer_id(), None);
    }

    #[test]
    fn test_field_or_empty_keeps_explicit_null() {
        let project = ProjectCreated::parse(&json!({
            "id": 1,
            "members": [],
            "cancelReason": null,
            "details": {"utm": {"code": "123"}}
        }))
        .unwrap();
        assert_eq!(project.field_or_empty("/cancelReason"), Value::Null);
        assert_eq!(project.field_or_empty("/details/utm/code"), json!("123"));
        assert_eq!(project.field_or_empty("/status"), json!(""));
    }

    #[test]
    fn test_parse_updated_requires_original_id() {
        let err = ProjectUpdated::parse(&json!({"original": {}, "updated": {}})).unwrap_err();
        assert_eq!(err, ValidationError::MissingField("original.id".to_string()));

        let err = ProjectUpdated::parse(&json!({"original": {"id": 1}})).unwrap_err();
        assert_eq!(err, ValidationError::MissingField("updated".to_string()));
    }

    #[test]
    fn test_lead_changes_only_include_truthy_fields() {
        let event = ProjectUpdated::parse(&json!({
            "original": {"id": 1, "status": "in_review"},
            "updated": {
                "id": 1,
                "status": "active",
                "cancelReason": null,
                "description": "",
                "details": {"utm": {"code": "abc"}},
                "directProjectId": 99
            }
        }))
        .unwrap();

        let changes = event.lead_changes();
        assert_eq!(changes.len(), 3);
        assert_eq!(changes["TC_Connect_Project_Status__c"], json!("active"));
        assert_eq!(changes["Ref_Code__c"], json!("abc"));
        assert_eq!(changes["TC_Connect_Direct_Project_Id__c"], json!(99));
    }

    #[test]
    fn test_failed_routing_key() {
        assert_eq!(failed_routing_key(PROJECT_CREATED), "project-created-failed");
    }
}
