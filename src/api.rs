//! Response envelope and request field aliases.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::EngineError;

/// Legacy request field names and the field each one maps onto.
pub const ALIASES: &[(&str, &str)] = &[
    ("conductScore", "rawScore"),
    ("evaluatorId", "externalEvaluatorId"),
    ("externalFacultyId", "externalEvaluatorId"),
];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Envelope {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

/// An envelope plus the HTTP status a transport should send it with.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Envelope,
}

impl ApiResponse {
    pub fn ok<T: Serialize>(data: &T) -> Self {
        match serde_json::to_value(data) {
            Ok(data) => Self::with_status(200, data),
            Err(err) => {
                Self::error(&EngineError::Store(format!("response encoding failed: {err}")))
            }
        }
    }

    pub fn created<T: Serialize>(data: &T) -> Self {
        let mut response = Self::ok(data);
        if response.body.success {
            response.status = 201;
        }
        response
    }

    pub fn error(err: &EngineError) -> Self {
        Self {
            status: err.http_status(),
            body: Envelope {
                success: false,
                data: None,
                error: Some(ErrorBody {
                    code: err.code(),
                    message: err.to_string(),
                }),
            },
        }
    }

    pub fn from_result<T: Serialize>(result: crate::error::Result<T>) -> Self {
        match result {
            Ok(data) => Self::ok(&data),
            Err(err) => Self::error(&err),
        }
    }

    fn with_status(status: u16, data: Value) -> Self {
        Self {
            status,
            body: Envelope {
                success: true,
                data: Some(data),
                error: None,
            },
        }
    }
}

/// Rewrites legacy top-level keys onto their current names. A key that is
/// already present under its current name wins over the alias.
pub fn resolve_aliases(body: Value) -> Value {
    let Value::Object(fields) = body else {
        return body;
    };
    let mut resolved = Map::with_capacity(fields.len());
    let mut aliased = Vec::new();
    for (key, value) in fields {
        match ALIASES.iter().find(|(alias, _)| *alias == key) {
            Some((_, canonical)) => aliased.push((*canonical, value)),
            None => {
                resolved.insert(key, value);
            }
        }
    }
    for (canonical, value) in aliased {
        resolved.entry(canonical).or_insert(value);
    }
    Value::Object(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn legacy_names_are_rewritten() {
        let evaluator = Uuid::new_v4().to_string();
        let resolved = resolve_aliases(json!({
            "conductScore": 17,
            "externalFacultyId": evaluator,
            "groupId": "g"
        }));
        assert_eq!(
            resolved,
            json!({"rawScore": 17, "externalEvaluatorId": evaluator, "groupId": "g"})
        );
    }

    #[test]
    fn current_name_beats_alias() {
        let resolved = resolve_aliases(json!({"rawScore": 12, "conductScore": 3}));
        assert_eq!(resolved, json!({"rawScore": 12}));
    }

    #[test]
    fn non_objects_pass_through() {
        assert_eq!(resolve_aliases(json!([1, 2])), json!([1, 2]));
    }

    #[test]
    fn error_envelope_carries_code_and_status() {
        let response = ApiResponse::error(&EngineError::Frozen(Uuid::nil()));
        assert_eq!(response.status, 409);
        assert!(!response.body.success);
        let encoded = serde_json::to_value(&response.body).unwrap();
        assert_eq!(encoded["error"]["code"], "RECORD_FROZEN");
        assert!(encoded.get("data").is_none());
    }

    #[test]
    fn success_envelope_omits_error() {
        let response = ApiResponse::created(&json!({"id": 1}));
        assert_eq!(response.status, 201);
        let encoded = serde_json::to_value(&response.body).unwrap();
        assert_eq!(encoded, json!({"success": true, "data": {"id": 1}}));
    }
}
