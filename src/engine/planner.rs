//! # Response Planner
//!
//! Turns parsed responses into follow-up requests using the plugin's
//! declarative `response_handlers`. Handlers are evaluated in order; every
//! matching handler contributes one follow-up built from the request
//! model's defaults plus the handler's `set_fields`. Follow-ups are
//! drained by the fuzzing loop ahead of freshly mutated test cases.

use crate::codec::{FieldMap, FieldValue, ProtocolCodec};
use crate::plugin::{DataModel, ResponseHandler};
use tracing::{debug, warn};

/// A planned follow-up request.
#[derive(Debug, Clone)]
pub struct Followup {
    pub payload: Vec<u8>,
    pub handler: String,
}

/// Evaluates response handlers against incoming responses.
pub struct ResponsePlanner {
    request_codec: ProtocolCodec,
    response_codec: ProtocolCodec,
    handlers: Vec<ResponseHandler>,
}

impl ResponsePlanner {
    /// When no response model is declared, requests and responses share
    /// a layout.
    pub fn new(
        request_model: DataModel,
        response_model: Option<DataModel>,
        handlers: Vec<ResponseHandler>,
    ) -> Self {
        let response_codec =
            ProtocolCodec::new(response_model.unwrap_or_else(|| request_model.clone()));
        Self {
            request_codec: ProtocolCodec::new(request_model),
            response_codec,
            handlers,
        }
    }

    pub fn has_handlers(&self) -> bool {
        !self.handlers.is_empty()
    }

    /// Plan follow-ups for a raw response. Unparseable or absent responses
    /// produce none.
    pub fn plan(&self, response: Option<&[u8]>) -> Vec<Followup> {
        let Some(raw) = response else {
            return Vec::new();
        };
        if raw.is_empty() {
            return Vec::new();
        }
        let parsed = match self.response_codec.parse(raw) {
            Ok(fields) => fields,
            Err(err) => {
                debug!(error = %err, "response parse failed, no follow-ups");
                return Vec::new();
            }
        };

        let mut followups = Vec::new();
        for handler in &self.handlers {
            if !handler_matches(&handler.match_fields, &parsed) {
                continue;
            }
            match self.build_followup(handler, &parsed) {
                Some(payload) => followups.push(Followup {
                    payload,
                    handler: handler.name.clone(),
                }),
                None => continue,
            }
        }
        followups
    }

    fn build_followup(&self, handler: &ResponseHandler, parsed: &FieldMap) -> Option<Vec<u8>> {
        let mut fields = self.request_codec.build_default_fields();
        for (name, spec) in &handler.set_fields {
            if let Some(value) = resolve_set_field(spec, parsed) {
                fields.insert(name.clone(), value);
            }
        }
        match self.request_codec.serialize(&fields, None) {
            Ok(payload) => Some(payload),
            Err(err) => {
                warn!(handler = %handler.name, error = %err, "follow-up serialize failed");
                None
            }
        }
    }
}

/// Compare a handler's `match` map against the parsed response. A list
/// means any-of; an empty map always matches.
pub fn handler_matches(
    match_fields: &std::collections::BTreeMap<String, serde_json::Value>,
    parsed: &FieldMap,
) -> bool {
    for (field, expected) in match_fields {
        let Some(actual) = parsed.get(field) else {
            return false;
        };
        let ok = match expected {
            serde_json::Value::Array(options) => options.iter().any(|o| value_matches(o, actual)),
            other => value_matches(other, actual),
        };
        if !ok {
            return false;
        }
    }
    true
}

/// Compare one expected JSON literal against a decoded field value.
pub fn value_matches(expected: &serde_json::Value, actual: &FieldValue) -> bool {
    match expected {
        serde_json::Value::Number(n) => {
            if let (Some(e), Some(a)) = (n.as_u64(), actual.as_u64()) {
                return e == a;
            }
            if let (Some(e), Some(a)) = (n.as_i64(), actual.as_i64()) {
                return e == a;
            }
            false
        }
        serde_json::Value::String(s) => match actual {
            FieldValue::Str(a) => a == s,
            // Hex strings compare against byte fields.
            FieldValue::Bytes(b) => hex::decode(s).map(|e| &e == b).unwrap_or(false),
            _ => false,
        },
        _ => false,
    }
}

/// Resolve one `set_fields` value spec: `{copy_from_response: f}` reads
/// from the parsed response, `{literal: v}` uses the literal, any other
/// scalar is used directly.
fn resolve_set_field(spec: &serde_json::Value, parsed: &FieldMap) -> Option<FieldValue> {
    if let Some(map) = spec.as_object() {
        if let Some(source) = map.get("copy_from_response").and_then(|v| v.as_str()) {
            return parsed.get(source).cloned();
        }
        if let Some(literal) = map.get("literal") {
            return FieldValue::from_json(literal);
        }
    }
    FieldValue::from_json(spec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{Block, BlockType, SizeOf};
    use std::collections::BTreeMap;

    fn request_model() -> DataModel {
        let mut command = Block::new("command", BlockType::Uint8);
        command.default = Some(serde_json::json!(0));
        let mut length = Block::new("length", BlockType::Uint16);
        length.is_size_field = true;
        length.size_of = Some(SizeOf::One("session_id".into()));
        let mut session_id = Block::new("session_id", BlockType::Bytes);
        session_id.max_size = Some(16);
        DataModel {
            name: None,
            description: None,
            blocks: vec![command, length, session_id],
            seeds: Vec::new(),
        }
    }

    fn response_model() -> DataModel {
        let command = {
            let mut b = Block::new("command", BlockType::Uint8);
            b.values = Some([(2u64, "SESSION".to_string())].into_iter().collect());
            b
        };
        let mut token = Block::new("session_token", BlockType::Bytes);
        token.max_size = Some(16);
        DataModel {
            name: None,
            description: None,
            blocks: vec![command, token],
            seeds: Vec::new(),
        }
    }

    fn handlers() -> Vec<ResponseHandler> {
        vec![ResponseHandler {
            name: "sync_session_id".into(),
            match_fields: [("command".to_string(), serde_json::json!(2))]
                .into_iter()
                .collect(),
            set_fields: [
                ("command".to_string(), serde_json::json!(0x10)),
                (
                    "session_id".to_string(),
                    serde_json::json!({"copy_from_response": "session_token"}),
                ),
            ]
            .into_iter()
            .collect(),
        }]
    }

    #[test]
    fn matching_response_produces_followup() {
        let planner = ResponsePlanner::new(request_model(), Some(response_model()), handlers());
        // command=2, token="ABCD"
        let response = b"\x02ABCD";
        let followups = planner.plan(Some(response.as_slice()));
        assert_eq!(followups.len(), 1);
        assert_eq!(followups[0].handler, "sync_session_id");
        // command=0x10, length=4, session_id="ABCD"
        assert_eq!(followups[0].payload, b"\x10\x00\x04ABCD");
    }

    #[test]
    fn non_matching_response_produces_nothing() {
        let planner = ResponsePlanner::new(request_model(), Some(response_model()), handlers());
        assert!(planner.plan(Some(b"\x07XXXX".as_slice())).is_empty());
        assert!(planner.plan(None).is_empty());
        assert!(planner.plan(Some(b"".as_slice())).is_empty());
    }

    #[test]
    fn empty_match_always_fires() {
        let mut handler = handlers().remove(0);
        handler.match_fields = BTreeMap::new();
        let planner =
            ResponsePlanner::new(request_model(), Some(response_model()), vec![handler]);
        assert_eq!(planner.plan(Some(b"\x07ZZ".as_slice())).len(), 1);
    }

    #[test]
    fn list_match_means_any_of() {
        let mut handler = handlers().remove(0);
        handler
            .match_fields
            .insert("command".into(), serde_json::json!([1, 2, 3]));
        let planner =
            ResponsePlanner::new(request_model(), Some(response_model()), vec![handler]);
        assert_eq!(planner.plan(Some(b"\x03QQ".as_slice())).len(), 1);
        assert!(planner.plan(Some(b"\x09QQ".as_slice())).is_empty());
    }

    #[test]
    fn unparseable_response_is_silent() {
        let planner = ResponsePlanner::new(request_model(), Some(response_model()), handlers());
        // Too short for the response model's command byte plus anything.
        assert!(planner.plan(Some(b"".as_slice())).is_empty());
    }
}
