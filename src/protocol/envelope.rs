use serde_json::{Map, Value};
use thiserror::Error;

use super::CorrelationId;

/// A decoded call-in payload: the correlation id plus the remaining fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub id: CorrelationId,
    pub body: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("payload is not valid JSON: {0}")]
    Json(String),
    #[error("payload is not a request object")]
    NotAnObject,
    #[error("request carries no string `id`")]
    MissingId,
    #[error("unknown entry point `{0}`")]
    UnknownEntryPoint(String),
}

impl Envelope {
    /// Decodes either the flat form `{"id": .., ..}` or the wrapped form
    /// `["{\"id\": .., ..}"]` some page engines deliver.
    ///
    /// The id is pulled out before anything else is looked at; an error from
    /// this function therefore always means there is no id to answer to.
    pub fn decode(payload: &str) -> Result<Self, TransportError> {
        let value: Value =
            serde_json::from_str(payload).map_err(|e| TransportError::Json(e.to_string()))?;

        let inner = match value {
            Value::Array(items) if items.len() == 1 => match items.into_iter().next() {
                Some(Value::String(raw)) => serde_json::from_str(&raw)
                    .map_err(|e| TransportError::Json(e.to_string()))?,
                Some(other) => other,
                None => Value::Null,
            },
            other => other,
        };

        let Value::Object(mut body) = inner else {
            return Err(TransportError::NotAnObject);
        };
        let id = match body.remove("id") {
            Some(Value::String(id)) if !id.is_empty() => id,
            _ => return Err(TransportError::MissingId),
        };

        Ok(Self { id, body })
    }

    /// Encodes the flat form.
    pub fn encode(&self) -> String {
        let mut object = self.body.clone();
        object.insert("id".to_string(), Value::String(self.id.clone()));
        Value::Object(object).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_decode_flat_payload() {
        let envelope = Envelope::decode(r#"{"id":"4","prompt":"hi"}"#).unwrap();
        assert_eq!(envelope.id, "4");
        assert_eq!(envelope.body.get("prompt"), Some(&json!("hi")));
        assert!(!envelope.body.contains_key("id"));
    }

    #[test]
    fn test_decode_wrapped_payload() {
        let envelope = Envelope::decode(r#"["{\"id\":\"9\",\"maxTokens\":3}"]"#).unwrap();
        assert_eq!(envelope.id, "9");
        assert_eq!(envelope.body.get("maxTokens"), Some(&json!(3)));
    }

    #[test]
    fn test_encode_decodes_back() {
        let mut body = Map::new();
        body.insert("text".to_string(), json!("a \"quoted\" line\n"));
        let envelope = Envelope {
            id: "12".to_string(),
            body,
        };
        assert_eq!(Envelope::decode(&envelope.encode()).unwrap(), envelope);
    }

    #[test]
    fn test_decode_failures_have_no_id() {
        assert!(matches!(
            Envelope::decode("not json"),
            Err(TransportError::Json(_))
        ));
        assert_eq!(Envelope::decode("[1, 2]"), Err(TransportError::NotAnObject));
        assert_eq!(
            Envelope::decode(r#"{"prompt":"hi"}"#),
            Err(TransportError::MissingId)
        );
        assert_eq!(
            Envelope::decode(r#"{"id":5}"#),
            Err(TransportError::MissingId)
        );
        assert_eq!(Envelope::decode(r#"{"id":""}"#), Err(TransportError::MissingId));
    }
}
