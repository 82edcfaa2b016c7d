//! Tolerant decoding of schema-constrained LLM responses.
//!
//! Providers are asked for a JSON array but in practice return one of:
//! a parsed array, a wrapper object `{"analyses": [...]}`, or a string
//! containing JSON with surrounding prose. Anything else is a parse
//! failure; count mismatches are left to validation.

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{PipelineError, Result};

/// Coerce a provider payload into a list of result items.
pub fn coerce_result_items(data: &Value) -> Result<Vec<Value>> {
    match data {
        Value::Array(items) => Ok(items.clone()),
        Value::Object(map) => match map.get("analyses") {
            Some(Value::Array(items)) => Ok(items.clone()),
            _ => Err(PipelineError::Parse {
                reason: "object payload has no analyses array".to_string(),
            }),
        },
        Value::String(text) => {
            let block = extract_json_block(text).ok_or_else(|| PipelineError::Parse {
                reason: "string payload contains no JSON block".to_string(),
            })?;
            let parsed: Value = serde_json::from_str(block).map_err(|e| PipelineError::Parse {
                reason: format!("embedded JSON block invalid: {e}"),
            })?;
            coerce_result_items(&parsed)
        }
        Value::Null => Err(PipelineError::Parse {
            reason: "null payload".to_string(),
        }),
        other => Err(PipelineError::Parse {
            reason: format!("unexpected payload type: {other}"),
        }),
    }
}

/// Decode a provider payload into typed result items.
pub fn decode_items<T: DeserializeOwned>(data: &Value) -> Result<Vec<T>> {
    coerce_result_items(data)?
        .into_iter()
        .map(|item| {
            serde_json::from_value(item).map_err(|e| PipelineError::Parse {
                reason: format!("result item does not match schema: {e}"),
            })
        })
        .collect()
}

/// Extract the first balanced `[...]` or `{...}` block from prose.
///
/// String literals and escapes are respected so braces inside values do not
/// unbalance the scan.
pub fn extract_json_block(text: &str) -> Option<&str> {
    let start = text.find(['[', '{'])?;
    let bytes = text.as_bytes();
    let open = bytes[start];
    let close = if open == b'[' { b']' } else { b'}' };

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &byte) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == b'"' {
                in_string = false;
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b if b == open => depth += 1,
            b if b == close => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_coerce_parsed_array() {
        let data = json!([{"id": "A"}, {"id": "B"}]);
        assert_eq!(coerce_result_items(&data).unwrap().len(), 2);
    }

    #[test]
    fn test_coerce_wrapper_object() {
        let data = json!({"analyses": [{"id": "A"}]});
        assert_eq!(coerce_result_items(&data).unwrap().len(), 1);
    }

    #[test]
    fn test_coerce_string_with_prose() {
        let data = json!(
            "Here are the results you asked for:\n[{\"id\": \"A\"}, {\"id\": \"B\"}]\nLet me know if you need anything else."
        );
        assert_eq!(coerce_result_items(&data).unwrap().len(), 2);
    }

    #[test]
    fn test_coerce_string_with_wrapper_and_prose() {
        let data = json!("Sure! {\"analyses\": [{\"id\": \"A\"}]} Done.");
        assert_eq!(coerce_result_items(&data).unwrap().len(), 1);
    }

    #[test]
    fn test_null_payload_fails() {
        assert!(coerce_result_items(&Value::Null).is_err());
    }

    #[test]
    fn test_malformed_string_fails() {
        let data = json!("no json here at all");
        assert!(coerce_result_items(&data).is_err());
    }

    #[test]
    fn test_extract_block_respects_strings() {
        let text = r#"prose {"note": "has } inside"} trailing"#;
        assert_eq!(extract_json_block(text), Some(r#"{"note": "has } inside"}"#));
    }

    #[test]
    fn test_extract_block_nested() {
        let text = "x [[1, 2], [3]] y";
        assert_eq!(extract_json_block(text), Some("[[1, 2], [3]]"));
    }

    #[test]
    fn test_decode_items_typed() {
        use crate::types::analysis::ScoringAnalysisItem;
        let data = json!([{"id": "A-1", "scoring": null, "relevanceReasoning": "n/a"}]);
        let items: Vec<ScoringAnalysisItem> = decode_items(&data).unwrap();
        assert_eq!(items[0].id, "A-1");
        assert!(items[0].scoring.is_none());
    }
}
