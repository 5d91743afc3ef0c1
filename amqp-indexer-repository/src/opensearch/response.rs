//! Parsing of `_bulk` responses into `BulkResult`.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;

use crate::errors::SinkError;
use crate::types::{ActionKind, BulkItemFailure, BulkItemResult, BulkResult};

#[derive(Debug, Deserialize)]
struct BulkResponseBody {
    #[serde(default)]
    took: u64,
    #[serde(default)]
    items: Vec<HashMap<String, BulkResponseItem>>,
}

#[derive(Debug, Deserialize)]
struct BulkResponseItem {
    #[serde(rename = "_index")]
    index: Option<String>,
    #[serde(rename = "_id")]
    id: Option<String>,
    #[serde(default)]
    status: u16,
    error: Option<Value>,
}

/// Parse a `_bulk` response body into per-action outcomes.
///
/// Each item is keyed by its action name. Errors are either structured
/// (`{"type": ..., "reason": ...}`) or, on older clusters, a plain string
/// such as `MapperParsingException[failed to parse]`.
pub fn parse_bulk_response(body: Value) -> Result<BulkResult, SinkError> {
    let body: BulkResponseBody = serde_json::from_value(body)
        .map_err(|e| SinkError::parse(format!("Invalid bulk response: {}", e)))?;

    let mut items = Vec::with_capacity(body.items.len());
    for entry in body.items {
        let Some((name, item)) = entry.into_iter().next() else {
            return Err(SinkError::parse("Empty bulk response item"));
        };
        let action = ActionKind::from_name(&name)
            .ok_or_else(|| SinkError::parse(format!("Unknown action in response: {}", name)))?;

        items.push(BulkItemResult {
            action,
            index: item.index,
            id: item.id,
            status: item.status,
            failure: item.error.as_ref().map(parse_failure),
        });
    }

    Ok(BulkResult {
        took_ms: body.took,
        items,
    })
}

fn parse_failure(error: &Value) -> BulkItemFailure {
    match error {
        Value::Object(object) => {
            let error_type = object
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            let reason = object
                .get("reason")
                .and_then(Value::as_str)
                .unwrap_or_default();
            BulkItemFailure::new(error_type, reason)
        }
        Value::String(message) => {
            let error_type = message
                .split(|c: char| c == '[' || c == ':')
                .next()
                .unwrap_or_default()
                .trim();
            BulkItemFailure::new(error_type, message.as_str())
        }
        other => BulkItemFailure::new("unknown", other.to_string()),
    }
}
