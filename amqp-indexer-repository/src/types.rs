//! Request and result types for bulk operations.

use std::fmt;
use std::ops::Range;

use serde_json::{Map, Value};

use crate::errors::SinkError;

/// Error types that mean the action can never succeed as written.
///
/// Compared after normalization, so both `mapper_parsing_exception` and the
/// legacy `MapperParsingException` spelling match.
const TERMINAL_ERROR_TYPES: &[&str] = &[
    "mapper_parsing_exception",
    "document_parsing_exception",
    "strict_dynamic_mapping_exception",
    "illegal_argument_exception",
    "action_request_validation_exception",
    "invalid_index_name_exception",
];

/// The kind of a single bulk action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Index,
    Create,
    Update,
    Delete,
}

impl ActionKind {
    /// Parse the action name used as the key of an action line.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "index" => Some(Self::Index),
            "create" => Some(Self::Create),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }

    /// The action name as it appears on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Index => "index",
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    /// Whether the action line is followed by a source line.
    pub fn has_source(&self) -> bool {
        !matches!(self, Self::Delete)
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One validated bulk action with its optional source document.
#[derive(Debug, Clone)]
pub struct BulkAction {
    pub kind: ActionKind,
    /// Action metadata (`_index`, `_id`, routing...), with `_index` resolved.
    pub metadata: Map<String, Value>,
    pub source: Option<Value>,
}

impl BulkAction {
    /// The target index of this action.
    pub fn index(&self) -> Option<&str> {
        self.metadata.get("_index").and_then(Value::as_str)
    }
}

/// A bulk request built incrementally from raw payloads.
///
/// Each payload is a sequence of newline-delimited action/document pairs.
/// Appending is atomic per payload: a malformed payload adds nothing and
/// leaves the request untouched.
#[derive(Debug, Clone, Default)]
pub struct BulkRequest {
    default_index: Option<String>,
    actions: Vec<BulkAction>,
    payload_ranges: Vec<Range<usize>>,
}

impl BulkRequest {
    /// Create an empty request with no default index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty request that fills in `_index` when an action omits it.
    pub fn with_default_index(default_index: Option<String>) -> Self {
        Self {
            default_index,
            ..Self::default()
        }
    }

    /// Append one payload, returning its slot in the request.
    ///
    /// # Errors
    ///
    /// Returns `SinkError::MalformedPayload` if the payload is not valid
    /// bulk NDJSON, in which case the request is unchanged.
    pub fn add(&mut self, payload: &[u8]) -> Result<usize, SinkError> {
        let parsed = self.parse_payload(payload)?;

        let start = self.actions.len();
        self.actions.extend(parsed);
        self.payload_ranges.push(start..self.actions.len());

        Ok(self.payload_ranges.len() - 1)
    }

    fn parse_payload(&self, payload: &[u8]) -> Result<Vec<BulkAction>, SinkError> {
        let text = std::str::from_utf8(payload)
            .map_err(|e| SinkError::malformed(format!("payload is not valid UTF-8: {}", e)))?;

        let mut lines = text
            .lines()
            .enumerate()
            .map(|(n, line)| (n + 1, line.trim()))
            .filter(|(_, line)| !line.is_empty());

        let mut actions = Vec::new();

        while let Some((line_no, line)) = lines.next() {
            let (kind, mut metadata) = parse_action_line(line_no, line)?;

            if !metadata.contains_key("_index") {
                match &self.default_index {
                    Some(index) => {
                        metadata.insert("_index".to_string(), Value::String(index.clone()));
                    }
                    None => {
                        return Err(SinkError::malformed(format!(
                            "line {}: {} action has no _index and no default index is configured",
                            line_no, kind
                        )));
                    }
                }
            }

            let source = if kind.has_source() {
                let (source_no, source_line) = lines.next().ok_or_else(|| {
                    SinkError::malformed(format!(
                        "line {}: {} action is missing its source line",
                        line_no, kind
                    ))
                })?;
                let source: Value = serde_json::from_str(source_line).map_err(|e| {
                    SinkError::malformed(format!("line {}: invalid source: {}", source_no, e))
                })?;
                if !source.is_object() {
                    return Err(SinkError::malformed(format!(
                        "line {}: source must be a JSON object",
                        source_no
                    )));
                }
                Some(source)
            } else {
                None
            };

            actions.push(BulkAction {
                kind,
                metadata,
                source,
            });
        }

        if actions.is_empty() {
            return Err(SinkError::malformed("payload contains no actions"));
        }

        Ok(actions)
    }

    /// Total number of actions across all appended payloads.
    pub fn number_of_actions(&self) -> usize {
        self.actions.len()
    }

    /// Number of payloads successfully appended.
    pub fn number_of_payloads(&self) -> usize {
        self.payload_ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn actions(&self) -> &[BulkAction] {
        &self.actions
    }

    /// Map an action position back to the slot of the payload it came from.
    pub fn payload_for_action(&self, action: usize) -> Option<usize> {
        self.payload_ranges
            .iter()
            .position(|range| range.contains(&action))
    }

    /// Render the request as bulk body lines (action line, then source).
    pub fn to_body(&self) -> Vec<Value> {
        let mut body = Vec::with_capacity(self.actions.len() * 2);
        for action in &self.actions {
            let mut line = Map::new();
            line.insert(
                action.kind.as_str().to_string(),
                Value::Object(action.metadata.clone()),
            );
            body.push(Value::Object(line));
            if let Some(source) = &action.source {
                body.push(source.clone());
            }
        }
        body
    }
}

fn parse_action_line(
    line_no: usize,
    line: &str,
) -> Result<(ActionKind, Map<String, Value>), SinkError> {
    let value: Value = serde_json::from_str(line)
        .map_err(|e| SinkError::malformed(format!("line {}: invalid action: {}", line_no, e)))?;

    let Value::Object(object) = value else {
        return Err(SinkError::malformed(format!(
            "line {}: action must be a JSON object",
            line_no
        )));
    };

    if object.len() != 1 {
        return Err(SinkError::malformed(format!(
            "line {}: action must have exactly one key, found {}",
            line_no,
            object.len()
        )));
    }

    let Some((name, metadata)) = object.into_iter().next() else {
        return Err(SinkError::malformed(format!("line {}: empty action", line_no)));
    };

    let kind = ActionKind::from_name(&name).ok_or_else(|| {
        SinkError::malformed(format!("line {}: unknown action [{}]", line_no, name))
    })?;

    match metadata {
        Value::Object(metadata) => Ok((kind, metadata)),
        _ => Err(SinkError::malformed(format!(
            "line {}: {} metadata must be a JSON object",
            line_no, kind
        ))),
    }
}

/// Whether a failed action could succeed if submitted again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Retriable,
    Terminal,
}

impl FailureKind {
    /// Classify a failure by the error type reported by the sink.
    pub fn classify(error_type: &str) -> Self {
        let normalized = normalize_error_type(error_type);
        if TERMINAL_ERROR_TYPES
            .iter()
            .any(|terminal| normalize_error_type(terminal) == normalized)
        {
            Self::Terminal
        } else {
            Self::Retriable
        }
    }
}

fn normalize_error_type(error_type: &str) -> String {
    error_type
        .chars()
        .filter(|c| *c != '_')
        .flat_map(char::to_lowercase)
        .collect()
}

/// Failure details for a single bulk action.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkItemFailure {
    pub error_type: String,
    pub reason: String,
    pub kind: FailureKind,
}

impl BulkItemFailure {
    /// Create a failure, classifying it from its error type.
    pub fn new(error_type: impl Into<String>, reason: impl Into<String>) -> Self {
        let error_type = error_type.into();
        let kind = FailureKind::classify(&error_type);
        Self {
            error_type,
            reason: reason.into(),
            kind,
        }
    }
}

/// Outcome of a single bulk action.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkItemResult {
    pub action: ActionKind,
    pub index: Option<String>,
    pub id: Option<String>,
    pub status: u16,
    pub failure: Option<BulkItemFailure>,
}

impl BulkItemResult {
    pub fn success(action: ActionKind, status: u16) -> Self {
        Self {
            action,
            index: None,
            id: None,
            status,
            failure: None,
        }
    }

    pub fn failed(action: ActionKind, status: u16, failure: BulkItemFailure) -> Self {
        Self {
            action,
            index: None,
            id: None,
            status,
            failure: Some(failure),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.failure.is_some()
    }
}

/// Per-action outcomes of one bulk call, in request order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkResult {
    pub took_ms: u64,
    pub items: Vec<BulkItemResult>,
}

impl BulkResult {
    pub fn new(items: Vec<BulkItemResult>) -> Self {
        Self { took_ms: 0, items }
    }

    pub fn has_failures(&self) -> bool {
        self.items.iter().any(BulkItemResult::is_failed)
    }

    /// Whether any failed action is worth submitting again.
    pub fn has_retriable_failures(&self) -> bool {
        self.items.iter().any(|item| {
            item.failure
                .as_ref()
                .is_some_and(|f| f.kind == FailureKind::Retriable)
        })
    }

    /// Positions of the failed actions.
    pub fn failed_positions(&self) -> impl Iterator<Item = usize> + '_ {
        self.items
            .iter()
            .enumerate()
            .filter(|(_, item)| item.is_failed())
            .map(|(position, _)| position)
    }

    /// Human-readable summary of every failed action.
    pub fn failure_message(&self) -> String {
        let mut message = String::from("failure in bulk execution:");
        for (position, item) in self.items.iter().enumerate() {
            if let Some(failure) = &item.failure {
                message.push_str(&format!(
                    "\n[{}]: {} index [{}], id [{}], message [{}: {}]",
                    position,
                    item.action,
                    item.index.as_deref().unwrap_or("-"),
                    item.id.as_deref().unwrap_or("-"),
                    failure.error_type,
                    failure.reason
                ));
            }
        }
        message
    }
}
