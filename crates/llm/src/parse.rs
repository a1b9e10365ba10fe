//! Turning raw completion text into task-type-specific structured data.
//!
//! The parser is a pluggable step: it either yields a JSON payload plus an
//! item count, or fails. It makes no judgement about content quality.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

use demandflow_core::TaskType;

/// Structured output ready to persist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedPayload {
    pub payload: JsonValue,
    pub item_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("empty completion")]
    Empty,

    #[error("completion is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("{task_type} completion does not match schema: {reason}")]
    Schema { task_type: TaskType, reason: String },
}

pub trait ResponseParser: Send + Sync {
    fn parse(&self, task_type: TaskType, text: &str) -> Result<GeneratedPayload, ParseError>;
}

/// Default parser: JSON (optionally wrapped in a Markdown code fence) for
/// every task type except automation scripts, which are plain text.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonResponseParser;

impl ResponseParser for JsonResponseParser {
    fn parse(&self, task_type: TaskType, text: &str) -> Result<GeneratedPayload, ParseError> {
        let body = strip_code_fence(text);
        if body.is_empty() {
            return Err(ParseError::Empty);
        }

        match task_type {
            TaskType::AutomationScript => parse_script(body),
            TaskType::Epic => single::<Epic>(task_type, parse_json(body)?),
            TaskType::Feature => many::<Feature>(task_type, parse_json(body)?),
            TaskType::UserStory => many::<UserStory>(task_type, parse_json(body)?),
            TaskType::Task => many::<WorkTask>(task_type, parse_json(body)?),
            TaskType::Bug => many::<Bug>(task_type, parse_json(body)?),
            TaskType::Issue | TaskType::Pbi => many::<Issue>(task_type, parse_json(body)?),
            TaskType::TestCase => many::<TestCase>(task_type, parse_json(body)?),
            TaskType::Wbs => parse_wbs(parse_json(body)?),
        }
    }
}

fn parse_json(body: &str) -> Result<JsonValue, ParseError> {
    serde_json::from_str(body).map_err(|e| ParseError::InvalidJson(e.to_string()))
}

/// Unwrap a Markdown code fence and drop its info string. The fence may span
/// lines or sit on one line with the tag and body separated by a space.
fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_suffix("```").unwrap_or(inner);
    let body = match inner.split_once('\n') {
        Some((info, rest)) if is_info_string(info) => rest,
        Some(_) => inner,
        None => match inner.trim_start().split_once(char::is_whitespace) {
            Some((info, rest)) if !info.is_empty() && is_info_string(info) => rest,
            _ => inner,
        },
    };
    body.trim()
}

/// A fence language tag such as `json`, `c++` or `objective-c`.
fn is_info_string(line: &str) -> bool {
    line.trim()
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '_' | '.'))
}

fn parse_script(body: &str) -> Result<GeneratedPayload, ParseError> {
    let script = body
        .strip_prefix("/*")
        .and_then(|s| s.strip_suffix("*/"))
        .unwrap_or(body)
        .trim();
    if script.is_empty() {
        return Err(ParseError::Empty);
    }
    Ok(GeneratedPayload {
        payload: JsonValue::String(script.to_string()),
        item_count: 1,
    })
}

fn schema_error(task_type: TaskType, reason: impl ToString) -> ParseError {
    ParseError::Schema {
        task_type,
        reason: reason.to_string(),
    }
}

fn single<T>(task_type: TaskType, value: JsonValue) -> Result<GeneratedPayload, ParseError>
where
    T: DeserializeOwned + Serialize,
{
    let item: T = serde_json::from_value(value).map_err(|e| schema_error(task_type, e))?;
    Ok(GeneratedPayload {
        payload: serde_json::to_value(item).map_err(|e| schema_error(task_type, e))?,
        item_count: 1,
    })
}

/// Accepts either a list of items or a single object.
fn many<T>(task_type: TaskType, value: JsonValue) -> Result<GeneratedPayload, ParseError>
where
    T: DeserializeOwned + Serialize,
{
    let items: Vec<T> = match value {
        JsonValue::Array(values) => values
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<_, _>>()
            .map_err(|e| schema_error(task_type, e))?,
        obj @ JsonValue::Object(_) => {
            vec![serde_json::from_value(obj).map_err(|e| schema_error(task_type, e))?]
        }
        other => {
            return Err(schema_error(
                task_type,
                format!("expected object or array, got {}", json_kind(&other)),
            ));
        }
    };

    if items.is_empty() {
        return Err(schema_error(task_type, "no items"));
    }

    Ok(GeneratedPayload {
        item_count: items.len() as u32,
        payload: serde_json::to_value(items).map_err(|e| schema_error(task_type, e))?,
    })
}

fn parse_wbs(value: JsonValue) -> Result<GeneratedPayload, ParseError> {
    let wbs: Wbs =
        serde_json::from_value(value).map_err(|e| schema_error(TaskType::Wbs, e))?;
    if wbs.wbs.is_empty() {
        return Err(schema_error(TaskType::Wbs, "no items"));
    }
    Ok(GeneratedPayload {
        item_count: wbs.wbs.len() as u32,
        payload: serde_json::to_value(wbs).map_err(|e| schema_error(TaskType::Wbs, e))?,
    })
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "bool",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

// Per task-type schemas.

/// Free text, or a list of bullet strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum TextOrList {
    Text(String),
    List(Vec<String>),
}

/// Providers answer with either a label ("High") or a rank (1).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum Priority {
    Rank(i64),
    Label(String),
}

#[derive(Debug, Serialize, Deserialize)]
struct Epic {
    title: String,
    description: String,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    reflection: Map<String, JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    summary: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Feature {
    title: String,
    description: String,
    #[serde(default)]
    acceptance_criteria: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    summary: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct UserStory {
    title: String,
    description: String,
    acceptance_criteria: TextOrList,
    priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    dod: Option<TextOrList>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    dor: Option<TextOrList>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    summary: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum Estimate {
    Hours(f64),
    Text(String),
}

#[derive(Debug, Serialize, Deserialize)]
struct WorkTask {
    title: String,
    description: String,
    estimate: Estimate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    summary: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Bug {
    title: String,
    #[serde(alias = "reproSteps")]
    repro_steps: TextOrList,
    #[serde(alias = "systemInfo")]
    system_info: String,
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Issue {
    title: String,
    description: String,
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct TestAction {
    step: String,
    expected_result: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct TestCase {
    priority: Priority,
    title: String,
    gherkin: Map<String, JsonValue>,
    actions: Vec<TestAction>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Wbs {
    wbs: Vec<Map<String, JsonValue>>,
}
