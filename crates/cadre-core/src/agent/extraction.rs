//! Detecting tool calls in model text
//!
//! Models ask for tools in several textual shapes. Each shape has its own
//! parser; the extractor tries them in order and takes the first match. A
//! parser never fails loudly: anything it cannot read is simply "no match".
//!
//! ## Built-in Parsers
//! - `OpenAiParser` - `{"tool_calls": [{"id", "type", "function": {"name", "arguments"}}]}`
//! - `SimpleParser` - `{"tool": name, "params": {...}}`, also found inside prose
//! - `DelimitedParser` - a JSON array of `{name, arguments}` inside `<tool_calls>` tags

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

const FENCE: &str = "```";
const SIMPLE_MARKER: &str = r#"{"tool""#;
const DELIMITED_START: &str = "<tool_calls>";
const DELIMITED_END: &str = "</tool_calls>";

/// One requested tool invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    pub params: Value,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, params: Value) -> Self {
        Self {
            id: None,
            name: name.into(),
            params,
        }
    }
}

pub trait ToolCallParser: Send + Sync {
    fn name(&self) -> &'static str;

    /// Calls found in `text`, or `None` when this shape is not present
    fn parse(&self, text: &str) -> Option<Vec<ToolCall>>;
}

/// Ordered list of parsers; the first to match wins
pub struct ToolCallExtractor {
    parsers: Vec<Box<dyn ToolCallParser>>,
}

impl Default for ToolCallExtractor {
    fn default() -> Self {
        Self {
            parsers: vec![
                Box::new(OpenAiParser),
                Box::new(SimpleParser),
                Box::new(DelimitedParser),
            ],
        }
    }
}

impl ToolCallExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Extractor with no parsers, to be filled with `with_parser`
    pub fn empty() -> Self {
        Self {
            parsers: Vec::new(),
        }
    }

    pub fn with_parser(mut self, parser: Box<dyn ToolCallParser>) -> Self {
        self.parsers.push(parser);
        self
    }

    /// Tool calls in `text`. Empty means the text is a final answer.
    pub fn extract(&self, text: &str) -> Vec<ToolCall> {
        for parser in &self.parsers {
            if let Some(calls) = parser.parse(text) {
                if !calls.is_empty() {
                    tracing::debug!(parser = parser.name(), count = calls.len(), "Detected tool calls");
                    return calls;
                }
            }
        }
        Vec::new()
    }
}

/// Contents of fenced code blocks opened by a bare fence or a `json` fence.
///
/// Fence lines are matched after trimming; content lines are kept as written.
pub fn extract_fenced_blocks(text: &str) -> Vec<String> {
    if !text.contains(FENCE) {
        return Vec::new();
    }

    let mut blocks = Vec::new();
    let mut current: Option<Vec<&str>> = None;

    for line in text.split('\n') {
        let trimmed = line.trim();
        match current.as_mut() {
            None => {
                if trimmed == FENCE || trimmed.starts_with("```json") {
                    current = Some(Vec::new());
                }
            }
            Some(lines) => {
                if trimmed == FENCE {
                    if !lines.is_empty() {
                        blocks.push(lines.join("\n"));
                    }
                    current = None;
                } else {
                    lines.push(line);
                }
            }
        }
    }

    blocks
}

/// `text` itself, then each fenced block
fn candidates(text: &str) -> impl Iterator<Item = String> + '_ {
    std::iter::once(text.to_string()).chain(extract_fenced_blocks(text))
}

fn object_or_empty(value: Value) -> Value {
    match value {
        Value::Null => Value::Object(Map::new()),
        other => other,
    }
}

// ============================================================================
// OpenAI shape
// ============================================================================

pub struct OpenAiParser;

impl OpenAiParser {
    fn calls_from(value: &Value) -> Option<Vec<ToolCall>> {
        let entries = value.get("tool_calls")?.as_array()?;
        let calls: Vec<ToolCall> = entries
            .iter()
            .filter_map(|entry| {
                let function = entry.get("function")?;
                let name = function.get("name")?.as_str()?;
                if name.is_empty() {
                    return None;
                }
                let params = match function.get("arguments") {
                    None | Some(Value::Null) => Value::Object(Map::new()),
                    Some(Value::String(raw)) if raw.is_empty() => Value::Object(Map::new()),
                    // unparseable arguments are passed through as the raw string
                    Some(Value::String(raw)) => {
                        serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.clone()))
                    }
                    Some(other) => other.clone(),
                };
                Some(ToolCall {
                    id: entry
                        .get("id")
                        .and_then(Value::as_str)
                        .filter(|id| !id.is_empty())
                        .map(str::to_string),
                    name: name.to_string(),
                    params,
                })
            })
            .collect();
        (!calls.is_empty()).then_some(calls)
    }
}

impl ToolCallParser for OpenAiParser {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn parse(&self, text: &str) -> Option<Vec<ToolCall>> {
        candidates(text).find_map(|candidate| {
            let value: Value = serde_json::from_str(&candidate).ok()?;
            Self::calls_from(&value)
        })
    }
}

// ============================================================================
// Simple shape
// ============================================================================

pub struct SimpleParser;

impl SimpleParser {
    fn call_from(json: &str) -> Option<ToolCall> {
        let value: Value = serde_json::from_str(json).ok()?;
        let name = value.get("tool")?.as_str()?;
        if name.is_empty() {
            return None;
        }
        let params = value.get("params").cloned().unwrap_or(Value::Null);
        Some(ToolCall::new(name, object_or_empty(params)))
    }

    /// Byte range of the balanced object starting at `start`.
    ///
    /// Braces inside strings are ignored. A backslash skips the next byte
    /// wherever it appears.
    fn balanced_object(text: &str, start: usize) -> Option<&str> {
        let bytes = text.as_bytes();
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;

        for (i, &b) in bytes.iter().enumerate().skip(start) {
            if escaped {
                escaped = false;
                continue;
            }
            match b {
                b'\\' => escaped = true,
                b'"' => in_string = !in_string,
                b'{' if !in_string => depth += 1,
                b'}' if !in_string => {
                    depth = depth.saturating_sub(1);
                    if depth == 0 {
                        return text.get(start..=i);
                    }
                }
                _ => {}
            }
        }
        None
    }
}

impl ToolCallParser for SimpleParser {
    fn name(&self) -> &'static str {
        "simple"
    }

    fn parse(&self, text: &str) -> Option<Vec<ToolCall>> {
        if let Some(call) = candidates(text).find_map(|c| Self::call_from(&c)) {
            return Some(vec![call]);
        }

        // embedded in prose
        let start = text.find(SIMPLE_MARKER)?;
        let object = Self::balanced_object(text, start)?;
        Self::call_from(object).map(|call| vec![call])
    }
}

// ============================================================================
// Delimited shape
// ============================================================================

pub struct DelimitedParser;

#[derive(Deserialize)]
struct DelimitedCall {
    name: String,
    #[serde(default)]
    arguments: Option<Map<String, Value>>,
}

impl ToolCallParser for DelimitedParser {
    fn name(&self) -> &'static str {
        "delimited"
    }

    fn parse(&self, text: &str) -> Option<Vec<ToolCall>> {
        let start = text.find(DELIMITED_START)? + DELIMITED_START.len();
        let len = text[start..].find(DELIMITED_END)?;
        let body = text[start..start + len].trim();

        let parsed: Vec<DelimitedCall> = serde_json::from_str(body).ok()?;
        let calls: Vec<ToolCall> = parsed
            .into_iter()
            .filter(|call| !call.name.is_empty())
            .map(|call| ToolCall::new(call.name, Value::Object(call.arguments.unwrap_or_default())))
            .collect();
        (!calls.is_empty()).then_some(calls)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn extract(text: &str) -> Vec<ToolCall> {
        ToolCallExtractor::default().extract(text)
    }

    #[test]
    fn test_simple_literal() {
        let calls = extract(r#"{"tool":"file_move","params":{"source":"a","destination":"b"}}"#);
        assert_eq!(
            calls,
            vec![ToolCall::new("file_move", json!({"source": "a", "destination": "b"}))]
        );
    }

    #[test]
    fn test_simple_embedded_in_prose() {
        let calls = extract(r#"Sure, here: {"tool":"x","params":{}} thanks"#);
        assert_eq!(calls, vec![ToolCall::new("x", json!({}))]);
    }

    #[test]
    fn test_brace_matching_ignores_braces_in_strings() {
        let text = r#"ok {"tool":"echo","params":{"text":"a } b \" { c"}} done"#;
        let calls = extract(text);
        assert_eq!(calls, vec![ToolCall::new("echo", json!({"text": "a } b \" { c"}))]);
    }

    #[test]
    fn test_openai_in_fenced_block() {
        let text = r#"I'll call two tools.
```json
{"tool_calls": [
  {"id": "call_1", "type": "function", "function": {"name": "search", "arguments": "{\"q\": \"rust\"}"}},
  {"id": "call_2", "type": "function", "function": {"name": "clock", "arguments": ""}}
]}
```"#;
        let calls = extract(text);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].name, "search");
        assert_eq!(calls[0].id.as_deref(), Some("call_1"));
        assert_eq!(calls[0].params, json!({"q": "rust"}));
        assert_eq!(calls[1].name, "clock");
        assert_eq!(calls[1].params, json!({}));
    }

    #[test]
    fn test_openai_unparseable_arguments_stay_text() {
        let text = r#"{"tool_calls":[{"function":{"name":"a","arguments":"not json"}},{"function":{"name":""}}]}"#;
        let calls = extract(text);
        assert_eq!(calls, vec![ToolCall::new("a", json!("not json"))]);
    }

    #[test]
    fn test_delimited() {
        let text = r#"<tool_calls>
[{"name": "weather", "arguments": {"city": "Oslo"}}, {"name": "clock"}]
</tool_calls>"#;
        let calls = extract(text);
        assert_eq!(
            calls,
            vec![
                ToolCall::new("weather", json!({"city": "Oslo"})),
                ToolCall::new("clock", json!({})),
            ]
        );
    }

    #[test]
    fn test_plain_answer_has_no_calls() {
        assert!(extract("The capital of Norway is Oslo.").is_empty());
        assert!(extract(r#"{"tool": "", "params": {}}"#).is_empty());
        assert!(extract("<tool_calls>not json</tool_calls>").is_empty());
        assert!(extract(r#"broken {"tool":"x","params":{"#).is_empty());
    }

    #[test]
    fn test_openai_wins_over_simple() {
        let text = r#"{"tool":"simple","tool_calls":[{"function":{"name":"structured","arguments":"{}"}}]}"#;
        assert_eq!(extract(text)[0].name, "structured");
    }

    #[test]
    fn test_fenced_blocks() {
        let text = "a\n```json\n{\"x\": 1}\n```\ntext\n```\n```\n  ```\n  [1]\n  ```";
        // empty blocks are dropped, indented fences still match
        assert_eq!(extract_fenced_blocks(text), vec!["{\"x\": 1}", "  [1]"]);
        assert!(extract_fenced_blocks("no fences").is_empty());

        let python = "```python\nprint()\n```";
        assert!(extract_fenced_blocks(python).is_empty());
    }

    struct Shouting;

    impl ToolCallParser for Shouting {
        fn name(&self) -> &'static str {
            "shouting"
        }

        fn parse(&self, text: &str) -> Option<Vec<ToolCall>> {
            text.strip_prefix("CALL ")
                .map(|name| vec![ToolCall::new(name.trim(), json!({}))])
        }
    }

    #[test]
    fn test_custom_parser() {
        let extractor = ToolCallExtractor::empty().with_parser(Box::new(Shouting));
        assert_eq!(extractor.extract("CALL clock")[0].name, "clock");
        assert!(extractor.extract(r#"{"tool":"x"}"#).is_empty());
    }
}
