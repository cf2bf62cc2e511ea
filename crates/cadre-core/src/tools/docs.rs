//! Markdown documentation of tools for the system prompt

use serde_json::Value;
use std::fmt::Write;
use std::sync::Arc;

use super::Tool;

const USAGE_FORMAT: &str = concat!(
    "### Tool Usage Format\n\n",
    "To use a tool, respond with JSON in one of these formats:\n\n",
    "**Simple format:**\n",
    "```json\n",
    r#"{"tool": "tool_name", "params": {...}}"#,
    "\n```\n\n",
    "**OpenAI format:**\n",
    "```json\n",
    r#"{"tool_calls": [{"id": "call_1", "type": "function", "function": {"name": "tool_name", "arguments": "{...}"}}]}"#,
    "\n```\n",
);

/// System prompt followed by the tool catalog. Without tools this is the
/// system prompt unchanged.
pub fn system_content(system_prompt: &str, tools: &[Arc<dyn Tool>]) -> String {
    let mut content = system_prompt.to_string();
    if tools.is_empty() {
        return content;
    }

    if !content.is_empty() {
        content.push_str("\n\n");
    }
    content.push_str("## Available Tools\n\n");
    for tool in tools {
        content.push_str(&tool_doc(tool.as_ref()));
        content.push_str("\n---\n\n");
    }
    content.push_str(USAGE_FORMAT);
    content
}

/// Markdown section describing one tool
pub fn tool_doc(tool: &dyn Tool) -> String {
    let meta = tool.metadata();
    let mut doc = String::new();

    let _ = write!(doc, "### {}\n\n", tool.name());
    let _ = write!(doc, "**Description:** {}\n\n", tool.description());

    if !meta.version.is_empty() {
        let _ = write!(doc, "**Version:** {}", meta.version);
        if !meta.category.is_empty() {
            let _ = write!(doc, " | **Category:** {}", meta.category);
        }
        doc.push_str("\n\n");
    }

    doc.push_str("**Characteristics:**\n");
    let _ = writeln!(doc, "- Deterministic: {}", meta.is_deterministic);
    let _ = writeln!(doc, "- Destructive: {}", meta.is_destructive);
    let _ = writeln!(doc, "- Requires Confirmation: {}", meta.requires_confirmation);
    let _ = write!(doc, "- Estimated Latency: {}\n\n", meta.estimated_latency);

    if !meta.usage_instructions.is_empty() {
        doc.push_str("**Usage Instructions:**\n");
        doc.push_str(&meta.usage_instructions);
        doc.push_str("\n\n");
    }

    let params = tool.parameters_schema();
    if !params.is_null() {
        doc.push_str("**Parameters:**\n");
        doc.push_str(&format_schema(&params, "  "));
        doc.push('\n');
    }

    if let Some(output) = &meta.output_schema {
        doc.push_str("**Returns:**\n");
        doc.push_str(&format_schema(output, "  "));
        doc.push('\n');
    }

    if !meta.constraints.is_empty() {
        doc.push_str("**Constraints:**\n");
        for constraint in &meta.constraints {
            let _ = writeln!(doc, "- {}", constraint);
        }
        doc.push('\n');
    }

    if !meta.examples.is_empty() {
        doc.push_str("**Examples:**\n\n");
        for (i, example) in meta.examples.iter().enumerate() {
            let _ = writeln!(doc, "*Example {}: {}*", i + 1, example.name);
            if !example.description.is_empty() {
                let _ = writeln!(doc, "Description: {}", example.description);
            }
            if !example.scenario.is_empty() {
                let _ = writeln!(doc, "When to use: {}", example.scenario);
            }
            doc.push_str("\nInput:\n```json\n");
            doc.push_str(&pretty(&example.input));
            doc.push_str("\n```\n\nOutput:\n```json\n");
            doc.push_str(&pretty(&example.output));
            doc.push_str("\n```\n");
            if !example.explanation.is_empty() {
                let _ = writeln!(doc, "\nExplanation: {}", example.explanation);
            }
            doc.push('\n');
        }
    }

    if !meta.error_guidance.is_empty() {
        doc.push_str("**Error Handling:**\n");
        for (kind, guidance) in &meta.error_guidance {
            let _ = writeln!(doc, "- `{}`: {}", kind, guidance);
        }
        doc.push('\n');
    }

    if !meta.tags.is_empty() {
        let _ = writeln!(doc, "**Tags:** {}", meta.tags.join(", "));
    }

    doc
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

fn str_field<'a>(value: &'a Value, key: &str) -> &'a str {
    value.get(key).and_then(Value::as_str).unwrap_or_default()
}

/// Readable rendering of a JSON schema: type, description, and for objects
/// each property with its type, requiredness, and allowed values.
pub fn format_schema(schema: &Value, indent: &str) -> String {
    if schema.is_null() {
        return format!("{}No schema defined\n", indent);
    }

    let mut out = String::new();
    let schema_type = str_field(schema, "type");
    let description = str_field(schema, "description");
    let required: Vec<&str> = schema
        .get("required")
        .and_then(Value::as_array)
        .map(|r| r.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    if !schema_type.is_empty() {
        let _ = writeln!(out, "{}Type: {}", indent, schema_type);
    }
    if !description.is_empty() {
        let _ = writeln!(out, "{}Description: {}", indent, description);
    }

    if schema_type == "object" {
        if let Some(props) = schema.get("properties").and_then(Value::as_object) {
            if !props.is_empty() {
                let _ = writeln!(out, "{}Properties:", indent);
            }
            for (name, prop) in props {
                let marker = if required.contains(&name.as_str()) {
                    ", required"
                } else {
                    ""
                };
                let _ = write!(out, "{}  - {} ({}{})", indent, name, str_field(prop, "type"), marker);
                let prop_desc = str_field(prop, "description");
                if !prop_desc.is_empty() {
                    let _ = write!(out, ": {}", prop_desc);
                }
                out.push('\n');

                let allowed: Vec<String> = prop
                    .get("enum")
                    .and_then(Value::as_array)
                    .map(|values| {
                        values
                            .iter()
                            .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
                            .collect()
                    })
                    .unwrap_or_default();
                if !allowed.is_empty() {
                    let _ = writeln!(out, "{}    Allowed values: {}", indent, allowed.join(", "));
                }
            }
        }

        if !required.is_empty() {
            let _ = writeln!(out, "{}Required fields: {}", indent, required.join(", "));
        }
    }

    out
}
