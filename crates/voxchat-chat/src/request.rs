use crate::tools::ToolSet;
use regex::Regex;
use serde_json::{json, Value};
use std::sync::OnceLock;
use voxchat_core::{AttachmentKind, ChatConfig, ConversationTurn, Role, ToolCall};

/// Emitted before the first reasoning delta of a response.
pub const REASONING_OPEN: &str = "<think>\n";
/// Emitted when the first content delta follows reasoning.
pub const REASONING_CLOSE: &str = "\n</think>\n";

fn reasoning_block() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)^<think>\n.*?\n</think>\n").unwrap())
}

/// Remove a leading reasoning block so the model never sees its own
/// earlier reasoning.
pub fn strip_reasoning(text: &str) -> String {
    reasoning_block().replace(text, "").into_owned()
}

/// A trailing `*` marks a user-defined model name and is not sent.
pub fn normalize_model(model: &str) -> &str {
    model.strip_suffix('*').unwrap_or(model)
}

/// Per-request parameters.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub model: String,
    pub temperature: f32,
    pub tools: ToolSet,
}

impl RequestOptions {
    pub fn from_config(config: &ChatConfig) -> Self {
        Self {
            model: config.model.clone(),
            temperature: config.temperature,
            tools: ToolSet::from(config.tools.clone()),
        }
    }
}

/// Build a streaming chat completion body.
///
/// Turns without attachments use plain string content. If any turn carries
/// an attachment every message switches to content-part lists.
pub fn build_request(turns: &[ConversationTurn], options: &RequestOptions) -> Value {
    let structured = turns.iter().any(|t| !t.attachments.is_empty());
    let messages: Vec<Value> = turns
        .iter()
        .filter_map(|turn| message_json(turn, structured))
        .collect();

    let mut body = json!({
        "model": normalize_model(&options.model),
        "messages": messages,
        "temperature": options.temperature,
        "stream": true,
    });
    if !options.tools.is_empty() {
        body["tools"] = Value::Array(options.tools.to_json());
        body["tool_choice"] = json!("auto");
    }
    body
}

fn message_json(turn: &ConversationTurn, structured: bool) -> Option<Value> {
    match turn.role {
        Role::System => Some(json!({ "role": "system", "content": content(turn, structured) })),
        Role::User => Some(json!({ "role": "user", "content": content(turn, structured) })),
        Role::Assistant => match turn.tool_calls.first() {
            Some(first) => Some(assistant_calls_json(&turn.tool_calls, first, structured)),
            None => Some(json!({ "role": "assistant", "content": content(turn, structured) })),
        },
        Role::ToolResult => {
            let Some(first) = turn.tool_calls.first() else {
                tracing::warn!("tool result turn without a tool call, skipping");
                return None;
            };
            let content = if structured {
                content(turn, true)
            } else {
                json!(first.result.clone().unwrap_or_default())
            };
            // The first call decides the form for the whole turn
            Some(match &first.id {
                Some(id) => json!({
                    "role": "tool",
                    "tool_call_id": id,
                    "name": first.function_name,
                    "content": content,
                }),
                None => json!({
                    "role": "function",
                    "name": first.function_name,
                    "content": content,
                }),
            })
        }
    }
}

fn assistant_calls_json(calls: &[ToolCall], first: &ToolCall, structured: bool) -> Value {
    let mut message = match first.id {
        Some(_) => {
            let tool_calls: Vec<Value> = calls
                .iter()
                .map(|call| {
                    json!({
                        "id": call.id.clone().unwrap_or_default(),
                        "type": "function",
                        "function": {
                            "name": call.function_name,
                            "arguments": call.arguments,
                        }
                    })
                })
                .collect();
            json!({ "role": "assistant", "tool_calls": tool_calls })
        }
        // Legacy form carries a single call
        None => json!({
            "role": "assistant",
            "function_call": {
                "name": first.function_name,
                "arguments": first.arguments,
            }
        }),
    };
    if !structured {
        message["content"] = json!("");
    }
    message
}

fn visible_text(turn: &ConversationTurn) -> String {
    match turn.role {
        Role::Assistant => strip_reasoning(&turn.text),
        _ => turn.text.clone(),
    }
}

fn content(turn: &ConversationTurn, structured: bool) -> Value {
    if !structured {
        return json!(visible_text(turn));
    }

    let mut parts = Vec::new();
    let text = visible_text(turn);
    if !text.is_empty() {
        parts.push(json!({ "type": "text", "text": text }));
    }
    for result in turn.tool_calls.iter().filter_map(|c| c.result.as_deref()) {
        parts.push(json!({ "type": "text", "text": result }));
    }
    for attachment in &turn.attachments {
        parts.push(match attachment.kind {
            AttachmentKind::Image => json!({
                "type": "image_url",
                "image_url": { "url": format!("data:image/jpeg;base64,{}", attachment.payload) }
            }),
            AttachmentKind::Text => json!({ "type": "text", "text": attachment.payload }),
        });
    }
    if parts.is_empty() {
        parts.push(json!({ "type": "text", "text": "" }));
    }
    Value::Array(parts)
}
