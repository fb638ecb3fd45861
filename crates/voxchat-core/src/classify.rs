//! Maps HTTP status codes, vendor error payloads and transport failures to a
//! user-facing [`ErrorCategory`] with a readable message.

use crate::config::MessagesConfig;
use crate::error::TransportError;
use serde_json::Value;

/// Upper bound on the length of messages surfaced through `onError`.
pub const MAX_ERROR_MESSAGE_CHARS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    AuthInvalid,
    QuotaExceeded,
    RateLimited,
    ModelNotFound,
    EndpointNotFound,
    Network,
    ServerError,
    Cancelled,
    Unknown,
}

impl ErrorCategory {
    /// Remediation hint shown to the user, if any.
    pub fn hint(self) -> Option<&'static str> {
        match self {
            ErrorCategory::AuthInvalid => Some("check that the API key is correct and has not expired"),
            ErrorCategory::QuotaExceeded => Some("the account balance or quota is exhausted, top it up"),
            ErrorCategory::RateLimited => Some("requests are too frequent, wait a moment and retry"),
            ErrorCategory::ModelNotFound => Some("check that the model name is correct"),
            ErrorCategory::EndpointNotFound => Some("check the endpoint base URL"),
            ErrorCategory::ServerError => Some("the server failed internally, retry later"),
            ErrorCategory::Network => Some("check the network connection"),
            ErrorCategory::Cancelled | ErrorCategory::Unknown => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub category: ErrorCategory,
    pub message: String,
    pub hint: Option<String>,
}

impl Classification {
    fn new(category: ErrorCategory, message: String) -> Self {
        Self {
            category,
            message,
            hint: category.hint().map(str::to_string),
        }
    }

    /// Message plus hint, truncated to [`MAX_ERROR_MESSAGE_CHARS`].
    pub fn user_message(&self) -> String {
        let full = match &self.hint {
            Some(hint) => format!("{}\n\nhint: {}", self.message, hint),
            None => self.message.clone(),
        };
        truncate_message(&full, MAX_ERROR_MESSAGE_CHARS)
    }
}

/// Cut `message` to at most `max_chars` characters, marking the cut with `...`.
pub fn truncate_message(message: &str, max_chars: usize) -> String {
    match message.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &message[..cut]),
        None => message.to_string(),
    }
}

#[derive(Debug, Clone, Default)]
pub struct ErrorClassifier {
    messages: MessagesConfig,
}

impl ErrorClassifier {
    pub fn new(messages: MessagesConfig) -> Self {
        Self { messages }
    }

    pub fn messages(&self) -> &MessagesConfig {
        &self.messages
    }

    /// Best-effort classification. Never fails.
    pub fn classify(
        &self,
        status: Option<u16>,
        body: Option<&str>,
        transport: Option<&TransportError>,
    ) -> Classification {
        if status.is_none() {
            if let Some(err) = transport {
                return self.classify_transport(err);
            }
        }

        let body = body.unwrap_or("");
        if let Ok(json) = serde_json::from_str::<Value>(body) {
            if let Some(c) = classify_nested_envelope(&json, status) {
                return c;
            }
            if let Some(c) = classify_flat_envelope(&json, status) {
                return c;
            }
        }

        match status {
            Some(code) => classify_status(code, body),
            None if !body.is_empty() => Classification::new(ErrorCategory::Unknown, body.to_string()),
            None => Classification::new(ErrorCategory::Unknown, self.messages.generic_failure.clone()),
        }
    }

    pub fn classify_transport(&self, err: &TransportError) -> Classification {
        match err {
            TransportError::Timeout => {
                Classification::new(ErrorCategory::Network, self.messages.timeout.clone())
            }
            TransportError::Connect(_) => {
                Classification::new(ErrorCategory::Network, self.messages.network_failure.clone())
            }
            TransportError::Tls(_) => {
                Classification::new(ErrorCategory::Network, self.messages.tls_failure.clone())
            }
            TransportError::StreamReset => {
                Classification::new(ErrorCategory::Cancelled, self.messages.cancelled.clone())
            }
            TransportError::Other(detail) => Classification::new(
                ErrorCategory::Unknown,
                format!("{}: {}", self.messages.generic_failure, detail),
            ),
        }
    }
}

/// Shorthand for classification with the default message templates.
pub fn classify(
    status: Option<u16>,
    body: Option<&str>,
    transport: Option<&TransportError>,
) -> Classification {
    ErrorClassifier::default().classify(status, body, transport)
}

fn json_str(value: &Value, key: &str) -> String {
    match value.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

fn code_category(code: &str, message: &str) -> Option<ErrorCategory> {
    let code = code.to_ascii_lowercase();
    let message = message.to_ascii_lowercase();

    if matches!(code.as_str(), "invalidapikey" | "invalid_api_key")
        || message.contains("api key")
        || message.contains("api_key")
    {
        Some(ErrorCategory::AuthInvalid)
    } else if matches!(
        code.as_str(),
        "insufficientbalance" | "insufficient_quota" | "arrearage"
    ) || message.contains("balance")
        || message.contains("quota")
    {
        Some(ErrorCategory::QuotaExceeded)
    } else if matches!(
        code.as_str(),
        "ratelimitexceeded" | "rate_limit_exceeded" | "throttling"
    ) || message.contains("rate limit")
    {
        Some(ErrorCategory::RateLimited)
    } else if matches!(code.as_str(), "modelnotfound" | "model_not_found")
        || (message.contains("model")
            && (message.contains("not found") || message.contains("not exist")))
    {
        Some(ErrorCategory::ModelNotFound)
    } else {
        None
    }
}

fn status_category(status: Option<u16>) -> ErrorCategory {
    match status {
        Some(401) => ErrorCategory::AuthInvalid,
        Some(403) => ErrorCategory::QuotaExceeded,
        Some(404) => ErrorCategory::EndpointNotFound,
        Some(429) => ErrorCategory::RateLimited,
        Some(500..=599) => ErrorCategory::ServerError,
        _ => ErrorCategory::Unknown,
    }
}

/// `{"error": {"message", "code", "type"}}` or `{"error": "..."}`.
fn classify_nested_envelope(json: &Value, status: Option<u16>) -> Option<Classification> {
    let error = json.get("error")?;

    if let Some(text) = error.as_str() {
        let category = code_category("", text).unwrap_or_else(|| status_category(status));
        return Some(Classification::new(category, format!("error message: {text}")));
    }
    if !error.is_object() {
        return None;
    }

    let message = json_str(error, "message");
    let code = json_str(error, "code");
    let kind = json_str(error, "type");

    let mut text = String::new();
    if !code.is_empty() {
        text.push_str(&format!("error code: {code}\n"));
    }
    if !kind.is_empty() {
        text.push_str(&format!("error type: {kind}\n"));
    }
    if message.is_empty() {
        text.push_str("unknown error");
    } else {
        text.push_str(&format!("error message: {message}"));
    }

    let category = code_category(&code, &message).unwrap_or_else(|| status_category(status));
    Some(Classification::new(category, text))
}

/// `{"code", "message", "request_id"}` or `{"detail": ...}`.
fn classify_flat_envelope(json: &Value, status: Option<u16>) -> Option<Classification> {
    if let Some(message) = json.get("message").and_then(Value::as_str) {
        let code = json_str(json, "code");
        let request_id = json_str(json, "request_id");

        let mut text = format!("error: {message}");
        if !code.is_empty() {
            text.push_str(&format!("\nerror code: {code}"));
        }
        if !request_id.is_empty() {
            text.push_str(&format!("\nrequest id: {request_id}"));
        }
        let category = code_category(&code, message).unwrap_or_else(|| status_category(status));
        return Some(Classification::new(category, text));
    }

    let detail = json.get("detail")?;
    let detail = match detail {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    Some(Classification::new(status_category(status), format!("error: {detail}")))
}

fn classify_status(status: u16, body: &str) -> Classification {
    let category = status_category(Some(status));
    let mut text = format!("HTTP {status} error");
    let cause = match category {
        ErrorCategory::AuthInvalid => Some("the API key is invalid or expired"),
        ErrorCategory::QuotaExceeded => Some("no access permission or insufficient balance"),
        ErrorCategory::EndpointNotFound => Some("the endpoint does not exist"),
        ErrorCategory::RateLimited => Some("too many requests"),
        ErrorCategory::ServerError => Some("internal server error"),
        _ => None,
    };
    if let Some(cause) = cause {
        text.push_str(&format!("\npossible cause: {cause}"));
    }
    if !body.is_empty() {
        text.push_str(&format!("\n\nraw response: {body}"));
    }
    Classification::new(category, text)
}
