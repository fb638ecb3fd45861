use crate::error::ConfigError;
use crate::types::ToolSchema;
use regex::Regex;
use serde::Deserialize;
use std::path::Path;

pub const DASHSCOPE_COMPATIBLE_BASE_URL: &str = "https://dashscope.aliyuncs.com/compatible-mode/v1";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub general: GeneralConfig,

    #[serde(default)]
    pub capture: CaptureSettings,

    #[serde(default)]
    pub asr: AsrConfig,

    #[serde(default)]
    pub chat: ChatConfig,

    #[serde(default)]
    pub messages: MessagesConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CaptureSettings {
    #[serde(default = "default_device_name")]
    pub device_name: String,

    /// Lower bound applied to the device's reported minimum buffer size.
    #[serde(default = "default_min_buffer_bytes")]
    pub min_buffer_bytes: usize,

    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Frames buffered ahead of the network before the oldest are evicted.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            device_name: default_device_name(),
            min_buffer_bytes: default_min_buffer_bytes(),
            read_timeout_ms: default_read_timeout_ms(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AsrConfig {
    #[serde(default = "default_asr_engine")]
    pub engine: String,

    #[serde(default)]
    pub api_key: String,

    #[serde(default = "default_true")]
    pub auto_stop: bool,

    /// Engine-specific tables, keyed by engine name (e.g. `[asr.dashscope]`).
    #[serde(flatten)]
    pub extra: toml::Value,
}

impl Default for AsrConfig {
    fn default() -> Self {
        Self {
            engine: default_asr_engine(),
            api_key: String::new(),
            auto_stop: default_true(),
            extra: toml::Value::Table(Default::default()),
        }
    }
}

impl AsrConfig {
    /// The configuration table of the selected engine, or an empty table.
    pub fn engine_config(&self) -> toml::Value {
        self.extra
            .get(&self.engine)
            .cloned()
            .unwrap_or_else(|| toml::Value::Table(Default::default()))
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChatVendor {
    #[default]
    OpenAi,
    DashScope,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChatConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default)]
    pub api_key: String,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default)]
    pub vendor: ChatVendor,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    #[serde(default)]
    pub system_prompt: Option<String>,

    #[serde(default)]
    pub tools: Vec<ToolSchema>,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: String::new(),
            model: default_model(),
            temperature: default_temperature(),
            vendor: ChatVendor::default(),
            connect_timeout_secs: default_connect_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            system_prompt: None,
            tools: Vec::new(),
        }
    }
}

impl ChatConfig {
    /// Base URL actually used for requests. DashScope mode pins the
    /// compatible-mode endpoint regardless of `base_url`.
    pub fn effective_base_url(&self) -> String {
        match self.vendor {
            ChatVendor::DashScope => DASHSCOPE_COMPATIBLE_BASE_URL.to_string(),
            ChatVendor::OpenAi => self.base_url.trim().trim_end_matches('/').to_string(),
        }
    }
}

/// User-facing message templates, overridable for localization.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct MessagesConfig {
    #[serde(default = "default_network_failure")]
    pub network_failure: String,

    #[serde(default = "default_timeout")]
    pub timeout: String,

    #[serde(default = "default_tls_failure")]
    pub tls_failure: String,

    #[serde(default = "default_generic_failure")]
    pub generic_failure: String,

    #[serde(default = "default_config_missing")]
    pub config_missing: String,

    #[serde(default = "default_cancelled")]
    pub cancelled: String,
}

impl Default for MessagesConfig {
    fn default() -> Self {
        Self {
            network_failure: default_network_failure(),
            timeout: default_timeout(),
            tls_failure: default_tls_failure(),
            generic_failure: default_generic_failure(),
            config_missing: default_config_missing(),
            cancelled: default_cancelled(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_device_name() -> String {
    "default".to_string()
}

fn default_min_buffer_bytes() -> usize {
    4096
}

fn default_read_timeout_ms() -> u64 {
    100
}

fn default_queue_capacity() -> usize {
    512
}

fn default_asr_engine() -> String {
    "dashscope".to_string()
}

fn default_true() -> bool {
    true
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_temperature() -> f32 {
    0.5
}

fn default_connect_timeout_secs() -> u64 {
    60
}

fn default_idle_timeout_secs() -> u64 {
    120
}

fn default_network_failure() -> String {
    "Network connection failed, check the network settings".to_string()
}

fn default_timeout() -> String {
    "The request timed out, try again later".to_string()
}

fn default_tls_failure() -> String {
    "Secure connection failed, check the network security settings".to_string()
}

fn default_generic_failure() -> String {
    "The request failed".to_string()
}

fn default_config_missing() -> String {
    "The endpoint URL or API key is not configured".to_string()
}

fn default_cancelled() -> String {
    "The request was cancelled".to_string()
}

/// Interpolate `${VAR}` patterns with environment variable values.
fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let re = Regex::new(r"\$\{([^}]+)\}").unwrap();
    let mut result = input.to_string();
    let mut errors = Vec::new();

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        match std::env::var(var_name) {
            Ok(val) => {
                result = result.replace(&cap[0], &val);
            }
            Err(_) => {
                errors.push(var_name.to_string());
            }
        }
    }

    if let Some(first_missing) = errors.into_iter().next() {
        return Err(ConfigError::EnvVarNotFound(first_missing));
    }

    Ok(result)
}

impl AppConfig {
    /// Load configuration from a TOML file, with environment variable interpolation.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let interpolated = interpolate_env_vars(s)?;
        let config: AppConfig = toml::from_str(&interpolated)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_parse_valid_toml() {
        let toml_str = r#"
[general]
log_level = "debug"

[capture]
device_name = "USB Microphone"
min_buffer_bytes = 8192

[asr]
engine = "dashscope"
api_key = "asr-key"
auto_stop = false

[asr.dashscope]
model = "paraformer-realtime-v2"

[chat]
base_url = "https://llm.example.com/v1/"
api_key = "sk-chat"
model = "deepseek-r1*"
temperature = 0.2

[[chat.tools]]
name = "get_weather"
description = "Look up the weather"
parameters = { city = { type = "string" } }
required = ["city"]
"#;
        let config = AppConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.general.log_level, "debug");
        assert_eq!(config.capture.device_name, "USB Microphone");
        assert_eq!(config.capture.min_buffer_bytes, 8192);
        assert_eq!(config.asr.api_key, "asr-key");
        assert!(!config.asr.auto_stop);
        assert_eq!(
            config.asr.engine_config().get("model").and_then(|v| v.as_str()),
            Some("paraformer-realtime-v2")
        );
        assert_eq!(config.chat.effective_base_url(), "https://llm.example.com/v1");
        assert_eq!(config.chat.model, "deepseek-r1*");
        assert_eq!(config.chat.temperature, 0.2);
        assert_eq!(config.chat.tools.len(), 1);
        assert_eq!(config.chat.tools[0].required, vec!["city"]);
        assert_eq!(config.chat.tools[0].parameters["city"]["type"], "string");
    }

    #[test]
    fn test_config_default_values() {
        let config = AppConfig::from_toml_str("").unwrap();
        assert_eq!(config.general.log_level, "info");
        assert_eq!(config.capture.device_name, "default");
        assert_eq!(config.capture.min_buffer_bytes, 4096);
        assert_eq!(config.capture.read_timeout_ms, 100);
        assert_eq!(config.asr.engine, "dashscope");
        assert!(config.asr.api_key.is_empty());
        assert!(config.asr.auto_stop);
        assert_eq!(config.chat.temperature, 0.5);
        assert_eq!(config.chat.vendor, ChatVendor::OpenAi);
        assert_eq!(config.chat.connect_timeout_secs, 60);
        assert!(config.chat.tools.is_empty());
        assert_eq!(config.messages, MessagesConfig::default());
    }

    #[test]
    fn test_config_engine_config_missing_table_is_empty() {
        let config = AppConfig::from_toml_str("[asr]\nengine = \"null\"\n").unwrap();
        let table = config.asr.engine_config();
        assert!(table.as_table().unwrap().is_empty());
    }

    #[test]
    fn test_config_dashscope_vendor_pins_base_url() {
        let toml_str = r#"
[chat]
vendor = "dashscope"
base_url = "https://ignored.example.com"
"#;
        let config = AppConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.chat.vendor, ChatVendor::DashScope);
        assert_eq!(config.chat.effective_base_url(), DASHSCOPE_COMPATIBLE_BASE_URL);
    }

    #[test]
    fn test_config_localized_messages() {
        let toml_str = r#"
[messages]
timeout = "请求超时"
"#;
        let config = AppConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.messages.timeout, "请求超时");
        assert_eq!(config.messages.cancelled, "The request was cancelled");
    }

    #[test]
    fn test_config_env_var_interpolation() {
        std::env::set_var("VOXCHAT_TEST_KEY", "secret123");
        let toml_str = r#"
[chat]
api_key = "${VOXCHAT_TEST_KEY}"
"#;
        let config = AppConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.chat.api_key, "secret123");
        std::env::remove_var("VOXCHAT_TEST_KEY");
    }

    #[test]
    fn test_config_missing_env_var_error() {
        let toml_str = r#"
[asr]
api_key = "${DEFINITELY_DOES_NOT_EXIST_12345}"
"#;
        let err = AppConfig::from_toml_str(toml_str).unwrap_err();
        assert!(err.to_string().contains("DEFINITELY_DOES_NOT_EXIST_12345"));
    }

    #[test]
    fn test_config_invalid_toml_error() {
        let result = AppConfig::from_toml_str("this is not valid toml [[[");
        assert!(result.is_err());
    }

    #[test]
    fn test_config_load_from_file() {
        let dir = std::env::temp_dir().join("voxchat_test_config");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("test.toml");
        std::fs::write(
            &path,
            r#"
[general]
log_level = "warn"

[capture]
queue_capacity = 64
"#,
        )
        .unwrap();

        let config = AppConfig::load_from_file(&path).unwrap();
        assert_eq!(config.general.log_level, "warn");
        assert_eq!(config.capture.queue_capacity, 64);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_config_load_from_file_not_found() {
        let result = AppConfig::load_from_file(Path::new("/nonexistent/path.toml"));
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("failed to read config file"));
    }
}
