use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("environment variable not found: {0}")]
    EnvVarNotFound(String),
}

#[derive(Debug, Error)]
pub enum AudioError {
    #[error("no capture configuration could be initialized")]
    DeviceUnavailable,

    #[error("audio input is held by another session")]
    DeviceBusy,

    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("failed to enumerate devices: {0}")]
    DeviceEnumeration(String),

    #[error("failed to build stream: {0}")]
    StreamBuild(String),

    #[error("failed to start recording: {0}")]
    StartFailed(String),

    #[error("audio read failed: {0}")]
    DeviceReadFailure(String),

    #[error("capture session is not open")]
    NotOpen,
}

#[derive(Debug, Error)]
pub enum AsrError {
    #[error("ASR credential is not set")]
    CredentialMissing,

    #[error("a recognition session is already active")]
    SessionActive,

    #[error("no event sender registered")]
    NoEventSender,

    #[error("ASR engine not found: {0}")]
    EngineNotFound(String),

    #[error("ASR initialization failed: {0}")]
    InitializationFailed(String),

    #[error("recognition transport failed: {0}")]
    Transport(TransportError),

    #[error("unexpected recognition payload: {0}")]
    Protocol(String),

    #[error("recognition service error {code}: {message}")]
    Vendor { code: String, message: String },

    #[error(transparent)]
    Device(#[from] AudioError),
}

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("a completion request is already streaming")]
    AlreadyStreaming,

    #[error("chat credential is not set")]
    CredentialMissing,

    #[error("chat credential is malformed: {0}")]
    CredentialMalformed(String),

    #[error("chat endpoint is misconfigured: {0}")]
    EndpointMisconfigured(String),

    #[error("failed to build HTTP client: {0}")]
    ClientBuild(String),
}

/// Transport-level failure of a streaming request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("TLS handshake failed: {0}")]
    Tls(String),

    /// The stream was torn down because the caller cancelled it.
    #[error("stream reset")]
    StreamReset,

    #[error("{0}")]
    Other(String),
}
