use serde::Deserialize;

// ── Capture ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelLayout {
    Mono,
    Stereo,
}

impl ChannelLayout {
    pub fn channels(self) -> u16 {
        match self {
            ChannelLayout::Mono => 1,
            ChannelLayout::Stereo => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleEncoding {
    /// Signed 16-bit little-endian PCM.
    Pcm16,
}

impl SampleEncoding {
    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleEncoding::Pcm16 => 2,
        }
    }
}

/// Which logical input the device should record from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Microphone,
    Default,
    VoiceRecognition,
    VoiceCommunication,
}

/// A capture configuration accepted by the device. Fixed for the lifetime of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConfig {
    pub sample_rate: u32,
    pub channel_layout: ChannelLayout,
    pub sample_encoding: SampleEncoding,
    pub source_kind: SourceKind,
    pub buffer_frame_bytes: usize,
}

impl CaptureConfig {
    /// Size in bytes of one sample across all channels.
    pub fn bytes_per_frame(&self) -> usize {
        self.sample_encoding.bytes_per_sample() * self.channel_layout.channels() as usize
    }
}

/// A chunk of captured PCM bytes. Frames are ordered by arrival only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub bytes: Vec<u8>,
}

impl AudioFrame {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Average interleaved stereo PCM16 down to mono. A trailing partial
    /// sample pair is dropped.
    pub fn downmix_stereo_pcm16(&self) -> AudioFrame {
        let bytes = self
            .bytes
            .chunks_exact(4)
            .flat_map(|pair| {
                let left = i16::from_le_bytes([pair[0], pair[1]]) as i32;
                let right = i16::from_le_bytes([pair[2], pair[3]]) as i32;
                (((left + right) / 2) as i16).to_le_bytes()
            })
            .collect();
        AudioFrame { bytes }
    }
}

// ── Recognition ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptEvent {
    pub text: String,
    pub is_final: bool,
}

// ── Conversation ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
    ToolResult,
}

/// A tool invocation recorded on a turn. `id == None` marks the legacy
/// function-call form that predates tool call ids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolCall {
    pub id: Option<String>,
    pub function_name: String,
    pub arguments: String,
    pub result: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentKind {
    /// Base64-encoded JPEG data.
    Image,
    Text,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub kind: AttachmentKind,
    pub payload: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationTurn {
    pub role: Role,
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
    pub attachments: Vec<Attachment>,
}

impl ConversationTurn {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
            tool_calls: Vec::new(),
            attachments: Vec::new(),
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, text)
    }

    pub fn with_tool_call(mut self, call: ToolCall) -> Self {
        self.tool_calls.push(call);
        self
    }

    pub fn with_attachment(mut self, kind: AttachmentKind, payload: impl Into<String>) -> Self {
        self.attachments.push(Attachment {
            kind,
            payload: payload.into(),
        });
        self
    }
}

/// A tool call streamed back by the model, assembled from argument fragments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingToolCall {
    pub tool_id: String,
    pub name: String,
    pub arguments: String,
}

/// A function the model may call. `parameters` holds the JSON-schema
/// `properties` object.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ToolSchema {
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default = "empty_object")]
    pub parameters: serde_json::Value,

    #[serde(default)]
    pub required: Vec<String>,
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(Default::default())
}
