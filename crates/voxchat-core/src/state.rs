/// Lifecycle of a recognition session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecognitionSessionState {
    #[default]
    Idle,
    Initializing,
    Capturing,
    Streaming,
    Stopping,
    Stopped,
    Failed,
}

impl RecognitionSessionState {
    /// States in which a worker owns the device or the network stream.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            RecognitionSessionState::Initializing
                | RecognitionSessionState::Capturing
                | RecognitionSessionState::Streaming
        )
    }

    pub fn as_u8(self) -> u8 {
        match self {
            RecognitionSessionState::Idle => 0,
            RecognitionSessionState::Initializing => 1,
            RecognitionSessionState::Capturing => 2,
            RecognitionSessionState::Streaming => 3,
            RecognitionSessionState::Stopping => 4,
            RecognitionSessionState::Stopped => 5,
            RecognitionSessionState::Failed => 6,
        }
    }

    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => RecognitionSessionState::Initializing,
            2 => RecognitionSessionState::Capturing,
            3 => RecognitionSessionState::Streaming,
            4 => RecognitionSessionState::Stopping,
            5 => RecognitionSessionState::Stopped,
            6 => RecognitionSessionState::Failed,
            _ => RecognitionSessionState::Idle,
        }
    }
}
