pub mod adapter;
pub mod dashscope;
pub mod null_recognizer;
pub mod recognizer_trait;
pub mod registry;

pub use adapter::{RecognitionEvent, RecognitionStreamAdapter};
pub use dashscope::DashScopeRecognizer;
pub use null_recognizer::NullRecognizer;
pub use recognizer_trait::{RecognitionParams, Recognizer};
pub use registry::RecognizerRegistry;
