pub mod client;
pub mod request;
pub mod stream;
pub mod tools;

pub use client::ChatClient;
pub use request::{build_request, normalize_model, strip_reasoning, RequestOptions};
pub use stream::{consume_events, ChatEvent, StreamingAnswer};
pub use tools::ToolSet;
