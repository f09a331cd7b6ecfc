pub mod message;
pub mod response;

pub use message::{ContentPart, ImageSource, Message, MessageRole, conversation_char_count};
pub use response::{FinishReason, FunctionCallRequest, Response, TokenUsage};
