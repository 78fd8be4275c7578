pub mod chat;
pub mod client;

pub use chat::{Completion, Conversation, Transcript};
pub use client::{
    ChatRequest, ChatResponse, GptClient, GptClientError, GptClientErrorKind, GptClientOption,
    HandleResult, Message, OpenAIKey, OpenAIModel, Role,
};
