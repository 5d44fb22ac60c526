//! Shared data types

pub mod message;
pub mod request;

pub use message::{last_user_message, ChatError, Message, Role};
pub use request::{GenerationRequest, GenerationResult, SamplingParams};
