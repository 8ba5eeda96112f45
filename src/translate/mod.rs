//! API translation between `OpenAI` and Anthropic formats.
//!
//! The core of the bridge: converts requests, responses, and streaming events
//! between the two API formats. All translation functions are pure (no I/O).

pub mod anthropic_types;
pub mod openai_types;
pub mod request;
pub mod response;
pub mod streaming;
