//! Multi-provider LLM client.
//!
//! Requests are encoded from one canonical conversation model into the wire
//! format of Anthropic Messages, OpenAI Chat Completions, the OpenAI
//! Responses API or Gemini `generateContent`. Responses, streamed or not,
//! come back as canonical [`Response`]s or as a single canonical
//! [`Event`](protocol::canonical::Event) stream.

pub mod config;
pub mod error;
pub mod observability;
pub mod protocol;
pub mod provider;
pub mod stream;
pub mod transport;

mod util;

pub use config::{load_config, ClientConfig, ConfigError};
pub use error::{ErrorCategory, LlmError};
pub use protocol::canonical::{
    ContentBlock, Delta, Event, GenerateOptions, Message, ProviderKind, Response, Role,
    StopReason, Usage,
};
pub use provider::{Provider, ProviderRegistry};
pub use stream::{EventStream, ResponseAccumulator};
pub use transport::{HttpTransport, RetryPolicy};
pub use tokio_util::sync::CancellationToken;
