//! Chat-completion HTTP client with line-streamed deltas for Conduit.

mod client;
mod sse;
mod stream;
mod wire;

pub use client::{ANTHROPIC_VERSION, ChatClient};
pub use stream::DeltaStream;
