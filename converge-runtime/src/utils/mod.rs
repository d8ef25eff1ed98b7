//! Helpers for composing the runtime's streams and lifecycles.
mod ready_token;
mod stream_backoff;

pub use ready_token::ReadyToken;
pub use stream_backoff::StreamBackoff;
