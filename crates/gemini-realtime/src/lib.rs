//! Gemini Live API client for the relay.
//!
//! - `types`: wire format of the `BidiGenerateContent` protocol.
//! - `session`: a connected session implementing `relay_core::UpstreamSession`.
//! - `factory`: builds setup messages and opens sessions (`relay_core::UpstreamFactory`).

pub mod factory;
pub mod session;
pub mod types;

pub use factory::{DEFAULT_ENDPOINT, GeminiSessionFactory};
pub use session::GeminiLiveSession;
