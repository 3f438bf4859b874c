//! Live Session Relay Library Crate
//!
//! This library contains the core logic of the relay service: configuration,
//! shared application state, the session registry, the WebSocket relay, the
//! tool executor and the persisted-audio sink. The `relay` binary is a thin
//! wrapper around this library.

pub mod audio;
pub mod config;
pub mod error;
pub mod registry;
pub mod router;
pub mod state;
pub mod tools;
pub mod ws;

#[cfg(test)]
pub(crate) mod testing;
