//! WebSocket Session Relay
//!
//! Each client connection is bridged to one upstream live session:
//!
//! - `protocol`: The JSON message format spoken with the browser client.
//! - `session`: The connection lifecycle, from setup to cleanup.
//! - `supervisor`: Runs both pumps and decides how a session ends.
//! - `client_pump` / `upstream_pump`: Move messages in each direction.
//! - `content`: Turn-level handling of model output and audio accumulation.
//! - `tool_queue`: Serialized execution of model tool calls.

pub mod client_pump;
pub mod content;
pub mod outbound;
pub mod protocol;
pub mod session;
pub mod supervisor;
pub mod task;
pub mod tool_queue;
pub mod upstream_pump;

pub use session::ws_handler;
