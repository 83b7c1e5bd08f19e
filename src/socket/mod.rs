//! # Socket Front End
//!
//! Websocket endpoint authenticating callers with bearer tokens and
//! dispatching their messages to the engine.

pub mod auth;
pub mod protocol;
pub mod server;

pub use auth::{TokenError, TokenVerifier};
pub use protocol::{ClientMessage, ServerMessage};
pub use server::SocketServer;
