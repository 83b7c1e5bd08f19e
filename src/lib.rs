//! aerolive - access-controlled live queries over a mutable document store
//!
//! Objects carry visibility contexts; queries are rewritten so they can only
//! see objects whose contexts admit them. A broker follows the store's change
//! feed and streams matches to subscribed sockets.

pub mod broker;
pub mod bus;
pub mod cli;
pub mod config;
pub mod engine;
pub mod errors;
pub mod mutation;
pub mod object;
pub mod observability;
pub mod query;
pub mod registry;
pub mod rewrite;
pub mod socket;
pub mod store;
pub mod streamer;

pub use config::EngineConfig;
pub use engine::{Engine, Topology};
pub use errors::{LiveError, LiveResult};
