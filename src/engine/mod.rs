//! Simulation engine.
//!
//! - `node`: engine-side node state (connection, counters, location)
//! - `event`: scheduled events and their parameters
//! - `engine`: setup gate, tick loop and message routing

#[allow(clippy::module_inception)]
pub mod engine;
pub mod event;
pub mod node;

pub use engine::{Engine, EngineChannels, EngineError};
pub use event::{Event, EventError};
pub use node::Node;
