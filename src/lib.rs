//! Discrete-event simulator for wireless radio networks.
//!
//! External node processes talk to the simulator over a message transport.
//! The simulator places them on a map, computes link attenuation with a
//! layered propagation model and delivers their packets through a shared
//! medium while a tick-driven engine applies scripted events.
//!
//! - `medium`: propagation model and packet delivery
//! - `gateway`: wire codec and client registration
//! - `engine`: node state, events and the main loop
//! - `plugins`: observers of simulation activity
//! - `simulator`: composition root

pub mod common;
pub mod engine;
pub mod gateway;
pub mod medium;
pub mod messages;
pub mod plugins;
pub mod simulator;

#[cfg(test)]
mod testing;

pub use simulator::Simulator;
