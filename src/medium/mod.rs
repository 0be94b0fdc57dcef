//! Radio medium: propagation model, link sets and in-flight transmissions.
//!
//! - `signal_calculations` / `geometry`: pure RF and distance math
//! - `map_tiles`: terrain and foliage rasters
//! - `layers` / `cache`: composable fading layers and the per-pair cache
//! - `transmission` / `medium`: packet timing, interference and delivery

pub mod cache;
pub mod geometry;
pub mod layers;
pub mod map_tiles;
#[allow(clippy::module_inception)]
pub mod medium;
pub mod signal_calculations;
pub mod transmission;

pub use medium::{Medium, MediumError, medium_task};
