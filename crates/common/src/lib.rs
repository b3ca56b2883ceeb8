//! Common types used across the media engine crates.

pub mod error;
pub mod geometry;

pub use error::{EngineError, EngineResult};
pub use geometry::DisplayRect;
