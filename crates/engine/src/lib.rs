//! Flinger - a media playback engine control plane.
//!
//! This crate ties the media components together:
//! - Engine configuration
//! - Sessions and their media instances
//! - Call routing by session, instance and source buffer id
//! - Typed control requests and responses

pub mod command;
pub mod config;
pub mod engine;
pub mod session;

pub use command::{ControlCall, ControlRequest, ControlResponse, ResponseResult};
pub use config::{ConfigError, EngineConfig};
pub use engine::{Engine, EngineBuilder};
pub use session::Session;

/// Engine version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
