//! codecwarp-core - Shared types for codecwarp
//!
//! This crate provides the error taxonomy, frame and event types, session
//! configuration, and the live-resource registry used by the codec
//! contract and the session engine.

pub mod config;
pub mod error;
pub mod frame;
pub mod registry;

pub use config::*;
pub use error::*;
pub use frame::*;
pub use registry::{ResourceKind, Tracked};
