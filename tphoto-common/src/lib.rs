//! # Talking Photo Common Library
//!
//! Shared code for the talking-photo workspace including:
//! - Common error type
//! - Configuration file model and root folder resolution
//! - Cache index database initialization
//! - UI boundary event types (controller state, structured errors)

pub mod config;
pub mod db;
pub mod error;
pub mod events;

pub use error::{Error, Result};
