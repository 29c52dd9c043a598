//! # Talking Photo AR Library (tphoto-ar)
//!
//! Detects printed posters with a human face, fetches a lip-synced video for
//! each one from the generation backend, and blends the video's mouth region
//! onto the live camera image in registration with the tracked poster.
//!
//! **Architecture:** a synchronous per-frame render loop
//! (`controller::TalkingPhotoController::on_frame`) driving anchor tracking,
//! projection and compositing, with all network, disk and decode work on the
//! tokio worker pool feeding results back through channels.

pub mod api;
pub mod cache;
pub mod checksum;
pub mod clock;
pub mod config;
pub mod controller;
pub mod error;
pub mod fetch;
pub mod model;
pub mod render;
pub mod tracking;

#[cfg(test)]
mod test_support;

pub use error::{Error, Result};
