//! Talking-photo state machine and its UI handle

pub mod handle;
pub mod state;
pub mod talking_photo;

pub use handle::{ControllerCommand, ControllerHandle};
pub use state::{next_state, Trigger};
pub use talking_photo::{FrameReport, PauseReason, TalkingPhotoController};
