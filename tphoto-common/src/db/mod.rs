//! Database layer for the video cache index

pub mod init;

pub use init::{init_cache_index, IndexLocation};
