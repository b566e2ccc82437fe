//! Keeps a local, observable copy of an MPD server's playback state.

pub mod config;
pub mod mpd;

pub use config::{ConfigError, SyncConfig};
