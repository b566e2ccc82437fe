//! MPD module - keeps a local view of an MPD server's playback state in sync.
//!
//! Architecture:
//! - `protocol.rs` - Command vocabulary, reply/ACK parsing and argument quoting
//! - `ipc.rs` - Idle-aware command queue over one connection
//! - `status.rs` - `status` reply diffing into change categories
//! - `timer.rs` - Interpolated elapsed time between status replies
//! - `player.rs` - Player facade with intents, events and shared state

mod ipc;
mod player;
mod protocol;
mod status;
mod timer;

#[cfg(test)]
mod test_support;

pub use ipc::{EngineState, IpcDebugInfo, IpcError, MpdIpc};
pub use player::{DebugInfo, Intent, MpdPlayer, PlayerError, PlayerEvent, PlayerHandle};
pub use protocol::{Ack, Command, MpdCommand, ProtocolError, Response, Subsystem};
pub use status::{Category, Metadata, PlaybackStatus, RepeatMode};
pub use timer::Timer;
