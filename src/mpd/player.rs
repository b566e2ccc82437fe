//! Player facade - the synchronized playback state other processes observe.

use std::sync::Arc;

use async_channel::{Receiver, Sender};
use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

use super::ipc::{Handler, IpcDebugInfo, IpcError, IpcEvent, MpdIpc};
use super::protocol::{Command, Response, Subsystem};
use super::status::{Category, ChangeSet, Metadata, PlaybackStatus, RepeatMode, StatusTracker};
use crate::config::SyncConfig;

#[derive(Error, Debug)]
pub enum PlayerError {
  #[error("IPC error: {0}")]
  Ipc(#[from] IpcError),
  #[error("Player unavailable")]
  Unavailable,
}

/// Notifications for observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerEvent {
  Changed(Category),
  /// The connection was lost; state is stale until a new player is started.
  Unavailable,
}

/// Playback requests. Effects show up later as [`PlayerEvent`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
  Play,
  Pause,
  Stop,
  Next,
  Prev,
  /// Absolute position in milliseconds.
  SetPosition(u64),
  SetRepeat(RepeatMode),
  SetShuffle(bool),
  /// Volume (0-100).
  SetVolume(u8),
  /// Drop the connection. The player reports `Unavailable` and `run` returns.
  Disconnect,
}

struct Shared {
  tracker: StatusTracker,
  available: bool,
}

/// Cheap handle for reading player state and queueing intents from any task.
#[derive(Clone)]
pub struct PlayerHandle {
  shared: Arc<RwLock<Shared>>,
  intent_tx: Sender<Intent>,
}

impl PlayerHandle {
  pub fn status(&self) -> PlaybackStatus {
    self.shared.read().tracker.snapshot().status()
  }

  pub fn metadata(&self) -> Metadata {
    self.shared.read().tracker.snapshot().metadata().clone()
  }

  /// Interpolated position in milliseconds.
  pub fn position(&self) -> u64 {
    self.shared.read().tracker.position()
  }

  pub fn repeat(&self) -> RepeatMode {
    self.shared.read().tracker.snapshot().repeat_mode()
  }

  pub fn shuffle(&self) -> bool {
    self.shared.read().tracker.snapshot().shuffle()
  }

  pub fn is_available(&self) -> bool {
    self.shared.read().available
  }

  pub fn play(&self) {
    self.request(Intent::Play);
  }

  pub fn pause(&self) {
    self.request(Intent::Pause);
  }

  pub fn stop(&self) {
    self.request(Intent::Stop);
  }

  pub fn next(&self) {
    self.request(Intent::Next);
  }

  pub fn prev(&self) {
    self.request(Intent::Prev);
  }

  pub fn set_position(&self, position_ms: u64) {
    self.request(Intent::SetPosition(position_ms));
  }

  pub fn set_repeat(&self, mode: RepeatMode) {
    self.request(Intent::SetRepeat(mode));
  }

  pub fn set_shuffle(&self, shuffle: bool) {
    self.request(Intent::SetShuffle(shuffle));
  }

  pub fn set_volume(&self, volume: u8) {
    self.request(Intent::SetVolume(volume));
  }

  pub fn disconnect(&self) {
    self.request(Intent::Disconnect);
  }

  /// Queue an intent for the player task. Fire and forget.
  pub fn request(&self, intent: Intent) {
    if self.intent_tx.try_send(intent).is_err() {
      log::warn!("Player is gone, dropping {:?}", intent);
    }
  }
}

#[derive(Debug, Clone, Serialize)]
pub struct PlayerDebugInfo {
  pub available: bool,
  pub state: PlaybackStatus,
  pub metadata: Metadata,
  pub repeat: RepeatMode,
  pub shuffle: bool,
  pub position: u64,
  pub pending_track: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DebugInfo {
  #[serde(flatten)]
  pub ipc: IpcDebugInfo,
  pub player: PlayerDebugInfo,
}

/// Keeps the shared player state in sync with MPD.
pub struct MpdPlayer<T> {
  ipc: MpdIpc<T>,
  shared: Arc<RwLock<Shared>>,
  event_tx: Sender<PlayerEvent>,
  intent_tx: Sender<Intent>,
  intent_rx: Receiver<Intent>,
  /// A track change waiting on its `currentsong` reply.
  pending_track: bool,
}

impl<T> MpdPlayer<T>
where
  T: AsyncRead + AsyncWrite + Unpin,
{
  /// Fetch the baseline state and return the player with its event receiver.
  ///
  /// Nothing is reported for the baseline itself.
  pub async fn start(
    ipc: MpdIpc<T>,
    config: &SyncConfig,
  ) -> Result<(Self, Receiver<PlayerEvent>), PlayerError> {
    let (event_tx, event_rx) = async_channel::unbounded();
    let (intent_tx, intent_rx) = async_channel::unbounded();

    let mut player = Self {
      ipc,
      shared: Arc::new(RwLock::new(Shared {
        tracker: StatusTracker::new(config.position_tolerance_ms),
        available: true,
      })),
      event_tx,
      intent_tx,
      intent_rx,
      pending_track: false,
    };

    player.refresh().await?;
    {
      let mut shared = player.shared.write();
      shared.tracker.establish_baseline();
      log::info!(
        "MPD player ready: {:?} at {}ms",
        shared.tracker.snapshot().status(),
        shared.tracker.position()
      );
    }

    Ok((player, event_rx))
  }

  pub fn handle(&self) -> PlayerHandle {
    PlayerHandle {
      shared: self.shared.clone(),
      intent_tx: self.intent_tx.clone(),
    }
  }

  /// Re-read `status` and wait until it and everything it triggers are handled.
  pub async fn refresh(&mut self) -> Result<(), PlayerError> {
    self.send_sync(Command::status()).await
  }

  async fn send_sync(&mut self, command: Command) -> Result<(), PlayerError> {
    self.ipc.send_sync(command).await?;
    while !self.ipc.is_settled() {
      let event = self.ipc.read_event().await;
      if !self.dispatch(event).await {
        return Err(PlayerError::Unavailable);
      }
    }
    Ok(())
  }

  /// Drive the connection until it drops, handling intents in between.
  pub async fn run(mut self) {
    loop {
      if let Err(e) = self.ipc.prepare().await {
        log::debug!("MPD connection not ready: {}", e);
      }

      tokio::select! {
        event = self.ipc.read_event() => {
          if !self.dispatch(event).await {
            break;
          }
        }
        Ok(intent) = self.intent_rx.recv() => {
          if let Err(e) = self.perform(intent).await {
            log::warn!("Failed to perform {:?}: {}", intent, e);
          }
        }
      }
    }
    log::info!("MPD player stopped");
  }

  /// Send the commands for an intent. State is only updated by later status replies.
  pub async fn perform(&mut self, intent: Intent) -> Result<(), PlayerError> {
    log::debug!("Performing {:?}", intent);
    let (status, song_id) = {
      let shared = self.shared.read();
      let snapshot = shared.tracker.snapshot();
      (snapshot.status(), snapshot.song_id())
    };

    let commands = match intent {
      Intent::Play => match status {
        PlaybackStatus::Paused => vec![Command::pause(false)],
        PlaybackStatus::Stopped => vec![Command::play()],
        PlaybackStatus::Playing => Vec::new(),
      },
      Intent::Pause => vec![Command::pause(true)],
      Intent::Stop => vec![Command::stop()],
      Intent::Next => vec![Command::next()],
      Intent::Prev => vec![Command::previous()],
      Intent::SetPosition(position_ms) => match song_id {
        Some(id) => vec![Command::seek_id(id, position_ms)],
        None => vec![Command::seek_cur(position_ms)],
      },
      Intent::SetRepeat(mode) => {
        let (repeat, single) = mode.flags();
        vec![Command::repeat(repeat), Command::single(single)]
      }
      Intent::SetShuffle(shuffle) => vec![Command::random(shuffle)],
      Intent::SetVolume(volume) => vec![Command::set_vol(volume)],
      Intent::Disconnect => {
        self.ipc.disconnect();
        return Ok(());
      }
    };

    for command in commands {
      self.ipc.send_async(command).await?;
    }
    Ok(())
  }

  /// Route one engine event. Returns `false` once the connection is gone.
  async fn dispatch(&mut self, event: IpcEvent) -> bool {
    match event {
      IpcEvent::Reply {
        command,
        handler,
        reply,
      } => {
        let response = match reply {
          Ok(response) => response,
          Err(_) => {
            if handler == Handler::CurrentSong {
              self.release_track();
            }
            return true;
          }
        };
        match handler {
          Handler::Status => self.handle_status(&response).await,
          Handler::CurrentSong => self.handle_current_song(&response),
          Handler::Idle | Handler::Acknowledge => log::debug!("MPD acknowledged {}", command),
        }
        true
      }
      IpcEvent::Changed(subsystems) => {
        self.handle_changes(&subsystems).await;
        true
      }
      IpcEvent::Disconnected { dropped } => {
        self.handle_disconnect(dropped);
        false
      }
    }
  }

  async fn handle_status(&mut self, response: &Response) {
    let diff = match self.shared.write().tracker.apply_status(response) {
      Ok(diff) => diff,
      Err(e) => {
        log::error!("Failed to apply MPD status: {}", e);
        return;
      }
    };

    let mut changes = diff.changes;
    if diff.fetch_metadata {
      // Observers hear about the new track once its metadata is in.
      if changes.remove(Category::Track) {
        self.pending_track = true;
      }
      if let Err(e) = self.ipc.send_async(Command::current_song()).await {
        log::warn!("Failed to request current song: {}", e);
      }
    }
    self.emit(&changes);
  }

  fn handle_current_song(&mut self, response: &Response) {
    self.shared.write().tracker.apply_metadata(response);
    self.release_track();
  }

  fn release_track(&mut self) {
    if std::mem::take(&mut self.pending_track) {
      self.notify(PlayerEvent::Changed(Category::Track));
    }
  }

  async fn handle_changes(&mut self, subsystems: &[Subsystem]) {
    let refresh = subsystems
      .iter()
      .any(|subsystem| matches!(subsystem, Subsystem::Player | Subsystem::Options));
    if !refresh {
      if !subsystems.is_empty() {
        log::debug!("Ignoring MPD changes: {:?}", subsystems);
      }
      return;
    }

    if let Err(e) = self.ipc.send_async(Command::status()).await {
      log::warn!("Failed to refresh MPD status: {}", e);
    }
  }

  fn handle_disconnect(&mut self, dropped: usize) {
    self.pending_track = false;
    let was_available = {
      let mut shared = self.shared.write();
      shared.tracker.freeze();
      std::mem::replace(&mut shared.available, false)
    };

    if was_available {
      log::info!("MPD player unavailable ({} commands dropped)", dropped);
      self.notify(PlayerEvent::Unavailable);
    }
  }

  fn emit(&self, changes: &ChangeSet) {
    for category in changes.iter() {
      self.notify(PlayerEvent::Changed(category));
    }
  }

  fn notify(&self, event: PlayerEvent) {
    log::debug!("Player event: {:?}", event);
    if self.event_tx.try_send(event).is_err() {
      log::debug!("No observers for {:?}", event);
    }
  }

  pub fn debug_info(&self) -> DebugInfo {
    let shared = self.shared.read();
    let snapshot = shared.tracker.snapshot();
    DebugInfo {
      ipc: self.ipc.debug_info(),
      player: PlayerDebugInfo {
        available: shared.available,
        state: snapshot.status(),
        metadata: snapshot.metadata().clone(),
        repeat: snapshot.repeat_mode(),
        shuffle: snapshot.shuffle(),
        position: shared.tracker.position(),
        pending_track: self.pending_track,
      },
    }
  }
}
