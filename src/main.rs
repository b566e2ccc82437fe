use async_channel::Receiver;
use mpdsync::mpd::{MpdIpc, MpdPlayer, PlayerEvent, PlayerHandle};
use mpdsync::SyncConfig;
use tracing_subscriber::EnvFilter;

fn load_config() -> SyncConfig {
  let config = match SyncConfig::load() {
    Ok(config) => config,
    Err(e) => {
      log::error!("Failed to load config, using defaults: {}", e);
      SyncConfig::default()
    }
  }
  .with_env();

  if let Err(e) = config.validate() {
    log::error!("Invalid config ({}), using defaults", e);
    return SyncConfig::default().with_env();
  }
  config
}

/// Log player events until the player goes away.
async fn watch_events(handle: PlayerHandle, events: Receiver<PlayerEvent>) {
  while let Ok(event) = events.recv().await {
    match event {
      PlayerEvent::Changed(category) => log::info!(
        "Player {:?} changed: {:?} at {}ms, {:?}",
        category,
        handle.status(),
        handle.position(),
        handle.metadata().title
      ),
      PlayerEvent::Unavailable => log::warn!("Player unavailable"),
    }
  }
}

enum SessionEnd {
  /// Never got as far as a baseline.
  Failed,
  /// Connection lost after syncing.
  Lost,
  /// Ctrl-C while connected.
  Shutdown,
}

/// Connect and sync until the connection drops or the user quits.
async fn session(config: &SyncConfig) -> SessionEnd {
  let ipc = match MpdIpc::connect(config).await {
    Ok(ipc) => ipc,
    Err(e) => {
      log::error!("Failed to connect to MPD: {}", e);
      return SessionEnd::Failed;
    }
  };

  let (player, events) = match MpdPlayer::start(ipc, config).await {
    Ok(started) => started,
    Err(e) => {
      log::error!("Failed to start MPD player: {}", e);
      return SessionEnd::Failed;
    }
  };

  match serde_json::to_string(&player.debug_info()) {
    Ok(info) => log::debug!("Player state: {}", info),
    Err(e) => log::warn!("Failed to serialize debug info: {}", e),
  }

  let handle = player.handle();
  let watcher = tokio::spawn(watch_events(handle.clone(), events));
  let shutdown = tokio::spawn(async move {
    match tokio::signal::ctrl_c().await {
      Ok(()) => {
        log::info!("Shutting down");
        handle.disconnect();
        true
      }
      Err(e) => {
        log::error!("Failed to listen for ctrl-c: {}", e);
        false
      }
    }
  });

  player.run().await;
  if let Err(e) = watcher.await {
    log::error!("Event watcher failed: {}", e);
  }

  if !shutdown.is_finished() {
    shutdown.abort();
    return SessionEnd::Lost;
  }
  match shutdown.await {
    Ok(true) => SessionEnd::Shutdown,
    _ => SessionEnd::Lost,
  }
}

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let config = load_config();
  log::info!("Syncing with MPD at {}", config.address());

  let mut reconnect_attempt: usize = 0;
  loop {
    match session(&config).await {
      SessionEnd::Shutdown => return,
      SessionEnd::Lost => reconnect_attempt = 0,
      SessionEnd::Failed => {}
    }

    let delay = config.reconnect_delay(reconnect_attempt);
    reconnect_attempt += 1;
    log::info!(
      "Reconnecting to MPD in {} seconds (attempt {})",
      delay.as_secs(),
      reconnect_attempt
    );

    tokio::select! {
      _ = tokio::time::sleep(delay) => {}
      _ = tokio::signal::ctrl_c() => {
        log::info!("Shutting down");
        return;
      }
    }
  }
}
