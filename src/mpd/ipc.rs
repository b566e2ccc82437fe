//! Command queue over a single MPD connection.
//!
//! MPD answers commands strictly in order, so the queue head is always the
//! command whose reply is being read. When nothing is queued the connection
//! sits in `idle` and MPD pushes the names of changed subsystems; any new
//! command first withdraws the idle with `noidle`.

use std::collections::VecDeque;

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};

use super::protocol::{parse_greeting, Ack, Command, Line, MpdCommand, ProtocolError, Response, Subsystem};
use crate::config::SyncConfig;

const MAX_LINE_LENGTH: usize = 64 * 1024;

#[derive(Error, Debug)]
pub enum IpcError {
  #[error("Connection failed: {0}")]
  ConnectionFailed(String),
  #[error("Handshake failed: {0}")]
  Handshake(String),
  #[error("I/O error: {0}")]
  Io(#[from] std::io::Error),
  #[error("Protocol error: {0}")]
  Protocol(#[from] ProtocolError),
  #[error("{0} is managed by the connection")]
  Reserved(MpdCommand),
  #[error("Disconnected")]
  Disconnected,
}

impl From<LinesCodecError> for IpcError {
  fn from(e: LinesCodecError) -> Self {
    match e {
      LinesCodecError::MaxLineLengthExceeded => IpcError::Protocol(ProtocolError::LineTooLong),
      LinesCodecError::Io(e) if e.kind() == std::io::ErrorKind::InvalidData => {
        IpcError::Protocol(ProtocolError::InvalidUtf8)
      }
      LinesCodecError::Io(e) => IpcError::Io(e),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
  Disconnected,
  Command,
  Idle,
}

/// Which handler receives a command's reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handler {
  Status,
  CurrentSong,
  Idle,
  /// Reply only acknowledges completion.
  Acknowledge,
}

impl Handler {
  pub fn for_command(command: MpdCommand) -> Self {
    match command {
      MpdCommand::Status => Handler::Status,
      MpdCommand::CurrentSong => Handler::CurrentSong,
      MpdCommand::Idle => Handler::Idle,
      MpdCommand::NoIdle
      | MpdCommand::Play
      | MpdCommand::Pause
      | MpdCommand::Stop
      | MpdCommand::Next
      | MpdCommand::Previous
      | MpdCommand::SeekCur
      | MpdCommand::SeekId
      | MpdCommand::Repeat
      | MpdCommand::Single
      | MpdCommand::Random
      | MpdCommand::SetVol => Handler::Acknowledge,
    }
  }
}

struct QueueEntry {
  command: Command,
  handler: Handler,
  sync: bool,
  written: bool,
}

/// Something read off the connection.
#[derive(Debug)]
pub enum IpcEvent {
  /// Reply to the oldest queued command.
  Reply {
    command: MpdCommand,
    handler: Handler,
    reply: Result<Response, Ack>,
  },
  /// An idle request completed. Empty when it was withdrawn with nothing to report.
  Changed(Vec<Subsystem>),
  /// The connection is gone; `dropped` queued commands will never be answered.
  Disconnected { dropped: usize },
}

/// Connection state for debugging.
#[derive(Debug, Clone, Serialize)]
pub struct IpcDebugInfo {
  pub host: String,
  pub port: u16,
  pub version: String,
  pub connected: bool,
  pub on_idle: bool,
  pub fetch_queue: Vec<String>,
}

/// MPD connection with an idle-aware command queue.
pub struct MpdIpc<T> {
  host: String,
  port: u16,
  version: String,
  framed: Option<Framed<T, LinesCodec>>,
  queue: VecDeque<QueueEntry>,
  state: EngineState,
  leaving_idle: bool,
  partial: Vec<(String, String)>,
  pending_disconnect: Option<usize>,
}

impl MpdIpc<TcpStream> {
  /// Connect to the configured MPD server. Failures are not retried.
  pub async fn connect(config: &SyncConfig) -> Result<Self, IpcError> {
    let address = config.address();
    let stream = TcpStream::connect(&address)
      .await
      .map_err(|e| IpcError::ConnectionFailed(format!("{}: {}", address, e)))?;
    Self::handshake(stream, &config.host, config.port).await
  }
}

impl<T> MpdIpc<T>
where
  T: AsyncRead + AsyncWrite + Unpin,
{
  /// Read the server greeting off an already open stream.
  pub async fn handshake(stream: T, host: &str, port: u16) -> Result<Self, IpcError> {
    let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));

    let greeting = match framed.next().await {
      Some(Ok(line)) => line,
      Some(Err(e)) => return Err(IpcError::Handshake(e.to_string())),
      None => return Err(IpcError::Handshake("connection closed before greeting".into())),
    };
    let version = parse_greeting(&greeting).map_err(|e| IpcError::Handshake(e.to_string()))?;

    log::info!("Connected to MPD {} at {}:{}", version, host, port);

    Ok(Self {
      host: host.to_string(),
      port,
      version,
      framed: Some(framed),
      queue: VecDeque::new(),
      state: EngineState::Command,
      leaving_idle: false,
      partial: Vec::new(),
      pending_disconnect: None,
    })
  }

  pub fn state(&self) -> EngineState {
    self.state
  }

  pub fn is_connected(&self) -> bool {
    self.framed.is_some()
  }

  pub fn version(&self) -> &str {
    &self.version
  }

  /// Nothing left to wait for except, at most, an outstanding idle.
  pub fn is_settled(&self) -> bool {
    match self.queue.len() {
      0 => true,
      1 => self.queue[0].handler == Handler::Idle,
      _ => false,
    }
  }

  /// Names of the queued commands, oldest first.
  pub fn queued_commands(&self) -> Vec<&'static str> {
    self.queue.iter().map(|entry| entry.command.kind.name()).collect()
  }

  /// Queue a command. Its reply is returned by a later [`read_event`](Self::read_event).
  pub async fn send_async(&mut self, command: Command) -> Result<(), IpcError> {
    self.enqueue(command, false).await
  }

  /// Queue a command the caller is going to block on.
  ///
  /// The caller keeps calling [`read_event`](Self::read_event) until
  /// [`is_settled`](Self::is_settled); this must not happen from inside the
  /// handling of another event.
  pub async fn send_sync(&mut self, command: Command) -> Result<(), IpcError> {
    self.enqueue(command, true).await
  }

  async fn enqueue(&mut self, command: Command, sync: bool) -> Result<(), IpcError> {
    if !self.is_connected() {
      return Err(IpcError::Disconnected);
    }
    if matches!(command.kind, MpdCommand::Idle | MpdCommand::NoIdle) {
      return Err(IpcError::Reserved(command.kind));
    }

    self.leave_idle().await?;

    log::debug!("Queueing MPD command: {} (sync: {})", command.to_line(), sync);
    let handler = Handler::for_command(command.kind);
    self.queue.push_back(QueueEntry {
      command,
      handler,
      sync,
      written: false,
    });
    log::debug!("MPD command queue: {:?}", self.queued_commands());

    self.write_head().await
  }

  fn head_is_idle(&self) -> bool {
    self.queue.front().is_some_and(|entry| entry.handler == Handler::Idle)
  }

  async fn leave_idle(&mut self) -> Result<(), IpcError> {
    if self.state != EngineState::Idle || self.leaving_idle || !self.head_is_idle() {
      return Ok(());
    }

    // Never reached the wire, nothing to withdraw.
    if !self.queue[0].written {
      self.queue.pop_front();
      self.state = EngineState::Command;
      return Ok(());
    }

    log::debug!("Leaving idle");
    self.leaving_idle = true;
    self.write_line(Command::noidle().to_line()).await
  }

  /// Write whatever the wire is waiting for: the queue head if it has not
  /// been sent yet, or an idle request if the queue is empty.
  pub async fn prepare(&mut self) -> Result<(), IpcError> {
    if !self.is_connected() {
      return Err(IpcError::Disconnected);
    }
    if self.queue.is_empty() {
      log::debug!("Entering idle");
      self.queue.push_back(QueueEntry {
        command: Command::idle(),
        handler: Handler::Idle,
        sync: false,
        written: false,
      });
      self.state = EngineState::Idle;
      self.leaving_idle = false;
    }
    self.write_head().await
  }

  async fn write_head(&mut self) -> Result<(), IpcError> {
    let line = match self.queue.front() {
      Some(entry) if !entry.written => entry.command.to_line(),
      _ => return self.flush().await,
    };
    self.feed_line(line).await?;
    if let Some(entry) = self.queue.front_mut() {
      entry.written = true;
    }
    self.flush().await
  }

  async fn write_line(&mut self, line: String) -> Result<(), IpcError> {
    self.feed_line(line).await?;
    self.flush().await
  }

  async fn feed_line(&mut self, line: String) -> Result<(), IpcError> {
    let framed = self.framed.as_mut().ok_or(IpcError::Disconnected)?;
    log::debug!("MPD <- {}", line);
    if let Err(e) = framed.feed(line).await {
      log::error!("MPD write error: {}", e);
      self.teardown();
      return Err(e.into());
    }
    Ok(())
  }

  async fn flush(&mut self) -> Result<(), IpcError> {
    let framed = self.framed.as_mut().ok_or(IpcError::Disconnected)?;
    if let Err(e) = SinkExt::<String>::flush(framed).await {
      log::error!("MPD flush error: {}", e);
      self.teardown();
      return Err(e.into());
    }
    Ok(())
  }

  /// Wait for the next reply, idle notification or disconnect.
  ///
  /// A lost connection is reported once with the number of dropped commands;
  /// every later call returns `Disconnected { dropped: 0 }` straight away.
  ///
  /// Cancel safe: a partially read reply stays buffered in the connection.
  pub async fn read_event(&mut self) -> IpcEvent {
    if let Some(dropped) = self.pending_disconnect.take() {
      return IpcEvent::Disconnected { dropped };
    }
    if self.prepare().await.is_err() {
      return self.disconnect_event();
    }

    loop {
      let framed = match self.framed.as_mut() {
        Some(framed) => framed,
        None => return self.disconnect_event(),
      };

      let line = match framed.next().await {
        Some(Ok(line)) => line,
        Some(Err(e)) => {
          log::error!("MPD read error: {}", IpcError::from(e));
          return self.disconnect_event();
        }
        None => {
          log::info!("MPD connection closed");
          return self.disconnect_event();
        }
      };

      match self.handle_line(&line) {
        Ok(Some(event)) => return event,
        Ok(None) => continue,
        Err(e) => {
          log::error!("{}", e);
          return self.disconnect_event();
        }
      }
    }
  }

  fn handle_line(&mut self, line: &str) -> Result<Option<IpcEvent>, ProtocolError> {
    log::debug!("MPD -> {}", line);
    if self.queue.is_empty() {
      return Err(ProtocolError::Unsolicited(line.to_string()));
    }

    match Line::parse(line)? {
      Line::Field(key, value) => {
        self.partial.push((key, value));
        Ok(None)
      }
      Line::Ok => {
        let response = Response::new(std::mem::take(&mut self.partial));
        Ok(self.complete(Ok(response)))
      }
      Line::Ack(ack) => {
        self.partial.clear();
        Ok(self.complete(Err(ack)))
      }
    }
  }

  /// Pop the queue head and turn its reply into an event.
  fn complete(&mut self, reply: Result<Response, Ack>) -> Option<IpcEvent> {
    let entry = self.queue.pop_front()?;

    if entry.handler == Handler::Idle {
      self.state = EngineState::Command;
      self.leaving_idle = false;
      let changed = match reply {
        Ok(response) => Subsystem::from_response(&response),
        Err(ack) => {
          log::warn!("MPD rejected idle: {}", ack);
          Vec::new()
        }
      };
      log::debug!("Idle changes: {:?}", changed);
      return Some(IpcEvent::Changed(changed));
    }

    if let Err(ack) = &reply {
      log::warn!("MPD rejected {}: {}", entry.command.kind, ack);
    }
    Some(IpcEvent::Reply {
      command: entry.command.kind,
      handler: entry.handler,
      reply,
    })
  }

  /// Drop the connection and every queued command.
  pub fn disconnect(&mut self) {
    if self.is_connected() {
      log::info!("Disconnecting from MPD at {}:{}", self.host, self.port);
    }
    self.teardown();
  }

  fn teardown(&mut self) {
    if self.framed.take().is_none() {
      return;
    }
    let dropped = self
      .queue
      .iter()
      .filter(|entry| entry.handler != Handler::Idle)
      .count();
    if dropped > 0 {
      log::info!("Dropping {} queued MPD commands", dropped);
    }
    self.queue.clear();
    self.partial.clear();
    self.state = EngineState::Disconnected;
    self.leaving_idle = false;
    self.pending_disconnect = Some(dropped);
  }

  fn disconnect_event(&mut self) -> IpcEvent {
    self.teardown();
    IpcEvent::Disconnected {
      dropped: self.pending_disconnect.take().unwrap_or(0),
    }
  }

  pub fn debug_info(&self) -> IpcDebugInfo {
    IpcDebugInfo {
      host: self.host.clone(),
      port: self.port,
      version: self.version.clone(),
      connected: self.is_connected(),
      on_idle: self.state == EngineState::Idle,
      fetch_queue: self
        .queue
        .iter()
        .map(|entry| {
          let marker = if entry.sync { "!" } else { "" };
          format!("{}{}", entry.command.kind.name(), marker)
        })
        .collect(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::mpd::test_support::{connect, script};

  fn command_of(event: &IpcEvent) -> Option<MpdCommand> {
    match event {
      IpcEvent::Reply { command, .. } => Some(*command),
      _ => None,
    }
  }

  #[tokio::test]
  async fn test_handshake_rejects_non_mpd_server() {
    let (client, server) = tokio::io::duplex(1024);
    let mut server = Framed::new(server, LinesCodec::new());
    server.send("HTTP/1.1 400 Bad Request").await.unwrap();

    let result = MpdIpc::handshake(client, "localhost", 6600).await;
    assert!(matches!(result, Err(IpcError::Handshake(_))));
  }

  #[tokio::test]
  async fn test_replies_dispatched_in_send_order() {
    let (mut ipc, server) = connect(script(&[
      ("status", &["state: play", "OK"]),
      ("currentsong", &["Title: Song", "OK"]),
      ("next", &["OK"]),
    ]))
    .await;
    assert_eq!(ipc.version(), "0.23.5");

    ipc.send_async(Command::status()).await.unwrap();
    ipc.send_async(Command::current_song()).await.unwrap();
    ipc.send_async(Command::next()).await.unwrap();
    assert_eq!(ipc.queued_commands(), vec!["status", "currentsong", "next"]);

    let mut order = Vec::new();
    for _ in 0..3 {
      let event = ipc.read_event().await;
      if let IpcEvent::Reply { command: MpdCommand::Status, reply, .. } = &event {
        assert_eq!(reply.as_ref().unwrap().get("state"), Some("play"));
      }
      order.push(command_of(&event));
    }

    assert_eq!(
      order,
      vec![
        Some(MpdCommand::Status),
        Some(MpdCommand::CurrentSong),
        Some(MpdCommand::Next)
      ]
    );
    assert!(ipc.is_settled());
    assert_eq!(server.await.unwrap(), vec!["status", "currentsong", "next"]);
  }

  #[tokio::test]
  async fn test_commands_while_idle_withdraw_it_once() {
    let (mut ipc, server) = connect(script(&[
      ("idle", &[]),
      ("noidle", &["OK"]),
      ("status", &["OK"]),
      ("next", &["OK"]),
    ]))
    .await;

    ipc.prepare().await.unwrap();
    assert_eq!(ipc.state(), EngineState::Idle);
    assert!(ipc.is_settled());

    ipc.send_async(Command::status()).await.unwrap();
    ipc.send_async(Command::next()).await.unwrap();
    assert_eq!(ipc.queued_commands(), vec!["idle", "status", "next"]);

    assert!(matches!(ipc.read_event().await, IpcEvent::Changed(changed) if changed.is_empty()));
    assert_eq!(ipc.state(), EngineState::Command);
    assert_eq!(command_of(&ipc.read_event().await), Some(MpdCommand::Status));
    assert_eq!(command_of(&ipc.read_event().await), Some(MpdCommand::Next));

    let received = server.await.unwrap();
    assert_eq!(received.iter().filter(|line| *line == "noidle").count(), 1);
  }

  #[tokio::test]
  async fn test_idle_push_reports_subsystems_and_resubscribes() {
    let (mut ipc, server) = connect(script(&[
      ("idle", &["changed: player", "changed: options", "OK"]),
      ("idle", &[]),
    ]))
    .await;

    match ipc.read_event().await {
      IpcEvent::Changed(changed) => {
        assert_eq!(changed, vec![Subsystem::Player, Subsystem::Options])
      }
      other => panic!("Expected idle changes, got {:?}", other),
    }
    assert_eq!(ipc.state(), EngineState::Command);

    ipc.prepare().await.unwrap();
    assert_eq!(ipc.state(), EngineState::Idle);
    assert_eq!(server.await.unwrap(), vec!["idle", "idle"]);
  }

  #[tokio::test]
  async fn test_disconnect_drops_pending_commands() {
    let (mut ipc, server) = connect(script(&[("status", &[])])).await;

    ipc.send_async(Command::status()).await.unwrap();
    ipc.send_async(Command::current_song()).await.unwrap();

    assert!(matches!(ipc.read_event().await, IpcEvent::Disconnected { dropped: 2 }));
    assert_eq!(ipc.state(), EngineState::Disconnected);
    assert!(ipc.queued_commands().is_empty());
    assert!(matches!(
      ipc.send_async(Command::next()).await,
      Err(IpcError::Disconnected)
    ));
    assert!(matches!(ipc.read_event().await, IpcEvent::Disconnected { dropped: 0 }));
    server.await.unwrap();
  }

  #[tokio::test]
  async fn test_ack_is_delivered_to_handler() {
    let (mut ipc, server) = connect(script(&[
      ("play", &["ACK [2@0] {play} Bad song index"]),
      ("status", &["state: stop", "OK"]),
    ]))
    .await;

    ipc.send_async(Command::play()).await.unwrap();
    ipc.send_async(Command::status()).await.unwrap();

    match ipc.read_event().await {
      IpcEvent::Reply { command, handler, reply } => {
        assert_eq!(command, MpdCommand::Play);
        assert_eq!(handler, Handler::Acknowledge);
        assert_eq!(reply.unwrap_err().code, 2);
      }
      other => panic!("Expected reply, got {:?}", other),
    }
    assert_eq!(command_of(&ipc.read_event().await), Some(MpdCommand::Status));
    assert!(ipc.is_connected());
    server.await.unwrap();
  }

  #[tokio::test]
  async fn test_malformed_reply_disconnects() {
    let (mut ipc, server) = connect(script(&[("status", &["this is not mpd"])])).await;

    ipc.send_async(Command::status()).await.unwrap();
    assert!(matches!(ipc.read_event().await, IpcEvent::Disconnected { dropped: 1 }));
    server.await.unwrap();
  }

  #[tokio::test]
  async fn test_idle_is_engine_managed() {
    let (mut ipc, _server) = connect(script(&[])).await;
    assert!(matches!(
      ipc.send_async(Command::idle()).await,
      Err(IpcError::Reserved(MpdCommand::Idle))
    ));
    assert!(matches!(
      ipc.send_async(Command::noidle()).await,
      Err(IpcError::Reserved(MpdCommand::NoIdle))
    ));
  }

  /// Server that greets, reads one command and answers with raw bytes.
  async fn connect_raw(reply: Vec<u8>) -> MpdIpc<tokio::io::DuplexStream> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let (client, mut server) = tokio::io::duplex(1024);
    tokio::spawn(async move {
      let mut buf = [0u8; 64];
      let _ = server.write_all(b"OK MPD 0.23.5\n").await;
      let _ = server.read(&mut buf).await;
      let _ = server.write_all(&reply).await;
      // Hold the connection open until the client lets go.
      while matches!(server.read(&mut buf).await, Ok(n) if n > 0) {}
    });
    MpdIpc::handshake(client, "localhost", 6600).await.unwrap()
  }

  #[tokio::test]
  async fn test_oversized_line_disconnects() {
    let mut reply = b"Title: ".to_vec();
    reply.extend(std::iter::repeat(b'x').take(70 * 1024));
    reply.extend_from_slice(b"\nOK\n");
    let mut ipc = connect_raw(reply).await;

    ipc.send_async(Command::current_song()).await.unwrap();
    assert!(matches!(ipc.read_event().await, IpcEvent::Disconnected { dropped: 1 }));
    assert!(!ipc.is_connected());
  }

  #[tokio::test]
  async fn test_invalid_utf8_disconnects() {
    let mut ipc = connect_raw(b"Title: \xff\xfe\nOK\n".to_vec()).await;

    ipc.send_async(Command::current_song()).await.unwrap();
    assert!(matches!(ipc.read_event().await, IpcEvent::Disconnected { dropped: 1 }));
    assert_eq!(ipc.state(), EngineState::Disconnected);
  }

  #[test]
  fn test_codec_errors_map_to_protocol_errors() {
    assert!(matches!(
      IpcError::from(LinesCodecError::MaxLineLengthExceeded),
      IpcError::Protocol(ProtocolError::LineTooLong)
    ));
    let invalid = std::io::Error::new(std::io::ErrorKind::InvalidData, "bad utf-8");
    assert!(matches!(
      IpcError::from(LinesCodecError::Io(invalid)),
      IpcError::Protocol(ProtocolError::InvalidUtf8)
    ));
    let reset = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
    assert!(matches!(IpcError::from(LinesCodecError::Io(reset)), IpcError::Io(_)));
  }

  #[tokio::test]
  async fn test_explicit_disconnect_drops_queue() {
    let (mut ipc, _server) = connect(script(&[("status", &[])])).await;

    ipc.send_async(Command::status()).await.unwrap();
    ipc.send_async(Command::current_song()).await.unwrap();
    ipc.disconnect();

    assert_eq!(ipc.state(), EngineState::Disconnected);
    assert!(ipc.queued_commands().is_empty());
    assert!(matches!(ipc.read_event().await, IpcEvent::Disconnected { dropped: 2 }));
    assert!(matches!(ipc.read_event().await, IpcEvent::Disconnected { dropped: 0 }));
    assert!(!ipc.debug_info().connected);
  }

  #[test]
  fn test_handler_table() {
    assert_eq!(Handler::for_command(MpdCommand::Status), Handler::Status);
    assert_eq!(Handler::for_command(MpdCommand::CurrentSong), Handler::CurrentSong);
    assert_eq!(Handler::for_command(MpdCommand::Idle), Handler::Idle);
    assert_eq!(Handler::for_command(MpdCommand::SetVol), Handler::Acknowledge);
  }
}
