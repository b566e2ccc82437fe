//! MPD text protocol types.
//!
//! Reference: https://mpd.readthedocs.io/en/latest/protocol.html

use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
  #[error("Unknown command: {0}")]
  UnknownCommand(String),
  #[error("Unexpected greeting: {0}")]
  BadGreeting(String),
  #[error("Malformed reply line: {0}")]
  MalformedLine(String),
  #[error("Malformed ACK: {0}")]
  MalformedAck(String),
  #[error("Unsolicited data: {0}")]
  Unsolicited(String),
  #[error("Reply line too long")]
  LineTooLong,
  #[error("Reply is not valid UTF-8")]
  InvalidUtf8,
}

/// Commands this client knows how to send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MpdCommand {
  Status,
  CurrentSong,
  Idle,
  NoIdle,
  Play,
  Pause,
  Stop,
  Next,
  Previous,
  SeekCur,
  SeekId,
  Repeat,
  Single,
  Random,
  SetVol,
}

impl MpdCommand {
  pub const ALL: [MpdCommand; 15] = [
    MpdCommand::Status,
    MpdCommand::CurrentSong,
    MpdCommand::Idle,
    MpdCommand::NoIdle,
    MpdCommand::Play,
    MpdCommand::Pause,
    MpdCommand::Stop,
    MpdCommand::Next,
    MpdCommand::Previous,
    MpdCommand::SeekCur,
    MpdCommand::SeekId,
    MpdCommand::Repeat,
    MpdCommand::Single,
    MpdCommand::Random,
    MpdCommand::SetVol,
  ];

  /// Command name as written on the wire.
  pub fn name(self) -> &'static str {
    match self {
      MpdCommand::Status => "status",
      MpdCommand::CurrentSong => "currentsong",
      MpdCommand::Idle => "idle",
      MpdCommand::NoIdle => "noidle",
      MpdCommand::Play => "play",
      MpdCommand::Pause => "pause",
      MpdCommand::Stop => "stop",
      MpdCommand::Next => "next",
      MpdCommand::Previous => "previous",
      MpdCommand::SeekCur => "seekcur",
      MpdCommand::SeekId => "seekid",
      MpdCommand::Repeat => "repeat",
      MpdCommand::Single => "single",
      MpdCommand::Random => "random",
      MpdCommand::SetVol => "setvol",
    }
  }
}

impl fmt::Display for MpdCommand {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.name())
  }
}

impl FromStr for MpdCommand {
  type Err = ProtocolError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    MpdCommand::ALL
      .into_iter()
      .find(|cmd| cmd.name() == s)
      .ok_or_else(|| ProtocolError::UnknownCommand(s.to_string()))
  }
}

/// Command line sent to MPD.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
  pub kind: MpdCommand,
  pub args: Vec<String>,
}

fn flag(on: bool) -> String {
  let value = if on { "1" } else { "0" };
  value.to_string()
}

/// Milliseconds as fractional seconds, e.g. `12345` -> `12.345`.
fn seconds(ms: u64) -> String {
  format!("{}.{:03}", ms / 1000, ms % 1000)
}

impl Command {
  pub fn new(kind: MpdCommand, args: Vec<String>) -> Self {
    Self { kind, args }
  }

  fn bare(kind: MpdCommand) -> Self {
    Self::new(kind, Vec::new())
  }

  pub fn status() -> Self {
    Self::bare(MpdCommand::Status)
  }

  pub fn current_song() -> Self {
    Self::bare(MpdCommand::CurrentSong)
  }

  pub fn idle() -> Self {
    Self::bare(MpdCommand::Idle)
  }

  pub fn noidle() -> Self {
    Self::bare(MpdCommand::NoIdle)
  }

  pub fn play() -> Self {
    Self::bare(MpdCommand::Play)
  }

  /// `pause 1` pauses, `pause 0` resumes.
  pub fn pause(paused: bool) -> Self {
    Self::new(MpdCommand::Pause, vec![flag(paused)])
  }

  pub fn stop() -> Self {
    Self::bare(MpdCommand::Stop)
  }

  pub fn next() -> Self {
    Self::bare(MpdCommand::Next)
  }

  pub fn previous() -> Self {
    Self::bare(MpdCommand::Previous)
  }

  /// Seek within the current song to an absolute position.
  pub fn seek_cur(position_ms: u64) -> Self {
    Self::new(MpdCommand::SeekCur, vec![seconds(position_ms)])
  }

  /// Seek within the song with the given id.
  pub fn seek_id(song_id: i64, position_ms: u64) -> Self {
    Self::new(MpdCommand::SeekId, vec![song_id.to_string(), seconds(position_ms)])
  }

  pub fn repeat(on: bool) -> Self {
    Self::new(MpdCommand::Repeat, vec![flag(on)])
  }

  pub fn single(on: bool) -> Self {
    Self::new(MpdCommand::Single, vec![flag(on)])
  }

  pub fn random(on: bool) -> Self {
    Self::new(MpdCommand::Random, vec![flag(on)])
  }

  /// Set volume (0-100).
  pub fn set_vol(volume: u8) -> Self {
    Self::new(MpdCommand::SetVol, vec![volume.min(100).to_string()])
  }

  /// Render the command line, without the trailing newline.
  pub fn to_line(&self) -> String {
    let mut line = self.kind.name().to_string();
    for arg in &self.args {
      line.push(' ');
      line.push_str(&quote_arg(arg));
    }
    line
  }
}

/// Quote an argument if MPD would otherwise split or misread it.
fn quote_arg(arg: &str) -> Cow<'_, str> {
  let needs_quotes =
    arg.is_empty() || arg.chars().any(|c| c.is_whitespace() || c == '"' || c == '\\');
  if !needs_quotes {
    return Cow::Borrowed(arg);
  }

  let mut quoted = String::with_capacity(arg.len() + 2);
  quoted.push('"');
  for c in arg.chars() {
    if c == '"' || c == '\\' {
      quoted.push('\\');
    }
    quoted.push(c);
  }
  quoted.push('"');
  Cow::Owned(quoted)
}

/// Parse the `OK MPD <version>` greeting, returning the version.
pub fn parse_greeting(line: &str) -> Result<String, ProtocolError> {
  line
    .strip_prefix("OK MPD ")
    .map(|version| version.trim().to_string())
    .filter(|version| !version.is_empty())
    .ok_or_else(|| ProtocolError::BadGreeting(line.to_string()))
}

/// Error reply: `ACK [error@command_list_num] {current_command} message_text`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
  pub code: u32,
  pub index: u32,
  pub command: String,
  pub message: String,
}

impl Ack {
  pub fn parse(line: &str) -> Result<Self, ProtocolError> {
    let malformed = || ProtocolError::MalformedAck(line.to_string());

    let rest = line.strip_prefix("ACK [").ok_or_else(malformed)?;
    let (position, rest) = rest.split_once("] {").ok_or_else(malformed)?;
    let (code, index) = position.split_once('@').ok_or_else(malformed)?;
    let (command, message) = rest.split_once('}').ok_or_else(malformed)?;

    Ok(Self {
      code: code.parse().map_err(|_| malformed())?,
      index: index.parse().map_err(|_| malformed())?,
      command: command.to_string(),
      message: message.trim().to_string(),
    })
  }
}

impl fmt::Display for Ack {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "[{}@{}] {{{}}} {}", self.code, self.index, self.command, self.message)
  }
}

/// A single line of a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line {
  Field(String, String),
  Ok,
  Ack(Ack),
}

impl Line {
  pub fn parse(line: &str) -> Result<Self, ProtocolError> {
    if line == "OK" {
      return Ok(Line::Ok);
    }
    if line.starts_with("ACK ") {
      return Ack::parse(line).map(Line::Ack);
    }
    match line.split_once(": ") {
      Some((key, value)) if !key.is_empty() => Ok(Line::Field(key.to_string(), value.to_string())),
      _ => Err(ProtocolError::MalformedLine(line.to_string())),
    }
  }
}

/// Successful reply: `key: value` pairs in wire order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Response {
  pub fields: Vec<(String, String)>,
}

impl Response {
  pub fn new(fields: Vec<(String, String)>) -> Self {
    Self { fields }
  }

  /// First value for `key`. MPD capitalises song tags, so keys compare case-insensitively.
  pub fn get(&self, key: &str) -> Option<&str> {
    self
      .fields
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(key))
      .map(|(_, v)| v.as_str())
  }

  pub fn get_all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
    self
      .fields
      .iter()
      .filter(move |(k, _)| k.eq_ignore_ascii_case(key))
      .map(|(_, v)| v.as_str())
  }
}

/// Subsystems reported by `idle`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Subsystem {
  Player,
  Options,
  Mixer,
  Playlist,
  Database,
  Other(String),
}

impl From<&str> for Subsystem {
  fn from(name: &str) -> Self {
    match name {
      "player" => Subsystem::Player,
      "options" => Subsystem::Options,
      "mixer" => Subsystem::Mixer,
      "playlist" => Subsystem::Playlist,
      "database" => Subsystem::Database,
      other => Subsystem::Other(other.to_string()),
    }
  }
}

impl Subsystem {
  /// Collect the `changed:` lines of an idle reply.
  pub fn from_response(response: &Response) -> Vec<Subsystem> {
    response.get_all("changed").map(Subsystem::from).collect()
  }
}
