//! Status diffing: raw `status` replies in, semantic change categories out.

use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;

use serde::Serialize;
use thiserror::Error;

use super::protocol::Response;
use super::timer::Timer;

/// Coarse change label surfaced to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Category {
  Track,
  Status,
  Position,
  Repeat,
  Shuffle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackStatus {
  Playing,
  Paused,
  #[default]
  Stopped,
}

impl FromStr for PlaybackStatus {
  type Err = ParseError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "play" => Ok(PlaybackStatus::Playing),
      "pause" => Ok(PlaybackStatus::Paused),
      "stop" => Ok(PlaybackStatus::Stopped),
      other => Err(ParseError::UnknownState(other.to_string())),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RepeatMode {
  #[default]
  None,
  Track,
  All,
}

impl RepeatMode {
  /// `(repeat, single)` flags for this mode.
  pub fn flags(self) -> (bool, bool) {
    match self {
      RepeatMode::None => (false, false),
      RepeatMode::Track => (true, true),
      RepeatMode::All => (true, false),
    }
  }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
  #[error("Invalid integer for {field}: {value:?}")]
  InvalidInt { field: &'static str, value: String },
  #[error("Unknown playback state: {0:?}")]
  UnknownState(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StatusError {
  #[error("Status rejected: {0}")]
  Fatal(#[from] ParseError),
}

/// Parsed value of a tracked status field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldValue {
  Int(i64),
  State(PlaybackStatus),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldParser {
  Int,
  State,
}

/// Status fields that feed change detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusField {
  SongId,
  Playlist,
  Repeat,
  Single,
  Random,
  State,
}

impl StatusField {
  pub const ALL: [StatusField; 6] = [
    StatusField::SongId,
    StatusField::Playlist,
    StatusField::Repeat,
    StatusField::Single,
    StatusField::Random,
    StatusField::State,
  ];

  pub fn key(self) -> &'static str {
    match self {
      StatusField::SongId => "songid",
      StatusField::Playlist => "playlist",
      StatusField::Repeat => "repeat",
      StatusField::Single => "single",
      StatusField::Random => "random",
      StatusField::State => "state",
    }
  }

  pub fn category(self) -> Category {
    match self {
      StatusField::SongId | StatusField::Playlist => Category::Track,
      StatusField::Repeat | StatusField::Single => Category::Repeat,
      StatusField::Random => Category::Shuffle,
      StatusField::State => Category::Status,
    }
  }

  fn parser(self) -> FieldParser {
    match self {
      StatusField::State => FieldParser::State,
      _ => FieldParser::Int,
    }
  }

  pub fn parse(self, raw: &str) -> Result<FieldValue, ParseError> {
    match self.parser() {
      FieldParser::Int => raw
        .trim()
        .parse()
        .map(FieldValue::Int)
        .map_err(|_| ParseError::InvalidInt {
          field: self.key(),
          value: raw.to_string(),
        }),
      FieldParser::State => raw.parse().map(FieldValue::State),
    }
  }
}

/// Song metadata from `currentsong`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Metadata {
  pub title: Option<String>,
  pub artist: Option<String>,
  pub album: Option<String>,
  pub track_number: Option<u32>,
  pub duration_ms: Option<u64>,
}

impl Metadata {
  pub fn from_response(response: &Response) -> Self {
    let text = |key: &str| response.get(key).map(str::to_string);

    // "3/12" -> 3
    let track_number = response
      .get("track")
      .and_then(|track| track.split('/').next())
      .and_then(|n| n.trim().parse().ok());

    let duration_ms = response
      .get("duration")
      .or_else(|| response.get("time"))
      .and_then(seconds_to_ms);

    Self {
      title: text("title"),
      artist: text("artist"),
      album: text("album"),
      track_number,
      duration_ms,
    }
  }
}

/// Largest time accepted from the wire, leaving headroom for interpolation.
const MAX_TIME_MS: u64 = u64::MAX / 2;

fn seconds_to_ms(raw: &str) -> Option<u64> {
  let secs: f64 = raw.trim().parse().ok()?;
  if !secs.is_finite() || secs < 0.0 {
    return None;
  }
  let ms = (secs * 1000.0).round();
  if ms > MAX_TIME_MS as f64 {
    log::warn!("Ignoring out of range time: {}", raw);
    return None;
  }
  Some(ms as u64)
}

/// Set of changed categories, iterated in a stable order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet(BTreeSet<Category>);

impl ChangeSet {
  pub fn insert(&mut self, category: Category) {
    self.0.insert(category);
  }

  pub fn remove(&mut self, category: Category) -> bool {
    self.0.remove(&category)
  }

  pub fn contains(&self, category: Category) -> bool {
    self.0.contains(&category)
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  pub fn clear(&mut self) {
    self.0.clear();
  }

  pub fn iter(&self) -> impl Iterator<Item = Category> + '_ {
    self.0.iter().copied()
  }
}

/// Last known player fields. Fields are overwritten one by one and never reset wholesale.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
  fields: HashMap<StatusField, FieldValue>,
  metadata: Metadata,
}

impl Snapshot {
  pub fn get(&self, field: StatusField) -> Option<FieldValue> {
    self.fields.get(&field).copied()
  }

  fn int(&self, field: StatusField) -> Option<i64> {
    match self.get(field) {
      Some(FieldValue::Int(n)) => Some(n),
      _ => None,
    }
  }

  pub fn song_id(&self) -> Option<i64> {
    self.int(StatusField::SongId)
  }

  pub fn status(&self) -> PlaybackStatus {
    match self.get(StatusField::State) {
      Some(FieldValue::State(status)) => status,
      _ => PlaybackStatus::Stopped,
    }
  }

  pub fn repeat_mode(&self) -> RepeatMode {
    let repeat = self.int(StatusField::Repeat).unwrap_or(0) != 0;
    let single = self.int(StatusField::Single).unwrap_or(0) != 0;
    match (repeat, single) {
      (false, _) => RepeatMode::None,
      (true, false) => RepeatMode::All,
      (true, true) => RepeatMode::Track,
    }
  }

  pub fn shuffle(&self) -> bool {
    self.int(StatusField::Random).unwrap_or(0) != 0
  }

  pub fn metadata(&self) -> &Metadata {
    &self.metadata
  }

  fn set(&mut self, field: StatusField, value: Option<FieldValue>) {
    match value {
      Some(value) => self.fields.insert(field, value),
      None => self.fields.remove(&field),
    };
  }
}

/// Result of applying one status reply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusDiff {
  pub changes: ChangeSet,
  /// The track changed to a real song; its metadata must be fetched.
  pub fetch_metadata: bool,
}

/// Owns the snapshot and the elapsed-time timer and keeps them consistent.
#[derive(Debug, Clone)]
pub struct StatusTracker {
  snapshot: Snapshot,
  timer: Timer,
  established: bool,
}

impl StatusTracker {
  pub fn new(tolerance_ms: u64) -> Self {
    Self {
      snapshot: Snapshot::default(),
      timer: Timer::new(tolerance_ms),
      established: false,
    }
  }

  pub fn snapshot(&self) -> &Snapshot {
    &self.snapshot
  }

  pub fn position(&self) -> u64 {
    self.timer.current()
  }

  /// Start reporting changes. Everything before this is the baseline.
  pub fn establish_baseline(&mut self) {
    self.established = true;
  }

  /// Stop interpolating; the last known position stays readable.
  pub fn freeze(&mut self) {
    self.timer.pause();
  }

  pub fn apply_metadata(&mut self, response: &Response) {
    self.snapshot.metadata = Metadata::from_response(response);
    log::debug!("Metadata: {:?}", self.snapshot.metadata);
  }

  /// Diff a `status` reply against the snapshot and update it.
  ///
  /// An unknown playback state rejects the whole reply. Any other field
  /// that fails to parse keeps its previous value.
  pub fn apply_status(&mut self, response: &Response) -> Result<StatusDiff, StatusError> {
    if let Some(raw) = response.get(StatusField::State.key()) {
      raw.parse::<PlaybackStatus>()?;
    }

    let mut changes = ChangeSet::default();
    for field in StatusField::ALL {
      let value = match response.get(field.key()) {
        None => None,
        Some(raw) => match field.parse(raw) {
          Ok(value) => Some(value),
          Err(e) => {
            log::warn!("Ignoring status field: {}", e);
            continue;
          }
        },
      };

      if value != self.snapshot.get(field) {
        log::debug!("Status field {} changed to {:?}", field.key(), value);
        self.snapshot.set(field, value);
        changes.insert(field.category());
      }
    }

    let mut fetch_metadata = false;
    if changes.contains(Category::Track) {
      if self.snapshot.song_id().is_none() {
        self.snapshot.metadata = Metadata::default();
      } else {
        fetch_metadata = true;
      }
    }

    let status = self.snapshot.status();
    if changes.contains(Category::Status) {
      match status {
        PlaybackStatus::Paused => self.timer.pause(),
        PlaybackStatus::Playing => self.timer.play(),
        PlaybackStatus::Stopped => self.timer.stop(),
      }
    }

    let elapsed = if status == PlaybackStatus::Stopped {
      Some(0)
    } else {
      response.get("elapsed").and_then(seconds_to_ms)
    };
    if let Some(elapsed) = elapsed {
      if self.timer.correct(elapsed) {
        changes.insert(Category::Position);
      }
    }

    if !self.established {
      changes.clear();
    }
    if !changes.is_empty() {
      log::debug!("Status changes: {:?}", changes);
    }

    Ok(StatusDiff {
      changes,
      fetch_metadata,
    })
  }
}

impl Default for StatusTracker {
  fn default() -> Self {
    Self::new(super::timer::DEFAULT_TOLERANCE_MS)
  }
}
