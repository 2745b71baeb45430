use serde::{Deserialize, Serialize};

use crate::catalog::Track;

/// Current protocol version.  Bump this when the wire format changes in a
/// breaking way.  Clients check it on connect and can refuse to talk to an
/// incompatible daemon.
pub const PROTOCOL_VERSION: u32 = 1;

/// Messages sent from a client to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd")]
pub enum Command {
    /// Start (or resume) playback. First play joins the live edge; a paused
    /// station resumes at the advanced position.
    Play,
    /// Jump to a specific catalog track (manual navigation — drops liveness).
    PlayTrack { index: usize },
    TogglePause,
    Stop,
    Next,
    Prev,
    /// Jump back to the live edge.
    GoLive,
    SeekTo { seconds: f64 },
    SeekRelative { seconds: f64 },
    Volume { value: f32 },
    ToggleShuffle,
    CycleRepeat,
    /// Replace the persisted free-text notes.
    SetNotes { text: String },
    GetState,
}

/// Messages sent from the daemon to clients (broadcasts).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "broadcast")]
pub enum Broadcast {
    /// Sent immediately on connect: daemon version + full state snapshot.
    Hello {
        protocol_version: u32,
        daemon_rev: u64,
        state: PlayerState,
    },
    State {
        data: PlayerState,
    },
    Log {
        message: String,
    },
    Error {
        message: String,
    },
}

/// Detailed playback status — reflects actual driver state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub enum PlaybackStatus {
    #[default]
    Idle, // nothing loaded / explicitly stopped
    Connecting, // load issued, driver buffering
    Playing,    // audio flowing
    Paused,     // explicitly paused
    Error,      // failed to play (gave up retrying, or unrecoverable)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub enum RepeatMode {
    None,
    #[default]
    All,
    One,
}

impl RepeatMode {
    pub fn next(self) -> Self {
        match self {
            RepeatMode::None => RepeatMode::All,
            RepeatMode::All => RepeatMode::One,
            RepeatMode::One => RepeatMode::None,
        }
    }
}

/// Playback-resource error taxonomy.
///
/// Network/decode/unknown failures are worth retrying with backoff; an
/// unsupported format never fixes itself, and a denied audio device (the
/// closest analogue of a blocked autoplay) needs an explicit user Play.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, thiserror::Error)]
pub enum PlaybackErrorKind {
    #[error("network error")]
    Network,
    #[error("cannot decode audio")]
    Decode,
    #[error("format not supported")]
    FormatUnsupported,
    #[error("audio output unavailable, press play to retry")]
    PermissionDenied,
    #[error("unknown playback error")]
    Unknown,
}

impl PlaybackErrorKind {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PlaybackErrorKind::Network | PlaybackErrorKind::Decode | PlaybackErrorKind::Unknown
        )
    }
}

/// Full state of the daemon.  `rev` is a monotonically increasing counter
/// incremented every time the state changes.  Clients can use it to detect
/// missed updates and request a resync.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PlayerState {
    /// Monotonic revision counter — incremented on every state change.
    #[serde(default)]
    pub rev: u64,
    pub tracks: Vec<Track>,
    pub current_track: usize,
    pub volume: f32,
    pub playback_status: PlaybackStatus,
    /// True when actual playback tracks the broadcast clock.
    pub is_live: bool,
    pub time_pos_secs: Option<f64>,
    pub duration_secs: Option<f64>,
    #[serde(default)]
    pub shuffle: bool,
    #[serde(default)]
    pub repeat: RepeatMode,
    /// Last playback error surfaced to users, cleared on successful play.
    #[serde(default)]
    pub last_error: Option<PlaybackErrorKind>,
}

/// Wrapper for socket communication.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Command(Command),
    Broadcast(Box<Broadcast>),
}

impl Message {
    pub fn broadcast(b: Broadcast) -> Self {
        Message::Broadcast(Box::new(b))
    }

    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        let len = json.len() as u32;
        let mut result = Vec::with_capacity(4 + json.len());
        result.extend_from_slice(&len.to_be_bytes());
        result.extend_from_slice(&json);
        Ok(result)
    }

    pub fn decode(data: &[u8]) -> anyhow::Result<(Self, usize)> {
        if data.len() < 4 {
            anyhow::bail!("Insufficient data for length header");
        }
        let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if data.len() < 4 + len {
            anyhow::bail!("Insufficient data for message");
        }
        let msg: Self = serde_json::from_slice(&data[4..4 + len])?;
        Ok((msg, 4 + len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_encode_decode() {
        let msg = Message::Command(Command::PlayTrack { index: 5 });
        let encoded = msg.encode().unwrap();
        let (decoded, len) = Message::decode(&encoded).unwrap();
        assert_eq!(len, encoded.len());
        match decoded {
            Message::Command(Command::PlayTrack { index }) => assert_eq!(index, 5),
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_hello_encode_decode() {
        let state = PlayerState {
            rev: 42,
            is_live: true,
            ..Default::default()
        };
        let msg = Message::broadcast(Broadcast::Hello {
            protocol_version: PROTOCOL_VERSION,
            daemon_rev: 42,
            state,
        });
        let encoded = msg.encode().unwrap();
        let (decoded, _) = Message::decode(&encoded).unwrap();
        match decoded {
            Message::Broadcast(b) => match *b {
                Broadcast::Hello {
                    protocol_version,
                    daemon_rev,
                    state,
                } => {
                    assert_eq!(protocol_version, PROTOCOL_VERSION);
                    assert_eq!(daemon_rev, 42);
                    assert!(state.is_live);
                }
                _ => panic!("Wrong broadcast type"),
            },
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_decode_partial_buffer() {
        let msg = Message::Command(Command::GoLive);
        let encoded = msg.encode().unwrap();
        assert!(Message::decode(&encoded[..3]).is_err());
        assert!(Message::decode(&encoded[..encoded.len() - 1]).is_err());
    }

    #[test]
    fn test_repeat_mode_cycles() {
        let mut mode = RepeatMode::None;
        mode = mode.next();
        assert_eq!(mode, RepeatMode::All);
        mode = mode.next();
        assert_eq!(mode, RepeatMode::One);
        mode = mode.next();
        assert_eq!(mode, RepeatMode::None);
    }

    #[test]
    fn test_error_kind_retryability() {
        assert!(PlaybackErrorKind::Network.is_retryable());
        assert!(PlaybackErrorKind::Decode.is_retryable());
        assert!(PlaybackErrorKind::Unknown.is_retryable());
        assert!(!PlaybackErrorKind::FormatUnsupported.is_retryable());
        assert!(!PlaybackErrorKind::PermissionDenied.is_retryable());
    }
}
