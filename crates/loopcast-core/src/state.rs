//! Shared player state + best-effort persistence.
//!
//! State changes are explicit: a mutator writes the new value, bumps `rev`,
//! and saves. Notification is the daemon's concern (it publishes on its
//! broadcast channel after calling a mutator), so observers diff snapshots
//! instead of hooking property interception.
//!
//! Persistence is fire-and-forget. A broken or missing state file means the
//! epoch simply resets — the station must run correctly as if nothing were
//! persisted, so save/load failures are logged and swallowed.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;

use crate::catalog::Track;
use crate::clock::BroadcastClock;
use crate::protocol::{PlaybackErrorKind, PlaybackStatus, PlayerState, RepeatMode};

/// Soft cap on persisted free-text notes.
pub const NOTES_MAX_CHARS: usize = 5000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistentState {
    /// When the virtual broadcast started (ms since Unix epoch). The sole
    /// seed of determinism; created once, normalised to local midnight.
    pub broadcast_epoch_ms: i64,
    pub volume: f32,
    pub last_track_idx: usize,
    #[serde(default)]
    pub shuffle: bool,
    #[serde(default)]
    pub repeat: RepeatMode,
    #[serde(default)]
    pub notes: String,
}

impl Default for PersistentState {
    fn default() -> Self {
        Self {
            broadcast_epoch_ms: BroadcastClock::midnight_today_ms(),
            volume: 0.8,
            last_track_idx: 0,
            shuffle: false,
            repeat: RepeatMode::All,
            notes: String::new(),
        }
    }
}

pub struct StateManager {
    state: Arc<RwLock<PlayerState>>,
    notes: RwLock<String>,
    epoch_ms: i64,
    state_file: PathBuf,
}

impl StateManager {
    /// `default_volume` is the configured fallback; it only applies when no
    /// state file exists (or it is unreadable) — persisted volume wins.
    pub fn new(state_file: PathBuf, tracks: Vec<Track>, default_volume: f32) -> Self {
        let persistent = Self::load_persistent(&state_file, default_volume);
        let last_track = if persistent.last_track_idx < tracks.len() {
            persistent.last_track_idx
        } else {
            0
        };

        let state = PlayerState {
            rev: 1,
            tracks,
            current_track: last_track,
            volume: persistent.volume.clamp(0.0, 1.0),
            playback_status: PlaybackStatus::Idle,
            is_live: true,
            time_pos_secs: None,
            duration_secs: None,
            shuffle: persistent.shuffle,
            repeat: persistent.repeat,
            last_error: None,
        };

        Self {
            state: Arc::new(RwLock::new(state)),
            notes: RwLock::new(persistent.notes),
            epoch_ms: persistent.broadcast_epoch_ms,
            state_file,
        }
    }

    pub fn epoch_ms(&self) -> i64 {
        self.epoch_ms
    }

    pub fn arc(&self) -> Arc<RwLock<PlayerState>> {
        Arc::clone(&self.state)
    }

    pub async fn get_state(&self) -> PlayerState {
        self.state.read().await.clone()
    }

    pub async fn notes(&self) -> String {
        self.notes.read().await.clone()
    }

    pub async fn set_notes(&self, text: String) {
        let capped = if text.chars().count() > NOTES_MAX_CHARS {
            text.chars().take(NOTES_MAX_CHARS).collect()
        } else {
            text
        };
        *self.notes.write().await = capped;
        self.save().await;
    }

    pub async fn set_track(&self, index: usize) {
        {
            let mut state = self.state.write().await;
            state.current_track = index;
            state.playback_status = PlaybackStatus::Connecting;
            state.time_pos_secs = None;
            state.duration_secs = None;
            state.rev += 1;
        }
        self.save().await;
    }

    pub async fn set_playback_status(&self, status: PlaybackStatus) {
        let mut state = self.state.write().await;
        state.playback_status = status;
        if status == PlaybackStatus::Playing {
            state.last_error = None;
        }
        state.rev += 1;
    }

    pub async fn set_stopped(&self) {
        let mut state = self.state.write().await;
        state.playback_status = PlaybackStatus::Idle;
        state.time_pos_secs = None;
        state.duration_secs = None;
        state.rev += 1;
    }

    pub async fn set_live(&self, is_live: bool) -> bool {
        let mut state = self.state.write().await;
        if state.is_live == is_live {
            return false;
        }
        state.is_live = is_live;
        state.rev += 1;
        true
    }

    pub async fn set_timeline(&self, time_pos_secs: Option<f64>, duration_secs: Option<f64>) {
        let mut state = self.state.write().await;
        state.time_pos_secs = time_pos_secs;
        state.duration_secs = duration_secs;
        state.rev += 1;
    }

    /// Position tick without touching the known duration.
    pub async fn set_time_pos(&self, time_pos_secs: Option<f64>) {
        let mut state = self.state.write().await;
        state.time_pos_secs = time_pos_secs;
        state.rev += 1;
    }

    pub async fn set_volume(&self, volume: f32) {
        {
            let mut state = self.state.write().await;
            state.volume = volume.clamp(0.0, 1.0);
            state.rev += 1;
        }
        self.save().await;
    }

    pub async fn toggle_shuffle(&self) -> bool {
        let shuffle = {
            let mut state = self.state.write().await;
            state.shuffle = !state.shuffle;
            state.rev += 1;
            state.shuffle
        };
        self.save().await;
        shuffle
    }

    pub async fn cycle_repeat(&self) -> RepeatMode {
        let repeat = {
            let mut state = self.state.write().await;
            state.repeat = state.repeat.next();
            state.rev += 1;
            state.repeat
        };
        self.save().await;
        repeat
    }

    pub async fn set_error(&self, kind: Option<PlaybackErrorKind>) {
        let mut state = self.state.write().await;
        state.last_error = kind;
        if kind.is_some() {
            state.playback_status = PlaybackStatus::Error;
        }
        state.rev += 1;
    }

    async fn save(&self) {
        let persistent = {
            let state = self.state.read().await;
            PersistentState {
                broadcast_epoch_ms: self.epoch_ms,
                volume: state.volume,
                last_track_idx: state.current_track,
                shuffle: state.shuffle,
                repeat: state.repeat,
                notes: self.notes.read().await.clone(),
            }
        };

        if let Err(e) = self.write_persistent(&persistent).await {
            warn!("state: failed to persist {:?}: {}", self.state_file, e);
        }
    }

    async fn write_persistent(&self, persistent: &PersistentState) -> anyhow::Result<()> {
        if let Some(parent) = self.state_file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(persistent)?;
        tokio::fs::write(&self.state_file, json).await?;
        Ok(())
    }

    fn load_persistent(state_file: &PathBuf, default_volume: f32) -> PersistentState {
        let fresh = || PersistentState {
            volume: default_volume.clamp(0.0, 1.0),
            ..Default::default()
        };
        match std::fs::read_to_string(state_file) {
            Ok(content) => match serde_json::from_str::<PersistentState>(&content) {
                Ok(persistent) => persistent,
                Err(e) => {
                    warn!("state: corrupt state file {:?}: {}", state_file, e);
                    fresh()
                }
            },
            Err(_) => fresh(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::TrackCatalog;

    fn seed_tracks(n: usize) -> Vec<Track> {
        TrackCatalog::builtin(n).tracks().to_vec()
    }

    #[tokio::test]
    async fn test_missing_state_file_uses_defaults() {
        let dir = std::env::temp_dir().join("loopcast-test-missing-state");
        let manager = StateManager::new(dir.join("state.json"), seed_tracks(3), 0.8);
        let state = manager.get_state().await;
        assert_eq!(state.current_track, 0);
        assert_eq!(state.volume, 0.8);
        assert!(state.is_live);
        assert!(manager.epoch_ms() > 0);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_configured_default_volume_seeds_fresh_install() {
        let dir = std::env::temp_dir().join("loopcast-test-default-vol");
        let _ = std::fs::remove_dir_all(&dir);
        let file = dir.join("state.json");

        // no state file: the configured fallback applies
        let manager = StateManager::new(file.clone(), seed_tracks(2), 0.2);
        assert!((manager.get_state().await.volume - 0.2).abs() < 1e-6);

        // once volume is persisted, it beats any configured fallback
        manager.set_volume(0.65).await;
        let reloaded = StateManager::new(file, seed_tracks(2), 0.2);
        assert!((reloaded.get_state().await.volume - 0.65).abs() < 1e-6);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_out_of_range_last_track_resets() {
        let dir = std::env::temp_dir().join("loopcast-test-oob-track");
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        let file = dir.join("state.json");
        let persistent = PersistentState {
            last_track_idx: 99,
            ..Default::default()
        };
        std::fs::write(&file, serde_json::to_string(&persistent).unwrap()).unwrap();

        let manager = StateManager::new(file, seed_tracks(3), 0.8);
        assert_eq!(manager.get_state().await.current_track, 0);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_persistence_round_trip() {
        let dir = std::env::temp_dir().join("loopcast-test-roundtrip");
        let _ = std::fs::remove_dir_all(&dir);
        let file = dir.join("state.json");

        let manager = StateManager::new(file.clone(), seed_tracks(5), 0.8);
        let epoch = manager.epoch_ms();
        manager.set_volume(0.3).await;
        manager.set_track(2).await;
        manager.toggle_shuffle().await;
        manager.set_notes("waheguru".to_string()).await;

        let reloaded = StateManager::new(file, seed_tracks(5), 0.8);
        let state = reloaded.get_state().await;
        assert_eq!(reloaded.epoch_ms(), epoch);
        assert!((state.volume - 0.3).abs() < 1e-6);
        assert_eq!(state.current_track, 2);
        assert!(state.shuffle);
        assert_eq!(reloaded.notes().await, "waheguru");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_notes_soft_cap() {
        let dir = std::env::temp_dir().join("loopcast-test-notes-cap");
        let _ = std::fs::remove_dir_all(&dir);
        let manager = StateManager::new(dir.join("state.json"), seed_tracks(1), 0.8);
        manager.set_notes("x".repeat(NOTES_MAX_CHARS + 100)).await;
        assert_eq!(manager.notes().await.chars().count(), NOTES_MAX_CHARS);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_rev_increments_and_live_flip_dedupes() {
        let dir = std::env::temp_dir().join("loopcast-test-rev");
        let manager = StateManager::new(dir.join("state.json"), seed_tracks(2), 0.8);
        let rev0 = manager.get_state().await.rev;

        assert!(manager.set_live(false).await);
        assert!(!manager.set_live(false).await); // no change, no rev bump
        let rev1 = manager.get_state().await.rev;
        assert_eq!(rev1, rev0 + 1);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
