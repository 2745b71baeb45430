//! DaemonCore — the single event loop that wires the scheduling engine to
//! real playback.
//!
//! Every external input funnels into one mpsc channel: client commands from
//! the control socket, mpv events/property-changes, and retry timers.  The
//! loop owns the duration table, the broadcast clock, and the live tracker,
//! so no scheduling state is ever touched from two tasks.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use loopcast_core::catalog::TrackCatalog;
use loopcast_core::clock::BroadcastClock;
use loopcast_core::config::Config;
use loopcast_core::durations::DurationTable;
use loopcast_core::live::LiveTracker;
use loopcast_core::protocol::{Command, PlaybackErrorKind, PlaybackStatus, RepeatMode};
use loopcast_core::state::StateManager;

use crate::mpv::{
    classify_file_error, MpvDriver, MpvEvent, MpvHandle, OBS_CORE_IDLE, OBS_DURATION, OBS_PAUSE,
    OBS_TIME_POS,
};
use crate::BroadcastMessage;

/// Base delay for the bounded exponential retry ladder (delay × attempt).
const RETRY_BASE_DELAY_MS: u64 = 2000;

const HISTORY_CAP: usize = 50;

#[derive(Debug)]
pub enum DaemonEvent {
    ClientCommand(Command),
    Mpv(MpvEvent),
    RetryLoad { track_index: usize, attempt: u32 },
}

pub struct DaemonCore {
    config: Config,
    catalog: TrackCatalog,
    clock: BroadcastClock,
    durations: DurationTable,
    tracker: LiveTracker,
    state: Arc<StateManager>,
    driver: MpvDriver,
    mpv: Option<MpvHandle>,
    mpv_event_tx: mpsc::Sender<MpvEvent>,
    event_tx: mpsc::Sender<DaemonEvent>,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
    /// Base URL tracks resolve under (gateway, local dir, or upstream).
    audio_base: String,
    play_history: Vec<usize>,
    last_time_pos: Option<f64>,
    retry_attempt: u32,
}

impl DaemonCore {
    pub async fn new(
        config: Config,
        catalog: TrackCatalog,
        broadcast_tx: broadcast::Sender<BroadcastMessage>,
        event_tx: mpsc::Sender<DaemonEvent>,
    ) -> anyhow::Result<Self> {
        let state = Arc::new(StateManager::new(
            config.daemon.state_file.clone(),
            catalog.tracks().to_vec(),
            config.playback.default_volume,
        ));
        let clock = BroadcastClock::new(state.epoch_ms());
        let tracker = LiveTracker::new(config.playback.live_threshold_secs);
        let volume = state.get_state().await.volume;
        let driver = MpvDriver::new(volume);

        // mpv events funnel into the same loop as everything else
        let (mpv_event_tx, mut mpv_event_rx) = mpsc::channel::<MpvEvent>(256);
        let forward_tx = event_tx.clone();
        tokio::spawn(async move {
            while let Some(ev) = mpv_event_rx.recv().await {
                if forward_tx.send(DaemonEvent::Mpv(ev)).await.is_err() {
                    break;
                }
            }
        });

        let audio_base = if config.http.enabled {
            format!(
                "http://{}:{}/audio",
                config.http.bind_address, config.http.port
            )
        } else if let Some(dir) = &config.audio.local_dir {
            dir.display().to_string()
        } else {
            config.audio.upstream_base_url.clone()
        };

        info!(
            "broadcast epoch: {} ({} tracks in catalog)",
            clock.epoch_ms(),
            catalog.len()
        );

        Ok(Self {
            config,
            catalog,
            clock,
            durations: DurationTable::new(),
            tracker,
            state,
            driver,
            mpv: None,
            mpv_event_tx,
            event_tx,
            broadcast_tx,
            audio_base,
            play_history: Vec::new(),
            last_time_pos: None,
            retry_attempt: 0,
        })
    }

    pub fn state_manager(&self) -> Arc<StateManager> {
        Arc::clone(&self.state)
    }

    pub async fn run(mut self, mut event_rx: mpsc::Receiver<DaemonEvent>) -> anyhow::Result<()> {
        while let Some(event) = event_rx.recv().await {
            match event {
                DaemonEvent::ClientCommand(cmd) => self.handle_command(cmd).await,
                DaemonEvent::Mpv(ev) => self.handle_mpv_event(ev).await,
                DaemonEvent::RetryLoad {
                    track_index,
                    attempt,
                } => self.handle_retry(track_index, attempt).await,
            }
        }
        self.driver.kill().await;
        Ok(())
    }

    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    fn notify(&self) {
        let _ = self.broadcast_tx.send(BroadcastMessage::StateUpdated);
    }

    async fn ensure_mpv(&mut self) -> anyhow::Result<MpvHandle> {
        if let Some(handle) = &self.mpv {
            if self.driver.process_alive() && handle.ping().await.is_ok() {
                return Ok(handle.clone());
            }
            warn!("mpv: process or IPC gone, respawning");
        }
        let handle = self
            .driver
            .spawn_and_connect(self.mpv_event_tx.clone())
            .await?;
        handle.observe_all_properties().await;
        self.mpv = Some(handle.clone());
        Ok(handle)
    }

    // ── commands ──────────────────────────────────────────────────────────────

    async fn handle_command(&mut self, cmd: Command) {
        debug!("command: {:?}", cmd);
        match cmd {
            Command::Play => self.cmd_play().await,
            Command::PlayTrack { index } => {
                if self.catalog.is_empty() {
                    return;
                }
                let index = index % self.catalog.len();
                self.tracker.discard_snapshot();
                self.tracker.mark_diverged();
                self.state.set_live(false).await;
                self.start_track(index, 0.0, false).await;
            }
            Command::TogglePause => self.cmd_toggle_pause().await,
            Command::Stop => self.cmd_stop().await,
            Command::Next => self.cmd_next().await,
            Command::Prev => self.cmd_prev().await,
            Command::GoLive => self.cmd_go_live().await,
            Command::SeekTo { seconds } => {
                if let Some(mpv) = self.mpv.clone() {
                    if let Err(e) = mpv.seek_to(seconds.max(0.0)).await {
                        warn!("seek failed: {}", e);
                    }
                }
                self.tracker.mark_diverged();
                self.state.set_live(false).await;
                self.notify();
            }
            Command::SeekRelative { seconds } => {
                if let Some(mpv) = self.mpv.clone() {
                    if let Err(e) = mpv.seek_relative(seconds).await {
                        warn!("relative seek failed: {}", e);
                    }
                }
                self.tracker.mark_diverged();
                self.state.set_live(false).await;
                self.notify();
            }
            Command::Volume { value } => {
                let value = value.clamp(0.0, 1.0);
                self.driver.last_volume = value;
                if let Some(mpv) = self.mpv.clone() {
                    let _ = mpv.set_volume(value).await;
                }
                self.state.set_volume(value).await;
                self.notify();
            }
            Command::ToggleShuffle => {
                self.state.toggle_shuffle().await;
                self.notify();
            }
            Command::CycleRepeat => {
                self.state.cycle_repeat().await;
                self.notify();
            }
            Command::SetNotes { text } => {
                self.state.set_notes(text).await;
            }
            Command::GetState => self.notify(),
        }
    }

    /// Play: resume an advanced paused position, or join the live edge when
    /// nothing is loaded. With virtual-live disabled this is a plain player
    /// play (resume in place / start the last track from zero).
    async fn cmd_play(&mut self) {
        let snapshot_pending = self.tracker.is_paused();
        let status = self.state.get_state().await.playback_status;

        if !self.config.playback.virtual_live {
            match status {
                PlaybackStatus::Paused => {
                    if let Some(mpv) = self.mpv.clone() {
                        let _ = mpv.set_pause(false).await;
                    }
                }
                PlaybackStatus::Playing | PlaybackStatus::Connecting => {}
                _ => {
                    let current = self.state.get_state().await.current_track;
                    self.start_track(current, 0.0, false).await;
                }
            }
            return;
        }

        if snapshot_pending {
            let now = self.now_ms();
            let pos = self
                .tracker
                .resume(now, &self.clock, &self.catalog, &self.durations);
            let current = self.state.get_state().await.current_track;

            if pos.track_index != current {
                self.start_track(pos.track_index, pos.offset_secs, false).await;
            } else if let Some(mpv) = self.mpv.clone() {
                let _ = mpv.seek_to(pos.offset_secs).await;
                let _ = mpv.set_pause(false).await;
            } else {
                self.start_track(pos.track_index, pos.offset_secs, false).await;
            }
            self.state.set_live(true).await;
            self.notify();
            return;
        }

        match status {
            PlaybackStatus::Idle | PlaybackStatus::Error => self.cmd_go_live().await,
            PlaybackStatus::Paused => {
                // paused without a snapshot (e.g. paused by mpv before we saw
                // a time-pos) — just unpause
                if let Some(mpv) = self.mpv.clone() {
                    let _ = mpv.set_pause(false).await;
                }
            }
            PlaybackStatus::Playing | PlaybackStatus::Connecting => {}
        }
    }

    async fn cmd_toggle_pause(&mut self) {
        let status = self.state.get_state().await.playback_status;
        match status {
            PlaybackStatus::Playing | PlaybackStatus::Connecting => {
                if let Some(mpv) = self.mpv.clone() {
                    if let Err(e) = mpv.set_pause(true).await {
                        warn!("pause failed: {}", e);
                    }
                }
            }
            _ => self.cmd_play().await,
        }
    }

    async fn cmd_stop(&mut self) {
        if let Some(mpv) = self.mpv.clone() {
            let _ = mpv.stop().await;
        }
        self.tracker.discard_snapshot();
        self.tracker.mark_diverged();
        self.last_time_pos = None;
        self.state.set_stopped().await;
        self.state.set_live(false).await;
        self.notify();
    }

    async fn cmd_next(&mut self) {
        if self.catalog.is_empty() {
            return;
        }
        let state = self.state.get_state().await;
        let next = if state.shuffle {
            self.catalog
                .random_index(Some(state.current_track))
                .unwrap_or(0)
        } else {
            (state.current_track + 1) % self.catalog.len()
        };

        self.tracker.discard_snapshot();
        self.tracker.mark_diverged();
        self.state.set_live(false).await;
        self.start_track(next, 0.0, false).await;
    }

    async fn cmd_prev(&mut self) {
        if self.catalog.is_empty() {
            return;
        }

        // a few seconds in, "previous" restarts the current track
        if self.last_time_pos.unwrap_or(0.0) > 3.0 {
            if let Some(mpv) = self.mpv.clone() {
                let _ = mpv.seek_to(0.0).await;
            }
            self.tracker.mark_diverged();
            self.state.set_live(false).await;
            self.notify();
            return;
        }

        let state = self.state.get_state().await;
        let prev = if self.play_history.len() > 1 {
            self.play_history.pop();
            self.play_history.pop().unwrap_or(0)
        } else if state.shuffle {
            self.catalog
                .random_index(Some(state.current_track))
                .unwrap_or(0)
        } else {
            (state.current_track + self.catalog.len() - 1) % self.catalog.len()
        };

        self.tracker.discard_snapshot();
        self.tracker.mark_diverged();
        self.state.set_live(false).await;
        self.start_track(prev, 0.0, false).await;
    }

    async fn cmd_go_live(&mut self) {
        if self.catalog.is_empty() {
            return;
        }
        let now = self.now_ms();
        let pos = self
            .tracker
            .go_live(now, &self.clock, &self.catalog, &self.durations);
        let state = self.state.get_state().await;

        if pos.track_index != state.current_track
            || state.playback_status == PlaybackStatus::Idle
            || state.playback_status == PlaybackStatus::Error
        {
            self.start_track(pos.track_index, pos.offset_secs, false).await;
        } else if let Some(mpv) = self.mpv.clone() {
            let _ = mpv.seek_to(pos.offset_secs).await;
            if state.playback_status != PlaybackStatus::Playing {
                let _ = mpv.set_pause(false).await;
            }
        }
        self.state.set_live(true).await;
        self.notify();
    }

    // ── track loading ─────────────────────────────────────────────────────────

    async fn start_track(&mut self, index: usize, start_secs: f64, paused: bool) {
        if let Err(e) = self.try_start_track(index, start_secs, paused).await {
            warn!("failed to start track {}: {}", index, e);
            self.handle_playback_error(PlaybackErrorKind::Unknown).await;
        }
    }

    async fn try_start_track(
        &mut self,
        index: usize,
        start_secs: f64,
        paused: bool,
    ) -> anyhow::Result<()> {
        let mpv = self.ensure_mpv().await?;

        let url = self
            .catalog
            .audio_url(&self.audio_base, index)
            .ok_or_else(|| anyhow::anyhow!("track {} not in catalog", index))?;

        self.state.set_track(index).await;
        self.last_time_pos = None;
        self.play_history.push(index);
        if self.play_history.len() > HISTORY_CAP {
            self.play_history.remove(0);
        }

        let volume = self.state.get_state().await.volume;
        info!("loading track {} at {:.1}s → {}", index, start_secs, url);
        mpv.load_at(&url, start_secs, paused, volume).await?;
        self.notify();
        Ok(())
    }

    // ── mpv events ────────────────────────────────────────────────────────────

    async fn handle_mpv_event(&mut self, ev: MpvEvent) {
        if let Some((id, data)) = ev.as_property_change() {
            match id {
                OBS_TIME_POS => {
                    if let Some(pos) = data.as_f64() {
                        self.on_time_pos(pos).await;
                    }
                }
                OBS_DURATION => {
                    if let Some(dur) = data.as_f64() {
                        self.on_duration(dur).await;
                    }
                }
                OBS_PAUSE => {
                    if let Some(paused) = data.as_bool() {
                        self.on_pause_flag(paused).await;
                    }
                }
                OBS_CORE_IDLE => {
                    if let Some(idle) = data.as_bool() {
                        self.on_core_idle(idle).await;
                    }
                }
                _ => {}
            }
            return;
        }

        match ev.event_name() {
            Some("end-file") => {
                let (reason, file_error) = ev.end_file_detail().unwrap_or(("unknown", None));
                self.on_end_file(reason, file_error).await;
            }
            Some("file-loaded") => {
                self.retry_attempt = 0;
                self.state.set_error(None).await;
            }
            _ => {}
        }
    }

    /// Position sample: update the timeline and run the liveness detector.
    /// The detector is advisory — it changes the badge, never the playback.
    async fn on_time_pos(&mut self, pos: f64) {
        self.last_time_pos = Some(pos);
        self.state.set_time_pos(Some(pos)).await;

        let state = self.state.get_state().await;
        if self.config.playback.virtual_live
            && state.playback_status == PlaybackStatus::Playing
            && !self.tracker.is_paused()
        {
            let live = self
                .clock
                .position_at(self.now_ms(), &self.catalog, &self.durations);
            let is_live = self.tracker.check(state.current_track, pos, &live);
            self.state.set_live(is_live).await;
        }
        self.notify();
    }

    /// Measured duration arrived — refine the table. The cycle length shifts
    /// accordingly; that drift is accepted (bounded by estimate accuracy).
    async fn on_duration(&mut self, dur: f64) {
        let current = self.state.get_state().await.current_track;
        self.durations.set(current, dur);
        self.state.set_timeline(self.last_time_pos, Some(dur)).await;
        debug!("duration for track {}: {:.1}s", current, dur);
        self.notify();
    }

    async fn on_pause_flag(&mut self, paused: bool) {
        let status = self.state.get_state().await.playback_status;
        if paused {
            if status == PlaybackStatus::Playing || status == PlaybackStatus::Connecting {
                if self.config.playback.virtual_live {
                    let current = self.state.get_state().await.current_track;
                    self.tracker.pause(
                        self.now_ms(),
                        current,
                        self.last_time_pos.unwrap_or(0.0),
                    );
                    self.state.set_live(false).await;
                }
                self.state.set_playback_status(PlaybackStatus::Paused).await;
                self.notify();
            }
        } else if status == PlaybackStatus::Paused {
            self.state.set_playback_status(PlaybackStatus::Playing).await;
            self.notify();
        }
    }

    async fn on_core_idle(&mut self, idle: bool) {
        let status = self.state.get_state().await.playback_status;
        if !idle {
            if status != PlaybackStatus::Playing {
                self.retry_attempt = 0;
                self.state.set_playback_status(PlaybackStatus::Playing).await;
                self.notify();
            }
        } else if status == PlaybackStatus::Playing {
            // buffering stall; pause is reported separately
            self.state
                .set_playback_status(PlaybackStatus::Connecting)
                .await;
            self.notify();
        }
    }

    /// A track finished (or failed). Natural end rolls to the next catalog
    /// track — that is what keeps the finite playlist an infinite broadcast.
    async fn on_end_file(&mut self, reason: &str, file_error: Option<&str>) {
        match reason {
            "eof" => self.on_track_ended().await,
            "error" => {
                let kind = classify_file_error(file_error);
                warn!("playback error: {:?} ({})", kind, file_error.unwrap_or("-"));
                self.handle_playback_error(kind).await;
            }
            // "stop"/"quit" arrive from our own Stop command
            _ => {}
        }
    }

    async fn on_track_ended(&mut self) {
        if self.catalog.is_empty() {
            return;
        }
        let state = self.state.get_state().await;

        if self.config.playback.virtual_live {
            let next = (state.current_track + 1) % self.catalog.len();
            self.start_track(next, 0.0, false).await;
            return;
        }

        match state.repeat {
            RepeatMode::One => self.start_track(state.current_track, 0.0, false).await,
            RepeatMode::All => self.cmd_next().await,
            RepeatMode::None => {
                let has_next = state.shuffle || state.current_track + 1 < self.catalog.len();
                if has_next {
                    self.cmd_next().await;
                } else {
                    self.state.set_stopped().await;
                    self.notify();
                }
            }
        }
    }

    // ── error retry ladder ────────────────────────────────────────────────────

    async fn handle_playback_error(&mut self, kind: PlaybackErrorKind) {
        self.state.set_error(Some(kind)).await;
        self.notify();
        let _ = self
            .broadcast_tx
            .send(BroadcastMessage::Error(kind.to_string()));

        if kind.is_retryable() && self.retry_attempt < self.config.playback.max_retries {
            self.retry_attempt += 1;
            let attempt = self.retry_attempt;
            let track_index = self.state.get_state().await.current_track;
            let delay =
                tokio::time::Duration::from_millis(RETRY_BASE_DELAY_MS * attempt as u64);
            info!(
                "retrying track {} in {:?} (attempt {}/{})",
                track_index, delay, attempt, self.config.playback.max_retries
            );
            let tx = self.event_tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tx
                    .send(DaemonEvent::RetryLoad {
                        track_index,
                        attempt,
                    })
                    .await;
            });
        } else {
            // unrecoverable or out of retries — wait for an explicit Play
            warn!("giving up on playback: {:?}", kind);
        }
    }

    #[cfg(test)]
    fn retry_attempt(&self) -> u32 {
        self.retry_attempt
    }

    async fn handle_retry(&mut self, track_index: usize, attempt: u32) {
        // stale timer: the user navigated away or a newer retry superseded it
        if attempt != self.retry_attempt {
            return;
        }
        if self.state.get_state().await.current_track != track_index {
            return;
        }

        if self.config.playback.virtual_live && self.tracker.is_live() {
            // rejoin the edge rather than replaying the failed offset
            let pos = self.tracker.go_live(
                self.now_ms(),
                &self.clock,
                &self.catalog,
                &self.durations,
            );
            self.start_track(pos.track_index, pos.offset_secs, false).await;
        } else {
            let offset = self.last_time_pos.unwrap_or(0.0);
            self.start_track(track_index, offset, false).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loopcast_core::protocol::PlaybackStatus;

    async fn core_with_empty_catalog(tag: &str) -> DaemonCore {
        let mut config = Config::default();
        config.daemon.state_file = std::env::temp_dir()
            .join(format!("loopcast-test-{}", tag))
            .join("state.json");
        // receivers dropped on purpose: sends are best-effort everywhere
        let (broadcast_tx, _) = broadcast::channel::<BroadcastMessage>(16);
        let (event_tx, _) = mpsc::channel::<DaemonEvent>(16);
        DaemonCore::new(config, TrackCatalog::builtin(0), broadcast_tx, event_tx)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_play_track_on_empty_catalog_is_a_no_op() {
        let mut core = core_with_empty_catalog("empty-playtrack").await;
        core.handle_command(Command::PlayTrack { index: 3 }).await;

        // nothing loaded, no error raised, no retry timer armed
        let state = core.state.get_state().await;
        assert_eq!(state.playback_status, PlaybackStatus::Idle);
        assert!(state.last_error.is_none());
        assert_eq!(core.retry_attempt(), 0);
    }

    #[tokio::test]
    async fn test_go_live_on_empty_catalog_is_a_no_op() {
        let mut core = core_with_empty_catalog("empty-golive").await;
        core.handle_command(Command::GoLive).await;

        let state = core.state.get_state().await;
        assert_eq!(state.playback_status, PlaybackStatus::Idle);
        assert!(state.last_error.is_none());
    }
}
