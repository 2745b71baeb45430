//! The fixed track catalog the virtual broadcast loops over.
//!
//! Built once at startup — from a JSON metadata array when configured, or the
//! stock `day-N.webm` list otherwise — and read-only afterwards. Everything
//! else (the clock, the live tracker, the daemon) borrows it.

use serde::{Deserialize, Serialize};

/// Nominal track length used until the real duration is measured.
pub const DEFAULT_TRACK_SECS: f64 = 3600.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Track {
    pub index: usize,
    pub filename: String,
    pub title: String,
    #[serde(default)]
    pub artist: String,
    pub estimated_duration_secs: f64,
}

/// Intermediate struct matching the `/api/tracks` metadata schema.
/// Kept separate from `Track` so the JSON shape can diverge from the
/// in-memory catalog without breaking either.
#[derive(Debug, Deserialize)]
struct TrackMeta {
    #[allow(dead_code)]
    #[serde(default)]
    id: u64,
    filename: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    artist: String,
}

#[derive(Debug, Clone)]
pub struct TrackCatalog {
    tracks: Vec<Track>,
}

impl TrackCatalog {
    /// Parse a metadata array of `{id, filename, title, artist}`.
    /// The input is trusted; entries with an empty filename are skipped.
    pub fn from_json_str(content: &str) -> anyhow::Result<Self> {
        let metas: Vec<TrackMeta> = serde_json::from_str(content)?;
        let tracks = metas
            .into_iter()
            .filter(|m| !m.filename.trim().is_empty())
            .enumerate()
            .map(|(index, m)| Track {
                index,
                title: if m.title.is_empty() {
                    m.filename.clone()
                } else {
                    m.title
                },
                filename: m.filename,
                artist: m.artist,
                estimated_duration_secs: DEFAULT_TRACK_SECS,
            })
            .collect();
        Ok(Self { tracks })
    }

    pub fn from_json_file(path: &std::path::Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    /// The stock catalog shipped by the original station: `day-1.webm` ..
    /// `day-N.webm`, one nominal hour each.
    pub fn builtin(count: usize) -> Self {
        let tracks = (0..count)
            .map(|index| Track {
                index,
                filename: format!("day-{}.webm", index + 1),
                title: format!("Day {} - Gurbani Kirtan", index + 1),
                artist: "Divine Shabad".to_string(),
                estimated_duration_secs: DEFAULT_TRACK_SECS,
            })
            .collect();
        Self { tracks }
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    /// Wrapping lookup — any signed index maps onto a valid track.
    pub fn get(&self, index: isize) -> Option<&Track> {
        if self.tracks.is_empty() {
            return None;
        }
        let n = self.tracks.len() as isize;
        let safe = ((index % n) + n) % n;
        self.tracks.get(safe as usize)
    }

    pub fn estimated_duration(&self, index: usize) -> Option<f64> {
        self.tracks.get(index).map(|t| t.estimated_duration_secs)
    }

    /// Resolve a track to its URL under the audio gateway.
    pub fn audio_url(&self, base: &str, index: usize) -> Option<String> {
        let track = self.get(index as isize)?;
        Some(format!("{}/{}", base.trim_end_matches('/'), track.filename))
    }

    /// Uniformly random index, avoiding `exclude` when more than one track
    /// exists. Used for shuffle navigation.
    pub fn random_index(&self, exclude: Option<usize>) -> Option<usize> {
        use rand::Rng;

        if self.tracks.is_empty() {
            return None;
        }
        if self.tracks.len() == 1 {
            return Some(0);
        }
        let mut rng = rand::thread_rng();
        loop {
            let idx = rng.gen_range(0..self.tracks.len());
            if Some(idx) != exclude {
                return Some(idx);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_json_skips_empty_filenames() {
        let json = r#"[
            {"id": 1, "filename": "day-1.webm", "title": "Day 1", "artist": "A"},
            {"id": 2, "filename": "  ", "title": "broken"},
            {"id": 3, "filename": "day-3.webm"}
        ]"#;
        let catalog = TrackCatalog::from_json_str(json).unwrap();
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.tracks()[0].filename, "day-1.webm");
        // untitled entries fall back to the filename
        assert_eq!(catalog.tracks()[1].title, "day-3.webm");
        assert_eq!(catalog.tracks()[1].index, 1);
    }

    #[test]
    fn test_builtin_catalog_shape() {
        let catalog = TrackCatalog::builtin(40);
        assert_eq!(catalog.len(), 40);
        assert_eq!(catalog.tracks()[0].filename, "day-1.webm");
        assert_eq!(catalog.tracks()[39].filename, "day-40.webm");
        assert_eq!(catalog.tracks()[39].estimated_duration_secs, 3600.0);
    }

    #[test]
    fn test_get_wraps_in_both_directions() {
        let catalog = TrackCatalog::builtin(5);
        assert_eq!(catalog.get(7).unwrap().index, 2);
        assert_eq!(catalog.get(-1).unwrap().index, 4);
        assert_eq!(catalog.get(-6).unwrap().index, 4);
    }

    #[test]
    fn test_audio_url_joins_base() {
        let catalog = TrackCatalog::builtin(2);
        assert_eq!(
            catalog.audio_url("/audio", 1).unwrap(),
            "/audio/day-2.webm"
        );
        assert_eq!(
            catalog.audio_url("http://127.0.0.1:8991/audio/", 0).unwrap(),
            "http://127.0.0.1:8991/audio/day-1.webm"
        );
    }

    #[test]
    fn test_random_index_avoids_current() {
        let catalog = TrackCatalog::builtin(2);
        for _ in 0..20 {
            assert_eq!(catalog.random_index(Some(0)), Some(1));
        }
        let single = TrackCatalog::builtin(1);
        assert_eq!(single.random_index(Some(0)), Some(0));
    }
}
