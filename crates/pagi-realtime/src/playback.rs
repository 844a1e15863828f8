//! Audio playback channel with sample-accurate interruption.
//!
//! Buffers are queued per track (one track per conversation item). The device
//! render callback pulls samples through a [`PlaybackSource`]; buffer arrival,
//! sample emission and [`AudioPlaybackChannel::interrupt`] all take the same
//! lock, so the reported offset is exactly the number of samples handed to the
//! device for that track before the cut.
//!
//! Track policy:
//! - tracks play in order of their first buffer; buffers for a queued track are
//!   appended to it (gapless within an item)
//! - only [`AudioPlaybackChannel::finish_track`] or an interrupt retires a track;
//!   a drained, unfinished track stays current (starved), keeps its offset and
//!   holds later tracks back until its remaining buffers arrive
//! - buffers for a retired or interrupted track are dropped

use crate::audio::{spectrum, AudioFormat};
use crate::error::RealtimeResult;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

/// Where playback was cut: which item, and how many of its samples were emitted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackOffset {
    pub track_id: String,
    pub sample_offset: u64,
}

/// Playback sub-state reported to the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Idle,
    Playing,
    Interrupted,
}

#[derive(Debug)]
struct Track {
    id: String,
    pending: VecDeque<i16>,
    emitted: u64,
    finished: bool,
}

#[derive(Debug, Default)]
struct PlaybackQueue {
    tracks: VecDeque<Track>,
    retired: HashSet<String>,
    interrupted: bool,
    recent: Vec<i16>,
}

impl PlaybackQueue {
    fn retire_front(&mut self) {
        if let Some(done) = self.tracks.pop_front() {
            debug!(track = %done.id, emitted = done.emitted, "Track retired");
            self.retired.insert(done.id);
        }
    }
}

/// Handle the output device pulls samples from. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct PlaybackSource {
    queue: Arc<Mutex<PlaybackQueue>>,
}

impl PlaybackSource {
    fn lock(&self) -> MutexGuard<'_, PlaybackQueue> {
        // Poisoning is recoverable: every mutation leaves the queue consistent.
        self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fill `out` with the next samples, padding with silence.
    /// Returns how many real samples were written.
    pub fn fill(&self, out: &mut [i16]) -> usize {
        let mut q = self.lock();
        let mut written = 0;

        while written < out.len() {
            let Some(front) = q.tracks.front_mut() else {
                break;
            };
            if front.pending.is_empty() {
                if front.finished {
                    q.retire_front();
                    continue;
                }
                break;
            }
            let n = (out.len() - written).min(front.pending.len());
            for (slot, sample) in out[written..written + n]
                .iter_mut()
                .zip(front.pending.drain(..n))
            {
                *slot = sample;
            }
            front.emitted += n as u64;
            written += n;
        }

        // Retire a finished track as soon as it drains so the state reads idle.
        if let Some(front) = q.tracks.front() {
            if front.pending.is_empty() && front.finished {
                q.retire_front();
            }
        }

        out[written..].fill(0);
        if written > 0 {
            q.recent.clear();
            q.recent.extend_from_slice(&out[..written]);
        }
        written
    }
}

/// Output device boundary. Implementations: `CpalPlayback`, `MockPlayback`.
pub trait PlaybackDevice {
    /// Acquire the device and start pulling from `source`.
    /// Fails with `DeviceUnavailable` when none is present.
    fn open(&mut self, format: &AudioFormat, source: PlaybackSource) -> RealtimeResult<()>;

    /// Stop pulling and release the device.
    fn close(&mut self);
}

/// Playback side of the session
pub struct AudioPlaybackChannel {
    device: Box<dyn PlaybackDevice>,
    format: AudioFormat,
    source: PlaybackSource,
    open: bool,
}

impl AudioPlaybackChannel {
    pub fn new(device: Box<dyn PlaybackDevice>, format: AudioFormat) -> Self {
        Self {
            device,
            format,
            source: PlaybackSource::default(),
            open: false,
        }
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Open the output device. No-op if already open.
    pub fn open(&mut self) -> RealtimeResult<()> {
        if self.open {
            return Ok(());
        }
        self.device.open(&self.format, self.source.clone())?;
        self.open = true;
        info!(sample_rate = self.format.sample_rate, "🔊 Playback device open");
        Ok(())
    }

    /// Queue PCM16 samples for `item_id`.
    pub fn add_pcm16(&self, item_id: &str, samples: &[i16]) {
        if samples.is_empty() {
            return;
        }
        let mut q = self.source.lock();
        if q.retired.contains(item_id) {
            debug!(track = item_id, samples = samples.len(), "Dropping audio for retired track");
            return;
        }
        q.interrupted = false;

        if let Some(track) = q.tracks.iter_mut().find(|t| t.id == item_id) {
            track.pending.extend(samples.iter().copied());
            return;
        }
        q.tracks.push_back(Track {
            id: item_id.to_string(),
            pending: samples.iter().copied().collect(),
            emitted: 0,
            finished: false,
        });
    }

    /// Mark that no more buffers will arrive for `item_id`. Tracks queued
    /// behind it play once its remaining samples drain.
    pub fn finish_track(&self, item_id: &str) {
        let mut q = self.source.lock();
        if let Some(track) = q.tracks.iter_mut().find(|t| t.id == item_id) {
            track.finished = true;
        }
        while q
            .tracks
            .front()
            .map(|t| t.finished && t.pending.is_empty())
            .unwrap_or(false)
        {
            q.retire_front();
        }
    }

    /// Stop playback immediately. Returns the cut position of the current
    /// track, or `None` if nothing was playing.
    pub fn interrupt(&self) -> Option<TrackOffset> {
        let mut q = self.source.lock();
        let offset = q.tracks.front().map(|t| TrackOffset {
            track_id: t.id.clone(),
            sample_offset: t.emitted,
        });
        if offset.is_some() {
            let ids: Vec<String> = q.tracks.drain(..).map(|t| t.id).collect();
            q.retired.extend(ids);
            q.interrupted = true;
            info!(?offset, "⏹️ Playback interrupted");
        }
        offset
    }

    pub fn state(&self) -> PlaybackState {
        let q = self.source.lock();
        if !q.tracks.is_empty() {
            PlaybackState::Playing
        } else if q.interrupted {
            PlaybackState::Interrupted
        } else {
            PlaybackState::Idle
        }
    }

    /// Flush everything queued and release the device.
    pub fn stop(&mut self) {
        {
            let mut q = self.source.lock();
            *q = PlaybackQueue::default();
        }
        if self.open {
            self.device.close();
            self.open = false;
            info!("🔊 Playback device closed");
        }
    }

    /// Spectrum of the most recently rendered samples, for visualization only.
    pub fn frequencies(&self, bins: usize) -> Vec<f32> {
        // Copy out so the render callback is not held up by the transform.
        let recent = self.source.lock().recent.clone();
        spectrum(&recent, bins)
    }

    /// The source the device renders from.
    pub fn source(&self) -> PlaybackSource {
        self.source.clone()
    }
}
