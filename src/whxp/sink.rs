//! Headless presentation sinks
//!
//! The binary has no renderer, so the "video element" logs what it is
//! showing and the level meter periodically logs inbound audio statistics.

use super::engine::{MediaKind, TrackStats};
use super::media::{LevelMeter, MediaCollection, VideoSink, Visualizer};
use super::WhxpError;
use log::{debug, info};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Video sink that logs attach/detach
#[derive(Debug)]
pub struct LoggingSink {
    label: String,
    attached: Option<MediaCollection>,
}

impl LoggingSink {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            attached: None,
        }
    }

    pub fn attached(&self) -> Option<&MediaCollection> {
        self.attached.as_ref()
    }
}

impl VideoSink for LoggingSink {
    fn attach(&mut self, collection: MediaCollection) -> Result<(), WhxpError> {
        let video = collection.of_kind(MediaKind::Video).count();
        let audio = collection.of_kind(MediaKind::Audio).count();
        info!(
            "[{}] playing {} video / {} audio track(s): {:?}",
            self.label, video, audio, collection
        );
        self.attached = Some(collection);
        Ok(())
    }

    fn detach(&mut self) -> Result<(), WhxpError> {
        if let Some(collection) = self.attached.take() {
            info!("[{}] stopped playing {:?}", self.label, collection);
        }
        Ok(())
    }
}

/// Level meter that logs audio packet counters on an interval
#[derive(Debug, Clone)]
pub struct LoggingMeter {
    label: String,
    interval: Duration,
}

impl LoggingMeter {
    pub fn new(label: impl Into<String>, interval: Duration) -> Self {
        Self {
            label: label.into(),
            interval,
        }
    }
}

impl LevelMeter for LoggingMeter {
    fn visualizer(&mut self, collection: MediaCollection) -> Box<dyn Visualizer> {
        Box::new(LoggingVisualizer {
            label: self.label.clone(),
            interval: self.interval,
            collection,
            task: None,
        })
    }
}

struct LoggingVisualizer {
    label: String,
    interval: Duration,
    collection: MediaCollection,
    task: Option<JoinHandle<()>>,
}

fn audio_totals(collection: &MediaCollection) -> TrackStats {
    collection
        .of_kind(MediaKind::Audio)
        .map(|t| t.stats())
        .fold(TrackStats::default(), |acc, s| TrackStats {
            packets: acc.packets + s.packets,
            bytes: acc.bytes + s.bytes,
        })
}

impl Visualizer for LoggingVisualizer {
    fn start(&mut self) -> Result<(), WhxpError> {
        if self.task.is_some() {
            return Ok(());
        }
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| WhxpError::Sink(format!("Level meter needs a runtime: {}", e)))?;

        let label = self.label.clone();
        let collection = self.collection.clone();
        let interval = self.interval;
        self.task = Some(handle.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            let mut last = TrackStats::default();
            loop {
                ticker.tick().await;
                let now = audio_totals(&collection);
                info!(
                    "[{}] audio level: {} packets (+{}), {} bytes (+{})",
                    label,
                    now.packets,
                    now.packets.saturating_sub(last.packets),
                    now.bytes,
                    now.bytes.saturating_sub(last.bytes)
                );
                last = now;
            }
        }));
        debug!("[{}] level meter started on {:?}", self.label, self.collection);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), WhxpError> {
        if let Some(task) = self.task.take() {
            task.abort();
            debug!("[{}] level meter stopped", self.label);
        }
        Ok(())
    }
}

impl Drop for LoggingVisualizer {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
