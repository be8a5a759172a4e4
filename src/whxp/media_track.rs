//! webrtc-rs media tracks
//!
//! - [`SampleTrack`]: local track fed from a sample pump once the peer connects
//! - [`RemoteTrack`]: inbound track with packet counters
//! - [`FileCapture`]: capture source reading H.264 and Ogg/Opus files

use super::engine::{CaptureRequest, CaptureSource, CodecCapability, MediaKind, MediaTrack, TrackStats};
use super::peer_connection::{media_kind, rtc_capability};
use super::WhxpError;
use crate::config::PublishConfig;
use async_trait::async_trait;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use webrtc::media::io::h264_reader::H264Reader;
use webrtc::media::io::ogg_reader::OggReader;
use webrtc::media::Sample;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

const STREAM_ID: &str = "whxp-client";

/// Opus clock rate used to turn granule positions into durations
const OGG_SAMPLE_RATE: u64 = 48000;

#[derive(Default)]
struct Counters {
    packets: AtomicU64,
    bytes: AtomicU64,
}

impl Counters {
    fn record(&self, bytes: usize) {
        self.packets.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn snapshot(&self) -> TrackStats {
        TrackStats {
            packets: self.packets.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
        }
    }
}

/// Where a local track's samples come from
#[derive(Debug, Clone)]
pub enum SampleSource {
    /// Annex-B H.264 elementary stream, one NAL per tick
    H264File { path: PathBuf, frame_interval: Duration },
    /// Ogg/Opus file, one page per tick
    OggFile { path: PathBuf, page_interval: Duration },
}

impl SampleSource {
    fn kind(&self) -> MediaKind {
        match self {
            SampleSource::H264File { .. } => MediaKind::Video,
            SampleSource::OggFile { .. } => MediaKind::Audio,
        }
    }

    fn codec(&self) -> CodecCapability {
        match self {
            SampleSource::H264File { .. } => CodecCapability::new(
                webrtc::api::media_engine::MIME_TYPE_H264,
                90000,
                0,
                "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f",
            ),
            SampleSource::OggFile { .. } => CodecCapability::new(
                webrtc::api::media_engine::MIME_TYPE_OPUS,
                48000,
                2,
                "minptime=10;useinbandfec=1",
            ),
        }
    }

    fn path(&self) -> &Path {
        match self {
            SampleSource::H264File { path, .. } | SampleSource::OggFile { path, .. } => path,
        }
    }
}

/// Local track written sample by sample
pub struct SampleTrack {
    id: String,
    source: SampleSource,
    local: Arc<TrackLocalStaticSample>,
    counters: Arc<Counters>,
    pump: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl SampleTrack {
    pub fn new(source: SampleSource) -> Arc<Self> {
        let kind = source.kind();
        let id = format!("{}-{}", kind, uuid::Uuid::new_v4());
        let local = Arc::new(TrackLocalStaticSample::new(
            rtc_capability(&source.codec()),
            id.clone(),
            STREAM_ID.to_string(),
        ));
        Arc::new(Self {
            id,
            source,
            local,
            counters: Arc::new(Counters::default()),
            pump: Mutex::new(None),
            stopped: AtomicBool::new(false),
        })
    }

    pub(crate) fn local(&self) -> Arc<TrackLocalStaticSample> {
        self.local.clone()
    }

    /// Start pumping samples once `connected` turns true
    pub(crate) fn start(&self, connected: watch::Receiver<bool>) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let mut pump = self.pump.lock();
        if pump.is_some() {
            return;
        }
        let source = self.source.clone();
        let local = self.local.clone();
        let counters = self.counters.clone();
        let id = self.id.clone();
        *pump = Some(tokio::spawn(async move {
            if let Err(e) = run_pump(source, local, counters, connected).await {
                warn!("Track {} stopped: {}", id, e);
            }
        }));
    }
}

impl fmt::Debug for SampleTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SampleTrack")
            .field("id", &self.id)
            .field("source", &self.source)
            .finish()
    }
}

impl MediaTrack for SampleTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> Option<MediaKind> {
        Some(self.source.kind())
    }

    fn stats(&self) -> TrackStats {
        self.counters.snapshot()
    }

    fn stop(&self) -> Result<(), WhxpError> {
        self.stopped.store(true, Ordering::SeqCst);
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
            debug!("Track {} pump stopped", self.id);
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

async fn run_pump(
    source: SampleSource,
    local: Arc<TrackLocalStaticSample>,
    counters: Arc<Counters>,
    mut connected: watch::Receiver<bool>,
) -> Result<(), WhxpError> {
    let open = |path: &Path| {
        File::open(path)
            .map(BufReader::new)
            .map_err(|e| WhxpError::CaptureAcquisition(format!("Failed to open {}: {}", path.display(), e)))
    };

    if connected.wait_for(|c| *c).await.is_err() {
        return Ok(());
    }

    match source {
        SampleSource::H264File { path, frame_interval } => {
            let mut h264 = H264Reader::new(open(&path)?, 1_048_576);
            info!("Playing video from {}", path.display());

            let mut ticker = tokio::time::interval(frame_interval);
            loop {
                let nal = match h264.next_nal() {
                    Ok(nal) => nal,
                    Err(e) => {
                        info!("All video frames parsed and sent: {}", e);
                        break;
                    }
                };
                let data = nal.data.freeze();
                counters.record(data.len());
                local
                    .write_sample(&Sample {
                        data,
                        duration: Duration::from_secs(1),
                        ..Default::default()
                    })
                    .await
                    .map_err(|e| WhxpError::Engine(format!("Failed to write video sample: {}", e)))?;
                ticker.tick().await;
            }
        }
        SampleSource::OggFile { path, page_interval } => {
            let (mut ogg, _) = OggReader::new(open(&path)?, true)
                .map_err(|e| WhxpError::CaptureAcquisition(format!("Invalid Ogg file {}: {}", path.display(), e)))?;
            info!("Playing audio from {}", path.display());

            let mut ticker = tokio::time::interval(page_interval);
            let mut last_granule: u64 = 0;
            while let Ok((page_data, page_header)) = ogg.parse_next_page() {
                let sample_count = page_header.granule_position.saturating_sub(last_granule);
                last_granule = page_header.granule_position;
                let data = page_data.freeze();
                counters.record(data.len());
                local
                    .write_sample(&Sample {
                        data,
                        duration: Duration::from_millis(sample_count * 1000 / OGG_SAMPLE_RATE),
                        ..Default::default()
                    })
                    .await
                    .map_err(|e| WhxpError::Engine(format!("Failed to write audio sample: {}", e)))?;
                ticker.tick().await;
            }
            info!("All audio pages parsed and sent");
        }
    }
    Ok(())
}

/// Inbound track; counts RTP packets until the remote side stops sending
pub struct RemoteTrack {
    id: String,
    kind: Option<MediaKind>,
    counters: Arc<Counters>,
    reader: JoinHandle<()>,
}

impl RemoteTrack {
    pub(crate) fn spawn(track: Arc<TrackRemote>) -> Arc<Self> {
        let counters = Arc::new(Counters::default());
        let id = track.id();
        let kind = media_kind(track.kind());

        let reader_counters = counters.clone();
        let reader_id = id.clone();
        let reader = tokio::spawn(async move {
            while let Ok((packet, _)) = track.read_rtp().await {
                reader_counters.record(packet.payload.len());
            }
            debug!("Remote track {} ended", reader_id);
        });

        Arc::new(Self {
            id,
            kind,
            counters,
            reader,
        })
    }
}

impl fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

impl MediaTrack for RemoteTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> Option<MediaKind> {
        self.kind
    }

    fn stats(&self) -> TrackStats {
        self.counters.snapshot()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for RemoteTrack {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Capture source replaying media files at real-time pace
///
/// Only the `audio`/`video` switches of a [`CaptureRequest`] apply. Encoded
/// files are sent as recorded, so `width`/`height` are not enforced.
#[derive(Debug, Clone)]
pub struct FileCapture {
    config: PublishConfig,
}

impl FileCapture {
    pub fn new(config: PublishConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl CaptureSource for FileCapture {
    async fn acquire(&self, request: &CaptureRequest) -> Result<Vec<Arc<dyn MediaTrack>>, WhxpError> {
        let mut sources = Vec::new();
        if request.audio {
            if let Some(path) = &self.config.audio_file {
                sources.push(SampleSource::OggFile {
                    path: path.clone(),
                    page_interval: Duration::from_millis(self.config.ogg_page_ms),
                });
            }
        }
        if request.video {
            if let Some(path) = &self.config.video_file {
                sources.push(SampleSource::H264File {
                    path: path.clone(),
                    frame_interval: Duration::from_millis(self.config.h264_frame_ms),
                });
            }
        }

        if sources.is_empty() {
            return Err(WhxpError::CaptureAcquisition(
                "No capture source configured for the requested media".to_string(),
            ));
        }
        for source in &sources {
            if !source.path().exists() {
                return Err(WhxpError::CaptureAcquisition(format!(
                    "{} file '{}' does not exist",
                    source.kind(),
                    source.path().display()
                )));
            }
        }

        debug!(
            "Requested {}x{} capture, files are sent at their recorded size",
            request.width, request.height
        );
        info!("Capturing {} source(s)", sources.len());
        Ok(sources
            .into_iter()
            .map(|source| SampleTrack::new(source) as Arc<dyn MediaTrack>)
            .collect())
    }
}
