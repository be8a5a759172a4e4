//! whxp - Main entry point
//!
//! Publishes local media files to a WHIP endpoint or plays one or more WHEP
//! endpoints headlessly.

mod args;

use args::{Args, Command, SessionArgs};
use clap::Parser;
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use whxp_client::config::{self, ClientConfig};
use whxp_client::whxp::peer_connection::codec_capabilities;
use whxp_client::whxp::{
    codec, ConnectionState, FileCapture, HttpSignaling, LoggingMeter, LoggingSink, MediaKind, PresentationSinks,
    SessionClient, SessionHandle, SessionOptions, WhxpError,
};

/// Interval of the headless level meter log line
const METER_INTERVAL: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command line arguments
    let args = Args::parse();
    let loaded = args.load_config();

    // Initialize logging with noise filtering for third-party WebRTC crates
    let log_level = match (&loaded, args.verbose) {
        (_, true) => "debug".to_string(),
        (Ok(cfg), false) => cfg.logging.level.clone(),
        (Err(_), false) => "info".to_string(),
    };
    env_logger::Builder::new()
        .parse_filters(&std::env::var("WHXP_LOG").unwrap_or(log_level))
        .filter_module("webrtc_ice", log::LevelFilter::Error)
        .filter_module("webrtc_dtls", log::LevelFilter::Error)
        .filter_module("webrtc_mdns", log::LevelFilter::Error)
        .init();

    info!("whxp v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let mut config = match loaded {
        Ok(cfg) => {
            info!("Loaded configuration from {:?}", args.config);
            cfg
        }
        Err(e) => {
            warn!("Failed to load config: {}, using defaults", e);
            ClientConfig::default()
        }
    };

    match args.command {
        Command::Codecs { json } => list_codecs(json),
        Command::Publish {
            endpoint,
            session,
            audio_file,
            video_file,
        } => {
            apply_session_overrides(&mut config, &session);
            if audio_file.is_some() {
                config.publish.audio_file = audio_file;
            }
            if video_file.is_some() {
                config.publish.video_file = video_file;
            }
            validate(&config)?;
            let handle = start_publish(&config, &endpoint, &session.token).await?;
            supervise(vec![Arc::new(handle)]).await
        }
        Command::Subscribe { endpoints, session } => {
            apply_session_overrides(&mut config, &session);
            validate(&config)?;
            let mut handles = Vec::with_capacity(endpoints.len());
            for (index, endpoint) in endpoints.iter().enumerate() {
                match start_subscribe(&config, endpoint, &session.token, index).await {
                    Ok(handle) => handles.push(Arc::new(handle)),
                    Err(e) => error!("Failed to start session for {}: {}", endpoint, e),
                }
            }
            if handles.is_empty() {
                return Err("No session could be started".into());
            }
            supervise(handles).await
        }
    }
}

fn apply_session_overrides(config: &mut ClientConfig, session: &SessionArgs) {
    if let Some(ref audio) = session.audio_codec {
        config.codecs.audio = Some(audio.clone());
    }
    if let Some(ref video) = session.video_codec {
        config.codecs.video = Some(video.clone());
    }
}

fn validate(config: &ClientConfig) -> Result<(), Box<dyn std::error::Error>> {
    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        return Err(e);
    }
    Ok(())
}

fn session_options(config: &ClientConfig, endpoint: &str, token: &str) -> Result<SessionOptions, Box<dyn std::error::Error>> {
    let mut options = SessionOptions::new(endpoint, token);
    options.codecs = config.codecs.preferences()?;
    options.backoff = config.signaling.backoff();
    options.capture.width = config.publish.video_width;
    options.capture.height = config.publish.video_height;
    Ok(options)
}

fn engine(config: &ClientConfig) -> whxp_client::whxp::RtcEngine {
    whxp_client::whxp::RtcEngine::new(config.ice.servers.clone())
}

async fn start_publish(config: &ClientConfig, endpoint: &str, token: &str) -> Result<SessionHandle, Box<dyn std::error::Error>> {
    let signaling = Arc::new(HttpSignaling::new(config.signaling.request_timeout())?);
    let capture = Arc::new(FileCapture::new(config.publish.clone()));
    let sinks = PresentationSinks::new(
        Box::new(LoggingSink::new("preview")),
        Box::new(LoggingMeter::new("microphone", METER_INTERVAL)),
    );
    let options = session_options(config, endpoint, token)?;
    let handle = SessionClient::publish(&engine(config), signaling, capture, sinks, options).await?;
    info!("Publishing to {} (session {})", endpoint, handle.id());
    Ok(handle)
}

async fn start_subscribe(
    config: &ClientConfig,
    endpoint: &str,
    token: &str,
    index: usize,
) -> Result<SessionHandle, Box<dyn std::error::Error>> {
    let signaling = Arc::new(HttpSignaling::new(config.signaling.request_timeout())?);
    let sinks = PresentationSinks::new(
        Box::new(LoggingSink::new(format!("player-{}", index))),
        Box::new(LoggingMeter::new(format!("meter-{}", index), METER_INTERVAL)),
    );
    let options = session_options(config, endpoint, token)?;
    let handle = SessionClient::subscribe(&engine(config), signaling, sinks, options).await?;
    info!("Playing {} (session {})", endpoint, handle.id());
    Ok(handle)
}

/// Run until Ctrl-C or until every session has closed
async fn supervise(handles: Vec<Arc<SessionHandle>>) -> Result<(), Box<dyn std::error::Error>> {
    let monitors: Vec<_> = handles
        .iter()
        .cloned()
        .map(|handle| tokio::spawn(stop_on_failure(handle)))
        .collect();

    let all_closed = futures::future::join_all(handles.iter().map(|h| h.closed()));
    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
        _ = all_closed => {
            info!("All sessions closed");
        }
    }

    for handle in &handles {
        disconnect(handle).await;
    }
    for monitor in monitors {
        monitor.abort();
    }

    // A rejected endpoint is a usage error; report it through the exit status.
    for handle in &handles {
        if let Some(WhxpError::Configuration(msg)) = handle.status().failure {
            return Err(WhxpError::Configuration(msg).into());
        }
    }
    Ok(())
}

/// A failed connection does not recover on its own
async fn stop_on_failure(handle: Arc<SessionHandle>) {
    let mut status = handle.subscribe();
    let failed = match status
        .wait_for(|s| s.closed || s.connection_state == ConnectionState::Failed)
        .await
    {
        Ok(s) => !s.closed,
        Err(_) => false,
    };
    if failed {
        warn!("Session {} connection failed, stopping", handle.id());
        disconnect(&handle).await;
    }
}

async fn disconnect(handle: &SessionHandle) {
    match handle.disconnect_stream().await {
        Ok(report) if report.is_clean() => info!("{} session {} stopped", handle.mode().as_str(), handle.id()),
        Ok(report) => warn!(
            "{} session {} stopped with {} teardown error(s)",
            handle.mode().as_str(),
            handle.id(),
            report.errors.len()
        ),
        Err(WhxpError::SessionClosed) => debug!("Session {} already closed", handle.id()),
        Err(e) => error!("Session {} stop failed: {}", handle.id(), e),
    }
}

fn list_codecs(json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let audio = codec::selectable_labels(MediaKind::Audio, &codec_capabilities(MediaKind::Audio));
    let video = codec::selectable_labels(MediaKind::Video, &codec_capabilities(MediaKind::Video));
    if json {
        let listing = serde_json::json!({ "audio": audio, "video": video });
        println!("{}", serde_json::to_string_pretty(&listing)?);
    } else {
        for label in audio.iter().chain(video.iter()) {
            println!("{}", label);
        }
    }
    Ok(())
}
