use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;

use crate::config;

#[derive(Parser, Debug)]
#[command(name = "whxp")]
#[command(version)]
#[command(about = "WHIP/WHEP client: publish to or play from a WebRTC media server", long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "whxp.toml", global = true)]
    pub config: PathBuf,

    /// Verbose logging
    #[arg(short, long, action, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Publish local media to a WHIP endpoint
    Publish {
        /// WHIP endpoint URL
        endpoint: String,

        #[command(flatten)]
        session: SessionArgs,

        /// Ogg/Opus file to send as audio
        #[arg(long)]
        audio_file: Option<PathBuf>,

        /// H.264 Annex-B file to send as video
        #[arg(long)]
        video_file: Option<PathBuf>,
    },

    /// Play one or more WHEP endpoints
    Subscribe {
        /// WHEP endpoint URLs, one session each
        #[arg(required = true)]
        endpoints: Vec<String>,

        #[command(flatten)]
        session: SessionArgs,
    },

    /// List the codec labels accepted by --audio-codec and --video-codec
    Codecs {
        /// Print as JSON
        #[arg(long, action)]
        json: bool,
    },
}

#[derive(ClapArgs, Debug, Clone, Default)]
pub struct SessionArgs {
    /// Bearer token sent with the offer
    #[arg(short, long, default_value = "")]
    pub token: String,

    /// Preferred audio codec, e.g. "audio/opus 48000 minptime=10;useinbandfec=1"
    #[arg(long)]
    pub audio_codec: Option<String>,

    /// Preferred video codec, e.g. "video/VP8"
    #[arg(long)]
    pub video_codec: Option<String>,
}

impl Args {
    pub fn load_config(&self) -> Result<config::ClientConfig, Box<dyn std::error::Error>> {
        config::ClientConfig::load(&self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_subscribe_fan_out() {
        let args = Args::parse_from([
            "whxp",
            "subscribe",
            "http://localhost:1985/rtc/v1/whep/?app=live&stream=a",
            "http://localhost:1985/rtc/v1/whep/?app=live&stream=b",
            "--video-codec",
            "video/VP8",
        ]);
        match args.command {
            Command::Subscribe { endpoints, session } => {
                assert_eq!(endpoints.len(), 2);
                assert_eq!(session.video_codec.as_deref(), Some("video/VP8"));
                assert_eq!(session.token, "");
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn parses_publish_with_global_flags() {
        let args = Args::parse_from(["whxp", "publish", "http://h/whip", "-t", "secret", "--verbose", "-c", "x.toml"]);
        assert!(args.verbose);
        assert_eq!(args.config, PathBuf::from("x.toml"));
        assert!(matches!(args.command, Command::Publish { ref session, .. } if session.token == "secret"));
    }

    #[test]
    fn subscribe_requires_endpoint() {
        assert!(Args::try_parse_from(["whxp", "subscribe"]).is_err());
    }
}
