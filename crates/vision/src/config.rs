//! Configuration for the `detect` and `listen` commands.
//!
//! CLI arguments are parsed by clap and validated into plain config structs
//! that the pipeline consumes without re-reading flags.

use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
};

use anyhow::{Result, anyhow, bail};
use clap::Args;
use ml_core::ClassifierConfig;

pub const DEFAULT_EMULATOR_PORT: u16 = 5555;
pub const DEFAULT_SOUND_PATH: &str = "sounds/low warning user.mp3";

#[derive(Clone, Debug)]
pub struct DetectConfig {
    /// Camera URI or device index.
    pub source: String,
    pub width: u32,
    pub height: u32,
    pub classifier: ClassifierConfig,
    /// `None` when sound alerts are disabled.
    pub sound: Option<SoundOptions>,
    /// `None` when telemetry is disabled.
    pub emulator_addr: Option<SocketAddr>,
    pub metrics_addr: Option<SocketAddr>,
}

#[derive(Clone, Debug)]
pub struct SoundOptions {
    pub path: PathBuf,
    pub volume: u8,
}

/// CLI arguments accepted by the `detect` subcommand.
#[derive(Debug, Args)]
pub struct DetectCliArgs {
    /// Camera URI, device index or video file.
    #[arg(long, default_value = "0")]
    pub source: String,
    /// Capture width in pixels.
    #[arg(long, default_value_t = 640)]
    pub width: u32,
    /// Capture height in pixels.
    #[arg(long, default_value_t = 480)]
    pub height: u32,
    /// TorchScript detection model.
    #[arg(long, value_name = "PATH")]
    pub model: Option<PathBuf>,
    /// Label file, one class name per line (defaults to COCO).
    #[arg(long, value_name = "PATH")]
    pub labels: Option<PathBuf>,
    /// Model input width (defaults to the capture width).
    #[arg(long = "detector-width", value_name = "PX")]
    pub detector_width: Option<u32>,
    /// Model input height (defaults to the capture height).
    #[arg(long = "detector-height", value_name = "PX")]
    pub detector_height: Option<u32>,
    /// Minimum detection confidence.
    #[arg(long, default_value_t = 0.5)]
    pub threshold: f32,
    /// Alert sound played while objects are detected.
    #[arg(long, default_value = DEFAULT_SOUND_PATH)]
    pub sound: PathBuf,
    /// Alert volume (0-100).
    #[arg(long, default_value_t = 50)]
    pub volume: u8,
    /// Disable sound alerts.
    #[arg(long = "no-sound", action = clap::ArgAction::SetTrue)]
    pub no_sound: bool,
    /// Disable telemetry to the emulator.
    #[arg(long = "no-emulator", action = clap::ArgAction::SetTrue)]
    pub no_emulator: bool,
    /// Emulator host.
    #[arg(long = "emulator-host", default_value = "127.0.0.1")]
    pub emulator_host: IpAddr,
    /// Emulator UDP port.
    #[arg(long = "emulator-port", default_value_t = DEFAULT_EMULATOR_PORT)]
    pub emulator_port: u16,
    /// Serve Prometheus metrics on this address.
    #[arg(long = "metrics-addr", value_name = "ADDR")]
    pub metrics_addr: Option<SocketAddr>,
}

impl TryFrom<DetectCliArgs> for DetectConfig {
    type Error = anyhow::Error;

    fn try_from(args: DetectCliArgs) -> Result<Self> {
        if args.width == 0 || args.height == 0 {
            bail!("Capture width and height must be positive integers");
        }
        let model_path = args
            .model
            .ok_or_else(|| anyhow!("Missing model path. Provide --model <path>."))?;
        if !(0.0..=1.0).contains(&args.threshold) {
            bail!("--threshold must be between 0 and 1");
        }
        if args.volume > 100 {
            bail!("--volume must be between 0 and 100");
        }

        let input_size = match (args.detector_width, args.detector_height) {
            (Some(0), _) | (_, Some(0)) => bail!("Detector dimensions must be positive integers"),
            (w, h) => (w.unwrap_or(args.width), h.unwrap_or(args.height)),
        };

        let sound = (!args.no_sound).then(|| SoundOptions {
            path: args.sound,
            volume: args.volume,
        });
        let emulator_addr =
            (!args.no_emulator).then(|| SocketAddr::new(args.emulator_host, args.emulator_port));

        Ok(Self {
            source: args.source,
            width: args.width,
            height: args.height,
            classifier: ClassifierConfig {
                model_path,
                labels_path: args.labels,
                confidence_threshold: args.threshold,
                input_size,
            },
            sound,
            emulator_addr,
            metrics_addr: args.metrics_addr,
        })
    }
}

/// CLI arguments accepted by the `listen` subcommand.
#[derive(Debug, Args)]
pub struct ListenCliArgs {
    /// Address to bind.
    #[arg(long, default_value = "0.0.0.0")]
    pub bind: IpAddr,
    /// UDP port to listen on.
    #[arg(long, default_value_t = DEFAULT_EMULATOR_PORT)]
    pub port: u16,
}

impl ListenCliArgs {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        args: DetectCliArgs,
    }

    fn parse(argv: &[&str]) -> Result<DetectConfig> {
        let harness = Harness::try_parse_from(std::iter::once("detect").chain(argv.iter().copied()))?;
        DetectConfig::try_from(harness.args)
    }

    #[test]
    fn defaults_enable_sound_and_emulator() {
        let config = parse(&["--model", "ssd.pt"]).unwrap();
        assert_eq!(config.source, "0");
        assert_eq!((config.width, config.height), (640, 480));
        assert_eq!(config.classifier.input_size, (640, 480));
        assert_eq!(config.emulator_addr, Some("127.0.0.1:5555".parse().unwrap()));
        let sound = config.sound.expect("sound enabled");
        assert_eq!(sound.path, PathBuf::from(DEFAULT_SOUND_PATH));
        assert_eq!(sound.volume, 50);
    }

    #[test]
    fn flags_disable_outputs() {
        let config = parse(&["--model", "m.pt", "--no-sound", "--no-emulator"]).unwrap();
        assert!(config.sound.is_none());
        assert!(config.emulator_addr.is_none());
    }

    #[test]
    fn model_is_required_and_threshold_validated() {
        assert!(parse(&[]).is_err());
        assert!(parse(&["--model", "m.pt", "--threshold", "1.5"]).is_err());
        assert!(parse(&["--model", "m.pt", "--detector-width", "0"]).is_err());
    }
}
