use std::{
    io::{ErrorKind, Read},
    process::{Child, Command, Stdio},
    thread,
};

use anyhow::anyhow;
use chrono::Utc;
use crossbeam_channel::{Receiver, Sender, bounded};
use tracing::{debug, warn};

use crate::types::{CaptureError, Frame, FrameFormat};

/// Frames buffered between the decoder thread and the capture loop.
const CAPTURE_QUEUE_SIZE: usize = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceKind {
    /// V4L device, either an index (`0`) or a `/dev/videoN` path.
    Device,
    Rtsp,
    /// Anything ffmpeg can open directly (files, http, ...).
    Other,
}

impl SourceKind {
    pub fn from_uri(uri: &str) -> Self {
        if parse_device_index(uri).is_some() || uri.starts_with("/dev/video") {
            SourceKind::Device
        } else if uri.starts_with("rtsp://") || uri.starts_with("rtsps://") {
            SourceKind::Rtsp
        } else {
            SourceKind::Other
        }
    }
}

pub fn parse_device_index(uri: &str) -> Option<u32> {
    if let Ok(index) = uri.parse::<u32>() {
        return Some(index);
    }
    uri.strip_prefix("/dev/video")
        .filter(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()))
        .and_then(|rest| rest.parse::<u32>().ok())
}

/// Build the ffmpeg argument list that decodes `uri` into raw BGR24 frames
/// scaled to `target_size` on stdout.
pub fn build_ffmpeg_args(uri: &str, target_size: (u32, u32)) -> Vec<String> {
    let mut args: Vec<String> = ["-hide_banner", "-loglevel", "error"]
        .into_iter()
        .map(String::from)
        .collect();

    match SourceKind::from_uri(uri) {
        SourceKind::Device => {
            let device = match parse_device_index(uri) {
                Some(index) => format!("/dev/video{index}"),
                None => uri.to_string(),
            };
            args.extend(["-f", "video4linux2", "-i"].map(String::from));
            args.push(device);
        }
        SourceKind::Rtsp => {
            args.extend(
                [
                    "-rtsp_transport",
                    "tcp",
                    "-fflags",
                    "nobuffer",
                    "-flags",
                    "low_delay",
                    "-i",
                ]
                .map(String::from),
            );
            args.push(uri.to_string());
        }
        SourceKind::Other => {
            args.push("-i".to_string());
            args.push(uri.to_string());
        }
    }

    args.extend(["-an", "-vf"].map(String::from));
    args.push(format!("scale={}:{}", target_size.0, target_size.1));
    args.extend(["-pix_fmt", "bgr24", "-f", "rawvideo", "-"].map(String::from));
    args
}

/// Spawn an ffmpeg process decoding `uri` and a thread forwarding its frames.
///
/// The returned receiver yields an error and then disconnects when the source
/// fails or ends. Dropping the receiver stops the decoder.
pub fn spawn_ffmpeg_reader(
    uri: &str,
    target_size: (u32, u32),
) -> Result<Receiver<Result<Frame, CaptureError>>, CaptureError> {
    let (tx, rx) = bounded(CAPTURE_QUEUE_SIZE);

    let mut cmd = Command::new("ffmpeg");
    cmd.args(build_ffmpeg_args(uri, target_size))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit());
    debug!("Starting capture: ffmpeg {:?}", cmd.get_args().collect::<Vec<_>>());

    let mut child = cmd.spawn().map_err(|err| {
        warn!("Failed to spawn ffmpeg for {uri}: {err}");
        CaptureError::Open {
            uri: uri.to_string(),
        }
    })?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| CaptureError::Other(anyhow!("failed to capture ffmpeg stdout")))?;

    let uri = uri.to_string();
    thread::Builder::new()
        .name("video-ingest".into())
        .spawn(move || {
            if let Err(err) = ffmpeg_loop(stdout, child, &uri, target_size, &tx) {
                let _ = tx.send(Err(err));
            }
        })
        .map_err(|err| CaptureError::Other(err.into()))?;

    Ok(rx)
}

fn ffmpeg_loop(
    mut stdout: impl Read,
    mut child: Child,
    uri: &str,
    target_size: (u32, u32),
    tx: &Sender<Result<Frame, CaptureError>>,
) -> Result<(), CaptureError> {
    let frame_bytes =
        (target_size.0 as usize) * (target_size.1 as usize) * FrameFormat::Bgr8.bytes_per_pixel();
    let mut buffer = vec![0u8; frame_bytes];

    let result = loop {
        match stdout.read_exact(&mut buffer) {
            Ok(()) => {
                let frame = Frame {
                    data: buffer.clone(),
                    width: target_size.0,
                    height: target_size.1,
                    timestamp_ms: Utc::now().timestamp_millis(),
                    format: FrameFormat::Bgr8,
                };
                if tx.send(Ok(frame)).is_err() {
                    break Ok(());
                }
            }
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => {
                break Err(CaptureError::Ended {
                    uri: uri.to_string(),
                });
            }
            Err(err) => break Err(CaptureError::Other(err.into())),
        }
    };

    let _ = child.kill();
    let _ = child.wait();
    result
}
