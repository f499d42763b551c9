//! Best-effort UDP telemetry: one JSON datagram per cycle, no acknowledgement.

use std::{
    io,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket},
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use serde_json::ser::{Formatter, Serializer};
use tracing::{debug, info, warn};

use crate::detection::DangerState;

/// Receive timeout for the listener, bounding shutdown latency.
pub const LISTEN_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// LEDs in the emulated warning bar.
pub const LED_COUNT: usize = 10;

/// Wire message. Receivers ignore unknown fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryMessage {
    pub danger_level: i32,
}

impl From<DangerState> for TelemetryMessage {
    fn from(state: DangerState) -> Self {
        Self {
            danger_level: state.danger_level(),
        }
    }
}

impl TelemetryMessage {
    /// Encode as UTF-8 JSON with `", "` / `": "` separators.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(24);
        let mut ser = Serializer::with_formatter(&mut buf, SpacedFormatter);
        // Serializing a plain integer struct into a Vec cannot fail.
        if self.serialize(&mut ser).is_err() {
            buf.clear();
        }
        buf
    }

    pub fn decode(datagram: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(datagram)
    }

    /// Number of lit LEDs on a bar of [`LED_COUNT`] for this level.
    pub fn lit_leds(&self) -> usize {
        let level = self.danger_level.clamp(0, 100) as usize;
        level * LED_COUNT / 100
    }
}

struct SpacedFormatter;

impl Formatter for SpacedFormatter {
    fn begin_object_key<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_value<W>(&mut self, writer: &mut W) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        writer.write_all(b": ")
    }

    fn begin_array_value<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }
}

pub struct TelemetryPublisher {
    socket: UdpSocket,
    target: SocketAddr,
    failing: bool,
}

impl TelemetryPublisher {
    pub fn new(target: SocketAddr) -> io::Result<Self> {
        let local: SocketAddr = if target.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local)?;
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket,
            target,
            failing: false,
        })
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    /// Send the message for `state`. Failures are logged and swallowed.
    pub fn publish(&mut self, state: DangerState) -> bool {
        let payload = TelemetryMessage::from(state).encode();
        match self.socket.send_to(&payload, self.target) {
            Ok(_) => {
                if self.failing {
                    info!("Telemetry to {} recovered", self.target);
                    self.failing = false;
                }
                true
            }
            Err(err) => {
                metrics::counter!("guard_telemetry_send_failures_total").increment(1);
                if self.failing {
                    debug!("Error sending telemetry to {}: {err}", self.target);
                } else {
                    warn!("Error sending telemetry to {}: {err}", self.target);
                    self.failing = true;
                }
                false
            }
        }
    }
}

/// Receiving end used to watch telemetry without the emulator GUI.
pub struct TelemetryListener {
    socket: UdpSocket,
}

impl TelemetryListener {
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_read_timeout(Some(LISTEN_POLL_INTERVAL))?;
        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Wait up to one poll interval for a message.
    ///
    /// Malformed datagrams are logged and reported as `Ok(None)`.
    pub fn recv(&self) -> io::Result<Option<TelemetryMessage>> {
        let mut buf = [0u8; 1024];
        let (len, from) = match self.socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                ) =>
            {
                return Ok(None);
            }
            Err(err) => return Err(err),
        };
        match TelemetryMessage::decode(&buf[..len]) {
            Ok(message) => Ok(Some(message)),
            Err(err) => {
                warn!("Ignoring malformed telemetry from {from}: {err}");
                Ok(None)
            }
        }
    }

    /// Log every level change until `shutdown` is set.
    pub fn run(&self, shutdown: &AtomicBool) -> io::Result<()> {
        info!("Listening for telemetry on {}", self.local_addr()?);
        let mut last: Option<i32> = None;
        while !shutdown.load(Ordering::Relaxed) {
            let Some(message) = self.recv()? else {
                continue;
            };
            if last != Some(message.danger_level) {
                info!(
                    "Danger level: {}% ({}/{} LEDs)",
                    message.danger_level,
                    message.lit_leds(),
                    LED_COUNT
                );
                last = Some(message.danger_level);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::net::UdpSocket;

    use super::*;

    fn loopback_receiver() -> UdpSocket {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        socket
    }

    #[test]
    fn encode_matches_wire_format() {
        assert_eq!(
            TelemetryMessage::from(DangerState::Present).encode(),
            br#"{"danger_level": 50}"#.to_vec()
        );
        assert_eq!(
            TelemetryMessage::from(DangerState::Absent).encode(),
            br#"{"danger_level": 0}"#.to_vec()
        );
    }

    #[test]
    fn publish_sends_one_datagram_per_call() {
        let receiver = loopback_receiver();
        let mut publisher = TelemetryPublisher::new(receiver.local_addr().unwrap()).unwrap();

        assert!(publisher.publish(DangerState::Present));
        assert!(publisher.publish(DangerState::Absent));

        let mut buf = [0u8; 64];
        let len = receiver.recv(&mut buf).unwrap();
        assert_eq!(&buf[..len], br#"{"danger_level": 50}"#);
        let len = receiver.recv(&mut buf).unwrap();
        assert_eq!(&buf[..len], br#"{"danger_level": 0}"#);
    }

    #[test]
    fn decode_tolerates_unknown_fields_and_compact_json() {
        let message =
            TelemetryMessage::decode(br#"{"danger_level":50,"source":"cam-a"}"#).unwrap();
        assert_eq!(message.danger_level, 50);
        assert!(TelemetryMessage::decode(br#"{"level": 3}"#).is_err());
    }

    #[test]
    fn lit_leds_scale_to_bar() {
        assert_eq!(TelemetryMessage { danger_level: 0 }.lit_leds(), 0);
        assert_eq!(TelemetryMessage { danger_level: 50 }.lit_leds(), 5);
        assert_eq!(TelemetryMessage { danger_level: 250 }.lit_leds(), LED_COUNT);
        assert_eq!(TelemetryMessage { danger_level: -3 }.lit_leds(), 0);
    }

    #[test]
    fn listener_skips_malformed_datagrams() {
        let listener = TelemetryListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();

        sender.send_to(b"not json", addr).unwrap();
        sender.send_to(br#"{"danger_level": 50}"#, addr).unwrap();

        let mut received = None;
        for _ in 0..20 {
            if let Some(message) = listener.recv().unwrap() {
                received = Some(message);
                break;
            }
        }
        assert_eq!(received, Some(TelemetryMessage { danger_level: 50 }));
    }
}
