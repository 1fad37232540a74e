//! Locating Calibre instances on the local network.
//!
//! Calibre's wireless driver listens for a small UDP datagram on a fixed
//! set of ports and answers with a one-line description of its server.
//! The probe is fired several times across every port because home Wi-Fi
//! drops broadcast traffic freely.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Ports a Calibre wireless server may answer on. Most instances reply on
/// the first; all five are probed for completeness.
const BROADCAST_PORTS: [u16; 5] = [54982, 48123, 39001, 44044, 59678];

/// Probe body. Calibre matches on the packet, not its content.
const PROBE: &[u8] = b"hello";

const PROBE_ROUNDS: usize = 3;
const PROBE_GAP: Duration = Duration::from_millis(50);
const READ_WINDOW: Duration = Duration::from_secs(1);
const ATTEMPTS: usize = 3;
const ATTEMPT_PAUSE: Duration = Duration::from_millis(500);

/// One discovered (or directly configured) Calibre endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalibreInstance {
    /// Host address, as an IP string or resolvable name.
    pub host: String,

    /// TCP port of the wireless server.
    pub port: u16,

    /// Hostname the instance reported about itself.
    pub name: String,
}

fn reply_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"calibre wireless device client \(on ([^)]+)\);(\d{2,5}),(\d{2,5})")
            .expect("reply pattern compiles")
    })
}

/// Parse one UDP reply. Returns the full matched text (the dedup key) and
/// the instance it describes; replies that do not match are dropped.
fn parse_reply(reply: &[u8], source: IpAddr) -> Option<(String, CalibreInstance)> {
    let text = std::str::from_utf8(reply).ok()?;
    let captures = reply_pattern().captures(text)?;
    let full = captures.get(0)?.as_str().to_owned();
    let name = captures.get(1)?.as_str().to_owned();
    // The second port is the content-server-independent wireless port.
    let port: u16 = captures.get(3)?.as_str().parse().ok()?;
    Some((
        full,
        CalibreInstance {
            host: source.to_string(),
            port,
            name,
        },
    ))
}

/// Probe the local network for running Calibre instances.
///
/// Makes up to three attempts before giving up with
/// [`Error::CalibreNotFound`]; each attempt sends three probe rounds
/// across all five ports and collects replies for one second.
pub async fn discover() -> Result<Vec<CalibreInstance>> {
    for attempt in 0..ATTEMPTS {
        if attempt > 0 {
            sleep(ATTEMPT_PAUSE).await;
        }
        let found = probe_once().await?;
        if !found.is_empty() {
            return Ok(found);
        }
        debug!(attempt = attempt + 1, "no calibre replies yet");
    }
    Err(Error::CalibreNotFound)
}

async fn probe_once() -> Result<Vec<CalibreInstance>> {
    let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
    socket.set_broadcast(true)?;
    let deadline = Instant::now() + READ_WINDOW;

    let send = async {
        for _ in 0..PROBE_ROUNDS {
            for port in BROADCAST_PORTS {
                if let Err(error) = socket.send_to(PROBE, ("255.255.255.255", port)).await {
                    warn!(%error, port, "discovery probe send failed");
                }
                sleep(PROBE_GAP).await;
            }
        }
    };

    let receive = async {
        let mut seen = HashSet::new();
        let mut found = Vec::new();
        let mut buf = [0u8; 512];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match timeout(remaining, socket.recv_from(&mut buf)).await {
                Err(_) => break,
                Ok(Err(error)) => {
                    warn!(%error, "discovery read failed");
                    break;
                }
                Ok(Ok((len, addr))) => {
                    if let Some((key, instance)) = parse_reply(&buf[..len], addr.ip()) {
                        if seen.insert(key) {
                            debug!(host = %instance.host, port = instance.port, name = %instance.name, "calibre instance found");
                            found.push(instance);
                        }
                    }
                }
            }
        }
        found
    };

    let (_, found) = tokio::join!(send, receive);
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPLY: &[u8] = b"calibre wireless device client (on workhorse);60892,9090";

    fn source() -> IpAddr {
        "192.168.1.9".parse().unwrap()
    }

    #[test]
    fn replies_parse_into_instances() {
        let (key, instance) = parse_reply(REPLY, source()).unwrap();
        assert_eq!(instance.host, "192.168.1.9");
        assert_eq!(instance.port, 9090);
        assert_eq!(instance.name, "workhorse");
        assert_eq!(
            key,
            "calibre wireless device client (on workhorse);60892,9090"
        );
    }

    #[test]
    fn duplicate_replies_share_a_dedup_key() {
        let (first, _) = parse_reply(REPLY, source()).unwrap();
        let (second, _) = parse_reply(REPLY, source()).unwrap();
        let mut seen = HashSet::new();
        assert!(seen.insert(first));
        assert!(!seen.insert(second));
    }

    #[test]
    fn unrelated_replies_are_dropped() {
        assert!(parse_reply(b"some other broadcast", source()).is_none());
        assert!(parse_reply(b"calibre wireless device client (on x);port,port", source()).is_none());
        assert!(parse_reply(&[0xff, 0xfe], source()).is_none());
    }
}
