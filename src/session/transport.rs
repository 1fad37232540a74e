//! Framed TCP transport with centralized deadline management.
//!
//! Every read and write is bounded by the currently selected deadline.
//! Bulk operations arm a transient alternate deadline; the next operation
//! consumes it and the standard deadline resumes. Handlers never touch
//! socket timeouts directly.

use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader, Take};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::trace;

use crate::codec::{self, MAX_FRAME_LEN, MAX_PREFIX_DIGITS, OK_FRAME};
use crate::error::{Error, Result};
use crate::protocol::Opcode;

/// The `(standard, alternate)` deadline pair. The alternate is one-shot:
/// taking the next deadline consumes it.
#[derive(Debug)]
struct Deadlines {
    standard: Duration,
    alternate: Option<Duration>,
}

impl Deadlines {
    fn next(&mut self) -> Duration {
        self.alternate.take().unwrap_or(self.standard)
    }
}

pub(crate) struct Transport {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    deadlines: Deadlines,
}

impl Transport {
    /// Connect to a Calibre instance. Name resolution picks the first
    /// returned address.
    pub(crate) async fn connect(host: &str, port: u16, standard: Duration) -> Result<Self> {
        let stream = timeout(standard, TcpStream::connect((host, port)))
            .await
            .map_err(|_| Error::TransportTimeout)??;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            deadlines: Deadlines {
                standard,
                alternate: None,
            },
        })
    }

    /// Arm the alternate deadline for the next operation.
    pub(crate) fn arm_alternate(&mut self, duration: Duration) {
        self.deadlines.alternate = Some(duration);
    }

    /// Deadline for the next operation, consuming an armed alternate.
    pub(crate) fn next_deadline(&mut self) -> Duration {
        self.deadlines.next()
    }

    /// The standing control-traffic deadline.
    pub(crate) fn standard_deadline(&self) -> Duration {
        self.deadlines.standard
    }

    /// Read and decode one frame.
    pub(crate) async fn read_frame(&mut self) -> Result<(i64, Value)> {
        let deadline = self.next_deadline();
        timeout(deadline, self.read_frame_inner())
            .await
            .map_err(|_| Error::TransportTimeout)?
    }

    async fn read_frame_inner(&mut self) -> Result<(i64, Value)> {
        let mut len: usize = 0;
        let mut digits = 0;
        loop {
            let byte = match self.reader.read_u8().await {
                Ok(byte) => byte,
                Err(error) if error.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Err(Error::TransportClosed)
                }
                Err(error) => return Err(error.into()),
            };
            if byte == b'[' {
                break;
            }
            if !byte.is_ascii_digit() || digits >= MAX_PREFIX_DIGITS {
                return Err(Error::MalformedFrame("invalid length prefix".into()));
            }
            len = len * 10 + usize::from(byte - b'0');
            digits += 1;
        }
        if digits == 0 || len == 0 || len > MAX_FRAME_LEN {
            return Err(Error::MalformedFrame(format!(
                "frame length {len} out of range"
            )));
        }
        // The prefix counts the `[` we already consumed; restore it for
        // the JSON parser.
        let mut body = vec![0u8; len];
        body[0] = b'[';
        if let Err(error) = self.reader.read_exact(&mut body[1..]).await {
            return Err(match error.kind() {
                std::io::ErrorKind::UnexpectedEof => Error::TransportClosed,
                _ => error.into(),
            });
        }
        let (opcode, payload) = codec::decode_body(&body)?;
        trace!(opcode, "frame received");
        Ok((opcode, payload))
    }

    /// Serialize and send one frame.
    pub(crate) async fn write_frame<T: Serialize + ?Sized>(
        &mut self,
        op: Opcode,
        payload: &T,
    ) -> Result<()> {
        let frame = codec::encode_frame(op, payload)?;
        self.write_all(&frame).await
    }

    /// Send the precomputed `ok` acknowledgement.
    pub(crate) async fn write_ok(&mut self) -> Result<()> {
        self.write_all(OK_FRAME).await
    }

    async fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        let deadline = self.next_deadline();
        timeout(deadline, async {
            self.writer.write_all(bytes).await?;
            self.writer.flush().await
        })
        .await
        .map_err(|_| Error::TransportTimeout)??;
        Ok(())
    }

    /// Reader limited to exactly `length` bytes of the inbound binary
    /// substream.
    pub(crate) fn binary_reader(&mut self, length: u64) -> Take<&mut BufReader<OwnedReadHalf>> {
        (&mut self.reader).take(length)
    }

    /// Stream exactly `length` bytes from `source` to the peer.
    pub(crate) async fn send_binary(
        &mut self,
        source: &mut (dyn AsyncRead + Send + Unpin),
        length: u64,
    ) -> Result<()> {
        let deadline = self.next_deadline();
        let copied = timeout(deadline, async {
            let mut limited = source.take(length);
            let copied = tokio::io::copy(&mut limited, &mut self.writer).await?;
            self.writer.flush().await?;
            std::io::Result::Ok(copied)
        })
        .await
        .map_err(|_| Error::TransportTimeout)??;
        if copied != length {
            return Err(Error::ProtocolViolation(format!(
                "book source ended after {copied} of {length} bytes"
            )));
        }
        Ok(())
    }

    /// Half-close the connection ahead of a reconnect.
    pub(crate) async fn shutdown(&mut self) {
        let _ = self.writer.shutdown().await;
    }
}
