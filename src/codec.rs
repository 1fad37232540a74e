//! Length-prefixed JSON framing.
//!
//! Every control message on the wire looks like `13[0,{"foo":1}]`: an
//! ASCII decimal byte count followed by a two-element JSON array of
//! opcode and payload. There is no delimiter between frames. Book
//! binaries are not framed at all; they travel as exactly `length` raw
//! bytes immediately after the frame that announces them.

use serde::Serialize;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::protocol::Opcode;

/// The precomputed `ok` acknowledgement frame.
pub const OK_FRAME: &[u8] = b"6[0,{}]";

/// Upper bound on a single frame body.
pub(crate) const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Longest accepted length prefix; ten digits cover the size cap.
pub(crate) const MAX_PREFIX_DIGITS: usize = 10;

/// Encode one frame: length prefix, opcode and JSON payload.
pub fn encode_frame<T: Serialize + ?Sized>(op: Opcode, payload: &T) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(payload)?;
    let mut frame = format!("[{},", op.code()).into_bytes();
    frame.extend_from_slice(&body);
    frame.push(b']');
    let mut out = frame.len().to_string().into_bytes();
    out.extend_from_slice(&frame);
    Ok(out)
}

/// Decode one frame from the front of `bytes`. Returns the opcode, the
/// payload and the number of bytes consumed, so that concatenated frames
/// can be walked in order.
pub fn decode_frame(bytes: &[u8]) -> Result<(i64, Value, usize)> {
    let open = bytes
        .iter()
        .position(|&b| b == b'[')
        .ok_or_else(|| Error::MalformedFrame("missing frame body".into()))?;
    if open == 0 || open > MAX_PREFIX_DIGITS {
        return Err(Error::MalformedFrame("bad length prefix".into()));
    }
    let prefix = &bytes[..open];
    if !prefix.iter().all(u8::is_ascii_digit) {
        return Err(Error::MalformedFrame(format!(
            "length prefix {:?} is not a decimal integer",
            String::from_utf8_lossy(prefix)
        )));
    }
    let len: usize = String::from_utf8_lossy(prefix)
        .parse()
        .map_err(|_| Error::MalformedFrame("length prefix out of range".into()))?;
    if len == 0 || len > MAX_FRAME_LEN {
        return Err(Error::MalformedFrame(format!("frame length {len} out of range")));
    }
    let body = bytes
        .get(open..open + len)
        .ok_or_else(|| Error::MalformedFrame("truncated frame".into()))?;
    let (op, payload) = decode_body(body)?;
    Ok((op, payload, open + len))
}

/// Parse a frame body (including the leading `[`) into opcode and payload.
/// The body must be a two-element JSON array with an integer first element.
pub(crate) fn decode_body(body: &[u8]) -> Result<(i64, Value)> {
    serde_json::from_slice::<(i64, Value)>(body)
        .map_err(|source| Error::MalformedFrame(source.to_string()))
}
