//! RTMP wire subset.
//!
//! Real handshake (C0/C1/C2 echo), chunked message framing with a fixed
//! 128-byte chunk size (header formats 0, 1 and 3), and just enough AMF0 to
//! read command names and reply with `_result`/`onStatus`. Audio (8) and
//! video (9) messages are carried opaquely.

use bytes::Bytes;
use std::collections::HashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

pub const CHUNK_SIZE: usize = 128;
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

pub const MSG_SET_CHUNK_SIZE: u8 = 1;
pub const MSG_AUDIO: u8 = 8;
pub const MSG_VIDEO: u8 = 9;
pub const MSG_COMMAND_AMF0: u8 = 20;

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed: {0}")]
    Malformed(String),
    #[error("message too large")]
    TooLarge,
}

#[derive(Debug)]
pub struct RtmpMessage {
    pub type_id: u8,
    pub stream_id: u32,
    pub payload: Bytes,
}

/// Server side of the handshake: read C0+C1, send S0+S1+S2, read C2.
/// Returns the number of bytes exchanged in each direction.
pub async fn handshake_server<S>(stream: &mut S) -> Result<(u64, u64), WireError>
where
    S: AsyncReadExt + AsyncWriteExt + Unpin,
{
    let version = stream.read_u8().await?;
    if version != 3 {
        return Err(WireError::Malformed(format!("RTMP version {version}")));
    }
    let mut c1 = vec![0u8; 1536];
    stream.read_exact(&mut c1).await?;

    stream.write_u8(3).await?;
    let s1 = vec![0u8; 1536];
    stream.write_all(&s1).await?;
    // S2 echoes C1
    stream.write_all(&c1).await?;

    let mut c2 = vec![0u8; 1536];
    stream.read_exact(&mut c2).await?;
    Ok((1 + 1536 + 1536, 1 + 1536 + 1536))
}

/// Client side of the handshake, used by the integration helpers.
pub async fn handshake_client<S>(stream: &mut S) -> Result<(), WireError>
where
    S: AsyncReadExt + AsyncWriteExt + Unpin,
{
    stream.write_u8(3).await?;
    let c1 = vec![0u8; 1536];
    stream.write_all(&c1).await?;

    let version = stream.read_u8().await?;
    if version != 3 {
        return Err(WireError::Malformed(format!("RTMP version {version}")));
    }
    let mut s1 = vec![0u8; 1536];
    stream.read_exact(&mut s1).await?;
    let mut s2 = vec![0u8; 1536];
    stream.read_exact(&mut s2).await?;
    // C2 echoes S1
    stream.write_all(&s1).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Chunk reader
// ---------------------------------------------------------------------------

struct ChunkState {
    msg_len: usize,
    type_id: u8,
    stream_id: u32,
    buf: Vec<u8>,
}

/// Reassembles messages from chunks; one per connection and direction.
pub struct MessageReader {
    streams: HashMap<u8, ChunkState>,
    in_chunk_size: usize,
}

impl Default for MessageReader {
    fn default() -> Self {
        MessageReader {
            streams: HashMap::new(),
            in_chunk_size: CHUNK_SIZE,
        }
    }
}

impl MessageReader {
    /// Read chunks until one message completes. Returns the message and the
    /// wire bytes consumed.
    pub async fn read_message<R>(
        &mut self,
        reader: &mut R,
    ) -> Result<(RtmpMessage, u64), WireError>
    where
        R: AsyncReadExt + Unpin,
    {
        let mut consumed: u64 = 0;
        loop {
            let basic = reader.read_u8().await?;
            consumed += 1;
            let fmt = basic >> 6;
            let csid = basic & 0x3f;
            if csid < 2 {
                return Err(WireError::Malformed("extended chunk ids unsupported".into()));
            }

            match fmt {
                0 => {
                    let mut header = [0u8; 11];
                    reader.read_exact(&mut header).await?;
                    consumed += 11;
                    let msg_len =
                        usize::from(header[3]) << 16 | usize::from(header[4]) << 8
                            | usize::from(header[5]);
                    if msg_len > MAX_MESSAGE_SIZE {
                        return Err(WireError::TooLarge);
                    }
                    let type_id = header[6];
                    let stream_id = u32::from_le_bytes([header[7], header[8], header[9], header[10]]);
                    self.streams.insert(
                        csid,
                        ChunkState {
                            msg_len,
                            type_id,
                            stream_id,
                            buf: Vec::with_capacity(msg_len),
                        },
                    );
                }
                1 => {
                    let mut header = [0u8; 7];
                    reader.read_exact(&mut header).await?;
                    consumed += 7;
                    let msg_len =
                        usize::from(header[3]) << 16 | usize::from(header[4]) << 8
                            | usize::from(header[5]);
                    if msg_len > MAX_MESSAGE_SIZE {
                        return Err(WireError::TooLarge);
                    }
                    let type_id = header[6];
                    let stream_id = self
                        .streams
                        .get(&csid)
                        .map(|s| s.stream_id)
                        .unwrap_or(0);
                    self.streams.insert(
                        csid,
                        ChunkState {
                            msg_len,
                            type_id,
                            stream_id,
                            buf: Vec::with_capacity(msg_len),
                        },
                    );
                }
                2 => {
                    let mut delta = [0u8; 3];
                    reader.read_exact(&mut delta).await?;
                    consumed += 3;
                    let state = self
                        .streams
                        .get_mut(&csid)
                        .ok_or_else(|| WireError::Malformed("fmt-2 chunk without context".into()))?;
                    state.buf.clear();
                }
                _ => {
                    // fmt 3: pure continuation
                    if !self.streams.contains_key(&csid) {
                        return Err(WireError::Malformed("fmt-3 chunk without context".into()));
                    }
                }
            }

            let state = self
                .streams
                .get_mut(&csid)
                .ok_or_else(|| WireError::Malformed("chunk without context".into()))?;
            let remaining = state.msg_len - state.buf.len();
            let take = remaining.min(self.in_chunk_size);
            let mut chunk = vec![0u8; take];
            reader.read_exact(&mut chunk).await?;
            consumed += take as u64;
            state.buf.extend_from_slice(&chunk);

            if state.buf.len() == state.msg_len {
                let message = RtmpMessage {
                    type_id: state.type_id,
                    stream_id: state.stream_id,
                    payload: Bytes::from(std::mem::take(&mut state.buf)),
                };
                if message.type_id == MSG_SET_CHUNK_SIZE && message.payload.len() >= 4 {
                    self.in_chunk_size = u32::from_be_bytes([
                        message.payload[0],
                        message.payload[1],
                        message.payload[2],
                        message.payload[3],
                    ]) as usize;
                    continue;
                }
                return Ok((message, consumed));
            }
        }
    }
}

/// Serialize one message as a fmt-0 chunk followed by fmt-3 continuations.
pub fn serialize_message(csid: u8, msg: &RtmpMessage) -> Vec<u8> {
    let mut out = Vec::with_capacity(msg.payload.len() + 16);
    out.push(csid & 0x3f);
    out.extend_from_slice(&[0, 0, 0]); // timestamp
    let len = msg.payload.len();
    out.extend_from_slice(&[(len >> 16) as u8, (len >> 8) as u8, len as u8]);
    out.push(msg.type_id);
    out.extend_from_slice(&msg.stream_id.to_le_bytes());

    let mut offset = 0;
    while offset < len {
        if offset > 0 {
            out.push(0xc0 | (csid & 0x3f)); // fmt 3
        }
        let take = (len - offset).min(CHUNK_SIZE);
        out.extend_from_slice(&msg.payload[offset..offset + take]);
        offset += take;
    }
    out
}

// ---------------------------------------------------------------------------
// AMF0 (reading: command name + string args; writing: replies)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Amf0 {
    Number(f64),
    Boolean(bool),
    String(String),
    Object(Vec<(String, Amf0)>),
    Null,
}

pub fn amf0_read_all(payload: &[u8]) -> Result<Vec<Amf0>, WireError> {
    let mut values = Vec::new();
    let mut pos = 0;
    while pos < payload.len() {
        let (value, next) = amf0_read(payload, pos)?;
        values.push(value);
        pos = next;
    }
    Ok(values)
}

fn amf0_read(payload: &[u8], pos: usize) -> Result<(Amf0, usize), WireError> {
    let marker = *payload
        .get(pos)
        .ok_or_else(|| WireError::Malformed("truncated AMF0".into()))?;
    let pos = pos + 1;
    match marker {
        0x00 => {
            let bytes: [u8; 8] = payload
                .get(pos..pos + 8)
                .ok_or_else(|| WireError::Malformed("truncated number".into()))?
                .try_into()
                .unwrap();
            Ok((Amf0::Number(f64::from_be_bytes(bytes)), pos + 8))
        }
        0x01 => {
            let b = *payload
                .get(pos)
                .ok_or_else(|| WireError::Malformed("truncated boolean".into()))?;
            Ok((Amf0::Boolean(b != 0), pos + 1))
        }
        0x02 => {
            let (s, next) = amf0_read_string(payload, pos)?;
            Ok((Amf0::String(s), next))
        }
        0x03 => {
            let mut fields = Vec::new();
            let mut cur = pos;
            loop {
                if payload.get(cur..cur + 3) == Some(&[0, 0, 9]) {
                    return Ok((Amf0::Object(fields), cur + 3));
                }
                let (key, after_key) = amf0_read_string(payload, cur)?;
                let (value, after_value) = amf0_read(payload, after_key)?;
                fields.push((key, value));
                cur = after_value;
            }
        }
        0x05 => Ok((Amf0::Null, pos)),
        other => Err(WireError::Malformed(format!("AMF0 marker {other:#x}"))),
    }
}

fn amf0_read_string(payload: &[u8], pos: usize) -> Result<(String, usize), WireError> {
    let len_bytes = payload
        .get(pos..pos + 2)
        .ok_or_else(|| WireError::Malformed("truncated string length".into()))?;
    let len = usize::from(u16::from_be_bytes([len_bytes[0], len_bytes[1]]));
    let start = pos + 2;
    let bytes = payload
        .get(start..start + len)
        .ok_or_else(|| WireError::Malformed("truncated string".into()))?;
    let s = String::from_utf8(bytes.to_vec())
        .map_err(|_| WireError::Malformed("non-utf8 string".into()))?;
    Ok((s, start + len))
}

pub fn amf0_write(values: &[Amf0]) -> Vec<u8> {
    let mut out = Vec::new();
    for value in values {
        amf0_write_one(&mut out, value);
    }
    out
}

fn amf0_write_one(out: &mut Vec<u8>, value: &Amf0) {
    match value {
        Amf0::Number(n) => {
            out.push(0x00);
            out.extend_from_slice(&n.to_be_bytes());
        }
        Amf0::Boolean(b) => {
            out.push(0x01);
            out.push(u8::from(*b));
        }
        Amf0::String(s) => {
            out.push(0x02);
            amf0_write_string(out, s);
        }
        Amf0::Object(fields) => {
            out.push(0x03);
            for (key, value) in fields {
                amf0_write_string(out, key);
                amf0_write_one(out, value);
            }
            out.extend_from_slice(&[0, 0, 9]);
        }
        Amf0::Null => out.push(0x05),
    }
}

fn amf0_write_string(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u16).to_be_bytes());
    out.extend_from_slice(s.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amf0_roundtrip() {
        let values = vec![
            Amf0::String("connect".to_owned()),
            Amf0::Number(1.0),
            Amf0::Object(vec![("app".to_owned(), Amf0::String("live".to_owned()))]),
            Amf0::Null,
            Amf0::Boolean(true),
        ];
        let encoded = amf0_write(&values);
        let decoded = amf0_read_all(&encoded).unwrap();
        assert_eq!(decoded, values);
    }

    #[tokio::test]
    async fn message_roundtrip_with_continuation_chunks() {
        let payload: Vec<u8> = (0..300).map(|i| (i % 251) as u8).collect();
        let msg = RtmpMessage {
            type_id: MSG_VIDEO,
            stream_id: 1,
            payload: Bytes::from(payload.clone()),
        };
        let wire = serialize_message(4, &msg);

        let mut reader = MessageReader::default();
        let mut cursor = wire.as_slice();
        let (parsed, consumed) = reader.read_message(&mut cursor).await.unwrap();
        assert_eq!(parsed.type_id, MSG_VIDEO);
        assert_eq!(&parsed.payload[..], &payload[..]);
        assert_eq!(consumed as usize, wire.len());
    }

    #[tokio::test]
    async fn handshake_pairs_up() {
        let (mut a, mut b) = tokio::io::duplex(16 * 1024);
        let server = tokio::spawn(async move { handshake_server(&mut a).await.map(|_| ()) });
        handshake_client(&mut b).await.unwrap();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn oversized_message_is_rejected() {
        let mut wire = vec![0x04u8];
        wire.extend_from_slice(&[0, 0, 0]); // timestamp
        wire.extend_from_slice(&[0xff, 0xff, 0xff]); // 16 MiB length
        wire.push(MSG_VIDEO);
        wire.extend_from_slice(&1u32.to_le_bytes());
        let mut reader = MessageReader::default();
        let mut cursor = wire.as_slice();
        assert!(matches!(
            reader.read_message(&mut cursor).await,
            Err(WireError::TooLarge)
        ));
    }
}
