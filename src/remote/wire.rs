//! Remote wire format: a 4-byte little-endian length, a UTF-8 JSON header,
//! then zero or more raw binary segments referenced by `offset` fields
//! inside the header.

use crate::error::Error;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const STATUS_OK: &str = "OK";

/// Rendered in place of a value the server declared too large to transmit
/// (`offset == -1`).
pub const OMITTED_PLACEHOLDER: &str = "<data too large to transmit>";

/// A single transport message. Exactly one of {`id` without `event`, `event`}
/// is meaningful; a frame with neither is malformed and handled by the
/// dispatcher, not here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub func: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(default)]
    pub data: Value,
    #[serde(default = "ok_status")]
    pub message: String,
}

fn ok_status() -> String {
    STATUS_OK.to_string()
}

impl Frame {
    pub fn call(id: u64, func: &str, data: Value) -> Self {
        Frame {
            id: Some(id),
            func: Some(func.to_string()),
            event: None,
            data,
            message: ok_status(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.message == STATUS_OK
    }
}

/// Encode a frame without binary segments.
pub fn encode(frame: &Frame) -> Result<Bytes, Error> {
    let json = serde_json::to_vec(frame)?;
    let mut buf = BytesMut::with_capacity(4 + json.len());
    buf.put_u32_le(json.len() as u32);
    buf.put_slice(&json);
    Ok(buf.freeze())
}

/// Decode a complete frame from a byte buffer, consuming binary segments.
/// The buffer must contain the whole message; a segment reaching past the
/// end of the buffer is an error, never an out-of-bounds read.
pub fn decode(buf: &[u8]) -> Result<Frame, Error> {
    if buf.len() < 4 {
        return Err(Error::MalformedFrame("missing length prefix"));
    }
    let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    let rest = &buf[4..];
    if rest.len() < len {
        return Err(Error::MalformedFrame("truncated JSON header"));
    }
    let mut frame: Frame = serde_json::from_slice(&rest[..len])?;
    attach_segments(&mut frame.data, &rest[len..])?;
    Ok(frame)
}

/// Read one frame from an async stream. The binary tail length is only
/// discoverable from the header, so the header is parsed first and the tail
/// sized from its `offset` fields.
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame, Error>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf) as usize;

    let mut json = vec![0u8; len];
    reader.read_exact(&mut json).await?;
    let mut frame: Frame = serde_json::from_slice(&json)?;

    let tail_len = segments_len(&frame.data);
    let mut tail = vec![0u8; tail_len];
    if tail_len > 0 {
        reader.read_exact(&mut tail).await?;
    }
    attach_segments(&mut frame.data, &tail)?;
    Ok(frame)
}

pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
{
    let buf = encode(frame)?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Total binary tail length declared by the header: the sum of every
/// non-negative `offset` over the entries of `data`, in document order.
fn segments_len(data: &Value) -> usize {
    entry_offsets(data)
        .into_iter()
        .filter(|&off| off >= 0)
        .map(|off| off as usize)
        .sum()
}

/// Replace each offset-bearing entry's payload with its materialized value.
/// Entries are processed strictly in document order since each consumes a
/// variable slice of the shared binary tail.
fn attach_segments(data: &mut Value, mut tail: &[u8]) -> Result<(), Error> {
    match data {
        Value::Array(items) => {
            for item in items.iter_mut() {
                tail = attach_one(item, tail)?;
            }
        }
        Value::Object(_) => {
            attach_one(data, tail)?;
        }
        _ => {}
    }
    Ok(())
}

fn attach_one<'a>(entry: &mut Value, tail: &'a [u8]) -> Result<&'a [u8], Error> {
    let Some(obj) = entry.as_object_mut() else {
        return Ok(tail);
    };
    let Some(offset) = obj.get("offset").and_then(Value::as_i64) else {
        return Ok(tail);
    };
    obj.remove("offset");

    if offset < 0 {
        // Sentinel: the server skipped the payload entirely. Never a read.
        obj.insert("data".to_string(), Value::String(OMITTED_PLACEHOLDER.to_string()));
        return Ok(tail);
    }

    let take = offset as usize;
    if take > tail.len() {
        return Err(Error::SegmentOverrun {
            declared: take,
            available: tail.len(),
        });
    }
    let parsed: Value = serde_json::from_slice(&tail[..take])?;
    obj.insert("data".to_string(), parsed);
    Ok(&tail[take..])
}

fn entry_offsets(data: &Value) -> Vec<i64> {
    let entry_offset = |v: &Value| v.get("offset").and_then(Value::as_i64);
    match data {
        Value::Array(items) => items.iter().filter_map(entry_offset).collect(),
        Value::Object(_) => entry_offset(data).into_iter().collect(),
        _ => vec![],
    }
}
