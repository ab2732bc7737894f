//! DAP transport: `Content-Length`-framed JSON messages over any async
//! byte stream. Works for both TCP (server mode) and stdio (embedded mode).

use anyhow::anyhow;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

pub struct DapReader<R> {
    reader: BufReader<R>,
}

impl<R: AsyncRead + Unpin> DapReader<R> {
    pub fn new(inner: R) -> Self {
        DapReader {
            reader: BufReader::new(inner),
        }
    }

    /// Read a single DAP message (with Content-Length framing).
    pub async fn read_message<T: DeserializeOwned>(&mut self) -> anyhow::Result<T> {
        let mut content_length: Option<usize> = None;
        loop {
            let mut line = String::new();
            let read_n = self.reader.read_line(&mut line).await?;
            if read_n == 0 {
                return Err(anyhow!("DAP connection closed"));
            }
            let line = line.trim_end_matches(['\r', '\n']);
            if line.is_empty() {
                break;
            }
            if let Some(v) = line.strip_prefix("Content-Length:") {
                content_length = Some(v.trim().parse()?);
            }
        }

        let len = content_length.ok_or_else(|| anyhow!("Missing Content-Length header"))?;
        let mut buf = vec![0u8; len];
        self.reader.read_exact(&mut buf).await?;
        let msg: T = serde_json::from_slice(&buf)?;
        Ok(msg)
    }
}

pub struct DapWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> DapWriter<W> {
    pub fn new(writer: W) -> Self {
        DapWriter { writer }
    }

    /// Write a single DAP message (with Content-Length framing).
    pub async fn write_message<T: Serialize>(&mut self, message: &T) -> anyhow::Result<()> {
        let payload = serde_json::to_vec(message)?;
        let header = format!("Content-Length: {}\r\n\r\n", payload.len());
        self.writer.write_all(header.as_bytes()).await?;
        self.writer.write_all(&payload).await?;
        self.writer.flush().await?;
        Ok(())
    }
}
