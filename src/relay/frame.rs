//! Newline-delimited frame I/O

use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, LinesCodec};

/// Largest frame accepted on any transport (10 MiB)
pub const MAX_FRAME_BYTES: usize = 10 * 1024 * 1024;

pub type FrameReader<R> = FramedRead<R, LinesCodec>;

/// Split a byte stream into frames, one per line
pub fn frame_reader<R: AsyncRead>(reader: R) -> FrameReader<R> {
    FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_FRAME_BYTES))
}

/// Shared, serialized writer for one side of a relay.
///
/// Both forwarding loops may write to the same side (a forwarded frame and an error
/// envelope), so each frame is written and flushed under one lock.
#[derive(Clone)]
pub struct FrameWriter {
    inner: Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>,
}

impl FrameWriter {
    pub fn new<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            inner: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    /// Write one frame followed by a newline
    pub async fn write_frame(&self, frame: &str) -> io::Result<()> {
        let mut writer = self.inner.lock().await;
        writer.write_all(frame.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await
    }

    /// Close the underlying stream (EOF for the peer)
    pub async fn shutdown(&self) -> io::Result<()> {
        self.inner.lock().await.shutdown().await
    }
}
