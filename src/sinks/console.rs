//! A sink that writes bundles to standard output, one line per item.

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use serde::Deserialize;
use tokio::io::{self, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::bundler::BundleHandler;
use crate::event::Line;

/// Encoding applied to each line written by the sink.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Encoding {
    /// Raw line bytes.
    #[default]
    Text,
    /// One JSON object per line: timestamp, level, message, file.
    Json,
}

/// Writes bundles to the wrapped writer, newline framed.
///
/// Handler invocations for distinct bundles serialize on the writer, so the
/// output never interleaves even when the bundler runs handlers concurrently.
pub struct WriterSink<W> {
    output: Mutex<W>,
    encoding: Encoding,
}

impl<W> WriterSink<W> {
    pub fn new(output: W, encoding: Encoding) -> Self {
        Self {
            output: Mutex::new(output),
            encoding,
        }
    }
}

/// A [`WriterSink`] over standard output.
pub fn console(encoding: Encoding) -> WriterSink<io::Stdout> {
    WriterSink::new(io::stdout(), encoding)
}

fn encode(line: &Line, encoding: Encoding, buffer: &mut BytesMut) {
    match encoding {
        Encoding::Text => buffer.put_slice(line.text()),
        Encoding::Json => {
            let value = serde_json::json!({
                "timestamp": line.timestamp().to_rfc3339(),
                "level": line.level(),
                "message": String::from_utf8_lossy(line.text()),
                "file": line.file(),
            });
            buffer.put_slice(value.to_string().as_bytes());
        }
    }
    buffer.put_u8(b'\n');
}

#[async_trait]
impl<W> BundleHandler<Line> for WriterSink<W>
where
    W: AsyncWrite + Send + Sync + Unpin,
{
    async fn handle(&self, bundle: Vec<Line>) {
        let mut buffer = BytesMut::new();
        for line in &bundle {
            encode(line, self.encoding, &mut buffer);
        }

        let mut output = self.output.lock().await;
        if let Err(error) = output.write_all(&buffer).await {
            error!(message = "Error writing bundle to output.", %error);
            return;
        }
        if let Err(error) = output.flush().await {
            error!(message = "Error flushing output.", %error);
        }
    }
}
