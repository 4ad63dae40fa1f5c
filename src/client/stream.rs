use futures_util::{Stream, StreamExt};
use kiln_common::ConversionEvent;

/// Splits a byte stream into newline-terminated frames.
///
/// Chunk boundaries fall anywhere, including inside a multi-byte character,
/// so bytes are buffered until a full line is available.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buffer: Vec<u8>,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every line it completed, without newlines.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line[..line.len() - 1]);
            let text = text.trim_end_matches('\r');
            if !text.trim().is_empty() {
                lines.push(text.to_string());
            }
        }
        lines
    }

    /// Whatever is left once the stream ends.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        let text = String::from_utf8_lossy(&rest).trim().to_string();
        (!text.is_empty()).then_some(text)
    }
}

/// How a stream of frames ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEnd {
    /// A `done` or `error` frame was read.
    Terminal,
    /// The stream closed before any terminal frame.
    Truncated,
    /// The transport failed mid-stream.
    Failed(String),
}

/// Read NDJSON frames from `stream`, handing each decoded event to
/// `on_event`. Reading stops at the first terminal event. Undecodable
/// frames are logged and skipped.
pub async fn drive<S, B, E, F>(stream: S, mut on_event: F) -> StreamEnd
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
    F: FnMut(ConversionEvent),
{
    let mut stream = std::pin::pin!(stream);
    let mut decoder = LineDecoder::new();

    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => return StreamEnd::Failed(e.to_string()),
        };
        for line in decoder.push(chunk.as_ref()) {
            if deliver(&line, &mut on_event) {
                return StreamEnd::Terminal;
            }
        }
    }

    match decoder.finish() {
        Some(line) if deliver(&line, &mut on_event) => StreamEnd::Terminal,
        _ => StreamEnd::Truncated,
    }
}

/// Decode and hand over one frame. Returns whether it was terminal.
fn deliver<F: FnMut(ConversionEvent)>(line: &str, on_event: &mut F) -> bool {
    match ConversionEvent::from_line(line) {
        Ok(event) => {
            let terminal = event.is_terminal();
            on_event(event);
            terminal
        }
        Err(e) => {
            tracing::warn!(error = %e, "skipping undecodable frame");
            false
        }
    }
}
