//! Line-oriented reading of streaming HTTP bodies. Both the SSE providers
//! and the NDJSON providers consume their responses through this reader.

use memchr::memchr;
use tokio_util::sync::CancellationToken;

use super::StreamError;

/// Splits raw byte chunks into trimmed lines, tolerating CRLF and frames
/// that straddle chunk boundaries.
#[derive(Default)]
pub struct LineBuffer {
    buffer: Vec<u8>,
}

impl LineBuffer {
    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// The next complete line, if one is buffered.
    pub fn next_line(&mut self) -> Option<String> {
        let newline = memchr(b'\n', &self.buffer)?;
        let mut end = newline;
        if end > 0 && self.buffer[end - 1] == b'\r' {
            end -= 1;
        }
        let line = String::from_utf8_lossy(&self.buffer[..end])
            .trim()
            .to_string();
        self.buffer.drain(..=newline);
        Some(line)
    }

    /// Drains whatever remains after the transport signalled EOF.
    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&self.buffer).trim().to_string();
        self.buffer.clear();
        (!line.is_empty()).then_some(line)
    }
}

/// Pulls lines out of a streaming [`reqwest::Response`] body.
pub struct LineStream {
    response: reqwest::Response,
    buffer: LineBuffer,
    eof: bool,
    cancel: CancellationToken,
}

impl LineStream {
    pub fn new(response: reqwest::Response, cancel: CancellationToken) -> Self {
        Self {
            response,
            buffer: LineBuffer::default(),
            eof: false,
            cancel,
        }
    }

    /// The next line of the body, `None` at EOF or when cancelled.
    pub async fn next_line(&mut self) -> Result<Option<String>, StreamError> {
        loop {
            if let Some(line) = self.buffer.next_line() {
                return Ok(Some(line));
            }
            if self.eof {
                return Ok(self.buffer.finish());
            }
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Err(StreamError::Transport("request cancelled".to_string()))
                }
                chunk = self.response.chunk() => match chunk {
                    Ok(Some(bytes)) => self.buffer.push(&bytes),
                    Ok(None) => self.eof = true,
                    Err(err) => return Err(StreamError::transport(err)),
                },
            }
        }
    }
}

/// The payload of a `data:` SSE line, if the line is one.
pub fn data_payload(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(str::trim_start)
}

/// The event name of an `event:` SSE line, if the line is one.
pub fn event_name(line: &str) -> Option<&str> {
    line.strip_prefix("event:").map(str::trim)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_lines_across_chunks() {
        let mut buf = LineBuffer::default();
        buf.push(b"data: {\"a\":");
        assert_eq!(buf.next_line(), None);
        buf.push(b"1}\r\ndata: [DONE]\n");
        assert_eq!(buf.next_line().as_deref(), Some("data: {\"a\":1}"));
        assert_eq!(buf.next_line().as_deref(), Some("data: [DONE]"));
        assert_eq!(buf.next_line(), None);
    }

    #[test]
    fn finish_flushes_trailing_bytes() {
        let mut buf = LineBuffer::default();
        buf.push(b"tail without newline");
        assert_eq!(buf.next_line(), None);
        assert_eq!(buf.finish().as_deref(), Some("tail without newline"));
        assert_eq!(buf.finish(), None);
    }

    #[test]
    fn data_payload_handles_spacing_variants() {
        assert_eq!(data_payload("data: {\"x\":1}"), Some("{\"x\":1}"));
        assert_eq!(data_payload("data:{\"x\":1}"), Some("{\"x\":1}"));
        assert_eq!(data_payload("event: error"), None);
    }

    #[test]
    fn event_name_strips_prefix() {
        assert_eq!(event_name("event: error"), Some("error"));
        assert_eq!(event_name("data: x"), None);
    }
}
