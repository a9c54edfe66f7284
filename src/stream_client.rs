use crate::config::StreamConfig;
use crate::error::BackendError;
use crate::stream_filter::StreamEvent;
use async_trait::async_trait;
use reqwest::{Client, Response};
use std::time::Duration;

/// Single reader of the external event feed.
#[async_trait]
pub trait EventSource: Send {
    /// `Ok(None)` once the feed has ended.
    async fn next_event(&mut self) -> Result<Option<StreamEvent>, BackendError>;
}

/// Reads newline-delimited JSON events from a long-lived HTTP response.
pub struct HttpEventSource {
    response: Response,
    lines: LineBuffer,
    finished: bool,
}

impl HttpEventSource {
    pub async fn connect(config: &StreamConfig) -> Result<Self, BackendError> {
        log::info!("Connecting to event stream at {}", config.url);
        // No overall timeout, the response body never ends on a healthy stream.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()?;
        let mut request = client.get(&config.url);
        if !config.bearer_token.is_empty() {
            request = request.bearer_auth(&config.bearer_token);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(BackendError::Status {
                service: "event stream",
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        Ok(Self {
            response,
            lines: LineBuffer::default(),
            finished: false,
        })
    }
}

#[async_trait]
impl EventSource for HttpEventSource {
    async fn next_event(&mut self) -> Result<Option<StreamEvent>, BackendError> {
        loop {
            while let Some(line) = self.lines.next_line() {
                if let Some(event) = parse_event(&line) {
                    return Ok(Some(event));
                }
            }
            if self.finished {
                let rest = self.lines.take_rest();
                return Ok(parse_event(&rest));
            }
            match self.response.chunk().await? {
                Some(chunk) => self.lines.push(&chunk),
                None => {
                    log::info!("Event stream ended");
                    self.finished = true;
                }
            }
        }
    }
}

/// Longest event line kept; anything longer is dropped up to its newline.
const MAX_LINE_BYTES: usize = 1 << 20;

struct LineBuffer {
    pending: Vec<u8>,
    max_line: usize,
    discarding: bool,
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::with_limit(MAX_LINE_BYTES)
    }
}

impl LineBuffer {
    fn with_limit(max_line: usize) -> Self {
        Self {
            pending: Vec::new(),
            max_line,
            discarding: false,
        }
    }

    fn push(&mut self, mut bytes: &[u8]) {
        if self.discarding {
            match bytes.iter().position(|b| *b == b'\n') {
                Some(end) => {
                    self.discarding = false;
                    bytes = &bytes[end + 1..];
                }
                None => return,
            }
        }
        self.pending.extend_from_slice(bytes);

        let unterminated = self.pending.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1);
        if self.pending.len() - unterminated > self.max_line {
            log::warn!("Dropping stream line longer than {} bytes", self.max_line);
            self.pending.truncate(unterminated);
            self.discarding = true;
        }
    }

    fn next_line(&mut self) -> Option<Vec<u8>> {
        let end = self.pending.iter().position(|b| *b == b'\n')?;
        let mut line: Vec<u8> = self.pending.drain(..=end).collect();
        line.pop();
        if line.len() > self.max_line {
            log::warn!("Dropping stream line of {} bytes", line.len());
            line.clear();
        }
        Some(line)
    }

    fn take_rest(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.pending)
    }
}

/// Blank keep-alive lines and undecodable lines yield `None`.
fn parse_event(line: &[u8]) -> Option<StreamEvent> {
    let line = String::from_utf8_lossy(line);
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str::<StreamEvent>(line) {
        Ok(event) => Some(event),
        Err(e) => {
            log::debug!("Skipping undecodable stream line: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_split_across_chunks_are_reassembled() {
        let mut buffer = LineBuffer::default();
        buffer.push(b"{\"text\":\"a\"}\r\n{\"te");
        assert_eq!(buffer.next_line().unwrap(), b"{\"text\":\"a\"}\r".to_vec());
        assert!(buffer.next_line().is_none());
        buffer.push(b"xt\":\"b\"}\n");
        assert_eq!(buffer.next_line().unwrap(), b"{\"text\":\"b\"}".to_vec());
        assert!(buffer.take_rest().is_empty());
    }

    #[test]
    fn overlong_line_is_dropped_through_its_newline() {
        let mut buffer = LineBuffer::with_limit(16);
        buffer.push(b"{\"text\":\"");
        buffer.push(&[b'x'; 64]);
        assert!(buffer.pending.len() <= 16);
        assert!(buffer.next_line().is_none());

        buffer.push(b"xxxx\"}\n{\"text\":\"ok\"}\n");
        assert_eq!(buffer.next_line().unwrap(), b"{\"text\":\"ok\"}".to_vec());
        assert!(buffer.next_line().is_none());

        buffer.push(b"{\"text\":\"much too long here\"}\n");
        assert!(buffer.next_line().unwrap().is_empty());
    }

    #[test]
    fn keep_alives_and_garbage_are_skipped() {
        assert!(parse_event(b"").is_none());
        assert!(parse_event(b"\r").is_none());
        assert!(parse_event(b"not json").is_none());
        assert_eq!(parse_event(b"{\"text\":\"cat\"}\r").unwrap().text, "cat");
    }
}
