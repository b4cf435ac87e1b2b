//! Prompt-marker framing
//!
//! Imposes request/response framing on the unstructured byte stream of an
//! interactive shell. The shell's prompt is set to a sentinel marker; every
//! byte read before the marker reappears belongs to the command that was just
//! written. Each wait ends in exactly one of three states:
//! - `Matched`: the marker was observed
//! - `TimedOut`: the deadline passed first
//! - `StreamClosed`: the process side of the terminal went away first

use std::time::{Duration, Instant};
use thiserror::Error;

/// Shortest accepted prompt marker
pub const MIN_MARKER_LEN: usize = 4;

/// Characters that shells expand or interpret inside PS1
const FORBIDDEN_MARKER_CHARS: &[char] = &['\\', '$', '`', '!', '%', '\'', '"', '\n', '\r', '\0'];

/// Errors raised while building a prompt marker
#[derive(Error, Debug, PartialEq, Eq)]
pub enum FramerError {
    #[error("prompt marker must be at least 4 characters, got {0}")]
    MarkerTooShort(usize),

    #[error("prompt marker contains forbidden character {0:?}")]
    ForbiddenCharacter(char),
}

/// Result type for framer operations
pub type FramerResult<T> = Result<T, FramerError>;

/// Sentinel string installed as the shell prompt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptMarker {
    text: String,
}

impl PromptMarker {
    /// Validate and wrap a marker string
    pub fn new(text: impl Into<String>) -> FramerResult<Self> {
        let text = text.into();
        let len = text.chars().count();
        if len < MIN_MARKER_LEN {
            return Err(FramerError::MarkerTooShort(len));
        }
        if let Some(c) = text.chars().find(|c| FORBIDDEN_MARKER_CHARS.contains(c)) {
            return Err(FramerError::ForbiddenCharacter(c));
        }
        Ok(Self { text })
    }

    /// The marker text
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// The marker bytes as they appear on the terminal
    pub fn as_bytes(&self) -> &[u8] {
        self.text.as_bytes()
    }

    /// Shell line that disables echo and installs the marker as the prompt
    ///
    /// The marker is written as two adjacent quoted halves so the terminal's
    /// echo of this line never contains the marker itself.
    pub fn init_command(&self) -> String {
        let split = self
            .text
            .char_indices()
            .nth(self.text.chars().count() / 2)
            .map(|(i, _)| i)
            .unwrap_or(0);
        let (head, tail) = self.text.split_at(split);
        format!(
            "stty -echo 2>/dev/null; unset PROMPT_COMMAND 2>/dev/null; \
             bind 'set enable-bracketed-paste off' 2>/dev/null; \
             PS1='{head}''{tail}'; PS2=''; export PS1 PS2"
        )
    }
}

/// One read from a byte source
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadEvent {
    /// Bytes arrived
    Data(Vec<u8>),
    /// The deadline passed with nothing to read
    TimedOut,
    /// The source is exhausted and will never produce more bytes
    Closed,
}

/// A blocking source of terminal bytes
pub trait ByteSource {
    /// Block until bytes arrive, the deadline passes, or the source closes
    fn recv_until(&mut self, deadline: Instant) -> ReadEvent;
}

/// Where the framer is in its current wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    AwaitingMarker,
    Matched,
    TimedOut,
    StreamClosed,
}

/// Text captured for one frame
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Captured {
    /// Output with escape sequences and carriage returns removed
    pub text: String,
    /// Whether output beyond the capture limit was dropped
    pub truncated: bool,
}

/// Outcome of waiting for the marker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Matched(Captured),
    TimedOut(Captured),
    StreamClosed(Captured),
}

impl Frame {
    /// The framer state this outcome corresponds to
    #[cfg(test)]
    pub fn state(&self) -> FrameState {
        match self {
            Frame::Matched(_) => FrameState::Matched,
            Frame::TimedOut(_) => FrameState::TimedOut,
            Frame::StreamClosed(_) => FrameState::StreamClosed,
        }
    }
}

/// Splits a terminal byte stream into marker-delimited frames
#[derive(Debug)]
pub struct Framer {
    marker: PromptMarker,
    buffer: Vec<u8>,
    limit: usize,
    truncated: bool,
    state: FrameState,
}

impl Framer {
    /// Create a framer keeping at most `limit` bytes of output per frame
    pub fn new(marker: PromptMarker, limit: usize) -> Self {
        Self {
            marker,
            buffer: Vec::new(),
            limit,
            truncated: false,
            state: FrameState::AwaitingMarker,
        }
    }

    /// State reached by the most recent wait
    pub fn state(&self) -> FrameState {
        self.state
    }

    /// Number of buffered bytes not yet assigned to a frame
    #[cfg(test)]
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Drop buffered bytes, returning how many were discarded
    pub fn discard(&mut self) -> usize {
        let dropped = self.buffer.len();
        self.buffer.clear();
        self.truncated = false;
        dropped
    }

    /// Append bytes and return the completed frame if the marker is now present
    pub fn feed(&mut self, chunk: &[u8]) -> Option<Captured> {
        self.buffer.extend_from_slice(chunk);

        let marker_len = self.marker.as_bytes().len();
        match find(&self.buffer, self.marker.as_bytes()) {
            Some(pos) => {
                let rest = self.buffer.split_off(pos + marker_len);
                self.buffer.truncate(pos);
                let output = std::mem::replace(&mut self.buffer, rest);
                self.state = FrameState::Matched;
                Some(self.capture(output))
            }
            None => {
                // Keep the head up to the limit and enough of the tail to
                // match a marker split across reads.
                if self.buffer.len() > self.limit + marker_len {
                    let tail_start = self.buffer.len() - marker_len;
                    self.buffer.drain(self.limit..tail_start);
                    self.truncated = true;
                }
                None
            }
        }
    }

    /// Block until the marker appears, the timeout elapses, or the source closes
    pub fn expect<S: ByteSource + ?Sized>(&mut self, source: &mut S, timeout: Duration) -> Frame {
        self.state = FrameState::AwaitingMarker;
        if let Some(captured) = self.feed(&[]) {
            return Frame::Matched(captured);
        }

        let deadline = Instant::now() + timeout;
        loop {
            match source.recv_until(deadline) {
                ReadEvent::Data(chunk) => {
                    if let Some(captured) = self.feed(&chunk) {
                        return Frame::Matched(captured);
                    }
                }
                ReadEvent::TimedOut => {
                    self.state = FrameState::TimedOut;
                    return Frame::TimedOut(self.take_partial());
                }
                ReadEvent::Closed => {
                    self.state = FrameState::StreamClosed;
                    return Frame::StreamClosed(self.take_partial());
                }
            }
        }
    }

    fn take_partial(&mut self) -> Captured {
        let output = std::mem::take(&mut self.buffer);
        self.capture(output)
    }

    fn capture(&mut self, mut output: Vec<u8>) -> Captured {
        let truncated = std::mem::take(&mut self.truncated) || output.len() > self.limit;
        output.truncate(self.limit);
        Captured {
            text: clean_output(&output),
            truncated,
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Decode terminal bytes, dropping ANSI escape sequences and carriage returns
pub fn clean_output(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    let mut result = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\x1b' => match chars.peek() {
                Some('[') => {
                    chars.next();
                    // Parameter and intermediate bytes, then one final byte
                    while let Some(&next) = chars.peek() {
                        if ('\x20'..='\x3f').contains(&next) {
                            chars.next();
                        } else {
                            break;
                        }
                    }
                    if let Some(&next) = chars.peek() {
                        if ('\x40'..='\x7e').contains(&next) {
                            chars.next();
                        }
                    }
                }
                Some(']') => {
                    chars.next();
                    // OSC runs until BEL or ESC \
                    while let Some(c) = chars.next() {
                        if c == '\x07' {
                            break;
                        }
                        if c == '\x1b' && chars.peek() == Some(&'\\') {
                            chars.next();
                            break;
                        }
                    }
                }
                Some(_) => {
                    chars.next();
                }
                None => {}
            },
            '\r' => {}
            _ => result.push(c),
        }
    }

    result
}
