//! Incremental newline splitter for a streamed log body.
//!
//! Chunks arrive with arbitrary boundaries; bytes after the last `\n` are
//! carried over until the next chunk completes them. Empty lines are
//! dropped and every emitted line must be valid UTF-8.

/// A line that could not be decoded as UTF-8.
#[derive(Debug)]
pub struct LineDecodeError {
    /// 1-based index of the offending line among all lines seen, blank ones included.
    pub line: u64,
    pub source: std::str::Utf8Error,
}

impl std::fmt::Display for LineDecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "log line {} is not valid UTF-8: {}", self.line, self.source)
    }
}

impl std::error::Error for LineDecodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

#[derive(Debug, Default)]
pub struct LineDecoder {
    pending: Vec<u8>,
    /// Start of the first line not yet handed out.
    read: usize,
    /// Bytes before this offset are known to hold no newline.
    scanned: usize,
    lines_seen: u64,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one chunk of the body.
    pub fn push(&mut self, chunk: &[u8]) {
        if self.read > 0 {
            self.pending.drain(..self.read);
            self.scanned -= self.read;
            self.read = 0;
        }
        self.pending.extend_from_slice(chunk);
    }

    /// Take the next complete non-empty line, or `None` until more bytes arrive.
    pub fn next_line(&mut self) -> Option<Result<String, LineDecodeError>> {
        loop {
            let from = self.scanned.max(self.read);
            let Some(offset) = self.pending[from..].iter().position(|&b| b == b'\n') else {
                self.scanned = self.pending.len();
                return None;
            };
            let end = from + offset;
            let start = self.read;
            self.read = end + 1;
            self.scanned = self.read;

            self.lines_seen += 1;
            match decode(&self.pending[start..end], self.lines_seen) {
                Ok(None) => continue,
                Ok(Some(line)) => return Some(Ok(line)),
                Err(e) => return Some(Err(e)),
            }
        }
    }

    /// Flush the trailing partial line once the stream has ended.
    pub fn finish(&mut self) -> Result<Option<String>, LineDecodeError> {
        if self.pending_len() == 0 {
            return Ok(None);
        }
        let raw = std::mem::take(&mut self.pending);
        let start = self.read;
        self.read = 0;
        self.scanned = 0;
        self.lines_seen += 1;
        decode(&raw[start..], self.lines_seen)
    }

    /// Bytes buffered waiting for a newline.
    pub fn pending_len(&self) -> usize {
        self.pending.len() - self.read
    }
}

fn decode(raw: &[u8], line: u64) -> Result<Option<String>, LineDecodeError> {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    if raw.is_empty() {
        return Ok(None);
    }
    match std::str::from_utf8(raw) {
        Ok(s) => Ok(Some(s.to_string())),
        Err(e) => Err(LineDecodeError { line, source: e }),
    }
}
