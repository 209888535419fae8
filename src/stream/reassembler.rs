//! Extraction of complete JSON records from an arbitrarily chunked byte stream.
//!
//! The upstream framing carries JSON payloads wrapped in binary envelopes with no
//! usable length prefix. Records are located by a small set of leading-token
//! patterns and delimited by a brace-depth scan that is aware of string literals
//! and backslash escapes. Every scan is resumable, so a record split across any
//! number of chunks is emitted exactly once, as soon as its closing brace arrives.

use memchr::memchr;
use serde_json::Value;

const COMPACT_THRESHOLD: usize = 8 * 1024;
const MAX_RECORD_BYTES: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone, Copy)]
enum Scan {
    /// Looking for the next `{` at or after `read_offset`.
    Outside,
    /// Inside a brace-delimited value starting at `start`.
    Value {
        start: usize,
        pos: usize,
        depth: u32,
        in_string: bool,
        escaped: bool,
        candidate: bool,
    },
}

enum Start {
    Candidate,
    Foreign,
    NeedMore,
}

enum Step {
    Complete { end: usize },
    /// The value can never complete; scanning resumes at `resume`.
    Abort { resume: usize },
    NeedMore,
}

/// Stateful accumulator turning raw chunks into complete JSON objects.
pub struct FragmentReassembler {
    patterns: &'static [&'static str],
    buffer: Vec<u8>,
    read_offset: usize,
    scan: Scan,
}

impl FragmentReassembler {
    /// `patterns` are the leading tokens of the records of interest, e.g. `{"content":`.
    #[must_use]
    pub fn new(patterns: &'static [&'static str]) -> Self {
        Self {
            patterns,
            buffer: Vec::with_capacity(4096),
            read_offset: 0,
            scan: Scan::Outside,
        }
    }

    /// Append `chunk` and return every record completed by it, in stream order.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Value> {
        let mut out = Vec::new();
        self.feed_into(chunk, &mut out);
        out
    }

    /// Append `chunk` and push completed records into a caller-provided buffer.
    pub fn feed_into(&mut self, chunk: &[u8], out: &mut Vec<Value>) {
        self.buffer.extend_from_slice(chunk);
        self.drive(false, out);
        self.compact();
    }

    /// Flush at end of input.
    ///
    /// Values still open are abandoned, and complete records nested in them
    /// are recovered in one pass over their bytes.
    pub fn finish(&mut self) -> Vec<Value> {
        let mut out = Vec::new();
        self.drive(true, &mut out);
        self.buffer.clear();
        self.read_offset = 0;
        self.scan = Scan::Outside;
        out
    }

    /// Bytes retained for a record not yet complete.
    #[must_use]
    pub fn buffered_len(&self) -> usize {
        self.buffer.len() - self.read_offset
    }

    fn drive(&mut self, eof: bool, out: &mut Vec<Value>) {
        loop {
            match self.scan {
                Scan::Outside => {
                    let Some(rel) = memchr(b'{', &self.buffer[self.read_offset..]) else {
                        self.read_offset = self.buffer.len();
                        return;
                    };
                    let start = self.read_offset + rel;
                    self.read_offset = start;
                    let candidate = match self.classify_start(start) {
                        Start::Candidate => true,
                        Start::Foreign => false,
                        Start::NeedMore if eof => {
                            self.read_offset = start + 1;
                            continue;
                        }
                        Start::NeedMore => return,
                    };
                    self.scan = Scan::Value {
                        start,
                        pos: start,
                        depth: 0,
                        in_string: false,
                        escaped: false,
                        candidate,
                    };
                }
                Scan::Value {
                    start, candidate, ..
                } => match self.step() {
                    Step::Complete { end } => {
                        if candidate {
                            if let Ok(value) =
                                serde_json::from_slice::<Value>(&self.buffer[start..=end])
                            {
                                if value.is_object() {
                                    out.push(value);
                                }
                            }
                        }
                        self.read_offset = end + 1;
                        self.scan = Scan::Outside;
                    }
                    Step::Abort { resume } => {
                        self.salvage(start + 1, resume, out);
                        self.read_offset = resume;
                        self.scan = Scan::Outside;
                    }
                    Step::NeedMore if eof => {
                        let end = self.buffer.len();
                        self.salvage(start + 1, end, out);
                        self.read_offset = end;
                        self.scan = Scan::Outside;
                    }
                    Step::NeedMore => return,
                },
            }
        }
    }

    fn classify_start(&self, start: usize) -> Start {
        let available = &self.buffer[start..];
        let mut undecided = false;
        for pattern in self.patterns {
            let pattern = pattern.as_bytes();
            if available.len() >= pattern.len() {
                if available.starts_with(pattern) {
                    return Start::Candidate;
                }
            } else if pattern.starts_with(available) {
                undecided = true;
            }
        }
        if undecided {
            Start::NeedMore
        } else {
            Start::Foreign
        }
    }

    fn step(&mut self) -> Step {
        let Scan::Value {
            start,
            mut pos,
            mut depth,
            mut in_string,
            mut escaped,
            candidate,
        } = self.scan
        else {
            return Step::Abort {
                resume: self.read_offset,
            };
        };

        let len = self.buffer.len();
        while pos < len {
            let byte = self.buffer[pos];
            if byte < 0x20 && !matches!(byte, b'\t' | b'\n' | b'\r') {
                return Step::Abort { resume: pos };
            }
            if in_string {
                if escaped {
                    escaped = false;
                } else if byte == b'\\' {
                    escaped = true;
                } else if byte == b'"' {
                    in_string = false;
                }
            } else {
                match byte {
                    b'"' => in_string = true,
                    b'{' => depth += 1,
                    b'}' => {
                        depth = depth.saturating_sub(1);
                        if depth == 0 {
                            return Step::Complete { end: pos };
                        }
                    }
                    _ => {}
                }
            }
            pos += 1;
        }

        if pos - start > MAX_RECORD_BYTES {
            tracing::warn!(
                bytes = pos - start,
                "reassembler: abandoning oversized record"
            );
            return Step::Abort { resume: pos };
        }

        self.scan = Scan::Value {
            start,
            pos,
            depth,
            in_string,
            escaped,
            candidate,
        };
        Step::NeedMore
    }

    /// Emit the outermost complete records inside `buffer[from..to]`, the
    /// interior of a value that will never close.
    ///
    /// Braces are matched with one stack, so each abandoned byte is visited once.
    fn salvage(&self, from: usize, to: usize, out: &mut Vec<Value>) {
        let mut open: Vec<usize> = Vec::new();
        // Closed spans not contained in a later closed span, in stream order.
        let mut closed: Vec<(usize, usize)> = Vec::new();
        let mut in_string = false;
        let mut escaped = false;
        for pos in from..to {
            let byte = self.buffer[pos];
            if open.is_empty() {
                if byte == b'{' {
                    open.push(pos);
                }
                continue;
            }
            if in_string {
                if escaped {
                    escaped = false;
                } else if byte == b'\\' {
                    escaped = true;
                } else if byte == b'"' {
                    in_string = false;
                }
                continue;
            }
            match byte {
                b'"' => in_string = true,
                b'{' => open.push(pos),
                b'}' => {
                    if let Some(begin) = open.pop() {
                        while closed.last().is_some_and(|&(inner, _)| inner > begin) {
                            closed.pop();
                        }
                        closed.push((begin, pos));
                    }
                }
                _ => {}
            }
        }
        for (begin, end) in closed {
            if !matches!(self.classify_start(begin), Start::Candidate) {
                continue;
            }
            if let Ok(value) = serde_json::from_slice::<Value>(&self.buffer[begin..=end]) {
                if value.is_object() {
                    out.push(value);
                }
            }
        }
    }

    fn compact(&mut self) {
        if self.read_offset == self.buffer.len() {
            self.buffer.clear();
            self.read_offset = 0;
            return;
        }
        let consumed = self.read_offset;
        let should_compact =
            consumed > 0 && (consumed >= self.buffer.len() / 2 || consumed >= COMPACT_THRESHOLD);
        if !should_compact {
            return;
        }
        self.buffer.drain(..consumed);
        self.read_offset = 0;
        if let Scan::Value { start, pos, .. } = &mut self.scan {
            *start -= consumed;
            *pos -= consumed;
        }
    }
}
