//! `multipart/related` frame parser.
//!
//! A frame request answers with one body packing several binary parts behind a
//! boundary token. Each part carries:
//!
//! ```text
//! --BOUNDARY\r\n
//! Content-Type: image/jpeg; transfer-syntax=1.2.840.10008.1.2.4.50\r\n
//! Content-Location: .../instances/1.2.3/frames/7\r\n
//! \r\n
//! <body bytes>\r\n
//! --BOUNDARY--
//! ```
//!
//! Two entry points share the part grammar:
//! - [`parse_multipart`] for a fully buffered body,
//! - [`MultipartStream`] for bodies arriving over many network reads.
//!
//! Delimiters are located with Boyer-Moore-Horspool so multi-megabyte bodies
//! are scanned once. Parts with a malformed header or without a frame number
//! are skipped. Output follows buffer order, not frame order.

use log::{debug, trace};

const CRLF: &[u8] = b"\r\n";
const HEADER_END: &[u8] = b"\r\n\r\n";

/// One parsed unit of a multipart frame response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramePart {
    /// 1-based frame number taken from `Content-Location`
    pub frame_number: u32,
    pub bytes: Vec<u8>,
    pub content_type: String,
    /// Codec identifier from a `transfer-syntax=` / `codec=` content-type parameter
    pub codec_id: Option<String>,
}

/// Extract the `boundary=` parameter from a `Content-Type` header value.
pub fn boundary_from_content_type(value: &str) -> Option<String> {
    value.split(';').skip(1).find_map(|param| {
        let (name, val) = param.split_once('=')?;
        if !name.trim().eq_ignore_ascii_case("boundary") {
            return None;
        }
        let token = val.trim().trim_matches('"');
        (!token.is_empty()).then(|| token.to_string())
    })
}

/// Exact byte-sequence finder using the Boyer-Moore-Horspool skip table.
#[derive(Debug, Clone)]
pub(crate) struct Horspool {
    needle: Vec<u8>,
    skip: [usize; 256],
}

impl Horspool {
    pub fn new(needle: &[u8]) -> Self {
        let m = needle.len();
        let mut skip = [m.max(1); 256];
        for (i, &b) in needle.iter().enumerate().take(m.saturating_sub(1)) {
            skip[b as usize] = m - 1 - i;
        }
        Self { needle: needle.to_vec(), skip }
    }

    pub fn len(&self) -> usize {
        self.needle.len()
    }

    /// First match starting at or after `from`.
    pub fn find(&self, hay: &[u8], from: usize) -> Option<usize> {
        let m = self.needle.len();
        if m == 0 || hay.len() < m {
            return None;
        }
        let last = m - 1;
        let mut pos = from;
        while pos + m <= hay.len() {
            let c = hay[pos + last];
            if c == self.needle[last] && hay[pos..pos + last] == self.needle[..last] {
                return Some(pos);
            }
            pos += self.skip[c as usize];
        }
        None
    }
}

fn find_bytes(hay: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from >= hay.len() {
        return None;
    }
    hay[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

/// Outcome of a delimiter search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scan {
    Found(usize),
    /// Candidate at this offset needs more bytes before it can be judged
    Pending(usize),
    NotFound,
}

/// Next real delimiter at or after `from`.
///
/// A delimiter starts a line (offset 0 when `at_line_start`, otherwise right
/// after CRLF) and is followed by `--`, whitespace or a line break. At `eof`
/// a candidate with nothing after it counts as found.
fn find_delimiter(finder: &Horspool, buf: &[u8], from: usize, at_line_start: bool, eof: bool) -> Scan {
    let m = finder.len();
    let mut from = from;
    while let Some(p) = finder.find(buf, from) {
        let line_start = (p == 0 && at_line_start) || (p >= 2 && &buf[p - 2..p] == CRLF);
        if line_start {
            match buf.get(p + m).copied() {
                None if eof => return Scan::Found(p),
                None => return Scan::Pending(p),
                Some(b'-') => match buf.get(p + m + 1).copied() {
                    Some(b'-') => return Scan::Found(p),
                    None if !eof => return Scan::Pending(p),
                    _ => {}
                },
                Some(b'\r' | b'\n' | b' ' | b'\t') => return Scan::Found(p),
                Some(_) => {}
            }
        }
        from = p + 1;
    }
    Scan::NotFound
}

/// Last path segment of a `Content-Location`, as a 1-based frame number.
fn frame_number_from_location(location: &str) -> Option<u32> {
    let path = location.split(['?', '#']).next()?;
    let segment = path.trim_end_matches('/').rsplit('/').next()?;
    segment.trim().parse::<u32>().ok().filter(|&n| n >= 1)
}

fn split_content_type(value: &str) -> (String, Option<String>) {
    let mut params = value.split(';');
    let media_type = params.next().unwrap_or_default().trim().to_string();
    let codec = params.find_map(|param| {
        let (name, val) = param.split_once('=')?;
        let name = name.trim();
        if name.eq_ignore_ascii_case("transfer-syntax") || name.eq_ignore_ascii_case("codec") {
            let val = val.trim().trim_matches('"');
            (!val.is_empty()).then(|| val.to_string())
        } else {
            None
        }
    });
    (media_type, codec)
}

/// Parse one part: header block, blank line, body (trailing CRLF dropped).
///
/// Returns None if the header block is incomplete, not text, or lacks a frame number.
fn parse_part(segment: &[u8]) -> Option<FramePart> {
    let (header_block, body_start) = if segment.starts_with(CRLF) {
        (&segment[..0], CRLF.len())
    } else {
        let end = find_bytes(segment, HEADER_END, 0)?;
        (&segment[..end], end + HEADER_END.len())
    };

    let Ok(headers) = std::str::from_utf8(header_block) else {
        debug!("Skipping part: header block is not text");
        return None;
    };

    let mut frame_number = None;
    let mut content_type = String::from("application/octet-stream");
    let mut codec_id = None;

    for line in headers.split("\r\n").filter(|l| !l.trim().is_empty()) {
        let Some((name, value)) = line.split_once(':') else {
            debug!("Skipping part: malformed header line {:?}", line);
            return None;
        };
        let name = name.trim();
        if name.eq_ignore_ascii_case("content-location") {
            frame_number = frame_number_from_location(value.trim());
        } else if name.eq_ignore_ascii_case("content-type") {
            (content_type, codec_id) = split_content_type(value);
        }
    }

    let Some(frame_number) = frame_number else {
        debug!("Skipping part without frame number");
        return None;
    };

    let mut body = &segment[body_start.min(segment.len())..];
    if body.ends_with(CRLF) {
        body = &body[..body.len() - CRLF.len()];
    }

    Some(FramePart {
        frame_number,
        bytes: body.to_vec(),
        content_type,
        codec_id,
    })
}

/// Parse a fully buffered multipart body.
///
/// A body that ends without the terminal `--boundary--` still yields its last
/// part when that part's header block is complete (see [`MultipartStream::finish`]).
pub fn parse_multipart(body: &[u8], boundary: &str) -> Vec<FramePart> {
    let delimiter = format!("--{}", boundary);
    let finder = Horspool::new(delimiter.as_bytes());
    let m = finder.len();

    let mut positions = Vec::new();
    let mut from = 0;
    while let Scan::Found(p) = find_delimiter(&finder, body, from, true, true) {
        positions.push(p);
        from = p + m;
    }

    let mut parts = Vec::new();
    for (i, &p) in positions.iter().enumerate() {
        if body[p + m..].starts_with(b"--") {
            break;
        }
        let Some(line_end) = find_bytes(body, CRLF, p + m) else {
            break;
        };
        let start = line_end + CRLF.len();
        let end = positions.get(i + 1).copied().unwrap_or(body.len()).max(start);
        if let Some(part) = parse_part(&body[start..end]) {
            parts.push(part);
        }
    }

    trace!("Parsed {} parts from {} byte body", parts.len(), body.len());
    parts
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    /// Skipping preamble until the first delimiter
    Preamble,
    /// Buffer starts with a delimiter whose line is not yet complete
    AtDelimiter,
    /// Buffer holds the current part's bytes
    InPart,
    /// Terminal delimiter seen; everything else is epilogue
    Done,
}

/// Incremental multipart parser fed with arbitrary network reads.
///
/// A part is emitted only once the delimiter that closes its body has been
/// located. Only the unconsumed tail of the stream is retained.
#[derive(Debug)]
pub struct MultipartStream {
    finder: Horspool,
    buf: Vec<u8>,
    state: StreamState,
    /// Part-body offset below which no delimiter can start
    scan_from: usize,
    /// Preamble buffer begins at the start of a line
    preamble_line_start: bool,
}

impl MultipartStream {
    pub fn new(boundary: &str) -> Self {
        let delimiter = format!("--{}", boundary);
        Self {
            finder: Horspool::new(delimiter.as_bytes()),
            buf: Vec::new(),
            state: StreamState::Preamble,
            scan_from: 0,
            preamble_line_start: true,
        }
    }

    /// True once the terminal delimiter has been consumed.
    pub fn is_done(&self) -> bool {
        self.state == StreamState::Done
    }

    /// Bytes currently held waiting for a delimiter.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Feed one chunk, returning every part completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<FramePart> {
        let mut parts = Vec::new();
        if self.state == StreamState::Done {
            return parts;
        }
        self.buf.extend_from_slice(chunk);
        let m = self.finder.len();

        loop {
            match self.state {
                StreamState::Preamble => {
                    match find_delimiter(&self.finder, &self.buf, 0, self.preamble_line_start, false) {
                        Scan::Found(p) => {
                            self.buf.drain(..p);
                            self.state = StreamState::AtDelimiter;
                        }
                        Scan::Pending(p) => {
                            self.buf.drain(..p);
                            self.preamble_line_start = true;
                            break;
                        }
                        Scan::NotFound => {
                            // Keep enough to judge a delimiter straddling the next read
                            let keep = (m + 1).min(self.buf.len());
                            let cut = self.buf.len() - keep;
                            if cut > 0 {
                                self.buf.drain(..cut);
                                self.preamble_line_start = false;
                            }
                            break;
                        }
                    }
                }
                StreamState::AtDelimiter => {
                    if self.buf.len() < m + 2 {
                        break;
                    }
                    if &self.buf[m..m + 2] == b"--" {
                        self.state = StreamState::Done;
                        self.buf.clear();
                        break;
                    }
                    match find_bytes(&self.buf, CRLF, m) {
                        Some(line_end) => {
                            self.buf.drain(..line_end + CRLF.len());
                            self.state = StreamState::InPart;
                            self.scan_from = 0;
                        }
                        None => break,
                    }
                }
                StreamState::InPart => match find_delimiter(&self.finder, &self.buf, self.scan_from, true, false) {
                    Scan::Found(q) => {
                        if let Some(part) = parse_part(&self.buf[..q]) {
                            parts.push(part);
                        }
                        self.buf.drain(..q);
                        self.state = StreamState::AtDelimiter;
                    }
                    Scan::Pending(q) => {
                        self.scan_from = q;
                        break;
                    }
                    Scan::NotFound => {
                        self.scan_from = self.buf.len().saturating_sub(m.saturating_sub(1));
                        break;
                    }
                },
                StreamState::Done => break,
            }
        }

        parts
    }

    /// Signal end of stream.
    ///
    /// Without a terminal delimiter the in-flight part is emitted if its header
    /// block was fully received. This is a best-effort relaxation for servers
    /// that omit `--boundary--`; a body truncated mid-part is emitted short.
    pub fn finish(&mut self) -> Vec<FramePart> {
        let mut parts = Vec::new();
        if self.state == StreamState::InPart && !self.buf.is_empty() {
            // A delimiter left pending on its trailing bytes still closes the part
            let end = match find_delimiter(&self.finder, &self.buf, self.scan_from, true, true) {
                Scan::Found(q) => q,
                _ => self.buf.len(),
            };
            if let Some(part) = parse_part(&self.buf[..end]) {
                debug!(
                    "Stream ended without terminal boundary, emitting frame {}",
                    part.frame_number
                );
                parts.push(part);
            }
        }
        self.buf.clear();
        self.state = StreamState::Done;
        parts
    }
}

#[cfg(test)]
pub(crate) fn build_body(boundary: &str, parts: &[(u32, &[u8], &str)], terminal: bool) -> Vec<u8> {
    let mut body = Vec::new();
    for (n, bytes, ct) in parts {
        body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
        body.extend_from_slice(format!("Content-Type: {}\r\n", ct).as_bytes());
        body.extend_from_slice(
            format!("Content-Location: /studies/1/series/2/instances/3/frames/{}\r\n\r\n", n)
                .as_bytes(),
        );
        body.extend_from_slice(bytes);
        body.extend_from_slice(b"\r\n");
    }
    if terminal {
        body.extend_from_slice(format!("--{}--\r\n", boundary).as_bytes());
    }
    body
}
