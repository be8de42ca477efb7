//! The EventSocket wire frame: an ordered header block plus an opaque body.

use std::fmt;

use bytes::Bytes;
use percent_encoding::percent_decode_str;

use crate::error::{Error, Result};

/// A single EventSocket header/value pair, in the order it was parsed.
#[derive(Clone, Debug, PartialEq, Eq)]
struct Entry {
    name: String,
    value: String,
}

/// An ordered, case-insensitive header map.
///
/// Lookups compare names ASCII-case-insensitively; the original case of
/// the name, as first inserted, is preserved for iteration and
/// serialization. Entries keep insertion order, matching the order
/// FreeSWITCH sent them in.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: Vec<Entry>,
}

impl HeaderMap {
    /// An empty header map.
    pub fn new() -> HeaderMap {
        HeaderMap::default()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.name.eq_ignore_ascii_case(name))
    }

    /// Look up a header value by name, case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.position(name).map(|i| self.entries[i].value.as_str())
    }

    /// Insert or overwrite a header. The last write for a given
    /// (case-insensitive) name wins, per the wire format's invariants.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.position(&name) {
            Some(i) => self.entries[i] = Entry { name, value },
            None => self.entries.push(Entry { name, value }),
        }
    }

    /// True if a header with this name (case-insensitive) is present.
    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    /// Number of headers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if there are no headers.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate headers in insertion order as `(name, value)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|e| (e.name.as_str(), e.value.as_str()))
    }

    /// URL-percent-decode every header value in place.
    ///
    /// FreeSWITCH URL-encodes header values on `CUSTOM` events and on the
    /// outbound channel-info frame; this undoes that encoding.
    pub fn decode_url_values(&mut self) {
        for entry in &mut self.entries {
            if let Ok(decoded) = percent_decode_str(&entry.value).decode_utf8() {
                entry.value = decoded.into_owned();
            }
        }
    }

    pub(crate) fn content_length(&self) -> Result<usize> {
        match self.get("Content-Length") {
            None => Ok(0),
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|_| Error::protocol("invalid Content-Length header")),
        }
    }
}

/// A complete EventSocket frame: headers plus an opaque body.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Message {
    /// The frame's headers.
    pub headers: HeaderMap,
    /// The frame's body. Empty unless `Content-Length` was present and
    /// non-zero.
    pub body: Bytes,
}

impl Message {
    /// Build a message from headers and a body.
    pub fn new(headers: HeaderMap, body: Bytes) -> Message {
        Message { headers, body }
    }

    /// Convenience accessor over `self.headers.get`.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// The value of `Content-Type`, if present.
    pub fn content_type(&self) -> Option<&str> {
        self.header("Content-Type")
    }

    /// URL-percent-decode every header value in place.
    pub fn decode_url_values(&mut self) {
        self.headers.decode_url_values();
    }

    /// Parse a header block beginning at the start of `buf`.
    ///
    /// Returns `Ok(None)` if `buf` does not yet contain a complete,
    /// blank-line-terminated header block (more bytes are needed).
    /// On success, returns the parsed headers and the number of bytes
    /// consumed, including the terminating blank line.
    pub(crate) fn parse_head(buf: &[u8]) -> Result<Option<(HeaderMap, usize)>> {
        let terminator = match find_double_newline(buf) {
            Some(pos) => pos,
            None => return Ok(None),
        };
        let block = &buf[..terminator];
        let headers = parse_header_lines(block)?;
        Ok(Some((headers, terminator + 2)))
    }

    /// Parse a frame that is already known to be fully present in `buf`
    /// (used to unwrap the nested event carried in a `text/event-plain`
    /// body, which is read whole before this is ever called).
    pub(crate) fn parse_complete(buf: &[u8]) -> Result<Message> {
        let (headers, head_len) = Message::parse_head(buf)?
            .ok_or_else(|| Error::protocol("incomplete nested event frame"))?;
        let content_length = headers.content_length()?;
        let body_start = head_len;
        let body_end = body_start + content_length;
        if buf.len() < body_end {
            return Err(Error::protocol("nested event frame body shorter than Content-Length"));
        }
        let body = Bytes::copy_from_slice(&buf[body_start..body_end]);
        Ok(Message::new(headers, body))
    }

    pub(crate) fn content_length(&self) -> Result<usize> {
        self.headers.content_length()
    }

    /// Serialize this message for the wire: one `Name: Value\n` line per
    /// header, in order, never folded, a terminating blank line, then the
    /// body verbatim.
    pub(crate) fn serialize(&self) -> Bytes {
        let mut out = Vec::with_capacity(64 + self.body.len());
        for (name, value) in self.headers.iter() {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.push(b'\n');
        }
        out.push(b'\n');
        out.extend_from_slice(&self.body);
        Bytes::from(out)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in self.headers.iter() {
            writeln!(f, "{}: {}", name, value)?;
        }
        Ok(())
    }
}

fn find_double_newline(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\n\n")
}

/// Parse an RFC-5322-style header block: one header per line, continuation
/// lines (leading space or tab) folded into the previous header's value.
/// This unfolding applies to incoming frames only — outgoing serialization
/// never folds (see `Message::serialize`).
fn parse_header_lines(block: &[u8]) -> Result<HeaderMap> {
    let text = std::str::from_utf8(block).map_err(|_| Error::protocol("header block is not valid UTF-8"))?;
    let mut headers = HeaderMap::new();
    let mut last_name: Option<String> = None;

    for line in text.split('\n') {
        if line.is_empty() {
            continue;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            // Continuation of the previous header's value.
            if let Some(ref name) = last_name {
                let existing = headers.get(name).unwrap_or_default().to_string();
                let folded = format!("{} {}", existing, line.trim());
                headers.insert(name.clone(), folded);
            }
            continue;
        }
        let mut parts = line.splitn(2, ':');
        let name = parts
            .next()
            .ok_or_else(|| Error::protocol("header line missing name"))?;
        let value = parts.next().unwrap_or("").trim_start_matches(' ');
        headers.insert(name.to_string(), value.to_string());
        last_name = Some(name.to_string());
    }

    Ok(headers)
}
