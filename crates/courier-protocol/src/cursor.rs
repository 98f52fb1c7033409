//! Cursor tokens for Courier subscriptions.
//!
//! A cursor records, per topic, the id of the last message a subscriber has
//! seen. It is handed to clients as a single opaque string so that a
//! reconnecting client can resume exactly where it left off.
//!
//! The encoded format is:
//!
//! ```text
//! escape(key) "," HEX16(id) [ "|" escape(key) "," HEX16(id) ]*
//! ```
//!
//! `HEX16` is the id as exactly 16 uppercase hexadecimal digits, so for a
//! given key the lexicographic order of encoded segments matches the numeric
//! order of ids. The characters `\`, `|` and `,` inside keys are escaped with
//! a leading `\`.

use std::borrow::Cow;
use std::fmt::Write as _;
use thiserror::Error;

/// Separates a key from its id inside a segment.
pub const KEY_SEPARATOR: char = ',';

/// Separates segments.
pub const SEGMENT_SEPARATOR: char = '|';

/// Escape prefix for reserved characters in keys.
pub const ESCAPE: char = '\\';

/// Number of hex digits used for an encoded id.
pub const ID_WIDTH: usize = 16;

/// Errors produced while decoding a cursor token.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CursorError {
    /// A segment has no `,` between key and id.
    #[error("Cursor segment {segment} has no key separator")]
    MissingSeparator {
        /// Zero-based index of the offending segment.
        segment: usize,
    },

    /// The id part of a segment is not 1 to 16 hex digits.
    #[error("Invalid cursor id {id:?} in segment {segment}")]
    InvalidId {
        /// Zero-based index of the offending segment.
        segment: usize,
        /// The raw id text.
        id: String,
    },

    /// The token ends in the middle of an escape sequence.
    #[error("Cursor ends with a dangling escape")]
    DanglingEscape,
}

/// A decoded (topic key, last seen id) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CursorPosition {
    /// Topic key, unescaped.
    pub key: String,
    /// Id of the last message seen on the topic.
    pub id: u64,
}

impl CursorPosition {
    /// Create a new cursor position.
    #[must_use]
    pub fn new(key: impl Into<String>, id: u64) -> Self {
        Self {
            key: key.into(),
            id,
        }
    }
}

fn is_reserved(ch: char) -> bool {
    ch == ESCAPE || ch == SEGMENT_SEPARATOR || ch == KEY_SEPARATOR
}

/// Escape the reserved characters of a topic key.
///
/// Borrows the input when nothing needs escaping.
#[must_use]
pub fn escape(key: &str) -> Cow<'_, str> {
    if !key.chars().any(is_reserved) {
        return Cow::Borrowed(key);
    }

    let mut escaped = String::with_capacity(key.len() + 4);
    for ch in key.chars() {
        if is_reserved(ch) {
            escaped.push(ESCAPE);
        }
        escaped.push(ch);
    }
    Cow::Owned(escaped)
}

/// Reverse [`escape`].
///
/// # Errors
///
/// Returns [`CursorError::DanglingEscape`] if the input ends with a lone `\`.
pub fn unescape(escaped: &str) -> Result<String, CursorError> {
    let mut out = String::with_capacity(escaped.len());
    let mut chars = escaped.chars();
    while let Some(ch) = chars.next() {
        if ch == ESCAPE {
            let next = chars.next().ok_or(CursorError::DanglingEscape)?;
            out.push(next);
        } else {
            out.push(ch);
        }
    }
    Ok(out)
}

/// Incremental cursor encoder.
///
/// Callers that cache escaped keys can push them directly with
/// [`CursorWriter::push_escaped`] and skip re-escaping on every encode.
#[derive(Debug, Default)]
pub struct CursorWriter {
    buf: String,
    segments: usize,
}

impl CursorWriter {
    /// Create an empty writer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a writer sized for `segments` cursors with short keys.
    #[must_use]
    pub fn with_capacity(segments: usize) -> Self {
        Self {
            buf: String::with_capacity(segments * (ID_WIDTH + 16)),
            segments: 0,
        }
    }

    /// Append a segment for an unescaped key.
    pub fn push(&mut self, key: &str, id: u64) {
        let escaped = escape(key);
        self.push_escaped(&escaped, id);
    }

    /// Append a segment for a key that is already escaped.
    pub fn push_escaped(&mut self, escaped_key: &str, id: u64) {
        if self.segments > 0 {
            self.buf.push(SEGMENT_SEPARATOR);
        }
        self.buf.push_str(escaped_key);
        self.buf.push(KEY_SEPARATOR);
        // Writing into a String cannot fail.
        let _ = write!(self.buf, "{:016X}", id);
        self.segments += 1;
    }

    /// Number of segments written so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.segments
    }

    /// Whether no segment has been written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.segments == 0
    }

    /// Return the encoded token.
    #[must_use]
    pub fn finish(self) -> String {
        self.buf
    }
}

/// Encode every cursor, including those still at id 0.
#[must_use]
pub fn encode(cursors: &[CursorPosition]) -> String {
    let mut writer = CursorWriter::with_capacity(cursors.len());
    for cursor in cursors {
        writer.push(&cursor.key, cursor.id);
    }
    writer.finish()
}

/// Encode only the cursors that have advanced past id 0.
///
/// Produces the compact form used for diff cursors. [`decode`] reads both
/// forms.
#[must_use]
pub fn encode_updated(cursors: &[CursorPosition]) -> String {
    let mut writer = CursorWriter::with_capacity(cursors.len());
    for cursor in cursors.iter().filter(|c| c.id != 0) {
        writer.push(&cursor.key, cursor.id);
    }
    writer.finish()
}

fn parse_id(segment: usize, raw: &str) -> Result<u64, CursorError> {
    let valid = !raw.is_empty()
        && raw.len() <= ID_WIDTH
        && raw.bytes().all(|b| b.is_ascii_hexdigit());
    if !valid {
        return Err(CursorError::InvalidId {
            segment,
            id: raw.to_string(),
        });
    }
    u64::from_str_radix(raw, 16).map_err(|_| CursorError::InvalidId {
        segment,
        id: raw.to_string(),
    })
}

fn finish_segment(
    segment: usize,
    key: Option<String>,
    id: &str,
) -> Result<CursorPosition, CursorError> {
    let key = key.ok_or(CursorError::MissingSeparator { segment })?;
    Ok(CursorPosition {
        key,
        id: parse_id(segment, id)?,
    })
}

/// Decode a cursor token into its ordered list of positions.
///
/// An empty token decodes to an empty list. The last segment does not need a
/// trailing `|`, and a trailing `|` does not produce an extra entry.
///
/// # Errors
///
/// Returns a [`CursorError`] if the token is malformed.
pub fn decode(token: &str) -> Result<Vec<CursorPosition>, CursorError> {
    let mut cursors = Vec::new();
    let mut buf = String::new();
    let mut key: Option<String> = None;
    let mut escaping = false;

    for ch in token.chars() {
        if escaping {
            buf.push(ch);
            escaping = false;
            continue;
        }

        match ch {
            ESCAPE => escaping = true,
            KEY_SEPARATOR if key.is_none() => key = Some(std::mem::take(&mut buf)),
            SEGMENT_SEPARATOR => {
                cursors.push(finish_segment(cursors.len(), key.take(), &buf)?);
                buf.clear();
            }
            _ => buf.push(ch),
        }
    }

    if escaping {
        return Err(CursorError::DanglingEscape);
    }

    if key.is_some() || !buf.is_empty() {
        cursors.push(finish_segment(cursors.len(), key, &buf)?);
    }

    Ok(cursors)
}
