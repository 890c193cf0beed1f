//! Pipe-delimited text protocol spoken with gateway clients.
//!
//! Outbound: `ANNOUNCE|<id>|<author>|<title>|<content>|<createdAt>\n`
//! Inbound:  `POST|<author>|<title>|<content>\n`
//!
//! Fields are not escaped. `content` is always the last field, so it may
//! contain `|` itself.

use chrono::SecondsFormat;
use events::Announcement;
use log::*;
use std::fmt;
use std::sync::Arc;

const FRAME_DELIMITER: u8 = b'\n';
const FIELD_SEPARATOR: char = '|';
const ANNOUNCE_VERB: &str = "ANNOUNCE";
const POST_VERB: &str = "POST";

/// One encoded outbound frame. Cloning shares the underlying bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame(Arc<[u8]>);

impl Frame {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<String> for Frame {
    fn from(value: String) -> Self {
        Self(Arc::from(value.into_bytes()))
    }
}

impl From<&[u8]> for Frame {
    fn from(value: &[u8]) -> Self {
        Self(Arc::from(value))
    }
}

/// A validated command sent by a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Create a new announcement.
    Post {
        author: String,
        title: String,
        content: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    Empty,
    UnknownVerb(String),
    MissingFields,
    InvalidUtf8,
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CodecError::Empty => write!(f, "empty frame"),
            CodecError::UnknownVerb(verb) => write!(f, "unknown command verb '{verb}'"),
            CodecError::MissingFields => {
                write!(f, "expected POST|<author>|<title>|<content>")
            }
            CodecError::InvalidUtf8 => write!(f, "frame is not valid UTF-8"),
        }
    }
}

impl std::error::Error for CodecError {}

/// Encodes an announcement as a single newline-terminated frame.
pub fn encode_announcement(announcement: &Announcement) -> Frame {
    Frame::from(format!(
        "{ANNOUNCE_VERB}|{}|{}|{}|{}|{}\n",
        announcement.id,
        announcement.author,
        announcement.title,
        announcement.content,
        announcement
            .created_at
            .to_rfc3339_opts(SecondsFormat::AutoSi, true),
    ))
}

/// Parses one inbound line. At most four fields are split off, so pipes in
/// the content survive.
pub fn decode_command(line: &str) -> Result<Command, CodecError> {
    if line.is_empty() {
        return Err(CodecError::Empty);
    }

    let mut parts = line.splitn(4, FIELD_SEPARATOR);
    let verb = parts.next().unwrap_or_default();
    if !verb.eq_ignore_ascii_case(POST_VERB) {
        return Err(CodecError::UnknownVerb(verb.to_owned()));
    }

    match (parts.next(), parts.next(), parts.next()) {
        (Some(author), Some(title), Some(content)) => Ok(Command::Post {
            author: author.to_owned(),
            title: title.to_owned(),
            content: content.to_owned(),
        }),
        _ => Err(CodecError::MissingFields),
    }
}

/// What one [`FrameDecoder::push`] produced.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Decoded {
    pub frames: Vec<String>,
    /// Set when a complete frame could not be decoded. Nothing after that
    /// frame was decoded.
    pub error: Option<CodecError>,
}

/// Accumulates raw bytes from a stream and yields complete frames.
///
/// TCP has no message boundaries: one read may carry half a frame or
/// several. Bytes stay buffered until a delimiter arrives.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    max_frame_len: usize,
    // Set while skipping the tail of an oversized frame.
    discarding: bool,
}

impl FrameDecoder {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_frame_len,
            discarding: false,
        }
    }

    /// Feeds bytes in and returns every frame they completed, trimmed, in
    /// arrival order. Blank lines are skipped.
    ///
    /// Decoding stops at the first frame that is not valid UTF-8. Frames
    /// completed before it are still returned alongside the error.
    pub fn push(&mut self, bytes: &[u8]) -> Decoded {
        self.buf.extend_from_slice(bytes);

        let mut decoded = Decoded::default();
        let mut start = 0;
        while let Some(offset) = self.buf[start..]
            .iter()
            .position(|byte| *byte == FRAME_DELIMITER)
        {
            let end = start + offset;
            let line = &self.buf[start..end];
            start = end + 1;

            if self.discarding {
                self.discarding = false;
                continue;
            }
            if line.len() > self.max_frame_len {
                warn!(
                    "Dropping inbound frame of {} bytes (limit {})",
                    line.len(),
                    self.max_frame_len
                );
                continue;
            }

            let Ok(text) = std::str::from_utf8(line) else {
                decoded.error = Some(CodecError::InvalidUtf8);
                break;
            };
            let text = text.trim();
            if !text.is_empty() {
                decoded.frames.push(text.to_owned());
            }
        }
        self.buf.drain(..start);

        if self.buf.len() > self.max_frame_len {
            if !self.discarding {
                warn!(
                    "Inbound frame exceeds {} bytes without a delimiter, discarding it",
                    self.max_frame_len
                );
            }
            self.buf.clear();
            self.discarding = true;
        }

        decoded
    }

    /// Bytes received but not yet part of a complete frame.
    #[cfg(test)]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn post(author: &str, title: &str, content: &str) -> Command {
        Command::Post {
            author: author.to_owned(),
            title: title.to_owned(),
            content: content.to_owned(),
        }
    }

    #[test]
    fn test_encode_announcement_keeps_pipes_in_content() {
        let created_at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let announcement = Announcement::new(7, "alice", "Hi", "Hello|World", created_at);

        let frame = encode_announcement(&announcement);

        assert_eq!(
            frame.as_bytes(),
            b"ANNOUNCE|7|alice|Hi|Hello|World|2024-01-01T00:00:00Z\n"
        );
    }

    #[test]
    fn test_encode_announcement_shows_fractional_seconds_when_present() {
        let created_at = Utc.timestamp_millis_opt(1_704_067_200_250).unwrap();
        let announcement = Announcement::new(1, "a", "t", "c", created_at);

        let frame = encode_announcement(&announcement);

        assert_eq!(
            frame.as_bytes(),
            b"ANNOUNCE|1|a|t|c|2024-01-01T00:00:00.250Z\n"
        );
    }

    #[test]
    fn test_decode_command_accepts_post() {
        assert_eq!(
            decode_command("POST|bob|Title|Body text"),
            Ok(post("bob", "Title", "Body text"))
        );
    }

    #[test]
    fn test_decode_command_content_consumes_remaining_pipes() {
        assert_eq!(
            decode_command("POST|bob|Title|a|b|c"),
            Ok(post("bob", "Title", "a|b|c"))
        );
    }

    #[test]
    fn test_decode_command_verb_is_case_insensitive() {
        assert_eq!(decode_command("post|bob|T|C"), Ok(post("bob", "T", "C")));
    }

    #[test]
    fn test_decode_command_allows_empty_content() {
        assert_eq!(decode_command("POST|bob|T|"), Ok(post("bob", "T", "")));
    }

    #[test]
    fn test_decode_command_rejects_garbage() {
        assert_eq!(
            decode_command("GARBAGE"),
            Err(CodecError::UnknownVerb("GARBAGE".to_owned()))
        );
    }

    #[test]
    fn test_decode_command_rejects_too_few_fields() {
        assert_eq!(
            decode_command("POST|onlytwofields"),
            Err(CodecError::MissingFields)
        );
        assert_eq!(decode_command("POST|a|b"), Err(CodecError::MissingFields));
    }

    #[test]
    fn test_decode_command_rejects_empty_line() {
        assert_eq!(decode_command(""), Err(CodecError::Empty));
    }

    #[test]
    fn test_frame_decoder_waits_for_delimiter() {
        let mut decoder = FrameDecoder::new(1024);

        assert!(decoder.push(b"POST|bob|Ti").frames.is_empty());
        assert_eq!(decoder.buffered(), 11);
        assert_eq!(
            decoder.push(b"tle|Body\n").frames,
            vec!["POST|bob|Title|Body".to_owned()]
        );
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_frame_decoder_splits_several_frames_in_one_push() {
        let mut decoder = FrameDecoder::new(1024);

        let frames = decoder.push(b"POST|a|b|c\r\nPOST|d|e|f\nPOST|g").frames;

        assert_eq!(frames, vec!["POST|a|b|c".to_owned(), "POST|d|e|f".to_owned()]);
        assert_eq!(decoder.buffered(), 6);
    }

    #[test]
    fn test_frame_decoder_skips_blank_lines() {
        let mut decoder = FrameDecoder::new(1024);
        assert!(decoder.push(b"\n  \r\n\n").frames.is_empty());
    }

    #[test]
    fn test_frame_decoder_discards_oversized_frame_and_recovers() {
        let mut decoder = FrameDecoder::new(8);

        assert!(decoder.push(b"0123456789").frames.is_empty());
        assert_eq!(decoder.buffered(), 0);
        assert!(decoder.push(b"abcdef").frames.is_empty());

        // The delimiter ends the oversized frame; the next one is accepted.
        assert_eq!(decoder.push(b"\nok\n").frames, vec!["ok".to_owned()]);
    }

    #[test]
    fn test_frame_decoder_rejects_invalid_utf8() {
        let mut decoder = FrameDecoder::new(1024);
        let decoded = decoder.push(b"\xff\xfe\n");
        assert!(decoded.frames.is_empty());
        assert_eq!(decoded.error, Some(CodecError::InvalidUtf8));
    }

    #[test]
    fn test_frame_decoder_keeps_frames_before_invalid_utf8() {
        let mut decoder = FrameDecoder::new(1024);

        let decoded = decoder.push(b"POST|a|b|c\n\xff\nPOST|d|e|f\n");

        assert_eq!(decoded.frames, vec!["POST|a|b|c".to_owned()]);
        assert_eq!(decoded.error, Some(CodecError::InvalidUtf8));
    }
}
