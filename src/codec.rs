use bytes::{Buf, BufMut, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

use crate::frame::Frame;

/// Frames larger than this are rejected instead of buffered without bound.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Items produced or consumed by the codec.
///
/// A `StompItem` is either a decoded `Frame` or a `Heartbeat` marker
/// representing a bare EOL received between frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StompItem {
    /// A decoded STOMP frame (command + headers + body)
    Frame(Frame),
    /// A single heartbeat pulse (LF or CRLF)
    Heartbeat,
}

/// `StompCodec` implements `tokio_util::codec::{Decoder, Encoder}` for the
/// STOMP wire format.
///
/// Responsibilities:
/// - Decode incoming bytes into `StompItem::Frame` or `StompItem::Heartbeat`.
/// - Honour `content-length` so bodies may contain NUL bytes.
/// - Apply STOMP 1.2 header escaping, except on CONNECT/CONNECTED frames
///   which the protocol exempts.
/// - Refuse frames above `max_frame_bytes`.
#[derive(Debug, Clone)]
pub struct StompCodec {
    max_frame_bytes: usize,
}

impl StompCodec {
    pub fn new() -> Self {
        Self {
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }

    /// Use a custom frame size ceiling (bytes, headers and body included).
    pub fn with_max_frame_bytes(mut self, max: usize) -> Self {
        self.max_frame_bytes = max;
        self
    }

    fn check_size(&self, buffered: usize) -> Result<(), io::Error> {
        if buffered > self.max_frame_bytes {
            return Err(invalid(format!(
                "frame exceeds {} bytes",
                self.max_frame_bytes
            )));
        }
        Ok(())
    }
}

impl Default for StompCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

/// Commands whose headers are sent and received without escaping.
fn is_unescaped_command(command: &str) -> bool {
    command == "CONNECT" || command == "CONNECTED"
}

/// Locate the blank line ending the command/header block.
///
/// Returns `(head_len, body_start)`: the head occupies `src[..head_len]`
/// (without its final EOL) and the body starts at `body_start`.
fn find_head_end(src: &[u8]) -> Option<(usize, usize)> {
    let mut i = 0;
    while let Some(rel) = src[i..].iter().position(|&b| b == b'\n') {
        let lf = i + rel;
        match src.get(lf + 1) {
            Some(b'\n') => return Some((lf, lf + 2)),
            Some(b'\r') if src.get(lf + 2) == Some(&b'\n') => return Some((lf, lf + 3)),
            None => return None,
            _ => i = lf + 1,
        }
    }
    None
}

fn strip_cr(line: &[u8]) -> &[u8] {
    match line.last() {
        Some(b'\r') => &line[..line.len() - 1],
        _ => line,
    }
}

fn unescape(raw: &[u8]) -> Result<Vec<u8>, io::Error> {
    let mut out = Vec::with_capacity(raw.len());
    let mut iter = raw.iter();
    while let Some(&b) = iter.next() {
        if b != b'\\' {
            out.push(b);
            continue;
        }
        match iter.next() {
            Some(b'\\') => out.push(b'\\'),
            Some(b'n') => out.push(b'\n'),
            Some(b'r') => out.push(b'\r'),
            Some(b'c') => out.push(b':'),
            Some(other) => {
                return Err(invalid(format!(
                    "undefined escape sequence '\\{}'",
                    *other as char
                )));
            }
            None => return Err(invalid("dangling escape at end of header")),
        }
    }
    Ok(out)
}

fn escape(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '\\' => result.push_str("\\\\"),
            '\r' => result.push_str("\\r"),
            '\n' => result.push_str("\\n"),
            ':' => result.push_str("\\c"),
            _ => result.push(ch),
        }
    }
    result
}

fn utf8(bytes: Vec<u8>, what: &str) -> Result<String, io::Error> {
    String::from_utf8(bytes).map_err(|e| invalid(format!("invalid utf8 in {}: {}", what, e)))
}

/// Parse the command line and header lines of a frame head.
fn parse_head(head: &[u8]) -> Result<(String, Vec<(String, String)>), io::Error> {
    let mut lines = head.split(|&b| b == b'\n').map(strip_cr);
    let command = utf8(lines.next().unwrap_or_default().to_vec(), "command")?;
    if command.is_empty() {
        return Err(invalid("empty command line"));
    }
    let escaped = !is_unescaped_command(&command);

    let mut headers = Vec::new();
    for line in lines {
        let colon = line.iter().position(|&b| b == b':').ok_or_else(|| {
            invalid(format!(
                "malformed header line: {:?}",
                String::from_utf8_lossy(line)
            ))
        })?;
        let (key, value) = (&line[..colon], &line[colon + 1..]);
        let (key, value) = if escaped {
            (unescape(key)?, unescape(value)?)
        } else {
            (key.to_vec(), value.to_vec())
        };
        headers.push((utf8(key, "header key")?, utf8(value, "header value")?));
    }
    Ok((command, headers))
}

impl Decoder for StompCodec {
    type Item = StompItem;
    type Error = io::Error;

    /// Decode one heartbeat or frame from `src`.
    ///
    /// Returns `Ok(None)` and leaves `src` untouched while the item is
    /// incomplete; consumes exactly the bytes of the item otherwise.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match src.first() {
            None => return Ok(None),
            Some(b'\n') => {
                src.advance(1);
                return Ok(Some(StompItem::Heartbeat));
            }
            Some(b'\r') => match src.get(1) {
                None => return Ok(None),
                Some(b'\n') => {
                    src.advance(2);
                    return Ok(Some(StompItem::Heartbeat));
                }
                Some(_) => {}
            },
            Some(_) => {}
        }

        let Some((head_len, body_start)) = find_head_end(src) else {
            self.check_size(src.len())?;
            return Ok(None);
        };
        let (command, headers) = parse_head(&src[..head_len])?;

        let content_length = match headers.iter().find(|(k, _)| k == "content-length") {
            Some((_, v)) => Some(
                v.trim()
                    .parse::<usize>()
                    .map_err(|e| invalid(format!("invalid content-length '{}': {}", v, e)))?,
            ),
            None => None,
        };

        let body_end = match content_length {
            Some(n) => {
                // `end` indexes the NUL terminator, which must fit as well.
                let end = match body_start.checked_add(n) {
                    Some(end) if end < self.max_frame_bytes => end,
                    _ => {
                        return Err(invalid(format!(
                            "content-length {} exceeds {} bytes",
                            n, self.max_frame_bytes
                        )));
                    }
                };
                match src.get(end) {
                    None => return Ok(None),
                    Some(0) => end,
                    Some(_) => return Err(invalid("missing NUL terminator after content-length body")),
                }
            }
            None => match src[body_start..].iter().position(|&b| b == 0) {
                Some(rel) => body_start + rel,
                None => {
                    self.check_size(src.len())?;
                    return Ok(None);
                }
            },
        };

        let body = src[body_start..body_end].to_vec();
        src.advance(body_end + 1);
        Ok(Some(StompItem::Frame(Frame {
            command,
            headers,
            body,
        })))
    }
}

impl Encoder<StompItem> for StompCodec {
    type Error = io::Error;

    /// Append the wire form of `item` to `dst`.
    ///
    /// A `content-length` header is added when the body contains NUL bytes
    /// or is not valid UTF-8 and the caller did not supply one.
    fn encode(&mut self, item: StompItem, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            StompItem::Heartbeat => {
                dst.put_u8(b'\n');
            }
            StompItem::Frame(frame) => {
                let escaped = !is_unescaped_command(&frame.command);
                dst.extend_from_slice(frame.command.as_bytes());
                dst.put_u8(b'\n');

                let mut headers = frame.headers;
                let has_cl = headers
                    .iter()
                    .any(|(k, _)| k.eq_ignore_ascii_case("content-length"));
                if !has_cl
                    && (frame.body.contains(&0) || std::str::from_utf8(&frame.body).is_err())
                {
                    headers.push(("content-length".to_string(), frame.body.len().to_string()));
                }

                for (k, v) in headers {
                    if escaped {
                        dst.extend_from_slice(escape(&k).as_bytes());
                        dst.put_u8(b':');
                        dst.extend_from_slice(escape(&v).as_bytes());
                    } else {
                        dst.extend_from_slice(k.as_bytes());
                        dst.put_u8(b':');
                        dst.extend_from_slice(v.as_bytes());
                    }
                    dst.put_u8(b'\n');
                }

                dst.put_u8(b'\n');
                dst.extend_from_slice(&frame.body);
                dst.put_u8(0);
            }
        }

        Ok(())
    }
}
