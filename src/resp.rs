//! RESP (REdis Serialization Protocol) wire support.
//!
//! Two halves, matching the split in the upstream daemon this proxy is
//! modeled on: a handful of outbound builders for the canned replies the
//! proxy itself ever sends (`+OK`, `-ERR ...`, and synthetic commands), and
//! an incremental parser that locates just the command-name bulk string of
//! an inbound frame without ever materializing the frame as a tree.

use bytes::{Bytes, BytesMut};

/// Build a RESP simple string: `+<msg>\r\n`.
pub fn simple(msg: &str) -> Bytes {
    let mut out = BytesMut::with_capacity(msg.len() + 3);
    out.extend_from_slice(b"+");
    out.extend_from_slice(msg.as_bytes());
    out.extend_from_slice(b"\r\n");
    out.freeze()
}

/// Build a RESP error: `-<msg>\r\n`.
pub fn error(msg: &str) -> Bytes {
    let mut out = BytesMut::with_capacity(msg.len() + 3);
    out.extend_from_slice(b"-");
    out.extend_from_slice(msg.as_bytes());
    out.extend_from_slice(b"\r\n");
    out.freeze()
}

/// Build a RESP array of bulk strings: a Redis command and its arguments.
pub fn command(parts: &[&[u8]]) -> Bytes {
    let mut out = BytesMut::new();
    out.extend_from_slice(format!("*{}\r\n", parts.len()).as_bytes());
    for p in parts {
        out.extend_from_slice(format!("${}\r\n", p.len()).as_bytes());
        out.extend_from_slice(p);
        out.extend_from_slice(b"\r\n");
    }
    out.freeze()
}

/// Outcome of one call to [`RespBuffer::parse`].
#[derive(Debug, PartialEq, Eq)]
pub enum ParseOutcome {
    /// Not enough bytes buffered yet to make progress; wait for more input.
    NeedMore,
    /// A full frame is ready. The cursor's `parsed` field holds the byte
    /// count the caller should drain once it has decided what to do with
    /// the frame (relay it, or substitute the synthetic command).
    Complete,
    /// The input violates the protocol. The session must drop.
    Malformed,
}

/// Incremental, resumable cursor over one client's inbound byte stream.
///
/// Mirrors the state a C `resp_buffer_t` carries (`pending_parts`,
/// `pending_bytes`, `expected_bytes`, `cmd`/`cmdlen`) but replaces the raw
/// pointer into the buffer with a byte-offset range, since nothing here may
/// alias-mutate the buffer the way the original's log-formatting code did.
#[derive(Debug, Default)]
pub struct RespBuffer {
    source: BytesMut,
    /// Bytes belonging to the frame currently being assembled.
    parsed: usize,
    /// Remaining bulk strings expected in the current array. 0 means no
    /// frame is in progress.
    pending_parts: u32,
    /// Declared length of the array header (`*<N>\r\n`) for the
    /// frame currently being assembled, or just completed. Kept around
    /// after `pending_parts` reaches 0 so a caller can tell an `AUTH` with
    /// exactly one argument apart from a malformed-arity `AUTH`.
    total_parts: u32,
    /// Bytes still owed for the bulk string currently being read.
    pending_bytes: usize,
    /// Declared length of the most recently completed bulk string.
    expected_bytes: usize,
    /// Offset + length of the command-name bulk (the frame's first),
    /// relative to `source`. Set once per frame, on the first bulk only.
    cmd: Option<(usize, usize)>,
}

impl RespBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append freshly-read bytes from the socket.
    pub fn feed(&mut self, data: &[u8]) {
        self.source.extend_from_slice(data);
    }

    /// Bytes consumed so far into the frame currently being assembled.
    pub fn parsed(&self) -> usize {
        self.parsed
    }

    /// Command-name bytes of the in-progress (or just-completed) frame, if
    /// the first bulk string has been seen yet.
    pub fn command_name(&self) -> Option<&[u8]> {
        let (start, len) = self.cmd?;
        Some(&self.source[start..start + len])
    }

    /// How many bulk strings remain in the current array (0 once the frame
    /// is fully parsed).
    pub fn pending_parts(&self) -> u32 {
        self.pending_parts
    }

    /// The array length declared by the current (or just-completed)
    /// frame's `*<N>\r\n` header.
    pub fn total_parts(&self) -> u32 {
        self.total_parts
    }

    /// The most recently completed bulk string, freshly copied. Used only
    /// to pull the password back out of an `AUTH` frame.
    pub fn last_value(&self) -> Option<Bytes> {
        if self.pending_bytes != 0 || self.expected_bytes == 0 {
            return None;
        }
        let end = self.parsed.checked_sub(2)?;
        let start = end.checked_sub(self.expected_bytes)?;
        Some(Bytes::copy_from_slice(&self.source[start..end]))
    }

    /// Remove `n` bytes from the front of the buffer (the bytes belonging
    /// to the frame just disposed of) and return them, e.g. to relay
    /// verbatim to the upstream. Also clears the per-frame `cmd` marker and
    /// reduces `parsed` by `n`; callers only ever drain exactly
    /// `self.parsed` bytes once a frame completes.
    pub fn drain(&mut self, n: usize) -> Bytes {
        let out = self.source.split_to(n).freeze();
        self.parsed -= n;
        self.cmd = None;
        out
    }

    /// Attempt to extend the current frame. Call repeatedly after each
    /// `feed` until it stops returning `NeedMore`.
    pub fn parse(&mut self) -> ParseOutcome {
        loop {
            if self.pending_parts == 0 {
                match self.read_quantity(b'*') {
                    LineResult::NeedMore => return ParseOutcome::NeedMore,
                    LineResult::Malformed => return ParseOutcome::Malformed,
                    LineResult::Value(n) => {
                        let Ok(n) = u32::try_from(n) else {
                            return ParseOutcome::Malformed;
                        };
                        self.pending_parts = n;
                        self.total_parts = n;
                    }
                }
                if self.pending_parts == 0 {
                    return ParseOutcome::Complete;
                }
            }

            if self.pending_bytes == 0 {
                match self.read_quantity(b'$') {
                    LineResult::NeedMore => return ParseOutcome::NeedMore,
                    LineResult::Malformed => return ParseOutcome::Malformed,
                    LineResult::Value(n) => {
                        let Ok(n) = usize::try_from(n) else {
                            return ParseOutcome::Malformed;
                        };
                        self.pending_bytes = n;
                        self.expected_bytes = n;
                    }
                }
            }

            let avail = self.source.len() - self.parsed;
            let need = self.pending_bytes + 2;

            if self.cmd.is_none() {
                // The command name must come from one contiguous span; this
                // is the only place a caller may compare `cmd` bytes
                // directly against an ACL entry.
                if avail < need {
                    return ParseOutcome::NeedMore;
                }
                self.cmd = Some((self.parsed, self.pending_bytes));
                self.parsed += need;
                self.pending_bytes = 0;
                self.pending_parts -= 1;
            } else if avail >= need {
                self.parsed += need;
                self.pending_bytes = 0;
                self.pending_parts -= 1;
            } else {
                self.parsed += avail;
                self.pending_bytes -= avail;
                return ParseOutcome::NeedMore;
            }

            if self.pending_parts == 0 {
                return ParseOutcome::Complete;
            }
        }
    }

    /// Read a `<prefix><decimal>\r\n` line starting at `self.parsed`,
    /// without consuming it unless the line is fully present.
    fn read_quantity(&mut self, prefix: u8) -> LineResult {
        let buf = &self.source[self.parsed..];
        if buf.is_empty() {
            return LineResult::NeedMore;
        }
        if buf[0] != prefix {
            return LineResult::Malformed;
        }
        let Some(crlf) = find_crlf(buf) else {
            return LineResult::NeedMore;
        };
        let value = std::str::from_utf8(&buf[1..crlf])
            .ok()
            .and_then(|s| s.parse::<i64>().ok());
        self.parsed += crlf + 2;
        match value {
            Some(v) if v >= 0 => LineResult::Value(v),
            _ => LineResult::Malformed,
        }
    }
}

enum LineResult {
    NeedMore,
    Malformed,
    Value(i64),
}

/// Index of the `\r` in the first `\r\n` found in `buf`, if any.
fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builders_produce_expected_wire_bytes() {
        assert_eq!(&simple("OK")[..], b"+OK\r\n");
        assert_eq!(&error("ERR nope")[..], b"-ERR nope\r\n");
        assert_eq!(
            &command(&[b"AUTH", b"secret"])[..],
            b"*2\r\n$4\r\nAUTH\r\n$6\r\nsecret\r\n"
        );
    }

    #[test]
    fn command_round_trips_through_the_parser() {
        let wire = command(&[b"GET", b"key"]);
        let mut buf = RespBuffer::new();
        buf.feed(&wire);
        assert_eq!(buf.parse(), ParseOutcome::Complete);
        assert_eq!(buf.command_name(), Some(&b"GET"[..]));
        assert_eq!(buf.pending_parts(), 0);
        assert_eq!(buf.parsed(), wire.len());
    }

    #[test]
    fn one_byte_at_a_time_matches_whole_buffer_parsing() {
        let wire = command(&[b"MGET", b"a", b"bb", b"ccc"]);
        let mut buf = RespBuffer::new();
        let mut outcome = ParseOutcome::NeedMore;
        for byte in wire.iter() {
            buf.feed(&[*byte]);
            outcome = buf.parse();
            if outcome == ParseOutcome::Complete {
                break;
            }
            assert_eq!(outcome, ParseOutcome::NeedMore);
        }
        assert_eq!(outcome, ParseOutcome::Complete);
        assert_eq!(buf.command_name(), Some(&b"MGET"[..]));
        assert_eq!(buf.parsed(), wire.len());
    }

    #[test]
    fn empty_array_completes_with_no_command() {
        let mut buf = RespBuffer::new();
        buf.feed(b"*0\r\n");
        assert_eq!(buf.parse(), ParseOutcome::Complete);
        assert_eq!(buf.command_name(), None);
        assert_eq!(buf.parsed(), 4);
    }

    #[test]
    fn malformed_prefix_is_rejected() {
        let mut buf = RespBuffer::new();
        buf.feed(b"@2\r\n");
        assert_eq!(buf.parse(), ParseOutcome::Malformed);
    }

    #[test]
    fn malformed_length_is_rejected() {
        let mut buf = RespBuffer::new();
        buf.feed(b"*1\r\n$x\r\n");
        assert_eq!(buf.parse(), ParseOutcome::Malformed);
    }

    #[test]
    fn last_value_extracts_auth_password() {
        let wire = command(&[b"AUTH", b"hunter2"]);
        let mut buf = RespBuffer::new();
        buf.feed(&wire);
        assert_eq!(buf.parse(), ParseOutcome::Complete);
        assert_eq!(buf.last_value().as_deref(), Some(&b"hunter2"[..]));
    }

    #[test]
    fn drain_resets_parsed_and_command_marker() {
        let wire = command(&[b"PING"]);
        let mut buf = RespBuffer::new();
        buf.feed(&wire);
        assert_eq!(buf.parse(), ParseOutcome::Complete);
        let n = buf.parsed();
        let drained = buf.drain(n);
        assert_eq!(&drained[..], &wire[..]);
        assert_eq!(buf.parsed(), 0);
        assert_eq!(buf.command_name(), None);
    }

    #[test]
    fn total_parts_survives_past_completion() {
        let wire = command(&[b"AUTH", b"hunter2"]);
        let mut buf = RespBuffer::new();
        buf.feed(&wire);
        assert_eq!(buf.parse(), ParseOutcome::Complete);
        assert_eq!(buf.total_parts(), 2);
        assert_eq!(buf.pending_parts(), 0);
    }

    #[test]
    fn pipelined_frames_parse_one_at_a_time() {
        let mut wire = BytesMut::new();
        wire.extend_from_slice(&command(&[b"GET", b"k"]));
        wire.extend_from_slice(&command(&[b"FLUSHALL"]));

        let mut buf = RespBuffer::new();
        buf.feed(&wire);

        assert_eq!(buf.parse(), ParseOutcome::Complete);
        assert_eq!(buf.command_name(), Some(&b"GET"[..]));
        let n = buf.parsed();
        buf.drain(n);

        assert_eq!(buf.parse(), ParseOutcome::Complete);
        assert_eq!(buf.command_name(), Some(&b"FLUSHALL"[..]));
    }
}
