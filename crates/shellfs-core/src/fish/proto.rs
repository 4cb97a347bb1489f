//! Reply framing of the FISH protocol.
//!
//! Every remote command terminates with a line `### ddd`, where `ddd`
//! is a three-digit code. Anything received before the marker is
//! "garbage": it is captured (last line wins) for commands that want a
//! string answer, and it biases a code-less marker toward failure.

use tracing::trace;

use crate::error::{VfsError, VfsResult};
use crate::fish::transport::Transport;

/// Prefix of the reply marker line.
pub const REPLY_MARKER: &str = "### ";

/// Classified reply code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyClass {
    /// Positive preliminary (`1xx`): data follows.
    Prelim,
    /// Positive completion (`2xx`).
    Complete,
    /// Positive intermediate (`3xx`).
    Continue,
    /// Transient negative (`4xx`).
    Transient,
    /// Permanent negative (`5xx`) or undecodable marker.
    Error,
}

/// A decoded exchange: the final classification plus the last
/// non-marker line seen before it, for commands that answer with a
/// value (sizes, working directory).
#[derive(Debug, Clone)]
pub struct Reply {
    pub class: ReplyClass,
    pub text: Option<String>,
}

impl Reply {
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.class == ReplyClass::Complete
    }
}

/// Classify the code text following the marker.
///
/// Codes below 100 keep their historical quirks: with garbage seen
/// beforehand they classify as error; a literal `0` (or `000`) counts
/// as completion; any other small code is preliminary. These are three
/// observably distinct cases and stay distinct here.
#[must_use]
pub fn decode_reply(text: &str, was_garbage: bool) -> ReplyClass {
    let Some(code) = parse_leading_int(text) else {
        return ReplyClass::Error; // undecodable: acts as 500
    };
    if code < 100 {
        if was_garbage {
            return ReplyClass::Error;
        }
        return if code == 0 { ReplyClass::Complete } else { ReplyClass::Prelim };
    }
    match code / 100 {
        1 => ReplyClass::Prelim,
        2 => ReplyClass::Complete,
        3 => ReplyClass::Continue,
        4 => ReplyClass::Transient,
        _ => ReplyClass::Error,
    }
}

fn parse_leading_int(text: &str) -> Option<i64> {
    let trimmed = text.trim_start();
    let mut end = 0;
    let bytes = trimmed.as_bytes();
    if end < bytes.len() && (bytes[end] == b'-' || bytes[end] == b'+') {
        end += 1;
    }
    let digits_start = end;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    if end == digits_start {
        return None;
    }
    trimmed[..end].parse().ok()
}

/// Read lines until the reply marker and classify it.
///
/// End of file mid-exchange means the pipe died under us; that is
/// fatal to the connection and surfaces as the connection-reset error,
/// never as a decodable reply.
pub fn get_reply(transport: &mut dyn Transport) -> VfsResult<Reply> {
    let mut garbage: Option<String> = None;
    loop {
        let line = match transport.read_line() {
            Ok(Some(line)) => line,
            Ok(None) => {
                return Err(VfsError::ConnectionReset(
                    crate::error::OpContext::new().with_op("reply"),
                ));
            }
            Err(err) => return Err(VfsError::from(err)),
        };
        trace!(line = %line, "reply line");
        match line.strip_prefix(REPLY_MARKER) {
            Some(code) => {
                let class = decode_reply(code, garbage.is_some());
                return Ok(Reply { class, text: garbage });
            }
            None => garbage = Some(line),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fish::transport::ScriptedTransport;

    fn reply_for(input: &str) -> Reply {
        let script = ScriptedTransport::new();
        script.send(input);
        get_reply(&mut script.handle()).unwrap()
    }

    #[test]
    fn test_clean_complete() {
        let reply = reply_for("### 200\n");
        assert_eq!(reply.class, ReplyClass::Complete);
        assert_eq!(reply.text, None);
    }

    #[test]
    fn test_zero_code_is_complete() {
        assert_eq!(reply_for("### 000\n").class, ReplyClass::Complete);
        assert_eq!(reply_for("### 0\n").class, ReplyClass::Complete);
    }

    #[test]
    fn test_garbage_biases_small_code_to_error() {
        let reply = reply_for("mkdir: cannot create directory\n### 000\n");
        assert_eq!(reply.class, ReplyClass::Error);
        assert_eq!(reply.text.as_deref(), Some("mkdir: cannot create directory"));
    }

    #[test]
    fn test_garbage_does_not_demote_real_codes() {
        let reply = reply_for("1234\n### 200\n");
        assert_eq!(reply.class, ReplyClass::Complete);
        assert_eq!(reply.text.as_deref(), Some("1234"));
    }

    #[test]
    fn test_last_garbage_line_wins() {
        let reply = reply_for("first\nsecond\n### 200\n");
        assert_eq!(reply.text.as_deref(), Some("second"));
    }

    #[test]
    fn test_malformed_code_is_error() {
        assert_eq!(reply_for("### abc\n").class, ReplyClass::Error);
        assert_eq!(reply_for("### \n").class, ReplyClass::Error);
    }

    #[test]
    fn test_small_nonzero_code_is_prelim() {
        assert_eq!(reply_for("### 001\n").class, ReplyClass::Prelim);
        assert_eq!(reply_for("### 99\n").class, ReplyClass::Prelim);
    }

    #[test]
    fn test_class_bands() {
        assert_eq!(reply_for("### 100\n").class, ReplyClass::Prelim);
        assert_eq!(reply_for("### 331\n").class, ReplyClass::Continue);
        assert_eq!(reply_for("### 426\n").class, ReplyClass::Transient);
        assert_eq!(reply_for("### 550\n").class, ReplyClass::Error);
        assert_eq!(reply_for("### 666\n").class, ReplyClass::Error);
    }

    #[test]
    fn test_eof_mid_exchange_is_connection_reset() {
        let script = ScriptedTransport::new();
        script.send("half a reply");
        let err = get_reply(&mut script.handle()).unwrap_err();
        assert!(matches!(err, VfsError::ConnectionReset(_)));
    }
}
