//! PEI line framing and final result codes.
//!
//! The PEI is a line-oriented AT dialect: every request is terminated with
//! CR LF, every response line and every unsolicited indication arrives as a
//! CR LF terminated line. A command exchange ends with a final result code:
//! `OK` for success, `ERROR`, `+CME ERROR: <n>` or `+CMS ERROR: <n>` for
//! failure.
//!
//! Requests that carry a PDU (`AT+CMGS=...`) contain an embedded CR LF and end
//! with Ctrl-Z instead of a line terminator.

/// Line terminator used for requests.
pub const LINE_TERMINATOR: &[u8] = b"\r\n";

/// Ctrl-Z, terminates the user data of an `AT+CMGS` request.
pub const CTRL_Z: char = '\u{1a}';

/// Prompt the radio prints while it waits for PDU input.
const PDU_PROMPT: &str = "> ";

/// Result of attempting to decode one line from a byte buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeResult {
    /// A complete line was decoded (terminator stripped, may be empty).
    Line {
        /// The line text.
        line: String,
        /// Number of bytes consumed from the input buffer.
        consumed: usize,
    },

    /// The buffer does not yet contain a complete line.
    Incomplete,
}

/// Decode one LF terminated line from a byte buffer.
///
/// A trailing CR is stripped, as is the `> ` PDU input prompt some
/// terminals print without a line break. Invalid UTF-8 is replaced rather
/// than rejected so a single corrupted byte cannot stall the stream.
pub fn decode_line(buf: &[u8]) -> DecodeResult {
    let Some(term_pos) = buf.iter().position(|&b| b == b'\n') else {
        return DecodeResult::Incomplete;
    };

    let mut body = &buf[..term_pos];
    if let Some(stripped) = body.strip_suffix(b"\r") {
        body = stripped;
    }

    let text = String::from_utf8_lossy(body);
    let mut line = text.trim_start_matches(PDU_PROMPT).to_string();
    line.retain(|c| c != '\r');

    DecodeResult::Line {
        line,
        consumed: term_pos + 1,
    }
}

/// Final result code that ends a command exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalResult {
    /// `OK`
    Ok,
    /// `ERROR`, `+CME ERROR: <n>` or `+CMS ERROR: <n>` (the full line).
    Error(String),
}

/// Classify a response line. Returns `None` for intermediate response data.
pub fn final_result(line: &str) -> Option<FinalResult> {
    let line = line.trim();
    if line == "OK" {
        Some(FinalResult::Ok)
    } else if line == "ERROR" || line.starts_with("+CME ERROR") || line.starts_with("+CMS ERROR")
    {
        Some(FinalResult::Error(line.to_string()))
    } else {
        None
    }
}

/// Encode a request for the wire.
///
/// Requests that end with Ctrl-Z are sent as they are; everything else gets a
/// CR LF terminator.
pub fn encode_request(request: &str) -> Vec<u8> {
    let mut bytes = request.as_bytes().to_vec();
    if !request.ends_with(CTRL_Z) {
        bytes.extend_from_slice(LINE_TERMINATOR);
    }
    bytes
}

/// The command line of a request, i.e. everything before an embedded PDU.
///
/// This is what a terminal with echo enabled repeats back.
pub fn command_line(request: &str) -> &str {
    request
        .split(['\r', '\n'])
        .next()
        .unwrap_or(request)
        .trim_end()
}

/// Whether `line` is the terminal echoing `request` back.
pub fn is_echo(line: &str, request: &str) -> bool {
    let command = command_line(request);
    !command.is_empty() && line.trim_end().eq_ignore_ascii_case(command)
}

/// Normalize an AT command: prepend `AT` unless the command already starts
/// with it (case-insensitive).
///
/// ```
/// use tetra_pei::protocol::normalize_command;
///
/// assert_eq!(normalize_command("+CBC?"), "AT+CBC?");
/// assert_eq!(normalize_command("ATZ"), "ATZ");
/// assert_eq!(normalize_command("at+ctom?"), "at+ctom?");
/// ```
pub fn normalize_command(command: &str) -> String {
    let command = command.trim();
    let has_prefix = command
        .get(..2)
        .is_some_and(|p| p.eq_ignore_ascii_case("AT"));
    if has_prefix {
        command.to_string()
    } else {
        format!("AT{command}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_crlf_line() {
        assert_eq!(
            decode_line(b"+CBC: 1,80\r\nOK\r\n"),
            DecodeResult::Line {
                line: "+CBC: 1,80".into(),
                consumed: 12,
            }
        );
    }

    #[test]
    fn decode_bare_lf_line() {
        assert_eq!(
            decode_line(b"OK\n"),
            DecodeResult::Line {
                line: "OK".into(),
                consumed: 3,
            }
        );
    }

    #[test]
    fn decode_incomplete() {
        assert_eq!(decode_line(b""), DecodeResult::Incomplete);
        assert_eq!(decode_line(b"+CTSDSR: 12,1234"), DecodeResult::Incomplete);
    }

    #[test]
    fn decode_empty_line() {
        assert_eq!(
            decode_line(b"\r\nOK\r\n"),
            DecodeResult::Line {
                line: String::new(),
                consumed: 2,
            }
        );
    }

    #[test]
    fn decode_strips_pdu_prompt() {
        assert_eq!(
            decode_line(b"> +CMGS: 0,4711\r\n"),
            DecodeResult::Line {
                line: "+CMGS: 0,4711".into(),
                consumed: 17,
            }
        );
    }

    #[test]
    fn decode_invalid_utf8_is_lossy() {
        match decode_line(b"AB\xFFC\r\n") {
            DecodeResult::Line { line, consumed } => {
                assert_eq!(consumed, 6);
                assert!(line.starts_with("AB"));
                assert!(line.ends_with('C'));
            }
            DecodeResult::Incomplete => panic!("expected a line"),
        }
    }

    #[test]
    fn final_result_codes() {
        assert_eq!(final_result("OK"), Some(FinalResult::Ok));
        assert_eq!(
            final_result("ERROR"),
            Some(FinalResult::Error("ERROR".into()))
        );
        assert_eq!(
            final_result("+CME ERROR: 35"),
            Some(FinalResult::Error("+CME ERROR: 35".into()))
        );
        assert_eq!(
            final_result("+CMS ERROR: 500"),
            Some(FinalResult::Error("+CMS ERROR: 500".into()))
        );
        assert_eq!(final_result("+CBC: 1,80"), None);
        assert_eq!(final_result("OKAY"), None);
    }

    #[test]
    fn encode_plain_request() {
        assert_eq!(encode_request("ATZ"), b"ATZ\r\n");
    }

    #[test]
    fn encode_pdu_request_keeps_ctrl_z_terminator() {
        let request = "AT+CMGS=1234567,32\r\n8210002A\u{1a}";
        assert_eq!(encode_request(request), request.as_bytes());
    }

    #[test]
    fn echo_detection() {
        assert!(is_echo("ATE0", "ATE0"));
        assert!(is_echo("at+cbc?", "AT+CBC?"));
        assert!(is_echo("AT+CMGS=1234567,32", "AT+CMGS=1234567,32\r\n8210002A\u{1a}"));
        assert!(!is_echo("OK", "ATZ"));
        assert!(!is_echo("", ""));
    }
}
