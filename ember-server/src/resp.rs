//! Minimal RESP ingress parsing.
//!
//! Only the array-of-bulk-strings command form is accepted; reply encoding
//! lives on `CommandReply` itself. The parser is incremental: it reports
//! how many buffered bytes one complete command consumed so the caller can
//! drain its connection buffer as chunks arrive.

use ember_common::error::{EmberError, EmberResult};
use ember_core::command::CommandFrame;

/// Result of one parse attempt over buffered bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseStatus {
    /// More bytes are required.
    Incomplete,
    /// One complete command was decoded.
    Complete {
        /// The decoded frame.
        frame: CommandFrame,
        /// Bytes consumed from the front of the buffer.
        consumed: usize,
    },
}

/// Tries to decode one command from the front of `buffer`.
///
/// # Errors
///
/// Returns `EmberError::Protocol` when the buffered bytes violate RESP
/// framing rules.
pub fn parse_next_command(buffer: &[u8]) -> EmberResult<ParseStatus> {
    if buffer.is_empty() {
        return Ok(ParseStatus::Incomplete);
    }
    if buffer[0] != b'*' {
        return Err(EmberError::Protocol(
            "expected array header for command frame".to_owned(),
        ));
    }

    let Some((header, mut cursor)) = read_line(buffer, 1) else {
        return Ok(ParseStatus::Incomplete);
    };
    let element_count = parse_length(header)?;
    if element_count == 0 {
        return Err(EmberError::Protocol("empty command array".to_owned()));
    }

    let mut parts: Vec<Vec<u8>> = Vec::with_capacity(element_count);
    for _ in 0..element_count {
        if cursor >= buffer.len() {
            return Ok(ParseStatus::Incomplete);
        }
        if buffer[cursor] != b'$' {
            return Err(EmberError::Protocol(
                "expected bulk string inside command array".to_owned(),
            ));
        }
        let Some((length_text, after_header)) = read_line(buffer, cursor + 1) else {
            return Ok(ParseStatus::Incomplete);
        };
        let length = parse_length(length_text)?;
        let payload_end = after_header + length;
        if buffer.len() < payload_end + 2 {
            return Ok(ParseStatus::Incomplete);
        }
        if &buffer[payload_end..payload_end + 2] != b"\r\n" {
            return Err(EmberError::Protocol(
                "bulk string payload is not terminated".to_owned(),
            ));
        }
        parts.push(buffer[after_header..payload_end].to_vec());
        cursor = payload_end + 2;
    }

    let name = String::from_utf8_lossy(&parts[0]).into_owned();
    let args = parts.split_off(1);
    Ok(ParseStatus::Complete {
        frame: CommandFrame::new(name, args),
        consumed: cursor,
    })
}

/// Returns the line starting at `start` (without CRLF) and the offset just
/// past its terminator.
fn read_line(buffer: &[u8], start: usize) -> Option<(&[u8], usize)> {
    let relative = buffer[start..]
        .windows(2)
        .position(|window| window == b"\r\n")?;
    Some((&buffer[start..start + relative], start + relative + 2))
}

fn parse_length(raw: &[u8]) -> EmberResult<usize> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|text| text.parse::<usize>().ok())
        .ok_or_else(|| EmberError::Protocol("invalid length field".to_owned()))
}

#[cfg(test)]
mod tests {
    use super::{parse_next_command, ParseStatus};
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn complete_command_decodes_with_consumed_offset() {
        let bytes = b"*3\r\n$3\r\nSET\r\n$3\r\nfoo\r\n$3\r\nbar\r\n*1\r\n$4\r\nPING\r\n";
        let status = parse_next_command(bytes).expect("valid frame");
        let ParseStatus::Complete { frame, consumed } = status else {
            panic!("frame must be complete");
        };
        assert_that!(frame.name.as_str(), eq("SET"));
        assert_that!(frame.args.len(), eq(2_usize));
        assert_that!(consumed, eq(31_usize));

        let rest = parse_next_command(&bytes[consumed..]).expect("second frame");
        let ParseStatus::Complete { frame, .. } = rest else {
            panic!("second frame must be complete");
        };
        assert_that!(frame.name.as_str(), eq("PING"));
    }

    #[rstest]
    #[case(b"".as_slice())]
    #[case(b"*2\r\n$4\r\nECHO\r\n$5\r\nhe".as_slice())]
    #[case(b"*2\r\n$4\r\nECHO\r\n".as_slice())]
    #[case(b"*2".as_slice())]
    fn partial_input_waits_for_more_bytes(#[case] bytes: &[u8]) {
        assert_that!(
            &parse_next_command(bytes).expect("partial input is not an error"),
            eq(&ParseStatus::Incomplete)
        );
    }

    #[rstest]
    #[case(b"PING\r\n".as_slice())]
    #[case(b"*0\r\n".as_slice())]
    #[case(b"*1\r\n:5\r\n".as_slice())]
    #[case(b"*1\r\n$x\r\nzz\r\n".as_slice())]
    #[case(b"*1\r\n$2\r\nabXX".as_slice())]
    fn malformed_input_is_a_protocol_error(#[case] bytes: &[u8]) {
        assert_that!(parse_next_command(bytes).is_err(), eq(true));
    }
}
