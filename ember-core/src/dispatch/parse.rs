//! Argument parsing helpers shared by command handlers.

/// Wrong-kind-of-value error message.
pub(crate) const WRONGTYPE: &str =
    "WRONGTYPE Operation against a key holding the wrong kind of value";

/// Parses a signed integer argument.
pub(crate) fn parse_i64(raw: &[u8]) -> Result<i64, String> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|text| text.parse::<i64>().ok())
        .ok_or_else(|| "ERR value is not an integer or out of range".to_owned())
}

/// Parses an unsigned integer argument.
pub(crate) fn parse_u64(raw: &[u8]) -> Result<u64, String> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|text| text.parse::<u64>().ok())
        .ok_or_else(|| "ERR value is not an integer or out of range".to_owned())
}

/// Parses a blocking timeout given in (possibly fractional) seconds into
/// milliseconds. Zero means "block forever".
pub(crate) fn parse_timeout_ms(raw: &[u8]) -> Result<u64, String> {
    let seconds = std::str::from_utf8(raw)
        .ok()
        .and_then(|text| text.parse::<f64>().ok())
        .ok_or_else(|| "ERR timeout is not a float or out of range".to_owned())?;
    if !seconds.is_finite() || seconds < 0.0 {
        return Err("ERR timeout is negative".to_owned());
    }
    Ok((seconds * 1000.0) as u64)
}

#[cfg(test)]
mod tests {
    use super::{parse_i64, parse_timeout_ms};
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    #[case(b"42".as_slice(), Some(42))]
    #[case(b"-7".as_slice(), Some(-7))]
    #[case(b"".as_slice(), None)]
    #[case(b"4.2".as_slice(), None)]
    #[case(b"\xff".as_slice(), None)]
    fn integer_parsing(#[case] raw: &[u8], #[case] expected: Option<i64>) {
        assert_that!(parse_i64(raw).ok(), eq(expected));
    }

    #[rstest]
    #[case(b"0".as_slice(), Some(0))]
    #[case(b"1.5".as_slice(), Some(1_500))]
    #[case(b"-1".as_slice(), None)]
    #[case(b"inf".as_slice(), None)]
    fn timeout_parsing(#[case] raw: &[u8], #[case] expected: Option<u64>) {
        assert_that!(parse_timeout_ms(raw).ok(), eq(expected));
    }
}
