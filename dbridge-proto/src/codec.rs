//! Length-prefixed text framing for host requests and replies.
//!
//! A request is `[4 lowercase hex digits][service bytes]`. A reply starts with
//! a 4-byte status word; `FAIL` is always followed by a length-prefixed reason
//! and `OKAY` may be followed by a length-prefixed payload.

use crate::{Error, Result};

/// Largest service that fits the 4-hex-digit length prefix.
pub const MAX_SERVICE_LEN: usize = 0xFFFF;

/// Size of the status word and of the length prefix.
pub const WORD_LEN: usize = 4;

/// Reply status word.
///
/// The wire defines exactly these two words, so callers match it exhaustively.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(clippy::exhaustive_enums)]
pub enum Status {
    /// `OKAY`: the request was accepted.
    Okay,
    /// `FAIL`: a length-prefixed reason follows.
    Fail,
}

impl Status {
    /// Raw bytes of the `OKAY` word.
    pub const OKAY: [u8; 4] = *b"OKAY";
    /// Raw bytes of the `FAIL` word.
    pub const FAIL: [u8; 4] = *b"FAIL";

    /// Classifies a status word.
    pub fn parse(word: [u8; 4]) -> Result<Self> {
        match &word {
            b"OKAY" => Ok(Self::Okay),
            b"FAIL" => Ok(Self::Fail),
            _ => Err(Error::UnknownStatus(word)),
        }
    }

    /// Returns the 4-byte wire form.
    pub const fn as_bytes(self) -> [u8; 4] {
        match self {
            Self::Okay => Self::OKAY,
            Self::Fail => Self::FAIL,
        }
    }
}

/// Encodes a length as four lowercase hex digits.
pub fn encode_length(len: usize) -> Result<[u8; 4]> {
    if len > MAX_SERVICE_LEN {
        return Err(Error::ServiceTooLong(len));
    }
    let text = format!("{len:04x}");
    let mut out = [0u8; 4];
    out.copy_from_slice(text.as_bytes());
    Ok(out)
}

/// Parses four ASCII hex digits (either case) into a length.
pub fn parse_length(word: [u8; 4]) -> Result<usize> {
    if !word.iter().all(u8::is_ascii_hexdigit) {
        return Err(Error::BadLength(word));
    }
    // All four bytes are ASCII hex digits, so this is valid UTF-8.
    let text = std::str::from_utf8(&word).map_err(|_| Error::BadLength(word))?;
    usize::from_str_radix(text, 16).map_err(|_| Error::BadLength(word))
}

/// Encodes a service string as a length-prefixed request frame.
pub fn encode(service: &str) -> Result<Vec<u8>> {
    let prefix = encode_length(service.len())?;
    let mut frame = Vec::with_capacity(WORD_LEN + service.len());
    frame.extend_from_slice(&prefix);
    frame.extend_from_slice(service.as_bytes());
    Ok(frame)
}

/// Decodes one length-prefixed frame, returning its payload.
///
/// Bytes past the declared length are ignored.
pub fn decode(frame: &[u8]) -> Result<&[u8]> {
    let word = to_word(frame, "frame length")?;
    let len = parse_length(word)?;
    let body = &frame[WORD_LEN..];
    body.get(..len).ok_or(Error::Truncated {
        what: "frame payload",
        need: len,
        have: body.len(),
    })
}

/// Copies the first four bytes of `bytes` into a word.
pub(crate) fn to_word(bytes: &[u8], what: &'static str) -> Result<[u8; 4]> {
    bytes
        .get(..WORD_LEN)
        .and_then(|b| <[u8; 4]>::try_from(b).ok())
        .ok_or(Error::Truncated {
            what,
            need: WORD_LEN,
            have: bytes.len(),
        })
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn encodes_lowercase_prefix() {
        assert_eq!(encode("host:version").unwrap(), b"000chost:version");
        assert_eq!(encode("").unwrap(), b"0000");

        let long = "x".repeat(0xabc);
        assert_eq!(&encode(&long).unwrap()[..4], b"0abc");
    }

    #[test]
    fn rejects_oversized_service() {
        let long = "x".repeat(MAX_SERVICE_LEN + 1);
        assert_eq!(encode(&long), Err(Error::ServiceTooLong(MAX_SERVICE_LEN + 1)));
    }

    #[test]
    fn parses_mixed_case_hex() {
        assert_eq!(parse_length(*b"001F").unwrap(), 31);
        assert_eq!(parse_length(*b"001f").unwrap(), 31);
        assert_eq!(parse_length(*b"ffff").unwrap(), 0xFFFF);
    }

    #[test]
    fn rejects_non_hex_length() {
        assert_eq!(parse_length(*b"+123"), Err(Error::BadLength(*b"+123")));
        assert_eq!(parse_length(*b"00 5"), Err(Error::BadLength(*b"00 5")));
        assert!(parse_length(*b"OKAY").is_err());
    }

    #[test]
    fn decode_reports_truncation() {
        assert!(matches!(decode(b"00"), Err(Error::Truncated { .. })));
        assert!(matches!(
            decode(b"0005abc"),
            Err(Error::Truncated { need: 5, have: 3, .. })
        ));
    }

    #[test]
    fn status_words() {
        assert_eq!(Status::parse(*b"OKAY").unwrap(), Status::Okay);
        assert_eq!(Status::parse(*b"FAIL").unwrap(), Status::Fail);
        assert_eq!(Status::Fail.as_bytes(), *b"FAIL");
    }

    proptest! {
        #[test]
        fn frame_roundtrip(service in "[ -~]{0,9999}") {
            let frame = encode(&service).unwrap();
            prop_assert_eq!(frame.len(), service.len() + WORD_LEN);
            prop_assert_eq!(decode(&frame).unwrap(), service.as_bytes());
        }

        #[test]
        fn unknown_status_is_fault(word in any::<[u8; 4]>()) {
            prop_assume!(&word != b"OKAY" && &word != b"FAIL");
            prop_assert_eq!(Status::parse(word), Err(Error::UnknownStatus(word)));
        }
    }
}
