//! Wire-level decoding and encoding errors.

/// Alias for `Result<T, dbridge_proto::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while encoding or decoding bridge protocol bytes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The service string does not fit a 4-hex-digit length prefix.
    #[error("service is {0} bytes, limit is 65535")]
    ServiceTooLong(usize),

    /// A length field was not four ASCII hex digits.
    #[error("bad length field {0:?}")]
    BadLength([u8; 4]),

    /// A status word was neither `OKAY` nor `FAIL`.
    #[error("unexpected status {0:?}")]
    UnknownStatus([u8; 4]),

    /// A sync entry carried an id outside the sync vocabulary.
    #[error("unknown sync id {0:?}")]
    UnknownSyncId([u8; 4]),

    /// Fewer bytes were supplied than the structure requires.
    #[error("truncated {what}: need {need} bytes, have {have}")]
    Truncated {
        /// Structure being decoded.
        what: &'static str,
        /// Bytes required.
        need: usize,
        /// Bytes available.
        have: usize,
    },

    /// A length read from the wire exceeds what the protocol allows.
    #[error("{what} of {len} bytes exceeds the {max}-byte limit")]
    TooLarge {
        /// Field carrying the length.
        what: &'static str,
        /// Length announced by the peer.
        len: usize,
        /// Largest accepted length.
        max: usize,
    },

    /// A textual reply could not be parsed.
    #[error("malformed {what}: {line:?}")]
    Malformed {
        /// Kind of reply being parsed.
        what: &'static str,
        /// Offending input.
        line: String,
    },
}
