//! Binary entries of the file synchronisation service.
//!
//! Every entry starts with an 8-byte header: a 4-byte ASCII id followed by a
//! little-endian `u32`. For most ids the `u32` is the payload length; `DONE`
//! sent by the host carries the file mtime there instead, and `STAT`/`DENT`
//! replies are followed by fixed little-endian fields.

use crate::codec::to_word;
use crate::{Error, Result};

/// Maximum payload of a single `DATA` entry (64 KiB).
pub const MAX_CHUNK: usize = 64 * 1024;

/// Size of an entry header.
pub const HEADER_LEN: usize = 8;

/// Size of the fields following a `STAT` reply header id.
pub const STAT_BODY_LEN: usize = 12;

/// Size of the fixed fields following a `DENT` id (mode, size, mtime, name length).
pub const DENT_BODY_LEN: usize = 16;

/// Sync entry id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum SyncId {
    /// Query file metadata.
    Stat,
    /// List a directory.
    List,
    /// Directory entry in a `LIST` reply.
    Dent,
    /// Begin an upload: payload is `"<path>,<mode>"`.
    Send,
    /// Begin a download: payload is the remote path.
    Recv,
    /// File content chunk.
    Data,
    /// End of a transfer or listing.
    Done,
    /// Transfer failure: payload is a reason string.
    Fail,
    /// Upload accepted.
    Okay,
    /// Leave the sync service.
    Quit,
}

impl SyncId {
    /// Returns the 4-byte wire tag.
    pub const fn tag(self) -> [u8; 4] {
        match self {
            Self::Stat => *b"STAT",
            Self::List => *b"LIST",
            Self::Dent => *b"DENT",
            Self::Send => *b"SEND",
            Self::Recv => *b"RECV",
            Self::Data => *b"DATA",
            Self::Done => *b"DONE",
            Self::Fail => *b"FAIL",
            Self::Okay => *b"OKAY",
            Self::Quit => *b"QUIT",
        }
    }

    /// Parses a 4-byte wire tag.
    pub fn from_tag(tag: [u8; 4]) -> Result<Self> {
        Ok(match &tag {
            b"STAT" => Self::Stat,
            b"LIST" => Self::List,
            b"DENT" => Self::Dent,
            b"SEND" => Self::Send,
            b"RECV" => Self::Recv,
            b"DATA" => Self::Data,
            b"DONE" => Self::Done,
            b"FAIL" => Self::Fail,
            b"OKAY" => Self::Okay,
            b"QUIT" => Self::Quit,
            _ => return Err(Error::UnknownSyncId(tag)),
        })
    }
}

/// An entry header: id plus its little-endian `u32` argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Entry id.
    pub id: SyncId,
    /// Payload length, or mtime for a host `DONE`.
    pub arg: u32,
}

impl Header {
    /// Creates a header.
    pub const fn new(id: SyncId, arg: u32) -> Self {
        Self { id, arg }
    }

    /// Serializes the header into its 8-byte wire form.
    pub fn encode(self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[..4].copy_from_slice(&self.id.tag());
        out[4..].copy_from_slice(&self.arg.to_le_bytes());
        out
    }

    /// Parses an 8-byte header.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(Error::Truncated {
                what: "sync header",
                need: HEADER_LEN,
                have: bytes.len(),
            });
        }
        let id = SyncId::from_tag(to_word(bytes, "sync id")?)?;
        let arg = u32::from_le_bytes(to_word(&bytes[4..], "sync length")?);
        Ok(Self { id, arg })
    }
}

/// Builds a complete entry: header plus payload.
pub fn encode_entry(id: SyncId, payload: &[u8]) -> Result<Vec<u8>> {
    let len = u32::try_from(payload.len()).map_err(|_| Error::ServiceTooLong(payload.len()))?;
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&Header::new(id, len).encode());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Formats the `SEND` payload: `"<remote-path>,<octal-mode>"`.
pub fn send_target(remote: &str, mode: u32) -> String {
    format!("{remote},{mode:o}")
}

/// Metadata returned by `STAT` and carried by each `DENT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileStat {
    /// Unix mode bits; zero when the path does not exist.
    pub mode: u32,
    /// Size in bytes (truncated to 32 bits by the protocol).
    pub size: u32,
    /// Modification time in seconds since the Unix epoch.
    pub mtime: u32,
}

impl FileStat {
    /// Parses the three little-endian fields of a `STAT` reply or `DENT` entry.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < STAT_BODY_LEN {
            return Err(Error::Truncated {
                what: "stat body",
                need: STAT_BODY_LEN,
                have: bytes.len(),
            });
        }
        let field = |at: usize| to_word(&bytes[at..], "stat field").map(u32::from_le_bytes);
        Ok(Self {
            mode: field(0)?,
            size: field(4)?,
            mtime: field(8)?,
        })
    }

    /// Returns `true` if the remote path exists.
    pub const fn exists(&self) -> bool {
        self.mode != 0
    }

    /// Returns `true` if the mode describes a directory.
    pub const fn is_dir(&self) -> bool {
        self.mode & 0o170_000 == 0o040_000
    }
}

/// Splits `len` bytes into `DATA`-sized chunk lengths.
pub fn chunk_lengths(len: usize) -> impl Iterator<Item = usize> {
    (0..len.div_ceil(MAX_CHUNK)).map(move |i| MAX_CHUNK.min(len - i * MAX_CHUNK))
}
