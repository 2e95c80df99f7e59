//! File transfer over a device-addressed `sync:` session.
//!
//! Push sends `SEND` with `"<path>,<mode>"`, streams `DATA` chunks of at most
//! [`MAX_CHUNK`] bytes, then `DONE` carrying the mtime and waits for `OKAY`.
//! Pull sends `RECV` and concatenates `DATA` payloads until `DONE`. A `FAIL`
//! entry anywhere aborts with [`Error::RequestFailed`]; bytes already written
//! locally are left in place.

use std::path::Path;
use std::time::UNIX_EPOCH;

use dbridge_proto::sync::{
    DENT_BODY_LEN, FileStat, HEADER_LEN, Header, MAX_CHUNK, STAT_BODY_LEN, SyncId, encode_entry,
    send_target,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::session::Session;
use crate::transport::{TcpTransport, Transport};
use crate::{Error, Result};

/// One entry of a remote directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct DirEntry {
    /// File name without the directory.
    pub name: String,
    /// Mode, size and mtime.
    pub stat: FileStat,
}

/// A session in sync mode.
#[derive(Debug)]
pub struct SyncClient<T = TcpTransport> {
    /// Device-addressed session that accepted `sync:`.
    session: Session<T>,
}

impl<T: Transport> SyncClient<T> {
    /// Enters sync mode on a session already switched to a device.
    pub async fn start(mut session: Session<T>) -> Result<Self> {
        session.open_service("sync:").await?;
        Ok(Self { session })
    }

    /// Queries metadata of `remote`. A missing path yields an all-zero stat.
    pub async fn stat(&mut self, remote: &str) -> Result<FileStat> {
        self.send_entry(SyncId::Stat, remote.as_bytes()).await?;
        let tag = self.session.read_exact(4).await?;
        let id = SyncId::from_tag(word(&tag)).map_err(|e| self.fault(e))?;
        match id {
            SyncId::Stat => {
                let body = self.session.read_exact(STAT_BODY_LEN).await?;
                FileStat::decode(&body).map_err(|e| self.fault(e))
            }
            SyncId::Fail => {
                let len = self.session.read_exact(4).await?;
                Err(self.failure(u32::from_le_bytes(word(&len))).await)
            }
            other => Err(self.unexpected(other)),
        }
    }

    /// Lists the directory `remote`.
    pub async fn list(&mut self, remote: &str) -> Result<Vec<DirEntry>> {
        self.send_entry(SyncId::List, remote.as_bytes()).await?;
        let mut entries = Vec::new();
        loop {
            let header = self.read_header().await?;
            match header.id {
                SyncId::Dent => {
                    // mode is in the header; size, mtime and name length follow.
                    let rest = self.session.read_exact(DENT_BODY_LEN - 4).await?;
                    let field = |at: usize| u32::from_le_bytes(word(&rest[at..]));
                    let len = self.bounded(field(8), "directory entry name")?;
                    let name = self.session.read_exact(len).await?;
                    entries.push(DirEntry {
                        name: String::from_utf8_lossy(&name).into_owned(),
                        stat: FileStat {
                            mode: header.arg,
                            size: field(0),
                            mtime: field(4),
                        },
                    });
                }
                SyncId::Done => {
                    self.session.read_exact(DENT_BODY_LEN - 4).await?;
                    return Ok(entries);
                }
                SyncId::Fail => return Err(self.failure(header.arg).await),
                other => return Err(self.unexpected(other)),
            }
        }
    }

    /// Uploads `reader` to `remote`, returning the number of bytes sent.
    pub async fn push<R: AsyncRead + Unpin>(
        &mut self,
        mut reader: R,
        remote: &str,
        mode: u32,
        mtime: u32,
    ) -> Result<u64> {
        self.send_entry(SyncId::Send, send_target(remote, mode).as_bytes())
            .await?;
        let mut chunk = vec![0u8; MAX_CHUNK];
        let mut total = 0u64;
        loop {
            let n = match fill_chunk(&mut reader, &mut chunk).await {
                Ok(n) => n,
                Err(e) => {
                    // The device is still waiting for DATA or DONE.
                    self.session.disconnect();
                    return Err(e);
                }
            };
            if n == 0 {
                break;
            }
            self.send_entry(SyncId::Data, &chunk[..n]).await?;
            total += n as u64;
            if n < MAX_CHUNK {
                break;
            }
        }
        self.session
            .write_all(&Header::new(SyncId::Done, mtime).encode())
            .await?;

        let header = self.read_header().await?;
        match header.id {
            SyncId::Okay => {
                tracing::debug!(remote, bytes = total, "pushed");
                Ok(total)
            }
            SyncId::Fail => Err(self.failure(header.arg).await),
            other => Err(self.unexpected(other)),
        }
    }

    /// Downloads `remote` into `writer`, returning the number of bytes received.
    pub async fn pull<W: AsyncWrite + Unpin>(
        &mut self,
        remote: &str,
        mut writer: W,
    ) -> Result<u64> {
        self.send_entry(SyncId::Recv, remote.as_bytes()).await?;
        let mut total = 0u64;
        loop {
            let header = self.read_header().await?;
            match header.id {
                SyncId::Data => {
                    let len = self.bounded(header.arg, "data chunk")?;
                    let data = self.session.read_exact(len).await?;
                    writer.write_all(&data).await?;
                    total += data.len() as u64;
                }
                SyncId::Done => break,
                SyncId::Fail => return Err(self.failure(header.arg).await),
                other => return Err(self.unexpected(other)),
            }
        }
        writer.flush().await?;
        tracing::debug!(remote, bytes = total, "pulled");
        Ok(total)
    }

    /// Uploads a local file, preserving its mode and mtime.
    pub async fn push_file(&mut self, local: impl AsRef<Path>, remote: &str) -> Result<u64> {
        let local = local.as_ref();
        let file = tokio::fs::File::open(local)
            .await
            .map_err(|e| Error::from(e).with_file(local.display().to_string()))?;
        let meta = file
            .metadata()
            .await
            .map_err(|e| Error::from(e).with_file(local.display().to_string()))?;
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .and_then(|d| u32::try_from(d.as_secs()).ok())
            .unwrap_or(0);
        self.push(file, remote, file_mode(&meta), mtime)
            .await
            .map_err(|e| e.with_file(remote))
    }

    /// Downloads `remote` into a local file, creating or truncating it.
    pub async fn pull_file(&mut self, remote: &str, local: impl AsRef<Path>) -> Result<u64> {
        let local = local.as_ref();
        let file = tokio::fs::File::create(local)
            .await
            .map_err(|e| Error::from(e).with_file(local.display().to_string()))?;
        self.pull(remote, file).await.map_err(|e| e.with_file(remote))
    }

    /// Leaves sync mode and closes the connection.
    pub async fn quit(mut self) -> Result<()> {
        let r = self.send_entry(SyncId::Quit, &[]).await;
        self.session.disconnect();
        r
    }

    /// Writes one entry.
    async fn send_entry(&mut self, id: SyncId, payload: &[u8]) -> Result<()> {
        let entry = encode_entry(id, payload)?;
        self.session.write_all(&entry).await
    }

    /// Reads and decodes an entry header.
    async fn read_header(&mut self) -> Result<Header> {
        let bytes = self.session.read_exact(HEADER_LEN).await?;
        Header::decode(&bytes).map_err(|e| self.fault(e))
    }

    /// Reads the reason following a `FAIL` header.
    async fn failure(&mut self, len: u32) -> Error {
        let len = match self.bounded(len, "failure reason") {
            Ok(len) => len,
            Err(e) => return e,
        };
        match self.session.read_exact(len).await {
            Ok(reason) => Error::RequestFailed {
                reason: String::from_utf8_lossy(&reason).into_owned(),
            },
            Err(e) => e,
        }
    }

    /// Checks a length read from the device against [`MAX_CHUNK`].
    fn bounded(&mut self, len: u32, what: &'static str) -> Result<usize> {
        let n = len as usize;
        if n > MAX_CHUNK {
            return Err(self.fault(dbridge_proto::Error::TooLarge {
                what,
                len: n,
                max: MAX_CHUNK,
            }));
        }
        Ok(n)
    }

    /// Protocol fault for an id that is valid but not expected here.
    fn unexpected(&mut self, id: SyncId) -> Error {
        self.fault(dbridge_proto::Error::Malformed {
            what: "sync reply",
            line: String::from_utf8_lossy(&id.tag()).into_owned(),
        })
    }

    /// Disconnects and returns a protocol fault; the stream is out of step.
    fn fault(&mut self, e: dbridge_proto::Error) -> Error {
        self.session.disconnect();
        Error::Protocol(e)
    }
}

/// Reads until `buf` is full or the reader is exhausted.
async fn fill_chunk<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]).await? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

/// First four bytes of `bytes`, zero-padded.
fn word(bytes: &[u8]) -> [u8; 4] {
    let mut out = [0u8; 4];
    let n = bytes.len().min(4);
    out[..n].copy_from_slice(&bytes[..n]);
    out
}

/// Mode bits sent with `SEND`.
#[cfg(unix)]
fn file_mode(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode()
}

/// Mode bits sent with `SEND`: a regular file readable by everyone.
#[cfg(not(unix))]
fn file_mode(_: &std::fs::Metadata) -> u32 {
    0o100_644
}

#[cfg(test)]
mod tests {
    use dbridge_proto::Selector;

    use super::*;
    use crate::Config;
    use crate::transport::mock::MockTransport;

    /// Session switched to a device and put in sync mode; `script` follows.
    async fn sync_over(script: &[u8]) -> SyncClient<MockTransport> {
        let mut input = b"OKAYOKAY".to_vec();
        input.extend_from_slice(script);
        let mut session = Session::with_transport(MockTransport::new(input), Config::default());
        session.switch_transport(Selector::Any).await.unwrap();
        SyncClient::start(session).await.unwrap()
    }

    fn written(c: &SyncClient<MockTransport>) -> Vec<u8> {
        let all = c.session.transport().unwrap().written();
        // Strip "0012host:transport-any" and "0005sync:".
        all[22 + 9..].to_vec()
    }

    /// Splits written bytes into (id, arg, payload) entries; DONE carries no payload.
    fn entries(mut bytes: &[u8]) -> Vec<(SyncId, u32, usize)> {
        let mut out = Vec::new();
        while !bytes.is_empty() {
            let h = Header::decode(bytes).unwrap();
            let body = if h.id == SyncId::Done { 0 } else { h.arg as usize };
            out.push((h.id, h.arg, body));
            bytes = &bytes[HEADER_LEN + body..];
        }
        out
    }

    fn stat_body(mode: u32, size: u32, mtime: u32) -> Vec<u8> {
        [mode, size, mtime].iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    #[tokio::test]
    async fn sync_requires_device_session() {
        let session = Session::with_transport(MockTransport::new(b""), Config::default());
        assert!(matches!(SyncClient::start(session).await, Err(Error::NotAddressed)));
    }

    #[tokio::test]
    async fn push_splits_into_max_chunks() {
        let mut c = sync_over(b"OKAY\0\0\0\0").await;
        let data = vec![7u8; 150 * 1024];
        let sent = c
            .push(data.as_slice(), "/sdcard/blob", 0o100_644, 1_700_000_000)
            .await
            .unwrap();
        assert_eq!(sent, 150 * 1024);

        let e = entries(&written(&c));
        let target = "/sdcard/blob,100644";
        assert_eq!(e[0], (SyncId::Send, target.len() as u32, target.len()));
        let chunks: Vec<_> = e[1..]
            .iter()
            .filter(|x| x.0 == SyncId::Data)
            .map(|x| x.2)
            .collect();
        assert_eq!(chunks, [64 * 1024, 64 * 1024, 22 * 1024]);
        assert_eq!(e.last(), Some(&(SyncId::Done, 1_700_000_000, 0)));
        assert_eq!(e.len(), 5);
    }

    #[tokio::test]
    async fn push_of_empty_file_sends_only_done() {
        let mut c = sync_over(b"OKAY\0\0\0\0").await;
        c.push(&b""[..], "/tmp/empty", 0o644, 5).await.unwrap();
        let e = entries(&written(&c));
        assert_eq!(e.iter().map(|x| x.0).collect::<Vec<_>>(), [SyncId::Send, SyncId::Done]);
    }

    #[tokio::test]
    async fn push_failure_carries_reason() {
        let mut c = sync_over(b"FAIL\x11\0\0\0permission denied").await;
        let err = c.push(&b"abc"[..], "/system/x", 0o644, 0).await.unwrap_err();
        assert!(matches!(&err, Error::RequestFailed { reason } if reason == "permission denied"));
    }

    #[tokio::test]
    async fn pull_concatenates_until_done() {
        let mut c = sync_over(b"DATA\x03\0\0\0abcDATA\x02\0\0\0deDONE\0\0\0\0").await;
        let mut out = Vec::new();
        let n = c.pull("/sdcard/f", &mut out).await.unwrap();
        assert_eq!(n, 5);
        assert_eq!(out, b"abcde");
        assert_eq!(written(&c), b"RECV\x09\0\0\0/sdcard/f");
    }

    #[tokio::test]
    async fn fail_mid_pull_keeps_partial_output() {
        let mut c = sync_over(b"DATA\x03\0\0\0abcFAIL\x04\0\0\0gone").await;
        let mut out = Vec::new();
        let err = c.pull("/sdcard/f", &mut out).await.unwrap_err();
        assert!(matches!(&err, Error::RequestFailed { reason } if reason == "gone"));
        assert_eq!(out, b"abc");
    }

    #[tokio::test]
    async fn unknown_entry_is_protocol_fault() {
        let mut c = sync_over(b"WHAT\0\0\0\0").await;
        let err = c.pull("/x", Vec::new()).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(dbridge_proto::Error::UnknownSyncId(_))));
        assert!(!c.session.is_connected());
    }

    #[tokio::test]
    async fn oversized_data_chunk_is_protocol_fault() {
        let mut script = b"DATA".to_vec();
        script.extend(((MAX_CHUNK + 1) as u32).to_le_bytes());
        script.extend(vec![0u8; MAX_CHUNK + 1]);
        script.extend_from_slice(b"DONE\0\0\0\0");
        let mut c = sync_over(&script).await;

        let mut out = Vec::new();
        let err = c.pull("/sdcard/big", &mut out).await.unwrap_err();
        let too_large = matches!(
            err,
            Error::Protocol(dbridge_proto::Error::TooLarge { len, .. }) if len == MAX_CHUNK + 1
        );
        assert!(too_large, "{err}");
        assert!(out.is_empty());
        assert!(!c.session.is_connected());
    }

    #[tokio::test]
    async fn oversized_failure_reason_is_protocol_fault() {
        let mut c = sync_over(b"FAIL\xff\xff\xff\xff").await;
        let err = c.pull("/sdcard/f", Vec::new()).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(dbridge_proto::Error::TooLarge { .. })), "{err}");
        assert!(!c.session.is_connected());
    }

    #[tokio::test]
    async fn oversized_dent_name_is_protocol_fault() {
        let mut reply = b"DENT".to_vec();
        reply.extend(stat_body(0o100_644, 1, 1));
        reply.extend(u32::MAX.to_le_bytes());
        let mut c = sync_over(&reply).await;
        let err = c.list("/sdcard").await.unwrap_err();
        assert!(matches!(err, Error::Protocol(dbridge_proto::Error::TooLarge { .. })), "{err}");
    }

    /// Yields one chunk, then fails.
    struct FailingReader {
        /// Whether the first chunk was returned.
        served: bool,
    }

    impl AsyncRead for FailingReader {
        fn poll_read(
            mut self: std::pin::Pin<&mut Self>,
            _: &mut std::task::Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            if self.served {
                return std::task::Poll::Ready(Err(std::io::Error::other("disk gone")));
            }
            self.served = true;
            buf.put_slice(b"abc");
            std::task::Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn local_read_error_mid_push_disconnects() {
        let mut c = sync_over(b"").await;
        let err = c
            .push(FailingReader { served: false }, "/x", 0o644, 0)
            .await
            .unwrap_err();
        assert!(matches!(&err, Error::Io(e) if e.to_string() == "disk gone"), "{err}");
        assert!(!c.session.is_connected());
    }

    #[tokio::test]
    async fn stat_failure_carries_reason() {
        let mut c = sync_over(b"FAIL\x06\0\0\0denied").await;
        let err = c.stat("/data").await.unwrap_err();
        assert!(matches!(&err, Error::RequestFailed { reason } if reason == "denied"), "{err}");
        assert!(c.session.is_connected());
    }

    #[tokio::test]
    async fn stat_with_wrong_reply_id_is_fault() {
        let mut c = sync_over(b"DONE\0\0\0\0\0\0\0\0\0\0\0\0").await;
        let err = c.stat("/data").await.unwrap_err();
        assert!(matches!(err, Error::Protocol(dbridge_proto::Error::Malformed { .. })), "{err}");
        assert!(!c.session.is_connected());
    }

    #[tokio::test]
    async fn stat_decodes_fields() {
        let mut reply = b"STAT".to_vec();
        reply.extend(stat_body(0o040_755, 4096, 1_600_000_000));
        let mut c = sync_over(&reply).await;
        let st = c.stat("/sdcard").await.unwrap();
        assert!(st.exists() && st.is_dir());
        assert_eq!(st.size, 4096);
        assert_eq!(st.mtime, 1_600_000_000);
    }

    #[tokio::test]
    async fn list_reads_dents_until_done() {
        let mut reply = Vec::new();
        for (mode, size, name) in [(0o100_644u32, 12u32, "a.txt"), (0o040_755, 0, "dir")] {
            reply.extend_from_slice(b"DENT");
            reply.extend(stat_body(mode, size, 99));
            reply.extend((name.len() as u32).to_le_bytes());
            reply.extend_from_slice(name.as_bytes());
        }
        reply.extend_from_slice(b"DONE");
        reply.extend([0u8; 16]);

        let mut c = sync_over(&reply).await;
        let list = c.list("/sdcard").await.unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].name, "a.txt");
        assert_eq!(list[0].stat.size, 12);
        assert!(list[1].stat.is_dir());
        assert!(c.session.is_connected());
    }

    #[tokio::test]
    async fn pull_file_writes_and_wraps_errors() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("out.bin");
        let script = b"DATA\x02\0\0\0hiDONE\0\0\0\0DATA\x01\0\0\0!FAIL\x04\0\0\0lost";
        let mut c = sync_over(script).await;
        c.pull_file("/sdcard/hi", &local).await.unwrap();
        assert_eq!(std::fs::read(&local).unwrap(), b"hi");

        let err = c.pull_file("/sdcard/lost", &local).await.unwrap_err();
        assert!(matches!(err.root(), Error::RequestFailed { .. }));
        assert!(err.to_string().starts_with("/sdcard/lost: "));
    }

    #[tokio::test]
    async fn push_file_reports_missing_local_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        let mut c = sync_over(b"").await;
        let err = c.push_file(&missing, "/sdcard/nope").await.unwrap_err();
        assert!(matches!(err, Error::File { .. }));
        assert!(matches!(err.root(), Error::Io(_)));
    }

    #[tokio::test]
    async fn quit_sends_quit_and_disconnects() {
        let c = sync_over(b"").await;
        let closer = c.session.transport().unwrap().closer().clone();
        c.quit().await.unwrap();
        assert!(closer.is_closed());
    }
}
