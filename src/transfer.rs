//! Chunked transfer engine: moves a byte stream between a local handle and
//! the remote media endpoints in bounded chunks, one chunk of memory at a
//! time, emitting a progress event per completed chunk.
//!
//! The engine is network-free; the HTTP side lives behind the
//! [`UploadTransport`] and [`DownloadTransport`] traits (see `api.rs` for
//! the real implementations).

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

use crate::error::Error;

/// Server-imposed granularity of resumable transfers. Chunk sizes are
/// always a positive multiple of this.
pub const MINIMUM_CHUNK_SIZE: u64 = 256 * 1024;

pub const MIB: u64 = 1024 * 1024;

/// Resolves a chunk size given in fractional MiB to the nearest multiple of
/// [`MINIMUM_CHUNK_SIZE`], never below one unit.
pub fn resolve_chunk_size(mib: f64) -> u64 {
    const MAX_UNITS: u64 = u64::MAX / MINIMUM_CHUNK_SIZE;
    let units = (mib * MIB as f64 / MINIMUM_CHUNK_SIZE as f64).round();
    if units >= 1.0 {
        // The cast saturates, the clamp keeps the multiply in range.
        (units as u64).min(MAX_UNITS) * MINIMUM_CHUNK_SIZE
    } else {
        // NaN and everything below one unit clamp up.
        MINIMUM_CHUNK_SIZE
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Upload,
    Download,
}

/// Session states. Uploads walk the full sequence; downloads skip the two
/// initiation states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    NotStarted,
    InitiationStarted,
    InitiationComplete,
    MediaInProgress,
    MediaComplete,
}

/// One observation of a running transfer.
#[derive(Debug, Clone, Copy)]
pub struct ProgressEvent {
    pub direction: Direction,
    pub state: TransferState,
    pub bytes_moved: u64,
    /// Absent when the source length is unknown (streamed input).
    pub total_bytes: Option<u64>,
}

impl ProgressEvent {
    /// Fractional progress in [0, 1], if the total is known.
    pub fn fraction(&self) -> Option<f64> {
        self.total_bytes
            .filter(|t| *t > 0)
            .map(|t| self.bytes_moved as f64 / t as f64)
    }
}

/// Outcome of one accepted media chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkAck {
    /// The server recorded the range and expects more.
    Incomplete,
    /// The media is complete.
    Complete,
}

/// Remote side of a resumable upload.
pub trait UploadTransport {
    /// Opens a session and returns its URI. Carries only metadata, so it is
    /// always retry-eligible regardless of the source.
    fn initiate(&mut self) -> Result<String, Error>;

    /// Sends bytes `[offset, offset + data.len())`. `total` carries the
    /// overall media length once known; `None` means more chunks follow.
    /// An empty `data` with a known `total` finalizes a stream that ended
    /// on a chunk boundary. `retryable == false` means one attempt only.
    fn send_chunk(
        &mut self,
        session_uri: &str,
        offset: u64,
        data: &[u8],
        total: Option<u64>,
        retryable: bool,
    ) -> Result<ChunkAck, Error>;
}

/// Remote side of a ranged download.
pub trait DownloadTransport {
    /// Media length, when the remote index knows it.
    fn total_len(&self) -> Option<u64>;

    /// Reads up to `len` bytes at `offset` into `buf` (cleared first).
    /// Returns the number of bytes read; fewer than `len` means end of
    /// media.
    fn read_range(&mut self, offset: u64, len: u64, buf: &mut Vec<u8>) -> Result<usize, Error>;
}

/// Local byte source for an upload.
pub enum UploadSource {
    /// Seekable file with a known length.
    File { file: File, len: u64 },
    /// Non-seekable stream of unknown length (standard input).
    Stream(Box<dyn Read>),
}

impl UploadSource {
    pub fn open(path: &Path) -> Result<Self, Error> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        Ok(UploadSource::File { file, len })
    }

    pub fn stdin() -> Self {
        UploadSource::Stream(Box::new(io::stdin()))
    }

    pub fn len(&self) -> Option<u64> {
        match self {
            UploadSource::File { len, .. } => Some(*len),
            UploadSource::Stream(_) => None,
        }
    }

    /// Whether a partially-sent chunk can be retried. A stream cannot be
    /// repositioned, so its chunks get exactly one attempt each.
    pub fn retry_supported(&self) -> bool {
        matches!(self, UploadSource::File { .. })
    }

    fn reader(&mut self) -> &mut dyn Read {
        match self {
            UploadSource::File { file, .. } => file,
            UploadSource::Stream(r) => r,
        }
    }
}

/// Drives one resumable upload session to completion.
pub struct Uploader<T> {
    transport: T,
    source: UploadSource,
    chunk_size: u64,
    state: TransferState,
    bytes_sent: u64,
}

impl<T: UploadTransport> Uploader<T> {
    pub fn new(transport: T, source: UploadSource, chunk_size: u64) -> Self {
        Uploader {
            transport,
            source,
            chunk_size,
            state: TransferState::NotStarted,
            bytes_sent: 0,
        }
    }

    pub fn retry_supported(&self) -> bool {
        self.source.retry_supported()
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    /// Runs the session to `MediaComplete`, returning the bytes sent.
    pub fn run(
        &mut self,
        mut on_progress: impl FnMut(&ProgressEvent),
    ) -> Result<u64, Error> {
        let total = self.source.len();
        let retryable = self.source.retry_supported();

        self.transition(TransferState::InitiationStarted, total, &mut on_progress);
        let session_uri = self.transport.initiate()?;
        self.transition(TransferState::InitiationComplete, total, &mut on_progress);
        tracing::debug!(%session_uri, ?total, retryable, "upload session open");

        let mut buf = vec![0u8; self.chunk_size as usize];
        loop {
            let n = read_full(self.source.reader(), &mut buf)?;

            // A short read ends a stream; a known length ends a file.
            let declared = match total {
                Some(t) => {
                    if n == 0 && self.bytes_sent < t {
                        return Err(Error::Protocol(format!(
                            "source ended at {} of {} declared bytes",
                            self.bytes_sent, t
                        )));
                    }
                    Some(t)
                }
                None if (n as u64) < self.chunk_size => Some(self.bytes_sent + n as u64),
                None => None,
            };

            let ack = self.transport.send_chunk(
                &session_uri,
                self.bytes_sent,
                &buf[..n],
                declared,
                retryable,
            )?;
            self.bytes_sent += n as u64;
            tracing::debug!(bytes_sent = self.bytes_sent, chunk = n, ?ack, "chunk sent");

            if n > 0 {
                self.transition(TransferState::MediaInProgress, total, &mut on_progress);
            }

            match ack {
                ChunkAck::Complete => {
                    self.transition(TransferState::MediaComplete, total, &mut on_progress);
                    return Ok(self.bytes_sent);
                }
                ChunkAck::Incomplete => {
                    if declared == Some(self.bytes_sent) {
                        return Err(Error::Protocol(
                            "server did not complete the session at the final chunk".into(),
                        ));
                    }
                }
            }
        }
    }

    fn transition(
        &mut self,
        state: TransferState,
        total: Option<u64>,
        on_progress: &mut impl FnMut(&ProgressEvent),
    ) {
        self.state = state;
        on_progress(&ProgressEvent {
            direction: Direction::Upload,
            state,
            bytes_moved: self.bytes_sent,
            total_bytes: total,
        });
    }
}

/// Drives one chunked download to completion.
pub struct Downloader<T> {
    transport: T,
    chunk_size: u64,
    state: TransferState,
    bytes_received: u64,
}

impl<T: DownloadTransport> Downloader<T> {
    pub fn new(transport: T, chunk_size: u64) -> Self {
        Downloader {
            transport,
            chunk_size,
            state: TransferState::NotStarted,
            bytes_received: 0,
        }
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    /// Streams the media into `out`, returning the bytes written.
    pub fn run(
        &mut self,
        out: &mut dyn Write,
        mut on_progress: impl FnMut(&ProgressEvent),
    ) -> Result<u64, Error> {
        let total = self.transport.total_len();
        let mut buf = Vec::with_capacity(self.chunk_size as usize);

        loop {
            let n = self
                .transport
                .read_range(self.bytes_received, self.chunk_size, &mut buf)?;
            out.write_all(&buf[..n])?;
            self.bytes_received += n as u64;
            tracing::debug!(bytes_received = self.bytes_received, chunk = n, "chunk received");

            if n > 0 {
                self.transition(TransferState::MediaInProgress, total, &mut on_progress);
            }

            let done = match total {
                Some(t) => {
                    if n == 0 && self.bytes_received < t {
                        return Err(Error::Protocol(format!(
                            "download ended at {} of {} bytes",
                            self.bytes_received, t
                        )));
                    }
                    self.bytes_received >= t
                }
                None => (n as u64) < self.chunk_size,
            };
            if done {
                out.flush()?;
                self.transition(TransferState::MediaComplete, total, &mut on_progress);
                return Ok(self.bytes_received);
            }
        }
    }

    fn transition(
        &mut self,
        state: TransferState,
        total: Option<u64>,
        on_progress: &mut impl FnMut(&ProgressEvent),
    ) {
        self.state = state;
        on_progress(&ProgressEvent {
            direction: Direction::Download,
            state,
            bytes_moved: self.bytes_received,
            total_bytes: total,
        });
    }
}

/// Fills `buf` from `r`, stopping early only at end of stream.
fn read_full(r: &mut dyn Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = r.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use tempfile::TempDir;

    #[test]
    fn chunk_size_resolves_to_nearest_positive_multiple() {
        // 10 MiB is exactly 40 units.
        assert_eq!(resolve_chunk_size(10.0), 40 * MINIMUM_CHUNK_SIZE);
        // Rounds to the nearest multiple.
        assert_eq!(resolve_chunk_size(10.3), 41 * MINIMUM_CHUNK_SIZE);
        assert_eq!(resolve_chunk_size(0.3), MINIMUM_CHUNK_SIZE);
        // Values that round to zero clamp up to one unit.
        assert_eq!(resolve_chunk_size(0.0), MINIMUM_CHUNK_SIZE);
        assert_eq!(resolve_chunk_size(0.1), MINIMUM_CHUNK_SIZE);
    }

    #[test]
    fn chunk_size_handles_extreme_inputs_without_overflow() {
        let huge = resolve_chunk_size(1e100);
        assert_eq!(huge % MINIMUM_CHUNK_SIZE, 0);
        assert_eq!(huge, (u64::MAX / MINIMUM_CHUNK_SIZE) * MINIMUM_CHUNK_SIZE);
        assert_eq!(resolve_chunk_size(f64::INFINITY), huge);
        assert_eq!(resolve_chunk_size(-5.0), MINIMUM_CHUNK_SIZE);
        assert_eq!(resolve_chunk_size(f64::NAN), MINIMUM_CHUNK_SIZE);
    }

    #[test]
    fn chunk_size_property_over_a_sweep() {
        for i in 0..200 {
            let mib = i as f64 * 0.37;
            let resolved = resolve_chunk_size(mib);
            assert!(resolved >= MINIMUM_CHUNK_SIZE);
            assert_eq!(resolved % MINIMUM_CHUNK_SIZE, 0);
            // Nearest multiple: off by at most half a unit from the request.
            let requested = mib * MIB as f64;
            if resolved > MINIMUM_CHUNK_SIZE {
                assert!((resolved as f64 - requested).abs() <= MINIMUM_CHUNK_SIZE as f64 / 2.0 + 1.0);
            }
        }
    }

    // -----------------------------------------------------------------
    // Upload engine against a recording transport
    // -----------------------------------------------------------------

    #[derive(Default)]
    struct RecordingUpload {
        chunks: Vec<(u64, usize, Option<u64>)>,
        retryable_seen: Vec<bool>,
        fail_chunk: Option<usize>,
    }

    impl UploadTransport for RecordingUpload {
        fn initiate(&mut self) -> Result<String, Error> {
            Ok("session-1".into())
        }

        fn send_chunk(
            &mut self,
            _session_uri: &str,
            offset: u64,
            data: &[u8],
            total: Option<u64>,
            retryable: bool,
        ) -> Result<ChunkAck, Error> {
            if self.fail_chunk == Some(self.chunks.len()) {
                return Err(Error::StreamNotRetryable("connection reset".into()));
            }
            self.chunks.push((offset, data.len(), total));
            self.retryable_seen.push(retryable);
            if total == Some(offset + data.len() as u64) {
                Ok(ChunkAck::Complete)
            } else {
                Ok(ChunkAck::Incomplete)
            }
        }
    }

    fn file_source(dir: &TempDir, len: usize) -> UploadSource {
        let path = dir.path().join("src.bin");
        let mut f = File::create(&path).unwrap();
        let block = vec![0xabu8; 64 * 1024];
        let mut written = 0;
        while written < len {
            let take = (len - written).min(block.len());
            f.write_all(&block[..take]).unwrap();
            written += take;
        }
        drop(f);
        UploadSource::open(&path).unwrap()
    }

    #[test]
    fn upload_of_25_mib_in_10_mib_chunks_is_three_chunks() {
        let dir = TempDir::new().unwrap();
        let total = 25 * MIB as usize;
        let chunk = 10 * MIB;

        let mut uploader = Uploader::new(RecordingUpload::default(), file_source(&dir, total), chunk);
        assert!(uploader.retry_supported());

        let mut events = Vec::new();
        let sent = uploader.run(|ev| events.push(*ev)).unwrap();
        assert_eq!(sent, 25 * MIB);
        assert_eq!(uploader.state(), TransferState::MediaComplete);

        let sizes: Vec<usize> = uploader.transport.chunks.iter().map(|c| c.1).collect();
        assert_eq!(sizes, vec![10 * MIB as usize, 10 * MIB as usize, 5 * MIB as usize]);
        // Every chunk of a seekable source may be retried.
        assert!(uploader.transport.retryable_seen.iter().all(|r| *r));

        let in_progress = events
            .iter()
            .filter(|e| e.state == TransferState::MediaInProgress)
            .count();
        let complete: Vec<_> = events
            .iter()
            .filter(|e| e.state == TransferState::MediaComplete)
            .collect();
        assert_eq!(in_progress, 3);
        assert_eq!(complete.len(), 1);
        assert_eq!(complete[0].bytes_moved, 25 * MIB);
        assert_eq!(complete[0].total_bytes, Some(25 * MIB));
        // Initiation phases precede the media phase.
        assert_eq!(events[0].state, TransferState::InitiationStarted);
        assert_eq!(events[1].state, TransferState::InitiationComplete);
    }

    #[test]
    fn streamed_upload_declares_total_at_the_short_chunk() {
        let data = vec![7u8; 700 * 1024];
        let source = UploadSource::Stream(Box::new(io::Cursor::new(data)));
        assert!(!source.retry_supported());

        let mut uploader = Uploader::new(RecordingUpload::default(), source, 512 * 1024);
        let sent = uploader.run(|_| {}).unwrap();
        assert_eq!(sent, 700 * 1024);

        let chunks = &uploader.transport.chunks;
        assert_eq!(chunks.len(), 2);
        // First full chunk goes out with an unknown total.
        assert_eq!(chunks[0], (0, 512 * 1024, None));
        // The short read reveals the total.
        assert_eq!(chunks[1], (512 * 1024, 188 * 1024, Some(700 * 1024)));
        // Stream chunks are single-attempt.
        assert!(uploader.transport.retryable_seen.iter().all(|r| !*r));
    }

    #[test]
    fn streamed_upload_on_chunk_boundary_sends_empty_finalizer() {
        let data = vec![1u8; 512 * 1024];
        let source = UploadSource::Stream(Box::new(io::Cursor::new(data)));

        let mut uploader = Uploader::new(RecordingUpload::default(), source, 256 * 1024);
        let sent = uploader.run(|_| {}).unwrap();
        assert_eq!(sent, 512 * 1024);

        let chunks = &uploader.transport.chunks;
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2], (512 * 1024, 0, Some(512 * 1024)));
    }

    #[test]
    fn streamed_upload_mid_chunk_failure_is_permanent() {
        let data = vec![9u8; 900 * 1024];
        let source = UploadSource::Stream(Box::new(io::Cursor::new(data)));
        let transport = RecordingUpload {
            fail_chunk: Some(1),
            ..Default::default()
        };

        let mut uploader = Uploader::new(transport, source, 256 * 1024);
        let mut events = Vec::new();
        let err = uploader.run(|ev| events.push(*ev)).unwrap_err();
        assert!(matches!(err, Error::StreamNotRetryable(_)));

        // Only the first chunk went through; nothing after the failure.
        assert_eq!(uploader.transport.chunks.len(), 1);
        assert!(events
            .iter()
            .all(|e| e.state != TransferState::MediaComplete));
    }

    #[test]
    fn empty_known_file_finalizes_immediately() {
        let dir = TempDir::new().unwrap();
        let mut uploader = Uploader::new(RecordingUpload::default(), file_source(&dir, 0), MIB);
        let sent = uploader.run(|_| {}).unwrap();
        assert_eq!(sent, 0);
        assert_eq!(uploader.transport.chunks, vec![(0, 0, Some(0))]);
    }

    // -----------------------------------------------------------------
    // Download engine against an in-memory transport
    // -----------------------------------------------------------------

    struct MemoryDownload {
        data: Vec<u8>,
        advertise_len: bool,
    }

    impl DownloadTransport for MemoryDownload {
        fn total_len(&self) -> Option<u64> {
            self.advertise_len.then_some(self.data.len() as u64)
        }

        fn read_range(
            &mut self,
            offset: u64,
            len: u64,
            buf: &mut Vec<u8>,
        ) -> Result<usize, Error> {
            buf.clear();
            let start = (offset as usize).min(self.data.len());
            let end = (start + len as usize).min(self.data.len());
            buf.extend_from_slice(&self.data[start..end]);
            Ok(end - start)
        }
    }

    #[test]
    fn download_writes_full_stream_and_completes_once() {
        let data: Vec<u8> = (0..1_300_000u32).map(|i| (i % 251) as u8).collect();
        let transport = MemoryDownload {
            data: data.clone(),
            advertise_len: true,
        };

        let mut out = Vec::new();
        let mut events = Vec::new();
        let mut dl = Downloader::new(transport, 512 * 1024);
        let got = dl.run(&mut out, |ev| events.push(*ev)).unwrap();

        assert_eq!(got, data.len() as u64);
        assert_eq!(out, data);
        assert_eq!(dl.state(), TransferState::MediaComplete);

        let complete: Vec<_> = events
            .iter()
            .filter(|e| e.state == TransferState::MediaComplete)
            .collect();
        assert_eq!(complete.len(), 1);
        assert_eq!(complete[0].bytes_moved, data.len() as u64);
        assert_eq!(complete[0].total_bytes, Some(data.len() as u64));
        assert_eq!(complete[0].fraction(), Some(1.0));
        // Downloads never enter the initiation states.
        assert!(events.iter().all(|e| {
            e.state == TransferState::MediaInProgress || e.state == TransferState::MediaComplete
        }));
    }

    #[test]
    fn download_with_unknown_length_stops_at_short_chunk() {
        let data = vec![5u8; 300 * 1024];
        let transport = MemoryDownload {
            data: data.clone(),
            advertise_len: false,
        };

        let mut out = Vec::new();
        let mut dl = Downloader::new(transport, 256 * 1024);
        let got = dl.run(&mut out, |_| {}).unwrap();
        assert_eq!(got, data.len() as u64);
        assert_eq!(out, data);
    }

    #[test]
    fn truncated_download_is_a_protocol_error() {
        struct Truncated;
        impl DownloadTransport for Truncated {
            fn total_len(&self) -> Option<u64> {
                Some(1024)
            }
            fn read_range(
                &mut self,
                _offset: u64,
                _len: u64,
                buf: &mut Vec<u8>,
            ) -> Result<usize, Error> {
                buf.clear();
                Ok(0)
            }
        }

        let mut dl = Downloader::new(Truncated, 512);
        let err = dl.run(&mut Vec::new(), |_| {}).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn fraction_is_none_without_total() {
        let ev = ProgressEvent {
            direction: Direction::Upload,
            state: TransferState::MediaInProgress,
            bytes_moved: 100,
            total_bytes: None,
        };
        assert!(ev.fraction().is_none());
    }
}
