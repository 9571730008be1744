//! Buffered bidirectional byte pipe over a single descriptor.
//!
//! A [`Channel`] wraps a non-blocking I/O backend with two owned byte
//! queues. The read side retains any over-read bytes for the next call;
//! the write side queues whatever the backend could not accept so that
//! no byte handed to [`Channel::write`] is ever silently dropped. Both
//! queues grow as needed; the chunk size only bounds individual backend
//! operations.

use std::collections::VecDeque;
use std::io;

use thiserror::Error;

/// Unit of a single backend read or write.
pub const CHUNK_SIZE: usize = 4096;

/// Errors surfaced by channel operations.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// A previous I/O error latched the channel into the failed state.
    #[error("channel has already failed")]
    Failed,

    /// The peer closed its end and no buffered bytes remain.
    #[error("channel closed by peer")]
    Closed,

    /// The backend reported an I/O error. The channel is now failed.
    #[error("channel I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Non-blocking byte source/sink a [`Channel`] buffers on top of.
///
/// `WouldBlock` means "nothing to transfer right now" and is never an
/// error; `Ok(0)` from a read means the peer closed the stream.
pub trait ChannelBackend {
    /// Reads at most `buf.len()` bytes without blocking.
    fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Writes a prefix of `data` without blocking, returning how many
    /// bytes the backend accepted.
    fn write_chunk(&mut self, data: &[u8]) -> io::Result<usize>;
}

impl ChannelBackend for tokio::net::UnixStream {
    fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.try_read(buf)
    }

    fn write_chunk(&mut self, data: &[u8]) -> io::Result<usize> {
        self.try_write(data)
    }
}

/// A buffered channel over backend `B`.
///
/// Dropping the channel drops the backend, which closes the underlying
/// descriptor for owning backends.
pub struct Channel<B> {
    backend: B,
    read_buffer: VecDeque<u8>,
    write_buffer: VecDeque<u8>,
    failed: bool,
}

impl<B: ChannelBackend> Channel<B> {
    /// Wraps `backend` with empty queues.
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            read_buffer: VecDeque::new(),
            write_buffer: VecDeque::new(),
            failed: false,
        }
    }

    /// Shared access to the backend, e.g. for readiness polling.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Whether a previous I/O error latched the channel as failed.
    pub fn failed(&self) -> bool {
        self.failed
    }

    /// Whether the write queue holds bytes awaiting a writable backend.
    pub fn has_pending_write(&self) -> bool {
        !self.write_buffer.is_empty()
    }

    /// Number of bytes queued on the write side.
    pub fn pending_write_len(&self) -> usize {
        self.write_buffer.len()
    }

    /// Number of over-read bytes retained on the read side.
    pub fn pending_read_len(&self) -> usize {
        self.read_buffer.len()
    }

    /// Reads at most `n` bytes.
    ///
    /// Drains the read queue first, then performs chunk-sized backend
    /// reads until `n` bytes are gathered, the backend runs dry, or a
    /// backend read comes back short. Bytes read beyond `n` stay queued
    /// for the next call. An empty result means no data was available;
    /// peer close with nothing buffered is [`ChannelError::Closed`].
    pub fn read(&mut self, n: usize) -> Result<Vec<u8>, ChannelError> {
        if self.failed {
            return Err(ChannelError::Failed);
        }

        let mut out = Vec::with_capacity(n.min(CHUNK_SIZE));
        let from_queue = n.min(self.read_buffer.len());
        out.extend(self.read_buffer.drain(..from_queue));

        let mut chunk = [0u8; CHUNK_SIZE];
        while out.len() < n {
            match self.backend.read_chunk(&mut chunk) {
                Ok(0) => {
                    if out.is_empty() {
                        return Err(ChannelError::Closed);
                    }
                    break;
                }
                Ok(got) => {
                    let wanted = n - out.len();
                    let serve = got.min(wanted);
                    out.extend_from_slice(&chunk[..serve]);
                    if got > serve {
                        // Over-read: already consumed from the descriptor,
                        // so it must be retained for the next call.
                        self.read_buffer.extend(&chunk[serve..got]);
                        break;
                    }
                    if got < CHUNK_SIZE {
                        // Short chunk: assume no more data right now.
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.failed = true;
                    return Err(ChannelError::Io(e));
                }
            }
        }

        Ok(out)
    }

    /// Writes `data`, queueing whatever the backend cannot take now.
    ///
    /// Previously queued bytes are drained first, in order; if the drain
    /// stalls, `data` is queued wholesale (an interleaved send would
    /// reorder the stream). Returns the total bytes the backend accepted
    /// during this call, from the queue and from `data` combined.
    pub fn write(&mut self, data: &[u8]) -> Result<usize, ChannelError> {
        if self.failed {
            return Err(ChannelError::Failed);
        }

        let mut accepted = 0;

        while !self.write_buffer.is_empty() {
            let queued = self.write_buffer.make_contiguous();
            let take = queued.len().min(CHUNK_SIZE);
            match self.backend.write_chunk(&queued[..take]) {
                Ok(0) => break,
                Ok(sent) => {
                    self.write_buffer.drain(..sent);
                    accepted += sent;
                    if sent < take {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.failed = true;
                    return Err(ChannelError::Io(e));
                }
            }
        }

        if !self.write_buffer.is_empty() {
            self.write_buffer.extend(data);
            return Ok(accepted);
        }

        let mut offset = 0;
        while offset < data.len() {
            let end = (offset + CHUNK_SIZE).min(data.len());
            match self.backend.write_chunk(&data[offset..end]) {
                Ok(0) => break,
                Ok(sent) => {
                    let chunk_len = end - offset;
                    accepted += sent;
                    offset += sent;
                    if sent < chunk_len {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.failed = true;
                    return Err(ChannelError::Io(e));
                }
            }
        }

        if offset < data.len() {
            self.write_buffer.extend(&data[offset..]);
        }

        Ok(accepted)
    }

    /// Retries draining the write queue. Equivalent to `write(&[])`.
    pub fn flush_writes(&mut self) -> Result<usize, ChannelError> {
        self.write(&[])
    }
}
