use std::io::{self, ErrorKind};
use std::ops::BitOr;
use std::os::fd::{AsRawFd, BorrowedFd};

/// Capacity of the receive buffer, large enough for any queue message.
pub const FRAME_BUFFER_SIZE: usize = 65535;

/// Flags handed unchanged to the receive primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecvFlags(libc::c_int);

impl RecvFlags {
    pub const BLOCKING: RecvFlags = RecvFlags(0);
    pub const DONT_WAIT: RecvFlags = RecvFlags(libc::MSG_DONTWAIT);

    pub const fn from_bits(bits: libc::c_int) -> Self {
        RecvFlags(bits)
    }

    pub const fn bits(self) -> libc::c_int {
        self.0
    }
}

impl BitOr for RecvFlags {
    type Output = RecvFlags;

    fn bitor(self, rhs: RecvFlags) -> RecvFlags {
        RecvFlags(self.0 | rhs.0)
    }
}

/// Something frames can be received from.
///
/// The intake loop never opens or closes the endpoint behind it; implementors
/// are capability tokens over a resource someone else owns.
pub trait FrameSource {
    /// Receive one message into `buf`, returning its length. `Ok(0)` means
    /// the other end closed the channel. A length above `buf.len()` means the
    /// message did not fit and its tail was discarded.
    fn recv(&self, buf: &mut [u8], flags: RecvFlags) -> io::Result<usize>;
}

impl<S: FrameSource + ?Sized> FrameSource for &S {
    fn recv(&self, buf: &mut [u8], flags: RecvFlags) -> io::Result<usize> {
        (**self).recv(buf, flags)
    }
}

/// A queue socket borrowed from its owner.
#[derive(Debug, Clone, Copy)]
pub struct Socket<'fd> {
    fd: BorrowedFd<'fd>,
}

impl<'fd> Socket<'fd> {
    pub fn new(fd: BorrowedFd<'fd>) -> Self {
        Self { fd }
    }
}

impl FrameSource for Socket<'_> {
    fn recv(&self, buf: &mut [u8], flags: RecvFlags) -> io::Result<usize> {
        // MSG_TRUNC makes the kernel report the full message length.
        // SAFETY: `buf` is valid for writes of `buf.len()` bytes and the
        // descriptor is kept open by the `BorrowedFd` lifetime.
        let rv = unsafe {
            libc::recv(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr().cast(),
                buf.len(),
                flags.bits() | libc::MSG_TRUNC,
            )
        };

        if rv < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(rv as usize)
        }
    }
}

/// Result of a single receive attempt.
#[derive(Debug)]
pub enum RecvOutcome {
    /// A frame of this many bytes is in the reader's buffer.
    Data(usize),
    /// Orderly closure.
    Closed,
    /// Nothing available right now (non-blocking receive).
    WouldBlock,
    /// The receive failed; the error carries the raw OS code.
    Failed(io::Error),
}

/// Receives frames from a [`FrameSource`] into one reused buffer.
///
/// One call to [`FrameReader::receive`] is exactly one receive attempt. There
/// is no retry here, `EINTR` included.
///
/// A message larger than the buffer is still delivered, cut to the buffer
/// size, and counted in [`FrameReader::truncated`].
pub struct FrameReader<S> {
    source: S,
    buf: Box<[u8]>,
    truncated: u64,
}

impl<S: FrameSource> FrameReader<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            buf: vec![0u8; FRAME_BUFFER_SIZE].into_boxed_slice(),
            truncated: 0,
        }
    }

    pub fn receive(&mut self, flags: RecvFlags) -> RecvOutcome {
        match self.source.recv(&mut self.buf, flags) {
            Ok(0) => RecvOutcome::Closed,
            Ok(len) if len > self.buf.len() => {
                self.truncated += 1;
                log::warn!(
                    "Frame of {len} bytes truncated to {} bytes",
                    self.buf.len()
                );
                RecvOutcome::Data(self.buf.len())
            }
            Ok(len) => RecvOutcome::Data(len),
            Err(err) if err.kind() == ErrorKind::WouldBlock => RecvOutcome::WouldBlock,
            Err(err) => RecvOutcome::Failed(err),
        }
    }

    /// The first `len` bytes of the last received frame.
    pub fn frame(&self, len: usize) -> &[u8] {
        &self.buf[..len]
    }

    /// Frames that did not fit in the buffer so far.
    pub fn truncated(&self) -> u64 {
        self.truncated
    }
}
