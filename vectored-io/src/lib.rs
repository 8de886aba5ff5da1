//! Scatter/gather write helpers.
//!
//! The TUN device hands us a fresh list of outbound buffers on every poll
//! iteration; rather than concatenating them into one allocation per write,
//! these writers push the list straight into `writev` (or the nearest
//! equivalent the target exposes) with a cached, per-sink descriptor array.

use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Mutex;
use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// A 65535-byte scratch buffer pool. Coalescing below this size reuses one of
/// these instead of allocating fresh heap memory for every multi-buffer
/// write.
const POOLED_SCRATCH_SIZE: usize = 65_535;

struct RawFdHandle(RawFd);

impl AsRawFd for RawFdHandle {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

/// A syscall-level vectorised writer over a raw, non-blocking file
/// descriptor.
///
/// Owns a reusable `iovec` array behind a mutex so concurrent callers don't
/// stomp on each other's descriptors, and a `writev` retry loop that treats
/// `EAGAIN`/`EWOULDBLOCK` as "wait for writable, then try again" rather than
/// an error.
pub struct SyscallVectoredWriter {
    fd: AsyncFd<RawFdHandle>,
    iovecs: Mutex<Vec<libc::iovec>>,
}

// SAFETY: the `iov_base` pointers are populated and immediately consumed
// inside a single synchronous `try_io` closure, then reset to null before
// the closure returns; no pointer is ever held across an await point, so
// the type is sound to send across and share between threads.
unsafe impl Send for SyscallVectoredWriter {}
unsafe impl Sync for SyscallVectoredWriter {}

impl SyscallVectoredWriter {
    /// `fd` must be non-blocking and must outlive this writer; the writer
    /// never closes it.
    pub fn new(fd: RawFd) -> io::Result<Self> {
        Ok(Self {
            fd: AsyncFd::new(RawFdHandle(fd))?,
            iovecs: Mutex::new(Vec::new()),
        })
    }

    /// Writes every buffer in `buffers` in a single `writev` call. On
    /// success, exactly `sum(len(b))` bytes were written.
    pub async fn write_vectored(&self, buffers: &[&[u8]]) -> io::Result<()> {
        if buffers.is_empty() {
            return Ok(());
        }

        loop {
            let mut guard = self.fd.writable().await?;

            let result = guard.try_io(|inner| {
                let mut iovecs = self.iovecs.lock().expect("iovec cache lock poisoned");
                iovecs.clear();

                for buf in buffers {
                    iovecs.push(libc::iovec {
                        iov_base: buf.as_ptr() as *mut libc::c_void,
                        iov_len: buf.len(),
                    });
                }

                // SAFETY: every iovec points at a buffer that outlives this call.
                let ret = unsafe {
                    libc::writev(
                        inner.as_raw_fd(),
                        iovecs.as_ptr(),
                        iovecs.len() as libc::c_int,
                    )
                };

                for iovec in iovecs.iter_mut() {
                    *iovec = libc::iovec {
                        iov_base: std::ptr::null_mut(),
                        iov_len: 0,
                    };
                }

                if ret < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(ret as usize)
                }
            });

            match result {
                Ok(inner) => return inner.map(|_| ()),
                Err(_would_block) => continue,
            }
        }
    }
}

/// A fallback vectorised writer for any [`AsyncWrite`] that doesn't expose a
/// real scatter/gather primitive: coalesce and issue one write.
pub struct BufferedVectoredWriter<W> {
    upstream: Mutex<W>,
    scratch: Mutex<Vec<u8>>,
}

impl<W: AsyncWrite + Unpin> BufferedVectoredWriter<W> {
    pub fn new(upstream: W) -> Self {
        Self {
            upstream: Mutex::new(upstream),
            scratch: Mutex::new(Vec::with_capacity(POOLED_SCRATCH_SIZE)),
        }
    }

    pub async fn write_vectored(&self, buffers: &[&[u8]]) -> io::Result<()> {
        let total_len: usize = buffers.iter().map(|b| b.len()).sum();

        match buffers.len() {
            0 => Ok(()),
            1 => {
                let mut upstream = self.upstream.lock().expect("upstream lock poisoned");
                upstream.write_all(buffers[0]).await
            }
            _ => {
                let mut scratch_guard = self.scratch.lock().expect("scratch lock poisoned");

                let mut owned_scratch;
                let scratch: &mut Vec<u8> = if total_len <= POOLED_SCRATCH_SIZE {
                    scratch_guard.clear();
                    &mut scratch_guard
                } else {
                    owned_scratch = Vec::with_capacity(total_len);
                    &mut owned_scratch
                };

                for buf in buffers {
                    scratch.extend_from_slice(buf);
                }

                let mut upstream = self.upstream.lock().expect("upstream lock poisoned");
                upstream.write_all(scratch).await
            }
        }
    }
}

/// A target [`for_target`] knows how to pick a writer for. Sockets and other
/// fd-backed streams hand back their descriptor so the syscall-level writer
/// gets used; anything else keeps the default `None` and falls back to the
/// buffered coalescing writer.
pub trait VectoredTarget: AsyncWrite + Unpin {
    fn raw_fd(&self) -> Option<RawFd> {
        None
    }
}

impl VectoredTarget for tokio::net::TcpStream {
    fn raw_fd(&self) -> Option<RawFd> {
        Some(self.as_raw_fd())
    }
}

impl VectoredTarget for tokio::net::UnixStream {
    fn raw_fd(&self) -> Option<RawFd> {
        Some(self.as_raw_fd())
    }
}

impl VectoredTarget for tokio::io::DuplexStream {}

/// Picked by [`for_target`]: either variant exposes the same
/// `write_vectored`, so callers never need to know which one they got.
pub enum VectoredWriter<W> {
    Syscall {
        writer: SyscallVectoredWriter,
        // Keeps the fd `writer` owns alive for as long as this writer is;
        // the syscall writer only borrows the raw descriptor.
        _owner: W,
    },
    Buffered(BufferedVectoredWriter<W>),
}

impl<W: AsyncWrite + Unpin> VectoredWriter<W> {
    pub async fn write_vectored(&self, buffers: &[&[u8]]) -> io::Result<()> {
        match self {
            Self::Syscall { writer, .. } => writer.write_vectored(buffers).await,
            Self::Buffered(writer) => writer.write_vectored(buffers).await,
        }
    }
}

/// The "already a raw kernel handle" branch of the type probe: no
/// ambiguity to resolve, so this is the direct constructor rather than
/// something routed through [`for_target`].
pub fn for_raw_fd(fd: RawFd) -> io::Result<SyscallVectoredWriter> {
    SyscallVectoredWriter::new(fd)
}

/// The construction-time type probe: a target that exposes a raw descriptor
/// gets the syscall-level writer, everything else gets the buffered
/// fallback.
pub fn for_target<W: VectoredTarget>(writer: W) -> io::Result<VectoredWriter<W>> {
    match writer.raw_fd() {
        Some(fd) => Ok(VectoredWriter::Syscall {
            writer: SyscallVectoredWriter::new(fd)?,
            _owner: writer,
        }),
        None => Ok(VectoredWriter::Buffered(BufferedVectoredWriter::new(writer))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn syscall_writer_writes_full_sum_of_buffers() {
        let (read_end, write_end) = nix_pipe();

        let writer = SyscallVectoredWriter::new(write_end).unwrap();
        writer
            .write_vectored(&[b"hello, ".as_slice(), b"world".as_slice()])
            .await
            .unwrap();

        let mut file = unsafe { <std::fs::File as std::os::fd::FromRawFd>::from_raw_fd(read_end) };
        let mut buf = [0u8; 32];
        use std::io::Read;
        let n = file.read(&mut buf).unwrap();

        assert_eq!(&buf[..n], b"hello, world");
    }

    #[tokio::test]
    async fn buffered_writer_coalesces_multiple_buffers() {
        let (tx, mut rx) = tokio::io::duplex(128);
        let writer = BufferedVectoredWriter::new(tx);

        writer
            .write_vectored(&[b"a".as_slice(), b"b".as_slice(), b"c".as_slice()])
            .await
            .unwrap();

        let mut buf = [0u8; 3];
        use tokio::io::AsyncReadExt;
        rx.read_exact(&mut buf).await.unwrap();

        assert_eq!(&buf, b"abc");
    }

    #[tokio::test]
    async fn for_target_picks_buffered_writer_for_a_duplex_stream() {
        let (a, mut b) = tokio::io::duplex(128);
        let writer = for_target(a).unwrap();
        assert!(matches!(writer, VectoredWriter::Buffered(_)));

        writer
            .write_vectored(&[b"x".as_slice(), b"y".as_slice()])
            .await
            .unwrap();

        let mut buf = [0u8; 2];
        use tokio::io::AsyncReadExt;
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"xy");
    }

    #[tokio::test]
    async fn for_target_picks_syscall_writer_for_a_unix_stream() {
        let (a, mut b) = tokio::net::UnixStream::pair().unwrap();
        let writer = for_target(a).unwrap();
        assert!(matches!(writer, VectoredWriter::Syscall { .. }));

        writer
            .write_vectored(&[b"hi".as_slice()])
            .await
            .unwrap();

        let mut buf = [0u8; 2];
        use tokio::io::AsyncReadExt;
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }

    fn nix_pipe() -> (RawFd, RawFd) {
        let mut fds = [0i32; 2];
        let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK) };
        assert_eq!(ret, 0);
        (fds[0], fds[1])
    }
}
