use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::buffer_pool::lease_buffer;
use crate::error::{Result, TunnelError};

/// Default read/write deadline of the deadline-aware copy
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-operation deadlines for [`copy_with_deadline`]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct IoTimeouts {
    pub read: Duration,
    pub write: Duration,
}

impl IoTimeouts {
    pub fn uniform(timeout: Duration) -> Self {
        Self {
            read: timeout,
            write: timeout,
        }
    }
}

impl Default for IoTimeouts {
    fn default() -> Self {
        Self::uniform(DEFAULT_IO_TIMEOUT)
    }
}

/// How a relay direction moves bytes from its source to its destination
///
/// `Plain` stops only on EOF, an I/O error, or when the relay drops it.
/// `Deadline` bounds every read and write, retries on expiry and checks the
/// cancellation token between reads.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum CopyMode {
    /// Continuous copy without deadlines
    #[default]
    Plain,
    /// Deadline-bounded copy with cooperative cancellation
    Deadline(IoTimeouts),
}

impl CopyMode {
    /// Copy `src` into `dst` until EOF, error, or cancellation
    ///
    /// Returns the number of bytes written and the terminal error, if any.
    pub async fn copy<R, W>(
        &self,
        src: &mut R,
        dst: &mut W,
        cancel: &CancellationToken,
    ) -> (u64, Result<()>)
    where
        R: AsyncRead + Unpin + ?Sized,
        W: AsyncWrite + Unpin + ?Sized,
    {
        match self {
            CopyMode::Plain => copy_plain(src, dst).await,
            CopyMode::Deadline(timeouts) => copy_with_deadline(src, dst, cancel, *timeouts).await,
        }
    }
}

/// Whether an I/O error is a deadline expiry rather than a failure
fn is_timeout(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::TimedOut
}

/// Continuous copy with a pooled buffer
pub async fn copy_plain<R, W>(src: &mut R, dst: &mut W) -> (u64, Result<()>)
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = lease_buffer();
    let mut written = 0u64;

    loop {
        let n = match src.read(buf.as_mut_slice()).await {
            Ok(0) => return (written, Ok(())),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return (written, Err(e.into())),
        };

        if let Err(e) = dst.write_all(&buf.as_slice()[..n]).await {
            return (written, Err(e.into()));
        }
        written += n as u64;
    }
}

/// Deadline-aware copy with cooperative cancellation
///
/// Before each read the cancellation token is checked; once cancelled the
/// copy stops without error. Deadline expiry on either side is retried. A
/// write that accepts fewer bytes than were read ends the copy with
/// [`TunnelError::ShortWrite`].
pub async fn copy_with_deadline<R, W>(
    src: &mut R,
    dst: &mut W,
    cancel: &CancellationToken,
    timeouts: IoTimeouts,
) -> (u64, Result<()>)
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = lease_buffer();
    let mut written = 0u64;

    loop {
        if cancel.is_cancelled() {
            return (written, Ok(()));
        }

        let nr = match tokio::time::timeout(timeouts.read, src.read(buf.as_mut_slice())).await {
            Err(_) => {
                trace!("read deadline expired after {:?}", timeouts.read);
                continue;
            }
            Ok(Ok(0)) => return (written, Ok(())),
            Ok(Ok(n)) => n,
            Ok(Err(e)) if is_timeout(&e) || e.kind() == io::ErrorKind::Interrupted => continue,
            Ok(Err(e)) => return (written, Err(e.into())),
        };

        match write_with_deadline(dst, &buf.as_slice()[..nr], cancel, timeouts.write).await {
            Ok(Some(nw)) => {
                written += nw as u64;
                if nw != nr {
                    return (
                        written,
                        Err(TunnelError::ShortWrite {
                            expected: nr,
                            written: nw,
                        }),
                    );
                }
            }
            // Cancelled while the destination was stalled
            Ok(None) => return (written, Ok(())),
            Err(e) => return (written, Err(e)),
        }
    }
}

/// Issue one write of `chunk`, retrying while its deadline keeps expiring
///
/// Returns the bytes the write accepted, or `Ok(None)` if cancellation is
/// observed between attempts.
async fn write_with_deadline<W>(
    dst: &mut W,
    chunk: &[u8],
    cancel: &CancellationToken,
    timeout: Duration,
) -> Result<Option<usize>>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    loop {
        match tokio::time::timeout(timeout, dst.write(chunk)).await {
            Err(_) => trace!("write deadline expired after {:?}", timeout),
            Ok(Ok(n)) => return Ok(Some(n)),
            Ok(Err(e)) if is_timeout(&e) || e.kind() == io::ErrorKind::Interrupted => {}
            Ok(Err(e)) => return Err(e.into()),
        }
        if cancel.is_cancelled() {
            return Ok(None);
        }
    }
}
