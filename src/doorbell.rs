/*!
The doorbell: an `AF_UNIX` stream socket pair used as a counting wake-up
channel. The manager writes bytes on one end; consumers block on a one-byte
read of the other. A socket pair (rather than an eventfd) gives each queue
two independent byte streams - one for the data-available signal, one for
the await semaphore - with ordinary fd semantics on both ends.
*/

use crate::error::{QueueError, Result};
use crate::MAX_DQ_DEPTH;
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::socket::{recv, socketpair, AddressFamily, MsgFlags, SockFlag, SockType};
use nix::unistd::{close, read};
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

const LF_BURST: [u8; MAX_DQ_DEPTH] = [b'\n'; MAX_DQ_DEPTH];

/// Owner's view of a doorbell. Held by the manager (or embedded in a
/// standalone-free context); closes both fds on drop, which fails any
/// blocked reader with [`QueueError::Orphaned`].
#[derive(Debug)]
pub struct Doorbell {
    rd: RawFd,
    wr: RawFd,
}

impl Doorbell {
    pub fn new() -> Result<Doorbell> {
        let (rd, wr) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::empty(),
        )?;
        Ok(Doorbell { rd, wr })
    }

    /// The fd a consumer blocks on. Same-process consumers copy it; a
    /// spawning framework dups it into child processes.
    pub fn reader_fd(&self) -> RawFd {
        self.rd
    }

    /// Write `n` wake-up bytes in as few syscalls as the burst cap allows.
    pub fn ring(&self, n: usize) -> Result<()> {
        let mut left = n;
        while left > 0 {
            let chunk = left.min(MAX_DQ_DEPTH);
            crate::wire::write_all(self.wr, &LF_BURST[..chunk])?;
            left -= chunk;
        }
        Ok(())
    }

    /// Block until one byte arrives, then consume it.
    pub fn wait(&self) -> Result<()> {
        wait_byte(self.rd)
    }

    /// Consume one byte if one is pending right now.
    pub fn try_take(&self) -> Result<bool> {
        try_take(self.rd)
    }
}

impl Drop for Doorbell {
    fn drop(&mut self) {
        let _ = close(self.rd);
        let _ = close(self.wr);
    }
}

/// Consumer's view: just the read fd. Copyable so every worker handle can
/// carry one; the owning [`Doorbell`] controls the lifetime.
#[derive(Debug, Clone, Copy)]
pub struct DoorbellReader {
    fd: RawFd,
}

impl DoorbellReader {
    pub fn new(fd: RawFd) -> DoorbellReader {
        DoorbellReader { fd }
    }

    pub fn wait(&self) -> Result<()> {
        wait_byte(self.fd)
    }

    /// Wait for a byte until the timeout. `Ok(false)` on expiry; a byte
    /// raced away by another consumer is not consumed twice and does not
    /// end the wait early.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            let millis = left.as_millis().min(i32::MAX as u128) as i32;
            let mut fds = [PollFd::new(self.fd, PollFlags::POLLIN)];
            match poll(&mut fds, millis) {
                Ok(0) => return Ok(false),
                Ok(_) => {
                    // Readability can go stale between poll and read when
                    // several consumers share the fd, so take non-blockingly
                    // and go round again with whatever time is left.
                    if try_take(self.fd)? {
                        return Ok(true);
                    }
                    if left.is_zero() {
                        return Ok(false);
                    }
                }
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

fn wait_byte(fd: RawFd) -> Result<()> {
    let mut buf = [0u8; 1];
    loop {
        match read(fd, &mut buf) {
            Ok(0) => return Err(QueueError::Orphaned),
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

fn try_take(fd: RawFd) -> Result<bool> {
    let mut buf = [0u8; 1];
    loop {
        match recv(fd, &mut buf, MsgFlags::MSG_DONTWAIT) {
            Ok(0) => return Err(QueueError::Orphaned),
            Ok(_) => return Ok(true),
            Err(Errno::EAGAIN) => return Ok(false),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}
