//! Tuning and readiness helpers for the queue socket.

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::time::Duration;

use crate::error::{IntakeError, Result};

/// Choose whether queue overruns of the socket buffer surface as `ENOBUFS`
/// receive failures. When disabled they only show up as dropped packets.
pub fn set_recv_enobufs(fd: BorrowedFd<'_>, enable: bool) -> Result<()> {
    log::trace!("set_recv_enobufs({}, {enable})", fd.as_raw_fd());
    let value = libc::c_int::from(!enable);
    set_int_option(fd, libc::SOL_NETLINK, libc::NETLINK_NO_ENOBUFS, value, "NETLINK_NO_ENOBUFS")
}

pub fn recv_enobufs(fd: BorrowedFd<'_>) -> Result<bool> {
    let no_enobufs =
        get_int_option(fd, libc::SOL_NETLINK, libc::NETLINK_NO_ENOBUFS, "NETLINK_NO_ENOBUFS")?;
    Ok(no_enobufs == 0)
}

pub fn set_recv_buffer_size(fd: BorrowedFd<'_>, bytes: u32) -> Result<()> {
    log::trace!("set_recv_buffer_size({}, {bytes})", fd.as_raw_fd());
    let bytes = libc::c_int::try_from(bytes).unwrap_or(libc::c_int::MAX);
    set_int_option(fd, libc::SOL_SOCKET, libc::SO_RCVBUF, bytes, "SO_RCVBUF")
}

fn set_int_option(
    fd: BorrowedFd<'_>,
    level: libc::c_int,
    name: libc::c_int,
    value: libc::c_int,
    option: &'static str,
) -> Result<()> {
    // SAFETY: `value` lives across the call and its size is passed along.
    let rv = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            level,
            name,
            (&value as *const libc::c_int).cast(),
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };

    if rv < 0 {
        return Err(IntakeError::SocketOption {
            option,
            source: io::Error::last_os_error(),
        });
    }
    Ok(())
}

fn get_int_option(
    fd: BorrowedFd<'_>,
    level: libc::c_int,
    name: libc::c_int,
    option: &'static str,
) -> Result<libc::c_int> {
    let mut value: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    // SAFETY: `value` and `len` live across the call and describe each other.
    let rv = unsafe {
        libc::getsockopt(
            fd.as_raw_fd(),
            level,
            name,
            (&mut value as *mut libc::c_int).cast(),
            &mut len,
        )
    };

    if rv < 0 {
        return Err(IntakeError::SocketOption {
            option,
            source: io::Error::last_os_error(),
        });
    }
    Ok(value)
}

/// Wait until `fd` is readable (or hung up). `None` waits forever.
///
/// Returns `false` on timeout. An interrupted wait counts as a timeout so
/// callers get a chance to check their own stop condition.
pub fn wait_readable(fd: BorrowedFd<'_>, timeout: Option<Duration>) -> Result<bool> {
    let timeout_ms = match timeout {
        Some(timeout) => libc::c_int::try_from(timeout.as_millis()).unwrap_or(libc::c_int::MAX),
        None => -1,
    };
    let mut pfd = libc::pollfd {
        fd: fd.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    };

    // SAFETY: one valid pollfd is passed.
    let rv = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
    if rv < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(false);
        }
        return Err(IntakeError::Poll(err));
    }

    Ok(rv > 0)
}
