// Copyright © 2025 Cyberus Technology GmbH
//
// SPDX-License-Identifier: Apache-2.0
//

//! Advisory locks on image files.
//!
//! Whole-file OFD locks, as described in [[0]]: only the last `close()` of
//! the open file description drops the lock, and two descriptions in the
//! same process conflict just like two processes do. Read-only users take a
//! shared lock, writers an exclusive one.
//!
//! [0]: <https://apenwarr.ca/log/20101213>.

use std::io;
use std::os::fd::{AsRawFd, RawFd};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LockError {
    /// Someone else holds a lock conflicting with the requested one.
    #[error("The image is already locked ({0})")]
    AlreadyLocked(LockMode),
    #[error("The lock state could not be checked or set")]
    Io(#[source] io::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockMode {
    /// Any number of readers.
    Shared,
    /// A single writer.
    Exclusive,
}

impl LockMode {
    pub fn for_access(read_only: bool) -> Self {
        if read_only {
            LockMode::Shared
        } else {
            LockMode::Exclusive
        }
    }

    const fn l_type(self) -> libc::c_short {
        match self {
            LockMode::Shared => libc::F_RDLCK as libc::c_short,
            LockMode::Exclusive => libc::F_WRLCK as libc::c_short,
        }
    }
}

impl std::fmt::Display for LockMode {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            LockMode::Shared => f.write_str("shared"),
            LockMode::Exclusive => f.write_str("exclusive"),
        }
    }
}

/// `struct flock` covering the whole file.
const fn whole_file(l_type: libc::c_short) -> libc::flock {
    libc::flock {
        l_type,
        l_whence: libc::SEEK_SET as libc::c_short,
        l_start: 0,
        l_len: 0, /* EOF */
        l_pid: 0, /* filled by callee */
    }
}

fn set_lock(fd: RawFd, l_type: libc::c_short) -> io::Result<()> {
    let flock = whole_file(l_type);
    // SAFETY: FFI call with a valid fd and a flock that outlives the call.
    let ret = unsafe { libc::fcntl(fd, libc::F_OFD_SETLK, &flock) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// The strongest lock held by another open file description that conflicts
/// with `mode`, if any.
pub fn conflicting_lock<Fd: AsRawFd>(file: &Fd, mode: LockMode) -> Result<Option<LockMode>, LockError> {
    let mut flock = whole_file(mode.l_type());
    // SAFETY: FFI call with a valid fd and a flock that outlives the call.
    let ret = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_OFD_GETLK, &mut flock) };
    if ret < 0 {
        return Err(LockError::Io(io::Error::last_os_error()));
    }

    const F_RDLCK: libc::c_int = libc::F_RDLCK as libc::c_int;
    const F_WRLCK: libc::c_int = libc::F_WRLCK as libc::c_int;
    Ok(match flock.l_type as libc::c_int {
        F_RDLCK => Some(LockMode::Shared),
        F_WRLCK => Some(LockMode::Exclusive),
        _ => None,
    })
}

/// Takes a lock of `mode` on the whole of `file` without waiting.
pub fn lock<Fd: AsRawFd>(file: &Fd, mode: LockMode) -> Result<(), LockError> {
    match set_lock(file.as_raw_fd(), mode.l_type()) {
        Ok(()) => Ok(()),
        Err(e) => match e.raw_os_error() {
            // See <https://man7.org/linux/man-pages/man2/fcntl.2.html>.
            Some(libc::EAGAIN) | Some(libc::EACCES) => {
                let holder = conflicting_lock(file, mode)?.unwrap_or(LockMode::Exclusive);
                Err(LockError::AlreadyLocked(holder))
            }
            _ => Err(LockError::Io(e)),
        },
    }
}

pub fn unlock<Fd: AsRawFd>(file: &Fd) -> Result<(), LockError> {
    set_lock(file.as_raw_fd(), libc::F_UNLCK as libc::c_short).map_err(LockError::Io)
}
