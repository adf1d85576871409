// Copyright © 2021 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Leaf driver for raw image files.
//!
//! The file is opened when the node is and locked for the node's access
//! mode. Requests are served synchronously with positioned reads and writes.

use std::fs::{File, OpenOptions as FileOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::driver::{BlockDriver, IoFuture, OpenOptions, RequestFlags};
use crate::fcntl::{self, LockError, LockMode};
use crate::graph::NodeRef;
use crate::{Error, Result};

pub struct RawFile {
    path: PathBuf,
    file: Mutex<Option<Arc<File>>>,
}

impl RawFile {
    pub fn new(path: &Path) -> Self {
        RawFile {
            path: path.to_path_buf(),
            file: Mutex::new(None),
        }
    }

    fn file(&self, bs: &NodeRef) -> Result<Arc<File>> {
        self.file
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::NoMedium(format!("Node '{}' has no open file", bs.name())))
    }

    fn context(&self, what: &str) -> String {
        format!("Failed to {} {}", what, self.path.display())
    }

    /// `fallocate()` over `[offset, offset + len)`.
    fn fallocate(file: &File, mode: libc::c_int, offset: u64, len: u64) -> io::Result<()> {
        // SAFETY: FFI call with a valid fd.
        let ret = unsafe {
            libc::fallocate(
                file.as_raw_fd(),
                mode | libc::FALLOC_FL_KEEP_SIZE,
                offset as libc::off_t,
                len as libc::off_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

fn unsupported_fallocate(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::EOPNOTSUPP) | Some(libc::ENOSYS) | Some(libc::EINVAL)
    )
}

impl BlockDriver for RawFile {
    fn format_name(&self) -> &str {
        "raw"
    }

    fn open(&self, bs: &NodeRef, options: &OpenOptions) -> Result<()> {
        let file = FileOptions::new()
            .read(true)
            .write(!options.read_only)
            .open(&self.path)
            .map_err(|e| Error::io(self.context("open"), e))?;

        let mode = LockMode::for_access(options.read_only);
        fcntl::lock(&file, mode).map_err(|e| match e {
            LockError::AlreadyLocked(holder) => Error::Busy(format!(
                "Failed to get {} lock on {}: already locked {}. Is another process using the image?",
                mode,
                self.path.display(),
                holder
            )),
            LockError::Io(e) => Error::io(self.context("lock"), e),
        })?;

        bs.set_supported_flags(
            RequestFlags::FUA,
            RequestFlags::FUA | RequestFlags::MAY_UNMAP,
        );
        *self.file.lock().unwrap() = Some(Arc::new(file));

        debug!(
            "Opened {} for '{}' with a {} lock",
            self.path.display(),
            bs.name(),
            mode
        );
        Ok(())
    }

    fn close(&self, bs: &NodeRef) {
        if let Some(file) = self.file.lock().unwrap().take() {
            if let Err(e) = fcntl::unlock(&*file) {
                warn!("Failed to unlock {} of '{}': {}", self.path.display(), bs.name(), e);
            }
        }
    }

    fn get_length(&self, bs: &NodeRef) -> Result<u64> {
        let file = self.file(bs)?;
        let metadata = file
            .metadata()
            .map_err(|e| Error::io(self.context("stat"), e))?;
        Ok(metadata.len())
    }

    fn co_preadv<'a>(
        &'a self,
        bs: &'a NodeRef,
        offset: u64,
        bytes: usize,
        _flags: RequestFlags,
    ) -> IoFuture<'a, Vec<u8>> {
        Box::pin(async move {
            let file = self.file(bs)?;
            let mut buf = vec![0; bytes];
            file.read_exact_at(&mut buf, offset)
                .map_err(|e| Error::io(self.context("read from"), e))?;
            Ok(buf)
        })
    }

    fn co_pwritev<'a>(
        &'a self,
        bs: &'a NodeRef,
        offset: u64,
        buf: &'a [u8],
        flags: RequestFlags,
    ) -> IoFuture<'a, ()> {
        Box::pin(async move {
            let file = self.file(bs)?;
            file.write_all_at(buf, offset)
                .map_err(|e| Error::io(self.context("write to"), e))?;
            if flags.contains(RequestFlags::FUA) {
                file.sync_data()
                    .map_err(|e| Error::io(self.context("sync"), e))?;
            }
            Ok(())
        })
    }

    /// Unsupported `fallocate()` modes report the request as not supported,
    /// so the caller can fall back to writing zeroes.
    fn co_pwrite_zeroes<'a>(
        &'a self,
        bs: &'a NodeRef,
        offset: u64,
        bytes: u64,
        flags: RequestFlags,
    ) -> IoFuture<'a, ()> {
        Box::pin(async move {
            let file = self.file(bs)?;
            let mode = if flags.contains(RequestFlags::MAY_UNMAP) {
                libc::FALLOC_FL_PUNCH_HOLE
            } else {
                libc::FALLOC_FL_ZERO_RANGE
            };

            match Self::fallocate(&file, mode, offset, bytes) {
                Ok(()) => {}
                Err(e) if unsupported_fallocate(&e) => {
                    return Err(crate::driver::not_supported(bs, "efficient write zeroes"));
                }
                Err(e) => return Err(Error::io(self.context("zero"), e)),
            }

            if flags.contains(RequestFlags::FUA) {
                file.sync_data()
                    .map_err(|e| Error::io(self.context("sync"), e))?;
            }
            Ok(())
        })
    }

    fn co_pdiscard<'a>(&'a self, bs: &'a NodeRef, offset: u64, bytes: u64) -> IoFuture<'a, ()> {
        Box::pin(async move {
            let file = self.file(bs)?;
            match Self::fallocate(&file, libc::FALLOC_FL_PUNCH_HOLE, offset, bytes) {
                Ok(()) => Ok(()),
                // Discard is only a hint.
                Err(e) if unsupported_fallocate(&e) => Ok(()),
                Err(e) => Err(Error::io(self.context("discard on"), e)),
            }
        })
    }

    fn co_flush<'a>(&'a self, bs: &'a NodeRef) -> IoFuture<'a, ()> {
        Box::pin(async move {
            let file = self.file(bs)?;
            file.sync_all()
                .map_err(|e| Error::io(self.context("flush"), e))
        })
    }

    fn is_inserted(&self, _bs: &NodeRef) -> bool {
        self.file.lock().unwrap().is_some()
    }

    fn eject(&self, bs: &NodeRef, _eject_flag: bool) -> Result<()> {
        Err(crate::driver::not_supported(bs, "ejecting the medium"))
    }

    fn lock_medium(&self, bs: &NodeRef, _locked: bool) -> Result<()> {
        Err(crate::driver::not_supported(bs, "locking the medium"))
    }
}
