// Copyright © 2021 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! The capability contract every node driver implements.
//!
//! Only [`BlockDriver::format_name`] and [`BlockDriver::open`] are mandatory.
//! Every other capability has a default body that forwards the request,
//! unchanged, to the node's primary child. A leaf without a child that
//! doesn't override a capability reports it as not supported.

use std::fmt;

use bitflags::bitflags;
use futures::future::BoxFuture;

use crate::dirty_bitmap::DirtyBitmap;
use crate::graph::{Node, NodeRef};
use crate::permission::{self, ChildRole, Permissions};
use crate::snapshot::{self, SnapshotInfo};
use crate::{Error, Result};

/// Future returned by the asynchronous request hooks.
pub type IoFuture<'a, T> = BoxFuture<'a, Result<T>>;

bitflags! {
    /// Per-request flags.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct RequestFlags: u32 {
        /// Promote data read from the backing chain into this node.
        const COPY_ON_READ = 1 << 0;
        /// Write through to stable storage before completing.
        const FUA = 1 << 1;
        /// Zeroed ranges may be deallocated.
        const MAY_UNMAP = 1 << 2;
        /// The write doesn't change guest-visible data.
        const WRITE_UNCHANGED = 1 << 3;
        /// Fail instead of emulating write-zeroes with a data write.
        const NO_FALLBACK = 1 << 4;
    }
}

/// Options a node is opened, and reopened, with.
#[derive(Clone, Default)]
pub struct OpenOptions {
    /// Child the driver stores its data in, or filters.
    pub file: Option<NodeRef>,
    /// Backing image of a copy-on-write format.
    pub backing: Option<NodeRef>,
    pub read_only: bool,
    /// Name of the execution context the node runs in.
    pub context: Option<String>,
}

impl fmt::Debug for OpenOptions {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("OpenOptions")
            .field("file", &self.file.as_ref().map(|n| n.name().to_string()))
            .field(
                "backing",
                &self.backing.as_ref().map(|n| n.name().to_string()),
            )
            .field("read_only", &self.read_only)
            .field("context", &self.context)
            .finish()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DriverInfo {
    pub cluster_size: Option<u32>,
}

/// Allocation state of the range starting at the queried offset.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BlockStatus {
    /// The data is provided by this node rather than its backing chain.
    pub allocated: bool,
    pub data: bool,
    pub zero: bool,
    /// Number of bytes the status applies to.
    pub bytes: u64,
}

pub(crate) fn not_supported(bs: &Node, what: &str) -> Error {
    let format = bs
        .driver()
        .map(|d| d.format_name().to_string())
        .unwrap_or_default();
    Error::NotSupported(format!(
        "Block format '{}' used by node '{}' does not support {}",
        format,
        bs.name(),
        what
    ))
}

fn forward(bs: &NodeRef, what: &str) -> Result<NodeRef> {
    bs.primary_child().ok_or_else(|| not_supported(bs, what))
}

pub trait BlockDriver: Send + Sync {
    fn format_name(&self) -> &str;

    fn is_filter(&self) -> bool {
        false
    }

    /// Sets the driver up for `bs`, attaching whatever children it needs.
    fn open(&self, bs: &NodeRef, options: &OpenOptions) -> Result<()>;

    fn close(&self, _bs: &NodeRef) {}

    fn get_length(&self, bs: &NodeRef) -> Result<u64> {
        forward(bs, "querying the length")?.get_length()
    }

    fn get_info(&self, bs: &NodeRef) -> Result<DriverInfo> {
        match bs.primary_child() {
            Some(child) => child.get_info(),
            None => Ok(DriverInfo::default()),
        }
    }

    fn co_preadv<'a>(
        &'a self,
        bs: &'a NodeRef,
        offset: u64,
        bytes: usize,
        flags: RequestFlags,
    ) -> IoFuture<'a, Vec<u8>> {
        Box::pin(async move {
            forward(bs, "reads")?
                .preadv(offset, bytes, flags)
                .await
        })
    }

    fn co_pwritev<'a>(
        &'a self,
        bs: &'a NodeRef,
        offset: u64,
        buf: &'a [u8],
        flags: RequestFlags,
    ) -> IoFuture<'a, ()> {
        Box::pin(async move { forward(bs, "writes")?.pwritev(offset, buf, flags).await })
    }

    fn co_pwrite_zeroes<'a>(
        &'a self,
        bs: &'a NodeRef,
        offset: u64,
        bytes: u64,
        flags: RequestFlags,
    ) -> IoFuture<'a, ()> {
        Box::pin(async move {
            forward(bs, "write zeroes")?
                .pwrite_zeroes(offset, bytes, flags)
                .await
        })
    }

    fn co_pdiscard<'a>(&'a self, bs: &'a NodeRef, offset: u64, bytes: u64) -> IoFuture<'a, ()> {
        Box::pin(async move { forward(bs, "discard")?.pdiscard(offset, bytes).await })
    }

    fn co_flush<'a>(&'a self, bs: &'a NodeRef) -> IoFuture<'a, ()> {
        Box::pin(async move {
            match bs.primary_child() {
                Some(child) => child.flush().await,
                None => Ok(()),
            }
        })
    }

    fn co_block_status<'a>(
        &'a self,
        bs: &'a NodeRef,
        offset: u64,
        bytes: u64,
    ) -> IoFuture<'a, BlockStatus> {
        Box::pin(async move {
            match bs.primary_child() {
                Some(child) => child.block_status(offset, bytes).await,
                None => Ok(BlockStatus {
                    allocated: true,
                    data: true,
                    zero: false,
                    bytes,
                }),
            }
        })
    }

    fn is_inserted(&self, bs: &NodeRef) -> bool {
        bs.primary_child().is_none_or(|child| child.is_inserted())
    }

    fn eject(&self, bs: &NodeRef, eject_flag: bool) -> Result<()> {
        forward(bs, "ejecting the medium")?.eject(eject_flag)
    }

    fn lock_medium(&self, bs: &NodeRef, locked: bool) -> Result<()> {
        forward(bs, "locking the medium")?.lock_medium(locked)
    }

    /// Permissions `bs` needs on a child with `role`, given that its own
    /// parents take `perm` and share `shared`.
    fn child_perm(
        &self,
        bs: &Node,
        role: ChildRole,
        perm: Permissions,
        shared: Permissions,
    ) -> (Permissions, Permissions) {
        permission::default_perms(bs, role, perm, shared)
    }

    fn can_snapshot(&self, bs: &NodeRef) -> bool {
        bs.snapshot_fallback()
            .is_some_and(|child| snapshot::can_snapshot(&child))
    }

    /// Creates `sn` and returns the descriptor as stored, with its id filled
    /// in.
    fn snapshot_create(&self, bs: &NodeRef, sn: &SnapshotInfo) -> Result<SnapshotInfo> {
        match bs.snapshot_fallback() {
            Some(child) => snapshot::create(&child, sn),
            None => Err(not_supported(bs, "internal snapshots")),
        }
    }

    fn snapshot_goto(&self, bs: &NodeRef, snapshot_id: &str) -> Result<()> {
        snapshot::goto_through_child(bs, snapshot_id)
    }

    fn snapshot_delete(&self, bs: &NodeRef, id: Option<&str>, name: Option<&str>) -> Result<()> {
        match bs.snapshot_fallback() {
            Some(child) => snapshot::delete(&child, id, name),
            None => Err(not_supported(bs, "internal snapshots")),
        }
    }

    fn snapshot_list(&self, bs: &NodeRef) -> Result<Vec<SnapshotInfo>> {
        match bs.snapshot_fallback() {
            Some(child) => snapshot::list(&child),
            None => Err(not_supported(bs, "internal snapshots")),
        }
    }

    /// Temporary snapshot loading only exists at the format layer.
    fn snapshot_load_tmp(
        &self,
        bs: &NodeRef,
        _id: Option<&str>,
        _name: Option<&str>,
    ) -> Result<()> {
        Err(not_supported(bs, "temporarily loading internal snapshots"))
    }

    fn can_store_new_dirty_bitmap(
        &self,
        bs: &NodeRef,
        _name: &str,
        _granularity: u32,
    ) -> Result<()> {
        Err(Error::NotSupported(format!(
            "Can't store persistent bitmaps to {}",
            bs.name()
        )))
    }

    fn store_persistent_dirty_bitmap(&self, bs: &NodeRef, _bitmap: &DirtyBitmap) -> Result<()> {
        Err(Error::NotSupported(format!(
            "Can't store persistent bitmaps to {}",
            bs.name()
        )))
    }

    fn remove_persistent_dirty_bitmap(&self, _bs: &NodeRef, _name: &str) -> Result<()> {
        Ok(())
    }

    fn load_persistent_dirty_bitmaps(&self, _bs: &NodeRef) -> Result<Vec<DirtyBitmap>> {
        Ok(Vec::new())
    }
}
