// Copyright © 2025 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0

//! Filter promoting everything read through it into the image below.
//!
//! Reads are forwarded with [`RequestFlags::COPY_ON_READ`] so the child
//! writes data it served from its backing chain into itself. Everything
//! else passes through unchanged.

use crate::driver::{BlockDriver, IoFuture, OpenOptions, RequestFlags};
use crate::graph::{Node, NodeRef};
use crate::permission::{self, ChildRole, Permissions};
use crate::Result;

pub struct CopyOnRead;

impl BlockDriver for CopyOnRead {
    fn format_name(&self) -> &str {
        "copy-on-read"
    }

    fn is_filter(&self) -> bool {
        true
    }

    fn open(&self, bs: &NodeRef, options: &OpenOptions) -> Result<()> {
        super::open_filtered_child(bs, options)
    }

    fn co_preadv<'a>(
        &'a self,
        bs: &'a NodeRef,
        offset: u64,
        bytes: usize,
        flags: RequestFlags,
    ) -> IoFuture<'a, Vec<u8>> {
        Box::pin(async move {
            let file = bs
                .primary_child()
                .ok_or_else(|| crate::driver::not_supported(bs, "reads"))?;
            file.preadv(offset, bytes, flags | RequestFlags::COPY_ON_READ)
                .await
        })
    }

    /// Promotion writes don't change what the guest sees, but they do need
    /// write-unchanged on the child while the node is active.
    fn child_perm(
        &self,
        bs: &Node,
        role: ChildRole,
        perm: Permissions,
        shared: Permissions,
    ) -> (Permissions, Permissions) {
        let (mut nperm, nshared) = permission::default_perms(bs, role, perm, shared);
        if !bs.is_inactive() {
            nperm |= Permissions::WRITE_UNCHANGED;
        }
        (nperm, nshared)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures::executor::block_on;

    use super::*;
    use crate::graph::BlockGraph;
    use crate::memory::MemoryImage;

    fn chain(graph: &BlockGraph) -> (NodeRef, NodeRef, NodeRef) {
        let base = graph
            .open_node(
                "base",
                Arc::new(MemoryImage::new(1 << 20).with_cluster_size(4096)),
                OpenOptions::default(),
            )
            .unwrap();
        block_on(base.pwritev(0, &[0x5a; 8192], RequestFlags::empty())).unwrap();

        let top = graph
            .open_node(
                "top",
                Arc::new(MemoryImage::new(1 << 20).with_cluster_size(4096)),
                OpenOptions {
                    backing: Some(Arc::clone(&base)),
                    ..Default::default()
                },
            )
            .unwrap();
        let cor = graph
            .open_node(
                "cor",
                Arc::new(CopyOnRead),
                OpenOptions {
                    file: Some(Arc::clone(&top)),
                    ..Default::default()
                },
            )
            .unwrap();
        (base, top, cor)
    }

    #[test]
    fn reads_promote_backing_data() {
        let graph = BlockGraph::new();
        let (base, top, cor) = chain(&graph);

        let status = block_on(top.block_status(0, 4096)).unwrap();
        assert!(!status.allocated);

        let data = block_on(cor.preadv(1024, 4096, RequestFlags::empty())).unwrap();
        assert_eq!(data, vec![0x5a; 4096]);

        // Both clusters touched by the read now live in the top image.
        for offset in [0, 4096] {
            let status = block_on(top.block_status(offset, 4096)).unwrap();
            assert!(status.allocated);
        }
        let status = block_on(top.block_status(8192, 4096)).unwrap();
        assert!(!status.allocated);

        // Changing the backing image doesn't affect promoted data anymore.
        block_on(base.pwritev(0, &[0; 4096], RequestFlags::empty())).unwrap();
        let data = block_on(top.preadv(0, 16, RequestFlags::empty())).unwrap();
        assert_eq!(data, vec![0x5a; 16]);
    }

    #[test]
    fn plain_reads_do_not_promote() {
        let graph = BlockGraph::new();
        let (_base, top, _cor) = chain(&graph);

        let data = block_on(top.preadv(0, 512, RequestFlags::empty())).unwrap();
        assert_eq!(data, vec![0x5a; 512]);
        let status = block_on(top.block_status(0, 4096)).unwrap();
        assert!(!status.allocated);
    }

    #[test]
    fn writes_pass_through() {
        let graph = BlockGraph::new();
        let (_base, top, cor) = chain(&graph);

        block_on(cor.pwritev(8192, &[1; 512], RequestFlags::empty())).unwrap();
        let data = block_on(top.preadv(8192, 512, RequestFlags::empty())).unwrap();
        assert_eq!(data, vec![1; 512]);
        assert_eq!(cor.get_length().unwrap(), top.get_length().unwrap());
    }

    #[test]
    fn inactive_filter_drops_write_unchanged() {
        let graph = BlockGraph::new();
        let (_base, top, cor) = chain(&graph);
        let edge = cor.edge_to(&top).unwrap();

        assert!(edge.perm().contains(Permissions::WRITE_UNCHANGED));
        cor.set_inactive(true).unwrap();
        assert!(!edge.perm().contains(Permissions::WRITE_UNCHANGED));
    }
}
