// Copyright © 2025 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0

//! Filter completing requests in the order dictated by an [`EventRelay`].
//!
//! Each request gets a sequence id before it is issued to the child. Once the
//! child is done, the request stays parked on the relay until a checkpoint
//! releases its id, so callers observe completions in a reproducible order.

use std::sync::Arc;

use crate::driver::{BlockDriver, IoFuture, OpenOptions, RequestFlags};
use crate::graph::NodeRef;
use crate::relay::EventRelay;
use crate::Result;

pub struct Replay {
    relay: Arc<EventRelay>,
}

impl Replay {
    pub fn new(relay: Arc<EventRelay>) -> Self {
        Replay { relay }
    }

    /// Waits for the relay to release `id`, then hands back the child's
    /// result.
    async fn complete<T>(&self, id: u64, res: Result<T>) -> Result<T> {
        self.relay.block_event(id).await?;
        res
    }

    fn file(bs: &NodeRef, what: &str) -> Result<NodeRef> {
        bs.primary_child()
            .ok_or_else(|| crate::driver::not_supported(bs, what))
    }
}

impl BlockDriver for Replay {
    fn format_name(&self) -> &str {
        "blkreplay"
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
            let id = self.relay.next_request_id();
            let res = match Self::file(bs, "reads") {
                Ok(file) => file.preadv(offset, bytes, flags).await,
                Err(e) => Err(e),
            };
            self.complete(id, res).await
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
            let id = self.relay.next_request_id();
            let res = match Self::file(bs, "writes") {
                Ok(file) => file.pwritev(offset, buf, flags).await,
                Err(e) => Err(e),
            };
            self.complete(id, res).await
        })
    }

    fn co_pwrite_zeroes<'a>(
        &'a self,
        bs: &'a NodeRef,
        offset: u64,
        bytes: u64,
        flags: RequestFlags,
    ) -> IoFuture<'a, ()> {
        Box::pin(async move {
            let id = self.relay.next_request_id();
            let res = match Self::file(bs, "write zeroes") {
                Ok(file) => file.pwrite_zeroes(offset, bytes, flags).await,
                Err(e) => Err(e),
            };
            self.complete(id, res).await
        })
    }

    fn co_pdiscard<'a>(&'a self, bs: &'a NodeRef, offset: u64, bytes: u64) -> IoFuture<'a, ()> {
        Box::pin(async move {
            let id = self.relay.next_request_id();
            let res = match Self::file(bs, "discard") {
                Ok(file) => file.pdiscard(offset, bytes).await,
                Err(e) => Err(e),
            };
            self.complete(id, res).await
        })
    }

    fn co_flush<'a>(&'a self, bs: &'a NodeRef) -> IoFuture<'a, ()> {
        Box::pin(async move {
            let id = self.relay.next_request_id();
            let res = match bs.primary_child() {
                Some(file) => file.flush().await,
                None => Ok(()),
            };
            self.complete(id, res).await
        })
    }
}
