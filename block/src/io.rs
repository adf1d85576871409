// Copyright © 2021 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Generic request path shared by every node.
//!
//! Requests are bounds checked, counted as in flight while the driver runs
//! them and held back while the node is drained. Flags a driver doesn't
//! support natively are emulated here, and successful writes mark the
//! node's enabled dirty bitmaps.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex};

use futures::channel::oneshot;

use crate::driver::{BlockDriver, BlockStatus, DriverInfo, RequestFlags};
use crate::graph::{Node, NodeRef};
use crate::{Error, ErrorKind, Result};

const ZERO_BUFFER_SIZE: u64 = 64 * 1024;
const DEFAULT_CLUSTER_SIZE: u64 = 64 * 1024;

struct TrackerState {
    in_flight: usize,
    quiesce_counter: usize,
    waiters: Vec<oneshot::Sender<()>>,
}

/// In-flight accounting and drain state of one node.
pub(crate) struct IoTracker {
    state: Mutex<TrackerState>,
    idle: Condvar,
}

impl IoTracker {
    pub(crate) fn new() -> Self {
        IoTracker {
            state: Mutex::new(TrackerState {
                in_flight: 0,
                quiesce_counter: 0,
                waiters: Vec::new(),
            }),
            idle: Condvar::new(),
        }
    }

    /// Waits until the node isn't drained and counts a new request.
    async fn enter(&self) -> InFlight<'_> {
        loop {
            let waiter = {
                let mut state = self.state.lock().unwrap();
                if state.quiesce_counter == 0 {
                    state.in_flight += 1;
                    return InFlight { tracker: self };
                }
                let (tx, rx) = oneshot::channel();
                state.waiters.push(tx);
                rx
            };
            // A dropped sender only means the drain ended; check again.
            let _ = waiter.await;
        }
    }

    fn leave(&self) {
        let mut state = self.state.lock().unwrap();
        state.in_flight -= 1;
        if state.in_flight == 0 {
            self.idle.notify_all();
        }
    }

    fn quiesce(&self) {
        self.state.lock().unwrap().quiesce_counter += 1;
    }

    /// Blocks the calling thread until nothing is in flight.
    fn wait_idle(&self) {
        let mut state = self.state.lock().unwrap();
        while state.in_flight > 0 {
            state = self.idle.wait(state).unwrap();
        }
    }

    fn unquiesce(&self) {
        let waiters = {
            let mut state = self.state.lock().unwrap();
            state.quiesce_counter -= 1;
            if state.quiesce_counter > 0 {
                return;
            }
            std::mem::take(&mut state.waiters)
        };
        for waiter in waiters {
            let _ = waiter.send(());
        }
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.state.lock().unwrap().in_flight
    }

    pub(crate) fn is_quiesced(&self) -> bool {
        self.state.lock().unwrap().quiesce_counter > 0
    }
}

struct InFlight<'a> {
    tracker: &'a IoTracker,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.tracker.leave();
    }
}

/// Keeps a node and everything below it drained until dropped.
///
/// Nodes are drained top-down so that requests already admitted above can
/// still make their way into the children.
pub struct DrainedSection {
    nodes: Vec<NodeRef>,
}

impl DrainedSection {
    pub fn begin(bs: &NodeRef) -> Self {
        let mut nodes: Vec<NodeRef> = Vec::new();
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([Arc::clone(bs)]);

        while let Some(node) = queue.pop_front() {
            if !seen.insert(Arc::as_ptr(&node)) {
                continue;
            }
            node.io.quiesce();
            node.io.wait_idle();
            queue.extend(node.children().iter().map(|edge| Arc::clone(edge.child())));
            nodes.push(node);
        }

        debug!("Drained '{}' and {} nodes below", bs.name(), nodes.len() - 1);

        DrainedSection { nodes }
    }
}

impl Drop for DrainedSection {
    fn drop(&mut self) {
        for node in self.nodes.iter().rev() {
            node.io.unquiesce();
        }
    }
}

impl Node {
    fn require_driver(&self) -> Result<Arc<dyn BlockDriver>> {
        self.driver()
            .ok_or_else(|| Error::NoMedium(format!("Node '{}' has no medium", self.name())))
    }

    pub fn get_length(self: &Arc<Self>) -> Result<u64> {
        self.require_driver()?.get_length(self)
    }

    pub fn get_info(self: &Arc<Self>) -> Result<DriverInfo> {
        self.require_driver()?.get_info(self)
    }

    pub fn is_inserted(self: &Arc<Self>) -> bool {
        self.driver().is_some_and(|driver| driver.is_inserted(self))
    }

    pub fn eject(self: &Arc<Self>, eject: bool) -> Result<()> {
        self.require_driver()?.eject(self, eject)
    }

    pub fn lock_medium(self: &Arc<Self>, locked: bool) -> Result<()> {
        self.require_driver()?.lock_medium(self, locked)
    }

    fn check_request(self: &Arc<Self>, offset: u64, bytes: u64) -> Result<()> {
        let length = self.get_length()?;
        if offset.checked_add(bytes).is_none_or(|end| end > length) {
            return Err(Error::InvalidArgument(format!(
                "Request of {} bytes at offset {} is beyond the end of node '{}' ({} bytes)",
                bytes,
                offset,
                self.name(),
                length
            )));
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<()> {
        if self.is_read_only() {
            return Err(Error::ReadOnly(format!(
                "Block node '{}' is read-only",
                self.name()
            )));
        }
        Ok(())
    }

    fn mark_dirty(&self, offset: u64, bytes: u64) {
        let mut state = self.state();
        for bitmap in state.bitmaps.iter_mut().filter(|b| b.is_enabled()) {
            bitmap.mark(offset, bytes);
        }
    }

    pub async fn preadv(
        self: &Arc<Self>,
        offset: u64,
        bytes: usize,
        flags: RequestFlags,
    ) -> Result<Vec<u8>> {
        let driver = self.require_driver()?;
        self.check_request(offset, bytes as u64)?;

        let _in_flight = self.io.enter().await;
        if flags.contains(RequestFlags::COPY_ON_READ) && !self.is_read_only() {
            self.copy_on_readv(driver.as_ref(), offset, bytes, flags)
                .await
        } else {
            driver
                .co_preadv(self, offset, bytes, flags - RequestFlags::COPY_ON_READ)
                .await
        }
    }

    /// Reads through the node and writes every cluster that came from the
    /// backing chain back into the node itself.
    async fn copy_on_readv(
        self: &Arc<Self>,
        driver: &dyn BlockDriver,
        offset: u64,
        bytes: usize,
        flags: RequestFlags,
    ) -> Result<Vec<u8>> {
        let cluster = driver
            .get_info(self)?
            .cluster_size
            .map_or(DEFAULT_CLUSTER_SIZE, u64::from);
        let length = driver.get_length(self)?;
        let flags = flags - RequestFlags::COPY_ON_READ;

        let end = offset + bytes as u64;
        let mut pos = offset / cluster * cluster;
        let aligned_end = std::cmp::min(crate::div_round_up(end, cluster) * cluster, length);
        let mut buf = Vec::with_capacity(bytes);

        while pos < aligned_end {
            let status = driver.co_block_status(self, pos, aligned_end - pos).await?;
            let mut n = std::cmp::min(status.bytes, aligned_end - pos);
            if n == 0 {
                n = std::cmp::min(cluster, aligned_end - pos);
            }

            let chunk = driver.co_preadv(self, pos, n as usize, flags).await?;
            if !status.allocated && !status.zero {
                debug!(
                    "Promoting {} bytes at offset {} into '{}'",
                    n,
                    pos,
                    self.name()
                );
                driver
                    .co_pwritev(self, pos, &chunk, RequestFlags::WRITE_UNCHANGED)
                    .await?;
            }

            let from = offset.max(pos);
            let to = end.min(pos + n);
            if from < to {
                buf.extend_from_slice(&chunk[(from - pos) as usize..(to - pos) as usize]);
            }
            pos += n;
        }

        Ok(buf)
    }

    pub async fn pwritev(
        self: &Arc<Self>,
        offset: u64,
        buf: &[u8],
        flags: RequestFlags,
    ) -> Result<()> {
        let driver = self.require_driver()?;
        self.check_writable()?;
        self.check_request(offset, buf.len() as u64)?;

        let _in_flight = self.io.enter().await;
        let emulate_fua =
            flags.contains(RequestFlags::FUA) && !self.supported_write_flags().contains(RequestFlags::FUA);
        let native = if emulate_fua {
            flags - RequestFlags::FUA
        } else {
            flags
        };

        driver.co_pwritev(self, offset, buf, native).await?;
        if emulate_fua {
            driver.co_flush(self).await?;
        }

        self.mark_dirty(offset, buf.len() as u64);
        Ok(())
    }

    pub async fn pwrite_zeroes(
        self: &Arc<Self>,
        offset: u64,
        bytes: u64,
        flags: RequestFlags,
    ) -> Result<()> {
        let driver = self.require_driver()?;
        self.check_writable()?;
        self.check_request(offset, bytes)?;

        let _in_flight = self.io.enter().await;
        let supported = self.supported_zero_flags();
        let emulate_fua = flags.contains(RequestFlags::FUA) && !supported.contains(RequestFlags::FUA);
        let mut native = flags;
        if emulate_fua {
            native -= RequestFlags::FUA;
        }
        if !supported.contains(RequestFlags::MAY_UNMAP) {
            native -= RequestFlags::MAY_UNMAP;
        }

        match driver.co_pwrite_zeroes(self, offset, bytes, native).await {
            Err(e)
                if e.kind() == ErrorKind::NotSupported
                    && !flags.contains(RequestFlags::NO_FALLBACK) =>
            {
                let zero_buffer = vec![0u8; std::cmp::min(bytes, ZERO_BUFFER_SIZE) as usize];
                let mut done = 0;
                while done < bytes {
                    let n = std::cmp::min(bytes - done, ZERO_BUFFER_SIZE);
                    driver
                        .co_pwritev(
                            self,
                            offset + done,
                            &zero_buffer[..n as usize],
                            native - RequestFlags::MAY_UNMAP - RequestFlags::NO_FALLBACK,
                        )
                        .await?;
                    done += n;
                }
            }
            other => other?,
        }

        if emulate_fua {
            driver.co_flush(self).await?;
        }

        self.mark_dirty(offset, bytes);
        Ok(())
    }

    pub async fn pdiscard(self: &Arc<Self>, offset: u64, bytes: u64) -> Result<()> {
        let driver = self.require_driver()?;
        self.check_writable()?;
        self.check_request(offset, bytes)?;

        let _in_flight = self.io.enter().await;
        driver.co_pdiscard(self, offset, bytes).await?;

        self.mark_dirty(offset, bytes);
        Ok(())
    }

    pub async fn flush(self: &Arc<Self>) -> Result<()> {
        let Some(driver) = self.driver() else {
            return Ok(());
        };

        let _in_flight = self.io.enter().await;
        driver.co_flush(self).await
    }

    pub async fn block_status(self: &Arc<Self>, offset: u64, bytes: u64) -> Result<BlockStatus> {
        let driver = self.require_driver()?;
        self.check_request(offset, bytes)?;

        let _in_flight = self.io.enter().await;
        driver.co_block_status(self, offset, bytes).await
    }
}
