// Copyright © 2021 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Image format kept entirely in memory.
//!
//! Data is allocated per cluster. Clusters that were never written are read
//! from the backing child, if there is one, and read as zeroes otherwise.
//! The image also keeps internal snapshots and a directory of persistent
//! dirty bitmaps, both of which survive the node being closed and reopened
//! as long as the [`MemoryImage`] itself is kept.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use crate::dirty_bitmap::{BitSet, DirtyBitmap};
use crate::driver::{BlockDriver, BlockStatus, DriverInfo, IoFuture, OpenOptions, RequestFlags};
use crate::graph::NodeRef;
use crate::permission::ChildRole;
use crate::snapshot::SnapshotInfo;
use crate::{Error, Result};

pub const DEFAULT_CLUSTER_SIZE: u32 = 64 * 1024;
pub const DEFAULT_MAX_BITMAPS: usize = 65535;
const MAX_BITMAP_GRANULARITY: u32 = 1 << 31;

#[derive(Clone, Debug, PartialEq, Eq)]
enum Cluster {
    Data(Vec<u8>),
    Zero,
}

type ClusterMap = BTreeMap<u64, Cluster>;

struct StoredSnapshot {
    info: SnapshotInfo,
    clusters: ClusterMap,
}

struct StoredBitmap {
    name: String,
    granularity: u32,
    size: u64,
    bits: BitSet,
    /// Set while a writable node has the bitmap loaded.
    in_use: bool,
}

struct ImageState {
    active: ClusterMap,
    /// Snapshot contents loaded with `snapshot_load_tmp`, until close.
    tmp_view: Option<ClusterMap>,
    snapshots: Vec<StoredSnapshot>,
    bitmaps: Vec<StoredBitmap>,
    inserted: bool,
    locked: bool,
}

impl ImageState {
    fn view(&self) -> &ClusterMap {
        self.tmp_view.as_ref().unwrap_or(&self.active)
    }

    fn next_snapshot_id(&self) -> String {
        let max = self
            .snapshots
            .iter()
            .filter_map(|sn| sn.info.id.parse::<u64>().ok())
            .max()
            .unwrap_or(0);
        (max + 1).to_string()
    }

    fn find_snapshot(&self, id: Option<&str>, name: Option<&str>) -> Option<usize> {
        self.snapshots.iter().position(|sn| {
            id.is_none_or(|id| sn.info.id == id) && name.is_none_or(|name| sn.info.name == name)
        })
    }
}

/// Where the bytes of one cluster-sized piece of a read come from.
enum Piece {
    Bytes(Vec<u8>),
    Backing { offset: u64, len: usize },
}

pub struct MemoryImage {
    size: u64,
    cluster_size: u32,
    max_bitmaps: usize,
    state: Mutex<ImageState>,
}

impl MemoryImage {
    pub fn new(size: u64) -> Self {
        MemoryImage {
            size,
            cluster_size: DEFAULT_CLUSTER_SIZE,
            max_bitmaps: DEFAULT_MAX_BITMAPS,
            state: Mutex::new(ImageState {
                active: BTreeMap::new(),
                tmp_view: None,
                snapshots: Vec::new(),
                bitmaps: Vec::new(),
                inserted: true,
                locked: false,
            }),
        }
    }

    /// `cluster_size` must be a power of two.
    pub fn with_cluster_size(mut self, cluster_size: u32) -> Self {
        self.cluster_size = cluster_size;
        self
    }

    pub fn with_max_bitmaps(mut self, max_bitmaps: usize) -> Self {
        self.max_bitmaps = max_bitmaps;
        self
    }

    fn state(&self) -> MutexGuard<'_, ImageState> {
        self.state.lock().unwrap()
    }

    fn cluster(&self) -> u64 {
        u64::from(self.cluster_size)
    }

    /// Names of the bitmaps in the persistent bitmap directory.
    pub fn stored_bitmaps(&self) -> Vec<String> {
        self.state().bitmaps.iter().map(|b| b.name.clone()).collect()
    }

    /// Cluster-sized pieces covering `[offset, offset + bytes)`, each split
    /// at cluster boundaries: `(cluster index, offset in cluster, length)`.
    fn pieces(&self, offset: u64, bytes: u64) -> impl Iterator<Item = (u64, usize, usize)> {
        let cluster = self.cluster();
        let end = offset + bytes;
        let mut pos = offset;
        std::iter::from_fn(move || {
            if pos >= end {
                return None;
            }
            let index = pos / cluster;
            let start = pos % cluster;
            let len = std::cmp::min(cluster - start, end - pos);
            pos += len;
            Some((index, start as usize, len as usize))
        })
    }

    async fn read_backing(bs: &NodeRef, offset: u64, len: usize) -> Result<Vec<u8>> {
        let Some(backing) = bs.backing_child() else {
            return Ok(vec![0; len]);
        };
        let backing_len = backing.get_length()?;
        if offset >= backing_len {
            return Ok(vec![0; len]);
        }

        let n = std::cmp::min(len as u64, backing_len - offset) as usize;
        let mut buf = backing.preadv(offset, n, RequestFlags::empty()).await?;
        buf.resize(len, 0);
        Ok(buf)
    }

    /// Current contents of the clusters a write only partly covers and that
    /// aren't allocated yet, read from the backing chain.
    async fn partial_fill(
        &self,
        bs: &NodeRef,
        offset: u64,
        bytes: u64,
    ) -> Result<HashMap<u64, Vec<u8>>> {
        let cluster = self.cluster();
        let wanted: Vec<u64> = {
            let state = self.state();
            self.pieces(offset, bytes)
                .filter(|&(index, _, len)| {
                    len as u64 != cluster && !state.active.contains_key(&index)
                })
                .map(|(index, _, _)| index)
                .collect()
        };

        let mut fill = HashMap::new();
        for index in wanted {
            let len = std::cmp::min(cluster, self.size - index * cluster) as usize;
            let data = Self::read_backing(bs, index * cluster, len).await?;
            fill.insert(index, data);
        }
        Ok(fill)
    }

    /// Writes `data`, or zeroes when it is `None`, to `[offset, offset + bytes)`.
    async fn write_range(
        &self,
        bs: &NodeRef,
        offset: u64,
        bytes: u64,
        data: Option<&[u8]>,
    ) -> Result<()> {
        let cluster = self.cluster();
        let mut fill = self.partial_fill(bs, offset, bytes).await?;

        let mut state = self.state();
        let mut done = 0;
        for (index, start, len) in self.pieces(offset, bytes) {
            let src = data.map(|d| &d[done..done + len]);
            done += len;

            if len as u64 == cluster {
                let new = match src {
                    Some(src) => Cluster::Data(src.to_vec()),
                    None => Cluster::Zero,
                };
                state.active.insert(index, new);
                continue;
            }

            let cluster_len = std::cmp::min(cluster, self.size - index * cluster) as usize;
            let mut buf = match state.active.remove(&index) {
                Some(Cluster::Data(buf)) => buf,
                Some(Cluster::Zero) => vec![0; cluster_len],
                None => fill.remove(&index).unwrap_or_else(|| vec![0; cluster_len]),
            };
            match src {
                Some(src) => buf[start..start + len].copy_from_slice(src),
                None => buf[start..start + len].fill(0),
            }
            state.active.insert(index, Cluster::Data(buf));
        }

        Ok(())
    }

    fn open_error(bs: &NodeRef, what: &str) -> Error {
        Error::InvalidArgument(format!("Cannot open memory image '{}': {}", bs.name(), what))
    }
}

impl BlockDriver for MemoryImage {
    fn format_name(&self) -> &str {
        "memory"
    }

    fn open(&self, bs: &NodeRef, options: &OpenOptions) -> Result<()> {
        if !self.cluster_size.is_power_of_two() || self.cluster_size < 512 {
            return Err(Self::open_error(
                bs,
                "cluster size must be a power of two and at least 512",
            ));
        }

        if let Some(backing) = &options.backing {
            bs.attach_child(backing, "backing", ChildRole::COW)?;
        }

        {
            let mut state = self.state();
            state.tmp_view = None;
            state.locked = false;
        }
        bs.set_supported_flags(
            RequestFlags::FUA,
            RequestFlags::FUA | RequestFlags::MAY_UNMAP,
        );

        Ok(())
    }

    fn close(&self, bs: &NodeRef) {
        let mut state = self.state();
        state.tmp_view = None;
        state.locked = false;
        debug!("Closed memory image of '{}'", bs.name());
    }

    fn get_length(&self, _bs: &NodeRef) -> Result<u64> {
        Ok(self.size)
    }

    fn get_info(&self, _bs: &NodeRef) -> Result<DriverInfo> {
        Ok(DriverInfo {
            cluster_size: Some(self.cluster_size),
        })
    }

    fn co_preadv<'a>(
        &'a self,
        bs: &'a NodeRef,
        offset: u64,
        bytes: usize,
        _flags: RequestFlags,
    ) -> IoFuture<'a, Vec<u8>> {
        Box::pin(async move {
            let pieces: Vec<Piece> = {
                let state = self.state();
                let view = state.view();
                self.pieces(offset, bytes as u64)
                    .map(|(index, start, len)| match view.get(&index) {
                        Some(Cluster::Data(data)) => Piece::Bytes(data[start..start + len].to_vec()),
                        Some(Cluster::Zero) => Piece::Bytes(vec![0; len]),
                        None => Piece::Backing {
                            offset: index * self.cluster() + start as u64,
                            len,
                        },
                    })
                    .collect()
            };

            let mut buf = Vec::with_capacity(bytes);
            for piece in pieces {
                match piece {
                    Piece::Bytes(data) => buf.extend_from_slice(&data),
                    Piece::Backing { offset, len } => {
                        buf.extend_from_slice(&Self::read_backing(bs, offset, len).await?)
                    }
                }
            }
            Ok(buf)
        })
    }

    fn co_pwritev<'a>(
        &'a self,
        bs: &'a NodeRef,
        offset: u64,
        buf: &'a [u8],
        _flags: RequestFlags,
    ) -> IoFuture<'a, ()> {
        Box::pin(async move { self.write_range(bs, offset, buf.len() as u64, Some(buf)).await })
    }

    fn co_pwrite_zeroes<'a>(
        &'a self,
        bs: &'a NodeRef,
        offset: u64,
        bytes: u64,
        _flags: RequestFlags,
    ) -> IoFuture<'a, ()> {
        Box::pin(async move { self.write_range(bs, offset, bytes, None).await })
    }

    /// Only whole clusters are discarded. They read as zeroes afterwards,
    /// even with a backing child.
    fn co_pdiscard<'a>(&'a self, _bs: &'a NodeRef, offset: u64, bytes: u64) -> IoFuture<'a, ()> {
        Box::pin(async move {
            let cluster = self.cluster();
            let mut state = self.state();
            for (index, _, len) in self.pieces(offset, bytes) {
                if len as u64 == cluster {
                    state.active.insert(index, Cluster::Zero);
                }
            }
            Ok(())
        })
    }

    fn co_flush<'a>(&'a self, _bs: &'a NodeRef) -> IoFuture<'a, ()> {
        Box::pin(async { Ok(()) })
    }

    fn co_block_status<'a>(
        &'a self,
        bs: &'a NodeRef,
        offset: u64,
        bytes: u64,
    ) -> IoFuture<'a, BlockStatus> {
        let has_backing = bs.backing_child().is_some();
        Box::pin(async move {
            let state = self.state();
            let view = state.view();
            let status_of = |index: u64| match view.get(&index) {
                Some(Cluster::Data(_)) => (true, true, false),
                Some(Cluster::Zero) => (true, false, true),
                None => (false, false, !has_backing),
            };

            let mut pieces = self.pieces(offset, bytes);
            let Some((first, _, len)) = pieces.next() else {
                return Ok(BlockStatus::default());
            };
            let (allocated, data, zero) = status_of(first);
            let mut run = len as u64;
            for (index, _, len) in pieces {
                if status_of(index) != (allocated, data, zero) {
                    break;
                }
                run += len as u64;
            }

            Ok(BlockStatus {
                allocated,
                data,
                zero,
                bytes: run,
            })
        })
    }

    fn is_inserted(&self, _bs: &NodeRef) -> bool {
        self.state().inserted
    }

    fn eject(&self, bs: &NodeRef, eject_flag: bool) -> Result<()> {
        let mut state = self.state();
        if eject_flag && state.locked {
            return Err(Error::Busy(format!(
                "Device '{}' is locked and force was not specified",
                bs.name()
            )));
        }
        state.inserted = !eject_flag;
        Ok(())
    }

    fn lock_medium(&self, _bs: &NodeRef, locked: bool) -> Result<()> {
        self.state().locked = locked;
        Ok(())
    }

    fn can_snapshot(&self, _bs: &NodeRef) -> bool {
        true
    }

    fn snapshot_create(&self, bs: &NodeRef, sn: &SnapshotInfo) -> Result<SnapshotInfo> {
        let mut state = self.state();
        let mut info = sn.clone();
        if info.id.is_empty() {
            info.id = state.next_snapshot_id();
        } else if state.find_snapshot(Some(&info.id), None).is_some() {
            return Err(Error::AlreadyExists(format!(
                "Snapshot with id '{}' already exists on '{}'",
                info.id,
                bs.name()
            )));
        }

        let clusters = state.active.clone();
        state.snapshots.push(StoredSnapshot {
            info: info.clone(),
            clusters,
        });
        Ok(info)
    }

    fn snapshot_goto(&self, bs: &NodeRef, snapshot_id: &str) -> Result<()> {
        let mut state = self.state();
        let index = state
            .find_snapshot(Some(snapshot_id), None)
            .or_else(|| state.find_snapshot(None, Some(snapshot_id)))
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "Can't find snapshot '{}' on '{}'",
                    snapshot_id,
                    bs.name()
                ))
            })?;

        state.active = state.snapshots[index].clusters.clone();
        state.tmp_view = None;
        Ok(())
    }

    fn snapshot_delete(&self, bs: &NodeRef, id: Option<&str>, name: Option<&str>) -> Result<()> {
        let mut state = self.state();
        let index = state.find_snapshot(id, name).ok_or_else(|| {
            Error::NotFound(format!(
                "Can't find the snapshot with id '{}' and name '{}' on '{}'",
                id.unwrap_or_default(),
                name.unwrap_or_default(),
                bs.name()
            ))
        })?;
        state.snapshots.remove(index);
        Ok(())
    }

    fn snapshot_list(&self, _bs: &NodeRef) -> Result<Vec<SnapshotInfo>> {
        Ok(self
            .state()
            .snapshots
            .iter()
            .map(|sn| sn.info.clone())
            .collect())
    }

    fn snapshot_load_tmp(&self, bs: &NodeRef, id: Option<&str>, name: Option<&str>) -> Result<()> {
        let mut state = self.state();
        let index = state.find_snapshot(id, name).ok_or_else(|| {
            Error::NotFound(format!(
                "Can't find snapshot with id '{}' and name '{}' on '{}'",
                id.unwrap_or_default(),
                name.unwrap_or_default(),
                bs.name()
            ))
        })?;
        state.tmp_view = Some(state.snapshots[index].clusters.clone());
        Ok(())
    }

    fn can_store_new_dirty_bitmap(&self, bs: &NodeRef, name: &str, granularity: u32) -> Result<()> {
        if bs.is_read_only() {
            return Err(Error::ReadOnly(format!(
                "Can't store bitmap '{}' to read-only node '{}'",
                name,
                bs.name()
            )));
        }
        if granularity > MAX_BITMAP_GRANULARITY {
            return Err(Error::InvalidArgument(format!(
                "Granularity of bitmap '{name}' exceeds the maximum of {MAX_BITMAP_GRANULARITY}"
            )));
        }

        let loaded: Vec<String> = bs
            .state()
            .bitmaps
            .iter()
            .filter(|b| b.is_persistent())
            .filter_map(|b| b.name().map(str::to_string))
            .collect();

        let state = self.state();
        if state.bitmaps.iter().any(|b| b.name == name) {
            return Err(Error::AlreadyExists(format!(
                "Bitmap with the same name '{name}' is already stored"
            )));
        }
        let count = loaded.len()
            + state
                .bitmaps
                .iter()
                .filter(|b| !loaded.contains(&b.name))
                .count();
        if count >= self.max_bitmaps {
            return Err(Error::NotSupported(format!(
                "Maximum number of persistent bitmaps is already reached on '{}'",
                bs.name()
            )));
        }

        Ok(())
    }

    fn store_persistent_dirty_bitmap(&self, bs: &NodeRef, bitmap: &DirtyBitmap) -> Result<()> {
        if bs.is_read_only() {
            return Ok(());
        }
        let Some(name) = bitmap.name() else {
            return Ok(());
        };

        let stored = StoredBitmap {
            name: name.to_string(),
            granularity: bitmap.granularity(),
            size: bitmap.size(),
            bits: bitmap.bits().clone(),
            in_use: false,
        };

        let mut state = self.state();
        match state.bitmaps.iter_mut().find(|b| b.name == name) {
            Some(existing) => *existing = stored,
            None => state.bitmaps.push(stored),
        }
        debug!("Stored bitmap '{}' of '{}'", name, bs.name());
        Ok(())
    }

    fn remove_persistent_dirty_bitmap(&self, _bs: &NodeRef, name: &str) -> Result<()> {
        self.state().bitmaps.retain(|b| b.name != name);
        Ok(())
    }

    /// Bitmaps still marked in use weren't stored when they were last
    /// loaded and come back inconsistent.
    fn load_persistent_dirty_bitmaps(&self, bs: &NodeRef) -> Result<Vec<DirtyBitmap>> {
        let read_only = bs.is_read_only();
        let mut state = self.state();
        let mut loaded = Vec::with_capacity(state.bitmaps.len());

        for stored in state.bitmaps.iter_mut() {
            let mut bitmap = DirtyBitmap::new(Some(&stored.name), stored.granularity, stored.size);
            bitmap.set_persistent(true);
            if stored.in_use {
                warn!(
                    "Bitmap '{}' of '{}' was not stored cleanly",
                    stored.name,
                    bs.name()
                );
                bitmap.set_inconsistent();
            } else {
                bitmap.set_bits(stored.bits.clone())?;
            }
            if read_only {
                bitmap.set_readonly(true);
            } else {
                stored.in_use = true;
            }
            loaded.push(bitmap);
        }

        Ok(loaded)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures::executor::block_on;

    use super::*;
    use crate::graph::BlockGraph;
    use crate::{dirty_bitmap, snapshot, ErrorKind};

    fn open(graph: &BlockGraph, name: &str, image: &Arc<MemoryImage>, read_only: bool) -> NodeRef {
        graph
            .open_node(
                name,
                image.clone(),
                OpenOptions {
                    read_only,
                    ..Default::default()
                },
            )
            .unwrap()
    }

    #[test]
    fn unwritten_data_reads_as_zeroes() {
        let graph = BlockGraph::new();
        let image = Arc::new(MemoryImage::new(1 << 20).with_cluster_size(4096));
        let bs = open(&graph, "disk0", &image, false);

        let data = block_on(bs.preadv(100, 5000, RequestFlags::empty())).unwrap();
        assert_eq!(data, vec![0; 5000]);

        let status = block_on(bs.block_status(0, 1 << 20)).unwrap();
        assert!(!status.allocated);
        assert!(status.zero);
        assert_eq!(status.bytes, 1 << 20);
    }

    #[test]
    fn partial_cluster_writes_keep_surrounding_data() {
        let graph = BlockGraph::new();
        let image = Arc::new(MemoryImage::new(1 << 16).with_cluster_size(4096));
        let bs = open(&graph, "disk0", &image, false);

        block_on(bs.pwritev(0, &[1; 8192], RequestFlags::empty())).unwrap();
        block_on(bs.pwritev(4000, &[2; 200], RequestFlags::empty())).unwrap();
        block_on(bs.pwrite_zeroes(8000, 100, RequestFlags::empty())).unwrap();

        let data = block_on(bs.preadv(3990, 300, RequestFlags::empty())).unwrap();
        assert_eq!(&data[..10], &[1; 10][..]);
        assert_eq!(&data[10..210], &[2; 200][..]);
        assert_eq!(&data[210..], &[1; 90][..]);

        let data = block_on(bs.preadv(7990, 120, RequestFlags::empty())).unwrap();
        assert_eq!(&data[..10], &[1; 10][..]);
        assert_eq!(&data[10..110], &[0; 100][..]);
        assert_eq!(&data[110..], &[1; 10][..]);
    }

    #[test]
    fn block_status_reports_runs() {
        let graph = BlockGraph::new();
        let image = Arc::new(MemoryImage::new(1 << 16).with_cluster_size(4096));
        let bs = open(&graph, "disk0", &image, false);

        block_on(bs.pwritev(4096, &[1; 8192], RequestFlags::empty())).unwrap();
        block_on(bs.pwrite_zeroes(12288, 4096, RequestFlags::MAY_UNMAP)).unwrap();

        let status = block_on(bs.block_status(0, 1 << 16)).unwrap();
        assert_eq!((status.allocated, status.bytes), (false, 4096));

        let status = block_on(bs.block_status(5000, 60000)).unwrap();
        assert!(status.allocated && status.data);
        assert_eq!(status.bytes, 8192 - (5000 - 4096));

        let status = block_on(bs.block_status(12288, 8192)).unwrap();
        assert!(status.allocated && status.zero && !status.data);
        assert_eq!(status.bytes, 4096);
    }

    #[test]
    fn backing_data_shows_through() {
        let graph = BlockGraph::new();
        let base_image = Arc::new(MemoryImage::new(8192).with_cluster_size(4096));
        let base = open(&graph, "base", &base_image, false);
        block_on(base.pwritev(0, &[9; 8192], RequestFlags::empty())).unwrap();

        let top = graph
            .open_node(
                "top",
                Arc::new(MemoryImage::new(1 << 16).with_cluster_size(4096)),
                OpenOptions {
                    backing: Some(Arc::clone(&base)),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(Arc::ptr_eq(&top.backing_child().unwrap(), &base));

        block_on(top.pwritev(100, &[1; 10], RequestFlags::empty())).unwrap();
        let data = block_on(top.preadv(0, 4096, RequestFlags::empty())).unwrap();
        assert_eq!(&data[..100], &[9; 100][..]);
        assert_eq!(&data[100..110], &[1; 10][..]);
        assert_eq!(&data[110..], &[9; 3986][..]);

        // Beyond the end of the backing image.
        let data = block_on(top.preadv(8000, 400, RequestFlags::empty())).unwrap();
        assert_eq!(&data[..192], &[9; 192][..]);
        assert_eq!(&data[192..], &[0; 208][..]);

        block_on(top.pdiscard(4096, 4096)).unwrap();
        let data = block_on(top.preadv(4096, 16, RequestFlags::empty())).unwrap();
        assert_eq!(data, vec![0; 16]);
    }

    #[test]
    fn snapshots_capture_and_restore_data() {
        let graph = BlockGraph::new();
        let image = Arc::new(MemoryImage::new(1 << 16));
        let bs = open(&graph, "disk0", &image, false);

        block_on(bs.pwritev(0, &[1; 512], RequestFlags::empty())).unwrap();
        let sn = snapshot::create(&bs, &SnapshotInfo::new("", "one")).unwrap();
        assert_eq!(sn.id, "1");
        block_on(bs.pwritev(0, &[2; 512], RequestFlags::empty())).unwrap();
        let sn = snapshot::create(&bs, &SnapshotInfo::new("", "two")).unwrap();
        assert_eq!(sn.id, "2");

        snapshot::goto(&bs, "one").unwrap();
        let data = block_on(bs.preadv(0, 512, RequestFlags::empty())).unwrap();
        assert_eq!(data, vec![1; 512]);

        snapshot::goto(&bs, "2").unwrap();
        let data = block_on(bs.preadv(0, 512, RequestFlags::empty())).unwrap();
        assert_eq!(data, vec![2; 512]);

        let e = snapshot::create(&bs, &SnapshotInfo::new("2", "dup")).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::AlreadyExists);
        let e = snapshot::goto(&bs, "three").unwrap_err();
        assert_eq!(e.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn state_survives_reopen() {
        let graph = BlockGraph::new();
        let image = Arc::new(MemoryImage::new(1 << 16));
        let bs = open(&graph, "disk0", &image, false);
        block_on(bs.pwritev(512, &[3; 512], RequestFlags::empty())).unwrap();
        snapshot::create(&bs, &SnapshotInfo::new("", "kept")).unwrap();
        block_on(bs.pwritev(512, &[4; 512], RequestFlags::empty())).unwrap();
        graph.close_node("disk0").unwrap();

        let bs = open(&graph, "disk0", &image, true);
        assert_eq!(snapshot::list(&bs).unwrap()[0].name, "kept");

        snapshot::load_tmp(&bs, None, Some("kept")).unwrap();
        let data = block_on(bs.preadv(512, 512, RequestFlags::empty())).unwrap();
        assert_eq!(data, vec![3; 512]);

        // The temporary view goes away with the node.
        graph.close_node("disk0").unwrap();
        let bs = open(&graph, "disk0", &image, true);
        let data = block_on(bs.preadv(512, 512, RequestFlags::empty())).unwrap();
        assert_eq!(data, vec![4; 512]);
    }

    #[test]
    fn locked_medium_cannot_be_ejected() {
        let graph = BlockGraph::new();
        let image = Arc::new(MemoryImage::new(1 << 16));
        let bs = open(&graph, "disk0", &image, false);

        bs.lock_medium(true).unwrap();
        let e = bs.eject(true).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::Busy);
        assert!(bs.is_inserted());

        bs.lock_medium(false).unwrap();
        bs.eject(true).unwrap();
        assert!(!bs.is_inserted());
        assert!(!snapshot::can_snapshot(&bs));

        bs.eject(false).unwrap();
        assert!(bs.is_inserted());
    }

    #[test]
    fn bitmap_directory_checks() {
        let graph = BlockGraph::new();
        let image = Arc::new(MemoryImage::new(1 << 16));
        let bs = open(&graph, "disk0", &image, false);
        let driver = bs.driver().unwrap();

        driver.can_store_new_dirty_bitmap(&bs, "b", 65536).unwrap();
        let e = driver
            .can_store_new_dirty_bitmap(&bs, "b", u32::MAX)
            .unwrap_err();
        assert_eq!(e.kind(), ErrorKind::InvalidArgument);

        dirty_bitmap::add(&bs, "b", None, true, false).unwrap();
        graph.close_node("disk0").unwrap();
        assert_eq!(image.stored_bitmaps(), ["b"]);

        let bs = open(&graph, "disk0", &image, true);
        let e = driver.can_store_new_dirty_bitmap(&bs, "c", 65536).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::ReadOnly);

        // Bitmaps loaded from a read-only image can't be modified.
        let e = dirty_bitmap::clear(&bs, "b").unwrap_err();
        assert_eq!(e.kind(), ErrorKind::ReadOnly);
        graph.close_node("disk0").unwrap();

        let bs = open(&graph, "disk0", &image, false);
        let e = driver.can_store_new_dirty_bitmap(&bs, "b", 65536).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::AlreadyExists);
    }

    #[test]
    fn unclean_bitmaps_load_inconsistent() {
        let image = Arc::new(MemoryImage::new(1 << 16));
        {
            let graph = BlockGraph::new();
            let bs = open(&graph, "disk0", &image, false);
            dirty_bitmap::add(&bs, "b", None, true, false).unwrap();
            graph.close_node("disk0").unwrap();
        }
        {
            // Loaded, but never stored back.
            let graph = BlockGraph::new();
            open(&graph, "disk0", &image, false);
        }

        let graph = BlockGraph::new();
        let bs = open(&graph, "disk0", &image, false);
        let info = &dirty_bitmap::query(&bs)[0];
        assert!(info.inconsistent);
        assert!(!info.recording);

        let e = dirty_bitmap::enable(&bs, "b").unwrap_err();
        assert_eq!(e.kind(), ErrorKind::InvalidArgument);
        dirty_bitmap::remove(&bs, "b", true).unwrap();
        assert!(image.stored_bitmaps().is_empty());
    }
}
