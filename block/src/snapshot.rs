// Copyright © 2025 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0

//! Internal snapshots of single nodes and of every node at once.
//!
//! Per-node operations hand the request to the node's driver. Drivers that
//! don't implement snapshots themselves forward to their single data or
//! filtered child (see [`BlockDriver`](crate::BlockDriver)).
//!
//! Group operations visit [`BlockGraph::cursor`] in order, holding each
//! node's context only while working on that node. They stop at the first
//! failing node and report it; nodes handled before it keep their changes.

use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::driver::not_supported;
use crate::events::BlockEvent;
use crate::graph::{BlockGraph, NodeRef};
use crate::io::DrainedSection;
use crate::{Error, ErrorKind, Result};

/// Descriptor of one internal snapshot.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct SnapshotInfo {
    /// Unique per node. Left empty on creation to have the driver pick one.
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub vm_state_size: u64,
    #[serde(default)]
    pub date_sec: u64,
    #[serde(default)]
    pub date_nsec: u32,
    #[serde(default)]
    pub vm_clock_nsec: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icount: Option<u64>,
}

impl SnapshotInfo {
    pub fn new(id: &str, name: &str) -> Self {
        SnapshotInfo {
            id: id.to_string(),
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// New descriptor dated now.
    pub fn stamped(name: &str, vm_clock_nsec: u64) -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        SnapshotInfo {
            name: name.to_string(),
            date_sec: now.as_secs(),
            date_nsec: now.subsec_nanos(),
            vm_clock_nsec,
            ..Default::default()
        }
    }
}

/// Snapshot listing in the fixed-width layout of `info snapshots`.
pub struct SnapshotTable<'a>(pub &'a [SnapshotInfo]);

impl fmt::Display for SnapshotTable<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:<10}{:<20}{:>7}{:>20}{:>15}",
            "ID", "TAG", "VM SIZE", "DATE", "VM CLOCK"
        )?;
        for sn in self.0 {
            let secs = sn.vm_clock_nsec / 1_000_000_000;
            let clock = format!(
                "{:02}:{:02}:{:02}.{:03}",
                secs / 3600,
                (secs / 60) % 60,
                secs % 60,
                (sn.vm_clock_nsec / 1_000_000) % 1000
            );
            write!(
                f,
                "\n{:<10}{:<20}{:>7}{:>20}{:>15}",
                sn.id,
                sn.name,
                human_readable_size(sn.vm_state_size),
                format_date(sn.date_sec),
                clock
            )?;
        }
        Ok(())
    }
}

fn human_readable_size(size: u64) -> String {
    const SUFFIXES: [char; 4] = ['K', 'M', 'G', 'T'];

    if size <= 999 {
        return size.to_string();
    }

    let mut base: u64 = 1024;
    for (i, suffix) in SUFFIXES.iter().enumerate() {
        if size < 10 * base {
            return format!("{:.1}{}", size as f64 / base as f64, suffix);
        } else if size < 1000 * base || i == SUFFIXES.len() - 1 {
            return format!("{}{}", (size + (base >> 1)) / base, suffix);
        }
        base *= 1024;
    }
    size.to_string()
}

/// `YYYY-MM-DD HH:MM:SS` in UTC.
pub(crate) fn format_date(secs: u64) -> String {
    let days = (secs / 86400) as i64;
    let rem = secs % 86400;

    // Days since the epoch to a proleptic Gregorian date.
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = yoe + era * 400 + i64::from(month <= 2);

    format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
        year,
        month,
        day,
        rem / 3600,
        (rem / 60) % 60,
        rem % 60
    )
}

fn no_medium(bs: &NodeRef) -> Error {
    Error::NoMedium(format!("Device '{}' has no medium", bs.name()))
}

/// Looks `name` up as a snapshot id first, then as a snapshot name.
pub fn find(bs: &NodeRef, name: &str) -> Result<SnapshotInfo> {
    let sns = list(bs)?;
    sns.iter()
        .find(|sn| sn.id == name)
        .or_else(|| sns.iter().find(|sn| sn.name == name))
        .cloned()
        .ok_or_else(|| {
            Error::NotFound(format!(
                "Snapshot '{}' not found on '{}'",
                name,
                bs.name()
            ))
        })
}

/// Looks up the snapshot matching every given identifier.
///
/// At least one of `id` and `name` must be given. A miss is `Ok(None)`.
pub fn find_by_id_and_name(
    bs: &NodeRef,
    id: Option<&str>,
    name: Option<&str>,
) -> Result<Option<SnapshotInfo>> {
    assert!(id.is_some() || name.is_some());

    let sns = list(bs)?;
    Ok(sns
        .into_iter()
        .find(|sn| id.is_none_or(|id| sn.id == id) && name.is_none_or(|name| sn.name == name)))
}

pub fn can_snapshot(bs: &NodeRef) -> bool {
    let Some(driver) = bs.driver() else {
        return false;
    };
    if !bs.is_inserted() || bs.is_read_only() {
        return false;
    }
    driver.can_snapshot(bs)
}

pub fn create(bs: &NodeRef, sn: &SnapshotInfo) -> Result<SnapshotInfo> {
    let driver = bs.driver().ok_or_else(|| no_medium(bs))?;
    let created = driver.snapshot_create(bs, sn)?;

    info!(
        "Created snapshot '{}' (id {}) on '{}'",
        created.name,
        created.id,
        bs.name()
    );
    bs.events.emit(BlockEvent::SnapshotCreated {
        node: bs.name().to_string(),
        id: created.id.clone(),
        name: created.name.clone(),
    });

    Ok(created)
}

pub fn goto(bs: &NodeRef, snapshot_id: &str) -> Result<()> {
    let driver = bs.driver().ok_or_else(|| no_medium(bs))?;
    if !bs.state().bitmaps.is_empty() {
        return Err(Error::Busy(format!(
            "Device '{}' has active dirty bitmaps",
            bs.name()
        )));
    }

    driver.snapshot_goto(bs, snapshot_id)?;

    info!("Reverted '{}' to snapshot '{}'", bs.name(), snapshot_id);
    bs.events.emit(BlockEvent::SnapshotReverted {
        node: bs.name().to_string(),
        snapshot: snapshot_id.to_string(),
    });

    Ok(())
}

/// Reverts the snapshot fallback child of `bs` with the driver of `bs`
/// closed around it.
///
/// If the driver can't be reopened, `bs` is left without a driver. An error
/// from the child's revert takes precedence over the reopen error.
pub fn goto_through_child(bs: &NodeRef, snapshot_id: &str) -> Result<()> {
    let driver = bs.driver().ok_or_else(|| no_medium(bs))?;
    let Some(child) = bs.snapshot_fallback() else {
        return Err(not_supported(bs, "internal snapshots"));
    };
    let options = bs.options();

    debug!(
        "Reopening '{}' around revert of '{}'",
        bs.name(),
        child.name()
    );

    driver.close(bs);
    if let Some(edge) = bs.edge_to(&child) {
        bs.detach_child(&edge);
    }

    let ret = goto(&child, snapshot_id);

    if let Err(e) = driver.open(bs, &options) {
        error!("Failed to reopen '{}': {}", bs.name(), e);
        bs.detach_all_children();
        bs.clear_driver();
        return Err(ret.err().unwrap_or(e));
    }

    ret
}

pub fn delete(bs: &NodeRef, id: Option<&str>, name: Option<&str>) -> Result<()> {
    let driver = bs.driver().ok_or_else(|| no_medium(bs))?;
    if id.is_none() && name.is_none() {
        return Err(Error::InvalidArgument(
            "snapshot_id and name are both missing".to_string(),
        ));
    }

    let _drained = DrainedSection::begin(bs);
    driver.snapshot_delete(bs, id, name)?;

    info!(
        "Deleted snapshot (id {:?}, name {:?}) on '{}'",
        id,
        name,
        bs.name()
    );
    bs.events.emit(BlockEvent::SnapshotDeleted {
        node: bs.name().to_string(),
        id: id.unwrap_or_default().to_string(),
        name: name.unwrap_or_default().to_string(),
    });

    Ok(())
}

fn retry_as_name(e: &Error) -> bool {
    matches!(e.kind(), ErrorKind::NotFound | ErrorKind::InvalidArgument)
}

/// Deletes the snapshot with id `id_or_name`, or failing that the one with
/// that name.
pub fn delete_by_id_or_name(bs: &NodeRef, id_or_name: &str) -> Result<()> {
    match delete(bs, Some(id_or_name), None) {
        Err(e) if retry_as_name(&e) => delete(bs, None, Some(id_or_name)),
        ret => ret,
    }
}

pub fn list(bs: &NodeRef) -> Result<Vec<SnapshotInfo>> {
    let driver = bs.driver().ok_or_else(|| no_medium(bs))?;
    driver.snapshot_list(bs)
}

/// Makes a snapshot's contents the temporary view of a read-only node.
pub fn load_tmp(bs: &NodeRef, id: Option<&str>, name: Option<&str>) -> Result<()> {
    let driver = bs.driver().ok_or_else(|| no_medium(bs))?;
    if id.is_none() && name.is_none() {
        return Err(Error::InvalidArgument(
            "snapshot_id and name are both missing".to_string(),
        ));
    }
    if !bs.is_read_only() {
        return Err(Error::InvalidArgument(format!(
            "Device '{}' is not readonly",
            bs.name()
        )));
    }

    driver.snapshot_load_tmp(bs, id, name)
}

pub fn load_tmp_by_id_or_name(bs: &NodeRef, id_or_name: &str) -> Result<()> {
    match load_tmp(bs, Some(id_or_name), None) {
        Err(e) if retry_as_name(&e) => load_tmp(bs, None, Some(id_or_name)),
        ret => ret,
    }
}

/// Failure of a group operation on the first node it failed on.
#[derive(Error, Debug)]
#[error("Error on node '{}'", .node.name())]
pub struct GroupError {
    pub node: NodeRef,
    #[source]
    pub error: Error,
}

impl GroupError {
    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }
}

trait GroupResult<T> {
    fn on_node(self, bs: &NodeRef) -> std::result::Result<T, GroupError>;
}

impl<T> GroupResult<T> for Result<T> {
    fn on_node(self, bs: &NodeRef) -> std::result::Result<T, GroupError> {
        self.map_err(|error| {
            warn!("Group operation failed on '{}': {}", bs.name(), error);
            GroupError {
                node: Arc::clone(bs),
                error,
            }
        })
    }
}

/// Checks that every inserted, writable node supports snapshots.
pub fn all_can_snapshot(graph: &BlockGraph) -> std::result::Result<(), GroupError> {
    for bs in graph.cursor() {
        let _ctx = bs.context().acquire();
        let ok = !bs.is_inserted() || bs.is_read_only() || can_snapshot(&bs);
        if !ok {
            return Err(Error::NotSupported(format!(
                "Device '{}' is writable but does not support snapshots",
                bs.name()
            )))
            .on_node(&bs);
        }
    }
    Ok(())
}

/// Deletes snapshot `name` wherever it exists.
pub fn all_delete(graph: &BlockGraph, name: &str) -> std::result::Result<(), GroupError> {
    for bs in graph.cursor() {
        let _ctx = bs.context().acquire();
        if can_snapshot(&bs) && find(&bs, name).is_ok() {
            delete_by_id_or_name(&bs, name).on_node(&bs)?;
        }
    }
    Ok(())
}

pub fn all_goto(graph: &BlockGraph, name: &str) -> std::result::Result<(), GroupError> {
    for bs in graph.cursor() {
        let _ctx = bs.context().acquire();
        if can_snapshot(&bs) {
            goto(&bs, name).on_node(&bs)?;
        }
    }
    Ok(())
}

/// Checks that every node able to snapshot has snapshot `name`.
pub fn all_find(graph: &BlockGraph, name: &str) -> std::result::Result<(), GroupError> {
    for bs in graph.cursor() {
        let _ctx = bs.context().acquire();
        if can_snapshot(&bs) {
            find(&bs, name).on_node(&bs)?;
        }
    }
    Ok(())
}

/// Creates `sn` on every node able to snapshot, and on `vm_state_bs`, which
/// is the only one recording `vm_state_size`.
pub fn all_create(
    graph: &BlockGraph,
    sn: &SnapshotInfo,
    vm_state_bs: &NodeRef,
    vm_state_size: u64,
) -> std::result::Result<(), GroupError> {
    let mut sn = sn.clone();
    for bs in graph.cursor() {
        let _ctx = bs.context().acquire();
        if Arc::ptr_eq(&bs, vm_state_bs) {
            sn.vm_state_size = vm_state_size;
            create(&bs, &sn).on_node(&bs)?;
        } else if can_snapshot(&bs) {
            sn.vm_state_size = 0;
            create(&bs, &sn).on_node(&bs)?;
        }
    }
    Ok(())
}

/// First node, in group order, able to hold the VM state.
pub fn find_vmstate_node(graph: &BlockGraph) -> Option<NodeRef> {
    graph.cursor().into_iter().find(|bs| {
        let _ctx = bs.context().acquire();
        can_snapshot(bs)
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::driver::OpenOptions;
    use crate::filter::copy_on_read::CopyOnRead;
    use crate::memory::MemoryImage;
    use crate::raw::RawFile;

    /// Filter that refuses to open again once `refuse_reopen` is set.
    #[derive(Default)]
    struct StubbornFilter {
        refuse_reopen: AtomicBool,
    }

    impl crate::BlockDriver for StubbornFilter {
        fn format_name(&self) -> &str {
            "stubborn"
        }

        fn is_filter(&self) -> bool {
            true
        }

        fn open(&self, bs: &NodeRef, options: &OpenOptions) -> Result<()> {
            if self.refuse_reopen.load(Ordering::SeqCst) {
                return Err(Error::Busy(format!("'{}' refuses to reopen", bs.name())));
            }
            crate::filter::open_filtered_child(bs, options)
        }
    }

    fn open_memory(graph: &BlockGraph, name: &str) -> NodeRef {
        graph
            .open_node(
                name,
                Arc::new(MemoryImage::new(1 << 20)),
                OpenOptions::default(),
            )
            .unwrap()
    }

    fn names(bs: &NodeRef) -> Vec<String> {
        list(bs).unwrap().into_iter().map(|sn| sn.name).collect()
    }

    #[test]
    fn find_agrees_on_id_and_name() {
        let graph = BlockGraph::new();
        let bs = open_memory(&graph, "disk0");

        for name in ["first", "second", "third"] {
            create(&bs, &SnapshotInfo::new("", name)).unwrap();
        }

        for sn in list(&bs).unwrap() {
            let by_id = find(&bs, &sn.id).unwrap();
            let by_name = find(&bs, &sn.name).unwrap();
            let by_both = find_by_id_and_name(&bs, Some(&sn.id), Some(&sn.name))
                .unwrap()
                .unwrap();
            assert_eq!(by_id, sn);
            assert_eq!(by_name, sn);
            assert_eq!(by_both, sn);
        }

        assert_eq!(find_by_id_and_name(&bs, Some("1"), Some("second")).unwrap(), None);
        assert_eq!(find_by_id_and_name(&bs, None, Some("nope")).unwrap(), None);
        assert_eq!(
            find(&bs, "nope").unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[test]
    fn find_prefers_ids_over_names() {
        let graph = BlockGraph::new();
        let bs = open_memory(&graph, "disk0");

        create(&bs, &SnapshotInfo::new("", "2")).unwrap();
        create(&bs, &SnapshotInfo::new("", "other")).unwrap();

        let sn = find(&bs, "2").unwrap();
        assert_eq!(sn.id, "2");
        assert_eq!(sn.name, "other");
    }

    #[test]
    fn delete_falls_back_to_name() {
        let graph = BlockGraph::new();
        let bs = open_memory(&graph, "disk0");

        create(&bs, &SnapshotInfo::new("", "x")).unwrap();
        create(&bs, &SnapshotInfo::new("", "y")).unwrap();

        delete_by_id_or_name(&bs, "x").unwrap();
        assert_eq!(names(&bs), ["y"]);

        let e = delete_by_id_or_name(&bs, "x").unwrap_err();
        assert_eq!(e.kind(), ErrorKind::NotFound);

        delete_by_id_or_name(&bs, "2").unwrap();
        assert!(list(&bs).unwrap().is_empty());
    }

    #[test]
    fn delete_requires_an_identifier() {
        let graph = BlockGraph::new();
        let bs = open_memory(&graph, "disk0");

        let e = delete(&bs, None, None).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::InvalidArgument);
        assert!(!bs.io.is_quiesced());
    }

    #[test]
    fn driverless_node_has_no_medium() {
        let graph = BlockGraph::new();
        let bs = open_memory(&graph, "disk0");
        bs.clear_driver();

        assert!(!can_snapshot(&bs));
        for e in [
            create(&bs, &SnapshotInfo::new("", "a")).unwrap_err(),
            goto(&bs, "a").unwrap_err(),
            delete(&bs, Some("1"), None).unwrap_err(),
            list(&bs).unwrap_err(),
            load_tmp(&bs, Some("1"), None).unwrap_err(),
        ] {
            assert_eq!(e.kind(), ErrorKind::NoMedium);
        }
    }

    #[test]
    fn filter_passes_length_and_snapshots_through() {
        let graph = BlockGraph::new();
        let bs = open_memory(&graph, "disk0");
        let filter = graph
            .open_node(
                "cor",
                Arc::new(CopyOnRead),
                OpenOptions {
                    file: Some(Arc::clone(&bs)),
                    ..Default::default()
                },
            )
            .unwrap();

        assert_eq!(filter.get_length().unwrap(), bs.get_length().unwrap());
        assert!(can_snapshot(&filter));

        let created = create(&filter, &SnapshotInfo::new("", "through")).unwrap();
        assert_eq!(list(&bs).unwrap(), vec![created.clone()]);
        assert_eq!(list(&filter).unwrap(), vec![created]);

        delete_by_id_or_name(&filter, "through").unwrap();
        assert!(list(&bs).unwrap().is_empty());
    }

    #[test]
    fn leaf_without_snapshots_is_not_supported() {
        let graph = BlockGraph::new();
        let file = vmm_sys_util::tempfile::TempFile::new().unwrap();
        file.as_file().set_len(1 << 16).unwrap();
        let bs = graph
            .open_node(
                "raw",
                Arc::new(RawFile::new(file.as_path())),
                OpenOptions::default(),
            )
            .unwrap();

        assert!(!can_snapshot(&bs));
        let e = create(&bs, &SnapshotInfo::new("", "a")).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::NotSupported);
        let e = goto(&bs, "a").unwrap_err();
        assert_eq!(e.kind(), ErrorKind::NotSupported);
    }

    #[test]
    fn goto_refused_with_dirty_bitmaps() {
        let graph = BlockGraph::new();
        let bs = open_memory(&graph, "disk0");
        create(&bs, &SnapshotInfo::new("", "a")).unwrap();
        crate::dirty_bitmap::add(&bs, "b0", None, false, false).unwrap();

        let e = goto(&bs, "a").unwrap_err();
        assert_eq!(e.kind(), ErrorKind::Busy);

        crate::dirty_bitmap::remove(&bs, "b0", true).unwrap();
        goto(&bs, "a").unwrap();
    }

    #[test]
    fn failed_reopen_leaves_node_without_driver() {
        let graph = BlockGraph::new();
        let child = open_memory(&graph, "disk0");
        create(&child, &SnapshotInfo::new("", "a")).unwrap();

        let driver = Arc::new(StubbornFilter::default());
        let bs = graph
            .open_node(
                "top",
                driver.clone(),
                OpenOptions {
                    file: Some(Arc::clone(&child)),
                    ..Default::default()
                },
            )
            .unwrap();

        let before = Arc::strong_count(&child);
        goto(&bs, "a").unwrap();
        assert_eq!(Arc::strong_count(&child), before);
        assert!(Arc::ptr_eq(&bs.primary_child().unwrap(), &child));

        // The child reverts, then the filter fails to come back.
        driver.refuse_reopen.store(true, Ordering::SeqCst);
        let e = goto(&bs, "a").unwrap_err();
        assert_eq!(e.kind(), ErrorKind::Busy);
        assert!(bs.driver().is_none());
        assert!(bs.children().is_empty());
        assert!(child.parents().is_empty());
        // Only the edge from the filter is gone.
        assert_eq!(Arc::strong_count(&child), before - 1);
    }

    #[test]
    fn failed_child_revert_wins_over_reopen_error() {
        let graph = BlockGraph::new();
        let child = open_memory(&graph, "disk0");
        let driver = Arc::new(StubbornFilter::default());
        let bs = graph
            .open_node(
                "top",
                driver.clone(),
                OpenOptions {
                    file: Some(Arc::clone(&child)),
                    ..Default::default()
                },
            )
            .unwrap();

        let before = Arc::strong_count(&child);
        driver.refuse_reopen.store(true, Ordering::SeqCst);
        let e = goto_through_child(&bs, "missing").unwrap_err();
        assert_eq!(e.kind(), ErrorKind::NotFound);
        assert!(bs.driver().is_none());
        assert_eq!(Arc::strong_count(&child), before - 1);

        // A node left without a driver has no medium.
        assert_eq!(goto(&bs, "missing").unwrap_err().kind(), ErrorKind::NoMedium);
    }

    #[test]
    fn load_tmp_requires_read_only() {
        let graph = BlockGraph::new();
        let image = Arc::new(MemoryImage::new(1 << 16));
        let bs = graph
            .open_node("disk0", image.clone(), OpenOptions::default())
            .unwrap();
        create(&bs, &SnapshotInfo::new("", "old")).unwrap();

        let e = load_tmp_by_id_or_name(&bs, "old").unwrap_err();
        assert_eq!(e.kind(), ErrorKind::InvalidArgument);
        assert_eq!(
            load_tmp(&bs, None, None).unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );

        graph.close_node("disk0").unwrap();
        let bs = graph
            .open_node(
                "disk0",
                image,
                OpenOptions {
                    read_only: true,
                    ..Default::default()
                },
            )
            .unwrap();
        load_tmp_by_id_or_name(&bs, "old").unwrap();
        load_tmp_by_id_or_name(&bs, "1").unwrap();
        assert_eq!(
            load_tmp_by_id_or_name(&bs, "missing").unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[test]
    fn group_create_stops_at_first_failure() {
        let graph = BlockGraph::new();
        let n1 = open_memory(&graph, "n1");
        let n2 = open_memory(&graph, "n2");
        let n3 = open_memory(&graph, "n3");
        create(&n2, &SnapshotInfo::new("1", "existing")).unwrap();

        let sn = SnapshotInfo::new("1", "group");
        let e = all_create(&graph, &sn, &n1, 4096).unwrap_err();

        assert!(Arc::ptr_eq(&e.node, &n2));
        assert_eq!(e.kind(), ErrorKind::AlreadyExists);

        let on_n1 = list(&n1).unwrap();
        assert_eq!(on_n1.len(), 1);
        assert_eq!(on_n1[0].name, "group");
        assert_eq!(on_n1[0].vm_state_size, 4096);
        assert_eq!(names(&n2), ["existing"]);
        assert!(list(&n3).unwrap().is_empty());
    }

    #[test]
    fn group_operations() {
        let graph = BlockGraph::new();
        let n1 = open_memory(&graph, "n1");
        let n2 = open_memory(&graph, "n2");

        all_can_snapshot(&graph).unwrap();
        assert!(Arc::ptr_eq(&find_vmstate_node(&graph).unwrap(), &n1));

        let sn = SnapshotInfo::stamped("s1", 0);
        all_create(&graph, &sn, &n1, 100).unwrap();
        assert_eq!(find(&n2, "s1").unwrap().vm_state_size, 0);
        all_find(&graph, "s1").unwrap();
        all_goto(&graph, "s1").unwrap();

        // Deleting skips nodes without the snapshot.
        let n3 = open_memory(&graph, "n3");
        all_delete(&graph, "s1").unwrap();
        assert!(list(&n1).unwrap().is_empty());
        assert!(list(&n2).unwrap().is_empty());

        let e = all_find(&graph, "s1").unwrap_err();
        assert!(Arc::ptr_eq(&e.node, &n1));
        assert_eq!(e.kind(), ErrorKind::NotFound);
        drop(n3);
    }

    #[test]
    fn read_only_nodes_are_skipped() {
        let graph = BlockGraph::new();
        let image = Arc::new(MemoryImage::new(1 << 16));
        let ro = graph
            .open_node(
                "ro",
                image,
                OpenOptions {
                    read_only: true,
                    ..Default::default()
                },
            )
            .unwrap();
        let rw = open_memory(&graph, "rw");

        assert!(!can_snapshot(&ro));
        all_can_snapshot(&graph).unwrap();
        assert!(Arc::ptr_eq(&find_vmstate_node(&graph).unwrap(), &rw));

        all_create(&graph, &SnapshotInfo::new("", "s"), &rw, 0).unwrap();
        assert!(list(&ro).unwrap().is_empty());
        all_goto(&graph, "s").unwrap();
    }

    #[test]
    fn writable_node_without_snapshots_fails_check() {
        let graph = BlockGraph::new();
        open_memory(&graph, "mem");
        let file = vmm_sys_util::tempfile::TempFile::new().unwrap();
        file.as_file().set_len(4096).unwrap();
        graph
            .open_node(
                "raw",
                Arc::new(RawFile::new(file.as_path())),
                OpenOptions::default(),
            )
            .unwrap();

        let e = all_can_snapshot(&graph).unwrap_err();
        assert_eq!(e.node.name(), "raw");
        assert_eq!(e.kind(), ErrorKind::NotSupported);
        assert_eq!(
            e.error.to_string(),
            "Device 'raw' is writable but does not support snapshots"
        );
    }

    #[test]
    fn table_layout() {
        let sn = SnapshotInfo {
            id: "1".to_string(),
            name: "boot".to_string(),
            vm_state_size: 1536,
            date_sec: 86400 * 365 + 3661,
            date_nsec: 0,
            vm_clock_nsec: 3_723_004_000_000,
            icount: None,
        };
        let table = SnapshotTable(std::slice::from_ref(&sn)).to_string();
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(
            lines[0],
            "ID        TAG                 VM SIZE                DATE       VM CLOCK"
        );
        assert_eq!(
            lines[1],
            "1         boot                   1.5K 1971-01-01 01:01:01   01:02:03.004"
        );
    }

    #[test]
    fn readable_sizes() {
        assert_eq!(human_readable_size(999), "999");
        assert_eq!(human_readable_size(1000), "1.0K");
        assert_eq!(human_readable_size(20 * 1024), "20K");
        assert_eq!(human_readable_size(3 << 30), "3.0G");
    }
}
