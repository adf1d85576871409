// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! Commands addressing nodes by name.
//!
//! This is the boundary the management interface talks to. Each command
//! resolves its node, takes the node's context for the duration of the
//! call and reports failures as a [`CommandError`] carrying the error
//! class and a readable description.

use std::error::Error as StdError;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::dirty_bitmap::{self, BitmapInfo, MergeSource};
use crate::graph::{BlockGraph, NodeRef};
use crate::io::DrainedSection;
use crate::relay::ReplayMode;
use crate::snapshot::{self, SnapshotInfo, SnapshotTable};
use crate::transaction::{self, Action};
use crate::{Error, ErrorKind, Result};

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct BitmapAddArgs {
    pub node: String,
    pub name: String,
    #[serde(default)]
    pub granularity: Option<u32>,
    #[serde(default)]
    pub persistent: bool,
    #[serde(default)]
    pub disabled: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct BitmapArgs {
    pub node: String,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct BitmapMergeArgs {
    pub node: String,
    pub target: String,
    pub bitmaps: Vec<MergeSource>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct InternalSnapshotArgs {
    pub device: String,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DeleteInternalSnapshotArgs {
    pub device: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct SavevmArgs {
    #[serde(default)]
    pub name: Option<String>,
    /// Bytes of VM state the caller saved along with the disks.
    #[serde(default)]
    pub vm_state_size: u64,
    #[serde(default)]
    pub vm_clock_nsec: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SnapshotNameArgs {
    pub name: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TransactionArgs {
    pub actions: Vec<Action>,
}

/// `{"execute": "<command>", "arguments": {...}}`
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "execute", content = "arguments", rename_all = "kebab-case")]
pub enum Command {
    BlockDirtyBitmapAdd(BitmapAddArgs),
    BlockDirtyBitmapClear(BitmapArgs),
    BlockDirtyBitmapDisable(BitmapArgs),
    BlockDirtyBitmapEnable(BitmapArgs),
    BlockDirtyBitmapMerge(BitmapMergeArgs),
    BlockDirtyBitmapRemove(BitmapArgs),
    BlockdevSnapshotDeleteInternalSync(DeleteInternalSnapshotArgs),
    BlockdevSnapshotInternalSync(InternalSnapshotArgs),
    Delvm(SnapshotNameArgs),
    InfoSnapshots,
    Loadvm(SnapshotNameArgs),
    QueryNamedBlockNodes,
    Savevm(SavevmArgs),
    Transaction(TransactionArgs),
}

/// Failure reported back to the issuer of a command.
#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize)]
#[error("{desc}")]
pub struct CommandError {
    pub class: ErrorKind,
    pub desc: String,
}

impl From<Error> for CommandError {
    fn from(e: Error) -> Self {
        let mut desc = e.to_string();
        let mut source = e.source();
        while let Some(s) = source {
            desc.push_str(&format!(": {s}"));
            source = s.source();
        }
        CommandError {
            class: e.kind(),
            desc,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ChildInfo {
    pub name: String,
    pub node_name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct NodeInfo {
    pub node_name: String,
    pub drv: Option<String>,
    pub ro: bool,
    pub inserted: bool,
    pub children: Vec<ChildInfo>,
    pub dirty_bitmaps: Vec<BitmapInfo>,
}

/// Looks `id` up as a device id, then as a node name.
pub fn lookup_bs(graph: &BlockGraph, id: &str) -> Result<NodeRef> {
    match graph.device_node(id) {
        Some(bs) => Ok(bs),
        None => graph.lookup(id),
    }
}

/// Like [`lookup_bs`], for commands that only work on the top of a graph.
pub(crate) fn lookup_root_bs(graph: &BlockGraph, id: &str) -> Result<NodeRef> {
    let bs = lookup_bs(graph, id)?;
    if bs.has_node_parent() {
        return Err(Error::InvalidArgument(format!(
            "Need a root block node, '{id}' is used by another node"
        )));
    }
    if !bs.is_inserted() {
        return Err(Error::NoMedium(format!("Device '{id}' has no medium")));
    }
    Ok(bs)
}

pub(crate) fn check_bitmap_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidArgument(
            "Bitmap name cannot be empty".to_string(),
        ));
    }
    Ok(())
}

pub fn block_dirty_bitmap_add(graph: &BlockGraph, args: &BitmapAddArgs) -> Result<()> {
    check_bitmap_name(&args.name)?;
    let bs = lookup_bs(graph, &args.node)?;
    let _ctx = bs.context().acquire();
    dirty_bitmap::add(
        &bs,
        &args.name,
        args.granularity,
        args.persistent,
        args.disabled,
    )
}

pub fn block_dirty_bitmap_remove(graph: &BlockGraph, node: &str, name: &str) -> Result<()> {
    check_bitmap_name(name)?;
    let bs = lookup_bs(graph, node)?;
    let _ctx = bs.context().acquire();
    dirty_bitmap::remove(&bs, name, true).map(drop)
}

pub fn block_dirty_bitmap_clear(graph: &BlockGraph, node: &str, name: &str) -> Result<()> {
    check_bitmap_name(name)?;
    let bs = lookup_bs(graph, node)?;
    let _ctx = bs.context().acquire();
    dirty_bitmap::clear(&bs, name).map(drop)
}

pub fn block_dirty_bitmap_enable(graph: &BlockGraph, node: &str, name: &str) -> Result<()> {
    check_bitmap_name(name)?;
    let bs = lookup_bs(graph, node)?;
    let _ctx = bs.context().acquire();
    dirty_bitmap::enable(&bs, name)
}

pub fn block_dirty_bitmap_disable(graph: &BlockGraph, node: &str, name: &str) -> Result<()> {
    check_bitmap_name(name)?;
    let bs = lookup_bs(graph, node)?;
    let _ctx = bs.context().acquire();
    dirty_bitmap::disable(&bs, name)
}

pub fn block_dirty_bitmap_merge(
    graph: &BlockGraph,
    node: &str,
    target: &str,
    sources: &[MergeSource],
) -> Result<()> {
    check_bitmap_name(target)?;
    let bs = lookup_bs(graph, node)?;
    dirty_bitmap::merge(graph, &bs, target, sources, false).map(drop)
}

/// Takes internal snapshot `name` of a root node, as a transaction of its
/// own.
pub fn blockdev_snapshot_internal_sync(graph: &BlockGraph, device: &str, name: &str) -> Result<()> {
    transaction::run(
        graph,
        &[Action::BlockdevSnapshotInternalSync(InternalSnapshotArgs {
            device: device.to_string(),
            name: name.to_string(),
        })],
    )
}

/// Deletes the internal snapshot matching every given identifier and
/// returns its descriptor.
pub fn blockdev_snapshot_delete_internal_sync(
    graph: &BlockGraph,
    device: &str,
    id: Option<&str>,
    name: Option<&str>,
) -> Result<SnapshotInfo> {
    let bs = lookup_root_bs(graph, device)?;
    let _ctx = bs.context().acquire();

    if id.is_none() && name.is_none() {
        return Err(Error::InvalidArgument(
            "Name or id must be provided".to_string(),
        ));
    }

    let sn = snapshot::find_by_id_and_name(&bs, id, name)?.ok_or_else(|| {
        Error::NotFound(format!(
            "Snapshot with id '{}' and name '{}' does not exist on device '{}'",
            id.unwrap_or("(null)"),
            name.unwrap_or("(null)"),
            device
        ))
    })?;

    snapshot::delete(&bs, id, name)?;
    Ok(sn)
}

/// The node the VM state goes to: the configured one, or else the first
/// node able to take snapshots.
fn vmstate_bs(graph: &BlockGraph) -> Result<NodeRef> {
    match graph.vm_state_node() {
        Some(name) => {
            let bs = graph.find_node(&name).ok_or_else(|| {
                Error::NotFound(format!("vmstate block device '{name}' does not exist"))
            })?;
            let _ctx = bs.context().acquire();
            if !snapshot::can_snapshot(&bs) {
                return Err(Error::NotSupported(format!(
                    "vmstate block device '{name}' does not support snapshots"
                )));
            }
            Ok(Arc::clone(&bs))
        }
        None => snapshot::find_vmstate_node(graph).ok_or_else(|| {
            Error::NotSupported("No block device can accept snapshots".to_string())
        }),
    }
}

/// `vm-YYYYMMDDhhmmss`, in UTC.
fn generated_name(date_sec: u64) -> String {
    let date: String = snapshot::format_date(date_sec)
        .chars()
        .filter(char::is_ascii_digit)
        .collect();
    format!("vm-{date}")
}

/// Snapshots every node at once, replacing snapshots of the same name.
pub fn savevm(graph: &BlockGraph, args: &SavevmArgs) -> Result<SnapshotInfo> {
    snapshot::all_can_snapshot(graph).map_err(|e| e.error)?;

    if let Some(name) = &args.name {
        snapshot::all_delete(graph, name).map_err(|e| {
            let prefix = format!("Error while deleting snapshot on device '{}'", e.node.name());
            e.error.prefixed(&prefix)
        })?;
    }

    let bs = vmstate_bs(graph)?;

    let mut sn = SnapshotInfo::stamped("", args.vm_clock_nsec);
    match &args.name {
        Some(name) => {
            let old = {
                let _ctx = bs.context().acquire();
                snapshot::find(&bs, name).ok()
            };
            match old {
                Some(old) => {
                    sn.name = old.name;
                    sn.id = old.id;
                }
                None => sn.name = name.clone(),
            }
        }
        None => sn.name = generated_name(sn.date_sec),
    }
    if graph.relay().mode() == ReplayMode::Replay {
        sn.icount = Some(graph.relay().released_count());
    }

    snapshot::all_create(graph, &sn, &bs, args.vm_state_size).map_err(|e| {
        let prefix = format!("Error while creating snapshot on '{}'", e.node.name());
        e.error.prefixed(&prefix)
    })?;

    info!("Saved VM snapshot '{}' with state on '{}'", sn.name, bs.name());
    Ok(sn)
}

/// Reverts every node to snapshot `name`, which must carry VM state.
pub fn loadvm(graph: &BlockGraph, name: &str) -> Result<()> {
    snapshot::all_can_snapshot(graph).map_err(|e| e.error)?;

    snapshot::all_find(graph, name).map_err(|e| {
        let prefix = format!(
            "Device '{}' does not have the requested snapshot '{}'",
            e.node.name(),
            name
        );
        e.error.prefixed(&prefix)
    })?;

    let bs = vmstate_bs(graph)?;
    let sn = {
        let _ctx = bs.context().acquire();
        snapshot::find(&bs, name)?
    };
    if sn.vm_state_size == 0 {
        return Err(Error::InvalidArgument(
            "This is a disk-only snapshot. Revert to it offline using qemu-img".to_string(),
        ));
    }

    let drained: Vec<DrainedSection> = graph.cursor().iter().map(DrainedSection::begin).collect();
    let ret = snapshot::all_goto(graph, name).map_err(|e| {
        let prefix = format!(
            "Could not load snapshot '{}' on '{}'",
            name,
            e.node.name()
        );
        e.error.prefixed(&prefix)
    });
    drop(drained);

    if ret.is_ok() {
        info!("Loaded VM snapshot '{name}'");
    }
    ret
}

pub fn delvm(graph: &BlockGraph, name: &str) -> Result<()> {
    snapshot::all_delete(graph, name).map_err(|e| {
        let prefix = format!("Error while deleting snapshot on device '{}'", e.node.name());
        e.error.prefixed(&prefix)
    })
}

/// Snapshots of the VM state node that every other node has as well.
pub fn info_snapshots(graph: &BlockGraph) -> Result<Vec<SnapshotInfo>> {
    let bs = vmstate_bs(graph).map_err(|_| {
        Error::NotSupported("No available block device supports snapshots".to_string())
    })?;
    let sns = {
        let _ctx = bs.context().acquire();
        snapshot::list(&bs)?
    };

    Ok(sns
        .into_iter()
        .filter(|sn| snapshot::all_find(graph, &sn.id).is_ok())
        .collect())
}

pub fn query_named_block_nodes(graph: &BlockGraph) -> Vec<NodeInfo> {
    graph
        .nodes()
        .iter()
        .map(|bs| {
            let _ctx = bs.context().acquire();
            NodeInfo {
                node_name: bs.name().to_string(),
                drv: bs.format_name(),
                ro: bs.is_read_only(),
                inserted: bs.is_inserted(),
                children: bs
                    .children()
                    .iter()
                    .map(|edge| ChildInfo {
                        name: edge.name().to_string(),
                        node_name: edge.child().name().to_string(),
                    })
                    .collect(),
                dirty_bitmaps: dirty_bitmap::query(bs),
            }
        })
        .collect()
}

fn to_value<T: Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| Error::io("Failed to serialise the reply", e.into()))
}

fn empty() -> Value {
    Value::Object(Default::default())
}

/// Runs `command` and returns its reply.
pub fn execute(graph: &BlockGraph, command: Command) -> std::result::Result<Value, CommandError> {
    debug!("Executing {command:?}");

    let reply = match command {
        Command::BlockDirtyBitmapAdd(args) => block_dirty_bitmap_add(graph, &args).map(|_| empty()),
        Command::BlockDirtyBitmapClear(args) => {
            block_dirty_bitmap_clear(graph, &args.node, &args.name).map(|_| empty())
        }
        Command::BlockDirtyBitmapDisable(args) => {
            block_dirty_bitmap_disable(graph, &args.node, &args.name).map(|_| empty())
        }
        Command::BlockDirtyBitmapEnable(args) => {
            block_dirty_bitmap_enable(graph, &args.node, &args.name).map(|_| empty())
        }
        Command::BlockDirtyBitmapMerge(args) => {
            block_dirty_bitmap_merge(graph, &args.node, &args.target, &args.bitmaps)
                .map(|_| empty())
        }
        Command::BlockDirtyBitmapRemove(args) => {
            block_dirty_bitmap_remove(graph, &args.node, &args.name).map(|_| empty())
        }
        Command::BlockdevSnapshotDeleteInternalSync(args) => {
            blockdev_snapshot_delete_internal_sync(
                graph,
                &args.device,
                args.id.as_deref(),
                args.name.as_deref(),
            )
            .and_then(|sn| to_value(&sn))
        }
        Command::BlockdevSnapshotInternalSync(args) => {
            blockdev_snapshot_internal_sync(graph, &args.device, &args.name).map(|_| empty())
        }
        Command::Delvm(args) => delvm(graph, &args.name).map(|_| empty()),
        Command::InfoSnapshots => info_snapshots(graph).map(|sns| {
            if sns.is_empty() {
                Value::String("There is no snapshot available.".to_string())
            } else {
                Value::String(SnapshotTable(&sns).to_string())
            }
        }),
        Command::Loadvm(args) => loadvm(graph, &args.name).map(|_| empty()),
        Command::QueryNamedBlockNodes => to_value(&query_named_block_nodes(graph)),
        Command::Savevm(args) => savevm(graph, &args).and_then(|sn| to_value(&sn)),
        Command::Transaction(args) => transaction::run(graph, &args.actions).map(|_| empty()),
    };

    reply.map_err(|e| {
        let e = CommandError::from(e);
        warn!("Command failed: {}", e.desc);
        e
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::OpenOptions;
    use crate::filter::copy_on_read::CopyOnRead;
    use crate::memory::MemoryImage;
    use crate::permission::Permissions;

    fn graph_with(names: &[&str]) -> BlockGraph {
        let graph = BlockGraph::new();
        for name in names {
            graph
                .open_node(
                    name,
                    Arc::new(MemoryImage::new(1 << 20)),
                    OpenOptions::default(),
                )
                .unwrap();
        }
        graph
    }

    fn command(json: &str) -> Command {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn parse_commands() {
        match command(
            r#"{"execute": "block-dirty-bitmap-add",
                "arguments": {"node": "disk0", "name": "b0", "granularity": 65536}}"#,
        ) {
            Command::BlockDirtyBitmapAdd(args) => {
                assert_eq!(args.granularity, Some(65536));
                assert!(!args.persistent);
            }
            other => panic!("unexpected command {other:?}"),
        }

        match command(
            r#"{"execute": "block-dirty-bitmap-merge",
                "arguments": {"node": "disk0", "target": "t",
                              "bitmaps": ["a", {"node": "disk1", "name": "b"}]}}"#,
        ) {
            Command::BlockDirtyBitmapMerge(args) => assert_eq!(
                args.bitmaps,
                [
                    MergeSource::Local("a".to_string()),
                    MergeSource::External {
                        node: "disk1".to_string(),
                        name: "b".to_string()
                    }
                ]
            ),
            other => panic!("unexpected command {other:?}"),
        }

        assert!(matches!(
            command(r#"{"execute": "info-snapshots"}"#),
            Command::InfoSnapshots
        ));
        assert!(serde_json::from_str::<Command>(
            r#"{"execute": "block-dirty-bitmap-clear", "arguments": {"node": "a", "name": "b", "x": 1}}"#
        )
        .is_err());
    }

    #[test]
    fn errors_carry_class() {
        let graph = graph_with(&["disk0"]);

        let e = execute(
            &graph,
            command(r#"{"execute": "block-dirty-bitmap-add", "arguments": {"node": "disk0", "name": ""}}"#),
        )
        .unwrap_err();
        assert_eq!(e.class, ErrorKind::InvalidArgument);
        assert_eq!(e.desc, "Bitmap name cannot be empty");

        let e = execute(
            &graph,
            command(r#"{"execute": "block-dirty-bitmap-clear", "arguments": {"node": "nope", "name": "b"}}"#),
        )
        .unwrap_err();
        assert_eq!(e.class, ErrorKind::NotFound);

        let reply = serde_json::to_value(&e).unwrap();
        assert_eq!(reply["class"], "not-found");
    }

    #[test]
    fn bitmaps_through_devices() {
        let graph = graph_with(&["disk0"]);
        let bs = graph.find_node("disk0").unwrap();
        graph
            .attach_device("virtio0", &bs, Permissions::CONSISTENT_READ, Permissions::all())
            .unwrap();

        let add = BitmapAddArgs {
            node: "virtio0".to_string(),
            name: "b0".to_string(),
            granularity: None,
            persistent: false,
            disabled: true,
        };
        block_dirty_bitmap_add(&graph, &add).unwrap();
        block_dirty_bitmap_enable(&graph, "disk0", "b0").unwrap();
        block_dirty_bitmap_clear(&graph, "virtio0", "b0").unwrap();

        let nodes = query_named_block_nodes(&graph);
        assert_eq!(nodes[0].node_name, "disk0");
        assert_eq!(nodes[0].drv.as_deref(), Some("memory"));
        assert_eq!(nodes[0].dirty_bitmaps.len(), 1);
        assert!(nodes[0].dirty_bitmaps[0].recording);

        block_dirty_bitmap_remove(&graph, "virtio0", "b0").unwrap();
        assert!(query_named_block_nodes(&graph)[0].dirty_bitmaps.is_empty());
    }

    #[test]
    fn internal_snapshot_checks() {
        let graph = graph_with(&["disk0"]);
        graph
            .open_node(
                "ro",
                Arc::new(MemoryImage::new(1 << 16)),
                OpenOptions {
                    read_only: true,
                    ..Default::default()
                },
            )
            .unwrap();

        blockdev_snapshot_internal_sync(&graph, "disk0", "s1").unwrap();
        let e = blockdev_snapshot_internal_sync(&graph, "disk0", "s1").unwrap_err();
        assert_eq!(e.kind(), ErrorKind::AlreadyExists);
        let e = blockdev_snapshot_internal_sync(&graph, "disk0", "").unwrap_err();
        assert_eq!(e.kind(), ErrorKind::InvalidArgument);
        let e = blockdev_snapshot_internal_sync(&graph, "ro", "s1").unwrap_err();
        assert_eq!(e.kind(), ErrorKind::ReadOnly);

        let bs = graph.find_node("disk0").unwrap();
        assert!(!bs.io.is_quiesced());
        let sns = snapshot::list(&bs).unwrap();
        assert_eq!(sns.len(), 1);
        assert!(sns[0].date_sec > 0);
    }

    #[test]
    fn internal_snapshot_needs_root_node() {
        let graph = graph_with(&["base"]);
        let base = graph.find_node("base").unwrap();
        graph
            .open_node(
                "cor",
                Arc::new(CopyOnRead),
                OpenOptions {
                    file: Some(base),
                    ..Default::default()
                },
            )
            .unwrap();

        let e = blockdev_snapshot_internal_sync(&graph, "base", "s").unwrap_err();
        assert_eq!(e.kind(), ErrorKind::InvalidArgument);
        blockdev_snapshot_internal_sync(&graph, "cor", "s").unwrap();
    }

    #[test]
    fn delete_internal_returns_descriptor() {
        let graph = graph_with(&["disk0"]);
        blockdev_snapshot_internal_sync(&graph, "disk0", "s1").unwrap();

        let e = blockdev_snapshot_delete_internal_sync(&graph, "disk0", None, None).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::InvalidArgument);
        let e = blockdev_snapshot_delete_internal_sync(&graph, "disk0", Some("1"), Some("other"))
            .unwrap_err();
        assert_eq!(e.kind(), ErrorKind::NotFound);

        let sn = blockdev_snapshot_delete_internal_sync(&graph, "disk0", None, Some("s1")).unwrap();
        assert_eq!((sn.id.as_str(), sn.name.as_str()), ("1", "s1"));
        let e = blockdev_snapshot_delete_internal_sync(&graph, "disk0", Some("1"), None)
            .unwrap_err();
        assert_eq!(e.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn savevm_loadvm_delvm() {
        let graph = graph_with(&["n1", "n2"]);
        let n1 = graph.find_node("n1").unwrap();
        let n2 = graph.find_node("n2").unwrap();

        let args = SavevmArgs {
            name: Some("snap".to_string()),
            vm_state_size: 1 << 20,
            vm_clock_nsec: 5_000_000_000,
        };
        savevm(&graph, &args).unwrap();
        assert_eq!(snapshot::find(&n1, "snap").unwrap().vm_state_size, 1 << 20);
        assert_eq!(snapshot::find(&n2, "snap").unwrap().vm_state_size, 0);

        // Saving again replaces the snapshot everywhere.
        savevm(&graph, &args).unwrap();
        assert_eq!(snapshot::list(&n1).unwrap().len(), 1);
        assert_eq!(snapshot::list(&n2).unwrap().len(), 1);

        loadvm(&graph, "snap").unwrap();
        let e = loadvm(&graph, "missing").unwrap_err();
        assert_eq!(e.kind(), ErrorKind::NotFound);
        assert!(e.to_string().starts_with("Device 'n1' does not have"));

        let infos = info_snapshots(&graph).unwrap();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].name, "snap");

        delvm(&graph, "snap").unwrap();
        assert!(info_snapshots(&graph).unwrap().is_empty());
        let reply = execute(&graph, Command::InfoSnapshots).unwrap();
        assert_eq!(reply, Value::String("There is no snapshot available.".to_string()));
    }

    #[test]
    fn savevm_generates_names() {
        let graph = graph_with(&["n1"]);
        let sn = savevm(&graph, &SavevmArgs::default()).unwrap();
        assert!(sn.name.starts_with("vm-"));
        assert_eq!(sn.name.len(), "vm-".len() + 14);
        assert_eq!(generated_name(86400 * 365 + 3661), "vm-19710101010101");
    }

    #[test]
    fn loadvm_refuses_disk_only_snapshots() {
        let graph = graph_with(&["n1"]);
        savevm(
            &graph,
            &SavevmArgs {
                name: Some("disk-only".to_string()),
                ..Default::default()
            },
        )
        .unwrap();

        let e = loadvm(&graph, "disk-only").unwrap_err();
        assert_eq!(e.kind(), ErrorKind::InvalidArgument);
        assert!(e.to_string().starts_with("This is a disk-only snapshot"));
    }

    #[test]
    fn configured_vmstate_node() {
        let graph = graph_with(&["n1", "n2"]);
        graph.set_vm_state_node(Some("n2"));

        let args = SavevmArgs {
            name: Some("s".to_string()),
            vm_state_size: 10,
            vm_clock_nsec: 0,
        };
        savevm(&graph, &args).unwrap();
        let n1 = graph.find_node("n1").unwrap();
        let n2 = graph.find_node("n2").unwrap();
        assert_eq!(snapshot::find(&n1, "s").unwrap().vm_state_size, 0);
        assert_eq!(snapshot::find(&n2, "s").unwrap().vm_state_size, 10);

        graph.set_vm_state_node(Some("nope"));
        let e = savevm(&graph, &args).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn transaction_command() {
        let graph = graph_with(&["disk0"]);
        let reply = execute(
            &graph,
            command(
                r#"{"execute": "transaction", "arguments": {"actions": [
                    {"type": "block-dirty-bitmap-add", "data": {"node": "disk0", "name": "b0"}},
                    {"type": "blockdev-snapshot-internal-sync", "data": {"device": "disk0", "name": "s"}}
                ]}}"#,
            ),
        )
        .unwrap();
        assert_eq!(reply, empty());

        let nodes = query_named_block_nodes(&graph);
        assert_eq!(nodes[0].dirty_bitmaps.len(), 1);
        let bs = graph.find_node("disk0").unwrap();
        assert_eq!(snapshot::list(&bs).unwrap().len(), 1);
    }
}
