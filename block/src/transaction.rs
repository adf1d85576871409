// Copyright © 2025 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0

//! All-or-nothing groups of bitmap and snapshot actions.
//!
//! Every action is prepared in order. If one fails, the actions prepared so
//! far are aborted in reverse order, each putting back what it changed.
//! Otherwise they are committed, again in reverse order. Resources held
//! across the transaction, such as drained sections, are released at the
//! very end.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::control::{
    check_bitmap_name, lookup_bs, lookup_root_bs, BitmapAddArgs, BitmapArgs, BitmapMergeArgs,
    InternalSnapshotArgs,
};
use crate::dirty_bitmap::{self, BitSet};
use crate::graph::{BlockGraph, NodeRef};
use crate::io::DrainedSection;
use crate::relay::ReplayMode;
use crate::snapshot::{self, SnapshotInfo};
use crate::{Error, Result};

/// `{"type": "<action>", "data": {...}}`
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum Action {
    BlockDirtyBitmapAdd(BitmapAddArgs),
    BlockDirtyBitmapClear(BitmapArgs),
    BlockDirtyBitmapDisable(BitmapArgs),
    BlockDirtyBitmapEnable(BitmapArgs),
    BlockDirtyBitmapMerge(BitmapMergeArgs),
    BlockDirtyBitmapRemove(BitmapArgs),
    BlockdevSnapshotInternalSync(InternalSnapshotArgs),
}

/// What a prepared action needs to commit or undo itself.
enum Prepared {
    BitmapAdded {
        bs: NodeRef,
        name: String,
    },
    BitmapCleared {
        bs: NodeRef,
        name: String,
        backup: BitSet,
    },
    BitmapToggled {
        bs: NodeRef,
        name: String,
        was_enabled: bool,
    },
    BitmapMerged {
        bs: NodeRef,
        target: String,
        backup: BitSet,
    },
    BitmapRemoved {
        bs: NodeRef,
        name: String,
    },
    SnapshotCreated {
        bs: NodeRef,
        sn: SnapshotInfo,
        _drained: DrainedSection,
    },
}

impl Prepared {
    fn node(&self) -> &NodeRef {
        match self {
            Prepared::BitmapAdded { bs, .. }
            | Prepared::BitmapCleared { bs, .. }
            | Prepared::BitmapToggled { bs, .. }
            | Prepared::BitmapMerged { bs, .. }
            | Prepared::BitmapRemoved { bs, .. }
            | Prepared::SnapshotCreated { bs, .. } => bs,
        }
    }

    fn commit(&self) {
        let bs = self.node();
        let _ctx = bs.context().acquire();

        if let Prepared::BitmapRemoved { bs, name } = self {
            let ret = dirty_bitmap::set_flags(bs, name, false, true)
                .and_then(|_| dirty_bitmap::release(bs, name));
            if let Err(e) = ret {
                error!("Failed to release bitmap '{}' of '{}': {}", name, bs.name(), e);
            }
        }
    }

    fn abort(self) {
        let bs = Arc::clone(self.node());
        let _ctx = bs.context().acquire();

        let ret = match self {
            Prepared::BitmapAdded { bs, name } => dirty_bitmap::release(&bs, &name),
            Prepared::BitmapCleared { bs, name, backup } => {
                dirty_bitmap::restore(&bs, &name, backup)
            }
            Prepared::BitmapToggled {
                bs,
                name,
                was_enabled,
            } => dirty_bitmap::set_enabled(&bs, &name, was_enabled).map(drop),
            Prepared::BitmapMerged { bs, target, backup } => {
                dirty_bitmap::restore(&bs, &target, backup)
            }
            Prepared::BitmapRemoved { bs, name } => {
                dirty_bitmap::set_flags(&bs, &name, false, false)
            }
            Prepared::SnapshotCreated { bs, sn, _drained } => {
                snapshot::delete(&bs, Some(&sn.id), Some(&sn.name))
            }
        };

        if let Err(e) = ret {
            error!("Failed to undo action on '{}': {}", bs.name(), e);
        }
    }
}

fn prepare_snapshot(graph: &BlockGraph, args: &InternalSnapshotArgs) -> Result<Prepared> {
    let bs = lookup_root_bs(graph, &args.device)?;
    let _ctx = bs.context().acquire();
    let drained = DrainedSection::begin(&bs);
    let device = args.device.as_str();

    if bs.is_read_only() {
        return Err(Error::ReadOnly(format!("Device '{device}' is read only")));
    }
    if !snapshot::can_snapshot(&bs) {
        return Err(Error::NotSupported(format!(
            "Block format '{}' used by device '{}' does not support internal snapshots",
            bs.format_name().unwrap_or_default(),
            device
        )));
    }
    if args.name.is_empty() {
        return Err(Error::InvalidArgument("Name is empty".to_string()));
    }
    if snapshot::find_by_id_and_name(&bs, None, Some(&args.name))?.is_some() {
        return Err(Error::AlreadyExists(format!(
            "Snapshot with name '{}' already exists on device '{}'",
            args.name, device
        )));
    }

    let mut sn = SnapshotInfo::stamped(&args.name, 0);
    if graph.relay().mode() == ReplayMode::Replay {
        sn.icount = Some(graph.relay().released_count());
    }

    let sn = snapshot::create(&bs, &sn).map_err(|e| {
        e.prefixed(&format!(
            "Failed to create snapshot '{}' on device '{}'",
            args.name, device
        ))
    })?;

    Ok(Prepared::SnapshotCreated {
        bs: Arc::clone(&bs),
        sn,
        _drained: drained,
    })
}

fn prepare(graph: &BlockGraph, action: &Action) -> Result<Prepared> {
    let bitmap_node = |node: &str, name: &str| -> Result<NodeRef> {
        check_bitmap_name(name)?;
        lookup_bs(graph, node)
    };

    match action {
        Action::BlockDirtyBitmapAdd(args) => {
            let bs = bitmap_node(&args.node, &args.name)?;
            let _ctx = bs.context().acquire();
            dirty_bitmap::add(
                &bs,
                &args.name,
                args.granularity,
                args.persistent,
                args.disabled,
            )?;
            Ok(Prepared::BitmapAdded {
                bs: Arc::clone(&bs),
                name: args.name.clone(),
            })
        }
        Action::BlockDirtyBitmapClear(args) => {
            let bs = bitmap_node(&args.node, &args.name)?;
            let _ctx = bs.context().acquire();
            let backup = dirty_bitmap::clear(&bs, &args.name)?;
            Ok(Prepared::BitmapCleared {
                bs: Arc::clone(&bs),
                name: args.name.clone(),
                backup,
            })
        }
        Action::BlockDirtyBitmapDisable(args) | Action::BlockDirtyBitmapEnable(args) => {
            let enable = matches!(action, Action::BlockDirtyBitmapEnable(_));
            let bs = bitmap_node(&args.node, &args.name)?;
            let _ctx = bs.context().acquire();
            let was_enabled = dirty_bitmap::set_enabled(&bs, &args.name, enable)?;
            Ok(Prepared::BitmapToggled {
                bs: Arc::clone(&bs),
                name: args.name.clone(),
                was_enabled,
            })
        }
        Action::BlockDirtyBitmapMerge(args) => {
            let bs = bitmap_node(&args.node, &args.target)?;
            let backup = dirty_bitmap::merge(graph, &bs, &args.target, &args.bitmaps, true)?
                .unwrap_or_default();
            Ok(Prepared::BitmapMerged {
                bs: Arc::clone(&bs),
                target: args.target.clone(),
                backup,
            })
        }
        Action::BlockDirtyBitmapRemove(args) => {
            let bs = bitmap_node(&args.node, &args.name)?;
            let _ctx = bs.context().acquire();
            dirty_bitmap::remove(&bs, &args.name, false)?;
            dirty_bitmap::set_flags(&bs, &args.name, true, true)?;
            Ok(Prepared::BitmapRemoved {
                bs: Arc::clone(&bs),
                name: args.name.clone(),
            })
        }
        Action::BlockdevSnapshotInternalSync(args) => prepare_snapshot(graph, args),
    }
}

/// Runs `actions` as one unit.
pub fn run(graph: &BlockGraph, actions: &[Action]) -> Result<()> {
    let mut prepared: Vec<Prepared> = Vec::with_capacity(actions.len());

    for action in actions {
        match prepare(graph, action) {
            Ok(state) => prepared.push(state),
            Err(e) => {
                warn!(
                    "Aborting transaction of {} actions: {}",
                    actions.len(),
                    e
                );
                for state in prepared.into_iter().rev() {
                    state.abort();
                }
                return Err(e);
            }
        }
    }

    for state in prepared.iter().rev() {
        state.commit();
    }
    debug!("Committed transaction of {} actions", actions.len());

    Ok(())
}
