// Copyright © 2025 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{BitSet, BitmapCheck, BitmapInfo, DirtyBitmap, MAX_NAME_LEN, MIN_GRANULARITY};
use crate::events::BlockEvent;
use crate::graph::{BlockGraph, NodeRef};
use crate::{Error, Result};

const DEFAULT_GRANULARITY: u32 = 64 * 1024;
const MIN_DEFAULT_GRANULARITY: u32 = 4096;

/// A merge source: a bitmap of the target's node, or of any other node.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum MergeSource {
    Local(String),
    External { node: String, name: String },
}

fn not_found(name: &str) -> Error {
    Error::NotFound(format!("Dirty bitmap '{name}' not found"))
}

/// Runs `f` on bitmap `name` of `bs` with the node state locked.
fn with_bitmap<R>(
    bs: &NodeRef,
    name: &str,
    f: impl FnOnce(&mut DirtyBitmap) -> Result<R>,
) -> Result<R> {
    let mut state = bs.state();
    let bitmap = state
        .bitmaps
        .iter_mut()
        .find(|b| b.name() == Some(name))
        .ok_or_else(|| not_found(name))?;
    f(bitmap)
}

/// Cluster size clamped to [4 KiB, 64 KiB], or 64 KiB if unknown.
pub fn default_granularity(bs: &NodeRef) -> u32 {
    match bs.get_info() {
        Ok(info) => match info.cluster_size {
            Some(cluster_size) if cluster_size > 0 => {
                cluster_size.clamp(MIN_DEFAULT_GRANULARITY, DEFAULT_GRANULARITY)
            }
            _ => DEFAULT_GRANULARITY,
        },
        Err(_) => DEFAULT_GRANULARITY,
    }
}

/// Creates a dirty bitmap on `bs`.
///
/// Persistent bitmaps are only created once the driver confirmed it can
/// store them.
pub fn add(
    bs: &NodeRef,
    name: &str,
    granularity: Option<u32>,
    persistent: bool,
    disabled: bool,
) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidArgument(
            "Bitmap name cannot be empty".to_string(),
        ));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(Error::InvalidArgument(format!(
            "Bitmap name too long: {name}"
        )));
    }

    let granularity = match granularity {
        Some(g) if g < MIN_GRANULARITY || !g.is_power_of_two() => {
            return Err(Error::InvalidArgument(
                "Granularity must be power of 2 and at least 512".to_string(),
            ));
        }
        Some(g) => g,
        None => default_granularity(bs),
    };

    if bs.state().bitmaps.iter().any(|b| b.name() == Some(name)) {
        return Err(Error::AlreadyExists(format!(
            "Bitmap already exists: {name}"
        )));
    }

    if persistent {
        let driver = bs.driver().ok_or_else(|| {
            Error::NotSupported(format!("Can't store persistent bitmaps to {}", bs.name()))
        })?;
        driver.can_store_new_dirty_bitmap(bs, name, granularity)?;
    }

    let size = bs.get_length()?;
    let mut bitmap = DirtyBitmap::new(Some(name), granularity, size);
    bitmap.set_enabled(!disabled);
    bitmap.set_persistent(persistent);

    {
        let mut state = bs.state();
        if state.bitmaps.iter().any(|b| b.name() == Some(name)) {
            return Err(Error::AlreadyExists(format!(
                "Bitmap already exists: {name}"
            )));
        }
        state.bitmaps.push(bitmap);
    }

    debug!(
        "Added bitmap '{}' to '{}' (granularity {}, persistent {})",
        name,
        bs.name(),
        granularity,
        persistent
    );
    bs.events.emit(BlockEvent::BitmapAdded {
        node: bs.name().to_string(),
        name: name.to_string(),
        granularity,
        persistent,
    });

    Ok(())
}

/// Removes bitmap `name` from `bs`, deleting its stored copy first.
///
/// With `release` the bitmap is freed. Otherwise it stays on the node, is
/// no longer stored on close, and a copy is returned.
pub fn remove(bs: &NodeRef, name: &str, release: bool) -> Result<Option<DirtyBitmap>> {
    let persistent = with_bitmap(bs, name, |bitmap| {
        bitmap.check(BitmapCheck::BUSY | BitmapCheck::READ_ONLY)?;
        Ok(bitmap.is_persistent())
    })?;

    if persistent {
        if let Some(driver) = bs.driver() {
            driver.remove_persistent_dirty_bitmap(bs, name)?;
        }
    }

    if release {
        self::release(bs, name)?;
        return Ok(None);
    }

    with_bitmap(bs, name, |bitmap| {
        bitmap.set_skip_store(true);
        Ok(Some(bitmap.clone()))
    })
}

/// Frees bitmap `name` without touching any stored copy.
pub(crate) fn release(bs: &NodeRef, name: &str) -> Result<()> {
    {
        let mut state = bs.state();
        let index = state
            .bitmaps
            .iter()
            .position(|b| b.name() == Some(name))
            .ok_or_else(|| not_found(name))?;
        state.bitmaps.remove(index);
    }

    debug!("Released bitmap '{}' of '{}'", name, bs.name());
    bs.events.emit(BlockEvent::BitmapRemoved {
        node: bs.name().to_string(),
        name: name.to_string(),
    });
    Ok(())
}

/// Clears bitmap `name` and returns its previous contents.
pub fn clear(bs: &NodeRef, name: &str) -> Result<BitSet> {
    with_bitmap(bs, name, |bitmap| {
        bitmap.check(BitmapCheck::DEFAULT)?;
        Ok(bitmap.clear())
    })
}

/// Puts back contents saved by [`clear`] or [`merge`].
pub fn restore(bs: &NodeRef, name: &str, backup: BitSet) -> Result<()> {
    with_bitmap(bs, name, |bitmap| {
        bitmap.restore(backup);
        Ok(())
    })
}

/// Changes whether bitmap `name` records writes and returns whether it did
/// before.
pub(crate) fn set_enabled(bs: &NodeRef, name: &str, enabled: bool) -> Result<bool> {
    with_bitmap(bs, name, |bitmap| {
        bitmap.check(BitmapCheck::ALLOW_RO)?;
        let was_enabled = bitmap.is_enabled();
        bitmap.set_enabled(enabled);
        Ok(was_enabled)
    })
}

pub fn enable(bs: &NodeRef, name: &str) -> Result<()> {
    set_enabled(bs, name, true).map(|_| ())
}

pub fn disable(bs: &NodeRef, name: &str) -> Result<()> {
    set_enabled(bs, name, false).map(|_| ())
}

/// Sets the busy and skip-store state of bitmap `name`.
pub(crate) fn set_flags(bs: &NodeRef, name: &str, busy: bool, skip_store: bool) -> Result<()> {
    with_bitmap(bs, name, |bitmap| {
        bitmap.set_busy(busy);
        bitmap.set_skip_store(skip_store);
        Ok(())
    })
}

/// Folds one source into `scratch`, holding only the context of the node
/// the source lives on.
fn fold_source(
    graph: &BlockGraph,
    bs: &NodeRef,
    scratch: &mut DirtyBitmap,
    source: &MergeSource,
) -> Result<()> {
    let (node, name) = match source {
        MergeSource::Local(name) => (Arc::clone(bs), name.as_str()),
        MergeSource::External { node, name } => (graph.lookup(node)?, name.as_str()),
    };

    let _ctx = node.context().acquire();
    with_bitmap(&node, name, |src| {
        src.check(BitmapCheck::ALLOW_RO)?;
        scratch.merge_from(src)
    })
}

/// Merges every source into bitmap `target` of `bs`.
///
/// The sources are folded into a scratch bitmap first, so `target` is left
/// untouched when any of them can't be merged. If `want_backup` is set, the
/// previous contents of `target` are returned.
///
/// Node contexts are taken here, one at a time, so the caller must not hold
/// any of them.
pub fn merge(
    graph: &BlockGraph,
    bs: &NodeRef,
    target: &str,
    sources: &[MergeSource],
    want_backup: bool,
) -> Result<Option<BitSet>> {
    let (granularity, size) = {
        let _ctx = bs.context().acquire();
        with_bitmap(bs, target, |dst| Ok((dst.granularity(), dst.size())))?
    };
    let mut scratch = DirtyBitmap::new(None, granularity, size);

    for source in sources {
        if let Err(e) = fold_source(graph, bs, &mut scratch, source) {
            debug!("Not merging into '{target}': {e}");
            return Err(e);
        }
    }

    let _ctx = bs.context().acquire();
    let backup = with_bitmap(bs, target, |dst| {
        dst.check(BitmapCheck::DEFAULT)?;
        let backup = want_backup.then(|| dst.bits().clone());
        dst.merge_from(&scratch)?;
        Ok(backup)
    })?;

    bs.events.emit(BlockEvent::BitmapMerged {
        node: bs.name().to_string(),
        target: target.to_string(),
        sources: sources.len(),
    });

    Ok(backup)
}

pub fn query(bs: &NodeRef) -> Vec<BitmapInfo> {
    bs.state().bitmaps.iter().map(BitmapInfo::from).collect()
}

/// Hands the persistent bitmaps of `bs` to its driver, as done on close.
pub(crate) fn store_persistent(bs: &NodeRef) {
    let Some(driver) = bs.driver() else {
        return;
    };

    let bitmaps: Vec<DirtyBitmap> = bs
        .state()
        .bitmaps
        .iter()
        .filter(|b| b.is_persistent() && !b.skip_store() && !b.is_inconsistent())
        .cloned()
        .collect();

    for bitmap in bitmaps.iter() {
        if let Err(e) = driver.store_persistent_dirty_bitmap(bs, bitmap) {
            warn!(
                "Failed to store bitmap '{}' of '{}': {}",
                bitmap.name().unwrap_or_default(),
                bs.name(),
                e
            );
        }
    }
}
