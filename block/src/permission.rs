// Copyright © 2025 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0

//! Permissions requested and shared on graph edges.
//!
//! Every edge carries the permissions its parent needs on the child and the
//! permissions the parent tolerates other users of the child taking. Any
//! change to the graph is first planned over the whole affected subgraph and
//! only committed when no edge conflicts with its siblings.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::graph::{ChildEdge, Node, NodeRef};
use crate::{Error, Result};

bitflags! {
    /// Permissions an edge takes on, or shares for, its child.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct Permissions: u32 {
        /// Reads return data consistent with what was last written.
        const CONSISTENT_READ = 1 << 0;
        /// Guest-visible data may change.
        const WRITE = 1 << 1;
        /// Writes that don't change guest-visible data.
        const WRITE_UNCHANGED = 1 << 2;
        /// The image may be resized.
        const RESIZE = 1 << 3;
    }
}

bitflags! {
    /// What a child represents for its parent.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct ChildRole: u32 {
        /// Guest data lives in this child.
        const DATA = 1 << 0;
        /// Format metadata lives in this child.
        const METADATA = 1 << 1;
        /// The parent is a filter and this is the filtered child.
        const FILTERED = 1 << 2;
        /// Backing file of a copy-on-write image.
        const COW = 1 << 3;
        /// The child the parent forwards to by default.
        const PRIMARY = 1 << 4;
    }
}

/// Permissions a filter passes through from its parent to its child.
pub const PERM_PASSTHROUGH: Permissions = Permissions::all();

impl Permissions {
    /// Human readable list of the permission names.
    pub fn names(self) -> String {
        let names: Vec<&str> = self
            .iter()
            .map(|p| PermissionName::from_flag(p).as_str())
            .collect();
        names.join(", ")
    }
}

/// Named permission as it appears in configuration and error messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PermissionName {
    ConsistentRead,
    Write,
    WriteUnchanged,
    Resize,
}

impl PermissionName {
    fn from_flag(flag: Permissions) -> Self {
        if flag == Permissions::WRITE {
            PermissionName::Write
        } else if flag == Permissions::WRITE_UNCHANGED {
            PermissionName::WriteUnchanged
        } else if flag == Permissions::RESIZE {
            PermissionName::Resize
        } else {
            PermissionName::ConsistentRead
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PermissionName::ConsistentRead => "consistent read",
            PermissionName::Write => "write",
            PermissionName::WriteUnchanged => "write unchanged",
            PermissionName::Resize => "resize",
        }
    }

    pub fn flag(self) -> Permissions {
        match self {
            PermissionName::ConsistentRead => Permissions::CONSISTENT_READ,
            PermissionName::Write => Permissions::WRITE,
            PermissionName::WriteUnchanged => Permissions::WRITE_UNCHANGED,
            PermissionName::Resize => Permissions::RESIZE,
        }
    }
}

impl fmt::Display for PermissionName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Folds a list of permission names into a set.
pub fn from_names(names: &[PermissionName]) -> Permissions {
    names
        .iter()
        .fold(Permissions::empty(), |acc, name| acc | name.flag())
}

/// A pure pass-through filter asks its child for exactly what its own
/// parents ask for.
pub fn filter_default_perms(
    perm: Permissions,
    shared: Permissions,
) -> (Permissions, Permissions) {
    (
        perm & PERM_PASSTHROUGH,
        (shared & PERM_PASSTHROUGH) | (Permissions::all() - PERM_PASSTHROUGH),
    )
}

/// Backing files are only read, and tolerate others writing to them only if
/// the parent's users do.
pub fn cow_default_perms(perm: Permissions, shared: Permissions) -> (Permissions, Permissions) {
    let nperm = if perm.is_empty() {
        Permissions::empty()
    } else {
        Permissions::CONSISTENT_READ
    };

    let mut nshared = Permissions::CONSISTENT_READ | Permissions::WRITE_UNCHANGED;
    if shared.contains(Permissions::WRITE) {
        nshared |= Permissions::WRITE | Permissions::RESIZE;
    }

    (nperm, nshared)
}

/// Data and metadata children need to be readable, and writable as soon as
/// the parent node itself is.
pub fn storage_default_perms(
    writable: bool,
    perm: Permissions,
    shared: Permissions,
) -> (Permissions, Permissions) {
    let mut nperm = Permissions::CONSISTENT_READ;
    if writable {
        nperm |= perm & (Permissions::WRITE | Permissions::RESIZE);
        nperm |= Permissions::WRITE;
    }

    let nshared = (shared & (Permissions::WRITE | Permissions::RESIZE))
        | Permissions::CONSISTENT_READ
        | Permissions::WRITE_UNCHANGED;

    (nperm, nshared)
}

/// Default permission policy, selected by the role of the edge.
pub fn default_perms(
    bs: &Node,
    role: ChildRole,
    perm: Permissions,
    shared: Permissions,
) -> (Permissions, Permissions) {
    if role.contains(ChildRole::FILTERED) {
        filter_default_perms(perm, shared)
    } else if role.contains(ChildRole::COW) {
        cow_default_perms(perm, shared)
    } else if role.intersects(ChildRole::DATA | ChildRole::METADATA) {
        storage_default_perms(!bs.is_read_only() && !bs.is_inactive(), perm, shared)
    } else {
        (Permissions::empty(), Permissions::all())
    }
}

/// Bits of `perm` the other user doesn't share, or bits it takes that the
/// new user doesn't share.
fn conflicting(
    (perm, shared): (Permissions, Permissions),
    (other_perm, other_shared): (Permissions, Permissions),
) -> Permissions {
    (perm - other_shared) | (other_perm - shared)
}

/// Tentative permission state for a pending graph change.
///
/// Edges are looked up by address; `added` and `removed` describe the edge
/// being attached or detached, which isn't visible in the node lists yet (or
/// anymore).
pub(crate) struct PermissionPlan {
    pending: HashMap<*const ChildEdge, (Permissions, Permissions)>,
    order: Vec<Arc<ChildEdge>>,
    added: Option<Arc<ChildEdge>>,
    removed: Option<Arc<ChildEdge>>,
}

impl PermissionPlan {
    pub(crate) fn new(added: Option<Arc<ChildEdge>>, removed: Option<Arc<ChildEdge>>) -> Self {
        PermissionPlan {
            pending: HashMap::new(),
            order: Vec::new(),
            added,
            removed,
        }
    }

    fn edge_perms(&self, edge: &Arc<ChildEdge>) -> (Permissions, Permissions) {
        self.pending
            .get(&Arc::as_ptr(edge))
            .copied()
            .unwrap_or_else(|| (edge.perm(), edge.shared_perm()))
    }

    fn is_removed(&self, edge: &Arc<ChildEdge>) -> bool {
        self.removed
            .as_ref()
            .is_some_and(|removed| Arc::ptr_eq(removed, edge))
    }

    fn incoming(&self, node: &NodeRef) -> Vec<Arc<ChildEdge>> {
        let mut edges: Vec<Arc<ChildEdge>> = node
            .parents()
            .into_iter()
            .filter(|edge| !self.is_removed(edge))
            .collect();
        if let Some(added) = &self.added {
            if Arc::ptr_eq(added.child(), node) && !edges.iter().any(|e| Arc::ptr_eq(e, added)) {
                edges.push(Arc::clone(added));
            }
        }
        edges
    }

    fn outgoing(&self, node: &NodeRef) -> Vec<Arc<ChildEdge>> {
        let mut edges: Vec<Arc<ChildEdge>> = node
            .children()
            .into_iter()
            .filter(|edge| !self.is_removed(edge))
            .collect();
        if let Some(added) = &self.added {
            let owned_by_node = added
                .parent_node()
                .is_some_and(|parent| Arc::ptr_eq(&parent, node));
            if owned_by_node && !edges.iter().any(|e| Arc::ptr_eq(e, added)) {
                edges.push(Arc::clone(added));
            }
        }
        edges
    }

    /// Union of everything the parents of `node` take, intersection of
    /// everything they share.
    pub(crate) fn cumulative(&self, node: &NodeRef) -> (Permissions, Permissions) {
        self.incoming(node)
            .iter()
            .fold((Permissions::empty(), Permissions::all()), |(p, s), edge| {
                let (ep, es) = self.edge_perms(edge);
                (p | ep, s & es)
            })
    }

    /// Requests new permissions for `edge` and propagates the consequences
    /// down to the leaves.
    pub(crate) fn update_edge(
        &mut self,
        edge: &Arc<ChildEdge>,
        perm: Permissions,
        shared: Permissions,
    ) -> Result<()> {
        let child = edge.child();

        if perm.intersects(Permissions::WRITE | Permissions::WRITE_UNCHANGED) && child.is_read_only()
        {
            return Err(Error::ReadOnly(format!(
                "Block node '{}' is read-only",
                child.name()
            )));
        }

        for other in self.incoming(child) {
            if Arc::ptr_eq(&other, edge) {
                continue;
            }
            let bad = conflicting((perm, shared), self.edge_perms(&other));
            if !bad.is_empty() {
                return Err(Error::PermissionConflict(format!(
                    "Conflicts with use by {} as '{}', which does not allow '{}' on {}",
                    other.parent_name(),
                    other.name(),
                    bad.names(),
                    child.name()
                )));
            }
        }

        let unchanged = self.edge_perms(edge) == (perm, shared)
            && self.pending.contains_key(&Arc::as_ptr(edge));
        self.pending.insert(Arc::as_ptr(edge), (perm, shared));
        if !self.order.iter().any(|e| Arc::ptr_eq(e, edge)) {
            self.order.push(Arc::clone(edge));
        }
        if unchanged {
            return Ok(());
        }

        self.refresh_node(child)
    }

    /// Recomputes what `node` needs from each of its children.
    pub(crate) fn refresh_node(&mut self, node: &NodeRef) -> Result<()> {
        let (perm, shared) = self.cumulative(node);
        let driver = node.driver();

        for edge in self.outgoing(node) {
            let (nperm, nshared) = match &driver {
                Some(driver) => driver.child_perm(node, edge.role(), perm, shared),
                None => (Permissions::empty(), Permissions::all()),
            };
            if self.pending.contains_key(&Arc::as_ptr(&edge))
                && self.edge_perms(&edge) == (nperm, nshared)
            {
                continue;
            }
            self.update_edge(&edge, nperm, nshared)?;
        }

        Ok(())
    }

    /// Applies every planned edge update.
    pub(crate) fn commit(self) {
        for edge in self.order.iter() {
            if let Some(&(perm, shared)) = self.pending.get(&Arc::as_ptr(edge)) {
                edge.set_perms(perm, shared);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_passes_parent_perms_through() {
        let perm = Permissions::CONSISTENT_READ | Permissions::WRITE;
        let shared = Permissions::CONSISTENT_READ;
        let (nperm, nshared) = filter_default_perms(perm, shared);
        assert_eq!(nperm, perm);
        assert_eq!(nshared, shared);
    }

    #[test]
    fn cow_child_is_read_only() {
        let (nperm, nshared) = cow_default_perms(
            Permissions::CONSISTENT_READ | Permissions::WRITE,
            Permissions::empty(),
        );
        assert_eq!(nperm, Permissions::CONSISTENT_READ);
        assert!(!nshared.contains(Permissions::WRITE));

        let (nperm, _) = cow_default_perms(Permissions::empty(), Permissions::all());
        assert!(nperm.is_empty());
    }

    #[test]
    fn storage_child_writable_only_with_writable_parent() {
        let (nperm, _) = storage_default_perms(false, Permissions::all(), Permissions::all());
        assert_eq!(nperm, Permissions::CONSISTENT_READ);
        let (nperm, _) = storage_default_perms(true, Permissions::empty(), Permissions::all());
        assert!(nperm.contains(Permissions::WRITE));
    }

    #[test]
    fn conflicting_bits() {
        let writer = (
            Permissions::CONSISTENT_READ | Permissions::WRITE,
            Permissions::CONSISTENT_READ,
        );
        let reader = (Permissions::CONSISTENT_READ, Permissions::all());
        assert!(conflicting(writer, reader).is_empty());

        let exclusive_reader = (Permissions::CONSISTENT_READ, Permissions::CONSISTENT_READ);
        assert_eq!(conflicting(writer, exclusive_reader), Permissions::WRITE);
    }

    #[test]
    fn names_are_readable() {
        assert_eq!(
            (Permissions::CONSISTENT_READ | Permissions::WRITE).names(),
            "consistent read, write"
        );
        assert_eq!(
            from_names(&[PermissionName::Write, PermissionName::Resize]),
            Permissions::WRITE | Permissions::RESIZE
        );
    }
}
