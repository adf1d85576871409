// Copyright © 2020 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0

//! Node registry, child edges and execution contexts.
//!
//! Parents own their children through [`ChildEdge`]s; children only keep weak
//! references to the edges pointing at them. The [`BlockGraph`] keeps every
//! opened node alive in registration order, which is also the order group
//! operations visit nodes in.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::dirty_bitmap::DirtyBitmap;
use crate::driver::{BlockDriver, OpenOptions, RequestFlags};
use crate::events::{BlockEvent, EventMonitor};
use crate::io::IoTracker;
use crate::permission::{ChildRole, PermissionPlan, Permissions};
use crate::relay::{EventRelay, ReplayMode};
use crate::{Error, Result};

pub type NodeRef = Arc<Node>;

pub const MAIN_CONTEXT: &str = "main";

/// Serialisation domain a node runs in.
///
/// Operations touching several nodes take each node's context in turn and
/// never hold two at once.
pub struct AioContext {
    name: String,
    lock: Mutex<()>,
}

impl AioContext {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(AioContext {
            name: name.to_string(),
            lock: Mutex::new(()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn acquire(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap()
    }
}

/// Who owns an edge: another node, or a guest device by its id.
#[derive(Debug)]
pub enum EdgeParent {
    Node(Weak<Node>),
    Root(String),
}

#[derive(Debug)]
pub struct ChildEdge {
    name: String,
    role: ChildRole,
    parent: EdgeParent,
    child: NodeRef,
    perms: Mutex<(Permissions, Permissions)>,
}

impl ChildEdge {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> ChildRole {
        self.role
    }

    pub fn child(&self) -> &NodeRef {
        &self.child
    }

    pub fn parent_node(&self) -> Option<NodeRef> {
        match &self.parent {
            EdgeParent::Node(parent) => parent.upgrade(),
            EdgeParent::Root(_) => None,
        }
    }

    pub fn parent_name(&self) -> String {
        match &self.parent {
            EdgeParent::Node(parent) => parent
                .upgrade()
                .map(|p| format!("node '{}'", p.name()))
                .unwrap_or_else(|| "a closed node".to_string()),
            EdgeParent::Root(id) => format!("device '{id}'"),
        }
    }

    pub fn perm(&self) -> Permissions {
        self.perms.lock().unwrap().0
    }

    pub fn shared_perm(&self) -> Permissions {
        self.perms.lock().unwrap().1
    }

    pub(crate) fn set_perms(&self, perm: Permissions, shared: Permissions) {
        *self.perms.lock().unwrap() = (perm, shared);
    }
}

pub(crate) struct NodeState {
    pub(crate) driver: Option<Arc<dyn BlockDriver>>,
    pub(crate) options: OpenOptions,
    pub(crate) children: Vec<Arc<ChildEdge>>,
    pub(crate) parents: Vec<Weak<ChildEdge>>,
    pub(crate) read_only: bool,
    pub(crate) inactive: bool,
    pub(crate) supported_write_flags: RequestFlags,
    pub(crate) supported_zero_flags: RequestFlags,
    pub(crate) bitmaps: Vec<DirtyBitmap>,
}

pub struct Node {
    name: String,
    ctx: Arc<AioContext>,
    state: Mutex<NodeState>,
    pub(crate) io: IoTracker,
    pub(crate) events: EventMonitor,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Node").field("name", &self.name).finish()
    }
}

impl Node {
    fn new(name: &str, ctx: Arc<AioContext>, read_only: bool, events: EventMonitor) -> Self {
        Node {
            name: name.to_string(),
            ctx,
            state: Mutex::new(NodeState {
                driver: None,
                options: OpenOptions::default(),
                children: Vec::new(),
                parents: Vec::new(),
                read_only,
                inactive: false,
                supported_write_flags: RequestFlags::empty(),
                supported_zero_flags: RequestFlags::empty(),
                bitmaps: Vec::new(),
            }),
            io: IoTracker::new(),
            events,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn context(&self) -> &Arc<AioContext> {
        &self.ctx
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, NodeState> {
        self.state.lock().unwrap()
    }

    pub fn driver(&self) -> Option<Arc<dyn BlockDriver>> {
        self.state().driver.clone()
    }

    pub fn format_name(&self) -> Option<String> {
        self.driver().map(|d| d.format_name().to_string())
    }

    pub(crate) fn set_driver(&self, driver: Arc<dyn BlockDriver>, options: OpenOptions) {
        let mut state = self.state();
        state.driver = Some(driver);
        state.options = options;
    }

    /// Leaves the node without a driver, e.g. after a failed reopen.
    pub(crate) fn clear_driver(&self) {
        self.state().driver = None;
    }

    pub fn options(&self) -> OpenOptions {
        self.state().options.clone()
    }

    pub fn is_read_only(&self) -> bool {
        self.state().read_only
    }

    pub fn is_inactive(&self) -> bool {
        self.state().inactive
    }

    pub fn supported_write_flags(&self) -> RequestFlags {
        self.state().supported_write_flags
    }

    pub fn supported_zero_flags(&self) -> RequestFlags {
        self.state().supported_zero_flags
    }

    /// Called by drivers while opening to advertise native request flags.
    pub fn set_supported_flags(&self, write: RequestFlags, zero: RequestFlags) {
        let mut state = self.state();
        state.supported_write_flags = write;
        state.supported_zero_flags = zero;
    }

    pub fn children(&self) -> Vec<Arc<ChildEdge>> {
        self.state().children.clone()
    }

    pub fn parents(&self) -> Vec<Arc<ChildEdge>> {
        self.state()
            .parents
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    /// Whether any other node, as opposed to a device, uses this node.
    pub fn has_node_parent(&self) -> bool {
        self.parents()
            .iter()
            .any(|edge| matches!(edge.parent, EdgeParent::Node(_)))
    }

    pub fn child_by_role(&self, role: ChildRole) -> Option<NodeRef> {
        self.state()
            .children
            .iter()
            .find(|edge| edge.role.contains(role))
            .map(|edge| Arc::clone(&edge.child))
    }

    pub fn primary_child(&self) -> Option<NodeRef> {
        self.child_by_role(ChildRole::PRIMARY)
    }

    pub fn filtered_child(&self) -> Option<NodeRef> {
        if self.driver().is_some_and(|d| d.is_filter()) {
            self.child_by_role(ChildRole::FILTERED)
        } else {
            None
        }
    }

    pub fn backing_child(&self) -> Option<NodeRef> {
        self.child_by_role(ChildRole::COW)
    }

    /// The child snapshot requests fall back to when the driver doesn't
    /// handle them: the primary child, provided it holds data or is filtered
    /// and no other child does.
    pub fn snapshot_fallback(&self) -> Option<NodeRef> {
        let state = self.state();
        let data_or_filtered = ChildRole::DATA | ChildRole::FILTERED;

        let mut fallback = None;
        for edge in state.children.iter() {
            if edge.role.contains(ChildRole::PRIMARY) {
                if !edge.role.intersects(data_or_filtered) {
                    return None;
                }
                fallback = Some(Arc::clone(&edge.child));
            } else if edge.role.intersects(data_or_filtered) {
                return None;
            }
        }

        fallback
    }

    pub(crate) fn edge_to(&self, child: &NodeRef) -> Option<Arc<ChildEdge>> {
        self.state()
            .children
            .iter()
            .find(|edge| Arc::ptr_eq(&edge.child, child))
            .cloned()
    }

    fn descendants_contain(&self, target: &Node) -> bool {
        self.children().iter().any(|edge| {
            std::ptr::eq(Arc::as_ptr(&edge.child), target) || edge.child.descendants_contain(target)
        })
    }

    /// Attaches `child` with the permissions this node's driver asks for
    /// `role`. Nothing changes anywhere if the request conflicts.
    pub fn attach_child(
        self: &Arc<Self>,
        child: &NodeRef,
        name: &str,
        role: ChildRole,
    ) -> Result<Arc<ChildEdge>> {
        if Arc::ptr_eq(self, child) || child.descendants_contain(self) {
            return Err(Error::InvalidArgument(format!(
                "Making '{}' a child of '{}' would create a cycle",
                child.name, self.name
            )));
        }

        let edge = Arc::new(ChildEdge {
            name: name.to_string(),
            role,
            parent: EdgeParent::Node(Arc::downgrade(self)),
            child: Arc::clone(child),
            perms: Mutex::new((Permissions::empty(), Permissions::all())),
        });

        let mut plan = PermissionPlan::new(Some(Arc::clone(&edge)), None);
        let (perm, shared) = plan.cumulative(self);
        let (perm, shared) = match self.driver() {
            Some(driver) => driver.child_perm(self, role, perm, shared),
            None => (Permissions::empty(), Permissions::all()),
        };
        plan.update_edge(&edge, perm, shared)?;

        self.state().children.push(Arc::clone(&edge));
        child.state().parents.push(Arc::downgrade(&edge));
        plan.commit();

        debug!(
            "Attached '{}' to '{}' as '{}' ({:?})",
            child.name, self.name, name, role
        );

        Ok(edge)
    }

    pub fn detach_child(&self, edge: &Arc<ChildEdge>) {
        detach_edge(edge);
        self.state().children.retain(|e| !Arc::ptr_eq(e, edge));
        debug!("Detached '{}' from '{}'", edge.child.name, self.name);
    }

    pub(crate) fn detach_all_children(&self) {
        for edge in self.children() {
            self.detach_child(&edge);
        }
    }

    /// Moves the node in or out of the inactive state and recomputes the
    /// permissions it takes on its children.
    pub fn set_inactive(self: &Arc<Self>, inactive: bool) -> Result<()> {
        let previous = std::mem::replace(&mut self.state().inactive, inactive);
        if previous == inactive {
            return Ok(());
        }

        let mut plan = PermissionPlan::new(None, None);
        if let Err(e) = plan.refresh_node(self) {
            self.state().inactive = previous;
            return Err(e);
        }
        plan.commit();

        Ok(())
    }
}

/// Unlinks `edge` from its child and relaxes the permissions below it.
fn detach_edge(edge: &Arc<ChildEdge>) {
    let child = &edge.child;
    let mut plan = PermissionPlan::new(None, Some(Arc::clone(edge)));
    if let Err(e) = plan.refresh_node(child) {
        warn!(
            "Failed to relax permissions below '{}': {}",
            child.name(),
            e
        );
    }

    child
        .state()
        .parents
        .retain(|p| p.upgrade().is_some_and(|p| !Arc::ptr_eq(&p, edge)));
    plan.commit();
}

/// Every node of one topology, in registration order.
pub struct BlockGraph {
    nodes: Mutex<Vec<NodeRef>>,
    devices: Mutex<Vec<Arc<ChildEdge>>>,
    contexts: Mutex<HashMap<String, Arc<AioContext>>>,
    events: EventMonitor,
    relay: Arc<EventRelay>,
    vm_state_node: Mutex<Option<String>>,
}

impl Default for BlockGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockGraph {
    pub fn new() -> Self {
        Self::with_relay(Arc::new(EventRelay::new(ReplayMode::Record)))
    }

    pub fn with_relay(relay: Arc<EventRelay>) -> Self {
        BlockGraph {
            nodes: Mutex::new(Vec::new()),
            devices: Mutex::new(Vec::new()),
            contexts: Mutex::new(HashMap::new()),
            events: EventMonitor::new(),
            relay,
            vm_state_node: Mutex::new(None),
        }
    }

    pub fn events(&self) -> &EventMonitor {
        &self.events
    }

    pub fn relay(&self) -> &Arc<EventRelay> {
        &self.relay
    }

    pub fn context(&self, name: &str) -> Arc<AioContext> {
        Arc::clone(
            self.contexts
                .lock()
                .unwrap()
                .entry(name.to_string())
                .or_insert_with(|| AioContext::new(name)),
        )
    }

    pub fn set_vm_state_node(&self, name: Option<&str>) {
        *self.vm_state_node.lock().unwrap() = name.map(str::to_string);
    }

    pub fn vm_state_node(&self) -> Option<String> {
        self.vm_state_node.lock().unwrap().clone()
    }

    /// Opens a new node named `name` with `driver` and registers it.
    pub fn open_node(
        &self,
        name: &str,
        driver: Arc<dyn BlockDriver>,
        options: OpenOptions,
    ) -> Result<NodeRef> {
        if name.is_empty() {
            return Err(Error::InvalidArgument(
                "Node name must not be empty".to_string(),
            ));
        }
        if self.find_node(name).is_some() {
            return Err(Error::AlreadyExists(format!(
                "Duplicate nodes with node-name='{name}'"
            )));
        }

        let ctx = self.context(options.context.as_deref().unwrap_or(MAIN_CONTEXT));
        let node = Arc::new(Node::new(
            name,
            ctx,
            options.read_only,
            self.events.clone(),
        ));
        node.set_driver(Arc::clone(&driver), options.clone());

        if let Err(e) = driver.open(&node, &options) {
            node.detach_all_children();
            node.clear_driver();
            return Err(e);
        }

        match driver.load_persistent_dirty_bitmaps(&node) {
            Ok(bitmaps) => node.state().bitmaps.extend(bitmaps),
            Err(e) => {
                driver.close(&node);
                node.detach_all_children();
                node.clear_driver();
                return Err(e);
            }
        }

        info!("Opened node '{}' ({})", name, driver.format_name());
        self.events.emit(BlockEvent::NodeOpened {
            node: name.to_string(),
            driver: driver.format_name().to_string(),
        });
        self.nodes.lock().unwrap().push(Arc::clone(&node));

        Ok(node)
    }

    /// Closes an unused node, storing its persistent bitmaps first.
    pub fn close_node(&self, name: &str) -> Result<()> {
        let node = self.lookup(name)?;
        if let Some(edge) = node.parents().first() {
            return Err(Error::Busy(format!(
                "Node '{}' is in use by {}",
                name,
                edge.parent_name()
            )));
        }

        close(&node);

        self.nodes.lock().unwrap().retain(|n| !Arc::ptr_eq(n, &node));
        info!("Closed node '{name}'");
        self.events.emit(BlockEvent::NodeClosed {
            node: name.to_string(),
        });

        Ok(())
    }

    /// Closes every node, parents before their children.
    pub fn close_all(&self) {
        for edge in self.devices.lock().unwrap().drain(..) {
            detach_edge(&edge);
        }

        loop {
            let unused = self
                .nodes
                .lock()
                .unwrap()
                .iter()
                .find(|node| node.parents().is_empty())
                .map(|node| node.name().to_string());
            match unused {
                Some(name) => {
                    if let Err(e) = self.close_node(&name) {
                        warn!("Failed to close node '{name}': {e}");
                        break;
                    }
                }
                None => break,
            }
        }
    }

    pub fn find_node(&self, name: &str) -> Option<NodeRef> {
        self.nodes
            .lock()
            .unwrap()
            .iter()
            .find(|node| node.name() == name)
            .cloned()
    }

    pub fn lookup(&self, name: &str) -> Result<NodeRef> {
        self.find_node(name)
            .ok_or_else(|| Error::NotFound(format!("Cannot find device={name} nor node-name={name}")))
    }

    /// Every registered node, in registration order.
    pub fn nodes(&self) -> Vec<NodeRef> {
        self.nodes.lock().unwrap().clone()
    }

    /// The top-level nodes group operations visit, in registration order:
    /// every node no other node uses.
    pub fn cursor(&self) -> Vec<NodeRef> {
        self.nodes()
            .into_iter()
            .filter(|node| !node.has_node_parent())
            .collect()
    }

    /// Attaches a guest device `id` to `node` with explicit permissions.
    pub fn attach_device(
        &self,
        id: &str,
        node: &NodeRef,
        perm: Permissions,
        shared: Permissions,
    ) -> Result<Arc<ChildEdge>> {
        if self.devices.lock().unwrap().iter().any(|e| e.name == id) {
            return Err(Error::AlreadyExists(format!(
                "Device with id '{id}' already exists"
            )));
        }

        let edge = Arc::new(ChildEdge {
            name: id.to_string(),
            role: ChildRole::PRIMARY,
            parent: EdgeParent::Root(id.to_string()),
            child: Arc::clone(node),
            perms: Mutex::new((Permissions::empty(), Permissions::all())),
        });

        let mut plan = PermissionPlan::new(Some(Arc::clone(&edge)), None);
        plan.update_edge(&edge, perm, shared)?;

        node.state().parents.push(Arc::downgrade(&edge));
        self.devices.lock().unwrap().push(Arc::clone(&edge));
        plan.commit();

        debug!("Attached device '{}' to '{}'", id, node.name());

        Ok(edge)
    }

    pub fn detach_device(&self, id: &str) -> Result<()> {
        let edge = {
            let mut devices = self.devices.lock().unwrap();
            let index = devices
                .iter()
                .position(|e| e.name == id)
                .ok_or_else(|| Error::NotFound(format!("Device '{id}' not found")))?;
            devices.remove(index)
        };

        detach_edge(&edge);
        Ok(())
    }

    /// The node a device is attached to.
    pub fn device_node(&self, id: &str) -> Option<NodeRef> {
        self.devices
            .lock()
            .unwrap()
            .iter()
            .find(|e| e.name == id)
            .map(|e| Arc::clone(&e.child))
    }
}

fn close(node: &NodeRef) {
    let driver = node.driver();
    crate::dirty_bitmap::store_persistent(node);
    if let Some(driver) = driver {
        driver.close(node);
    }
    node.detach_all_children();
    node.clear_driver();
    node.state().bitmaps.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::copy_on_read::CopyOnRead;
    use crate::memory::MemoryImage;

    fn open_memory(graph: &BlockGraph, name: &str, read_only: bool) -> NodeRef {
        graph
            .open_node(
                name,
                Arc::new(MemoryImage::new(1 << 20)),
                OpenOptions {
                    read_only,
                    ..Default::default()
                },
            )
            .unwrap()
    }

    #[test]
    fn duplicate_and_empty_names() {
        let graph = BlockGraph::new();
        open_memory(&graph, "disk0", false);

        let e = graph
            .open_node("disk0", Arc::new(MemoryImage::new(512)), OpenOptions::default())
            .unwrap_err();
        assert_eq!(e.kind(), crate::ErrorKind::AlreadyExists);

        let e = graph
            .open_node("", Arc::new(MemoryImage::new(512)), OpenOptions::default())
            .unwrap_err();
        assert_eq!(e.kind(), crate::ErrorKind::InvalidArgument);
    }

    #[test]
    fn lookup_missing_node() {
        let graph = BlockGraph::new();
        let e = graph.lookup("nope").unwrap_err();
        assert_eq!(e.kind(), crate::ErrorKind::NotFound);
    }

    #[test]
    fn conflicting_devices_are_rejected() {
        let graph = BlockGraph::new();
        let node = open_memory(&graph, "disk0", false);

        graph
            .attach_device(
                "dev0",
                &node,
                Permissions::CONSISTENT_READ | Permissions::WRITE,
                Permissions::CONSISTENT_READ,
            )
            .unwrap();

        let e = graph
            .attach_device(
                "dev1",
                &node,
                Permissions::CONSISTENT_READ | Permissions::WRITE,
                Permissions::all(),
            )
            .unwrap_err();
        assert_eq!(e.kind(), crate::ErrorKind::PermissionConflict);
        assert!(e.to_string().contains("device 'dev0'"));
        assert_eq!(node.parents().len(), 1);
        assert!(graph.device_node("dev1").is_none());

        graph
            .attach_device(
                "dev1",
                &node,
                Permissions::CONSISTENT_READ,
                Permissions::all(),
            )
            .unwrap();
        assert_eq!(node.parents().len(), 2);
    }

    #[test]
    fn writer_on_read_only_node_is_rejected() {
        let graph = BlockGraph::new();
        let node = open_memory(&graph, "base", true);

        let e = graph
            .attach_device("dev0", &node, Permissions::WRITE, Permissions::all())
            .unwrap_err();
        assert_eq!(e.kind(), crate::ErrorKind::ReadOnly);
        assert!(node.parents().is_empty());
    }

    #[test]
    fn filter_forwards_device_permissions() {
        let graph = BlockGraph::new();
        let base = open_memory(&graph, "base", false);
        let filter = graph
            .open_node(
                "cor",
                Arc::new(CopyOnRead),
                OpenOptions {
                    file: Some(Arc::clone(&base)),
                    ..Default::default()
                },
            )
            .unwrap();

        let edge = filter.edge_to(&base).unwrap();
        assert_eq!(edge.perm(), Permissions::WRITE_UNCHANGED);

        graph
            .attach_device(
                "dev0",
                &filter,
                Permissions::CONSISTENT_READ | Permissions::WRITE,
                Permissions::CONSISTENT_READ | Permissions::WRITE_UNCHANGED,
            )
            .unwrap();
        assert_eq!(
            edge.perm(),
            Permissions::CONSISTENT_READ | Permissions::WRITE | Permissions::WRITE_UNCHANGED
        );

        filter.set_inactive(true).unwrap();
        assert!(!edge.perm().contains(Permissions::WRITE_UNCHANGED));
        filter.set_inactive(false).unwrap();
        assert!(edge.perm().contains(Permissions::WRITE_UNCHANGED));

        graph.detach_device("dev0").unwrap();
        assert_eq!(edge.perm(), Permissions::WRITE_UNCHANGED);
    }

    #[test]
    fn cursor_skips_used_nodes() {
        let graph = BlockGraph::new();
        let base = open_memory(&graph, "base", false);
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
        open_memory(&graph, "other", false);

        let names: Vec<String> = graph
            .cursor()
            .iter()
            .map(|n| n.name().to_string())
            .collect();
        assert_eq!(names, ["cor", "other"]);
    }

    #[test]
    fn cursor_skips_used_read_only_nodes() {
        let graph = BlockGraph::new();
        let base = open_memory(&graph, "base", true);
        let ro = open_memory(&graph, "ro", true);
        graph
            .open_node(
                "top",
                Arc::new(MemoryImage::new(1 << 20)),
                OpenOptions {
                    backing: Some(base),
                    ..Default::default()
                },
            )
            .unwrap();
        graph
            .attach_device("dev0", &ro, Permissions::CONSISTENT_READ, Permissions::all())
            .unwrap();

        let names: Vec<String> = graph
            .cursor()
            .iter()
            .map(|n| n.name().to_string())
            .collect();
        assert_eq!(names, ["ro", "top"]);
    }

    #[test]
    fn cycles_are_rejected() {
        let graph = BlockGraph::new();
        let base = open_memory(&graph, "base", false);
        let filter = graph
            .open_node(
                "cor",
                Arc::new(CopyOnRead),
                OpenOptions {
                    file: Some(Arc::clone(&base)),
                    ..Default::default()
                },
            )
            .unwrap();

        let e = base
            .attach_child(&filter, "loop", ChildRole::DATA)
            .unwrap_err();
        assert_eq!(e.kind(), crate::ErrorKind::InvalidArgument);
    }

    #[test]
    fn close_in_use_node_is_busy() {
        let graph = BlockGraph::new();
        let base = open_memory(&graph, "base", false);
        graph
            .open_node(
                "cor",
                Arc::new(CopyOnRead),
                OpenOptions {
                    file: Some(Arc::clone(&base)),
                    ..Default::default()
                },
            )
            .unwrap();

        let e = graph.close_node("base").unwrap_err();
        assert_eq!(e.kind(), crate::ErrorKind::Busy);

        graph.close_node("cor").unwrap();
        assert!(base.parents().is_empty());
        graph.close_node("base").unwrap();
        assert!(graph.nodes().is_empty());
    }
}
